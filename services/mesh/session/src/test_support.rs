//! In-memory radio and sink used by unit tests.

use crate::events::{DeliveredMessage, MessageSink};
use crate::peer::PeerSnapshot;
use crate::radio::{RadioError, RadioTransport};
use bytes::Bytes;
use mesh_wire::PeerId;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

#[derive(Debug, Default)]
pub struct RecordingRadio {
    sent: Mutex<Vec<(PeerId, Bytes)>>,
    connects: Mutex<Vec<PeerId>>,
    disconnects: Mutex<Vec<PeerId>>,
    advertised: Mutex<Vec<String>>,
    scans: AtomicUsize,
    stops: AtomicUsize,
    fail_connects: AtomicBool,
}

impl RecordingRadio {
    pub fn sent_to(&self, peer: PeerId) -> Vec<Bytes> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(to, _)| *to == peer)
            .map(|(_, bytes)| bytes.clone())
            .collect()
    }

    pub fn clear_sent(&self) {
        self.sent.lock().unwrap().clear();
    }

    pub fn connects(&self) -> Vec<PeerId> {
        self.connects.lock().unwrap().clone()
    }

    pub fn disconnects(&self) -> Vec<PeerId> {
        self.disconnects.lock().unwrap().clone()
    }

    pub fn advertised(&self) -> Vec<String> {
        self.advertised.lock().unwrap().clone()
    }

    pub fn scan_starts(&self) -> usize {
        self.scans.load(Ordering::SeqCst)
    }

    pub fn stop_calls(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn fail_connects(&self) {
        self.fail_connects.store(true, Ordering::SeqCst);
    }
}

impl RadioTransport for RecordingRadio {
    fn send_bytes(&self, peer: PeerId, bytes: Bytes) -> Result<(), RadioError> {
        self.sent.lock().unwrap().push((peer, bytes));
        Ok(())
    }

    fn connect(&self, peer: PeerId) -> Result<(), RadioError> {
        if self.fail_connects.load(Ordering::SeqCst) {
            return Err(RadioError::Platform("powered off".into()));
        }
        self.connects.lock().unwrap().push(peer);
        Ok(())
    }

    fn disconnect(&self, peer: PeerId) -> Result<(), RadioError> {
        self.disconnects.lock().unwrap().push(peer);
        Ok(())
    }

    fn start_scanning(&self) -> Result<(), RadioError> {
        self.scans.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn start_advertising(&self, name: &str) -> Result<(), RadioError> {
        self.advertised.lock().unwrap().push(name.to_string());
        Ok(())
    }

    fn stop_all(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Default)]
pub struct RecordingSink {
    delivered: Mutex<Vec<DeliveredMessage>>,
    peer_changes: Mutex<Vec<PeerSnapshot>>,
}

impl RecordingSink {
    pub fn deliveries(&self) -> Vec<DeliveredMessage> {
        self.delivered.lock().unwrap().clone()
    }

    pub fn peer_changes(&self) -> Vec<PeerSnapshot> {
        self.peer_changes.lock().unwrap().clone()
    }
}

impl MessageSink for RecordingSink {
    fn delivered(&self, message: DeliveredMessage) {
        self.delivered.lock().unwrap().push(message);
    }

    fn peer_changed(&self, peer: &PeerSnapshot) {
        self.peer_changes.lock().unwrap().push(peer.clone());
    }
}
