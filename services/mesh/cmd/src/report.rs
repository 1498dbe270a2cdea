//! Run report rendering.

use crate::sim::Outcome;
use anyhow::Result;
use clap::ValueEnum;
use mesh_wire::{MessageType, PeerId};
use std::collections::HashMap;
use std::fmt::Write;

/// Report output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ReportFormat {
    /// Human-readable summary
    Text,
    /// Pretty-printed JSON
    Json,
}

/// Render `outcome` in the requested format
pub fn render(outcome: &Outcome, format: ReportFormat) -> Result<String> {
    match format {
        ReportFormat::Json => Ok(serde_json::to_string_pretty(outcome)?),
        ReportFormat::Text => Ok(render_text(outcome)),
    }
}

fn type_name(message_type: u8) -> String {
    match MessageType::try_from(message_type) {
        Ok(known) => format!("{:?}", known).to_lowercase(),
        Err(raw) => format!("0x{:02x}", raw),
    }
}

fn render_text(outcome: &Outcome) -> String {
    let names: HashMap<PeerId, &str> = outcome
        .nodes
        .iter()
        .map(|node| (node.status.local_id, node.nickname.as_str()))
        .collect();
    let name_of = |id: &PeerId| names.get(id).copied().unwrap_or("?").to_string();

    let mut out = String::new();
    let _ = writeln!(
        out,
        "Mesh run: {} nodes, {} sends, {} deliveries",
        outcome.nodes.len(),
        outcome.sends.len(),
        outcome.deliveries.len()
    );

    let _ = writeln!(out, "\nSends");
    for send in &outcome.sends {
        let target = send.to.as_deref().unwrap_or("everyone");
        match (&send.report, &send.error) {
            (Some(report), _) => {
                let _ = writeln!(
                    out,
                    "  {:<8} -> {:<8} {:>6} bytes  {} frame(s) on {} link(s)",
                    send.from, target, send.bytes, report.frames, report.links
                );
            }
            (None, error) => {
                let _ = writeln!(
                    out,
                    "  {:<8} -> {:<8} {:>6} bytes  FAILED: {}",
                    send.from,
                    target,
                    send.bytes,
                    error.as_deref().unwrap_or("unknown error")
                );
            }
        }
    }

    let _ = writeln!(out, "\nDeliveries");
    for delivery in &outcome.deliveries {
        let message = &delivery.message;
        let _ = writeln!(
            out,
            "  {:<8} <- {:<8} {:>6} bytes  ttl {}  {}{}",
            delivery.node,
            name_of(&message.sender),
            message.payload.len(),
            message.ttl_remaining,
            type_name(message.message_type),
            if message.recipient.is_some() { "  (direct)" } else { "" }
        );
    }

    let _ = writeln!(out, "\nNodes");
    for node in &outcome.nodes {
        let status = &node.status;
        let peers: Vec<String> = status
            .peers
            .iter()
            .map(|peer| {
                let left = if peer.departed { " (left)" } else { "" };
                format!("{}={}{}", name_of(&peer.id), peer.state, left)
            })
            .collect();
        let stats = &status.stats;
        let _ = writeln!(out, "  {} ({})", node.nickname, status.local_id);
        let _ = writeln!(out, "    peers: {}", peers.join(", "));
        let _ = writeln!(
            out,
            "    dedup {}  fragments {}  rx {}  tx {}  delivered {}  relayed {}  duplicates {}  malformed {}",
            status.dedup_entries,
            status.pending_fragments,
            stats.frames_received,
            stats.frames_sent,
            stats.delivered,
            stats.relayed,
            stats.duplicates,
            stats.malformed
        );
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{Delivery, NodeOutcome, SendRecord};
    use bytes::Bytes;
    use mesh_session::{DeliveredMessage, EngineStats, MeshStatus, SendReport};

    fn outcome() -> Outcome {
        let alice = PeerId::from_u64(1);
        let bob = PeerId::from_u64(2);
        let status = |local_id| MeshStatus {
            local_id,
            running: true,
            peers: Vec::new(),
            dedup_entries: 3,
            pending_fragments: 0,
            stats: EngineStats::default(),
        };
        Outcome {
            sends: vec![
                SendRecord {
                    from: "alice".to_string(),
                    to: None,
                    bytes: 5,
                    report: Some(SendReport { frames: 1, links: 1 }),
                    error: None,
                },
                SendRecord {
                    from: "alice".to_string(),
                    to: Some("zed".to_string()),
                    bytes: 2,
                    report: None,
                    error: Some("peer not found: 0000000000000009".to_string()),
                },
            ],
            deliveries: vec![Delivery {
                node: "bob".to_string(),
                message: DeliveredMessage {
                    sender: alice,
                    recipient: None,
                    message_type: 0x04,
                    payload: Bytes::from_static(b"hello"),
                    ttl_remaining: 7,
                },
            }],
            nodes: vec![
                NodeOutcome {
                    nickname: "alice".to_string(),
                    status: status(alice),
                },
                NodeOutcome {
                    nickname: "bob".to_string(),
                    status: status(bob),
                },
            ],
        }
    }

    #[test]
    fn test_text_report() {
        let text = render(&outcome(), ReportFormat::Text).unwrap();
        assert!(text.starts_with("Mesh run: 2 nodes, 2 sends, 1 deliveries"));
        assert!(text.contains("1 frame(s) on 1 link(s)"));
        assert!(text.contains("FAILED: peer not found"));
        assert!(text.contains("bob      <- alice"));
        assert!(text.contains("ttl 7  message"));
    }

    #[test]
    fn test_json_report() {
        let json = render(&outcome(), ReportFormat::Json).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["deliveries"][0]["message"]["payload"], "hello");
        assert_eq!(value["deliveries"][0]["message"]["sender"], "0000000000000001");
        assert_eq!(value["nodes"][1]["status"]["dedup_entries"], 3);
    }

    #[test]
    fn test_type_names() {
        assert_eq!(type_name(0x01), "announce");
        assert_eq!(type_name(0x05), "fragmentstart");
        assert_eq!(type_name(0x42), "0x42");
    }
}
