use std::fmt;
use std::io::IsTerminal;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::{format::Writer, FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

const RESET: &str = "\x1b[0m";
const DIM: &str = "\x1b[2m";
const RED: &str = "\x1b[31m";
const YELLOW: &str = "\x1b[33m";
const GREEN: &str = "\x1b[32m";
const BLUE: &str = "\x1b[34m";

/// Column widths
const COMPONENT_WIDTH: usize = 16;
const LEVEL_WIDTH: usize = 5;

/// Line formatter: `time [component] [level] message key=value...`
pub struct MeshLogFormatter {
    service_name: String,
    color_enabled: bool,
}

/// Log with a `component` field that the formatter shows in the component column
#[macro_export]
macro_rules! component_info {
    ($component:expr, $($arg:tt)*) => {
        tracing::info!(component = $component, $($arg)*)
    };
}

#[macro_export]
macro_rules! component_warn {
    ($component:expr, $($arg:tt)*) => {
        tracing::warn!(component = $component, $($arg)*)
    };
}

#[macro_export]
macro_rules! component_debug {
    ($component:expr, $($arg:tt)*) => {
        tracing::debug!(component = $component, $($arg)*)
    };
}

impl MeshLogFormatter {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            color_enabled: std::io::stderr().is_terminal() && std::env::var("NO_COLOR").is_err(),
        }
    }

    fn format_component(&self, component: Option<&str>) -> String {
        let name = match component {
            Some(comp) => format!("{}/{}", self.service_name, comp),
            None => self.service_name.clone(),
        };

        if name.chars().count() > COMPONENT_WIDTH {
            let truncated: String = name.chars().take(COMPONENT_WIDTH - 1).collect();
            format!("{}…", truncated)
        } else {
            format!("{:<width$}", name, width = COMPONENT_WIDTH)
        }
    }

    fn format_log_level(level: &Level) -> String {
        format!("{:<width$}", level.as_str(), width = LEVEL_WIDTH)
    }

    fn color_for_level(&self, level: &Level) -> &'static str {
        match (self.color_enabled, *level) {
            (false, _) => "",
            (true, Level::ERROR) => RED,
            (true, Level::WARN) => YELLOW,
            (true, Level::INFO) => GREEN,
            (true, Level::DEBUG) => BLUE,
            (true, Level::TRACE) => DIM,
        }
    }
}

impl<S, N> FormatEvent<S, N> for MeshLogFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(&self, _ctx: &FmtContext<'_, S, N>, mut writer: Writer<'_>, event: &Event<'_>) -> fmt::Result {
        let timestamp = chrono::Local::now().format("%H:%M:%S%.3f");
        let level = event.metadata().level();
        let mut fields = FieldVisitor::default();
        event.record(&mut fields);

        let color = self.color_for_level(level);
        let (dim, reset) = if self.color_enabled { (DIM, RESET) } else { ("", "") };

        write!(
            writer,
            "{}{}{} [{}] [{}{}{}] {}",
            dim,
            timestamp,
            reset,
            self.format_component(fields.component.as_deref()),
            color,
            Self::format_log_level(level),
            reset,
            fields.message
        )?;
        for (name, value) in &fields.extra {
            write!(writer, " {}={}", name, value)?;
        }
        writeln!(writer, "{}", reset)
    }
}

/// Pulls `message`, `component` and any extra fields out of an event
#[derive(Default)]
struct FieldVisitor {
    message: String,
    component: Option<String>,
    extra: Vec<(&'static str, String)>,
}

impl Visit for FieldVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            "message" => self.message = value.to_string(),
            "component" => self.component = Some(value.to_string()),
            name => self.extra.push((name, value.to_string())),
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        let rendered = format!("{:?}", value);
        let unquoted = rendered
            .strip_prefix('"')
            .and_then(|s| s.strip_suffix('"'))
            .map(str::to_string)
            .unwrap_or(rendered);
        self.record_str(field, &unquoted);
    }
}
