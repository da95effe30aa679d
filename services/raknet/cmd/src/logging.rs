//! Console log formatting.
//!
//! Lines look like `[timestamp] [component] [level] message key=value`. The
//! component column comes from an explicit `component` field when present,
//! otherwise from the module path of the event.

use std::fmt;
use std::io::IsTerminal;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::{format::Writer, FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

const COLOR_RESET: &str = "\x1b[0m";
const COLOR_CYAN: &str = "\x1b[36m";
const COLOR_GREEN: &str = "\x1b[32m";
const COLOR_BRIGHT_YELLOW: &str = "\x1b[93m";
const COLOR_BRIGHT_RED: &str = "\x1b[91m";
const COLOR_BRIGHT_GRAY: &str = "\x1b[90m";

const COMPONENT_WIDTH: usize = 18;
const LEVEL_WIDTH: usize = 7;

/// Log a message tagged with a component name at info level
#[macro_export]
macro_rules! component_info {
    ($component:expr, $($arg:tt)*) => {
        tracing::info!(component = $component, $($arg)*)
    };
}

/// Log a message tagged with a component name at warn level
#[macro_export]
macro_rules! component_warn {
    ($component:expr, $($arg:tt)*) => {
        tracing::warn!(component = $component, $($arg)*)
    };
}

/// Log a message tagged with a component name at debug level
#[macro_export]
macro_rules! component_debug {
    ($component:expr, $($arg:tt)*) => {
        tracing::debug!(component = $component, $($arg)*)
    };
}

/// Formatter for the node's console output
pub struct RakLogFormatter {
    service_name: String,
    color_enabled: bool,
}

impl RakLogFormatter {
    /// Formatter labelling untagged events with `service_name`
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            color_enabled: std::io::stdout().is_terminal(),
        }
    }

    /// Fixed-width component column
    fn component_column(&self, component: Option<&str>, target: &str) -> String {
        let name = match component {
            Some(component) => format!("raknet-{}", component),
            None => component_from_target(target).unwrap_or_else(|| self.service_name.clone()),
        };
        if name.chars().count() > COMPONENT_WIDTH {
            let cut: String = name.chars().take(COMPONENT_WIDTH - 1).collect();
            format!("{}…", cut)
        } else {
            format!("{:<width$}", name, width = COMPONENT_WIDTH)
        }
    }

    fn level_column(level: &Level) -> String {
        let label = match *level {
            Level::ERROR => "ERROR",
            Level::WARN => "WARN",
            Level::INFO => "INFO",
            Level::DEBUG => "DEBUG",
            Level::TRACE => "TRACE",
        };
        format!("{:<width$}", label, width = LEVEL_WIDTH)
    }

    fn level_color(&self, level: &Level) -> &'static str {
        if !self.color_enabled {
            return "";
        }
        match *level {
            Level::ERROR => COLOR_BRIGHT_RED,
            Level::WARN => COLOR_BRIGHT_YELLOW,
            Level::INFO => COLOR_GREEN,
            Level::DEBUG | Level::TRACE => COLOR_BRIGHT_GRAY,
        }
    }
}

/// `raknet_session::manager` becomes `raknet-manager`
fn component_from_target(target: &str) -> Option<String> {
    let mut parts = target.split("::");
    let krate = parts.next()?;
    if !krate.starts_with("raknet") {
        return None;
    }
    let Some(name) = parts.last() else {
        return Some(krate.replace('_', "-"));
    };
    let name = name.strip_prefix("raknet_").unwrap_or(name);
    Some(format!("raknet-{}", name.replace('_', "-")))
}

impl<S, N> FormatEvent<S, N> for RakLogFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let metadata = event.metadata();
        let level = metadata.level();

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        let component = self.component_column(visitor.component.as_deref(), metadata.target());
        let color = self.level_color(level);
        let (reset, cyan) = if self.color_enabled {
            (COLOR_RESET, COLOR_CYAN)
        } else {
            ("", "")
        };

        write!(
            writer,
            "{}[{}]{} [{}] [{}{}{}] {}",
            cyan,
            timestamp,
            reset,
            component,
            color,
            Self::level_column(level),
            reset,
            visitor.message
        )?;
        for (name, value) in &visitor.fields {
            write!(writer, " {}={}", name, value)?;
        }
        writeln!(writer)
    }
}

/// Pulls the message, the component tag and any extra fields out of an event
#[derive(Default)]
struct FieldVisitor {
    message: String,
    component: Option<String>,
    fields: Vec<(&'static str, String)>,
}

impl tracing::field::Visit for FieldVisitor {
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        match field.name() {
            "message" => self.message = value.to_string(),
            "component" => self.component = Some(value.to_string()),
            name => self.fields.push((name, value.to_string())),
        }
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
        match field.name() {
            "message" => self.message = format!("{:?}", value),
            "component" => {
                self.component = Some(format!("{:?}", value).trim_matches('"').to_string())
            }
            name => self.fields.push((name, format!("{:?}", value))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_component_from_target() {
        assert_eq!(
            component_from_target("raknet_session::manager").as_deref(),
            Some("raknet-manager")
        );
        assert_eq!(
            component_from_target("raknet_session::receive_window").as_deref(),
            Some("raknet-receive-window")
        );
        assert_eq!(component_from_target("raknet").as_deref(), Some("raknet"));
        assert_eq!(component_from_target("tokio::net"), None);
    }

    #[test]
    fn test_component_column_width() {
        let formatter = RakLogFormatter {
            service_name: "raknet".into(),
            color_enabled: false,
        };
        let column = formatter.component_column(Some("server"), "raknet");
        assert_eq!(column.len(), COMPONENT_WIDTH);
        assert!(column.starts_with("raknet-server"));

        let long = formatter.component_column(None, "raknet_session::a_very_long_module_name");
        assert_eq!(long.chars().count(), COMPONENT_WIDTH);
        assert!(long.ends_with('…'));

        let fallback = formatter.component_column(None, "hyper::client");
        assert!(fallback.starts_with("raknet "));
    }

    #[test]
    fn test_level_column() {
        assert_eq!(RakLogFormatter::level_column(&Level::WARN), "WARN   ");
        assert_eq!(RakLogFormatter::level_column(&Level::ERROR).len(), LEVEL_WIDTH);
    }
}
