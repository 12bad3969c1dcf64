//! Console log format for the node.
//!
//! `[timestamp] [component] [LEVEL] message`. The component comes from a
//! `component` field (see the `component_*!` macros) or, failing that, from
//! the crate that emitted the event.

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

const COMPONENT_WIDTH: usize = 16;
const LEVEL_WIDTH: usize = 9;

/// Log a message tagged with a component
#[macro_export]
macro_rules! component_info {
    ($component:expr, $($arg:tt)*) => {
        tracing::info!(component = $component, $($arg)*)
    };
}

/// Warn, tagged with a component
#[macro_export]
macro_rules! component_warn {
    ($component:expr, $($arg:tt)*) => {
        tracing::warn!(component = $component, $($arg)*)
    };
}

/// Debug, tagged with a component
#[macro_export]
macro_rules! component_debug {
    ($component:expr, $($arg:tt)*) => {
        tracing::debug!(component = $component, $($arg)*)
    };
}

/// Error, tagged with a component
#[macro_export]
macro_rules! component_error {
    ($component:expr, $($arg:tt)*) => {
        tracing::error!(component = $component, $($arg)*)
    };
}

/// Event formatter for the node's console output
pub struct LinkLogFormatter {
    service_name: String,
    color_enabled: bool,
}

impl LinkLogFormatter {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            color_enabled: color_supported(),
        }
    }

    fn component_label(&self, component: Option<&str>, target: &str) -> String {
        let name = match component {
            Some(component) => format!("link-{}", component),
            None => match target.split("::").next() {
                Some("link_engine") => "link-engine".to_string(),
                Some("link_wire") => "link-wire".to_string(),
                _ => self.service_name.clone(),
            },
        };

        if name.chars().count() > COMPONENT_WIDTH {
            let cut: String = name.chars().take(COMPONENT_WIDTH - 1).collect();
            format!("{}…", cut)
        } else {
            format!("{:<width$}", name, width = COMPONENT_WIDTH)
        }
    }

    fn level_label(level: &Level) -> String {
        let label = match *level {
            Level::ERROR => "✗ ERROR",
            Level::WARN => "⚠ WARN",
            Level::INFO => "ℹ INFO",
            Level::DEBUG => "◦ DEBUG",
            Level::TRACE => "◦ TRACE",
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

impl<S, N> FormatEvent<S, N> for LinkLogFormatter
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

        let mut fields = FieldVisitor::default();
        event.record(&mut fields);

        let component = self.component_label(fields.component.as_deref(), metadata.target());
        let (cyan, reset) = if self.color_enabled {
            (COLOR_CYAN, COLOR_RESET)
        } else {
            ("", "")
        };

        write!(
            writer,
            "{}[{}] [{}] [{}{}{}] {}",
            cyan,
            timestamp,
            component,
            self.level_color(level),
            Self::level_label(level),
            reset,
            fields.message
        )?;
        for (name, value) in &fields.extra {
            write!(writer, " {}={}", name, value)?;
        }
        writeln!(writer)
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: String,
    component: Option<String>,
    extra: Vec<(&'static str, String)>,
}

impl tracing::field::Visit for FieldVisitor {
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        match field.name() {
            "message" => self.message = value.to_string(),
            "component" => self.component = Some(value.to_string()),
            name => self.extra.push((name, value.to_string())),
        }
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
        let rendered = format!("{:?}", value);
        let unquoted = rendered
            .strip_prefix('"')
            .and_then(|s| s.strip_suffix('"'))
            .map(str::to_string);
        match field.name() {
            // format_args! messages arrive here unquoted
            "message" => self.message = unquoted.unwrap_or(rendered),
            "component" => self.component = Some(unquoted.unwrap_or(rendered)),
            name => self.extra.push((name, rendered)),
        }
    }
}

fn color_supported() -> bool {
    std::env::var("TERM").map(|t| t != "dumb").unwrap_or(false) && std::io::stdout().is_terminal()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_component_label() {
        let formatter = LinkLogFormatter {
            service_name: "lora-link".to_string(),
            color_enabled: false,
        };
        assert_eq!(
            formatter.component_label(Some("radio"), "lora_link").trim_end(),
            "link-radio"
        );
        assert_eq!(
            formatter.component_label(None, "link_engine::actors").trim_end(),
            "link-engine"
        );
        assert_eq!(
            formatter.component_label(None, "lora_link").trim_end(),
            "lora-link"
        );
        let long = formatter.component_label(Some("a-very-long-component"), "x");
        assert_eq!(long.chars().count(), COMPONENT_WIDTH);
        assert!(long.ends_with('…'));
    }

    #[test]
    fn test_level_label_width() {
        assert_eq!(LinkLogFormatter::level_label(&Level::WARN).chars().count(), LEVEL_WIDTH);
        assert!(LinkLogFormatter::level_label(&Level::ERROR).starts_with("✗ ERROR"));
    }
}
