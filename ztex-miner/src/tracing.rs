//! Logging setup for the miner.
//!
//! `main` calls [`init_journald_or_stdout`] once to install a subscriber.
//! Everything else uses `crate::tracing::prelude::*` for the `debug!()`,
//! `info!()`, `warn!()` and `error!()` macros.
//!
//! Group threads never log through these macros directly for device
//! events; they append to the device's [`DeviceLog`] and the supervisor
//! re-emits those lines here with a `device` field.
//!
//! [`DeviceLog`]: crate::device::DeviceLog

use std::env;
use time::OffsetDateTime;
use tracing_subscriber::{
    filter::{EnvFilter, LevelFilter},
    fmt::{format::Writer, time::FormatTime},
    prelude::*,
};

pub mod prelude {
    #[allow(unused_imports)]
    pub use tracing::{debug, error, info, trace, warn};
}

use prelude::*;

const CRATE_PREFIX: &str = "ztex_miner::";

/// Field carrying the device name on lines re-emitted from device logs.
const DEVICE_FIELD: &str = "device";

/// Initialize logging.
///
/// If running under systemd, use journald; otherwise fall
/// back to stdout. `RUST_LOG` filters both (default INFO), so
/// `RUST_LOG=ztex_miner=debug` shows per-device work and nonce messages.
pub fn init_journald_or_stdout() {
    if env::var("JOURNAL_STREAM").is_ok() {
        if let Ok(layer) = tracing_journald::layer() {
            tracing_subscriber::registry()
                .with(env_filter())
                .with(layer.with_syslog_identifier("ztex-miner".into()))
                .init();
        } else {
            use_stdout();
            error!("Failed to initialize journald logging, using stdout.");
        }
    } else {
        use_stdout();
    }
}

fn env_filter() -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .with_env_var("RUST_LOG")
        .from_env_lossy()
}

fn use_stdout() {
    tracing_subscriber::registry()
        .with(env_filter())
        .with(
            tracing_subscriber::fmt::layer()
                .with_timer(LocalTimer)
                .with_target(true)
                .fmt_fields(tracing_subscriber::fmt::format::DefaultFields::new())
                .event_format(CustomFormatter),
        )
        .init();
}

/// Module path shown in front of a message: our own paths without the crate
/// prefix, `log` records under their original target, dependencies as-is.
fn short_target(target: &str, fields: &[(String, String)]) -> String {
    if let Some(stripped) = target.strip_prefix(CRATE_PREFIX) {
        stripped.to_string()
    } else if target == "log" {
        fields
            .iter()
            .find(|(k, _)| k == "log.target")
            .map(|(_, v)| v.trim_matches('"').to_string())
            .unwrap_or_else(|| target.to_string())
    } else {
        target.to_string()
    }
}

/// Custom event formatter that strips crate prefix, colors the target,
/// and displays fields on a second line for readability.
struct CustomFormatter;

/// Visitor that collects fields into a string buffer.
struct FieldCollector {
    fields: Vec<(String, String)>,
    message: Option<String>,
}

impl FieldCollector {
    fn new() -> Self {
        Self {
            fields: Vec::new(),
            message: None,
        }
    }
}

impl tracing::field::Visit for FieldCollector {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = Some(format!("{:?}", value));
        } else {
            let formatted = format!("{:?}", value);
            // Clean up Option formatting: Some("foo") -> foo, None -> None
            let cleaned = if let Some(inner) = formatted.strip_prefix("Some(") {
                inner.strip_suffix(')').unwrap_or(inner).to_string()
            } else {
                formatted
            };
            self.fields.push((field.name().to_string(), cleaned));
        }
    }
}

impl<S, N> tracing_subscriber::fmt::FormatEvent<S, N> for CustomFormatter
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    N: for<'a> tracing_subscriber::fmt::FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &tracing_subscriber::fmt::FmtContext<'_, S, N>,
        mut writer: tracing_subscriber::fmt::format::Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        // Collect fields first so we can extract log.target if present
        let mut visitor = FieldCollector::new();
        event.record(&mut visitor);

        // Write timestamp (no dimming)
        let timestamp = LocalTimer;
        timestamp.format_time(&mut writer)?;
        write!(writer, " ")?;

        // Write level with foreground color
        let level = *event.metadata().level();
        let (level_color, level_text) = match level {
            tracing::Level::ERROR => ("\x1b[31m", "ERROR"), // Red
            tracing::Level::WARN => ("\x1b[33m", "WARN "),  // Yellow
            tracing::Level::INFO => ("\x1b[32m", "INFO "),  // Green
            tracing::Level::DEBUG => ("\x1b[34m", "DEBUG"), // Blue
            tracing::Level::TRACE => ("\x1b[35m", "TRACE"), // Magenta
        };
        write!(writer, "{}{}\x1b[0m ", level_color, level_text)?;

        let short_target = short_target(event.metadata().target(), &visitor.fields);
        write!(writer, "{}: ", short_target)?;

        // Device lines read like the device is speaking
        if let Some((_, device)) = visitor.fields.iter().find(|(k, _)| k == DEVICE_FIELD) {
            write!(writer, "{}: ", device.trim_matches('"'))?;
        }

        // Write message (normal brightness)
        if let Some(ref msg) = visitor.message {
            // Strip quotes that Debug formatting adds to strings
            let clean_msg = msg.trim_matches('"');
            write!(writer, "{}", clean_msg)?;
        }

        // If there are structured fields, write them on a second line
        // Filter out log.* fields since they're compatibility layer metadata
        let display_fields: Vec<_> = visitor
            .fields
            .iter()
            .filter(|(k, _)| !k.starts_with("log.") && k != DEVICE_FIELD)
            .collect();

        if !display_fields.is_empty() {
            writeln!(writer)?;
            // Indent to align with module column
            // Timestamp (8 chars) + space + level (5 chars) + space = 15
            write!(writer, "\x1b[90m               ")?; // 15 spaces, bright black (dark gray)
            for (i, (key, value)) in display_fields.iter().enumerate() {
                if i > 0 {
                    write!(writer, ", ")?;
                }
                // Strip quotes from string values
                let clean_value = value.trim_matches('"');
                write!(writer, "{}={}", key, clean_value)?;
            }
            write!(writer, "\x1b[0m")?;
        }

        writeln!(writer)
    }
}

// Provide our own timer that formats timestamps in local time and to the
// nearest second. The default timer was in UTC and formatted timestamps as an
// long, ugly string.
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
        let formatted = now
            .format(time::macros::format_description!(
                "[hour]:[minute]:[second]"
            ))
            .map_err(|_| std::fmt::Error)?;
        write!(w, "{}", formatted)
    }
}
