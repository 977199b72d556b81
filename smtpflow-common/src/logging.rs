use std::str::FromStr;

use tracing::{Level, metadata::LevelFilter};
use tracing_subscriber::{
    filter::FilterFn, fmt::time::ChronoUtc, prelude::__tracing_subscriber_SubscriberExt,
    util::SubscriberInitExt,
};

#[macro_export]
macro_rules! log {
    ($level:expr, $span:expr, $($msg:expr),*) => {{
        let span = $crate::tracing::span!($level, $span);
        let _enter = span.enter();

        $crate::tracing::event!($level, $($msg),*)
    }};
}

/// Traffic leaving the relay, e.g. a reply to an SMTP client
#[macro_export]
macro_rules! outgoing {
    (level = $level:ident, $($msg:expr),*) => {
        $crate::log!($crate::tracing::Level::$level, "outgoing", $($msg),*)
    };

    ($($msg:expr),*) => {
        $crate::outgoing!(level = TRACE, $($msg),*)
    };
}

/// Traffic arriving at the relay, e.g. a command from an SMTP client
#[macro_export]
macro_rules! incoming {
    (level = $level:ident, $($msg:expr),*) => {
        $crate::log!($crate::tracing::Level::$level, "incoming", $($msg),*)
    };

    ($($msg:expr),*) => {
        $crate::incoming!(level = TRACE, $($msg),*)
    };
}

#[macro_export]
macro_rules! internal {
    (level = $level:ident, $($msg:expr),*) => {
        $crate::log!($crate::tracing::Level::$level, "internal", $($msg),*)
    };

    ($($msg:expr),*) => {
        $crate::internal!(level = TRACE, $($msg),*)
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Compact,
    Json,
}

impl Format {
    fn from_env() -> Self {
        match std::env::var("LOG_FORMAT") {
            Ok(format) if format.eq_ignore_ascii_case("json") => Self::Json,
            _ => Self::Compact,
        }
    }
}

fn level_from_env() -> LevelFilter {
    let default = if cfg!(debug_assertions) {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };

    std::env::var("LOG_LEVEL").map_or(default, |level| {
        LevelFilter::from_str(level.as_str()).unwrap_or_else(|_| {
            eprintln!("Invalid log level specified {level}, defaulting to {default}");
            default
        })
    })
}

/// Everything from our own crates, and only warnings or worse from dependencies.
fn is_relevant(target: &str, level: Level) -> bool {
    target.starts_with("smtpflow") || level <= Level::WARN
}

/// Install the global subscriber.
///
/// `LOG_LEVEL` picks the maximum level and `LOG_FORMAT=json` switches to
/// structured output for log shippers.
pub fn init() {
    let registry = tracing_subscriber::Registry::default()
        .with(level_from_env())
        .with(FilterFn::new(|metadata| {
            is_relevant(metadata.target(), *metadata.level())
        }));

    let layer = tracing_subscriber::fmt::layer()
        .with_file(false)
        .with_line_number(false)
        .with_timer(ChronoUtc::rfc_3339());

    match Format::from_env() {
        Format::Json => registry.with(layer.json()).init(),
        Format::Compact => registry.with(layer.compact().with_ansi(true)).init(),
    }
}
