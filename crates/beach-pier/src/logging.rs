use tracing_subscriber::EnvFilter;

/// Verbosity of the client's own log output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum LogLevel {
    #[default]
    Off,
    Errors,
    Warnings,
    All,
}

impl LogLevel {
    /// Maps the numeric `debug` option (0 = off .. 3 = everything).
    pub fn from_debug(level: u8) -> Self {
        match level {
            0 => LogLevel::Off,
            1 => LogLevel::Errors,
            2 => LogLevel::Warnings,
            _ => LogLevel::All,
        }
    }

    fn directive(&self) -> &'static str {
        match self {
            LogLevel::Off => "beach_pier=off",
            LogLevel::Errors => "beach_pier=error,pier=error",
            LogLevel::Warnings => "beach_pier=warn,pier=warn",
            LogLevel::All => "beach_pier=trace,pier=trace",
        }
    }
}

/// Installs a fmt subscriber for processes that do not bring their own.
/// Meant for binaries; pass `PeerOptions::log_level` to honour the option.
///
/// `RUST_LOG` wins over `level` when set. Returns `false` when a global
/// subscriber was already installed.
pub fn init(level: LogLevel) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.directive()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok()
}
