//! Logging from certwatchd.

use std::fmt;

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::Layer as FmtLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::reload::Handle;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Registry};

use crate::config::{Config, LogLevel};

//----------- Logger -----------------------------------------------------------

/// The state of the certwatchd logger.
pub struct Logger {
    filter: Handle<EnvFilter, Registry>,
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger")
            .field("filter", &self.filter)
            .finish()
    }
}

impl Logger {
    /// Launch the certwatchd logger.
    ///
    /// ## Panics
    ///
    /// Panics if a global [`tracing`] logger has been set already.
    pub fn launch(config: &Config) -> Result<&'static Logger, String> {
        let filter = make_env_filter(config);

        // A reload layer is tracing's way of making it possible to change
        // values at runtime. It gives us a handle we can use to update the
        // EnvFilter when the config changes.
        let (filter, filter_handle) = reload::Layer::new(filter);

        match &config.log_file {
            Some(path) => {
                let file = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path.as_std_path())
                    .map_err(|err| format!("could not open log file {path}: {err}"))?;

                // We never emit colors to files.
                let layer = FmtLayer::new().with_ansi(false).with_writer(file);
                tracing_subscriber::registry()
                    .with(filter)
                    .with(layer)
                    .init()
            }
            None => {
                // We try to determine whether to use colors in a bit more
                // fancy way than tracing does automatically (it only does
                // `NO_COLOR`).
                let layer = FmtLayer::new()
                    .with_ansi(supports_color::on(supports_color::Stream::Stdout).is_some())
                    .with_writer(std::io::stdout);
                tracing_subscriber::registry()
                    .with(filter)
                    .with(layer)
                    .init()
            }
        };

        Ok(Box::leak(Box::new(Self {
            filter: filter_handle,
        })))
    }

    /// Apply a (possibly hot-reloaded) configuration to the logger.
    pub fn apply(&self, config: &Config) -> Result<(), String> {
        self.filter
            .reload(make_env_filter(config))
            .map_err(|_| "could not reload filter".into())
    }
}

/// Make a new [`EnvFilter`] based on the config.
///
/// Every time we load the config, we have to create a new [`EnvFilter`]
/// based on the new config settings.
fn make_env_filter(config: &Config) -> EnvFilter {
    // Create an EnvFilter which won't read any env vars, with the configured
    // level as its sole directive.
    EnvFilter::default().add_directive(LevelFilter::from(config.log_level).into())
}

impl From<LogLevel> for LevelFilter {
    fn from(value: LogLevel) -> Self {
        match value {
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warning => LevelFilter::WARN,
            // tracing has no level above ERROR, so CRITICAL maps onto it.
            LogLevel::Error | LogLevel::Critical => LevelFilter::ERROR,
        }
    }
}
