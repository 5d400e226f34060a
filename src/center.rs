//! certwatchd's shared state.

use std::sync::Arc;

use arc_swap::ArcSwap;
use camino::Utf8PathBuf;

use crate::cache::Cache;
use crate::config::Config;
use crate::log::Logger;
use crate::metrics::MetricsCollection;

/// The application version reported by metrics and the HTTP surface.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

//----------- Center -----------------------------------------------------------

/// State shared by every unit.
///
/// The configuration snapshot is replaced wholesale by the hot-reload
/// coordinator; a unit pins one snapshot (`config.load_full()`) for the
/// duration of an operation and never observes a partial update.
#[derive(Debug)]
pub struct Center {
    /// The current configuration snapshot.
    pub config: ArcSwap<Config>,

    /// Where the configuration was loaded from, if anywhere.
    pub config_path: Option<Utf8PathBuf>,

    /// The certificate parse cache.
    pub cache: Arc<Cache>,

    /// The metric families.
    pub metrics: Arc<MetricsCollection>,

    /// The logger, when one has been launched.
    pub logger: Option<&'static Logger>,
}

impl Center {
    pub fn new(
        config: Config,
        config_path: Option<Utf8PathBuf>,
        logger: Option<&'static Logger>,
    ) -> Arc<Self> {
        let cache = Arc::new(Cache::new(&config));
        Arc::new(Self {
            config: ArcSwap::from_pointee(config),
            config_path,
            cache,
            metrics: Arc::new(MetricsCollection::new()),
            logger,
        })
    }
}
