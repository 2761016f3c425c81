//! One cache instance with its write-back, behind an init/destroy lifecycle.
//!
//! [Service::init] loads the cache and (given a [Remote]) starts writing back due data.
//! [Service::destroy] stops write-back, waiting for in-flight writes, then shuts the cache down,
//! which commits every cached file so the next [Service::init] finds it again.

use crate::{
    proxy::{self, ProxyCache},
    writeback::{self, Poller, Remote},
    Error,
};
use prometheus_client::registry::Registry;
use std::sync::Arc;
use tracing::info;

/// Configuration for [Service].
#[derive(Clone, Debug)]
pub struct Config {
    pub cache: proxy::Config,
    pub writeback: writeback::Config,
}

/// A running cache.
pub struct Service {
    cache: Arc<ProxyCache>,
    poller: Option<Poller>,
}

impl Service {
    /// Load the cache and, if `remote` is given, start writing back to it.
    ///
    /// Without a remote, dirty data is only written back through
    /// [ProxyCache::poll_writeback] and [ProxyCache::mark_writeback_done].
    pub fn init(
        cfg: Config,
        remote: Option<Arc<dyn Remote>>,
        registry: &mut Registry,
    ) -> Result<Self, Error> {
        let cache = Arc::new(ProxyCache::init(cfg.cache, registry)?);
        let poller = remote
            .map(|remote| Poller::start(cache.clone(), remote, cfg.writeback))
            .transpose()?;
        info!(
            files = cache.cached_files(),
            writeback = poller.is_some(),
            "cache initialized"
        );
        Ok(Self { cache, poller })
    }

    pub fn cache(&self) -> &Arc<ProxyCache> {
        &self.cache
    }

    /// Stop write-back and release the cache, keeping its content on disk.
    ///
    /// Clones of [Service::cache] keep the cache alive past this call.
    pub fn destroy(self) {
        let Self { cache, poller } = self;
        if let Some(poller) = poller {
            poller.stop();
        }
        drop(cache);
        info!("cache destroyed");
    }
}
