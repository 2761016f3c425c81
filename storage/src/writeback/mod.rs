//! Drain due dirty ranges of a [ProxyCache] into the remote store.
//!
//! A [Poller] runs one polling thread that claims due write-backs and hands each to a bounded
//! pool of worker threads calling the [Remote]. The poller only claims more work while a worker
//! is free, and sleeps for the poll interval whenever nothing is due (or after a write-back
//! failed, so a failing remote is retried once per interval).

use crate::{proxy::ProxyCache, Error};
use commonware_utils::hex;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::{
    io,
    num::NonZeroUsize,
    sync::{Arc, Condvar, Mutex},
    thread::{self, JoinHandle},
    time::Duration,
};
use tracing::{debug, error, warn};

/// Default pause between polls when nothing is due.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// The remote store dirty data is written back to.
pub trait Remote: Send + Sync + 'static {
    /// Write `data` at `offset` of the remote file `handle`, returning the bytes written.
    fn write(&self, handle: &[u8], offset: u64, data: &[u8]) -> io::Result<u64>;
}

impl<F> Remote for F
where
    F: Fn(&[u8], u64, &[u8]) -> io::Result<u64> + Send + Sync + 'static,
{
    fn write(&self, handle: &[u8], offset: u64, data: &[u8]) -> io::Result<u64> {
        self(handle, offset, data)
    }
}

/// Configuration for [Poller].
#[derive(Clone, Debug)]
pub struct Config {
    /// Pause between polls when nothing is due.
    pub poll_interval: Duration,

    /// Number of write-backs in flight at once.
    pub workers: NonZeroUsize,
}

#[derive(Default)]
struct State {
    stopped: bool,
    inflight: usize,
    failed: bool,
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    changed: Condvar,
}

impl Shared {
    /// Sleep for up to `timeout`, returning whether the poller was stopped.
    fn idle(&self, timeout: Duration) -> bool {
        let state = self.state.lock().unwrap();
        if state.stopped {
            return true;
        }
        let (state, _) = self.changed.wait_timeout(state, timeout).unwrap();
        state.stopped
    }
}

/// Background write-back of a [ProxyCache].
pub struct Poller {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl Poller {
    /// Start polling `cache` and writing due ranges to `remote`.
    pub fn start(
        cache: Arc<ProxyCache>,
        remote: Arc<dyn Remote>,
        cfg: Config,
    ) -> Result<Self, Error> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(cfg.workers.get())
            .thread_name(|i| format!("writeback-{i}"))
            .build()?;
        let shared = Arc::new(Shared::default());
        let thread = thread::Builder::new()
            .name("writeback-poller".into())
            .spawn({
                let shared = shared.clone();
                move || run(cache, remote, pool, shared, cfg)
            })?;
        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    /// Stop polling and wait for in-flight write-backs to complete.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        self.shared.state.lock().unwrap().stopped = true;
        self.shared.changed.notify_all();
        if thread.join().is_err() {
            error!("write-back poller panicked");
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(
    cache: Arc<ProxyCache>,
    remote: Arc<dyn Remote>,
    pool: ThreadPool,
    shared: Arc<Shared>,
    cfg: Config,
) {
    let workers = cfg.workers.get();
    'poll: loop {
        let backoff = {
            let mut state = shared.state.lock().unwrap();
            while !state.stopped && state.inflight >= workers {
                state = shared.changed.wait(state).unwrap();
            }
            if state.stopped {
                break 'poll;
            }
            std::mem::take(&mut state.failed)
        };
        if backoff && shared.idle(cfg.poll_interval) {
            break;
        }

        let write_back = match cache.poll_writeback(None) {
            Ok(Some(write_back)) => write_back,
            Ok(None) => {
                if shared.idle(cfg.poll_interval) {
                    break;
                }
                continue;
            }
            Err(err) => {
                warn!(?err, "failed to poll write-back");
                if shared.idle(cfg.poll_interval) {
                    break;
                }
                continue;
            }
        };

        shared.state.lock().unwrap().inflight += 1;
        let cache = cache.clone();
        let remote = remote.clone();
        let shared = shared.clone();
        pool.spawn(move || {
            let written = match remote.write(
                write_back.handle(),
                write_back.offset(),
                write_back.data(),
            ) {
                Ok(written) => written,
                Err(err) => {
                    warn!(
                        handle = %hex(write_back.handle()),
                        offset = write_back.offset(),
                        ?err,
                        "remote write failed"
                    );
                    0
                }
            };
            let failed = cache.mark_writeback_done(write_back, written).is_err();

            let mut state = shared.state.lock().unwrap();
            state.inflight -= 1;
            state.failed |= failed;
            shared.changed.notify_all();
        });
    }

    let mut state = shared.state.lock().unwrap();
    while state.inflight > 0 {
        state = shared.changed.wait(state).unwrap();
    }
    debug!("write-back poller stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        proxy::{self, DEFAULT_CAPACITY, MAX_EXTENT_SIZE},
        testing::Scratch,
    };
    use commonware_macros::test_traced;
    use prometheus_client::registry::Registry;
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Instant,
    };

    const INTERVAL: Duration = Duration::from_millis(10);

    fn cache(scratch: &Scratch) -> Arc<ProxyCache> {
        let cfg = proxy::Config {
            cache_directory: scratch.cache_directory(),
            meta_directory: scratch.meta_directory(),
            capacity: DEFAULT_CAPACITY,
            alignment: 0,
            writeback_delay: Duration::ZERO,
            max_extent_size: MAX_EXTENT_SIZE,
        };
        Arc::new(ProxyCache::init(cfg, &mut Registry::default()).unwrap())
    }

    fn config(workers: usize) -> Config {
        Config {
            poll_interval: INTERVAL,
            workers: NonZeroUsize::new(workers).unwrap(),
        }
    }

    fn wait_until(condition: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !condition() {
            assert!(Instant::now() < deadline, "timed out");
            thread::sleep(INTERVAL);
        }
    }

    #[derive(Default)]
    struct Recorder {
        writes: Mutex<Vec<(Vec<u8>, u64, Vec<u8>)>>,
    }

    impl Remote for Recorder {
        fn write(&self, handle: &[u8], offset: u64, data: &[u8]) -> io::Result<u64> {
            self.writes
                .lock()
                .unwrap()
                .push((handle.to_vec(), offset, data.to_vec()));
            Ok(data.len() as u64)
        }
    }

    #[test_traced]
    fn test_writes_back_due_data() {
        let scratch = Scratch::new();
        let cache = cache(&scratch);
        let recorder = Arc::new(Recorder::default());
        let poller = Poller::start(cache.clone(), recorder.clone(), config(4)).unwrap();

        for file in 0..16u8 {
            cache.write(&[file], 100, &[file; 1000]).unwrap();
        }
        cache.insert(b"later", 0, &[1; 10], Some(3600)).unwrap();
        wait_until(|| (0..16u8).all(|file| !cache.is_file_dirty(&[file])));
        poller.stop();

        let mut writes = recorder.writes.lock().unwrap().clone();
        writes.sort();
        assert_eq!(writes.len(), 16);
        for (file, (handle, offset, data)) in writes.into_iter().enumerate() {
            assert_eq!(handle, vec![file as u8]);
            assert_eq!(offset, 100);
            assert_eq!(data, vec![file as u8; 1000]);
        }
        assert!(cache.is_file_dirty(b"later"));
    }

    #[test_traced("WARN")]
    fn test_retries_failed_writes() {
        let scratch = Scratch::new();
        let cache = cache(&scratch);
        let attempts = Arc::new(AtomicUsize::new(0));
        let remote = {
            let attempts = attempts.clone();
            move |_: &[u8], _: u64, data: &[u8]| -> io::Result<u64> {
                match attempts.fetch_add(1, Ordering::SeqCst) {
                    0 => Err(io::Error::other("unreachable")),
                    1 => Ok(data.len() as u64 / 2),
                    _ => Ok(data.len() as u64),
                }
            }
        };
        let poller = Poller::start(cache.clone(), Arc::new(remote), config(1)).unwrap();

        cache.write(b"file", 0, &[1; 100]).unwrap();
        wait_until(|| !cache.is_file_dirty(b"file"));
        poller.stop();
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[test_traced]
    fn test_stop_when_idle() {
        let scratch = Scratch::new();
        let cache = cache(&scratch);
        let poller = Poller::start(cache, Arc::new(Recorder::default()), config(2)).unwrap();
        thread::sleep(3 * INTERVAL);
        drop(poller);
    }
}
