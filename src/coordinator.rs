use crate::cache::{CacheEntry, PreviewCache, PreviewImage, PreviewKey};
use crate::decoder::{Decoder, DEFAULT_TARGET_LONG_EDGE};
use crate::error::{PreviewError, Result, WallpaperPickerError};
use crate::limiter::DecodeLimiter;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const MIN_DECODE_THREADS: usize = 2;
const RUNTIME_WORKER_THREADS: usize = 2;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PreviewConfig {
    pub max_cache_bytes: usize,
    pub max_concurrent_decodes: usize,
    pub sweep_interval: Duration,
    pub max_entry_age: Duration,
    pub target_long_edge: u32,
    pub load_timeout: Duration,
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            max_cache_bytes: 200 * 1024 * 1024,
            max_concurrent_decodes: 3,
            sweep_interval: Duration::from_secs(5 * 60),
            max_entry_age: Duration::from_secs(30 * 60),
            target_long_edge: DEFAULT_TARGET_LONG_EDGE,
            load_timeout: Duration::from_secs(30),
        }
    }
}

impl PreviewConfig {
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(WallpaperPickerError::InvalidConfig(msg.to_owned()));

        if self.max_cache_bytes == 0 {
            return invalid("cache budget must be greater than zero");
        }
        if self.max_concurrent_decodes == 0 {
            return invalid("at least one concurrent decode is required");
        }
        if self.target_long_edge == 0 {
            return invalid("target long edge must be greater than zero");
        }
        if self.sweep_interval.is_zero() || self.max_entry_age.is_zero() {
            return invalid("sweep interval and entry age must be non-zero");
        }
        if self.load_timeout.is_zero() {
            return invalid("load timeout must be non-zero");
        }
        Ok(())
    }
}

/// What the presentation side should show.
#[derive(Clone, Debug, PartialEq)]
pub enum PreviewUpdate {
    Loading,
    Image(Arc<PreviewImage>),
    Placeholder,
    Failed(String),
}

/// Receives preview updates. Implementations hand them to whichever thread
/// owns presentation and must not block.
pub trait PreviewSink: Send + Sync {
    fn deliver(&self, update: PreviewUpdate);
}

impl PreviewSink for mpsc::UnboundedSender<PreviewUpdate> {
    fn deliver(&self, update: PreviewUpdate) {
        // A closed receiver means the host is gone; nothing left to show
        let _ = self.send(update);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PreviewState {
    Idle,
    Loading,
    Delivered,
    Cancelled,
    Failed,
}

struct ActiveRequest {
    key: Option<PreviewKey>,
    generation: u64,
    cancel: CancellationToken,
    state: PreviewState,
}

type LoadResult = std::result::Result<Arc<PreviewImage>, PreviewError>;
type SharedLoad = Shared<BoxFuture<'static, LoadResult>>;

struct Inner {
    config: PreviewConfig,
    cache: Arc<PreviewCache>,
    limiter: DecodeLimiter,
    decoder: Arc<dyn Decoder>,
    sink: Arc<dyn PreviewSink>,
    pool: rayon::ThreadPool,
    active: Mutex<ActiveRequest>,
    in_flight: Mutex<HashMap<PreviewKey, SharedLoad>>,
    shutdown: CancellationToken,
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown cause"
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Turns selections into preview updates.
///
/// `select` and `clear` never block on decoding: cache hits are answered
/// inline, misses are coalesced per key and decoded on a bounded pool. A
/// result is delivered only if its generation is still the active one when
/// it completes; stale results are cached but never shown.
pub struct PreviewCoordinator {
    inner: Arc<Inner>,
    runtime: tokio::runtime::Runtime,
    stopped: AtomicBool,
}

impl PreviewCoordinator {
    pub fn new(
        config: PreviewConfig,
        decoder: Arc<dyn Decoder>,
        sink: Arc<dyn PreviewSink>,
    ) -> Result<Self> {
        config.validate()?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(RUNTIME_WORKER_THREADS)
            .thread_name("preview-runtime")
            .enable_time()
            .build()
            .map_err(WallpaperPickerError::RuntimeCreation)?;

        // Decoding is CPU-bound, keep it off the async workers
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_cpus::get().max(MIN_DECODE_THREADS))
            .thread_name(|index| format!("preview-decode-{}", index))
            .build()?;

        let inner = Arc::new(Inner {
            cache: Arc::new(PreviewCache::new(config.max_cache_bytes)),
            limiter: DecodeLimiter::new(config.max_concurrent_decodes),
            decoder,
            sink,
            pool,
            active: Mutex::new(ActiveRequest {
                key: None,
                generation: 0,
                cancel: CancellationToken::new(),
                state: PreviewState::Idle,
            }),
            in_flight: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            config,
        });

        runtime.spawn(Inner::run_sweeper(Arc::clone(&inner)));

        Ok(Self {
            inner,
            runtime,
            stopped: AtomicBool::new(false),
        })
    }

    /// Creates a coordinator that reports through an unbounded channel.
    pub fn with_channel(
        config: PreviewConfig,
        decoder: Arc<dyn Decoder>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<PreviewUpdate>)> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let coordinator = Self::new(config, decoder, Arc::new(sender))?;
        Ok((coordinator, receiver))
    }

    pub fn config(&self) -> &PreviewConfig {
        &self.inner.config
    }

    pub fn cache(&self) -> &PreviewCache {
        &self.inner.cache
    }

    pub fn state(&self) -> PreviewState {
        lock(&self.inner.active).state
    }

    pub fn current_key(&self) -> Option<PreviewKey> {
        lock(&self.inner.active).key.clone()
    }

    pub fn generation(&self) -> u64 {
        lock(&self.inner.active).generation
    }

    pub fn is_shut_down(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Makes `key` the previewed item. Reselecting the current key does nothing.
    pub fn select(&self, key: PreviewKey) {
        if self.is_shut_down() {
            debug!("Ignoring selection of {} after shutdown", key);
            return;
        }

        let (generation, cancel) = {
            let mut active = lock(&self.inner.active);
            if active.key.as_ref() == Some(&key) {
                return;
            }

            active.cancel.cancel();
            active.generation += 1;
            active.cancel = self.inner.shutdown.child_token();
            active.key = Some(key.clone());
            active.state = PreviewState::Loading;
            self.inner.sink.deliver(PreviewUpdate::Loading);

            if let Some(entry) = self.inner.cache.get(&key) {
                debug!("Preview cache hit for {}", key);
                active.state = PreviewState::Delivered;
                self.inner.sink.deliver(PreviewUpdate::Image(entry.image));
                return;
            }

            (active.generation, active.cancel.clone())
        };

        let load = match self.load(&key) {
            Ok(load) => load,
            Err(entry) => {
                // Populated between the two lookups
                self.inner.finish(generation, Ok(entry.image));
                return;
            }
        };

        let inner = Arc::clone(&self.inner);
        self.runtime.spawn(async move {
            let timeout = inner.config.load_timeout;
            let outcome = tokio::select! {
                _ = cancel.cancelled() => return,
                outcome = tokio::time::timeout(timeout, load) => outcome,
            };

            match outcome {
                Ok(result) => inner.finish(generation, result),
                Err(_) => inner.finish(generation, Err(PreviewError::TimedOut)),
            }
        });
    }

    /// Starts loading `key` into the cache without changing the selection.
    pub fn preload(&self, key: PreviewKey) {
        if self.is_shut_down() || self.inner.cache.contains(&key) {
            return;
        }
        // The spawned load runs to completion whether or not anyone awaits it
        let _ = self.load(&key);
    }

    /// Returns to the placeholder and abandons whatever was loading.
    pub fn clear(&self) {
        let mut active = lock(&self.inner.active);
        active.cancel.cancel();
        active.generation += 1;
        active.cancel = self.inner.shutdown.child_token();
        active.key = None;
        active.state = PreviewState::Idle;
        self.inner.sink.deliver(PreviewUpdate::Placeholder);
    }

    /// Stops the sweeper, cancels all loads and releases cached images.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        info!("Shutting down preview coordinator");
        self.inner.shutdown.cancel();
        self.inner.limiter.close();

        {
            let mut active = lock(&self.inner.active);
            active.generation += 1;
            if active.state == PreviewState::Loading {
                active.state = PreviewState::Cancelled;
            }
        }

        lock(&self.inner.in_flight).clear();
        self.inner.cache.clear();
    }

    // Joins the in-flight load for `key` or spawns one. A cache hit found
    // under the in-flight lock is returned as `Err`.
    fn load(&self, key: &PreviewKey) -> std::result::Result<SharedLoad, CacheEntry> {
        let mut in_flight = lock(&self.inner.in_flight);

        if let Some(existing) = in_flight.get(key) {
            debug!("Joining in-flight load for {}", key);
            return Ok(existing.clone());
        }
        if let Some(entry) = self.inner.cache.get(key) {
            return Err(entry);
        }

        let handle = self
            .runtime
            .spawn(Inner::run_load(Arc::clone(&self.inner), key.clone()));
        let shared = async move {
            match handle.await {
                Ok(result) => result,
                Err(_) => Err(PreviewError::Cancelled),
            }
        }
        .boxed()
        .shared();

        in_flight.insert(key.clone(), shared.clone());
        Ok(shared)
    }
}

impl Inner {
    async fn run_load(inner: Arc<Inner>, key: PreviewKey) -> LoadResult {
        let result = inner.decode(&key).await;

        // Cache and retire under the in-flight lock so a concurrent lookup
        // sees either the pending load or the cached image
        let mut in_flight = lock(&inner.in_flight);
        if let Ok(image) = &result {
            if !inner.shutdown.is_cancelled() {
                inner.cache.put(key.clone(), Arc::clone(image));
            }
        }
        in_flight.remove(&key);
        result
    }

    async fn decode(&self, key: &PreviewKey) -> LoadResult {
        let permit = self.limiter.acquire(&self.shutdown).await?;

        let (sender, receiver) = oneshot::channel();
        let decoder = Arc::clone(&self.decoder);
        let path = key.path().to_path_buf();
        let target = self.config.target_long_edge;
        let cancel = self.shutdown.clone();

        self.pool.spawn(move || {
            // A codec panic must surface as a failed load, not abort the pool
            let result = panic::catch_unwind(AssertUnwindSafe(|| decoder.load_preview(&path, target, &cancel)))
                .unwrap_or_else(|payload| {
                    Err(PreviewError::CorruptData {
                        reason: format!("decoder panicked: {}", panic_message(payload.as_ref())),
                        path,
                    })
                });
            let _ = sender.send(result);
        });

        let result = match receiver.await {
            Ok(result) => result,
            Err(_) => Err(PreviewError::Cancelled),
        };
        permit.release();

        result.map(Arc::new)
    }

    fn finish(&self, generation: u64, result: LoadResult) {
        let mut active = lock(&self.active);
        if active.generation != generation {
            debug!("Discarding stale preview result for generation {}", generation);
            return;
        }

        match result {
            Ok(image) => {
                active.state = PreviewState::Delivered;
                self.sink.deliver(PreviewUpdate::Image(image));
            }
            Err(err) if err.is_cancelled() => {
                active.state = PreviewState::Cancelled;
            }
            Err(err) => {
                let key = active
                    .key
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_default();
                warn!("Failed to load preview for {}: {}", key, err);
                active.state = PreviewState::Failed;
                self.sink.deliver(PreviewUpdate::Failed(err.to_string()));
            }
        }
    }

    async fn run_sweeper(inner: Arc<Inner>) {
        let period = inner.config.sweep_interval;
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        loop {
            tokio::select! {
                _ = inner.shutdown.cancelled() => break,
                _ = interval.tick() => {
                    let removed = inner.cache.sweep(inner.config.max_entry_age);
                    if removed > 0 {
                        info!("Expired {} cached previews", removed);
                    }
                }
            }
        }
    }
}

impl Drop for PreviewCoordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}
