//! Phase image cache
//!
//! Bakes one provisioning phase on top of a base image and remembers the
//! result under a tag derived from `(base image, phase, script hash)`.
//! Builds for the same key are single-flight: the first caller starts a
//! build in the background and every concurrent caller waits on that same
//! build, sharing its tag or its failure. A failed build is not fatal; the
//! caller gets the base image back and runs the phase at startup instead.
//!
//! A caller may stop waiting at any time. The build keeps going while
//! anyone else still waits on it and is abandoned, container removed, once
//! the last waiter leaves.

use crate::container::{ContainerBackend, ContainerError, ContainerSpec, LABEL_ROLE};
use caravel_foundation::{content_hash, short_hash, CompositeKey};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default repository prefix for baked images
pub const DEFAULT_REPOSITORY: &str = "caravel-phase";

/// Hex characters of the composite digest used in tags
const TAG_HASH_LEN: usize = 24;

/// Cache key of one baked phase
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PhaseKey {
    pub base_image: String,
    pub phase: String,
    pub content_hash: String,
}

impl PhaseKey {
    pub fn new(base_image: &str, phase: &str, script: &str) -> Self {
        Self {
            base_image: base_image.to_string(),
            phase: phase.to_string(),
            content_hash: content_hash(script),
        }
    }

    /// Deterministic image tag for this key
    pub fn tag(&self, repository: &str) -> String {
        let digest = CompositeKey::with_capacity(3)
            .with(&self.base_image)
            .with(&self.phase)
            .with(&self.content_hash)
            .finalize();
        format!("{}-{}:{}", repository, self.phase, short_hash(&digest, TAG_HASH_LEN))
    }
}

/// Progress of one in-flight build
#[derive(Debug, Clone, PartialEq, Eq)]
enum FlightState {
    Pending,
    Ready(String),
    Failed,
}

/// One build round shared by every caller waiting on the same key
struct Flight {
    id: u64,
    waiters: usize,
    abort: CancellationToken,
    state: watch::Receiver<FlightState>,
}

enum Joined {
    Ready(String),
    Waiting(u64, watch::Receiver<FlightState>),
}

/// Shared cache of baked phase images
pub struct PhaseImageCache {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    backend: Arc<dyn ContainerBackend>,
    repository: String,
    known: RwLock<HashMap<PhaseKey, String>>,
    flights: Mutex<HashMap<PhaseKey, Flight>>,
    next_flight: AtomicU64,
    builds: AtomicU64,
}

impl PhaseImageCache {
    pub fn new(backend: Arc<dyn ContainerBackend>) -> Self {
        Self::with_repository(backend, DEFAULT_REPOSITORY)
    }

    pub fn with_repository(backend: Arc<dyn ContainerBackend>, repository: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                backend,
                repository: repository.into(),
                known: RwLock::new(HashMap::new()),
                flights: Mutex::new(HashMap::new()),
                next_flight: AtomicU64::new(0),
                builds: AtomicU64::new(0),
            }),
        }
    }

    /// Number of successful builds performed by this cache
    pub fn builds(&self) -> u64 {
        self.inner.builds.load(Ordering::Relaxed)
    }

    /// Number of keys with a known image
    pub fn len(&self) -> usize {
        self.inner.known.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.known.read().is_empty()
    }

    /// Number of builds currently running
    pub fn in_flight(&self) -> usize {
        self.inner.flights.lock().len()
    }

    /// Image with `script` applied on top of `base_image`
    ///
    /// Returns `base_image` unchanged when the build fails; the caller
    /// compares the result with its input to know whether the phase was
    /// baked.
    pub async fn ensure_phase_image(&self, base_image: &str, phase_name: &str, script: &str) -> String {
        self.ensure_phase_image_until(base_image, phase_name, script, &CancellationToken::new())
            .await
            .unwrap_or_else(|| base_image.to_string())
    }

    /// Like [`ensure_phase_image`](Self::ensure_phase_image), but gives up
    /// waiting as soon as `cancel` fires and returns `None`.
    pub async fn ensure_phase_image_until(
        &self,
        base_image: &str,
        phase_name: &str,
        script: &str,
        cancel: &CancellationToken,
    ) -> Option<String> {
        let key = PhaseKey::new(base_image, phase_name, script);

        let (flight_id, mut state) = match self.inner.join(&key, script) {
            Joined::Ready(tag) => return Some(tag),
            Joined::Waiting(id, state) => (id, state),
        };

        let settled = async {
            state
                .wait_for(|s| *s != FlightState::Pending)
                .await
                .map(|s| (*s).clone())
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.inner.leave(&key, flight_id);
                None
            }
            settled = settled => match settled {
                Ok(FlightState::Ready(tag)) => Some(tag),
                _ => Some(base_image.to_string()),
            },
        }
    }

    /// Forget every known image, forcing a lookup on next use
    pub fn clear(&self) {
        self.inner.known.write().clear();
    }
}

impl CacheInner {
    fn lookup(&self, key: &PhaseKey) -> Option<String> {
        self.known.read().get(key).cloned()
    }

    fn remember(&self, key: PhaseKey, tag: &str) {
        self.known.write().insert(key, tag.to_string());
    }

    /// Wait on the running build for `key`, starting one if there is none
    fn join(self: &Arc<Self>, key: &PhaseKey, script: &str) -> Joined {
        let mut flights = self.flights.lock();

        // Checked under the flights lock so a build finishing right now is seen.
        if let Some(tag) = self.lookup(key) {
            return Joined::Ready(tag);
        }

        if let Some(flight) = flights.get_mut(key) {
            flight.waiters += 1;
            return Joined::Waiting(flight.id, flight.state.clone());
        }

        let id = self.next_flight.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = watch::channel(FlightState::Pending);
        let abort = CancellationToken::new();
        flights.insert(
            key.clone(),
            Flight {
                id,
                waiters: 1,
                abort: abort.clone(),
                state: rx.clone(),
            },
        );

        tokio::spawn(self.clone().fly(key.clone(), id, script.to_string(), abort, tx));
        Joined::Waiting(id, rx)
    }

    /// A waiter stopped waiting; abandon the build when it was the last one
    fn leave(&self, key: &PhaseKey, flight_id: u64) {
        let mut flights = self.flights.lock();
        let Some(flight) = flights.get_mut(key).filter(|f| f.id == flight_id) else {
            return;
        };

        flight.waiters = flight.waiters.saturating_sub(1);
        if flight.waiters == 0 {
            debug!(phase = %key.phase, base = %key.base_image, "Abandoning phase image build");
            flight.abort.cancel();
            flights.remove(key);
        }
    }

    async fn fly(
        self: Arc<Self>,
        key: PhaseKey,
        flight_id: u64,
        script: String,
        abort: CancellationToken,
        tx: watch::Sender<FlightState>,
    ) {
        let state = self.resolve(&key, &script, &abort).await;
        if let FlightState::Ready(tag) = &state {
            self.remember(key.clone(), tag);
        }

        {
            let mut flights = self.flights.lock();
            if flights.get(&key).is_some_and(|f| f.id == flight_id) {
                flights.remove(&key);
            }
        }
        tx.send_replace(state);
    }

    async fn resolve(&self, key: &PhaseKey, script: &str, abort: &CancellationToken) -> FlightState {
        let tag = key.tag(&self.repository);
        match self.backend.image_exists(&tag).await {
            Ok(true) => {
                debug!(phase = %key.phase, image = %tag, "Reusing existing phase image");
                return FlightState::Ready(tag);
            }
            Ok(false) => {}
            Err(e) => debug!(image = %tag, error = %e, "Phase image lookup failed"),
        }

        match self.build(key, &tag, script, abort).await {
            Ok(()) => {
                self.builds.fetch_add(1, Ordering::Relaxed);
                info!(phase = %key.phase, base = %key.base_image, image = %tag, "Phase image built");
                FlightState::Ready(tag)
            }
            Err(_) if abort.is_cancelled() => {
                debug!(phase = %key.phase, image = %tag, "Phase image build abandoned");
                FlightState::Failed
            }
            Err(e) => {
                warn!(phase = %key.phase, base = %key.base_image, error = %e, "Phase image build failed");
                FlightState::Failed
            }
        }
    }

    async fn build(
        &self,
        key: &PhaseKey,
        tag: &str,
        script: &str,
        abort: &CancellationToken,
    ) -> Result<(), ContainerError> {
        let spec = ContainerSpec::new(&key.base_image)
            .with_command(vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()])
            .with_label(LABEL_ROLE, "phase-build")
            .with_label("caravel.phase", &key.phase);

        let id = self.backend.create_container(&spec).await?;
        let result = tokio::select! {
            biased;
            _ = abort.cancelled() => Err(ContainerError::Other("phase build abandoned".to_string())),
            result = self.run_and_commit(&id, &key.phase, tag) => result,
        };

        if let Err(e) = self.backend.remove_container(&id, true).await {
            debug!(container_id = %id, error = %e, "Failed to remove build container");
        }
        result
    }

    async fn run_and_commit(&self, id: &str, phase: &str, tag: &str) -> Result<(), ContainerError> {
        self.backend.start_container(id).await?;
        let code = self.backend.wait_container(id).await?;
        if code != 0 {
            return Err(ContainerError::Other(format!(
                "{} preflight exited with code {}",
                phase, code
            )));
        }
        self.backend.commit_container(id, tag).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::MemoryBackend;
    use std::time::Duration;

    #[test]
    fn test_tag_is_deterministic() {
        let a = PhaseKey::new("base:1", "system", "apt-get update");
        let b = PhaseKey::new("base:1", "system", "apt-get update");
        let c = PhaseKey::new("base:2", "system", "apt-get update");
        let d = PhaseKey::new("base:1", "system", "apt-get updatE");

        assert_eq!(a.tag("caravel-phase"), b.tag("caravel-phase"));
        assert_ne!(a.tag("caravel-phase"), c.tag("caravel-phase"));
        assert_ne!(a.tag("caravel-phase"), d.tag("caravel-phase"));
        assert!(a.tag("caravel-phase").starts_with("caravel-phase-system:"));
    }

    #[tokio::test]
    async fn test_build_once_then_hit() {
        let backend = Arc::new(MemoryBackend::new().with_image("base"));
        let cache = PhaseImageCache::new(backend.clone());

        let first = cache.ensure_phase_image("base", "system", "echo hi").await;
        let second = cache.ensure_phase_image("base", "system", "echo hi").await;

        assert_ne!(first, "base");
        assert_eq!(first, second);
        assert_eq!(cache.builds(), 1);
        assert_eq!(backend.commits().len(), 1);
        assert_eq!(backend.live_containers(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_build() {
        let backend = Arc::new(MemoryBackend::new().with_image("base"));
        let cache = Arc::new(PhaseImageCache::new(backend.clone()));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.ensure_phase_image("base", "settings", "cp a b").await })
            })
            .collect();

        let mut tags = Vec::new();
        for task in tasks {
            tags.push(task.await.unwrap());
        }

        tags.dedup();
        assert_eq!(tags.len(), 1);
        assert_eq!(backend.commits().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_build_returns_base() {
        let backend = Arc::new(MemoryBackend::new().with_image("base"));
        backend.fail_builds(true);
        let cache = PhaseImageCache::new(backend.clone());

        let image = cache.ensure_phase_image("base", "environment", "exit 1").await;

        assert_eq!(image, "base");
        assert!(cache.is_empty());
        assert!(backend.commits().is_empty());
        assert_eq!(backend.live_containers(), 0);
    }

    #[tokio::test]
    async fn test_existing_image_is_adopted_without_build() {
        let key = PhaseKey::new("base", "system", "true");
        let backend = Arc::new(
            MemoryBackend::new()
                .with_image("base")
                .with_image(key.tag(DEFAULT_REPOSITORY)),
        );
        let cache = PhaseImageCache::new(backend.clone());

        let image = cache.ensure_phase_image("base", "system", "true").await;

        assert_eq!(image, key.tag(DEFAULT_REPOSITORY));
        assert_eq!(cache.builds(), 0);
        assert!(backend.created().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_is_shared_by_concurrent_waiters() {
        let backend = Arc::new(MemoryBackend::new().with_image("base"));
        backend.fail_builds(true);
        backend.slow_builds(Duration::from_secs(5));
        let cache = Arc::new(PhaseImageCache::new(backend.clone()));

        let tasks: Vec<_> = (0..4)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.ensure_phase_image("base", "system", "exit 1").await })
            })
            .collect();

        for task in tasks {
            assert_eq!(task.await.unwrap(), "base");
        }
        assert_eq!(backend.created().len(), 1);
        assert_eq!(cache.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_waiter_leaving_abandons_build() {
        let backend = Arc::new(MemoryBackend::new().with_image("base"));
        backend.slow_builds(Duration::from_secs(3600));
        let cache = PhaseImageCache::new(backend.clone());
        let cancel = CancellationToken::new();

        let stopper = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                cancel.cancel();
            })
        };

        let started = tokio::time::Instant::now();
        let image = cache
            .ensure_phase_image_until("base", "system", "sleep 3600", &cancel)
            .await;
        stopper.await.unwrap();

        assert_eq!(image, None);
        assert!(started.elapsed() < Duration::from_secs(5));

        // Give the background build a chance to clean up.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(cache.in_flight(), 0);
        assert!(cache.is_empty());
        assert!(backend.commits().is_empty());
        assert_eq!(backend.live_containers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_build_survives_while_another_caller_waits() {
        let backend = Arc::new(MemoryBackend::new().with_image("base"));
        backend.slow_builds(Duration::from_secs(60));
        let cache = Arc::new(PhaseImageCache::new(backend.clone()));
        let cancel = CancellationToken::new();

        let patient = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.ensure_phase_image("base", "system", "make").await })
        };
        let impatient = {
            let cache = cache.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                cache
                    .ensure_phase_image_until("base", "system", "make", &cancel)
                    .await
            })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();

        assert_eq!(impatient.await.unwrap(), None);
        let tag = patient.await.unwrap();
        assert_ne!(tag, "base");
        assert_eq!(backend.commits().len(), 1);
        assert_eq!(cache.builds(), 1);
        assert_eq!(cache.in_flight(), 0);
    }
}
