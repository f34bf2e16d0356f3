//! Zero-downtime hot swapping of running components.
//!
//! Each component key owns a slot holding the active component behind
//! a readers-writer lock plus an in-flight counter. Swaps prepare a
//! candidate off to the side, drain in-flight work, then cut over with
//! a single atomic assignment under the slot's swap lock, so readers
//! always see a fully-old or fully-new component.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::models::ComponentKey;

const MAX_HISTORY: usize = 256;
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum SwapError {
    #[error("no component installed for {0}")]
    UnknownComponent(ComponentKey),
    #[error("no prepared swap for {0}")]
    NoPreparedSwap(ComponentKey),
    #[error("health check failed for {0}")]
    HealthCheckFailed(ComponentKey),
}

/// Lifecycle of one swap attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapState {
    Pending,
    Preparing,
    Ready,
    Swapping,
    Completed,
    Failed,
    RolledBack,
    Cancelled,
}

impl SwapState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SwapState::Pending => "pending",
            SwapState::Preparing => "preparing",
            SwapState::Ready => "ready",
            SwapState::Swapping => "swapping",
            SwapState::Completed => "completed",
            SwapState::Failed => "failed",
            SwapState::RolledBack => "rolled_back",
            SwapState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SwapState::Completed | SwapState::Failed | SwapState::RolledBack | SwapState::Cancelled
        )
    }
}

/// Audit record for one swap attempt.
#[derive(Debug, Clone, Serialize)]
pub struct SwapRecord {
    pub swap_id: Uuid,
    pub key: ComponentKey,
    pub old_version: String,
    pub new_version: String,
    pub state: SwapState,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Set when the swap proceeded despite in-flight requests after
    /// the drain window was exhausted. A warning, not a failure.
    pub forced: bool,
    pub error: Option<String>,
}

/// Async health probe run against a candidate before and after
/// activation.
pub type HealthProbe<T> = Box<dyn Fn(Arc<T>) -> BoxFuture<'static, bool> + Send + Sync>;

struct ActiveComponent<T: ?Sized> {
    component: Arc<T>,
    version: String,
}

struct PendingSwap<T: ?Sized> {
    swap_id: Uuid,
    component: Arc<T>,
    version: String,
    probe: Option<HealthProbe<T>>,
}

struct Slot<T: ?Sized> {
    active: RwLock<ActiveComponent<T>>,
    in_flight: AtomicUsize,
    /// Serializes swap execution for this key.
    swap_lock: Mutex<()>,
    pending: Mutex<Option<PendingSwap<T>>>,
}

/// RAII handle to the active component. Holding the guard counts as
/// one in-flight use; the drain logic in [`HotSwapManager::execute_swap`]
/// observes the count, and dropping the guard (on every exit path)
/// releases it.
pub struct ComponentGuard<T: ?Sized> {
    component: Arc<T>,
    version: String,
    slot: Arc<Slot<T>>,
}

impl<T: ?Sized> ComponentGuard<T> {
    pub fn component(&self) -> &Arc<T> {
        &self.component
    }

    pub fn version(&self) -> &str {
        &self.version
    }
}

impl<T: ?Sized> std::ops::Deref for ComponentGuard<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.component
    }
}

impl<T: ?Sized> Drop for ComponentGuard<T> {
    fn drop(&mut self) {
        self.slot.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Swap counters for `statistics()`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SwapStats {
    pub installed: usize,
    pub total_swaps: usize,
    pub completed: usize,
    pub rolled_back: usize,
    pub forced: usize,
}

/// Manages the active component per key and mediates every change to
/// the active set. Generic over the component contract; the pipeline
/// instantiates one manager for extractors and one for knowledge bases.
pub struct HotSwapManager<T: ?Sized + Send + Sync + 'static> {
    slots: RwLock<HashMap<ComponentKey, Arc<Slot<T>>>>,
    history: RwLock<Vec<SwapRecord>>,
}

impl<T: ?Sized + Send + Sync + 'static> Default for HotSwapManager<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ?Sized + Send + Sync + 'static> HotSwapManager<T> {
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            history: RwLock::new(Vec::new()),
        }
    }

    /// Install (or replace outright) the active component for a key.
    /// Initial registration path; live replacement goes through
    /// `prepare_swap` + `execute_swap`.
    pub async fn install(&self, key: ComponentKey, component: Arc<T>, version: impl Into<String>) {
        let version = version.into();
        let mut slots = self.slots.write().await;
        match slots.get(&key) {
            Some(slot) => {
                let mut active = slot.active.write().await;
                active.component = component;
                active.version = version;
            }
            None => {
                slots.insert(
                    key,
                    Arc::new(Slot {
                        active: RwLock::new(ActiveComponent { component, version }),
                        in_flight: AtomicUsize::new(0),
                        swap_lock: Mutex::new(()),
                        pending: Mutex::new(None),
                    }),
                );
            }
        }
    }

    /// Remove a key's slot entirely. Outstanding guards stay valid;
    /// they hold their own reference to the component.
    pub async fn uninstall(&self, key: &ComponentKey) -> bool {
        self.slots.write().await.remove(key).is_some()
    }

    pub async fn is_installed(&self, key: &ComponentKey) -> bool {
        self.slots.read().await.contains_key(key)
    }

    async fn slot(&self, key: &ComponentKey) -> Result<Arc<Slot<T>>, SwapError> {
        self.slots
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| SwapError::UnknownComponent(key.clone()))
    }

    /// The only sanctioned read path to an active component.
    pub async fn use_component(&self, key: &ComponentKey) -> Result<ComponentGuard<T>, SwapError> {
        let slot = self.slot(key).await?;
        slot.in_flight.fetch_add(1, Ordering::AcqRel);
        let active = slot.active.read().await;
        let guard = ComponentGuard {
            component: active.component.clone(),
            version: active.version.clone(),
            slot: slot.clone(),
        };
        drop(active);
        Ok(guard)
    }

    pub async fn active_version(&self, key: &ComponentKey) -> Option<String> {
        let slot = self.slot(key).await.ok()?;
        let active = slot.active.read().await;
        Some(active.version.clone())
    }

    pub async fn in_flight(&self, key: &ComponentKey) -> usize {
        match self.slot(key).await {
            Ok(slot) => slot.in_flight.load(Ordering::Acquire),
            Err(_) => 0,
        }
    }

    async fn push_record(&self, record: SwapRecord) {
        let mut history = self.history.write().await;
        history.push(record);
        if history.len() > MAX_HISTORY {
            let excess = history.len() - MAX_HISTORY;
            history.drain(..excess);
        }
    }

    async fn update_record(&self, swap_id: Uuid, update: impl FnOnce(&mut SwapRecord)) {
        let mut history = self.history.write().await;
        if let Some(record) = history.iter_mut().find(|r| r.swap_id == swap_id) {
            update(record);
        }
    }

    async fn record_by_id(&self, swap_id: Uuid) -> Option<SwapRecord> {
        self.history
            .read()
            .await
            .iter()
            .find(|r| r.swap_id == swap_id)
            .cloned()
    }

    /// Stage a candidate for a key without activating it. Runs the
    /// optional health probe; a probe failure ends at FAILED with the
    /// active component untouched.
    pub async fn prepare_swap(
        &self,
        key: &ComponentKey,
        component: Arc<T>,
        version: impl Into<String>,
        probe: Option<HealthProbe<T>>,
    ) -> Result<SwapRecord, SwapError> {
        let version = version.into();
        let slot = self.slot(key).await?;
        let old_version = slot.active.read().await.version.clone();

        let swap_id = Uuid::new_v4();
        self.push_record(SwapRecord {
            swap_id,
            key: key.clone(),
            old_version,
            new_version: version.clone(),
            state: SwapState::Pending,
            started_at: Utc::now(),
            finished_at: None,
            forced: false,
            error: None,
        })
        .await;
        self.update_record(swap_id, |r| r.state = SwapState::Preparing)
            .await;

        if let Some(probe) = &probe {
            if !probe(component.clone()).await {
                self.update_record(swap_id, |r| {
                    r.state = SwapState::Failed;
                    r.finished_at = Some(Utc::now());
                    r.error = Some("health probe failed during prepare".to_string());
                })
                .await;
                warn!("Swap candidate {} v{} failed its health probe", key, version);
                return Err(SwapError::HealthCheckFailed(key.clone()));
            }
        }

        *slot.pending.lock().await = Some(PendingSwap {
            swap_id,
            component,
            version: version.clone(),
            probe,
        });
        self.update_record(swap_id, |r| r.state = SwapState::Ready).await;
        info!("Swap for {} prepared: -> v{}", key, version);
        Ok(self.record_by_id(swap_id).await.expect("record just pushed"))
    }

    /// Discard a prepared candidate.
    pub async fn cancel_swap(&self, key: &ComponentKey) -> Result<SwapRecord, SwapError> {
        let slot = self.slot(key).await?;
        let pending = slot
            .pending
            .lock()
            .await
            .take()
            .ok_or_else(|| SwapError::NoPreparedSwap(key.clone()))?;
        self.update_record(pending.swap_id, |r| {
            r.state = SwapState::Cancelled;
            r.finished_at = Some(Utc::now());
        })
        .await;
        info!("Swap for {} cancelled", key);
        Ok(self
            .record_by_id(pending.swap_id)
            .await
            .expect("record exists"))
    }

    /// Execute a prepared swap: wait `grace`, drain in-flight work up
    /// to `max_wait`, then cut over. The cut-over itself is a single
    /// assignment under the slot's swap lock. If the activation probe
    /// rejects the new component, the previous one is restored and the
    /// swap ends ROLLED_BACK.
    pub async fn execute_swap(
        &self,
        key: &ComponentKey,
        grace: Duration,
        max_wait: Duration,
    ) -> Result<SwapRecord, SwapError> {
        let slot = self.slot(key).await?;
        let _swap_serial = slot.swap_lock.lock().await;

        let pending = slot
            .pending
            .lock()
            .await
            .take()
            .ok_or_else(|| SwapError::NoPreparedSwap(key.clone()))?;
        let swap_id = pending.swap_id;
        self.update_record(swap_id, |r| r.state = SwapState::Swapping).await;

        tokio::time::sleep(grace).await;

        let drain_start = tokio::time::Instant::now();
        while slot.in_flight.load(Ordering::Acquire) > 0 && drain_start.elapsed() < max_wait {
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }
        let remaining = slot.in_flight.load(Ordering::Acquire);
        let forced = remaining > 0;
        if forced {
            warn!(
                "Swap for {} proceeding with {} requests still in flight after {:?}",
                key, remaining, max_wait
            );
        }

        // Atomic cut-over: readers see fully-old or fully-new.
        let old = {
            let mut active = slot.active.write().await;
            std::mem::replace(
                &mut *active,
                ActiveComponent {
                    component: pending.component.clone(),
                    version: pending.version.clone(),
                },
            )
        };

        // Activation check. A candidate that passed prepare but cannot
        // serve once active is rolled back.
        if let Some(probe) = &pending.probe {
            if !probe(pending.component.clone()).await {
                let mut active = slot.active.write().await;
                *active = old;
                drop(active);
                self.update_record(swap_id, |r| {
                    r.state = SwapState::RolledBack;
                    r.finished_at = Some(Utc::now());
                    r.error = Some("activation probe failed, previous component restored".to_string());
                })
                .await;
                error!("Swap for {} rolled back: activation probe failed", key);
                return Ok(self.record_by_id(swap_id).await.expect("record exists"));
            }
        }

        self.update_record(swap_id, |r| {
            r.state = SwapState::Completed;
            r.finished_at = Some(Utc::now());
            r.forced = forced;
        })
        .await;
        info!(
            "Swap for {} completed: v{} active{}",
            key,
            pending.version,
            if forced { " (forced)" } else { "" }
        );
        Ok(self.record_by_id(swap_id).await.expect("record exists"))
    }

    /// Swap history, most recent last. `key` filters to one component.
    pub async fn history(&self, key: Option<&ComponentKey>) -> Vec<SwapRecord> {
        let history = self.history.read().await;
        match key {
            Some(key) => history.iter().filter(|r| &r.key == key).cloned().collect(),
            None => history.clone(),
        }
    }

    pub async fn stats(&self) -> SwapStats {
        let history = self.history.read().await;
        SwapStats {
            installed: self.slots.read().await.len(),
            total_swaps: history.len(),
            completed: history
                .iter()
                .filter(|r| r.state == SwapState::Completed)
                .count(),
            rolled_back: history
                .iter()
                .filter(|r| r.state == SwapState::RolledBack)
                .count(),
            forced: history.iter().filter(|r| r.forced).count(),
        }
    }
}
