use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::arbiter::{ResidentStat, ResourceArbiter, ResourceBudget};
use crate::engine::{InferenceEngine, LoadSpec, LoadedModel};
use crate::error::{Error, Result};
use crate::registry::{ModelDescriptor, ModelRegistry};

/// Broadcast slot for a load in flight. `None` until the loader task
/// settles the outcome.
type LoadSignal = Option<Result<()>>;

pub(crate) struct HandleShared {
    pub id: String,
    pub model: Arc<dyn LoadedModel>,
    pub loaded_bytes: u64,
    // Generations against one model run strictly in arrival order.
    pub gen_lock: Arc<tokio::sync::Mutex<()>>,
}

struct ResidentEntry {
    shared: Arc<HandleShared>,
    estimate: u64,
    ref_count: u32,
    last_used: Instant,
    degraded: Option<String>,
}

enum SlotState {
    Loading {
        // Ties the slot to the load that created it; a drained slot can
        // be re-created under the same id before the old load settles.
        seq: u64,
        result_rx: watch::Receiver<LoadSignal>,
    },
    Resident(ResidentEntry),
}

struct ManagerState {
    slots: HashMap<String, SlotState>,
    arbiter: ResourceArbiter,
    load_seq: u64,
}

struct ManagerInner {
    // Never held across an await.
    state: Mutex<ManagerState>,
    engine: Arc<dyn InferenceEngine>,
    registry: Arc<ModelRegistry>,
}

/// Owns model residency: loads on demand, evicts idle models under
/// pressure, and hands out reference-counted handles to resident models.
pub struct ModelManager {
    inner: Arc<ManagerInner>,
}

/// A claim on a resident model. The model cannot be evicted while any
/// handle for it is alive; dropping the handle releases the claim.
pub struct ModelHandle {
    shared: Arc<HandleShared>,
    inner: Arc<ManagerInner>,
}

impl ModelManager {
    pub fn new(
        engine: Arc<dyn InferenceEngine>,
        registry: Arc<ModelRegistry>,
        budget: ResourceBudget,
    ) -> Self {
        info!(
            memory_bytes = budget.memory_bytes,
            slots = budget.slots,
            "model manager ready"
        );
        Self {
            inner: Arc::new(ManagerInner {
                state: Mutex::new(ManagerState {
                    slots: HashMap::new(),
                    arbiter: ResourceArbiter::new(budget),
                    load_seq: 0,
                }),
                engine,
                registry,
            }),
        }
    }

    /// Returns a handle to the model, loading it first if necessary.
    ///
    /// Concurrent callers for the same id share a single load. When the
    /// model cannot fit even after evicting every idle resident, this
    /// fails with `InsufficientCapacity` rather than waiting for busy
    /// models to drain.
    pub async fn acquire(&self, id: &str) -> Result<ModelHandle> {
        let descriptor = self.inner.registry.lookup(id)?;
        loop {
            let result_rx = {
                let state = &mut *self.inner.state.lock();
                match state.slots.get_mut(id) {
                    Some(SlotState::Resident(entry)) => {
                        if let Some(cause) = &entry.degraded {
                            return Err(Error::LoadFailure {
                                id: id.to_string(),
                                reason: format!("model is degraded ({cause}), reload it to recover"),
                            });
                        }
                        entry.ref_count += 1;
                        entry.last_used = Instant::now();
                        return Ok(ModelHandle {
                            shared: entry.shared.clone(),
                            inner: self.inner.clone(),
                        });
                    }
                    Some(SlotState::Loading { result_rx, .. }) => result_rx.clone(),
                    None => {
                        let stats = resident_stats(&state.slots);
                        let plan =
                            state
                                .arbiter
                                .plan_load(id, descriptor.estimated_memory_bytes, &stats)?;
                        let mut victims = Vec::new();
                        for victim_id in &plan.evict {
                            if let Some(SlotState::Resident(entry)) = state.slots.remove(victim_id)
                            {
                                victims.push(entry);
                            }
                        }
                        state.arbiter.reserve(id, descriptor.estimated_memory_bytes);
                        state.load_seq += 1;
                        let seq = state.load_seq;
                        let (result_tx, result_rx) = watch::channel(None);
                        state.slots.insert(
                            id.to_string(),
                            SlotState::Loading {
                                seq,
                                result_rx: result_rx.clone(),
                            },
                        );
                        // Detached so the load completes even when every
                        // caller waiting on it has gone away.
                        tokio::spawn(load_task(
                            self.inner.clone(),
                            descriptor.clone(),
                            victims,
                            seq,
                            result_tx,
                        ));
                        result_rx
                    }
                }
            };
            wait_for_load(result_rx, id).await?;
        }
    }

    /// Evicts the model if it is idle and loads it again from scratch.
    /// A load already in flight is joined instead of restarted.
    pub async fn reload(&self, id: &str) -> Result<()> {
        self.inner.registry.lookup(id)?;
        let mut pending_rx = None;
        let mut evicted = None;
        {
            let state = &mut *self.inner.state.lock();
            match state.slots.get(id) {
                Some(SlotState::Loading { result_rx, .. }) => pending_rx = Some(result_rx.clone()),
                Some(SlotState::Resident(entry)) if entry.ref_count > 0 => {
                    return Err(Error::LoadFailure {
                        id: id.to_string(),
                        reason: "model has requests in flight, retry when it is idle".to_string(),
                    });
                }
                Some(SlotState::Resident(_)) => {
                    if let Some(SlotState::Resident(entry)) = state.slots.remove(id) {
                        evicted = Some(entry);
                    }
                }
                None => {}
            }
        }
        if let Some(result_rx) = pending_rx {
            return wait_for_load(result_rx, id).await;
        }
        if let Some(entry) = evicted {
            info!(id = %id, "evicting for reload");
            close_model(entry.shared).await;
        }
        let handle = self.acquire(id).await?;
        drop(handle);
        Ok(())
    }

    /// Tears down every resident model. Pending loads are abandoned and
    /// in-use models are closed regardless; the first close error is
    /// returned after the sweep finishes.
    pub async fn evict_all(&self) -> Result<()> {
        let drained: Vec<(String, SlotState)> = {
            let state = &mut *self.inner.state.lock();
            state.arbiter.clear_reservations();
            state.slots.drain().collect()
        };
        let mut first_error = None;
        for (id, slot) in drained {
            let entry = match slot {
                SlotState::Resident(entry) => entry,
                SlotState::Loading { .. } => {
                    debug!(id = %id, "abandoning in-flight load during shutdown");
                    continue;
                }
            };
            if entry.ref_count > 0 {
                warn!(id = %id, ref_count = entry.ref_count, "evicting model with requests still in flight");
            }
            info!(id = %id, bytes = entry.shared.loaded_bytes, "evicting model");
            let shared = entry.shared;
            let closed = tokio::task::spawn_blocking(move || shared.model.close()).await;
            let failure = match closed {
                Ok(Ok(())) => None,
                Ok(Err(err)) => Some(Error::EngineFailure(format!("closing {id} failed: {err}"))),
                Err(err) => Some(Error::EngineFailure(format!(
                    "close task for {id} failed: {err}"
                ))),
            };
            if let Some(err) = failure {
                warn!(error = %err, "eviction failed during shutdown");
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Snapshot of every slot, sorted by model id.
    pub fn residents(&self) -> Vec<ResidentModel> {
        let state = self.inner.state.lock();
        let mut models: Vec<ResidentModel> = state
            .slots
            .iter()
            .map(|(id, slot)| match slot {
                SlotState::Loading { .. } => ResidentModel {
                    id: id.clone(),
                    state: ResidencyState::Loading,
                    loaded_memory_bytes: 0,
                    ref_count: 0,
                    idle_ms: 0,
                },
                SlotState::Resident(entry) => ResidentModel {
                    id: id.clone(),
                    state: if entry.degraded.is_some() {
                        ResidencyState::Degraded
                    } else {
                        ResidencyState::Resident
                    },
                    loaded_memory_bytes: entry.shared.loaded_bytes,
                    ref_count: entry.ref_count,
                    idle_ms: entry.last_used.elapsed().as_millis() as u64,
                },
            })
            .collect();
        models.sort_by(|a, b| a.id.cmp(&b.id));
        models
    }

    /// Flags a resident model as unusable until it is reloaded. Its memory
    /// stays charged; acquire fails for it so no new work lands on it.
    pub(crate) fn mark_degraded(&self, id: &str, cause: &str) {
        let state = &mut *self.inner.state.lock();
        if let Some(SlotState::Resident(entry)) = state.slots.get_mut(id) {
            warn!(id = %id, cause = %cause, "marking model degraded");
            entry.degraded = Some(cause.to_string());
        }
    }
}

impl fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelHandle")
            .field("id", &self.shared.id)
            .field("loaded_bytes", &self.shared.loaded_bytes)
            .finish_non_exhaustive()
    }
}

impl ModelHandle {
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn loaded_memory_bytes(&self) -> u64 {
        self.shared.loaded_bytes
    }

    pub(crate) fn shared(&self) -> &Arc<HandleShared> {
        &self.shared
    }
}

impl Drop for ModelHandle {
    fn drop(&mut self) {
        let state = &mut *self.inner.state.lock();
        if let Some(SlotState::Resident(entry)) = state.slots.get_mut(&self.shared.id) {
            // The slot may hold a newer incarnation of the same id.
            if Arc::ptr_eq(&entry.shared, &self.shared) && entry.ref_count > 0 {
                entry.ref_count -= 1;
                entry.last_used = Instant::now();
                return;
            }
        }
        debug!(id = %self.shared.id, "released a handle for a model no longer tracked");
    }
}

/// Current residency of one model, as reported by `residents`.
#[derive(Debug, Clone, Serialize)]
pub struct ResidentModel {
    pub id: String,
    pub state: ResidencyState,
    pub loaded_memory_bytes: u64,
    pub ref_count: u32,
    pub idle_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResidencyState {
    Loading,
    Resident,
    Degraded,
}

serde_plain::derive_display_from_serialize!(ResidencyState);

fn resident_stats(slots: &HashMap<String, SlotState>) -> Vec<ResidentStat<'_>> {
    slots
        .iter()
        .filter_map(|(id, slot)| match slot {
            SlotState::Resident(entry) => Some(ResidentStat {
                id,
                bytes: entry.estimate,
                ref_count: entry.ref_count,
                last_used: entry.last_used,
            }),
            SlotState::Loading { .. } => None,
        })
        .collect()
}

async fn wait_for_load(mut result_rx: watch::Receiver<LoadSignal>, id: &str) -> Result<()> {
    loop {
        if let Some(outcome) = result_rx.borrow_and_update().as_ref() {
            return outcome.clone();
        }
        if result_rx.changed().await.is_err() {
            return Err(Error::LoadFailure {
                id: id.to_string(),
                reason: "load was interrupted".to_string(),
            });
        }
    }
}

async fn load_task(
    inner: Arc<ManagerInner>,
    descriptor: ModelDescriptor,
    victims: Vec<ResidentEntry>,
    seq: u64,
    result_tx: watch::Sender<LoadSignal>,
) {
    let outcome = run_load(&inner, &descriptor, victims, seq).await;
    result_tx.send_replace(Some(outcome));
}

async fn run_load(
    inner: &Arc<ManagerInner>,
    descriptor: &ModelDescriptor,
    victims: Vec<ResidentEntry>,
    seq: u64,
) -> Result<()> {
    for victim in victims {
        info!(
            id = %victim.shared.id,
            bytes = victim.shared.loaded_bytes,
            "evicting idle model"
        );
        close_model(victim.shared).await;
    }

    let spec = LoadSpec::from(descriptor);
    let engine = inner.engine.clone();
    info!(
        id = %descriptor.id,
        estimated_bytes = descriptor.estimated_memory_bytes,
        "loading model"
    );
    let started = Instant::now();
    let loaded = tokio::task::spawn_blocking(move || engine.load(&spec)).await;
    let model = match loaded {
        Ok(Ok(model)) => model,
        Ok(Err(err)) => return fail_load(inner, &descriptor.id, seq, err.to_string()),
        Err(err) => {
            return fail_load(
                inner,
                &descriptor.id,
                seq,
                format!("load task panicked: {err}"),
            )
        }
    };

    let loaded_bytes = model.memory_bytes();
    let shared = Arc::new(HandleShared {
        id: descriptor.id.clone(),
        model,
        loaded_bytes,
        gen_lock: Arc::new(tokio::sync::Mutex::new(())),
    });

    let committed = {
        let state = &mut *inner.state.lock();
        // A newer load may have re-created this slot after evict_all
        // drained it; that slot and its reservation are not ours to settle.
        let owns_slot = matches!(
            state.slots.get(&descriptor.id),
            Some(SlotState::Loading { seq: slot_seq, .. }) if *slot_seq == seq
        );
        if owns_slot {
            state.arbiter.commit(&descriptor.id);
            state.slots.insert(
                descriptor.id.clone(),
                SlotState::Resident(ResidentEntry {
                    shared: shared.clone(),
                    estimate: descriptor.estimated_memory_bytes,
                    ref_count: 0,
                    last_used: Instant::now(),
                    degraded: None,
                }),
            );
        }
        owns_slot
    };
    if committed {
        info!(
            id = %descriptor.id,
            loaded_bytes,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "model resident"
        );
        Ok(())
    } else {
        // The slot was drained, or re-created by a newer load, while we
        // were loading.
        warn!(id = %descriptor.id, "slot vanished during load, discarding model");
        close_model(shared).await;
        Err(Error::LoadFailure {
            id: descriptor.id.clone(),
            reason: "evicted while loading".to_string(),
        })
    }
}

fn fail_load(inner: &Arc<ManagerInner>, id: &str, seq: u64, reason: String) -> Result<()> {
    warn!(id = %id, reason = %reason, "load failed");
    let state = &mut *inner.state.lock();
    let owns_slot = matches!(
        state.slots.get(id),
        Some(SlotState::Loading { seq: slot_seq, .. }) if *slot_seq == seq
    );
    if owns_slot {
        state.arbiter.rollback(id);
        state.slots.remove(id);
    }
    Err(Error::LoadFailure {
        id: id.to_string(),
        reason,
    })
}

async fn close_model(shared: Arc<HandleShared>) {
    let id = shared.id.clone();
    match tokio::task::spawn_blocking(move || shared.model.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(id = %id, error = %err, "close failed"),
        Err(err) => warn!(id = %id, error = %err, "close task failed"),
    }
}
