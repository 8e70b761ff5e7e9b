use std::collections::HashMap;
use std::time::Instant;

use tracing::debug;

use crate::error::{Error, Result};

/// Device capacity the lifecycle manager is allowed to spend: a byte
/// budget and a resident-slot count. Both constraints hold at all times,
/// counting in-flight load reservations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceBudget {
    pub memory_bytes: u64,
    pub slots: usize,
}

impl ResourceBudget {
    pub fn new(memory_bytes: u64, slots: usize) -> Self {
        Self {
            memory_bytes,
            slots,
        }
    }
}

impl Default for ResourceBudget {
    fn default() -> Self {
        Self {
            memory_bytes: 16 << 30,
            slots: 1,
        }
    }
}

/// A resident entry as the planner sees it.
pub(crate) struct ResidentStat<'a> {
    pub id: &'a str,
    pub bytes: u64,
    pub ref_count: u32,
    pub last_used: Instant,
}

/// What must be evicted before a load may proceed, in eviction order.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct LoadPlan {
    pub evict: Vec<String>,
}

/// Pure capacity ledger. Residents are passed in by the caller; the
/// arbiter itself only tracks reservations for loads that are still in
/// flight. It never waits: an infeasible plan fails immediately.
pub(crate) struct ResourceArbiter {
    budget: ResourceBudget,
    reserved: HashMap<String, u64>,
}

impl ResourceArbiter {
    pub fn new(budget: ResourceBudget) -> Self {
        Self {
            budget,
            reserved: HashMap::new(),
        }
    }

    /// Decide what to evict so that `needed` bytes and one slot become
    /// available. Victims are picked least-recently-used first among
    /// entries with no outstanding handles; on equal age the larger entry
    /// goes first. Pinned entries and in-flight reservations are never
    /// victims.
    pub fn plan_load(&self, id: &str, needed: u64, residents: &[ResidentStat]) -> Result<LoadPlan> {
        if needed > self.budget.memory_bytes {
            return Err(Error::InsufficientCapacity {
                id: id.to_string(),
                needed,
                budget: self.budget.memory_bytes,
            });
        }

        let mut used_bytes: u64 =
            residents.iter().map(|r| r.bytes).sum::<u64>() + self.reserved.values().sum::<u64>();
        let mut used_slots = residents.len() + self.reserved.len();

        let mut candidates: Vec<&ResidentStat> =
            residents.iter().filter(|r| r.ref_count == 0).collect();
        candidates.sort_by(|a, b| a.last_used.cmp(&b.last_used).then(b.bytes.cmp(&a.bytes)));
        let mut candidates = candidates.into_iter();

        let mut plan = LoadPlan::default();
        while used_slots + 1 > self.budget.slots || used_bytes + needed > self.budget.memory_bytes
        {
            match candidates.next() {
                Some(victim) => {
                    used_bytes -= victim.bytes;
                    used_slots -= 1;
                    plan.evict.push(victim.id.to_string());
                }
                None => {
                    return Err(Error::InsufficientCapacity {
                        id: id.to_string(),
                        needed,
                        budget: self.budget.memory_bytes,
                    });
                }
            }
        }
        Ok(plan)
    }

    pub fn reserve(&mut self, id: &str, bytes: u64) {
        debug!(model = %id, bytes, "reserved capacity for load");
        self.reserved.insert(id.to_string(), bytes);
    }

    /// The load completed; its charge now lives in the residency table.
    pub fn commit(&mut self, id: &str) {
        if self.reserved.remove(id).is_some() {
            debug!(model = %id, "committed reservation");
        }
    }

    /// The load failed; the reservation is released.
    pub fn rollback(&mut self, id: &str) {
        if let Some(bytes) = self.reserved.remove(id) {
            debug!(model = %id, bytes, "rolled back reservation");
        }
    }

    pub fn clear_reservations(&mut self) {
        self.reserved.clear();
    }
}
