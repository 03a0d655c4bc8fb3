//! Priority-tiered admission control.
//!
//! A tier maps a priority value (lower number = more important) to the
//! maximum number of jobs allowed to run concurrently at or above that
//! importance. `check` answers both "is there capacity" and "what is the
//! least-restrictive priority we can admit right now".

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use crate::error::{Error, Result};

/// Ceiling returned when even the least important tier has room: work at
/// priorities outside the configured tiers is admitted too. The configured
/// tiers are a floor of capacity, not an exhaustive partition.
pub const ADMIT_ANY: u64 = i32::MAX as u64;

#[derive(Default)]
pub struct ConcurrencyEnforcer {
    /// priority -> max concurrent jobs. BTreeMap so the least important
    /// (largest) priority is a reverse iteration away.
    tiers: RwLock<BTreeMap<u64, i64>>,
}

impl ConcurrencyEnforcer {
    /// Build an enforcer from per-priority defaults and operator
    /// overrides, limited to the priorities actually in use.
    pub fn new(
        defaults: &HashMap<u64, i64>,
        overrides: &HashMap<u64, i64>,
        priorities: &[u64],
    ) -> Self {
        let enforcer = Self::default();
        enforcer.set_concurrencies(defaults, overrides, priorities);
        enforcer
    }

    pub fn set_concurrencies(
        &self,
        defaults: &HashMap<u64, i64>,
        overrides: &HashMap<u64, i64>,
        priorities: &[u64],
    ) {
        let mut tiers = BTreeMap::new();
        for priority in priorities {
            if let Some(max) = defaults.get(priority) {
                tiers.insert(*priority, *max);
            }
        }
        for (priority, max) in overrides {
            tiers.insert(*priority, *max);
        }
        *self.tiers.write().expect("enforcer lock poisoned") = tiers;
    }

    /// Validate the tier ladder: walking from least important to most
    /// important, limits must never decrease. A more important tier with
    /// less capacity than a less important one starves the low end
    /// undetected. Opt-in; call at startup.
    pub fn verify(&self) -> Result<()> {
        let tiers = self.tiers.read().expect("enforcer lock poisoned");
        let mut current_high = 0i64;
        for (_, limit) in tiers.iter().rev() {
            if *limit > current_high {
                current_high = *limit;
            }
            if *limit < current_high {
                return Err(Error::Config(
                    "higher priorities may not have lower concurrency settings than lower priorities"
                        .into(),
                ));
            }
        }
        Ok(())
    }

    /// Do we have capacity, and for what?
    ///
    /// Scans tiers from least important to most important and returns the
    /// first with room, using its priority as the admission ceiling. If
    /// the least important tier itself has room the ceiling widens to
    /// [`ADMIT_ANY`]. `(false, 0)` when every tier is full.
    pub fn check(&self, job_count: i64) -> (bool, u64) {
        let tiers = self.tiers.read().expect("enforcer lock poisoned");
        let least_important = tiers.keys().next_back().copied();

        for (priority, limit) in tiers.iter().rev() {
            if job_count < *limit {
                let max_priority = if Some(*priority) == least_important {
                    ADMIT_ANY
                } else {
                    *priority
                };
                return (true, max_priority);
            }
        }

        (false, 0)
    }
}
