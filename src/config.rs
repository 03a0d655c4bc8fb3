//! Timing knobs with environment overrides.
//!
//! All values have working defaults; the environment only needs to be
//! consulted when a deployment wants different cadences. Parse failures
//! are surfaced rather than silently falling back.

use std::time::Duration;

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct Tunables {
    /// Lease heartbeat cadence while a job runs.
    pub extend_interval: Duration,
    /// Fallback poll cadence for `poll_address`.
    pub address_poll_interval: Duration,
    /// Group completion poll cadence.
    pub group_poll_interval: Duration,
    /// Permits with no heartbeat for this long are swept.
    pub permit_sweep_age: Duration,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            extend_interval: Duration::from_secs(5),
            address_poll_interval: Duration::from_secs(5),
            group_poll_interval: Duration::from_secs(2),
            permit_sweep_age: Duration::from_secs(60),
        }
    }
}

impl Tunables {
    /// Defaults overlaid with any `QUARRY_*_SECS` variables present.
    pub fn from_env() -> Result<Self> {
        let mut tunables = Self::default();
        if let Some(secs) = optional_secs("QUARRY_EXTEND_SECS")? {
            tunables.extend_interval = secs;
        }
        if let Some(secs) = optional_secs("QUARRY_ADDRESS_POLL_SECS")? {
            tunables.address_poll_interval = secs;
        }
        if let Some(secs) = optional_secs("QUARRY_GROUP_POLL_SECS")? {
            tunables.group_poll_interval = secs;
        }
        if let Some(secs) = optional_secs("QUARRY_PERMIT_SWEEP_SECS")? {
            tunables.permit_sweep_age = secs;
        }
        Ok(tunables)
    }
}

fn optional_secs(name: &str) -> Result<Option<Duration>> {
    match std::env::var(name) {
        Err(_) => Ok(None),
        Ok(raw) => raw
            .parse::<u64>()
            .map(|secs| Some(Duration::from_secs(secs)))
            .map_err(|_| Error::Config(format!("{name} must be an integer number of seconds"))),
    }
}
