use handoff_models::Organization;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::storage::{StorageBackend, StorageError};

/// TTL cache over the organizations the scheduler has to visit.
pub struct SettingsCache {
    storage: Arc<dyn StorageBackend>,
    ttl: Duration,
    cached: Mutex<Option<(Instant, Arc<Vec<Organization>>)>>,
}

impl SettingsCache {
    pub fn new(storage: Arc<dyn StorageBackend>, ttl: Duration) -> Self {
        Self {
            storage,
            ttl,
            cached: Mutex::new(None),
        }
    }

    /// Organizations with SLA or client inactivity enabled. Reloaded from
    /// storage once the cached copy is older than the TTL.
    pub fn scheduled_orgs(&self) -> Result<Arc<Vec<Organization>>, StorageError> {
        {
            let cached = self.cached.lock().map_err(|_| StorageError::Poisoned)?;
            if let Some((loaded_at, orgs)) = cached.as_ref() {
                if loaded_at.elapsed() < self.ttl {
                    return Ok(orgs.clone());
                }
            }
        }

        let orgs = Arc::new(self.storage.list_scheduled_organizations()?);
        debug!(count = orgs.len(), "reloaded scheduled organization settings");
        let mut cached = self.cached.lock().map_err(|_| StorageError::Poisoned)?;
        *cached = Some((Instant::now(), orgs.clone()));
        Ok(orgs)
    }

    pub fn invalidate(&self) {
        if let Ok(mut cached) = self.cached.lock() {
            *cached = None;
        }
    }
}
