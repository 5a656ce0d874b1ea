//! Registration service
//!
//! Applies validated REGISTER requests to the location registry and sweeps
//! expired bindings in the background.

use crate::domain::registration::{LocationRegistry, UpsertOutcome};
use crate::domain::shared::{Aor, Result};
use chrono::Utc;
use metrics::{counter, gauge};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

#[derive(Clone)]
pub struct RegistrationService {
    registry: LocationRegistry,
    max_expires: u32,
}

impl RegistrationService {
    pub fn new(registry: LocationRegistry, max_expires: u32) -> Self {
        Self { registry, max_expires }
    }

    pub fn registry(&self) -> &LocationRegistry {
        &self.registry
    }

    pub fn max_expires(&self) -> u32 {
        self.max_expires
    }

    /// Bind `aor` to `contact` for `expires` seconds (capped); 0 unregisters
    pub async fn on_register(&self, aor: Aor, contact: &str, expires: u32) -> Result<UpsertOutcome> {
        let granted = expires.min(self.max_expires);
        if granted != expires {
            debug!("Capping expiry for {} from {}s to {}s", aor, expires, granted);
        }

        let outcome = self.registry.upsert(aor, contact, granted).await?;
        counter!("sipbridge_registrations_total").increment(1);
        gauge!("sipbridge_registered_aors").set(self.registry.len().await as f64);
        Ok(outcome)
    }

    /// Periodically drop expired bindings
    pub fn spawn_sweeper(&self, every: Duration) -> JoinHandle<()> {
        let registry = self.registry.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                let removed = registry.expire(Utc::now()).await;
                if removed > 0 {
                    info!("Expired {} registration(s)", removed);
                }
                gauge!("sipbridge_registered_aors").set(registry.len().await as f64);
            }
        })
    }
}
