//! Location Registry - in-memory map of address of record to current contact

use super::entity::Registration;
use crate::domain::shared::{Aor, DomainError, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Result of an upsert
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// Binding created or replaced
    Registered(Registration),
    /// `expires == 0`; `existed` tells whether a live binding was dropped
    Unregistered { existed: bool },
}

/// In-memory location registry.
///
/// Holds at most one binding per AOR (last write wins). Writers take the
/// write lock for the whole replace, so readers never see a half-written
/// entry. Expired entries are invisible to `lookup` even before the
/// periodic `expire` sweep removes them.
#[derive(Clone, Default)]
pub struct LocationRegistry {
    registrations: Arc<RwLock<HashMap<Aor, Registration>>>,
}

impl LocationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the binding for `aor`; `expires_secs == 0` unregisters
    pub async fn upsert(&self, aor: Aor, contact: &str, expires_secs: u32) -> Result<UpsertOutcome> {
        self.upsert_at(aor, contact, expires_secs, Utc::now()).await
    }

    pub async fn upsert_at(
        &self,
        aor: Aor,
        contact: &str,
        expires_secs: u32,
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome> {
        let mut registrations = self.registrations.write().await;

        if expires_secs == 0 {
            let existed = registrations
                .remove(&aor)
                .map(|old| !old.is_expired_at(now))
                .unwrap_or(false);
            info!("Unregistered {} (had live binding: {})", aor, existed);
            return Ok(UpsertOutcome::Unregistered { existed });
        }

        let contact = contact.trim();
        if contact.is_empty() {
            return Err(DomainError::ValidationError(format!(
                "empty contact for {}",
                aor
            )));
        }

        let registration = Registration::new(aor.clone(), contact.to_string(), expires_secs, now);
        if let Some(previous) = registrations.insert(aor.clone(), registration.clone()) {
            if previous.contact != registration.contact {
                debug!("{} moved {} -> {}", aor, previous.contact, registration.contact);
            }
        }

        info!(
            "Registered {} -> {} (expires in {}s)",
            aor, registration.contact, expires_secs
        );
        Ok(UpsertOutcome::Registered(registration))
    }

    /// Current live binding for `aor`
    pub async fn lookup(&self, aor: &Aor) -> Result<Registration> {
        self.lookup_at(aor, Utc::now()).await
    }

    pub async fn lookup_at(&self, aor: &Aor, now: DateTime<Utc>) -> Result<Registration> {
        let registrations = self.registrations.read().await;
        registrations
            .get(aor)
            .filter(|reg| !reg.is_expired_at(now))
            .cloned()
            .ok_or_else(|| DomainError::NotFound(format!("no registration for {}", aor)))
    }

    /// Remove every entry whose expiry has passed; returns how many were dropped
    pub async fn expire(&self, now: DateTime<Utc>) -> usize {
        let mut registrations = self.registrations.write().await;
        let before = registrations.len();
        registrations.retain(|aor, reg| {
            let keep = !reg.is_expired_at(now);
            if !keep {
                debug!("Registration for {} expired", aor);
            }
            keep
        });
        before - registrations.len()
    }

    /// Snapshot of all live bindings
    pub async fn registrations(&self) -> Vec<Registration> {
        let now = Utc::now();
        let registrations = self.registrations.read().await;
        registrations
            .values()
            .filter(|reg| !reg.is_expired_at(now))
            .cloned()
            .collect()
    }

    /// Number of stored entries, including ones awaiting the next sweep
    pub async fn len(&self) -> usize {
        self.registrations.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.registrations.read().await.is_empty()
    }
}
