//! Registration entity

use crate::domain::shared::Aor;
use chrono::{DateTime, Duration, Utc};

/// Current contact binding for one address of record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub aor: Aor,
    /// Contact URI the AOR is reachable at
    pub contact: String,
    pub expires_at: DateTime<Utc>,
}

impl Registration {
    pub fn new(aor: Aor, contact: String, expires_secs: u32, now: DateTime<Utc>) -> Self {
        Self {
            aor,
            contact,
            expires_at: now + Duration::seconds(i64::from(expires_secs)),
        }
    }

    /// An entry is dead from the instant `expires_at` is reached
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Seconds left before expiry, zero once expired
    pub fn remaining_secs(&self, now: DateTime<Utc>) -> u32 {
        (self.expires_at - now).num_seconds().clamp(0, i64::from(u32::MAX)) as u32
    }
}
