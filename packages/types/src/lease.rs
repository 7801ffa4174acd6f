//! Mergeflow: File Leases
//!
//! A lease is a time-bounded exclusive right to modify one file path.
//! The fencing token is monotonic per path; writes that do not carry the
//! current token may be rejected downstream.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Exclusive per-path lease record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileLease {
    pub path: String,
    /// Agent holding the lease.
    pub holder: String,
    /// Monotonic per-path sequence number stamped at acquisition.
    pub token: u64,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl FileLease {
    pub fn new(
        path: impl Into<String>,
        holder: impl Into<String>,
        token: u64,
        now: DateTime<Utc>,
        ttl: chrono::Duration,
    ) -> Self {
        Self {
            path: path.into(),
            holder: holder.into(),
            token,
            acquired_at: now,
            expires_at: now + ttl,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    pub fn remaining_seconds(&self, now: DateTime<Utc>) -> i64 {
        (self.expires_at - now).num_seconds().max(0)
    }

    /// Bump expiry on heartbeat renewal.
    pub fn renew(&mut self, now: DateTime<Utc>, ttl: chrono::Duration) {
        self.expires_at = now + ttl;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_expiry() {
        let now = Utc::now();
        let lease = FileLease::new("src/a.rs", "worker-agent-1", 1, now, chrono::Duration::seconds(30));

        assert!(!lease.is_expired(now));
        assert!(lease.is_expired(now + chrono::Duration::seconds(31)));
        assert_eq!(lease.remaining_seconds(now), 30);
    }

    #[test]
    fn test_lease_renew() {
        let now = Utc::now();
        let mut lease =
            FileLease::new("src/a.rs", "worker-agent-1", 1, now, chrono::Duration::seconds(30));

        let later = now + chrono::Duration::seconds(25);
        lease.renew(later, chrono::Duration::seconds(30));
        assert!(!lease.is_expired(now + chrono::Duration::seconds(40)));
        assert_eq!(lease.token, 1);
    }
}
