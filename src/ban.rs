//! Process-wide ban table and violation accounting (spec.md §4.6).
//!
//! Guarded by a single mutex; contention is expected to be low since
//! access only happens on the connect/refuse and rate-limit-denial
//! paths, never in the per-message hot loop.
use crate::config::Throttling;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

struct Record {
    banned_until: Option<SystemTime>,
    violations: u32,
}

/// `(client_address -> expiry_time)` plus a side counter of recent
/// violations used to escalate ban duration.
pub struct BanTable {
    records: Mutex<HashMap<String, Record>>,
    config: Throttling,
}

impl BanTable {
    #[must_use]
    pub fn new(config: Throttling) -> BanTable {
        BanTable {
            records: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// `true` if `address` is currently under an unexpired ban.
    #[must_use]
    pub fn is_banned(&self, address: &str, now: SystemTime) -> bool {
        let records = self.records.lock().unwrap();
        records
            .get(address)
            .and_then(|r| r.banned_until)
            .is_some_and(|until| until > now)
    }

    /// A new connection from a currently non-banned address clears its
    /// violation counter.
    pub fn on_connect(&self, address: &str, now: SystemTime) {
        let mut records = self.records.lock().unwrap();
        if let Some(record) = records.get_mut(address) {
            let still_banned = record.banned_until.is_some_and(|u| u > now);
            if !still_banned {
                record.violations = 0;
                record.banned_until = None;
            }
        }
    }

    /// Record a rate-limit violation, escalating to a ban once
    /// `BanThreshold` is reached. Returns `true` if this violation just
    /// triggered a new ban.
    pub fn record_violation(&self, address: &str, now: SystemTime) -> bool {
        let mut records = self.records.lock().unwrap();
        let record = records.entry(address.to_owned()).or_insert(Record {
            banned_until: None,
            violations: 0,
        });
        record.violations += 1;
        if record.violations < self.config.ban_threshold {
            return false;
        }
        let offences = record.violations / self.config.ban_threshold;
        let duration_secs = if self.config.progressive_ban {
            (self.config.ban_duration_seconds.saturating_mul(u64::from(offences)))
                .min(self.config.max_ban_duration_seconds)
        } else {
            self.config.ban_duration_seconds
        };
        record.banned_until = Some(now + Duration::from_secs(duration_secs));
        true
    }

    /// Remove expired entries; intended to run on a 10 minute cadence.
    pub fn sweep(&self, now: SystemTime) {
        let mut records = self.records.lock().unwrap();
        records.retain(|_, r| r.banned_until.is_some_and(|until| until > now));
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Spawns the sweeper task described in spec.md §4.6 / §5. Runs until the
/// process shuts down.
pub fn spawn_sweeper(table: std::sync::Arc<BanTable>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(600));
        loop {
            interval.tick().await;
            table.sweep(SystemTime::now());
        }
    })
}
