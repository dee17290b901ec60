//! The storage contract (spec.md §4.4): the core consumes this trait; the
//! reference implementation (`postgres`) targets a distributed SQL cluster.
//! `memory` is an in-process implementation used by tests.
pub mod memory;
pub mod postgres;

use crate::error::Result;
use crate::event::Event;
use crate::filter::Filter;
use async_trait::async_trait;
use tokio::sync::broadcast;

/// Outcome of a `put`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PutOutcome {
    pub stored: bool,
    pub duplicate: bool,
}

/// The abstract storage interface. Never stores ephemeral kinds; applies
/// replace/addressable rules at write time; answers filter queries ordered
/// by descending `created_at` with ascending `id` as a deterministic
/// tie-break.
#[async_trait]
pub trait NostrRepo: Send + Sync {
    /// Atomic with respect to dedupe and the replace rules.
    async fn put(&self, event: Event) -> Result<PutOutcome>;

    /// Cheap dedupe probe used by the validator.
    async fn exists(&self, id: &str) -> Result<bool>;

    /// Used for deletion-authority checks.
    async fn get_by_id(&self, id: &str) -> Result<Option<Event>>;

    /// Applies the filter server-side; `limit` has already been clamped by
    /// the caller to the relay's `max_limit`.
    async fn query(&self, filter: &Filter, limit: usize) -> Result<Vec<Event>>;

    /// As `query` but returns cardinality only. A single union count across
    /// all supplied filters (see SPEC_FULL.md §9 open-question resolution).
    async fn count(&self, filters: &[Filter]) -> Result<u64>;

    /// Marks the given ids deleted; refuses ids not authored by
    /// `requester`. Returns the number actually removed from the visible
    /// set.
    async fn delete(&self, ids: &[String], requester: &str) -> Result<u64>;

    /// Background pass removing events whose `expiration` tag has elapsed.
    async fn sweep_expired(&self, now: i64) -> Result<u64>;

    /// Subscribe to the durable change feed of newly persisted events, for
    /// cross-node propagation (spec.md §4.5).
    fn subscribe_changes(&self) -> broadcast::Receiver<Event>;
}
