//! Reference storage backend, targeting a Postgres-wire-protocol
//! distributed SQL cluster (CockroachDB, YugabyteDB, or vanilla Postgres
//! for development). The core treats this as one interchangeable
//! implementation of [`NostrRepo`]; no other module reaches through it.
//!
//! Schema (created by the accompanying migration, not embedded here):
//!
//! ```sql
//! CREATE TABLE events (
//!     id          TEXT PRIMARY KEY,
//!     pubkey      TEXT NOT NULL,
//!     created_at  BIGINT NOT NULL,
//!     kind        BIGINT NOT NULL,
//!     tags        JSONB NOT NULL,
//!     content     TEXT NOT NULL,
//!     sig         TEXT NOT NULL,
//!     d_tag       TEXT,
//!     expiration  BIGINT
//! );
//! CREATE INDEX events_kind_created_idx ON events (kind, created_at DESC);
//! CREATE INDEX events_pubkey_created_idx ON events (pubkey, created_at DESC);
//! CREATE TABLE event_tags (
//!     event_id TEXT NOT NULL REFERENCES events(id) ON DELETE CASCADE,
//!     name     TEXT NOT NULL,
//!     value    TEXT NOT NULL
//! );
//! CREATE INDEX event_tags_name_value_idx ON event_tags (name, value);
//! ```
use super::{NostrRepo, PutOutcome};
use crate::error::Result;
use crate::event::{Event, KindClass};
use crate::filter::Filter;
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tokio::sync::broadcast;
use tracing::{trace, warn};

pub struct PostgresRepo {
    pool: PgPool,
    changes: broadcast::Sender<Event>,
}

impl PostgresRepo {
    pub async fn connect(database_url: &str, min_conn: u32, max_conn: u32) -> Result<PostgresRepo> {
        let pool = PgPoolOptions::new()
            .min_connections(min_conn)
            .max_connections(max_conn)
            .connect(database_url)
            .await?;
        let (changes, _rx) = broadcast::channel(4096);
        Ok(PostgresRepo { pool, changes })
    }

    /// Spawns the background task that `LISTEN`s on the `new_event`
    /// channel and republishes rows into the in-process broadcast channel
    /// every node's dispatcher subscribes to (spec.md §4.5 cross-node
    /// propagation).
    pub fn spawn_change_feed_listener(self: &std::sync::Arc<Self>) {
        let repo = std::sync::Arc::clone(self);
        tokio::spawn(async move {
            loop {
                if let Err(e) = repo.run_change_feed_once().await {
                    warn!("change feed listener error, retrying: {:?}", e);
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                }
            }
        });
    }

    async fn run_change_feed_once(&self) -> Result<()> {
        let mut listener = sqlx::postgres::PgListener::connect_with(&self.pool).await?;
        listener.listen("new_event").await?;
        loop {
            let notification = listener.recv().await?;
            if let Ok(event) = serde_json::from_str::<Event>(notification.payload()) {
                trace!("change feed delivered event {}", event.get_event_id_prefix());
                let _ = self.changes.send(event);
            }
        }
    }

    /// The `WHERE` predicate identifying an event's replace group: all
    /// other rows sharing `(pubkey, kind)` (replaceable) or
    /// `(pubkey, kind, d_tag)` (addressable).
    fn push_replace_predicate<'a>(builder: &mut QueryBuilder<'a, Postgres>, event: &'a Event) -> Option<()> {
        match event.kind_class() {
            KindClass::Replaceable => {
                builder.push("pubkey = ").push_bind(event.pubkey.as_str());
                builder.push(" AND kind = ").push_bind(event.kind as i64);
                Some(())
            }
            KindClass::Addressable => {
                builder.push("pubkey = ").push_bind(event.pubkey.as_str());
                builder.push(" AND kind = ").push_bind(event.kind as i64);
                builder.push(" AND d_tag = ").push_bind(event.d_tag().unwrap_or_default());
                Some(())
            }
            _ => None,
        }
    }

    /// Inserts `event`, using the primary key itself as the dedupe check:
    /// `ON CONFLICT (id) DO NOTHING` followed by `RETURNING id` tells us
    /// in one round trip whether this call actually won the race. A
    /// separate `exists`-then-insert would leave a window where two
    /// nodes racing on the same id both pass the check and one insert
    /// fails on the unique constraint — exactly the concurrent-write case
    /// spec.md §1 calls the normal case for this design, not an edge
    /// case. Returns `false` when another writer already holds this id.
    async fn insert_event(&self, tx: &mut sqlx::Transaction<'_, sqlx::Postgres>, event: &Event) -> Result<bool> {
        let tags_json = serde_json::to_value(&event.tags)?;
        let inserted = sqlx::query(
            "INSERT INTO events (id, pubkey, created_at, kind, tags, content, sig, d_tag, expiration)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
             ON CONFLICT (id) DO NOTHING
             RETURNING id",
        )
        .bind(&event.id)
        .bind(&event.pubkey)
        .bind(event.created_at)
        .bind(event.kind as i64)
        .bind(tags_json)
        .bind(&event.content)
        .bind(&event.sig)
        .bind(event.d_tag())
        .bind(event.expiration())
        .fetch_optional(&mut *tx)
        .await?;

        if inserted.is_none() {
            return Ok(false);
        }

        for tag in &event.tags {
            if tag.len() >= 2 && tag[0].len() == 1 {
                sqlx::query("INSERT INTO event_tags (event_id, name, value) VALUES ($1, $2, $3)")
                    .bind(&event.id)
                    .bind(&tag[0])
                    .bind(&tag[1])
                    .execute(&mut *tx)
                    .await?;
            }
        }
        sqlx::query("SELECT pg_notify('new_event', $1)")
            .bind(serde_json::to_string(event)?)
            .execute(&mut *tx)
            .await?;
        Ok(true)
    }

    /// Appends this filter's `WHERE` predicate to `builder`. An
    /// unconstrained filter appends `TRUE`.
    fn push_filter_predicate<'a>(builder: &mut QueryBuilder<'a, Postgres>, filter: &'a Filter) {
        let mut first = true;
        let mut and = |builder: &mut QueryBuilder<'a, Postgres>, first: &mut bool| {
            if *first {
                *first = false;
            } else {
                builder.push(" AND ");
            }
        };

        if let Some(ids) = &filter.ids {
            and(builder, &mut first);
            builder.push("id IN (");
            let mut sep = builder.separated(", ");
            for id in ids {
                sep.push_bind(id.as_str());
            }
            builder.push(")");
        }
        if let Some(authors) = &filter.authors {
            and(builder, &mut first);
            builder.push("pubkey IN (");
            let mut sep = builder.separated(", ");
            for a in authors {
                sep.push_bind(a.as_str());
            }
            builder.push(")");
        }
        if let Some(kinds) = &filter.kinds {
            and(builder, &mut first);
            builder.push("kind IN (");
            let mut sep = builder.separated(", ");
            for k in kinds {
                sep.push_bind(*k as i64);
            }
            builder.push(")");
        }
        if let Some(since) = filter.since {
            and(builder, &mut first);
            builder.push("created_at >= ").push_bind(since);
        }
        if let Some(until) = filter.until {
            and(builder, &mut first);
            builder.push("created_at <= ").push_bind(until);
        }
        for (key, values) in &filter.tags {
            and(builder, &mut first);
            let name = key.trim_start_matches('#');
            builder.push("id IN (SELECT event_id FROM event_tags WHERE name = ");
            builder.push_bind(name.to_owned());
            builder.push(" AND value IN (");
            let mut sep = builder.separated(", ");
            for v in values {
                sep.push_bind(v.as_str());
            }
            builder.push("))");
        }
        if first {
            builder.push("TRUE");
        }
    }
}

fn row_to_event(row: &sqlx::postgres::PgRow) -> Result<Event> {
    let tags_json: serde_json::Value = row.try_get("tags")?;
    let tags = serde_json::from_value(tags_json)?;
    Ok(Event {
        id: row.try_get("id")?,
        pubkey: row.try_get("pubkey")?,
        created_at: row.try_get("created_at")?,
        kind: row.try_get::<i64, _>("kind")? as u64,
        tags,
        content: row.try_get("content")?,
        sig: row.try_get("sig")?,
        delegated_by: None,
    })
}

#[async_trait]
impl NostrRepo for PostgresRepo {
    async fn put(&self, event: Event) -> Result<PutOutcome> {
        if event.is_ephemeral() {
            let _ = self.changes.send(event);
            return Ok(PutOutcome {
                stored: false,
                duplicate: false,
            });
        }
        let mut tx = self.pool.begin().await?;

        let mut select_builder = QueryBuilder::new("SELECT id, created_at FROM events WHERE ");
        if Self::push_replace_predicate(&mut select_builder, &event).is_some() {
            let rows = select_builder.build().fetch_all(&mut *tx).await?;
            let superseded = rows.iter().any(|r| {
                let created_at: i64 = r.get("created_at");
                let id: String = r.get("id");
                (created_at, id.as_str()) >= (event.created_at, event.id.as_str())
            });
            if superseded {
                tx.rollback().await?;
                return Ok(PutOutcome {
                    stored: false,
                    duplicate: false,
                });
            }
            let mut delete_builder = QueryBuilder::new("DELETE FROM events WHERE ");
            Self::push_replace_predicate(&mut delete_builder, &event);
            delete_builder.build().execute(&mut *tx).await?;
        }

        if !self.insert_event(&mut tx, &event).await? {
            tx.rollback().await?;
            return Ok(PutOutcome {
                stored: false,
                duplicate: true,
            });
        }

        if event.is_deletion() {
            let requester = event.delegated_by.clone().unwrap_or_else(|| event.pubkey.clone());
            let targets: Vec<&str> = event.tag_values("e").collect();
            if !targets.is_empty() {
                sqlx::query("DELETE FROM events WHERE pubkey = $1 AND id = ANY($2)")
                    .bind(&requester)
                    .bind(&targets as &[&str])
                    .execute(&mut *tx)
                    .await?;
            }
        }

        tx.commit().await?;
        let _ = self.changes.send(event);
        Ok(PutOutcome {
            stored: true,
            duplicate: false,
        })
    }

    async fn exists(&self, id: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM events WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<Event>> {
        let row = sqlx::query("SELECT * FROM events WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_event).transpose()
    }

    async fn query(&self, filter: &Filter, limit: usize) -> Result<Vec<Event>> {
        // A fixed preallocation is used at the allocation site; the
        // underlying SQL cursor is unbounded until `LIMIT` below.
        let mut results = Vec::with_capacity(500.min(limit.max(1)));
        let mut builder = QueryBuilder::new("SELECT * FROM events WHERE ");
        Self::push_filter_predicate(&mut builder, filter);
        builder.push(" ORDER BY created_at DESC, id ASC LIMIT ");
        builder.push_bind(limit as i64);
        let rows = builder.build().fetch_all(&self.pool).await?;
        for row in &rows {
            results.push(row_to_event(row)?);
        }
        Ok(results)
    }

    async fn count(&self, filters: &[Filter]) -> Result<u64> {
        // Single union count across all supplied filters.
        let mut builder = QueryBuilder::new("SELECT COUNT(*) AS n FROM events WHERE ");
        if filters.is_empty() {
            builder.push("FALSE");
        } else {
            for (i, filter) in filters.iter().enumerate() {
                if i > 0 {
                    builder.push(" OR ");
                }
                builder.push("(");
                Self::push_filter_predicate(&mut builder, filter);
                builder.push(")");
            }
        }
        let row = builder.build().fetch_one(&self.pool).await?;
        let n: i64 = row.try_get("n")?;
        Ok(n as u64)
    }

    async fn delete(&self, ids: &[String], requester: &str) -> Result<u64> {
        let res = sqlx::query("DELETE FROM events WHERE pubkey = $1 AND id = ANY($2)")
            .bind(requester)
            .bind(ids)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }

    async fn sweep_expired(&self, now: i64) -> Result<u64> {
        let res = sqlx::query("DELETE FROM events WHERE expiration IS NOT NULL AND expiration <= $1")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }

    fn subscribe_changes(&self) -> broadcast::Receiver<Event> {
        self.changes.subscribe()
    }
}
