//! In-process storage backend. Used by tests and as a degenerate
//! single-node deployment; the `postgres` module is the reference backend
//! for the horizontally-scaled deployment spec.md describes.
use super::{NostrRepo, PutOutcome};
use crate::error::Result;
use crate::event::{Event, KindClass};
use crate::filter::Filter;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;
use tokio::sync::broadcast;

pub struct MemoryRepo {
    events: RwLock<HashMap<String, Event>>,
    changes: broadcast::Sender<Event>,
}

impl Default for MemoryRepo {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRepo {
    #[must_use]
    pub fn new() -> MemoryRepo {
        let (tx, _rx) = broadcast::channel(4096);
        MemoryRepo {
            events: RwLock::new(HashMap::new()),
            changes: tx,
        }
    }

    fn replace_key(event: &Event) -> Option<(String, u64, Option<String>)> {
        match event.kind_class() {
            KindClass::Replaceable => Some((event.pubkey.clone(), event.kind, None)),
            KindClass::Addressable => {
                Some((event.pubkey.clone(), event.kind, event.d_tag().map(str::to_owned)))
            }
            _ => None,
        }
    }

    fn same_replace_group(existing: &Event, pubkey: &str, kind: u64, d: &Option<String>) -> bool {
        if &existing.pubkey != pubkey || existing.kind != kind {
            return false;
        }
        match existing.kind_class() {
            KindClass::Addressable => existing.d_tag().map(str::to_owned) == *d,
            KindClass::Replaceable => true,
            _ => false,
        }
    }
}

#[async_trait]
impl NostrRepo for MemoryRepo {
    async fn put(&self, event: Event) -> Result<PutOutcome> {
        if event.is_ephemeral() {
            let _ = self.changes.send(event);
            return Ok(PutOutcome {
                stored: false,
                duplicate: false,
            });
        }
        let mut events = self.events.write().unwrap();
        if events.contains_key(&event.id) {
            return Ok(PutOutcome {
                stored: false,
                duplicate: true,
            });
        }
        if let Some((pubkey, kind, d)) = Self::replace_key(&event) {
            let superseded: Vec<String> = events
                .values()
                .filter(|e| Self::same_replace_group(e, &pubkey, kind, &d))
                .filter(|e| (e.created_at, e.id.as_str()) >= (event.created_at, event.id.as_str()))
                .map(|e| e.id.clone())
                .collect();
            if !superseded.is_empty() {
                return Ok(PutOutcome {
                    stored: false,
                    duplicate: false,
                });
            }
            let to_remove: Vec<String> = events
                .values()
                .filter(|e| Self::same_replace_group(e, &pubkey, kind, &d))
                .map(|e| e.id.clone())
                .collect();
            for id in to_remove {
                events.remove(&id);
            }
        }

        let is_deletion = event.is_deletion();
        let requester = event.delegated_by.clone().unwrap_or_else(|| event.pubkey.clone());
        let targets: Vec<String> = if is_deletion {
            event.tag_values("e").map(str::to_owned).collect()
        } else {
            Vec::new()
        };
        events.insert(event.id.clone(), event.clone());
        drop(events);

        if is_deletion {
            let mut events = self.events.write().unwrap();
            for id in &targets {
                if let Some(target) = events.get(id) {
                    if target.pubkey == requester {
                        events.remove(id);
                    }
                }
            }
        }
        let _ = self.changes.send(event);
        Ok(PutOutcome {
            stored: true,
            duplicate: false,
        })
    }

    async fn exists(&self, id: &str) -> Result<bool> {
        Ok(self.events.read().unwrap().contains_key(id))
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<Event>> {
        Ok(self.events.read().unwrap().get(id).cloned())
    }

    async fn query(&self, filter: &Filter, limit: usize) -> Result<Vec<Event>> {
        let events = self.events.read().unwrap();
        let mut matched: Vec<Event> = events.values().filter(|e| filter.matches(e)).cloned().collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        matched.truncate(limit);
        Ok(matched)
    }

    async fn count(&self, filters: &[Filter]) -> Result<u64> {
        let events = self.events.read().unwrap();
        let n = events
            .values()
            .filter(|e| filters.iter().any(|f| f.matches(e)))
            .count();
        Ok(n as u64)
    }

    async fn delete(&self, ids: &[String], requester: &str) -> Result<u64> {
        let mut events = self.events.write().unwrap();
        let mut n = 0u64;
        for id in ids {
            if let Some(target) = events.get(id) {
                if target.pubkey == requester {
                    events.remove(id);
                    n += 1;
                }
            }
        }
        Ok(n)
    }

    async fn sweep_expired(&self, now: i64) -> Result<u64> {
        let mut events = self.events.write().unwrap();
        let expired: Vec<String> = events
            .values()
            .filter(|e| e.is_expired(now))
            .map(|e| e.id.clone())
            .collect();
        for id in &expired {
            events.remove(id);
        }
        Ok(expired.len() as u64)
    }

    fn subscribe_changes(&self) -> broadcast::Receiver<Event> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Tag;
    use secp256k1::{rand, schnorr, KeyPair, Message, Secp256k1};

    fn make(kind: u64, created_at: i64, tags: Vec<Tag>, content: &str, keypair: &KeyPair) -> Event {
        let (xonly, _) = keypair.x_only_public_key();
        let mut ev = Event {
            id: String::new(),
            pubkey: hex::encode(xonly.serialize()),
            created_at,
            kind,
            tags,
            content: content.to_owned(),
            sig: String::new(),
            delegated_by: None,
        };
        ev.id = ev.compute_id();
        let secp = Secp256k1::new();
        let id_bytes = hex::decode(&ev.id).unwrap();
        let msg = Message::from_slice(&id_bytes).unwrap();
        let sig: schnorr::Signature = secp.sign_schnorr(&msg, keypair);
        ev.sig = hex::encode(sig.as_ref());
        ev
    }

    fn keypair() -> KeyPair {
        let secp = Secp256k1::new();
        let mut rng = rand::thread_rng();
        KeyPair::new(&secp, &mut rng)
    }

    #[tokio::test]
    async fn duplicate_put_is_reported() {
        let repo = MemoryRepo::new();
        let kp = keypair();
        let ev = make(1, 100, vec![], "hi", &kp);
        let r1 = repo.put(ev.clone()).await.unwrap();
        assert!(r1.stored && !r1.duplicate);
        let r2 = repo.put(ev).await.unwrap();
        assert!(!r2.stored && r2.duplicate);
    }

    #[tokio::test]
    async fn replaceable_keeps_newest() {
        let repo = MemoryRepo::new();
        let kp = keypair();
        let m1 = make(0, 100, vec![], "old", &kp);
        let m2 = make(0, 200, vec![], "new", &kp);
        repo.put(m1.clone()).await.unwrap();
        repo.put(m2.clone()).await.unwrap();
        let filter = Filter {
            kinds: Some([0].into_iter().collect()),
            ..Default::default()
        };
        let res = repo.query(&filter, 500).await.unwrap();
        assert_eq!(res.len(), 1);
        assert_eq!(res[0].id, m2.id);
    }

    #[tokio::test]
    async fn addressable_keyed_by_d_tag() {
        let repo = MemoryRepo::new();
        let kp = keypair();
        let a1 = make(30_000, 100, vec![vec!["d".into(), "a".into()]], "1", &kp);
        let a2 = make(30_000, 200, vec![vec!["d".into(), "a".into()]], "2", &kp);
        let b1 = make(30_000, 150, vec![vec!["d".into(), "b".into()]], "3", &kp);
        repo.put(a1.clone()).await.unwrap();
        repo.put(a2.clone()).await.unwrap();
        repo.put(b1.clone()).await.unwrap();
        let filter = Filter {
            kinds: Some([30_000].into_iter().collect()),
            authors: Some([hex::encode(kp.x_only_public_key().0.serialize())].into_iter().collect()),
            ..Default::default()
        };
        let mut res = repo.query(&filter, 500).await.unwrap();
        res.sort_by_key(|e| e.d_tag().map(str::to_owned));
        assert_eq!(res.len(), 2);
        assert_eq!(res[0].id, a2.id);
        assert_eq!(res[1].id, b1.id);
    }

    #[tokio::test]
    async fn ephemeral_never_stored() {
        let repo = MemoryRepo::new();
        let kp = keypair();
        let ev = make(20_001, 100, vec![], "x", &kp);
        let r = repo.put(ev.clone()).await.unwrap();
        assert!(!r.stored && !r.duplicate);
        assert!(!repo.exists(&ev.id).await.unwrap());
    }

    #[tokio::test]
    async fn deletion_removes_target_by_same_author() {
        let repo = MemoryRepo::new();
        let kp = keypair();
        let target = make(1, 100, vec![], "hi", &kp);
        repo.put(target.clone()).await.unwrap();
        let del = make(5, 200, vec![vec!["e".into(), target.id.clone()]], "", &kp);
        repo.put(del).await.unwrap();
        assert!(!repo.exists(&target.id).await.unwrap());
    }

    #[tokio::test]
    async fn sweep_removes_expired() {
        let repo = MemoryRepo::new();
        let kp = keypair();
        let ev = make(1, 100, vec![vec!["expiration".into(), "150".into()]], "x", &kp);
        repo.put(ev.clone()).await.unwrap();
        let n = repo.sweep_expired(200).await.unwrap();
        assert_eq!(n, 1);
        assert!(!repo.exists(&ev.id).await.unwrap());
    }
}
