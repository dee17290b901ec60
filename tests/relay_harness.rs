//! Scripted in-memory relay harness covering spec.md §8's scenarios
//! S1-S9. Drives the validator, storage, subscription matching, and
//! dispatcher directly rather than over a real socket, the way the unit
//! tests in each module already exercise their own slice of this flow.
use atlas_relay::ban::BanTable;
use atlas_relay::config::Settings;
use atlas_relay::dispatch::Dispatcher;
use atlas_relay::event::{Event, Tag};
use atlas_relay::filter::Filter;
use atlas_relay::limiter::ConnLimiter;
use atlas_relay::repo::memory::MemoryRepo;
use atlas_relay::repo::NostrRepo;
use atlas_relay::subscription::Subscription;
use atlas_relay::validator::{self, Outcome};
use secp256k1::{rand, schnorr, KeyPair, Message, Secp256k1};
use std::time::{Duration, SystemTime};

fn signed(keypair: &KeyPair, kind: u64, tags: Vec<Tag>, content: &str, created_at: i64) -> Event {
    let secp = Secp256k1::new();
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

async fn accept(repo: &MemoryRepo, settings: &Settings, event: &mut Event, now: i64) -> (bool, String) {
    match validator::validate(event, repo, settings, now).await {
        Ok(Outcome::Accepted) => {
            let outcome = repo.put(event.clone()).await.unwrap();
            if outcome.duplicate {
                (true, "duplicate: event already exists".to_owned())
            } else {
                (true, String::new())
            }
        }
        Ok(Outcome::Duplicate) => (true, "duplicate: event already exists".to_owned()),
        Err(e) => (false, e.to_string()),
    }
}

#[tokio::test]
async fn s1_happy_path_stores_and_delivers_on_req() {
    let repo = MemoryRepo::new();
    let settings = Settings::default();
    let kp = keypair();
    let mut e1 = signed(&kp, 1, vec![], "hello", 1_700_000_000);

    let (ok, _msg) = accept(&repo, &settings, &mut e1, 1_700_000_000).await;
    assert!(ok);

    let pubkey = e1.pubkey.clone();
    let filter = Filter {
        kinds: Some([1].into_iter().collect()),
        authors: Some([pubkey].into_iter().collect()),
        limit: Some(10),
        ..Default::default()
    };
    let sub = Subscription::new("x".into(), vec![filter.clone()]).unwrap();
    let results = repo.query(&filter, filter.clamped_limit(settings.limits.max_limit)).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].id, e1.id);
    assert!(sub.interested_in_event(&e1));
}

#[tokio::test]
async fn s2_dedupe_resend_reports_duplicate_without_new_row() {
    let repo = MemoryRepo::new();
    let settings = Settings::default();
    let kp = keypair();
    let mut e1 = signed(&kp, 1, vec![], "hello", 1_700_000_000);

    let (ok1, msg1) = accept(&repo, &settings, &mut e1.clone(), 1_700_000_000).await;
    assert!(ok1);
    assert_eq!(msg1, "");

    let (ok2, msg2) = accept(&repo, &settings, &mut e1.clone(), 1_700_000_000).await;
    assert!(ok2);
    assert_eq!(msg2, "duplicate: event already exists");

    let filter = Filter {
        ids: Some([e1.id.clone()].into_iter().collect()),
        ..Default::default()
    };
    let results = repo.query(&filter, 100).await.unwrap();
    assert_eq!(results.len(), 1);
}

#[tokio::test]
async fn s3_future_timestamp_rejected_and_not_stored() {
    let repo = MemoryRepo::new();
    let settings = Settings::default();
    let kp = keypair();
    let now = 1_700_000_000;
    let mut ev = signed(&kp, 1, vec![], "too soon", now + 3600);

    let (ok, msg) = accept(&repo, &settings, &mut ev, now).await;
    assert!(!ok);
    assert_eq!(
        msg,
        format!(
            "event rejected: event timestamp is too far in the future (max {} seconds)",
            settings.limits.max_future_seconds
        )
    );
    assert!(!repo.exists(&ev.id).await.unwrap());
}

#[tokio::test]
async fn s4_replaceable_keeps_only_latest() {
    let repo = MemoryRepo::new();
    let settings = Settings::default();
    let kp = keypair();
    let mut m1 = signed(&kp, 0, vec![], r#"{"name":"old"}"#, 1_700_000_000);
    let mut m2 = signed(&kp, 0, vec![], r#"{"name":"new"}"#, 1_700_000_100);

    accept(&repo, &settings, &mut m1, 1_700_000_000).await;
    accept(&repo, &settings, &mut m2, 1_700_000_100).await;

    let filter = Filter {
        kinds: Some([0].into_iter().collect()),
        authors: Some([m2.pubkey.clone()].into_iter().collect()),
        ..Default::default()
    };
    let results = repo.query(&filter, 100).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].id, m2.id);
}

#[tokio::test]
async fn s5_addressable_keyed_by_pubkey_kind_d_tag() {
    let repo = MemoryRepo::new();
    let settings = Settings::default();
    let kp = keypair();
    let mut a1 = signed(&kp, 30_000, vec![vec!["d".into(), "a".into()]], "1", 1_700_000_000);
    let mut a2 = signed(&kp, 30_000, vec![vec!["d".into(), "a".into()]], "2", 1_700_000_100);
    let mut b1 = signed(&kp, 30_000, vec![vec!["d".into(), "b".into()]], "3", 1_700_000_050);

    accept(&repo, &settings, &mut a1, 1_700_000_000).await;
    accept(&repo, &settings, &mut a2, 1_700_000_100).await;
    accept(&repo, &settings, &mut b1, 1_700_000_050).await;

    let filter = Filter {
        kinds: Some([30_000].into_iter().collect()),
        authors: Some([a1.pubkey.clone()].into_iter().collect()),
        ..Default::default()
    };
    let mut results = repo.query(&filter, 100).await.unwrap();
    results.sort_by_key(|e| e.d_tag().map(str::to_owned));
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].id, a2.id);
    assert_eq!(results[1].id, b1.id);
}

#[tokio::test]
async fn s6_unauthorized_deletion_leaves_target_visible() {
    let repo = MemoryRepo::new();
    let settings = Settings::default();
    let author_a = keypair();
    let author_b = keypair();
    let mut e = signed(&author_a, 1, vec![], "mine", 1_700_000_000);
    accept(&repo, &settings, &mut e, 1_700_000_000).await;

    let mut deletion = signed(&author_b, 5, vec![vec!["e".into(), e.id.clone()]], "", 1_700_000_100);
    let (ok, msg) = accept(&repo, &settings, &mut deletion, 1_700_000_100).await;
    assert!(!ok);
    assert_eq!(msg, "unauthorized: only the event author can delete their events");
    assert!(repo.exists(&e.id).await.unwrap());
}

#[tokio::test]
async fn s7_ephemeral_delivered_live_never_stored() {
    let repo = MemoryRepo::new();
    let settings = Settings::default();
    let kp = keypair();
    let mut ev = signed(&kp, 20_001, vec![], "ephemeral", 1_700_000_000);

    let sub = Subscription::new("live".into(), vec![Filter {
        kinds: Some([20_001].into_iter().collect()),
        ..Default::default()
    }]).unwrap();

    let mut changes = repo.subscribe_changes();
    let (ok, _msg) = accept(&repo, &settings, &mut ev, 1_700_000_000).await;
    assert!(ok);

    let delivered = changes.recv().await.unwrap();
    assert_eq!(delivered.id, ev.id);
    assert!(sub.interested_in_event(&delivered));

    let filter = Filter {
        kinds: Some([20_001].into_iter().collect()),
        ..Default::default()
    };
    let stored = repo.query(&filter, 100).await.unwrap();
    assert!(stored.is_empty());
}

#[tokio::test]
async fn s8_rate_limit_violations_escalate_to_ban() {
    let settings = Settings::default();
    let mut throttling = settings.throttling.clone();
    throttling.ban_threshold = 3;
    let ban_table = BanTable::new(throttling);
    let limiter = ConnLimiter::new(Some(1), Some(1));
    let address = "203.0.113.9";
    let now = SystemTime::now();

    ban_table.on_connect(address, now);
    assert!(!ban_table.is_banned(address, now));

    let mut just_banned = false;
    for _ in 0..6 {
        if !limiter.check() {
            just_banned = ban_table.record_violation(address, now);
        }
    }
    assert!(just_banned);
    assert!(ban_table.is_banned(address, now));

    let later = now + Duration::from_secs(settings.throttling.ban_duration_seconds + 1);
    assert!(!ban_table.is_banned(address, later));
}

#[tokio::test]
async fn s9_cross_node_change_feed_fans_out_to_every_subscribed_node() {
    let repo = MemoryRepo::new();
    let settings = Settings::default();
    let kp = keypair();

    // Two simulated nodes, each with its own dispatcher, sharing one
    // backend's change feed — the in-memory stand-in for two relay
    // processes pointed at the same Postgres cluster.
    let node_a = Dispatcher::new();
    let node_b = Dispatcher::new();
    let (_client_a, mut rx_a) = node_a.add_client();
    let (_client_b, mut rx_b) = node_b.add_client();

    let mut changes_a = repo.subscribe_changes();
    let mut changes_b = repo.subscribe_changes();

    let mut ev = signed(&kp, 1, vec![], "published on node a", 1_700_000_000);
    let (ok, _msg) = accept(&repo, &settings, &mut ev, 1_700_000_000).await;
    assert!(ok);

    let seen_on_a = changes_a.recv().await.unwrap();
    let seen_on_b = changes_b.recv().await.unwrap();
    node_a.publish(&seen_on_a);
    node_b.publish(&seen_on_b);

    let delivered_a = rx_a.recv().await.unwrap();
    let delivered_b = rx_b.recv().await.unwrap();
    assert_eq!(delivered_a.id, ev.id);
    assert_eq!(delivered_b.id, ev.id);
}
