//! The validator: structural, cryptographic, and per-kind rules
//! (spec.md §4.3). Pure with respect to storage writes — it only reads.
use crate::config::Settings;
use crate::delegation::DelegationTag;
use crate::error::{Error, Result};
use crate::event::Event;
use crate::kind_rules::missing_required_tags;
use crate::repo::NostrRepo;
use serde_json::Value;
use std::time::Duration;

// `validate` and its helpers are generic over `R: NostrRepo + ?Sized` rather
// than taking `&dyn NostrRepo` directly: this lets callers pass either a
// concrete repo (tests) or `repo.as_ref()` off an `Arc<dyn NostrRepo>`
// (the server) without needing a second, unrelated trait object type to
// coerce into — `&dyn NostrRepo` already satisfies `R = dyn NostrRepo`.

/// Outcome of a successful validation pass. `Duplicate` means the client
/// still gets an `OK id true ...` reply but the event must not be
/// re-dispatched or re-stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Accepted,
    Duplicate,
}

/// Runs all rule classes from spec.md §4.3 against `event`, in the order
/// the spec lists them (structural/crypto already happened in
/// `Event::try_from(EventCmd)` by the time this runs).
pub async fn validate<R: NostrRepo + ?Sized>(
    event: &mut Event,
    repo: &R,
    settings: &Settings,
    now: i64,
) -> Result<Outcome> {
    structural_limits(event, settings)?;

    if event.created_at > now + settings.limits.max_future_seconds {
        return Err(Error::Invalid(format!(
            "event timestamp is too far in the future (max {} seconds)",
            settings.limits.max_future_seconds
        )));
    }
    if let Some(oldest) = settings.limits.oldest_event_time {
        if event.created_at < oldest {
            return Err(Error::Invalid("event timestamp is too old".into()));
        }
    }

    policy_lists(event, settings)?;

    if event.is_expired(now) {
        return Err(Error::Expired);
    }

    if dedupe_probe(event, repo).await? {
        return Ok(Outcome::Duplicate);
    }

    let missing = missing_required_tags(event);
    if !missing.is_empty() {
        return Err(Error::Invalid(format!(
            "missing required tag(s): {}",
            missing.join(", ")
        )));
    }

    // Resolve delegation first: a valid delegation tag makes the event
    // authored, for every downstream authority check, by the delegator.
    if let Some(delegation) = DelegationTag::from_event(event) {
        let delegator = delegation
            .verify(event)
            .map_err(|_| Error::Invalid("invalid delegation".into()))?;
        event.delegated_by = Some(delegator);
    }

    if event.is_deletion() {
        deletion_authority(event, repo).await?;
    }

    if event.kind == 0 {
        metadata_content(event)?;
    }

    Ok(Outcome::Accepted)
}

/// The pubkey that should be treated as this event's author for
/// ownership/authority checks: the delegator if a delegation tag
/// verified, otherwise the signer.
#[must_use]
pub fn effective_author(event: &Event) -> &str {
    event.delegated_by.as_deref().unwrap_or(&event.pubkey)
}

fn structural_limits(event: &Event, settings: &Settings) -> Result<()> {
    if event.tags.len() > settings.limits.max_tags_per_event {
        return Err(Error::Invalid("too many tags".into()));
    }
    let mut total_bytes = 0usize;
    for tag in &event.tags {
        if tag.len() > settings.limits.max_tag_elements {
            return Err(Error::Invalid("too many elements in tag".into()));
        }
        total_bytes += tag.iter().map(String::len).sum::<usize>();
    }
    if total_bytes > settings.limits.max_tags_length {
        return Err(Error::Invalid("tags too large".into()));
    }
    if event.content.len() > settings.limits.max_content_length {
        return Err(Error::Invalid("content too large".into()));
    }
    if let Some(allowed) = &settings.limits.allowed_kinds {
        if !allowed.contains(&event.kind) {
            return Err(Error::Blocked("kind not accepted by this relay".into()));
        }
    }
    Ok(())
}

fn policy_lists(event: &Event, settings: &Settings) -> Result<()> {
    if let Some(blacklist) = &settings.policy.blacklist_pubkeys {
        if blacklist.iter().any(|p| p.eq_ignore_ascii_case(&event.pubkey)) {
            return Err(Error::Blocked("pubkey is blocked".into()));
        }
    }
    if let Some(whitelist) = &settings.policy.whitelist_pubkeys {
        if !whitelist.is_empty() && !whitelist.iter().any(|p| p.eq_ignore_ascii_case(&event.pubkey)) {
            return Err(Error::Blocked("pubkey is not on the whitelist".into()));
        }
    }
    Ok(())
}

/// Dedupe probe with a 5s deadline and up to two retries spaced 100ms
/// (spec.md §5 timeouts).
async fn dedupe_probe<R: NostrRepo + ?Sized>(event: &Event, repo: &R) -> Result<bool> {
    let mut attempt = 0;
    loop {
        let probe = tokio::time::timeout(Duration::from_secs(5), repo.exists(&event.id)).await;
        match probe {
            Ok(Ok(exists)) => return Ok(exists),
            Ok(Err(e)) if attempt < 2 => {
                attempt += 1;
                tracing::debug!("dedupe probe error, retrying ({attempt}): {:?}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            Ok(Err(e)) => return Err(e),
            Err(_) if attempt < 2 => {
                attempt += 1;
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            Err(_) => return Err(Error::CustomError("dedupe probe timed out".into())),
        }
    }
}

async fn deletion_authority<R: NostrRepo + ?Sized>(event: &Event, repo: &R) -> Result<()> {
    let requester = effective_author(event);
    for target_id in event.tag_values("e") {
        if let Some(target) = repo.get_by_id(target_id).await? {
            if effective_author(&target) != requester {
                return Err(Error::Unauthorized(
                    "only the event author can delete their events".into(),
                ));
            }
        }
    }
    Ok(())
}

fn metadata_content(event: &Event) -> Result<()> {
    let parsed: Value = serde_json::from_str(&event.content)
        .map_err(|_| Error::Invalid("metadata content must be a JSON object".into()))?;
    let obj = parsed
        .as_object()
        .ok_or_else(|| Error::Invalid("metadata content must be a JSON object".into()))?;
    if let Some(name) = obj.get("name").and_then(Value::as_str) {
        if name.len() > 100 {
            return Err(Error::Invalid("metadata name too long".into()));
        }
    }
    if let Some(about) = obj.get("about").and_then(Value::as_str) {
        if about.len() > 500 {
            return Err(Error::Invalid("metadata about too long".into()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Tag;
    use crate::repo::memory::MemoryRepo;
    use crate::repo::NostrRepo;
    use secp256k1::{rand, schnorr, KeyPair, Message, Secp256k1};

    fn signed(kind: u64, tags: Vec<Tag>, content: &str, created_at: i64) -> Event {
        let secp = Secp256k1::new();
        let mut rng = rand::thread_rng();
        let keypair = KeyPair::new(&secp, &mut rng);
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
        let sig: schnorr::Signature = secp.sign_schnorr(&msg, &keypair);
        ev.sig = hex::encode(sig.as_ref());
        ev
    }

    #[tokio::test]
    async fn accepts_plain_text_note() {
        let repo = MemoryRepo::new();
        let settings = Settings::default();
        let mut ev = signed(1, vec![], "hello", 1_700_000_000);
        let outcome = validate(&mut ev, &repo, &settings, 1_700_000_000).await.unwrap();
        assert_eq!(outcome, Outcome::Accepted);
    }

    #[tokio::test]
    async fn rejects_far_future_timestamp() {
        let repo = MemoryRepo::new();
        let settings = Settings::default();
        let mut ev = signed(1, vec![], "hello", 1_700_003_600);
        let err = validate(&mut ev, &repo, &settings, 1_700_000_000).await.unwrap_err();
        assert!(matches!(err, Error::Invalid(_)));
    }

    #[tokio::test]
    async fn detects_duplicate() {
        let repo = MemoryRepo::new();
        let settings = Settings::default();
        let mut ev = signed(1, vec![], "hello", 1_700_000_000);
        repo.put(ev.clone()).await.unwrap();
        let outcome = validate(&mut ev, &repo, &settings, 1_700_000_000).await.unwrap();
        assert_eq!(outcome, Outcome::Duplicate);
    }

    #[tokio::test]
    async fn rejects_unauthorized_deletion() {
        let repo = MemoryRepo::new();
        let settings = Settings::default();
        let author = signed(1, vec![], "mine", 1_700_000_000);
        repo.put(author.clone()).await.unwrap();
        let mut deletion = signed(5, vec![vec!["e".into(), author.id.clone()]], "", 1_700_000_100);
        let err = validate(&mut deletion, &repo, &settings, 1_700_000_100).await.unwrap_err();
        assert!(matches!(err, Error::Unauthorized(_)));
    }

    #[tokio::test]
    async fn rejects_missing_required_tag() {
        let repo = MemoryRepo::new();
        let settings = Settings::default();
        let mut ev = signed(5, vec![], "", 1_700_000_000);
        let err = validate(&mut ev, &repo, &settings, 1_700_000_000).await.unwrap_err();
        assert!(matches!(err, Error::Invalid(_)));
    }

    #[tokio::test]
    async fn rejects_non_object_metadata() {
        let repo = MemoryRepo::new();
        let settings = Settings::default();
        let mut ev = signed(0, vec![], "not json", 1_700_000_000);
        let err = validate(&mut ev, &repo, &settings, 1_700_000_000).await.unwrap_err();
        assert!(matches!(err, Error::Invalid(_)));
    }

    #[tokio::test]
    async fn blocked_pubkey_rejected() {
        let repo = MemoryRepo::new();
        let mut settings = Settings::default();
        let mut ev = signed(1, vec![], "hi", 1_700_000_000);
        settings.policy.blacklist_pubkeys = Some(vec![ev.pubkey.clone()]);
        let err = validate(&mut ev, &repo, &settings, 1_700_000_000).await.unwrap_err();
        assert!(matches!(err, Error::Blocked(_)));
    }
}
