//! The `Event`: the content-addressed, signed unit exchanged by the
//! protocol, and `EventCmd`, its raw wire representation.
use crate::error::{Error, Result};
use bitcoin_hashes::{sha256, Hash};
use secp256k1::{schnorr, Message, Secp256k1, XOnlyPublicKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::convert::TryFrom;

lazy_static::lazy_static! {
    static ref SECP: Secp256k1<secp256k1::VerifyOnly> = Secp256k1::verification_only();
}

/// A tag is an ordered sequence of strings; the first element is its name.
pub type Tag = Vec<String>;

/// An immutable, content-addressed Nostr event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Event {
    pub id: String,
    pub pubkey: String,
    pub created_at: i64,
    pub kind: u64,
    pub tags: Vec<Tag>,
    pub content: String,
    pub sig: String,
    /// Populated by storage on read; never part of the wire event itself.
    #[serde(skip)]
    pub delegated_by: Option<String>,
}

/// Kind-range classification. Ranges carry semantics, not literal values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KindClass {
    Regular,
    Replaceable,
    Addressable,
    Ephemeral,
}

impl Event {
    /// Classify this event's kind per spec.md §3 "Kind ranges".
    #[must_use]
    pub fn kind_class(&self) -> KindClass {
        classify_kind(self.kind)
    }

    #[must_use]
    pub fn is_ephemeral(&self) -> bool {
        self.kind_class() == KindClass::Ephemeral
    }

    #[must_use]
    pub fn is_replaceable(&self) -> bool {
        self.kind_class() == KindClass::Replaceable
    }

    #[must_use]
    pub fn is_addressable(&self) -> bool {
        self.kind_class() == KindClass::Addressable
    }

    /// Deletion events are kind 5.
    #[must_use]
    pub fn is_deletion(&self) -> bool {
        self.kind == 5
    }

    /// First value of the first tag named `name`, if any.
    #[must_use]
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.first().map(String::as_str) == Some(name))
            .and_then(|t| t.get(1))
            .map(String::as_str)
    }

    /// All first-values of tags named `name`.
    pub fn tag_values<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a str> {
        self.tags
            .iter()
            .filter(move |t| t.first().map(String::as_str) == Some(name))
            .filter_map(|t| t.get(1))
            .map(String::as_str)
    }

    /// The `d` tag value for addressable events, if any.
    #[must_use]
    pub fn d_tag(&self) -> Option<&str> {
        self.tag_value("d")
    }

    /// Whether this event carries an `expiration` tag that has already
    /// elapsed at `now`.
    #[must_use]
    pub fn is_expired(&self, now: i64) -> bool {
        self.tag_value("expiration")
            .and_then(|v| v.parse::<i64>().ok())
            .is_some_and(|exp| exp <= now)
    }

    #[must_use]
    pub fn expiration(&self) -> Option<i64> {
        self.tag_value("expiration").and_then(|v| v.parse().ok())
    }

    /// `created_at` is within `[now - OldestEventTime.., now + max_future]`.
    #[must_use]
    pub fn is_valid_timestamp(&self, now: i64, max_future_seconds: Option<i64>) -> bool {
        match max_future_seconds {
            Some(secs) => self.created_at <= now + secs,
            None => true,
        }
    }

    /// NIP-01 canonical serialization used to compute `id`:
    /// `[0, pubkey, created_at, kind, tags, content]`, compact JSON, UTF-8.
    #[must_use]
    pub fn canonical(&self) -> String {
        let v = serde_json::json!([
            0,
            self.pubkey,
            self.created_at,
            self.kind,
            self.tags,
            self.content,
        ]);
        // serde_json's default Display for `Value` already omits
        // insignificant whitespace.
        v.to_string()
    }

    /// SHA-256 of the canonical serialization, lowercase hex.
    #[must_use]
    pub fn compute_id(&self) -> String {
        let digest = sha256::Hash::hash(self.canonical().as_bytes());
        hex::encode(digest.into_inner())
    }

    /// Verify `id == H(canonical(self))`.
    #[must_use]
    pub fn id_matches(&self) -> bool {
        self.compute_id() == self.id
    }

    /// Verify the schnorr signature over `id` under `pubkey`.
    pub fn verify_signature(&self) -> Result<()> {
        let id_bytes = hex::decode(&self.id).map_err(|_| Error::InvalidEventId(self.id.clone()))?;
        if id_bytes.len() != 32 {
            return Err(Error::InvalidEventId(self.id.clone()));
        }
        let msg = Message::from_slice(&id_bytes).map_err(|_| Error::InvalidSignature)?;
        let sig_bytes = hex::decode(&self.sig).map_err(|_| Error::InvalidSignature)?;
        let sig =
            schnorr::Signature::from_slice(&sig_bytes).map_err(|_| Error::InvalidSignature)?;
        let pk_bytes = hex::decode(&self.pubkey).map_err(|_| Error::InvalidSignature)?;
        let pubkey =
            XOnlyPublicKey::from_slice(&pk_bytes).map_err(|_| Error::InvalidSignature)?;
        SECP.verify_schnorr(&sig, &msg, &pubkey)
            .map_err(|_| Error::InvalidSignature)
    }

    /// First 8 hex characters of the id, used in logs.
    #[must_use]
    pub fn get_event_id_prefix(&self) -> String {
        self.id.chars().take(8).collect()
    }
}

/// Kind ranges per NIP-01: 0/3 + 10000..=19999 replaceable,
/// 20000..=29999 ephemeral, 30000..=39999 addressable, else regular.
#[must_use]
pub fn classify_kind(kind: u64) -> KindClass {
    match kind {
        0 | 3 => KindClass::Replaceable,
        10_000..=19_999 => KindClass::Replaceable,
        20_000..=29_999 => KindClass::Ephemeral,
        30_000..=39_999 => KindClass::Addressable,
        _ => KindClass::Regular,
    }
}

/// The raw wire shape of an `EVENT` command's payload:
/// `["EVENT", {...}]` deserializes its second element into this, then
/// `TryFrom` performs structural validation and recomputes `id`/verifies
/// `sig` (spec.md §4.3 items 1-2).
///
/// `Deserialize` is hand-rolled (rather than derived from a two-field
/// struct) so the leading `"EVENT"` literal is actually checked: a derived
/// struct deserialized from a JSON array just reads positionally and
/// never looks at the `#[serde(rename = ...)]`, which only applies to
/// map keys — without this, any two-element command array would parse as
/// an `EventCmd`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct EventCmd {
    pub cmd: String,
    pub event: Value,
}

impl EventCmd {
    /// Best-effort id extracted from the raw payload, used to report
    /// failures before the event is fully parsed.
    #[must_use]
    pub fn event_id(&self) -> String {
        self.event
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned()
    }
}

impl<'de> serde::Deserialize<'de> for EventCmd {
    fn deserialize<D>(deserializer: D) -> std::result::Result<EventCmd, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::{self, SeqAccess, Visitor};
        use std::fmt;

        struct EventCmdVisitor;

        impl<'de> Visitor<'de> for EventCmdVisitor {
            type Value = EventCmd;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str(r#"an ["EVENT", {...}] array"#)
            }

            fn visit_seq<A>(self, mut seq: A) -> std::result::Result<EventCmd, A::Error>
            where
                A: SeqAccess<'de>,
            {
                let cmd: String = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(0, &self))?;
                if cmd != "EVENT" {
                    return Err(de::Error::custom("expected EVENT command"));
                }
                let event: Value = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(1, &self))?;
                Ok(EventCmd { cmd, event })
            }
        }

        deserializer.deserialize_seq(EventCmdVisitor)
    }
}

fn is_hex_of_len(s: &str, len: usize) -> bool {
    s.len() == len && s.bytes().all(|b| b.is_ascii_hexdigit())
}

impl TryFrom<EventCmd> for Event {
    type Error = Error;

    fn try_from(cmd: EventCmd) -> Result<Event> {
        let mut event: Event = serde_json::from_value(cmd.event)?;
        event.pubkey = event.pubkey.to_lowercase();
        event.id = event.id.to_lowercase();
        event.sig = event.sig.to_lowercase();

        if !is_hex_of_len(&event.id, 64) {
            return Err(Error::InvalidEventId(event.id));
        }
        if !is_hex_of_len(&event.pubkey, 64) {
            return Err(Error::Invalid(
                "invalid: pubkey must be 64 hex characters".into(),
            ));
        }
        if !is_hex_of_len(&event.sig, 128) {
            return Err(Error::Invalid(
                "invalid: sig must be 128 hex characters".into(),
            ));
        }
        for tag in &event.tags {
            if tag.is_empty() {
                return Err(Error::Invalid("invalid: tag must have >=1 element".into()));
            }
        }
        if !event.id_matches() {
            return Err(Error::EventIdMismatch);
        }
        event.verify_signature()?;
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secp256k1::{rand, schnorr, KeyPair, Secp256k1};

    fn signed_event(kind: u64, tags: Vec<Tag>, content: &str, created_at: i64) -> Event {
        let secp = Secp256k1::new();
        let mut rng = rand::thread_rng();
        let keypair = KeyPair::new(&secp, &mut rng);
        let (xonly, _parity) = keypair.x_only_public_key();
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

    #[test]
    fn id_matches_canonical_hash() {
        let ev = signed_event(1, vec![], "hello", 1_700_000_000);
        assert!(ev.id_matches());
    }

    #[test]
    fn signature_verifies() {
        let ev = signed_event(1, vec![], "hello", 1_700_000_000);
        assert!(ev.verify_signature().is_ok());
    }

    #[test]
    fn tampering_breaks_id() {
        let mut ev = signed_event(1, vec![], "hello", 1_700_000_000);
        ev.content = "tampered".to_owned();
        assert!(!ev.id_matches());
    }

    #[test]
    fn kind_classification_ranges() {
        assert_eq!(classify_kind(1), KindClass::Regular);
        assert_eq!(classify_kind(0), KindClass::Replaceable);
        assert_eq!(classify_kind(3), KindClass::Replaceable);
        assert_eq!(classify_kind(10_002), KindClass::Replaceable);
        assert_eq!(classify_kind(20_001), KindClass::Ephemeral);
        assert_eq!(classify_kind(30_000), KindClass::Addressable);
    }

    #[test]
    fn expiration_tag_detection() {
        let ev = signed_event(1, vec![vec!["expiration".into(), "100".into()]], "x", 50);
        assert!(ev.is_expired(200));
        assert!(!ev.is_expired(50));
    }

    #[test]
    fn try_from_event_cmd_rejects_bad_id() {
        let mut ev = signed_event(1, vec![], "hello", 1_700_000_000);
        ev.id = "00".repeat(32);
        let cmd = EventCmd {
            cmd: "EVENT".into(),
            event: serde_json::to_value(&ev).unwrap(),
        };
        let res = Event::try_from(cmd);
        assert!(matches!(res, Err(Error::EventIdMismatch)));
    }
}
