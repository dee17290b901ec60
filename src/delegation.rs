//! NIP-26 delegation: a delegator can authorize a delegate pubkey to
//! publish events on their behalf, bounded by a condition string.
use crate::error::{Error, Result};
use crate::event::Event;
use bitcoin_hashes::{sha256, Hash};
use secp256k1::{schnorr, Message, Secp256k1, XOnlyPublicKey};

/// A parsed `delegation` tag: `["delegation", delegator_pubkey, conditions, sig]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelegationTag {
    pub delegator_pubkey: String,
    pub conditions: String,
    pub sig: String,
}

impl DelegationTag {
    #[must_use]
    pub fn from_event(event: &Event) -> Option<DelegationTag> {
        let tag = event.tags.iter().find(|t| t.first().map(String::as_str) == Some("delegation"))?;
        Some(DelegationTag {
            delegator_pubkey: tag.get(1)?.to_lowercase(),
            conditions: tag.get(2)?.clone(),
            sig: tag.get(3)?.to_lowercase(),
        })
    }

    /// The digest the delegator actually signed:
    /// `sha256("nostr:delegation:" + delegate_pubkey + ":" + conditions)`.
    #[must_use]
    pub fn digest(&self, delegate_pubkey: &str) -> [u8; 32] {
        let token = format!("nostr:delegation:{delegate_pubkey}:{}", self.conditions);
        sha256::Hash::hash(token.as_bytes()).into_inner()
    }

    /// Parse `&`-joined `key=value` / `key>value` / `key<value` clauses and
    /// check the event against each.
    fn conditions_satisfied(&self, event: &Event) -> bool {
        for clause in self.conditions.split('&') {
            if clause.is_empty() {
                continue;
            }
            let ok = if let Some(v) = clause.strip_prefix("kind=") {
                v.parse::<u64>().map(|k| k == event.kind).unwrap_or(false)
            } else if let Some(v) = clause.strip_prefix("created_at>") {
                v.parse::<i64>().map(|t| event.created_at > t).unwrap_or(false)
            } else if let Some(v) = clause.strip_prefix("created_at<") {
                v.parse::<i64>().map(|t| event.created_at < t).unwrap_or(false)
            } else {
                // unknown clause: fail closed.
                false
            };
            if !ok {
                return false;
            }
        }
        true
    }

    /// Verify the delegator's signature over the conditions digest, and
    /// that the event satisfies those conditions. Returns the delegator's
    /// pubkey on success, so callers can attribute deletion authority etc.
    /// to the delegator rather than the signing pubkey.
    pub fn verify(&self, event: &Event) -> Result<String> {
        if !self.conditions_satisfied(event) {
            return Err(Error::Invalid("invalid delegation".into()));
        }
        let secp = Secp256k1::verification_only();
        let digest = self.digest(&event.pubkey);
        let msg = Message::from_slice(&digest).map_err(|_| Error::Invalid("invalid delegation".into()))?;
        let sig_bytes = hex::decode(&self.sig).map_err(|_| Error::Invalid("invalid delegation".into()))?;
        let sig = schnorr::Signature::from_slice(&sig_bytes)
            .map_err(|_| Error::Invalid("invalid delegation".into()))?;
        let pk_bytes =
            hex::decode(&self.delegator_pubkey).map_err(|_| Error::Invalid("invalid delegation".into()))?;
        let pubkey = XOnlyPublicKey::from_slice(&pk_bytes)
            .map_err(|_| Error::Invalid("invalid delegation".into()))?;
        secp.verify_schnorr(&sig, &msg, &pubkey)
            .map_err(|_| Error::Invalid("invalid delegation".into()))?;
        Ok(self.delegator_pubkey.clone())
    }
}
