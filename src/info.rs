//! NIP-11 relay information document (spec.md §4.7), served on
//! `GET /` when the client sends `Accept: application/nostr+json`.
use crate::config::Settings;
use serde::Serialize;

pub const SOFTWARE: &str = "https://github.com/atlas-relay/atlas-relay";
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
const SUPPORTED_NIPS: &[u32] = &[1, 9, 11, 25, 26, 40, 45, 59];

#[derive(Debug, Clone, Serialize)]
pub struct RelayInfo {
    pub name: Option<String>,
    pub description: Option<String>,
    pub pubkey: Option<String>,
    pub contact: Option<String>,
    pub icon: Option<String>,
    pub banner: Option<String>,
    pub supported_nips: Vec<u32>,
    pub software: String,
    pub version: String,
    pub limitation: RelayLimitation,
}

#[derive(Debug, Clone, Serialize)]
pub struct RelayLimitation {
    pub max_message_length: usize,
    pub max_content_length: usize,
    pub max_subscriptions: usize,
    pub max_filters: usize,
    pub max_limit: usize,
    pub max_subid_length: usize,
    pub max_event_tags: usize,
    pub max_tags_length: usize,
    pub created_at_lower_limit: Option<i64>,
    pub created_at_upper_limit: i64,
}

impl RelayInfo {
    /// Build the live document from current settings and the relay's own
    /// public key; `limitation` always mirrors the live config, per
    /// spec.md's "limitations block ... mirror the live config value".
    #[must_use]
    pub fn from_settings(settings: &Settings, relay_pubkey: &str) -> RelayInfo {
        RelayInfo {
            name: settings.info.name.clone(),
            description: settings.info.description.clone(),
            pubkey: Some(settings.info.pubkey.clone().unwrap_or_else(|| relay_pubkey.to_owned())),
            contact: settings.info.contact.clone(),
            icon: settings.info.icon.clone(),
            banner: settings.info.banner.clone(),
            supported_nips: SUPPORTED_NIPS.to_vec(),
            software: SOFTWARE.to_owned(),
            version: VERSION.to_owned(),
            limitation: RelayLimitation {
                max_message_length: settings.limits.max_event_bytes.unwrap_or(settings.limits.max_content_length),
                max_content_length: settings.limits.max_content_length,
                max_subscriptions: settings.limits.max_subscriptions_per_connection,
                max_filters: settings.limits.max_filters_per_subscription,
                max_limit: settings.limits.max_limit,
                max_subid_length: crate::subscription::MAX_SUBSCRIPTION_ID_LEN,
                max_event_tags: settings.limits.max_tags_per_event,
                max_tags_length: settings.limits.max_tags_length,
                created_at_lower_limit: settings.limits.oldest_event_time,
                created_at_upper_limit: settings.limits.max_future_seconds,
            },
        }
    }

    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }
}

/// Content-type header value for the NIP-11 document response.
pub const NIP11_CONTENT_TYPE: &str = "application/nostr+json";
