//! The `Filter`: a conjunctive selector over event dimensions.
use crate::event::Event;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// A selector with optional sets/intervals; a filter matches an event when
/// every specified dimension is satisfied (spec.md §4.5).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Filter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ids: Option<HashSet<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authors: Option<HashSet<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kinds: Option<HashSet<u64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    /// Tag-value sets keyed by tag filter key (e.g. `#e`, `#p`); any field
    /// not recognised above lands here via serde's flatten.
    #[serde(flatten)]
    pub tags: HashMap<String, HashSet<String>>,
}

impl Filter {
    /// Clamp `limit` to the relay's configured `max_limit`.
    #[must_use]
    pub fn clamped_limit(&self, max_limit: usize) -> usize {
        self.limit.map_or(max_limit, |l| l.min(max_limit))
    }

    /// Core matching predicate (spec.md §4.5 "Filter matching algorithm").
    #[must_use]
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.contains(&event.id) {
                return false;
            }
        }
        if let Some(authors) = &self.authors {
            if !authors.contains(&event.pubkey) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if event.created_at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if event.created_at > until {
                return false;
            }
        }
        for (key, values) in &self.tags {
            let name = key.trim_start_matches('#');
            let matched = event
                .tag_values(name)
                .any(|v| values.contains(v));
            if !matched {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Tag;

    fn event(id: &str, pubkey: &str, kind: u64, created_at: i64, tags: Vec<Tag>) -> Event {
        Event {
            id: id.to_owned(),
            pubkey: pubkey.to_owned(),
            created_at,
            kind,
            tags,
            content: String::new(),
            sig: "0".repeat(128),
            delegated_by: None,
        }
    }

    #[test]
    fn empty_filter_matches_everything() {
        let f = Filter::default();
        assert!(f.matches(&event("a", "b", 1, 0, vec![])));
    }

    #[test]
    fn ids_authors_kinds_restrict() {
        let mut f = Filter::default();
        f.ids = Some(["a".to_owned()].into_iter().collect());
        assert!(f.matches(&event("a", "b", 1, 0, vec![])));
        assert!(!f.matches(&event("x", "b", 1, 0, vec![])));

        let mut f = Filter::default();
        f.kinds = Some([1].into_iter().collect());
        assert!(!f.matches(&event("a", "b", 2, 0, vec![])));
    }

    #[test]
    fn since_until_bound_timestamp() {
        let mut f = Filter::default();
        f.since = Some(100);
        f.until = Some(200);
        assert!(f.matches(&event("a", "b", 1, 150, vec![])));
        assert!(!f.matches(&event("a", "b", 1, 50, vec![])));
        assert!(!f.matches(&event("a", "b", 1, 250, vec![])));
    }

    #[test]
    fn tag_filter_matches_tag_value() {
        let mut tags = HashMap::new();
        tags.insert("#e".to_owned(), ["deadbeef".to_owned()].into_iter().collect());
        let f = Filter {
            tags,
            ..Default::default()
        };
        let ev = event("a", "b", 1, 0, vec![vec!["e".into(), "deadbeef".into()]]);
        assert!(f.matches(&ev));
        let ev2 = event("a", "b", 1, 0, vec![vec!["e".into(), "other".into()]]);
        assert!(!f.matches(&ev2));
    }

    #[test]
    fn limit_is_clamped() {
        let mut f = Filter::default();
        f.limit = Some(10_000);
        assert_eq!(f.clamped_limit(500), 500);
        f.limit = Some(10);
        assert_eq!(f.clamped_limit(500), 10);
        let f = Filter::default();
        assert_eq!(f.clamped_limit(500), 500);
    }
}
