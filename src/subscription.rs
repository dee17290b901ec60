//! A `Subscription`: a named, live filter set owned by one connection.
use crate::error::{Error, Result};
use crate::event::Event;
use crate::filter::Filter;
use serde::de::{self, SeqAccess, Visitor};
use serde::ser::SerializeSeq;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

pub const MAX_SUBSCRIPTION_ID_LEN: usize = 256;

/// A live filter set owned by one connection, named by its subscription
/// id. Wire shape is the variable-length array `["REQ", <sub-id>,
/// <filter>...]`, so (de)serialization is hand-rolled rather than derived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub id: String,
    pub filters: Vec<Filter>,
}

impl Subscription {
    pub fn new(id: String, filters: Vec<Filter>) -> Result<Subscription> {
        validate_sub_id(&id)?;
        if filters.is_empty() {
            return Err(Error::InvalidFilter("at least one filter required".into()));
        }
        Ok(Subscription { id, filters })
    }

    /// Re-runs the checks `new` applies, against a `Subscription` built
    /// by `Deserialize` (which has to accept a bare sub-id or zero
    /// filters to report a useful parse error rather than a generic one).
    /// Callers installing a subscription must go through this, the same
    /// way `CountCmd::validate` gates `COUNT` and `Close::try_from` gates
    /// `CLOSE`.
    pub fn validate(self) -> Result<Subscription> {
        Subscription::new(self.id, self.filters)
    }

    /// An event matches the subscription when it matches *any* filter
    /// (filters combine disjunctively).
    #[must_use]
    pub fn interested_in_event(&self, event: &Event) -> bool {
        self.filters.iter().any(|f| f.matches(event))
    }
}

pub fn validate_sub_id(id: &str) -> Result<()> {
    if id.is_empty() || id.len() > MAX_SUBSCRIPTION_ID_LEN {
        return Err(Error::InvalidSubscriptionId);
    }
    Ok(())
}

impl<'de> Deserialize<'de> for Subscription {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Subscription, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct ReqVisitor;

        impl<'de> Visitor<'de> for ReqVisitor {
            type Value = Subscription;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str(r#"a ["REQ", <sub-id>, <filter>...] array"#)
            }

            fn visit_seq<A>(self, mut seq: A) -> std::result::Result<Subscription, A::Error>
            where
                A: SeqAccess<'de>,
            {
                let cmd: String = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(0, &self))?;
                if cmd != "REQ" {
                    return Err(de::Error::custom("expected REQ command"));
                }
                let id: String = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(1, &self))?;
                let mut filters = Vec::new();
                while let Some(f) = seq.next_element::<Filter>()? {
                    filters.push(f);
                }
                Ok(Subscription { id, filters })
            }
        }

        deserializer.deserialize_seq(ReqVisitor)
    }
}

impl Serialize for Subscription {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut seq = serializer.serialize_seq(Some(2 + self.filters.len()))?;
        seq.serialize_element("REQ")?;
        seq.serialize_element(&self.id)?;
        for f in &self.filters {
            seq.serialize_element(f)?;
        }
        seq.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Tag;

    fn ev(kind: u64) -> Event {
        Event {
            id: "0".repeat(64),
            pubkey: "1".repeat(64),
            created_at: 0,
            kind,
            tags: Vec::<Tag>::new(),
            content: String::new(),
            sig: "0".repeat(128),
            delegated_by: None,
        }
    }

    #[test]
    fn matches_any_filter() {
        let mut f1 = Filter::default();
        f1.kinds = Some([1].into_iter().collect());
        let mut f2 = Filter::default();
        f2.kinds = Some([2].into_iter().collect());
        let sub = Subscription::new("s".into(), vec![f1, f2]).unwrap();
        assert!(sub.interested_in_event(&ev(1)));
        assert!(sub.interested_in_event(&ev(2)));
        assert!(!sub.interested_in_event(&ev(3)));
    }

    #[test]
    fn empty_filters_rejected() {
        assert!(Subscription::new("s".into(), vec![]).is_err());
    }

    #[test]
    fn empty_id_rejected() {
        let f = Filter::default();
        assert!(Subscription::new(String::new(), vec![f]).is_err());
    }

    #[test]
    fn parses_req_wire_array() {
        let json = r#"["REQ","sub1",{"kinds":[1]},{"authors":["abc"]}]"#;
        let sub: Subscription = serde_json::from_str(json).unwrap();
        assert_eq!(sub.id, "sub1");
        assert_eq!(sub.filters.len(), 2);
    }

    #[test]
    fn rejects_wrong_command_tag() {
        let json = r#"["CLOSE","sub1",{"kinds":[1]}]"#;
        let res: Result<Subscription> = serde_json::from_str(json).map_err(Into::into);
        assert!(res.is_err());
    }

    #[test]
    fn req_with_no_filters_parses_empty_but_fails_validate() {
        let json = r#"["REQ","sub1"]"#;
        let sub: Subscription = serde_json::from_str(json).unwrap();
        assert_eq!(sub.filters.len(), 0);
        assert!(sub.validate().is_err());
    }

    #[test]
    fn oversized_sub_id_fails_validate() {
        let json = format!(r#"["REQ","{}",{{"kinds":[1]}}]"#, "a".repeat(MAX_SUBSCRIPTION_ID_LEN + 1));
        let sub: Subscription = serde_json::from_str(&json).unwrap();
        assert!(sub.validate().is_err());
    }

    #[test]
    fn round_trips_through_serialize() {
        let sub = Subscription::new("sub1".into(), vec![Filter::default()]).unwrap();
        let json = serde_json::to_string(&sub).unwrap();
        let back: Subscription = serde_json::from_str(&json).unwrap();
        assert_eq!(sub, back);
    }
}
