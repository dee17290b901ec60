//! `COUNT`: NIP-45 cardinality queries. Wire shape mirrors `REQ` —
//! `["COUNT", <sub-id>, <filter>...]` — answered with a single `COUNT`
//! reply carrying the union cardinality across all filters (SPEC_FULL.md
//! §9 open-question resolution), never a stream of events.
use crate::error::{Error, Result};
use crate::filter::Filter;
use crate::subscription::validate_sub_id;
use serde::de::{self, SeqAccess, Visitor};
use serde::ser::SerializeSeq;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountCmd {
    pub id: String,
    pub filters: Vec<Filter>,
}

impl CountCmd {
    pub fn validate(self) -> Result<CountCmd> {
        validate_sub_id(&self.id)?;
        if self.filters.is_empty() {
            return Err(Error::InvalidFilter("at least one filter required".into()));
        }
        Ok(self)
    }
}

impl<'de> Deserialize<'de> for CountCmd {
    fn deserialize<D>(deserializer: D) -> std::result::Result<CountCmd, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct CountVisitor;

        impl<'de> Visitor<'de> for CountVisitor {
            type Value = CountCmd;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str(r#"a ["COUNT", <sub-id>, <filter>...] array"#)
            }

            fn visit_seq<A>(self, mut seq: A) -> std::result::Result<CountCmd, A::Error>
            where
                A: SeqAccess<'de>,
            {
                let cmd: String = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(0, &self))?;
                if cmd != "COUNT" {
                    return Err(de::Error::custom("expected COUNT command"));
                }
                let id: String = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(1, &self))?;
                let mut filters = Vec::new();
                while let Some(f) = seq.next_element::<Filter>()? {
                    filters.push(f);
                }
                Ok(CountCmd { id, filters })
            }
        }

        deserializer.deserialize_seq(CountVisitor)
    }
}

impl Serialize for CountCmd {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut seq = serializer.serialize_seq(Some(2 + self.filters.len()))?;
        seq.serialize_element("COUNT")?;
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

    #[test]
    fn parses_count_wire_array() {
        let json = r#"["COUNT","sub1",{"kinds":[1]}]"#;
        let cmd: CountCmd = serde_json::from_str(json).unwrap();
        assert_eq!(cmd.id, "sub1");
        assert_eq!(cmd.filters.len(), 1);
    }

    #[test]
    fn rejects_empty_filters_on_validate() {
        let cmd = CountCmd {
            id: "sub1".into(),
            filters: vec![],
        };
        assert!(cmd.validate().is_err());
    }

    #[test]
    fn rejects_wrong_tag() {
        let json = r#"["REQ","sub1",{"kinds":[1]}]"#;
        let res: Result<CountCmd> = serde_json::from_str(json).map_err(Into::into);
        assert!(res.is_err());
    }
}
