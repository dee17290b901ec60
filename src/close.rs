//! A `CLOSE` command: removes a subscription.
use crate::error::Result;
use crate::subscription::validate_sub_id;
use serde::de::{self, SeqAccess, Visitor};
use serde::ser::SerializeSeq;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::convert::TryFrom;
use std::fmt;

/// Wire shape: `["CLOSE", <sub-id>]`. Hand-rolled (de)serialize so the
/// literal `"CLOSE"` tag is actually checked — see the note on
/// `EventCmd`'s `Deserialize` impl for why a derived struct can't do this
/// from a JSON array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseCmd {
    pub cmd: String,
    pub id: String,
}

/// The validated close request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Close {
    pub id: String,
}

impl TryFrom<CloseCmd> for Close {
    type Error = crate::error::Error;

    fn try_from(cc: CloseCmd) -> Result<Close> {
        validate_sub_id(&cc.id)?;
        Ok(Close { id: cc.id })
    }
}

impl<'de> Deserialize<'de> for CloseCmd {
    fn deserialize<D>(deserializer: D) -> std::result::Result<CloseCmd, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct CloseVisitor;

        impl<'de> Visitor<'de> for CloseVisitor {
            type Value = CloseCmd;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str(r#"a ["CLOSE", <sub-id>] array"#)
            }

            fn visit_seq<A>(self, mut seq: A) -> std::result::Result<CloseCmd, A::Error>
            where
                A: SeqAccess<'de>,
            {
                let cmd: String = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(0, &self))?;
                if cmd != "CLOSE" {
                    return Err(de::Error::custom("expected CLOSE command"));
                }
                let id: String = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(1, &self))?;
                Ok(CloseCmd { cmd, id })
            }
        }

        deserializer.deserialize_seq(CloseVisitor)
    }
}

impl Serialize for CloseCmd {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut seq = serializer.serialize_seq(Some(2))?;
        seq.serialize_element("CLOSE")?;
        seq.serialize_element(&self.id)?;
        seq.end()
    }
}
