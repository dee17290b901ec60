//! Server-to-client reply frames: `NOTICE`, `OK`, `COUNT`.
use serde::Serialize;

/// The outcome reported in an `OK` reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Saved,
    Duplicate,
    Invalid,
    Blocked,
    Unauthorized,
    Error,
}

impl Status {
    #[must_use]
    pub fn to_bool(self) -> bool {
        matches!(self, Status::Saved | Status::Duplicate)
    }
}

#[derive(Debug, Clone)]
pub struct EventResult {
    pub id: String,
    pub status: Status,
    pub msg: String,
}

#[derive(Debug, Clone)]
pub struct CountResult {
    pub sub_id: String,
    pub count: u64,
}

/// Everything a background task might want to push back to a specific
/// client's write loop, outside the normal query-result channel.
#[derive(Debug, Clone)]
pub enum Notice {
    Message(String),
    EventResult(EventResult),
    Count(CountResult),
    Closed { sub_id: String, reason: String },
}

impl Notice {
    #[must_use]
    pub fn message(msg: String) -> Notice {
        Notice::Message(msg)
    }

    #[must_use]
    pub fn invalid(id: String, msg: &str) -> Notice {
        Notice::EventResult(EventResult {
            id,
            status: Status::Invalid,
            msg: format!("invalid: {msg}"),
        })
    }

    #[must_use]
    pub fn blocked(id: String, msg: &str) -> Notice {
        Notice::EventResult(EventResult {
            id,
            status: Status::Blocked,
            msg: format!("blocked: {msg}"),
        })
    }

    #[must_use]
    pub fn unauthorized(id: String, msg: &str) -> Notice {
        Notice::EventResult(EventResult {
            id,
            status: Status::Unauthorized,
            msg: format!("unauthorized: {msg}"),
        })
    }

    #[must_use]
    pub fn duplicate(id: String) -> Notice {
        Notice::EventResult(EventResult {
            id,
            status: Status::Duplicate,
            msg: "duplicate: event already exists".to_owned(),
        })
    }

    #[must_use]
    pub fn saved(id: String) -> Notice {
        Notice::EventResult(EventResult {
            id,
            status: Status::Saved,
            msg: String::new(),
        })
    }

    #[must_use]
    pub fn storage_error(id: String, msg: &str) -> Notice {
        Notice::EventResult(EventResult {
            id,
            status: Status::Error,
            msg: format!("error: {msg}"),
        })
    }

    #[must_use]
    pub fn closed(sub_id: String, reason: &str) -> Notice {
        Notice::Closed {
            sub_id,
            reason: reason.to_owned(),
        }
    }

    /// Render as the JSON array the wire protocol expects.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Notice::Message(msg) => serde_json::json!(["NOTICE", msg]),
            Notice::EventResult(res) => {
                serde_json::json!(["OK", res.id, res.status.to_bool(), res.msg])
            }
            Notice::Count(res) => {
                serde_json::json!(["COUNT", res.sub_id, { "count": res.count }])
            }
            Notice::Closed { sub_id, reason } => serde_json::json!(["CLOSED", sub_id, reason]),
        }
    }
}

impl Serialize for Notice {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.to_json().serialize(serializer)
    }
}
