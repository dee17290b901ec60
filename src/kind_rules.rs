//! Extensible registry mapping event kinds to their required tag names.
//!
//! Design note §9: "an extensible registry mapping kinds to validator
//! functions is preferable to a long conditional; rules are data."
use crate::event::Event;

/// Required single-letter tag names for a given kind, or an empty slice if
/// the kind has no structural tag requirement beyond the generic ones.
#[must_use]
pub fn required_tags(kind: u64) -> &'static [&'static str] {
    match kind {
        // deletion (NIP-09): at least one `e` tag identifying the target.
        5 => &["e"],
        // reaction (NIP-25): references both the event and its author.
        7 => &["e", "p"],
        // gift wrap (NIP-59): addressed to a recipient.
        1059 => &["p"],
        _ => &[],
    }
}

/// Addressable kinds additionally require a `d` tag regardless of the
/// generic per-kind table above.
#[must_use]
pub fn missing_required_tags(event: &Event) -> Vec<&'static str> {
    let mut missing: Vec<&'static str> = required_tags(event.kind)
        .iter()
        .copied()
        .filter(|name| event.tag_value(name).is_none())
        .collect();
    if event.is_addressable() && event.tag_value("d").is_none() && !missing.contains(&"d") {
        missing.push("d");
    }
    missing
}
