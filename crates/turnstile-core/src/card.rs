//! Card reader line protocol.
//!
//! The reader firmware prints one ASCII line per presented tag:
//!
//! ```text
//! Card UID: C3 7F F2 D9 | Card recognized
//! ```
//!
//! Anything without the `Card UID:` marker is chatter and is ignored.

use crate::types::CardScan;

const UID_MARKER: &str = "Card UID:";
const RECOGNIZED_MARKER: &str = "Card recognized";

/// Parse a reader line into a card scan.
///
/// Returns `None` for non-card lines and for card lines whose UID is empty
/// or not made of hex byte tokens. The UID is normalised to upper-case
/// tokens separated by single spaces.
pub fn parse_line(line: &str) -> Option<CardScan> {
    let raw_line = line.trim();
    let (_, after_marker) = raw_line.split_once(UID_MARKER)?;
    let uid_field = after_marker.split('|').next().unwrap_or_default();

    let uid = normalize_uid(uid_field)?;

    Some(CardScan {
        uid,
        is_recognized: raw_line.contains(RECOGNIZED_MARKER),
        raw_line: raw_line.to_string(),
    })
}

/// Normalise a card UID (`"c3 7f  f2 d9"` → `"C3 7F F2 D9"`).
///
/// Returns `None` if the UID is empty or has a token that is not 1–2 hex digits.
pub fn normalize_uid(uid: &str) -> Option<String> {
    let tokens: Vec<String> = uid
        .split_whitespace()
        .map(|t| t.to_ascii_uppercase())
        .collect();

    let valid = !tokens.is_empty()
        && tokens
            .iter()
            .all(|t| (1..=2).contains(&t.len()) && t.chars().all(|c| c.is_ascii_hexdigit()));

    valid.then(|| tokens.join(" "))
}
