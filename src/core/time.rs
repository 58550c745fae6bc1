//! Timestamps, event ids and the JSON command envelope.
//!
//! Every persisted artifact (checkpoint, journal line, evidence record, gate
//! report) is stamped with `<unix-seconds>Z` and, where it is an event, a ULID.

use serde_json::{Map, Value as JsonValue, json};
use std::time::{SystemTime, UNIX_EPOCH};
use ulid::Ulid;

pub const ENVELOPE_VERSION: &str = "phasegate.envelope/1";

/// Current time as `<unix-seconds>Z`, e.g. `1771220592Z`.
pub fn now_epoch_z() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    format!("{secs}Z")
}

/// Seconds encoded in an `<unix-seconds>Z` stamp.
pub fn parse_epoch_z(stamp: &str) -> Option<u64> {
    stamp.strip_suffix('Z')?.parse().ok()
}

pub fn new_event_id() -> String {
    Ulid::new().to_string()
}

/// Wraps a command payload for `--format json`.
///
/// Object payloads are flattened into the envelope; anything else lands under
/// `data`. Envelope keys win over payload keys of the same name.
pub fn command_envelope(cmd: &str, status: &str, payload: JsonValue) -> JsonValue {
    let mut out = match payload {
        JsonValue::Object(map) => map,
        JsonValue::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("data".into(), other);
            map
        }
    };
    out.insert("envelope_version".into(), json!(ENVELOPE_VERSION));
    out.insert("ts".into(), json!(now_epoch_z()));
    out.insert("event_id".into(), json!(new_event_id()));
    out.insert("cmd".into(), json!(cmd));
    out.insert("status".into(), json!(status));
    JsonValue::Object(out)
}
