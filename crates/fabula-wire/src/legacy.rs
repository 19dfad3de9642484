//! Legacy wire shapes
//!
//! Events at versions "0.1" and "0.2" predate the aspect envelope. They
//! arrive as JSON and are decoded into these transitional structs before
//! the version-specific extractors (see [`crate::version`]) lift them into
//! the current envelope.

use std::collections::BTreeMap;

use serde::Deserialize;

/// A "0.1" event: flat, pre-aspect. The command identifier is a bare
/// optional field and the multi-chronicle envelope uses the old
/// `partitions` name.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventV01 {
    pub version: String,
    #[serde(default)]
    pub command_id: Option<u64>,
    /// Old name for the confirmed log position.
    #[serde(default)]
    pub event_id: Option<u64>,
    /// Confirmation wall-clock, unix microseconds. Only on truths.
    #[serde(default)]
    pub time_stamp: Option<i64>,
    #[serde(flatten)]
    pub action: ActionV01,
}

/// One "0.1" action, possibly composite.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionV01 {
    /// Old name for the multi-chronicle envelope.
    #[serde(default)]
    pub partitions: Option<BTreeMap<String, PartitionNoteV01>>,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub register: Option<String>,
    #[serde(default)]
    pub set: Option<String>,
    #[serde(default)]
    pub append: Option<String>,
    #[serde(default)]
    pub remove: Option<bool>,
    #[serde(default)]
    pub actions: Vec<ActionV01>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionNoteV01 {
    #[serde(default)]
    pub event_count: Option<u64>,
}

/// A "0.2" event: aspect-shaped, but the log aspect timestamps in
/// milliseconds and carries no chain hash yet.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct EventV02 {
    pub version: String,
    #[serde(default)]
    pub command: Option<CommandAspectV02>,
    #[serde(default)]
    pub log: Option<LogAspectV02>,
    pub delta: fabula_core::DeltaAspect,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandAspectV02 {
    pub id: u64,
    #[serde(default)]
    pub cert_id: Option<String>,
    #[serde(default)]
    pub salt: Option<u64>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogAspectV02 {
    pub index: u64,
    pub time_stamp_ms: i64,
    pub command_hash: String,
    #[serde(default)]
    pub command_signature: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_v01_composite_decodes() {
        let raw = serde_json::json!({
            "version": "0.1",
            "commandId": 12,
            "type": "TRANSACTED",
            "partitions": {
                "memory://origin?id=a": { "eventCount": 1 },
                "memory://origin?id=b": {}
            },
            "actions": [
                {
                    "type": "MUTATE",
                    "partitions": { "memory://origin?id=a": {} },
                    "register": "title",
                    "set": "hello"
                },
                {
                    "type": "MUTATE",
                    "partitions": { "memory://origin?id=b": {} },
                    "register": "body",
                    "append": "world"
                }
            ]
        });
        let event: EventV01 = serde_json::from_value(raw).unwrap();
        assert_eq!(event.command_id, Some(12));
        assert_eq!(event.action.kind, "TRANSACTED");
        assert_eq!(event.action.actions.len(), 2);
    }

    #[test]
    fn test_v02_truth_decodes() {
        let raw = serde_json::json!({
            "version": "0.2",
            "command": { "id": 99, "salt": 4 },
            "log": {
                "index": 0,
                "timeStampMs": 1_700_000_000_000i64,
                "commandHash": "ch:99"
            },
            "delta": { "body": { "Mutate": { "register": "r", "op": { "Set": "v" } } } }
        });
        let event: EventV02 = serde_json::from_value(raw).unwrap();
        assert_eq!(event.command.unwrap().id, 99);
        assert_eq!(event.log.unwrap().index, 0);
    }
}
