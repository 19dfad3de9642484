//! Event envelope definitions
//!
//! Every event travels the system as a bag of named aspects: the `delta`
//! payload (opaque to reconciliation, consumed by the state reducer), the
//! `command` aspect identifying the speculative command, and - once an
//! authority has confirmed the event as a truth - the `log` aspect with the
//! authoritative position. The envelope occupies exactly one wire version
//! at a time.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{ChronicleUri, CommandId, LogIndex};

/// Wire-format version of an event envelope.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventVersion {
    #[serde(rename = "0.1")]
    V0_1,
    #[serde(rename = "0.2")]
    V0_2,
    #[serde(rename = "0.3")]
    V0_3,
}

impl EventVersion {
    /// The version every event is normalized to before reconciliation.
    pub const CURRENT: EventVersion = EventVersion::V0_3;

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "0.1" => Some(EventVersion::V0_1),
            "0.2" => Some(EventVersion::V0_2),
            "0.3" => Some(EventVersion::V0_3),
            _ => None,
        }
    }

    pub fn as_tag(self) -> &'static str {
        match self {
            EventVersion::V0_1 => "0.1",
            EventVersion::V0_2 => "0.2",
            EventVersion::V0_3 => "0.3",
        }
    }
}

/// Command aspect - identifies a speculative command before confirmation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandAspect {
    /// Locally generated unique token, or a signed derivation.
    pub id: CommandId,
    /// Certificate behind a signed id derivation, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_id: Option<String>,
    /// Salt mixed into a signed id derivation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub salt: Option<u64>,
    /// Hash over the command content, filled in by the submitting
    /// connection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_hash: Option<String>,
}

impl CommandAspect {
    pub fn new(id: CommandId) -> Self {
        CommandAspect {
            id,
            cert_id: None,
            salt: None,
            event_hash: None,
        }
    }
}

/// Log aspect - present only once an authority has confirmed the event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogAspect {
    /// Authoritative, gapless, strictly increasing position.
    pub index: LogIndex,
    /// Confirmation wall-clock, unix microseconds.
    pub timestamp: i64,
    /// Hash over the confirmed command aspect.
    pub command_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_signature: Option<String>,
    /// Chain hash over the chronicle prefix up to this event.
    pub vplot_hash: String,
}

/// Per-chronicle note inside the multi-chronicle envelope.
///
/// The presence of a chronicle's key is what marks the event relevant to
/// that chronicle; the note itself carries the issuer's optimistic
/// concurrency hint.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChronicleNote {
    /// Number of truths the issuer had seen on this chronicle when the
    /// command was composed. Authorities may reject commands that are too
    /// stale.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub known_truth_count: Option<u64>,
}

impl ChronicleNote {
    pub fn at(known_truth_count: u64) -> Self {
        ChronicleNote {
            known_truth_count: Some(known_truth_count),
        }
    }
}

/// Register-level mutation operation.
///
/// The reconciliation engine never interprets these; they exist so the
/// reducer seam and the tests have concrete, deterministic payloads.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MutationOp {
    /// Set/replace the register value.
    Set(String),
    /// Append to the register value.
    Append(String),
    /// Remove the register.
    Remove,
}

/// A single register mutation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mutation {
    pub register: String,
    pub op: MutationOp,
}

impl Mutation {
    pub fn set(register: impl Into<String>, value: impl Into<String>) -> Self {
        Mutation {
            register: register.into(),
            op: MutationOp::Set(value.into()),
        }
    }

    pub fn append(register: impl Into<String>, value: impl Into<String>) -> Self {
        Mutation {
            register: register.into(),
            op: MutationOp::Append(value.into()),
        }
    }

    pub fn remove(register: impl Into<String>) -> Self {
        Mutation {
            register: register.into(),
            op: MutationOp::Remove,
        }
    }
}

/// The state-changing payload body.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeltaBody {
    /// Simple single-action payload.
    Mutate(Mutation),
    /// Composite transaction: ordered sub-actions, each with its own
    /// optional chronicle envelope. Only composites may legally span
    /// multiple chronicles.
    Transacted { actions: Vec<DeltaAspect> },
}

/// Delta aspect - payload body plus the optional multi-chronicle envelope.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaAspect {
    /// Multi-chronicle envelope: which chronicles this payload touches.
    /// Absent on context-free single-chronicle payloads.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chronicles: Option<BTreeMap<ChronicleUri, ChronicleNote>>,
    pub body: DeltaBody,
}

impl DeltaAspect {
    pub fn mutate(mutation: Mutation) -> Self {
        DeltaAspect {
            chronicles: None,
            body: DeltaBody::Mutate(mutation),
        }
    }

    pub fn transacted(actions: Vec<DeltaAspect>) -> Self {
        DeltaAspect {
            chronicles: None,
            body: DeltaBody::Transacted { actions },
        }
    }

    pub fn with_chronicles(
        mut self,
        chronicles: BTreeMap<ChronicleUri, ChronicleNote>,
    ) -> Self {
        self.chronicles = Some(chronicles);
        self
    }

    /// Convenience for the common single-chronicle envelope.
    pub fn with_chronicle(mut self, chronicle: ChronicleUri, note: ChronicleNote) -> Self {
        let mut map = BTreeMap::new();
        map.insert(chronicle, note);
        self.chronicles = Some(map);
        self
    }

    pub fn is_composite(&self) -> bool {
        matches!(self.body, DeltaBody::Transacted { .. })
    }
}

/// The versioned event envelope.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventAspects {
    pub version: EventVersion,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<CommandAspect>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<LogAspect>,
    pub delta: DeltaAspect,
}

impl EventAspects {
    /// A current-version command envelope.
    pub fn command(id: CommandId, delta: DeltaAspect) -> Self {
        EventAspects {
            version: EventVersion::CURRENT,
            command: Some(CommandAspect::new(id)),
            log: None,
            delta,
        }
    }

    pub fn with_log(mut self, log: LogAspect) -> Self {
        self.log = Some(log);
        self
    }

    pub fn command_id(&self) -> Option<CommandId> {
        self.command.as_ref().map(|command| command.id)
    }

    /// An event is a truth once an authority has assigned it a log
    /// position.
    pub fn is_truth(&self) -> bool {
        self.log.is_some()
    }

    pub fn log_index(&self) -> Option<LogIndex> {
        self.log.as_ref().map(|log| log.index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chronicle(id: &str) -> ChronicleUri {
        ChronicleUri::parse(&format!("memory://origin?id={id}")).unwrap()
    }

    #[test]
    fn test_version_tag_roundtrip() {
        for version in [EventVersion::V0_1, EventVersion::V0_2, EventVersion::V0_3] {
            let tag = version.as_tag();
            assert_eq!(EventVersion::from_tag(tag), Some(version));
        }
        assert_eq!(EventVersion::from_tag("0.4"), None);
    }

    #[test]
    fn test_command_envelope_is_not_truth() {
        let event = EventAspects::command(
            CommandId::new(7),
            DeltaAspect::mutate(Mutation::set("title", "hello")),
        );
        assert!(!event.is_truth());
        assert_eq!(event.command_id(), Some(CommandId::new(7)));
        assert_eq!(event.version, EventVersion::CURRENT);
    }

    #[test]
    fn test_truth_carries_log_index() {
        let event = EventAspects::command(
            CommandId::new(7),
            DeltaAspect::mutate(Mutation::set("title", "hello")),
        )
        .with_log(LogAspect {
            index: LogIndex::new(3),
            timestamp: 1_700_000_000_000_000,
            command_hash: "ch:7".to_string(),
            command_signature: None,
            vplot_hash: "vp:3".to_string(),
        });
        assert!(event.is_truth());
        assert_eq!(event.log_index(), Some(LogIndex::new(3)));
    }

    #[test]
    fn test_envelope_json_shape() {
        let delta = DeltaAspect::mutate(Mutation::append("body", "x"))
            .with_chronicle(chronicle("a"), ChronicleNote::at(2));
        let event = EventAspects::command(CommandId::new(1), delta);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["version"], "0.3");
        assert!(json["delta"]["chronicles"]["memory://origin?id=a"].is_object());
        let back: EventAspects = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }
}
