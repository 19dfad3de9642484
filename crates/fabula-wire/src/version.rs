//! Version dispatch and upgrade
//!
//! Every event is normalized to [`EventVersion::CURRENT`] before it reaches
//! reconciliation. An event already at the current version passes through
//! unchanged (after the command-identifier check); older versions dispatch
//! to their version-specific extractor and are restamped. An unrecognized
//! version is a fatal protocol error, never coerced.

use fabula_core::{
    ChronicleNote, ChronicleUri, CommandAspect, CommandId, DeltaAspect, DeltaBody, EventAspects,
    EventVersion, FabulaError, FabulaResult, LogAspect, LogIndex, Mutation, MutationOp,
};

use crate::legacy::{ActionV01, EventV01, EventV02};

/// An event at whichever wire version it arrived in.
#[derive(Clone, Debug)]
pub enum VersionedEvent {
    V0_1(EventV01),
    V0_2(EventV02),
    V0_3(EventAspects),
}

impl VersionedEvent {
    pub fn version(&self) -> EventVersion {
        match self {
            VersionedEvent::V0_1(_) => EventVersion::V0_1,
            VersionedEvent::V0_2(_) => EventVersion::V0_2,
            VersionedEvent::V0_3(_) => EventVersion::V0_3,
        }
    }

    /// Wrap an already-current envelope.
    pub fn current(event: EventAspects) -> Self {
        VersionedEvent::V0_3(event)
    }
}

impl From<EventAspects> for VersionedEvent {
    fn from(event: EventAspects) -> Self {
        VersionedEvent::V0_3(event)
    }
}

/// Decode a wire event from JSON, dispatching on its `version` tag.
pub fn parse_versioned(value: &serde_json::Value) -> FabulaResult<VersionedEvent> {
    let tag = value
        .get("version")
        .and_then(|v| v.as_str())
        .ok_or_else(|| FabulaError::MalformedEvent("missing version tag".to_string()))?;
    let version = EventVersion::from_tag(tag)
        .ok_or_else(|| FabulaError::UnknownEventVersion(tag.to_string()))?;
    let event = match version {
        EventVersion::V0_1 => VersionedEvent::V0_1(
            serde_json::from_value(value.clone())
                .map_err(|e| FabulaError::MalformedEvent(format!("0.1 event: {e}")))?,
        ),
        EventVersion::V0_2 => VersionedEvent::V0_2(
            serde_json::from_value(value.clone())
                .map_err(|e| FabulaError::MalformedEvent(format!("0.2 event: {e}")))?,
        ),
        EventVersion::V0_3 => VersionedEvent::V0_3(
            serde_json::from_value(value.clone())
                .map_err(|e| FabulaError::MalformedEvent(format!("0.3 event: {e}")))?,
        ),
    };
    Ok(event)
}

/// Normalize an event to the current wire version.
///
/// A current-version event without a command identifier is invalid - the
/// command aspect is mandatory from "0.3" on, and silently assigning one
/// here would forge attribution.
pub fn upgrade_to_current(event: VersionedEvent) -> FabulaResult<EventAspects> {
    match event {
        VersionedEvent::V0_3(aspects) => {
            if aspects.command.is_none() {
                return Err(FabulaError::MissingCommandAspect {
                    version: EventVersion::V0_3.as_tag().to_string(),
                });
            }
            Ok(aspects)
        }
        VersionedEvent::V0_1(legacy) => {
            let mut aspects = extract_v01(legacy)?;
            aspects.version = EventVersion::CURRENT;
            Ok(aspects)
        }
        VersionedEvent::V0_2(legacy) => {
            let mut aspects = extract_v02(legacy)?;
            aspects.version = EventVersion::CURRENT;
            Ok(aspects)
        }
    }
}

fn extract_v01(legacy: EventV01) -> FabulaResult<EventAspects> {
    let command_id = legacy.command_id.ok_or(FabulaError::MissingCommandAspect {
        version: EventVersion::V0_1.as_tag().to_string(),
    })?;
    let log = legacy
        .event_id
        .map(|index| LogAspect {
            index: LogIndex::new(index),
            timestamp: legacy.time_stamp.unwrap_or(0),
            command_hash: format!("cmd:{command_id:016x}"),
            command_signature: None,
            vplot_hash: format!("v0:{command_id:016x}:{index}"),
        });
    Ok(EventAspects {
        version: EventVersion::V0_1,
        command: Some(CommandAspect::new(CommandId::new(command_id))),
        log,
        delta: delta_of_v01(legacy.action)?,
    })
}

fn delta_of_v01(action: ActionV01) -> FabulaResult<DeltaAspect> {
    let chronicles = action
        .partitions
        .map(|partitions| {
            partitions
                .into_iter()
                .map(|(uri, note)| {
                    let chronicle = ChronicleUri::parse(&uri)?;
                    Ok((
                        chronicle,
                        ChronicleNote {
                            known_truth_count: note.event_count,
                        },
                    ))
                })
                .collect::<FabulaResult<_>>()
        })
        .transpose()?;

    let body = match action.kind.as_str() {
        "MUTATE" => {
            let register = action.register.ok_or_else(|| {
                FabulaError::MalformedEvent("0.1 MUTATE without register".to_string())
            })?;
            let op = if let Some(value) = action.set {
                MutationOp::Set(value)
            } else if let Some(value) = action.append {
                MutationOp::Append(value)
            } else if action.remove == Some(true) {
                MutationOp::Remove
            } else {
                return Err(FabulaError::MalformedEvent(
                    "0.1 MUTATE without operation".to_string(),
                ));
            };
            DeltaBody::Mutate(Mutation { register, op })
        }
        "TRANSACTED" => {
            if action.actions.is_empty() {
                return Err(FabulaError::MalformedEvent(
                    "0.1 TRANSACTED without actions".to_string(),
                ));
            }
            DeltaBody::Transacted {
                actions: action
                    .actions
                    .into_iter()
                    .map(delta_of_v01)
                    .collect::<FabulaResult<_>>()?,
            }
        }
        other => {
            return Err(FabulaError::MalformedEvent(format!(
                "0.1 action type {other:?}"
            )))
        }
    };

    Ok(DeltaAspect { chronicles, body })
}

fn extract_v02(legacy: EventV02) -> FabulaResult<EventAspects> {
    let command = legacy.command.ok_or(FabulaError::MissingCommandAspect {
        version: EventVersion::V0_2.as_tag().to_string(),
    })?;
    let log = legacy.log.map(|log| LogAspect {
        index: LogIndex::new(log.index),
        // "0.2" stamped milliseconds.
        timestamp: log.time_stamp_ms * 1000,
        vplot_hash: format!("v0:{}", log.command_hash),
        command_hash: log.command_hash,
        command_signature: log.command_signature,
    });
    Ok(EventAspects {
        version: EventVersion::V0_2,
        command: Some(CommandAspect {
            id: CommandId::new(command.id),
            cert_id: command.cert_id,
            salt: command.salt,
            event_hash: None,
        }),
        log,
        delta: legacy.delta,
    })
}
