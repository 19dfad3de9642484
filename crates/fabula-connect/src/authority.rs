//! In-memory terminal authority
//!
//! The reference authority implementation: keeps every chronicle's truth
//! log in memory, assigns gapless log positions in submission order, and
//! broadcasts each confirmation to all live subscribers. One instance
//! serves every chronicle under its authority URI; connections are
//! per-chronicle bindings onto it.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use fabula_core::{
    AuthorityUri, ChronicleUri, CommandId, EventAspects, FabulaError, FabulaResult, LogAspect,
    LogIndex,
};
use fabula_wire::VersionedEvent;

use crate::connection::{
    Authority, ChronicleOptions, ChronicledEvents, CommandOutcome, Connection, EventResult,
    NarrateOptions, NarrationLedger,
};

/// Behavior knobs for the in-memory authority.
#[derive(Clone, Copy, Debug)]
pub struct MemoryAuthorityOptions {
    /// Reject a command whose id was already chronicled instead of
    /// numbering it twice.
    pub reject_duplicate_commands: bool,
}

impl Default for MemoryAuthorityOptions {
    fn default() -> Self {
        MemoryAuthorityOptions {
            reject_duplicate_commands: true,
        }
    }
}

#[derive(Default)]
struct ChronicleLog {
    truths: Vec<EventAspects>,
    seen: HashSet<CommandId>,
    subscribers: Vec<mpsc::UnboundedSender<Vec<VersionedEvent>>>,
}

/// In-memory authority: total-order numbering, duplicate detection and
/// truth persistence for every chronicle under one authority URI.
///
/// Cheap to clone; clones share the same chronicle logs, so every
/// connection opened from any clone observes the same truths.
#[derive(Clone)]
pub struct MemoryAuthority {
    uri: AuthorityUri,
    options: MemoryAuthorityOptions,
    chronicles: Arc<Mutex<HashMap<ChronicleUri, ChronicleLog>>>,
}

impl MemoryAuthority {
    pub fn new(uri: AuthorityUri, options: MemoryAuthorityOptions) -> Self {
        MemoryAuthority {
            uri,
            options,
            chronicles: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn truth_count(&self, chronicle: &ChronicleUri) -> u64 {
        self.chronicles
            .lock()
            .get(chronicle)
            .map(|log| log.truths.len() as u64)
            .unwrap_or(0)
    }

    fn subscribe_log(
        &self,
        chronicle: &ChronicleUri,
    ) -> mpsc::UnboundedReceiver<Vec<VersionedEvent>> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.chronicles
            .lock()
            .entry(chronicle.clone())
            .or_default()
            .subscribers
            .push(sender);
        receiver
    }

    fn truths_in(&self, chronicle: &ChronicleUri, ranges: &[(u64, u64)]) -> Vec<VersionedEvent> {
        let chronicles = self.chronicles.lock();
        let Some(log) = chronicles.get(chronicle) else {
            return Vec::new();
        };
        let mut truths = Vec::new();
        for &(begin, end) in ranges {
            let begin = (begin as usize).min(log.truths.len());
            let end = (end as usize).min(log.truths.len());
            truths.extend(
                log.truths[begin..end]
                    .iter()
                    .cloned()
                    .map(VersionedEvent::current),
            );
        }
        truths
    }

    /// Number and persist a submission batch, broadcasting the new truths
    /// to every subscriber.
    fn confirm(&self, chronicle: &ChronicleUri, events: Vec<EventAspects>) -> Vec<CommandOutcome> {
        let mut chronicles = self.chronicles.lock();
        let log = chronicles.entry(chronicle.clone()).or_default();
        let mut outcomes = Vec::with_capacity(events.len());
        let mut broadcast = Vec::new();
        for mut event in events {
            let Some(command_id) = event.command_id() else {
                outcomes.push(CommandOutcome::Rejected {
                    reason: "command aspect missing".to_string(),
                });
                continue;
            };
            if self.options.reject_duplicate_commands && log.seen.contains(&command_id) {
                outcomes.push(CommandOutcome::Rejected {
                    reason: format!("command {command_id} already chronicled"),
                });
                continue;
            }
            let index = log.truths.len() as u64;
            let command_hash = format!("cmd:{command_id}");
            event.log = Some(LogAspect {
                index: LogIndex::new(index),
                timestamp: unix_micros(),
                vplot_hash: format!("vp:{index}:{command_hash}"),
                command_hash,
                command_signature: None,
            });
            log.seen.insert(command_id);
            log.truths.push(event.clone());
            broadcast.push(VersionedEvent::current(event.clone()));
            outcomes.push(CommandOutcome::Confirmed(event));
        }
        if !broadcast.is_empty() {
            log.subscribers
                .retain(|subscriber| subscriber.send(broadcast.clone()).is_ok());
        }
        outcomes
    }
}

#[async_trait]
impl Authority for MemoryAuthority {
    fn uri(&self) -> &AuthorityUri {
        &self.uri
    }

    async fn open_connection(
        &self,
        chronicle: ChronicleUri,
    ) -> FabulaResult<Arc<dyn Connection>> {
        if chronicle.authority() != &self.uri {
            return Err(FabulaError::MalformedChronicleUri(format!(
                "{chronicle} is not authorized by {}",
                self.uri
            )));
        }
        let confirmed = self.truth_count(&chronicle);
        tracing::debug!(%chronicle, confirmed, "opening authority connection");
        Ok(Arc::new(AuthorityConnection {
            authority: self.clone(),
            chronicle,
            next_provisional: AtomicU64::new(confirmed),
            narrations: NarrationLedger::new(),
            open: AtomicBool::new(true),
        }))
    }
}

/// Per-chronicle binding onto a [`MemoryAuthority`]. Terminal: it has no
/// upstream.
pub struct AuthorityConnection {
    authority: MemoryAuthority,
    chronicle: ChronicleUri,
    next_provisional: AtomicU64,
    narrations: NarrationLedger,
    open: AtomicBool,
}

impl AuthorityConnection {
    fn ensure_open(&self, operation: &'static str) -> FabulaResult<()> {
        if self.open.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(FabulaError::Cancelled {
                operation,
                chronicle: self.chronicle.clone(),
            })
        }
    }
}

#[async_trait]
impl Connection for AuthorityConnection {
    fn chronicle(&self) -> &ChronicleUri {
        &self.chronicle
    }

    async fn narrate(&self, options: NarrateOptions) -> FabulaResult<Vec<VersionedEvent>> {
        self.ensure_open("narrate")?;
        let begin = options.index_begin.unwrap_or(LogIndex::ZERO).0;
        let end = options
            .index_end
            .map(|index| index.0)
            .unwrap_or_else(|| self.authority.truth_count(&self.chronicle));
        if begin >= end {
            return Ok(Vec::new());
        }
        let claimed = self.narrations.claim(begin, end);
        let truths = self.authority.truths_in(&self.chronicle, &claimed);
        self.narrations.release(&claimed);
        Ok(truths)
    }

    async fn chronicle_events(
        &self,
        mut events: Vec<EventAspects>,
        _options: ChronicleOptions,
    ) -> FabulaResult<ChronicledEvents> {
        self.ensure_open("chronicle_events")?;
        self.next_provisional
            .fetch_add(events.len() as u64, Ordering::AcqRel);
        for event in &mut events {
            if let Some(command) = event.command.as_mut() {
                command.event_hash = Some(format!("eh:{}", command.id));
            }
        }
        let command_ids: Vec<Option<CommandId>> =
            events.iter().map(|event| event.command_id()).collect();
        let outcomes = self.authority.confirm(&self.chronicle, events);
        let event_results = outcomes
            .into_iter()
            .zip(command_ids)
            .map(|(outcome, command_id)| {
                let (sender, result) = EventResult::new(
                    command_id.unwrap_or(CommandId::ZERO),
                    self.chronicle.clone(),
                );
                // The in-memory authority settles synchronously.
                let _ = sender.send(Ok(outcome));
                result
            })
            .collect();
        Ok(ChronicledEvents { event_results })
    }

    fn first_unused_command_id(&self) -> LogIndex {
        LogIndex::new(self.next_provisional.load(Ordering::Acquire))
    }

    fn upstream(&self) -> Option<Arc<dyn Connection>> {
        None
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<Vec<VersionedEvent>> {
        self.authority.subscribe_log(&self.chronicle)
    }

    async fn disconnect(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            tracing::debug!(chronicle = %self.chronicle, "authority connection closed");
        }
    }
}

fn unix_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_micros() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use fabula_core::{CommandId, DeltaAspect, Mutation};
    use fabula_wire::upgrade_to_current;

    use super::*;

    fn chronicle(id: &str) -> ChronicleUri {
        ChronicleUri::parse(&format!("memory://origin?id={id}")).unwrap()
    }

    fn authority() -> MemoryAuthority {
        MemoryAuthority::new(
            AuthorityUri::parse("memory://origin").unwrap(),
            MemoryAuthorityOptions::default(),
        )
    }

    fn command(id: u64) -> EventAspects {
        EventAspects::command(
            CommandId::new(id),
            DeltaAspect::mutate(Mutation::set("register", format!("value-{id}"))),
        )
    }

    #[tokio::test]
    async fn test_confirmations_are_gapless_and_increasing() {
        let authority = authority();
        let connection = authority.open_connection(chronicle("x")).await.unwrap();
        let results = connection
            .chronicle_events(vec![command(1), command(2), command(3)], Default::default())
            .await
            .unwrap();
        for (expected, result) in results.event_results.into_iter().enumerate() {
            match result.settled().await.unwrap() {
                CommandOutcome::Confirmed(truth) => {
                    assert_eq!(truth.log_index(), Some(LogIndex::new(expected as u64)));
                }
                other => panic!("expected confirmation, got {other:?}"),
            }
        }
        assert_eq!(connection.first_unused_command_id(), LogIndex::new(3));
    }

    #[tokio::test]
    async fn test_duplicate_command_is_rejected() {
        let authority = authority();
        let connection = authority.open_connection(chronicle("x")).await.unwrap();
        let results = connection
            .chronicle_events(vec![command(7), command(7)], Default::default())
            .await
            .unwrap();
        let mut outcomes = Vec::new();
        for result in results.event_results {
            outcomes.push(result.settled().await.unwrap());
        }
        assert!(matches!(outcomes[0], CommandOutcome::Confirmed(_)));
        assert!(matches!(outcomes[1], CommandOutcome::Rejected { .. }));
    }

    #[tokio::test]
    async fn test_subscription_sees_other_actors_truths() {
        let authority = authority();
        let ours = authority.open_connection(chronicle("x")).await.unwrap();
        let theirs = authority.open_connection(chronicle("x")).await.unwrap();
        let mut feed = ours.subscribe();
        theirs
            .chronicle_events(vec![command(42)], Default::default())
            .await
            .unwrap();
        let batch = feed.recv().await.unwrap();
        assert_eq!(batch.len(), 1);
        let truth = upgrade_to_current(batch.into_iter().next().unwrap()).unwrap();
        assert_eq!(truth.command_id(), Some(CommandId::new(42)));
        assert_eq!(truth.log_index(), Some(LogIndex::ZERO));
    }

    #[tokio::test]
    async fn test_narrate_serves_requested_range() {
        let authority = authority();
        let connection = authority.open_connection(chronicle("x")).await.unwrap();
        connection
            .chronicle_events(
                vec![command(1), command(2), command(3), command(4)],
                Default::default(),
            )
            .await
            .unwrap();
        let truths = connection
            .narrate(NarrateOptions {
                index_begin: Some(LogIndex::new(1)),
                index_end: Some(LogIndex::new(3)),
            })
            .await
            .unwrap();
        assert_eq!(truths.len(), 2);
        let first = upgrade_to_current(truths.into_iter().next().unwrap()).unwrap();
        assert_eq!(first.log_index(), Some(LogIndex::new(1)));
    }

    #[tokio::test]
    async fn test_disconnect_cancels_operations() {
        let authority = authority();
        let connection = authority.open_connection(chronicle("x")).await.unwrap();
        connection.disconnect().await;
        let err = connection.narrate(Default::default()).await.unwrap_err();
        assert!(err.is_cancellation());
        let err = connection
            .chronicle_events(vec![command(1)], Default::default())
            .await
            .unwrap_err();
        assert!(err.is_cancellation());
    }
}
