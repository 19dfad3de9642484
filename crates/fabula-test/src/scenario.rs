//! Scriptable scenario authority
//!
//! An authority whose confirmation behavior is driven by the test: it can
//! hold every submitted command until the test releases them in an order
//! of its choosing, reject individual commands, inject truths from
//! "other actors", and re-broadcast already-delivered truths. This is what
//! makes out-of-order confirmation and rejection scenarios deterministic.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use fabula_connect::{
    Authority, ChronicleOptions, ChronicledEvents, CommandOutcome, Connection, EventResult,
    NarrateOptions, NarrationLedger,
};
use fabula_core::{
    AuthorityUri, ChronicleUri, CommandId, EventAspects, FabulaError, FabulaResult, LogAspect,
    LogIndex,
};
use fabula_wire::VersionedEvent;

struct HeldCommand {
    command_id: CommandId,
    event: EventAspects,
    verdict: tokio::sync::oneshot::Sender<FabulaResult<CommandOutcome>>,
}

#[derive(Default)]
struct ScenarioState {
    truths: Vec<EventAspects>,
    held: Vec<HeldCommand>,
    subscribers: Vec<mpsc::UnboundedSender<Vec<VersionedEvent>>>,
}

impl ScenarioState {
    /// Number a command (or injected event) as the next truth and
    /// broadcast it.
    fn chronicle_truth(&mut self, mut event: EventAspects) -> EventAspects {
        let index = self.truths.len() as u64;
        let command_hash = event
            .command_id()
            .map(|id| format!("cmd:{id}"))
            .unwrap_or_else(|| "cmd:anonymous".to_string());
        event.log = Some(LogAspect {
            index: LogIndex::new(index),
            timestamp: 1_700_000_000_000_000 + index as i64,
            vplot_hash: format!("vp:{index}:{command_hash}"),
            command_hash,
            command_signature: None,
        });
        self.truths.push(event.clone());
        self.broadcast(vec![VersionedEvent::current(event.clone())]);
        event
    }

    fn broadcast(&mut self, batch: Vec<VersionedEvent>) {
        self.subscribers
            .retain(|subscriber| subscriber.send(batch.clone()).is_ok());
    }
}

/// Scriptable authority for one scenario chronicle.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ScenarioAuthority {
    uri: AuthorityUri,
    hold_commands: Arc<AtomicBool>,
    state: Arc<Mutex<ScenarioState>>,
}

impl ScenarioAuthority {
    /// An authority that holds every submission until the test releases
    /// it.
    pub fn holding(uri: AuthorityUri) -> Self {
        ScenarioAuthority {
            uri,
            hold_commands: Arc::new(AtomicBool::new(true)),
            state: Arc::new(Mutex::new(ScenarioState::default())),
        }
    }

    /// An authority that confirms immediately, in submission order.
    pub fn passthrough(uri: AuthorityUri) -> Self {
        let authority = ScenarioAuthority::holding(uri);
        authority.hold_commands.store(false, Ordering::Release);
        authority
    }

    /// Command ids currently held, in submission order.
    pub fn held_commands(&self) -> Vec<CommandId> {
        self.state
            .lock()
            .held
            .iter()
            .map(|held| held.command_id)
            .collect()
    }

    /// Confirm one held command, assigning it the next log index.
    pub fn release(&self, command_id: CommandId) -> FabulaResult<LogIndex> {
        let mut state = self.state.lock();
        let position = state
            .held
            .iter()
            .position(|held| held.command_id == command_id)
            .ok_or(FabulaError::StoryNotFound(command_id))?;
        let held = state.held.remove(position);
        let truth = state.chronicle_truth(held.event);
        let index = truth.log_index().expect("just chronicled");
        let _ = held.verdict.send(Ok(CommandOutcome::Confirmed(truth)));
        Ok(index)
    }

    /// Reject one held command with `reason`.
    pub fn reject(&self, command_id: CommandId, reason: impl Into<String>) -> FabulaResult<()> {
        let mut state = self.state.lock();
        let position = state
            .held
            .iter()
            .position(|held| held.command_id == command_id)
            .ok_or(FabulaError::StoryNotFound(command_id))?;
        let held = state.held.remove(position);
        let _ = held.verdict.send(Ok(CommandOutcome::Rejected {
            reason: reason.into(),
        }));
        Ok(())
    }

    /// Chronicle a truth no local actor submitted.
    pub fn inject_foreign(&self, event: EventAspects) -> LogIndex {
        let truth = self.state.lock().chronicle_truth(event);
        truth.log_index().expect("just chronicled")
    }

    /// Deliver an already-confirmed truth again, as a flaky upstream
    /// would.
    pub fn rebroadcast(&self, index: LogIndex) {
        let mut state = self.state.lock();
        if let Some(truth) = state.truths.get(index.0 as usize).cloned() {
            state.broadcast(vec![VersionedEvent::current(truth)]);
        }
    }

    /// The confirmed truth log so far, in log.index order.
    pub fn truths(&self) -> Vec<EventAspects> {
        self.state.lock().truths.clone()
    }

    /// Wait until `count` submissions are held, with a five second cap.
    pub async fn wait_until_held(&self, count: usize) {
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
        while self.state.lock().held.len() < count {
            if tokio::time::Instant::now() > deadline {
                panic!(
                    "only {} of {count} submissions arrived",
                    self.state.lock().held.len()
                );
            }
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }
    }
}

/// Scheme module handing out one shared scenario authority for every
/// `scenario://` URI.
pub struct ScenarioSchemeModule {
    authority: ScenarioAuthority,
}

impl ScenarioSchemeModule {
    pub fn new(authority: ScenarioAuthority) -> Self {
        ScenarioSchemeModule { authority }
    }
}

impl fabula_authority::SchemeModule for ScenarioSchemeModule {
    fn scheme(&self) -> &'static str {
        "scenario"
    }

    fn authority_uri_of(&self, chronicle: &ChronicleUri) -> FabulaResult<AuthorityUri> {
        Ok(chronicle.authority().clone())
    }

    fn default_config(&self, authority: &AuthorityUri) -> Option<fabula_authority::AuthorityConfig> {
        Some(fabula_authority::AuthorityConfig::new(authority.clone()))
    }

    fn create_authority(
        &self,
        _config: &fabula_authority::AuthorityConfig,
    ) -> FabulaResult<Arc<dyn Authority>> {
        Ok(Arc::new(self.authority.clone()))
    }
}

#[async_trait]
impl Authority for ScenarioAuthority {
    fn uri(&self) -> &AuthorityUri {
        &self.uri
    }

    async fn open_connection(
        &self,
        chronicle: ChronicleUri,
    ) -> FabulaResult<Arc<dyn Connection>> {
        let confirmed = self.state.lock().truths.len() as u64;
        Ok(Arc::new(ScenarioConnection {
            authority: self.clone(),
            chronicle,
            next_provisional: AtomicU64::new(confirmed),
            narrations: NarrationLedger::new(),
            open: AtomicBool::new(true),
        }))
    }
}

/// Connection onto a [`ScenarioAuthority`].
pub struct ScenarioConnection {
    authority: ScenarioAuthority,
    chronicle: ChronicleUri,
    next_provisional: AtomicU64,
    narrations: NarrationLedger,
    open: AtomicBool,
}

impl ScenarioConnection {
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
impl Connection for ScenarioConnection {
    fn chronicle(&self) -> &ChronicleUri {
        &self.chronicle
    }

    async fn narrate(&self, options: NarrateOptions) -> FabulaResult<Vec<VersionedEvent>> {
        self.ensure_open("narrate")?;
        let state = self.authority.state.lock();
        let begin = options.index_begin.unwrap_or(LogIndex::ZERO).0;
        let end = options
            .index_end
            .map(|index| index.0)
            .unwrap_or(state.truths.len() as u64);
        drop(state);
        if begin >= end {
            return Ok(Vec::new());
        }
        let claimed = self.narrations.claim(begin, end);
        let state = self.authority.state.lock();
        let mut truths = Vec::new();
        for &(gap_begin, gap_end) in &claimed {
            let gap_begin = (gap_begin as usize).min(state.truths.len());
            let gap_end = (gap_end as usize).min(state.truths.len());
            truths.extend(
                state.truths[gap_begin..gap_end]
                    .iter()
                    .cloned()
                    .map(VersionedEvent::current),
            );
        }
        drop(state);
        self.narrations.release(&claimed);
        Ok(truths)
    }

    async fn chronicle_events(
        &self,
        events: Vec<EventAspects>,
        _options: ChronicleOptions,
    ) -> FabulaResult<ChronicledEvents> {
        self.ensure_open("chronicle_events")?;
        self.next_provisional
            .fetch_add(events.len() as u64, Ordering::AcqRel);
        let hold = self.authority.hold_commands.load(Ordering::Acquire);
        let mut state = self.authority.state.lock();
        let event_results = events
            .into_iter()
            .map(|event| {
                let command_id = event.command_id().unwrap_or(CommandId::ZERO);
                let (verdict, result) = EventResult::new(command_id, self.chronicle.clone());
                if hold {
                    state.held.push(HeldCommand {
                        command_id,
                        event,
                        verdict,
                    });
                } else {
                    let truth = state.chronicle_truth(event);
                    let _ = verdict.send(Ok(CommandOutcome::Confirmed(truth)));
                }
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
        let (sender, receiver) = mpsc::unbounded_channel();
        self.authority.state.lock().subscribers.push(sender);
        receiver
    }

    async fn disconnect(&self) {
        self.open.store(false, Ordering::Release);
    }
}
