//! Per-chronicle reconciliation worker
//!
//! One serialized worker owns each chronicle's story ring and speculative
//! state: every mutation step - command issuance, truth reconciliation,
//! rejection revert - runs to completion inside the worker loop before the
//! next one starts, so the ring is never observed half-updated. The only
//! suspension points are the connection calls (narration, submission) and
//! those happen in spawned watcher tasks that report back through the same
//! serialized op queue.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use fabula_core::{
    ChronicleNote, ChronicleUri, CommandId, DeltaAspect, EventAspects, FabulaError, FabulaResult,
    LogIndex, OperationContext,
};
use fabula_connect::{ChronicleOptions, CommandOutcome, Connection, NarrateOptions};
use fabula_wire::{extract_for_chronicle, upgrade_to_current, VersionedEvent};

use crate::notify::{CommandCountNotifier, StoryNotice, StoryPhase};
use crate::prophet::{
    ChronicleHandle, ChronicleSnapshot, ChronicleState, CommandIssued, ProphetConfig,
    ProphetStats,
};
use crate::reducer::{Passage, Reducer};
use crate::story::{Story, StoryHandle, StoryTelling};

/// Worker operations. Everything that mutates a chronicle funnels through
/// these.
pub(crate) enum Op<S> {
    Issue {
        command_id: Option<CommandId>,
        delta: DeltaAspect,
        reply: oneshot::Sender<FabulaResult<CommandIssued>>,
    },
    Truths {
        generation: u64,
        events: Vec<VersionedEvent>,
    },
    Outcome {
        command_id: CommandId,
        outcome: FabulaResult<CommandOutcome>,
    },
    Subscribe {
        reply: oneshot::Sender<mpsc::UnboundedReceiver<StoryNotice>>,
    },
    SubscribeCount {
        reply: oneshot::Sender<mpsc::UnboundedReceiver<usize>>,
    },
    InstallCountGate {
        gate: oneshot::Receiver<()>,
    },
    Snapshot {
        reply: oneshot::Sender<ChronicleSnapshot<S>>,
    },
    Detach {
        reply: oneshot::Sender<()>,
    },
    Reattach {
        connection: Arc<dyn Connection>,
        reply: oneshot::Sender<FabulaResult<()>>,
    },
}

pub(crate) struct Chronicler<R: Reducer> {
    chronicle: ChronicleUri,
    reducer: R,
    config: ProphetConfig,
    connection: Option<Arc<dyn Connection>>,
    /// Confirmed truths in log.index order.
    truths: Vec<EventAspects>,
    /// State after the confirmed truths only.
    floor: R::State,
    /// State after the confirmed truths plus the pending ring.
    speculative: R::State,
    ring: StoryTelling,
    /// Pending result channels of locally issued commands.
    outcomes: HashMap<CommandId, oneshot::Sender<FabulaResult<CommandOutcome>>>,
    followers: Vec<mpsc::UnboundedSender<StoryNotice>>,
    counter: CommandCountNotifier,
    /// Strictly increasing provisional position counter; never reused,
    /// even across rejections.
    next_provisional: u64,
    /// Bumped on every detach/reattach so stale truth pumps are ignored.
    generation: u64,
    state: ChronicleState,
    stats: ProphetStats,
    ops: mpsc::UnboundedSender<Op<R::State>>,
}

impl<R> Chronicler<R>
where
    R: Reducer + 'static,
    R::State: 'static,
{
    pub(crate) fn spawn(
        chronicle: ChronicleUri,
        connection: Arc<dyn Connection>,
        reducer: R,
        config: ProphetConfig,
    ) -> ChronicleHandle<R::State> {
        let (ops, ops_rx) = mpsc::unbounded_channel();
        let feed = connection.subscribe();
        let chronicler = Chronicler {
            chronicle: chronicle.clone(),
            floor: reducer.initial(),
            speculative: reducer.initial(),
            reducer,
            config,
            connection: Some(connection),
            truths: Vec::new(),
            ring: StoryTelling::new(),
            outcomes: HashMap::new(),
            followers: Vec::new(),
            counter: CommandCountNotifier::new(),
            next_provisional: 0,
            generation: 0,
            state: ChronicleState::Uninitialized,
            stats: ProphetStats::default(),
            ops: ops.clone(),
        };
        chronicler.start_pump(feed);
        tokio::spawn(chronicler.run(ops_rx));
        ChronicleHandle::new(chronicle, ops)
    }

    async fn run(mut self, mut ops: mpsc::UnboundedReceiver<Op<R::State>>) {
        if let Err(error) = self.synchronize().await {
            tracing::error!(chronicle = %self.chronicle, %error, "initial narration failed");
            self.detach().await;
        }
        while let Some(op) = ops.recv().await {
            self.handle_op(op).await;
        }
    }

    async fn handle_op(&mut self, op: Op<R::State>) {
        match op {
            Op::Issue {
                command_id,
                delta,
                reply,
            } => {
                let _ = reply.send(self.issue(command_id, delta));
            }
            Op::Truths { generation, events } => {
                if generation == self.generation {
                    self.receive_truths(events);
                }
            }
            Op::Outcome {
                command_id,
                outcome,
            } => self.handle_outcome(command_id, outcome),
            Op::Subscribe { reply } => {
                let (sender, receiver) = mpsc::unbounded_channel();
                self.followers.push(sender);
                let _ = reply.send(receiver);
            }
            Op::SubscribeCount { reply } => {
                let _ = reply.send(self.counter.subscribe());
            }
            Op::InstallCountGate { gate } => self.counter.install_gate(gate),
            Op::Snapshot { reply } => {
                let _ = reply.send(ChronicleSnapshot {
                    state: self.state,
                    truth_count: self.truths.len() as u64,
                    pending_count: self.ring.len(),
                    pending: self
                        .ring
                        .iter()
                        .map(|(_, story)| story.command_id)
                        .collect(),
                    confirmed: self.floor.clone(),
                    speculative: self.speculative.clone(),
                    stats: self.stats,
                });
            }
            Op::Detach { reply } => {
                self.detach().await;
                let _ = reply.send(());
            }
            Op::Reattach { connection, reply } => {
                let _ = reply.send(self.reattach(connection).await);
            }
        }
    }

    /// Forward a connection's truth feed into the op queue, tagged with
    /// the attachment generation so a feed outliving its connection is
    /// ignored.
    fn start_pump(&self, mut feed: mpsc::UnboundedReceiver<Vec<VersionedEvent>>) {
        let ops = self.ops.clone();
        let generation = self.generation;
        tokio::spawn(async move {
            while let Some(events) = feed.recv().await {
                if ops.send(Op::Truths { generation, events }).is_err() {
                    break;
                }
            }
        });
    }

    /// Initial (or post-reattach) narration: replay every confirmed truth
    /// this engine has not seen yet, then go live.
    async fn synchronize(&mut self) -> FabulaResult<()> {
        let connection = self
            .connection
            .clone()
            .ok_or_else(|| FabulaError::NotConnected(self.chronicle.clone()))?;
        self.state = ChronicleState::Synchronizing;
        let narrated = connection
            .narrate(NarrateOptions::starting_at(LogIndex::new(
                self.truths.len() as u64,
            )))
            .await
            .during("synchronize", || format!("chronicle {}", self.chronicle))?;
        for event in narrated {
            self.reconcile(event)?;
        }
        self.state = ChronicleState::Live;
        // The connection's own counter verifies monotonic assignment: we
        // never hand out a provisional position it considers used.
        self.next_provisional = self
            .next_provisional
            .max((self.truths.len() + self.ring.len()) as u64)
            .max(connection.first_unused_command_id().0);
        tracing::info!(
            chronicle = %self.chronicle,
            truths = self.truths.len(),
            pending = self.ring.len(),
            "chronicle live"
        );
        Ok(())
    }

    /// Optimistic command issuance: apply locally, queue at the ring tail,
    /// recite the premiere, submit upstream.
    fn issue(
        &mut self,
        preassigned: Option<CommandId>,
        delta: DeltaAspect,
    ) -> FabulaResult<CommandIssued> {
        if self.state != ChronicleState::Live {
            return Err(FabulaError::NotConnected(self.chronicle.clone()));
        }
        if self.ring.len() >= self.config.max_pending_commands {
            return Err(FabulaError::PendingLimit {
                chronicle: self.chronicle.clone(),
                limit: self.config.max_pending_commands,
            });
        }
        let command_id = preassigned.unwrap_or_else(|| CommandId::new(rand::random()));
        if self.ring.lookup(command_id).is_some() {
            // Checked before any state is touched; the ring would refuse
            // the link anyway, but only after the optimistic apply.
            return Err(FabulaError::StoryAlreadyLinked(command_id));
        }
        let delta = if delta.chronicles.is_some() {
            delta
        } else {
            delta.with_chronicle(
                self.chronicle.clone(),
                ChronicleNote::at(self.truths.len() as u64),
            )
        };
        let event = EventAspects::command(command_id, delta);
        let (speculative, passages) = self
            .reducer
            .apply(&self.speculative, &event.delta)
            .during("issue_command", || {
                format!("chronicle {}, command {command_id}", self.chronicle)
            })?;
        self.speculative = speculative;

        let provisional_id = LogIndex::new(self.next_provisional);
        self.next_provisional += 1;
        self.ring.push_back(Story::new(
            command_id,
            event.clone(),
            provisional_id,
            passages.clone(),
        ))?;
        self.stats.commands_issued += 1;

        let premiere = StoryNotice {
            chronicle: self.chronicle.clone(),
            command_id,
            phase: StoryPhase::Premiere,
            provisional_id: Some(provisional_id),
            log_index: None,
            passages,
        };
        self.recite(&premiere);
        self.counter.notify(self.ring.len());

        let (sender, truth) = oneshot::channel();
        self.outcomes.insert(command_id, sender);
        self.submit(vec![event], ChronicleOptions::default());

        Ok(CommandIssued {
            chronicle: self.chronicle.clone(),
            command_id,
            provisional_id,
            premiere,
            truth,
        })
    }

    /// Submit a batch upstream; watcher tasks report each settled result
    /// back through the op queue.
    fn submit(&self, events: Vec<EventAspects>, options: ChronicleOptions) {
        let Some(connection) = self.connection.clone() else {
            return;
        };
        let command_ids: Vec<CommandId> =
            events.iter().filter_map(|event| event.command_id()).collect();
        let ops = self.ops.clone();
        tokio::spawn(async move {
            match connection.chronicle_events(events, options).await {
                Ok(submitted) => {
                    for result in submitted.event_results {
                        let ops = ops.clone();
                        tokio::spawn(async move {
                            let command_id = result.command_id;
                            let outcome = result.settled().await;
                            let _ = ops.send(Op::Outcome {
                                command_id,
                                outcome,
                            });
                        });
                    }
                }
                Err(error) => {
                    for command_id in command_ids {
                        let _ = ops.send(Op::Outcome {
                            command_id,
                            outcome: Err(error.clone()),
                        });
                    }
                }
            }
        });
    }

    fn receive_truths(&mut self, events: Vec<VersionedEvent>) {
        for event in events {
            if let Err(error) = self.reconcile(event) {
                // Protocol errors are fatal for the event, never silently
                // swallowed.
                tracing::error!(
                    chronicle = %self.chronicle,
                    %error,
                    "dropping irreconcilable truth"
                );
            }
        }
    }

    /// Reconcile one incoming truth against the pending queue.
    fn reconcile(&mut self, event: VersionedEvent) -> FabulaResult<()> {
        let event = upgrade_to_current(event)
            .during("reconcile_truth", || format!("chronicle {}", self.chronicle))?;
        let Some(event) = extract_for_chronicle(event, &self.chronicle)? else {
            // Not addressed to this chronicle.
            return Ok(());
        };
        let index = event.log_index().ok_or_else(|| {
            FabulaError::MalformedEvent("truth without log aspect".to_string())
        })?;
        let expected = self.truths.len() as u64;
        if index.0 < expected {
            // Redelivery of an already-settled truth is a no-op.
            self.stats.duplicates_ignored += 1;
            return Ok(());
        }
        if index.0 > expected {
            return Err(FabulaError::MalformedEvent(format!(
                "gap in truth log of {}: got index {index}, expected {expected}",
                self.chronicle
            )));
        }

        let matched = event
            .command_id()
            .and_then(|command_id| self.ring.lookup(command_id));
        match matched {
            Some(handle) => self.confirm_local(handle, event),
            None => self.confirm_foreign(event),
        }
    }

    /// A truth for a command this engine issued: settle it, rebasing the
    /// stories that were speculatively ordered ahead of the authority's
    /// placement.
    fn confirm_local(&mut self, handle: StoryHandle, truth: EventAspects) -> FabulaResult<()> {
        let is_front = self.ring.first() == Some(handle);
        // Stories after the matched one sat on top of its speculative
        // delta; they are reverted and re-applied over the truth.
        let rebased: Vec<(CommandId, Vec<Passage>)> = if is_front {
            Vec::new()
        } else {
            self.ring
                .suffix_after(handle)
                .into_iter()
                .filter_map(|command_id| {
                    let handle = self.ring.lookup(command_id)?;
                    let story = self.ring.get(handle)?;
                    Some((command_id, story.passages.clone()))
                })
                .collect()
        };

        let mut story = self.ring.remove(handle)?;
        let command_id = story.command_id;
        let index = truth.log_index().expect("reconcile checked the log aspect");
        story.log_index = Some(index);
        if !is_front {
            self.stats.rebases += 1;
            tracing::debug!(
                chronicle = %self.chronicle,
                %command_id,
                %index,
                rebased = rebased.len(),
                "out-of-order confirmation, rebasing"
            );
        }

        for (reverted_id, passages) in rebased.iter().rev() {
            self.recite(&StoryNotice {
                chronicle: self.chronicle.clone(),
                command_id: *reverted_id,
                phase: StoryPhase::Revert,
                provisional_id: None,
                log_index: None,
                passages: passages.clone(),
            });
        }

        let (floor, passages) = self
            .reducer
            .apply(&self.floor, &truth.delta)
            .during("confirm_local", || {
                format!("chronicle {}, command {command_id}", self.chronicle)
            })?;
        self.floor = floor;
        self.truths.push(truth.clone());
        self.stats.truths_confirmed += 1;

        self.recite(&StoryNotice {
            chronicle: self.chronicle.clone(),
            command_id,
            phase: StoryPhase::Confirmation,
            provisional_id: Some(story.provisional_id),
            log_index: Some(index),
            passages,
        });

        self.rederive()?;
        self.recite_reapplied(&rebased);
        self.counter.notify(self.ring.len());
        // Resolve the issuing caller last, once every follower notice for
        // this step is already on its way.
        if let Some(sender) = self.outcomes.remove(&command_id) {
            let _ = sender.send(Ok(CommandOutcome::Confirmed(truth)));
        }
        Ok(())
    }

    /// A truth produced by another actor entirely: applies at the
    /// confirmed head, shifting the pending stories' base forward without
    /// touching their content.
    fn confirm_foreign(&mut self, truth: EventAspects) -> FabulaResult<()> {
        let (floor, passages) = self
            .reducer
            .apply(&self.floor, &truth.delta)
            .during("confirm_foreign", || format!("chronicle {}", self.chronicle))?;
        self.floor = floor;
        let notice = StoryNotice {
            chronicle: self.chronicle.clone(),
            command_id: truth.command_id().unwrap_or(CommandId::ZERO),
            phase: StoryPhase::Confirmation,
            provisional_id: None,
            log_index: truth.log_index(),
            passages,
        };
        self.truths.push(truth);
        self.stats.foreign_truths += 1;
        self.next_provisional = self
            .next_provisional
            .max((self.truths.len() + self.ring.len()) as u64);
        self.recite(&notice);
        self.rederive()
    }

    /// Authority rejection: the inverse of an out-of-order confirmation.
    /// The story is reverted instead of promoted and the reason reaches
    /// the issuing caller as an ordinary outcome.
    fn reject(&mut self, command_id: CommandId, reason: String) {
        if let Some(handle) = self.ring.lookup(command_id) {
            let rebased: Vec<(CommandId, Vec<Passage>)> = self
                .ring
                .suffix_after(handle)
                .into_iter()
                .filter_map(|suffix_id| {
                    let handle = self.ring.lookup(suffix_id)?;
                    let story = self.ring.get(handle)?;
                    Some((suffix_id, story.passages.clone()))
                })
                .collect();
            let story = match self.ring.remove(handle) {
                Ok(story) => story,
                Err(error) => {
                    tracing::error!(chronicle = %self.chronicle, %error, "revert failed");
                    return;
                }
            };
            self.stats.rejections += 1;
            tracing::warn!(
                chronicle = %self.chronicle,
                %command_id,
                reason,
                "command rejected, reverting"
            );

            for (reverted_id, passages) in rebased.iter().rev() {
                self.recite(&StoryNotice {
                    chronicle: self.chronicle.clone(),
                    command_id: *reverted_id,
                    phase: StoryPhase::Revert,
                    provisional_id: None,
                    log_index: None,
                    passages: passages.clone(),
                });
            }
            self.recite(&StoryNotice {
                chronicle: self.chronicle.clone(),
                command_id,
                phase: StoryPhase::Revert,
                provisional_id: Some(story.provisional_id),
                log_index: None,
                passages: story.passages,
            });

            if let Err(error) = self.rederive() {
                tracing::error!(chronicle = %self.chronicle, %error, "rederive after revert failed");
            }
            self.recite_reapplied(&rebased);
            self.counter.notify(self.ring.len());
        }
        if let Some(sender) = self.outcomes.remove(&command_id) {
            let _ = sender.send(Ok(CommandOutcome::Rejected { reason }));
        }
    }

    fn handle_outcome(&mut self, command_id: CommandId, outcome: FabulaResult<CommandOutcome>) {
        match outcome {
            Ok(CommandOutcome::Confirmed(truth)) => {
                if let Err(error) = self.reconcile(VersionedEvent::current(truth)) {
                    tracing::error!(
                        chronicle = %self.chronicle,
                        %command_id,
                        %error,
                        "confirmation outcome failed to reconcile"
                    );
                }
            }
            Ok(CommandOutcome::Rejected { reason }) => self.reject(command_id, reason),
            Err(error) => {
                // Cancellation or transport failure: inform the caller,
                // keep the story pending for a reconnect replay.
                tracing::debug!(
                    chronicle = %self.chronicle,
                    %command_id,
                    %error,
                    "submission did not settle"
                );
                if let Some(sender) = self.outcomes.remove(&command_id) {
                    let _ = sender.send(Err(error));
                }
            }
        }
    }

    /// Replay the pending ring over the confirmed floor, refreshing each
    /// story's premiere passages.
    fn rederive(&mut self) -> FabulaResult<()> {
        let mut state = self.floor.clone();
        for handle in self.ring.handles() {
            let delta = match self.ring.get(handle) {
                Some(story) => story.event.delta.clone(),
                None => continue,
            };
            let (next, passages) = self.reducer.apply(&state, &delta).during("rederive", || {
                format!("chronicle {}", self.chronicle)
            })?;
            state = next;
            if let Some(story) = self.ring.get_mut(handle) {
                story.passages = passages;
            }
        }
        self.speculative = state;
        Ok(())
    }

    fn recite(&mut self, notice: &StoryNotice) {
        self.followers
            .retain(|follower| follower.send(notice.clone()).is_ok());
    }

    /// Premiere notices for the rebased stories' re-application, with
    /// their refreshed passages.
    fn recite_reapplied(&mut self, rebased: &[(CommandId, Vec<Passage>)]) {
        for (rebased_id, _) in rebased {
            let Some(handle) = self.ring.lookup(*rebased_id) else {
                continue;
            };
            let Some(notice) = self.ring.get(handle).map(|story| StoryNotice {
                chronicle: self.chronicle.clone(),
                command_id: *rebased_id,
                phase: StoryPhase::Premiere,
                provisional_id: Some(story.provisional_id),
                log_index: None,
                passages: story.passages.clone(),
            }) else {
                continue;
            };
            self.recite(&notice);
        }
    }

    /// Teardown: cancel the connection's outstanding futures, keep the
    /// pending stories so a reconnect can resume.
    async fn detach(&mut self) {
        self.generation += 1;
        if let Some(connection) = self.connection.take() {
            connection.disconnect().await;
            tracing::info!(
                chronicle = %self.chronicle,
                pending = self.ring.len(),
                "chronicle detached"
            );
        }
        self.state = ChronicleState::Detached;
    }

    /// Resume on a fresh connection: catch up on truths confirmed while
    /// detached, then resubmit the surviving pending stories in their
    /// original order.
    async fn reattach(&mut self, connection: Arc<dyn Connection>) -> FabulaResult<()> {
        if self.connection.is_some() {
            return Ok(());
        }
        self.generation += 1;
        self.connection = Some(Arc::clone(&connection));
        self.start_pump(connection.subscribe());
        self.synchronize().await?;
        let replay: Vec<EventAspects> = self
            .ring
            .iter()
            .map(|(_, story)| story.event.clone())
            .collect();
        if !replay.is_empty() {
            tracing::info!(
                chronicle = %self.chronicle,
                commands = replay.len(),
                "resubmitting detached commands"
            );
            self.submit(replay, ChronicleOptions { replay: true });
        }
        Ok(())
    }
}
