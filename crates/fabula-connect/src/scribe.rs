//! Scribe connection - local persistence layer
//!
//! Chains in front of an upstream authority connection: every confirmed
//! truth that flows past is recorded into a local, replayable store, so a
//! later narration (or a reconnect) can be served without a round-trip.
//! Tearing the scribe down cancels its outstanding futures and propagates
//! the disconnect upstream.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use fabula_core::{
    ChronicleUri, EventAspects, FabulaError, FabulaResult, LogIndex, OperationContext,
};
use fabula_wire::{upgrade_to_current, VersionedEvent};

use crate::connection::{
    ChronicleOptions, ChronicledEvents, CommandOutcome, Connection, EventResult, NarrateOptions,
    NarrationLedger,
};

type SharedStore = Arc<Mutex<Vec<EventAspects>>>;
type SharedSubscribers = Arc<Mutex<Vec<mpsc::UnboundedSender<Vec<VersionedEvent>>>>>;

/// Local persistence connection wrapping an upstream authority connection.
pub struct ScribeConnection {
    chronicle: ChronicleUri,
    upstream: Arc<dyn Connection>,
    store: SharedStore,
    subscribers: SharedSubscribers,
    narrations: NarrationLedger,
    next_provisional: AtomicU64,
    closed: watch::Sender<bool>,
}

impl ScribeConnection {
    /// Connect in front of `upstream`, replaying its full truth log into
    /// the local store and following its live feed from then on.
    pub async fn connect(upstream: Arc<dyn Connection>) -> FabulaResult<Arc<Self>> {
        let chronicle = upstream.chronicle().clone();
        let feed = upstream.subscribe();
        let backlog = upstream
            .narrate(NarrateOptions::default())
            .await
            .during("scribe_connect", || format!("chronicle {chronicle}"))?;

        let store: SharedStore = Arc::new(Mutex::new(Vec::new()));
        let subscribers: SharedSubscribers = Arc::new(Mutex::new(Vec::new()));
        for event in backlog {
            record_truth(&chronicle, &store, event);
        }
        let confirmed = store.lock().len() as u64;
        let (closed, closed_rx) = watch::channel(false);

        let scribe = Arc::new(ScribeConnection {
            chronicle: chronicle.clone(),
            upstream,
            store: Arc::clone(&store),
            subscribers: Arc::clone(&subscribers),
            narrations: NarrationLedger::new(),
            next_provisional: AtomicU64::new(confirmed),
            closed,
        });
        tokio::spawn(follow_feed(chronicle, feed, closed_rx, store, subscribers));
        Ok(scribe)
    }

    fn is_open(&self) -> bool {
        !*self.closed.borrow()
    }

    fn ensure_open(&self, operation: &'static str) -> FabulaResult<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(FabulaError::Cancelled {
                operation,
                chronicle: self.chronicle.clone(),
            })
        }
    }

    /// Number of truths currently persisted locally.
    pub fn recorded_truth_count(&self) -> u64 {
        self.store.lock().len() as u64
    }
}

/// Pump the upstream live feed into the local store and on to downstream
/// subscribers.
async fn follow_feed(
    chronicle: ChronicleUri,
    mut feed: mpsc::UnboundedReceiver<Vec<VersionedEvent>>,
    mut closed: watch::Receiver<bool>,
    store: SharedStore,
    subscribers: SharedSubscribers,
) {
    loop {
        tokio::select! {
            _ = closed.wait_for(|closed| *closed) => break,
            batch = feed.recv() => {
                let Some(batch) = batch else { break };
                for event in batch.iter().cloned() {
                    record_truth(&chronicle, &store, event);
                }
                subscribers
                    .lock()
                    .retain(|subscriber| subscriber.send(batch.clone()).is_ok());
            }
        }
    }
}

fn record_truth(chronicle: &ChronicleUri, store: &SharedStore, event: VersionedEvent) {
    let truth = match upgrade_to_current(event) {
        Ok(truth) => truth,
        Err(error) => {
            tracing::warn!(%chronicle, %error, "scribe dropped malformed truth");
            return;
        }
    };
    let Some(index) = truth.log_index() else {
        tracing::warn!(%chronicle, "scribe dropped unconfirmed event from truth feed");
        return;
    };
    let mut store = store.lock();
    // Gapless by authority guarantee; anything below the high-water mark
    // was already recorded.
    if index.0 == store.len() as u64 {
        store.push(truth);
    }
}

#[async_trait]
impl Connection for ScribeConnection {
    fn chronicle(&self) -> &ChronicleUri {
        &self.chronicle
    }

    async fn narrate(&self, options: NarrateOptions) -> FabulaResult<Vec<VersionedEvent>> {
        self.ensure_open("narrate")?;
        let begin = options.index_begin.unwrap_or(LogIndex::ZERO).0;
        let end = options
            .index_end
            .map(|index| index.0)
            .unwrap_or_else(|| self.store.lock().len() as u64);
        if begin >= end {
            return Ok(Vec::new());
        }
        let claimed = self.narrations.claim(begin, end);
        let store = self.store.lock();
        let mut truths = Vec::new();
        for &(gap_begin, gap_end) in &claimed {
            let gap_begin = (gap_begin as usize).min(store.len());
            let gap_end = (gap_end as usize).min(store.len());
            truths.extend(
                store[gap_begin..gap_end]
                    .iter()
                    .cloned()
                    .map(VersionedEvent::current),
            );
        }
        drop(store);
        self.narrations.release(&claimed);
        Ok(truths)
    }

    async fn chronicle_events(
        &self,
        events: Vec<EventAspects>,
        options: ChronicleOptions,
    ) -> FabulaResult<ChronicledEvents> {
        self.ensure_open("chronicle_events")?;
        self.next_provisional
            .fetch_add(events.len() as u64, Ordering::AcqRel);
        let upstream_results = self
            .upstream
            .chronicle_events(events, options)
            .await
            .during("chronicle_events", || {
                format!("scribe for chronicle {}", self.chronicle)
            })?;

        let mut event_results = Vec::with_capacity(upstream_results.event_results.len());
        for upstream_result in upstream_results.event_results {
            let (sender, result) =
                EventResult::new(upstream_result.command_id, self.chronicle.clone());
            let store = Arc::clone(&self.store);
            let chronicle = self.chronicle.clone();
            let mut closed = self.closed.subscribe();
            tokio::spawn(async move {
                tokio::select! {
                    _ = closed.wait_for(|closed| *closed) => {
                        let _ = sender.send(Err(FabulaError::Cancelled {
                            operation: "chronicle_events",
                            chronicle,
                        }));
                    }
                    outcome = upstream_result.settled() => {
                        if let Ok(CommandOutcome::Confirmed(truth)) = &outcome {
                            record_truth(&chronicle, &store, VersionedEvent::current(truth.clone()));
                        }
                        let _ = sender.send(outcome);
                    }
                }
            });
            event_results.push(result);
        }
        Ok(ChronicledEvents { event_results })
    }

    fn first_unused_command_id(&self) -> LogIndex {
        LogIndex::new(self.next_provisional.load(Ordering::Acquire))
    }

    fn upstream(&self) -> Option<Arc<dyn Connection>> {
        Some(Arc::clone(&self.upstream))
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<Vec<VersionedEvent>> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.subscribers.lock().push(sender);
        receiver
    }

    async fn disconnect(&self) {
        if !self.closed.send_replace(true) {
            tracing::debug!(chronicle = %self.chronicle, "scribe connection closed");
            self.upstream.disconnect().await;
        }
    }
}
