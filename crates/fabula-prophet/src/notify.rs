//! Follower notification plumbing
//!
//! Followers receive, per chronicle, an ordered sequence of story notices
//! (premiere, confirmation, revert) over unbounded channels so delivery
//! never blocks reconciliation. Pending-command counts travel through one
//! serialized notifier task; an injectable gate can delay - but never
//! reorder or drop - the next flush, which is the test seam for proving
//! notification delivery cannot race ahead of the state it describes.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use fabula_core::{ChronicleUri, CommandId, LogIndex};

use crate::reducer::Passage;

/// What happened to a story.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoryPhase {
    /// The story was applied optimistically (first issuance or
    /// re-application after a rebase).
    Premiere,
    /// The story is durable with an authoritative log position.
    Confirmation,
    /// The story's speculative state was undone.
    Revert,
}

/// One follower notification.
#[derive(Clone, Debug)]
pub struct StoryNotice {
    pub chronicle: ChronicleUri,
    pub command_id: CommandId,
    pub phase: StoryPhase,
    /// Locally assigned position; set on premieres.
    pub provisional_id: Option<LogIndex>,
    /// Authoritative position; set on confirmations.
    pub log_index: Option<LogIndex>,
    pub passages: Vec<Passage>,
}

type Subscribers = Arc<Mutex<Vec<mpsc::UnboundedSender<usize>>>>;
type Gate = Arc<Mutex<Option<oneshot::Receiver<()>>>>;

/// Serialized pending-command-count notifier.
///
/// Counts are flushed by a single worker task in the order they were
/// reported. [`CommandCountNotifier::install_gate`] parks the worker
/// before its next flush until the gate fires (or is dropped).
pub struct CommandCountNotifier {
    counts: mpsc::UnboundedSender<usize>,
    subscribers: Subscribers,
    gate: Gate,
}

impl Default for CommandCountNotifier {
    fn default() -> Self {
        CommandCountNotifier::new()
    }
}

impl CommandCountNotifier {
    pub fn new() -> Self {
        let (counts, mut pending) = mpsc::unbounded_channel::<usize>();
        let subscribers: Subscribers = Arc::new(Mutex::new(Vec::new()));
        let gate: Gate = Arc::new(Mutex::new(None));

        let flush_subscribers = Arc::clone(&subscribers);
        let flush_gate = Arc::clone(&gate);
        tokio::spawn(async move {
            while let Some(count) = pending.recv().await {
                let held = flush_gate.lock().take();
                if let Some(held) = held {
                    // Delay only; a dropped gate sender releases the flush.
                    let _ = held.await;
                }
                flush_subscribers
                    .lock()
                    .retain(|subscriber| subscriber.send(count).is_ok());
            }
        });

        CommandCountNotifier {
            counts,
            subscribers,
            gate,
        }
    }

    /// Report a pending-command-count change.
    pub fn notify(&self, count: usize) {
        let _ = self.counts.send(count);
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<usize> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.subscribers.lock().push(sender);
        receiver
    }

    /// Park the worker before its next flush until `gate` fires. Test
    /// seam; production code never installs one.
    pub fn install_gate(&self, gate: oneshot::Receiver<()>) {
        *self.gate.lock() = Some(gate);
    }
}
