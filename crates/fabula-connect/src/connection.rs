//! The upstream connection contract

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use fabula_core::{
    AuthorityUri, ChronicleUri, CommandId, EventAspects, FabulaError, FabulaResult, LogIndex,
};
use fabula_wire::VersionedEvent;

/// Options for a narration request: replay of confirmed truths in
/// `[index_begin, index_end)`, unbounded on either side if omitted.
#[derive(Clone, Copy, Debug, Default)]
pub struct NarrateOptions {
    pub index_begin: Option<LogIndex>,
    pub index_end: Option<LogIndex>,
}

impl NarrateOptions {
    /// Everything from `index_begin` on.
    pub fn starting_at(index_begin: LogIndex) -> Self {
        NarrateOptions {
            index_begin: Some(index_begin),
            index_end: None,
        }
    }
}

/// Options for a command submission batch.
#[derive(Clone, Copy, Debug, Default)]
pub struct ChronicleOptions {
    /// The batch is a resubmission of detached commands after a reconnect,
    /// not fresh issuance.
    pub replay: bool,
}

/// Eventual outcome of one submitted command: either a confirmed truth
/// with its assigned log position, or an authority rejection. Rejection is
/// an ordinary outcome, not an error - errors are reserved for protocol
/// failures and teardown cancellation.
#[derive(Clone, Debug)]
pub enum CommandOutcome {
    Confirmed(EventAspects),
    Rejected { reason: String },
}

/// Pending result of one submitted command.
#[derive(Debug)]
pub struct EventResult {
    pub command_id: CommandId,
    chronicle: ChronicleUri,
    receiver: oneshot::Receiver<FabulaResult<CommandOutcome>>,
}

impl EventResult {
    pub fn new(
        command_id: CommandId,
        chronicle: ChronicleUri,
    ) -> (oneshot::Sender<FabulaResult<CommandOutcome>>, Self) {
        let (sender, receiver) = oneshot::channel();
        (
            sender,
            EventResult {
                command_id,
                chronicle,
                receiver,
            },
        )
    }

    /// Wait for the authority's verdict. A dropped sender means the
    /// connection was torn down while the submission was outstanding.
    pub async fn settled(self) -> FabulaResult<CommandOutcome> {
        match self.receiver.await {
            Ok(outcome) => outcome,
            Err(_) => Err(FabulaError::Cancelled {
                operation: "chronicle_events",
                chronicle: self.chronicle,
            }),
        }
    }
}

/// Result of submitting a batch of speculative commands upstream.
#[derive(Debug)]
pub struct ChronicledEvents {
    pub event_results: Vec<EventResult>,
}

/// A live, per-chronicle binding to an authority.
///
/// Possibly chained: a local persistence connection wraps a
/// remote-authority connection as its [`Connection::upstream`].
#[async_trait]
pub trait Connection: Send + Sync {
    /// The chronicle this connection is bound to.
    fn chronicle(&self) -> &ChronicleUri;

    /// Request replay of confirmed truths. Concurrent narrations with
    /// different ranges may be outstanding; no index is delivered to more
    /// than one in-flight requester.
    async fn narrate(&self, options: NarrateOptions) -> FabulaResult<Vec<VersionedEvent>>;

    /// Submit speculative commands upstream. Each result eventually
    /// resolves to a confirmed truth or a rejection.
    async fn chronicle_events(
        &self,
        events: Vec<EventAspects>,
        options: ChronicleOptions,
    ) -> FabulaResult<ChronicledEvents>;

    /// The next provisional command position this connection would hand
    /// out; used to verify monotonic assignment.
    fn first_unused_command_id(&self) -> LogIndex;

    /// The wrapped connection one layer closer to the authority, if any.
    fn upstream(&self) -> Option<Arc<dyn Connection>>;

    /// Live feed of confirmed truths for this chronicle, from any actor.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<Vec<VersionedEvent>>;

    /// Tear down: rejects every outstanding narration/submission future
    /// with [`FabulaError::Cancelled`].
    async fn disconnect(&self);
}

/// A long-lived authority service: conflict resolution, log numbering and
/// persistence for every chronicle it authorizes.
#[async_trait]
pub trait Authority: Send + Sync {
    fn uri(&self) -> &AuthorityUri;

    /// Open a live connection to one chronicle under this authority.
    async fn open_connection(
        &self,
        chronicle: ChronicleUri,
    ) -> FabulaResult<Arc<dyn Connection>>;
}

/// Bookkeeping for in-flight narration requests, keyed by requested
/// starting index. Claiming trims a requested range down to the indices no
/// other in-flight request holds, so no index is served twice
/// concurrently.
#[derive(Debug, Default)]
pub struct NarrationLedger {
    // begin -> end, for every claimed in-flight subrange
    claims: Mutex<BTreeMap<u64, u64>>,
}

impl NarrationLedger {
    pub fn new() -> Self {
        NarrationLedger::default()
    }

    /// Claim the subranges of `[begin, end)` not already held by another
    /// in-flight request. Returns the claimed gaps; release them with
    /// [`NarrationLedger::release`] once delivered.
    pub fn claim(&self, begin: u64, end: u64) -> Vec<(u64, u64)> {
        let mut claims = self.claims.lock();
        let mut gaps = Vec::new();
        let mut cursor = begin;
        for (&held_begin, &held_end) in claims.range(..end) {
            if held_end <= cursor {
                continue;
            }
            if held_begin > cursor {
                gaps.push((cursor, held_begin.min(end)));
            }
            cursor = cursor.max(held_end);
            if cursor >= end {
                break;
            }
        }
        if cursor < end {
            gaps.push((cursor, end));
        }
        for &(gap_begin, gap_end) in &gaps {
            claims.insert(gap_begin, gap_end);
        }
        gaps
    }

    pub fn release(&self, ranges: &[(u64, u64)]) {
        let mut claims = self.claims.lock();
        for (begin, _) in ranges {
            claims.remove(begin);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ledger_claims_whole_range_when_free() {
        let ledger = NarrationLedger::new();
        assert_eq!(ledger.claim(0, 10), vec![(0, 10)]);
    }

    #[test]
    fn test_ledger_never_claims_twice() {
        let ledger = NarrationLedger::new();
        let first = ledger.claim(0, 10);
        let second = ledger.claim(5, 15);
        assert_eq!(first, vec![(0, 10)]);
        assert_eq!(second, vec![(10, 15)]);
    }

    #[test]
    fn test_ledger_release_frees_range() {
        let ledger = NarrationLedger::new();
        let claimed = ledger.claim(0, 10);
        ledger.release(&claimed);
        assert_eq!(ledger.claim(0, 10), vec![(0, 10)]);
    }

    #[test]
    fn test_ledger_claims_gap_between_holds() {
        let ledger = NarrationLedger::new();
        ledger.claim(0, 3);
        ledger.claim(6, 9);
        let gaps = ledger.claim(0, 12);
        assert_eq!(gaps, vec![(3, 6), (9, 12)]);
    }

    proptest::proptest! {
        /// No index is ever claimed by two in-flight requests.
        #[test]
        fn test_ledger_claims_are_disjoint(
            requests in proptest::collection::vec((0u64..32, 1u64..16), 1..12)
        ) {
            let ledger = NarrationLedger::new();
            let mut claimed = std::collections::HashSet::new();
            for (begin, span) in requests {
                let gaps = ledger.claim(begin, begin + span);
                for (gap_begin, gap_end) in gaps {
                    proptest::prop_assert!(begin <= gap_begin && gap_end <= begin + span);
                    for index in gap_begin..gap_end {
                        proptest::prop_assert!(claimed.insert(index));
                    }
                }
            }
        }
    }

    #[tokio::test]
    async fn test_event_result_cancelled_on_dropped_sender() {
        let chronicle = ChronicleUri::parse("memory://origin?id=x").unwrap();
        let (sender, result) = EventResult::new(CommandId::new(1), chronicle);
        drop(sender);
        let err = result.settled().await.unwrap_err();
        assert!(err.is_cancellation());
    }
}
