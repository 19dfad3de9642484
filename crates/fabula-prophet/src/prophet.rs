//! FalseProphet - the reconciliation gateway
//!
//! Owns the authority registry and identity mediator, and one serialized
//! reconciliation worker per acquired chronicle. Connections are chained
//! persistence-first: commands land in the local scribe before travelling
//! up to the authority, and confirmed truths flow back down the same
//! chain.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Mutex};

use fabula_authority::{AuthorityRegistry, IdentityMediator};
use fabula_connect::{CommandOutcome, Connection, ScribeConnection};
use fabula_core::{
    ChronicleUri, CommandId, DeltaAspect, EventAspects, FabulaError, FabulaResult, LogIndex,
};
use fabula_wire::extract_for_chronicle;

use crate::chronicler::{Chronicler, Op};
use crate::notify::StoryNotice;
use crate::reducer::Reducer;

/// Gateway configuration.
#[derive(Clone, Copy, Debug)]
pub struct ProphetConfig {
    /// Upper bound on locally pending commands per chronicle; issuance
    /// fails beyond it.
    pub max_pending_commands: usize,
}

impl Default for ProphetConfig {
    fn default() -> Self {
        ProphetConfig {
            max_pending_commands: 1024,
        }
    }
}

/// Per-chronicle reconciliation counters.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProphetStats {
    pub commands_issued: u64,
    pub truths_confirmed: u64,
    pub foreign_truths: u64,
    pub rebases: u64,
    pub rejections: u64,
    pub duplicates_ignored: u64,
}

/// Lifecycle of one chronicle's reconciliation worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChronicleState {
    Uninitialized,
    /// Initial narration in flight.
    Synchronizing,
    Live,
    /// Connection released; pending stories retained for a reconnect.
    Detached,
}

/// Point-in-time view of a chronicle's reconciliation state.
#[derive(Clone, Debug)]
pub struct ChronicleSnapshot<S> {
    pub state: ChronicleState,
    pub truth_count: u64,
    pub pending_count: usize,
    /// Command ids still pending, in ring order.
    pub pending: Vec<CommandId>,
    /// State after the confirmed truths only.
    pub confirmed: S,
    /// State after confirmed truths plus pending commands.
    pub speculative: S,
    pub stats: ProphetStats,
}

/// A successfully issued command: the premiere already applied, the
/// authority's verdict still pending.
#[derive(Debug)]
pub struct CommandIssued {
    pub(crate) chronicle: ChronicleUri,
    pub command_id: CommandId,
    pub provisional_id: LogIndex,
    pub premiere: StoryNotice,
    pub(crate) truth: oneshot::Receiver<FabulaResult<CommandOutcome>>,
}

impl CommandIssued {
    /// Wait for the authority's verdict: confirmation, rejection, or a
    /// cancellation error if the connection was torn down first.
    pub async fn settled(self) -> FabulaResult<CommandOutcome> {
        match self.truth.await {
            Ok(outcome) => outcome,
            Err(_) => Err(FabulaError::Cancelled {
                operation: "issue_command",
                chronicle: self.chronicle,
            }),
        }
    }
}

/// Cheap cloneable handle driving one chronicle's serialized worker.
pub struct ChronicleHandle<S> {
    chronicle: ChronicleUri,
    ops: mpsc::UnboundedSender<Op<S>>,
}

impl<S> Clone for ChronicleHandle<S> {
    fn clone(&self) -> Self {
        ChronicleHandle {
            chronicle: self.chronicle.clone(),
            ops: self.ops.clone(),
        }
    }
}

impl<S> ChronicleHandle<S> {
    pub(crate) fn new(chronicle: ChronicleUri, ops: mpsc::UnboundedSender<Op<S>>) -> Self {
        ChronicleHandle { chronicle, ops }
    }

    pub fn chronicle(&self) -> &ChronicleUri {
        &self.chronicle
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Op<S>,
    ) -> FabulaResult<T> {
        let (reply, response) = oneshot::channel();
        self.ops
            .send(build(reply))
            .map_err(|_| FabulaError::NotConnected(self.chronicle.clone()))?;
        response
            .await
            .map_err(|_| FabulaError::NotConnected(self.chronicle.clone()))
    }

    /// Issue one command: applied optimistically before this returns, with
    /// the premiere notice inside the result.
    pub async fn issue_command(&self, delta: DeltaAspect) -> FabulaResult<CommandIssued> {
        self.request(|reply| Op::Issue {
            command_id: None,
            delta,
            reply,
        })
        .await?
    }

    /// Issue a command under a caller-assigned id; used when one logical
    /// transaction fans out over several chronicles.
    pub async fn issue_prepared(
        &self,
        command_id: CommandId,
        delta: DeltaAspect,
    ) -> FabulaResult<CommandIssued> {
        self.request(|reply| Op::Issue {
            command_id: Some(command_id),
            delta,
            reply,
        })
        .await?
    }

    pub async fn snapshot(&self) -> FabulaResult<ChronicleSnapshot<S>> {
        self.request(|reply| Op::Snapshot { reply }).await
    }

    pub async fn pending_count(&self) -> FabulaResult<usize> {
        Ok(self.snapshot().await?.pending_count)
    }

    /// Follow this chronicle's story notices (premieres, confirmations,
    /// reverts) in delivery order.
    pub async fn subscribe(&self) -> FabulaResult<mpsc::UnboundedReceiver<StoryNotice>> {
        self.request(|reply| Op::Subscribe { reply }).await
    }

    /// Follow pending-command-count changes, delivered through the
    /// serialized notifier.
    pub async fn subscribe_command_count(
        &self,
    ) -> FabulaResult<mpsc::UnboundedReceiver<usize>> {
        self.request(|reply| Op::SubscribeCount { reply }).await
    }

    /// Test seam: park the count notifier before its next flush until
    /// `gate` fires.
    pub fn install_count_gate(&self, gate: oneshot::Receiver<()>) -> FabulaResult<()> {
        self.ops
            .send(Op::InstallCountGate { gate })
            .map_err(|_| FabulaError::NotConnected(self.chronicle.clone()))
    }

    /// Release the chronicle's connection: outstanding futures are
    /// cancelled, pending stories detach but survive.
    pub async fn detach(&self) -> FabulaResult<()> {
        self.request(|reply| Op::Detach { reply }).await
    }

    /// Resume on a fresh connection after a detach.
    pub async fn reattach(&self, connection: Arc<dyn Connection>) -> FabulaResult<()> {
        self.request(|reply| Op::Reattach { connection, reply })
            .await?
    }
}

/// The reconciliation orchestrator gateway.
pub struct FalseProphet<R: Reducer> {
    registry: Arc<AuthorityRegistry>,
    identities: Arc<IdentityMediator>,
    reducer: R,
    config: ProphetConfig,
    chronicles: Mutex<HashMap<ChronicleUri, ChronicleHandle<R::State>>>,
}

impl<R> FalseProphet<R>
where
    R: Reducer + Clone + 'static,
    R::State: 'static,
{
    pub fn new(
        registry: Arc<AuthorityRegistry>,
        identities: Arc<IdentityMediator>,
        reducer: R,
        config: ProphetConfig,
    ) -> Self {
        FalseProphet {
            registry,
            identities,
            reducer,
            config,
            chronicles: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &AuthorityRegistry {
        &self.registry
    }

    pub fn identities(&self) -> &IdentityMediator {
        &self.identities
    }

    /// Resolve the chronicle's authority and build the connection chain:
    /// local scribe first, authority connection upstream of it.
    async fn open_chain(&self, chronicle: &ChronicleUri) -> FabulaResult<Arc<dyn Connection>> {
        let authority = self.registry.resolve_authority_of_chronicle(chronicle)?;
        let upstream = authority.open_connection(chronicle.clone()).await?;
        let scribe = ScribeConnection::connect(upstream).await?;
        Ok(scribe)
    }

    /// The handle for `chronicle`, spawning (or reattaching) its worker on
    /// demand.
    pub async fn acquire(
        &self,
        chronicle: ChronicleUri,
    ) -> FabulaResult<ChronicleHandle<R::State>> {
        let mut chronicles = self.chronicles.lock().await;
        if let Some(handle) = chronicles.get(&chronicle).cloned() {
            if handle.snapshot().await?.state == ChronicleState::Detached {
                let connection = self.open_chain(&chronicle).await?;
                handle.reattach(connection).await?;
            }
            return Ok(handle);
        }
        let connection = self.open_chain(&chronicle).await?;
        let handle = Chronicler::spawn(
            chronicle.clone(),
            connection,
            self.reducer.clone(),
            self.config,
        );
        chronicles.insert(chronicle, handle.clone());
        Ok(handle)
    }

    /// Release a chronicle's connection; its pending stories survive for
    /// a later [`FalseProphet::acquire`].
    pub async fn release(&self, chronicle: &ChronicleUri) -> FabulaResult<()> {
        let handle = self
            .chronicles
            .lock()
            .await
            .get(chronicle)
            .cloned()
            .ok_or_else(|| FabulaError::NotConnected(chronicle.clone()))?;
        handle.detach().await
    }

    /// Issue one composite transaction spanning the chronicles named in
    /// its envelope. The transaction is decomposed into per-chronicle
    /// slices before any chronicle-local state is touched; every slice
    /// carries the same command id.
    pub async fn issue_transaction(
        &self,
        delta: DeltaAspect,
    ) -> FabulaResult<Vec<CommandIssued>> {
        let chronicles: Vec<ChronicleUri> = delta
            .chronicles
            .as_ref()
            .ok_or_else(|| {
                FabulaError::MalformedDelta("transaction without chronicle envelope".to_string())
            })?
            .keys()
            .cloned()
            .collect();
        let command_id = CommandId::new(rand::random());
        let event = EventAspects::command(command_id, delta);

        // Decompose fully (and acquire every involved chronicle) before
        // the first slice is issued.
        let mut slices = Vec::with_capacity(chronicles.len());
        for chronicle in &chronicles {
            let slice = extract_for_chronicle(event.clone(), chronicle)?.ok_or_else(|| {
                FabulaError::EmptyExtraction {
                    chronicle: chronicle.clone(),
                }
            })?;
            let handle = self.acquire(chronicle.clone()).await?;
            slices.push((handle, slice));
        }

        let mut issued = Vec::with_capacity(slices.len());
        for (handle, slice) in slices {
            issued.push(handle.issue_prepared(command_id, slice.delta).await?);
        }
        Ok(issued)
    }
}

#[cfg(test)]
mod tests {
    use fabula_authority::MemorySchemeModule;
    use fabula_core::Mutation;

    use crate::reducer::RegisterReducer;

    use super::*;

    fn gateway() -> FalseProphet<RegisterReducer> {
        let registry = Arc::new(AuthorityRegistry::new());
        registry
            .register_scheme_module(Arc::new(MemorySchemeModule::new()))
            .unwrap();
        FalseProphet::new(
            registry,
            Arc::new(IdentityMediator::new()),
            RegisterReducer,
            ProphetConfig::default(),
        )
    }

    fn chronicle(id: &str) -> ChronicleUri {
        ChronicleUri::parse(&format!("memory://origin?id={id}")).unwrap()
    }

    #[tokio::test]
    async fn test_command_confirms_and_settles() {
        let prophet = gateway();
        let handle = prophet.acquire(chronicle("x")).await.unwrap();
        let issued = handle
            .issue_command(DeltaAspect::mutate(Mutation::set("title", "hello")))
            .await
            .unwrap();
        assert_eq!(issued.provisional_id, LogIndex::ZERO);

        match issued.settled().await.unwrap() {
            CommandOutcome::Confirmed(truth) => {
                assert_eq!(truth.log_index(), Some(LogIndex::ZERO));
            }
            other => panic!("expected confirmation, got {other:?}"),
        }

        // The worker has settled the story by the time the snapshot op is
        // processed behind the confirmation.
        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.state, ChronicleState::Live);
        assert_eq!(snapshot.pending_count, 0);
        assert_eq!(snapshot.truth_count, 1);
        assert_eq!(snapshot.confirmed.get("title"), Some("hello"));
        assert_eq!(snapshot.speculative.get("title"), Some("hello"));
    }

    #[tokio::test]
    async fn test_provisional_ids_strictly_increase() {
        let prophet = gateway();
        let handle = prophet.acquire(chronicle("x")).await.unwrap();
        let mut previous = None;
        for index in 0..5u64 {
            let issued = handle
                .issue_command(DeltaAspect::mutate(Mutation::append("log", "x")))
                .await
                .unwrap();
            assert_eq!(issued.provisional_id, LogIndex::new(index));
            if let Some(previous) = previous {
                assert!(issued.provisional_id > previous);
            }
            previous = Some(issued.provisional_id);
        }
    }

    #[tokio::test]
    async fn test_premiere_is_synchronous_with_issue() {
        let prophet = gateway();
        let handle = prophet.acquire(chronicle("x")).await.unwrap();
        let mut notices = handle.subscribe().await.unwrap();
        let issued = handle
            .issue_command(DeltaAspect::mutate(Mutation::set("k", "v")))
            .await
            .unwrap();
        let notice = notices.recv().await.unwrap();
        assert_eq!(notice.phase, crate::notify::StoryPhase::Premiere);
        assert_eq!(notice.command_id, issued.command_id);
        assert_eq!(notice.provisional_id, Some(issued.provisional_id));
    }

    #[tokio::test]
    async fn test_foreign_truths_reach_followers() {
        let prophet = gateway();
        let uri = chronicle("x");
        let handle = prophet.acquire(uri.clone()).await.unwrap();
        let mut notices = handle.subscribe().await.unwrap();

        // A second actor on the same authority.
        let authority = prophet.registry().resolve_authority_of_chronicle(&uri).unwrap();
        let other = authority.open_connection(uri.clone()).await.unwrap();
        other
            .chronicle_events(
                vec![EventAspects::command(
                    CommandId::new(999),
                    DeltaAspect::mutate(Mutation::set("foreign", "yes")),
                )],
                Default::default(),
            )
            .await
            .unwrap();

        let notice = notices.recv().await.unwrap();
        assert_eq!(notice.phase, crate::notify::StoryPhase::Confirmation);
        assert_eq!(notice.command_id, CommandId::new(999));

        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.confirmed.get("foreign"), Some("yes"));
        assert_eq!(snapshot.stats.foreign_truths, 1);
    }

    #[tokio::test]
    async fn test_acquire_synchronizes_existing_log() {
        let prophet = gateway();
        let uri = chronicle("x");
        // Seed two truths before the prophet ever connects.
        let authority = prophet.registry().resolve_authority_of_chronicle(&uri).unwrap();
        let seed = authority.open_connection(uri.clone()).await.unwrap();
        seed.chronicle_events(
            vec![
                EventAspects::command(
                    CommandId::new(1),
                    DeltaAspect::mutate(Mutation::set("a", "1")),
                ),
                EventAspects::command(
                    CommandId::new(2),
                    DeltaAspect::mutate(Mutation::set("b", "2")),
                ),
            ],
            Default::default(),
        )
        .await
        .unwrap();

        let handle = prophet.acquire(uri).await.unwrap();
        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.truth_count, 2);
        assert_eq!(snapshot.confirmed.get("a"), Some("1"));
        assert_eq!(snapshot.confirmed.get("b"), Some("2"));
        // Provisional ids continue after the confirmed log.
        let issued = handle
            .issue_command(DeltaAspect::mutate(Mutation::set("c", "3")))
            .await
            .unwrap();
        assert_eq!(issued.provisional_id, LogIndex::new(2));
    }

    #[tokio::test]
    async fn test_release_cancels_then_reacquire_resumes() {
        let prophet = gateway();
        let uri = chronicle("x");
        let handle = prophet.acquire(uri.clone()).await.unwrap();
        handle
            .issue_command(DeltaAspect::mutate(Mutation::set("k", "v")))
            .await
            .unwrap()
            .settled()
            .await
            .unwrap();

        prophet.release(&uri).await.unwrap();
        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.state, ChronicleState::Detached);
        let err = handle
            .issue_command(DeltaAspect::mutate(Mutation::set("k", "w")))
            .await
            .unwrap_err();
        assert!(matches!(err, FabulaError::NotConnected(_)));

        // Reacquire: the same worker resumes on a fresh chain.
        let handle = prophet.acquire(uri).await.unwrap();
        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.state, ChronicleState::Live);
        assert_eq!(snapshot.truth_count, 1);
    }

    #[tokio::test]
    async fn test_transaction_spans_chronicles_with_one_command_id() {
        let prophet = gateway();
        let a = chronicle("a");
        let b = chronicle("b");
        let action_a = DeltaAspect::mutate(Mutation::set("title", "alpha"))
            .with_chronicle(a.clone(), Default::default());
        let action_b = DeltaAspect::mutate(Mutation::set("body", "beta"))
            .with_chronicle(b.clone(), Default::default());
        let mut envelope = std::collections::BTreeMap::new();
        envelope.insert(a.clone(), Default::default());
        envelope.insert(b.clone(), Default::default());
        let delta = DeltaAspect::transacted(vec![action_a, action_b]).with_chronicles(envelope);

        let issued = prophet.issue_transaction(delta).await.unwrap();
        assert_eq!(issued.len(), 2);
        assert_eq!(issued[0].command_id, issued[1].command_id);
        for slice in issued {
            assert!(matches!(
                slice.settled().await.unwrap(),
                CommandOutcome::Confirmed(_)
            ));
        }

        let handle_a = prophet.acquire(a).await.unwrap();
        let handle_b = prophet.acquire(b).await.unwrap();
        assert_eq!(
            handle_a.snapshot().await.unwrap().confirmed.get("title"),
            Some("alpha")
        );
        assert_eq!(
            handle_b.snapshot().await.unwrap().confirmed.get("body"),
            Some("beta")
        );
    }

    #[tokio::test]
    async fn test_count_gate_delays_but_preserves_order() {
        let prophet = gateway();
        let handle = prophet.acquire(chronicle("x")).await.unwrap();
        let mut counts = handle.subscribe_command_count().await.unwrap();
        let (release, gate) = oneshot::channel();
        handle.install_count_gate(gate).unwrap();

        handle
            .issue_command(DeltaAspect::mutate(Mutation::set("k", "v")))
            .await
            .unwrap();
        tokio::task::yield_now().await;
        assert!(counts.try_recv().is_err());

        release.send(()).unwrap();
        // First the issuance count, then the settle-to-zero.
        assert_eq!(counts.recv().await, Some(1));
        assert_eq!(counts.recv().await, Some(0));
    }
}
