//! End-to-end reconciliation scenarios
//!
//! Each scenario drives the full stack - gateway, registry, scribe chain,
//! scripted authority - and checks the externally observable contract:
//! notice ordering, pending-queue contents and convergence with the
//! confirmed truth log.

use std::sync::Arc;

use fabula_authority::{AuthorityRegistry, IdentityMediator};
use fabula_core::{AuthorityUri, ChronicleUri};
use fabula_prophet::{ChronicleHandle, FalseProphet, ProphetConfig, RegisterMap, RegisterReducer};

use crate::scenario::{ScenarioAuthority, ScenarioSchemeModule};

/// One scripted-authority stage: a gateway wired to a scenario authority
/// through a registry of its own.
pub struct ScenarioStage {
    pub authority: ScenarioAuthority,
    pub prophet: FalseProphet<RegisterReducer>,
    pub chronicle: ChronicleUri,
}

impl ScenarioStage {
    /// Stage whose authority holds confirmations for scripting.
    pub fn holding() -> Self {
        Self::new(true)
    }

    /// Stage whose authority confirms in submission order.
    pub fn passthrough() -> Self {
        Self::new(false)
    }

    fn new(hold: bool) -> Self {
        let uri = AuthorityUri::parse("scenario://stage").expect("static uri");
        let authority = if hold {
            ScenarioAuthority::holding(uri.clone())
        } else {
            ScenarioAuthority::passthrough(uri.clone())
        };
        let registry = Arc::new(AuthorityRegistry::new());
        registry
            .register_scheme_module(Arc::new(ScenarioSchemeModule::new(authority.clone())))
            .expect("fresh registry");
        let prophet = FalseProphet::new(
            registry,
            Arc::new(IdentityMediator::new()),
            RegisterReducer,
            ProphetConfig::default(),
        );
        let chronicle = ChronicleUri::parse("scenario://stage?id=log").expect("static uri");
        ScenarioStage {
            authority,
            prophet,
            chronicle,
        }
    }

    pub async fn acquire(&self) -> ChronicleHandle<RegisterMap> {
        self.prophet
            .acquire(self.chronicle.clone())
            .await
            .expect("stage chronicle acquires")
    }
}
