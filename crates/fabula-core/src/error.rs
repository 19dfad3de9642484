//! Error types for the Fabula protocol

use thiserror::Error;

use crate::{AuthorityUri, ChronicleUri, CommandId};

/// Core Fabula errors
#[derive(Error, Debug, Clone)]
pub enum FabulaError {
    // URI errors
    #[error("Malformed authority URI: {0}")]
    MalformedAuthorityUri(String),

    #[error("Malformed chronicle URI: {0}")]
    MalformedChronicleUri(String),

    // Configuration errors
    #[error("No scheme module registered for scheme {scheme:?} of {uri}")]
    UnknownScheme { scheme: String, uri: String },

    #[error("Scheme module already registered for scheme {0:?}")]
    DuplicateScheme(String),

    #[error(
        "No authority config for {uri}: scheme {scheme:?} has no default and \
         none was pre-registered"
    )]
    MissingAuthorityConfig { uri: AuthorityUri, scheme: String },

    #[error("Authority config already registered for {0}")]
    DuplicateAuthorityConfig(AuthorityUri),

    #[error("Public identity already registered for authority {0}")]
    DuplicateIdentity(AuthorityUri),

    #[error("No public identity registered for authority {0}")]
    MissingIdentity(AuthorityUri),

    // Protocol errors
    #[error("Unknown event version {0:?}")]
    UnknownEventVersion(String),

    #[error("Event at version {version:?} carries no command identifier")]
    MissingCommandAspect { version: String },

    #[error(
        "Non-composite event spans {chronicles} chronicles while extracting \
         for {chronicle}"
    )]
    NonCompositeMultiChronicle {
        chronicle: ChronicleUri,
        chronicles: usize,
    },

    #[error(
        "Composite event marked relevant to {chronicle} but no sub-action \
         extracts for it"
    )]
    EmptyExtraction { chronicle: ChronicleUri },

    #[error("Malformed event: {0}")]
    MalformedEvent(String),

    #[error("Malformed delta: {0}")]
    MalformedDelta(String),

    // Story ring errors
    #[error("The story ring sentinel cannot be extracted")]
    SentinelExtraction,

    #[error("Story {0} is already linked into a ring")]
    StoryAlreadyLinked(CommandId),

    #[error("No story for command {0}")]
    StoryNotFound(CommandId),

    // Connection errors
    #[error("Operation {operation:?} cancelled: connection to {chronicle} closed")]
    Cancelled {
        operation: &'static str,
        chronicle: ChronicleUri,
    },

    #[error("No live connection for chronicle {0}")]
    NotConnected(ChronicleUri),

    #[error("Pending command limit {limit} reached on {chronicle}")]
    PendingLimit {
        chronicle: ChronicleUri,
        limit: usize,
    },

    // Context wrapper - every internal failure crosses a component boundary
    // wrapped with the operation name and the relevant local state.
    #[error("{operation} ({context}): {source}")]
    Wrapped {
        operation: &'static str,
        context: String,
        #[source]
        source: Box<FabulaError>,
    },
}

impl FabulaError {
    /// Whether the error is the teardown cancellation kind, as opposed to an
    /// authority rejection or a fatal protocol failure.
    pub fn is_cancellation(&self) -> bool {
        match self {
            FabulaError::Cancelled { .. } => true,
            FabulaError::Wrapped { source, .. } => source.is_cancellation(),
            _ => false,
        }
    }
}

/// Result type for Fabula operations
pub type FabulaResult<T> = Result<T, FabulaError>;

/// Attaches the operation name and a dump of the relevant local state to a
/// failure before it propagates.
pub trait OperationContext<T> {
    fn during(self, operation: &'static str, context: impl FnOnce() -> String)
        -> FabulaResult<T>;
}

impl<T> OperationContext<T> for FabulaResult<T> {
    fn during(
        self,
        operation: &'static str,
        context: impl FnOnce() -> String,
    ) -> FabulaResult<T> {
        self.map_err(|source| FabulaError::Wrapped {
            operation,
            context: context(),
            source: Box::new(source),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancellation_is_distinguishable() {
        let chronicle = ChronicleUri::parse("memory://origin?id=x").unwrap();
        let cancelled = FabulaError::Cancelled {
            operation: "narrate",
            chronicle,
        };
        assert!(cancelled.is_cancellation());
        assert!(!FabulaError::SentinelExtraction.is_cancellation());
    }

    #[test]
    fn test_wrapped_preserves_kind() {
        let chronicle = ChronicleUri::parse("memory://origin?id=x").unwrap();
        let inner: FabulaResult<()> = Err(FabulaError::Cancelled {
            operation: "chronicle_events",
            chronicle: chronicle.clone(),
        });
        let wrapped = inner.during("reconcile_truth", || format!("chronicle {chronicle}"));
        let err = wrapped.unwrap_err();
        assert!(err.is_cancellation());
        assert!(err.to_string().contains("reconcile_truth"));
    }
}
