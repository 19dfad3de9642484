//! Identity mediator
//!
//! Associates a logical public identity with an authority, for signing and
//! attribution of the commands issued against it. At most one identity is
//! active per authority at a time.

use std::collections::{BTreeMap, HashMap};

use parking_lot::RwLock;

use fabula_core::{AuthorityUri, ChronicleUri, FabulaError, FabulaResult};

/// Opaque credential claims attached to a registered identity.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IdentityOptions {
    pub claims: BTreeMap<String, String>,
}

impl IdentityOptions {
    pub fn with_claim(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.claims.insert(key.into(), value.into());
        self
    }
}

/// A registered public identity: an address resolvable to its authority,
/// plus the credentials used when issuing commands there.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublicIdentity {
    pub reference: ChronicleUri,
    pub claims: BTreeMap<String, String>,
}

/// One active public identity per authority.
#[derive(Default)]
pub struct IdentityMediator {
    identities: RwLock<HashMap<AuthorityUri, PublicIdentity>>,
}

impl IdentityMediator {
    pub fn new() -> Self {
        IdentityMediator::default()
    }

    /// Register `identity` for its authority. Fails if that authority
    /// already has an active identity.
    pub fn add(&self, identity: ChronicleUri, options: IdentityOptions) -> FabulaResult<()> {
        let authority = identity.authority().clone();
        let mut identities = self.identities.write();
        if identities.contains_key(&authority) {
            return Err(FabulaError::DuplicateIdentity(authority));
        }
        tracing::debug!(%authority, identity = %identity, "public identity registered");
        identities.insert(
            authority,
            PublicIdentity {
                reference: identity,
                claims: options.claims,
            },
        );
        Ok(())
    }

    /// The identity registered for `reference`'s authority; loud failure
    /// when none is.
    pub fn get(&self, reference: &ChronicleUri) -> FabulaResult<PublicIdentity> {
        self.try_get(reference)
            .ok_or_else(|| FabulaError::MissingIdentity(reference.authority().clone()))
    }

    /// Like [`IdentityMediator::get`], but quiet.
    pub fn try_get(&self, reference: &ChronicleUri) -> Option<PublicIdentity> {
        self.identities.read().get(reference.authority()).cloned()
    }

    /// Deactivate the identity of `authority`, if any.
    pub fn remove(&self, authority: &AuthorityUri) -> Option<PublicIdentity> {
        self.identities.write().remove(authority)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(id: &str) -> ChronicleUri {
        ChronicleUri::parse(&format!("memory://origin?id={id}")).unwrap()
    }

    #[test]
    fn test_one_identity_per_authority() {
        let mediator = IdentityMediator::new();
        mediator
            .add(identity("me"), IdentityOptions::default())
            .unwrap();
        let err = mediator
            .add(identity("me-too"), IdentityOptions::default())
            .unwrap_err();
        assert!(matches!(err, FabulaError::DuplicateIdentity(_)));
    }

    #[test]
    fn test_get_resolves_through_authority() {
        let mediator = IdentityMediator::new();
        mediator
            .add(
                identity("me"),
                IdentityOptions::default().with_claim("role", "author"),
            )
            .unwrap();
        // Any reference under the same authority resolves to the identity.
        let resolved = mediator.get(&identity("some-chronicle")).unwrap();
        assert_eq!(resolved.reference, identity("me"));
        assert_eq!(resolved.claims.get("role").map(String::as_str), Some("author"));
    }

    #[test]
    fn test_get_fails_loudly_try_get_quietly() {
        let mediator = IdentityMediator::new();
        assert!(mediator.try_get(&identity("x")).is_none());
        assert!(matches!(
            mediator.get(&identity("x")),
            Err(FabulaError::MissingIdentity(_))
        ));
    }

    #[test]
    fn test_remove_reopens_the_slot() {
        let mediator = IdentityMediator::new();
        mediator
            .add(identity("me"), IdentityOptions::default())
            .unwrap();
        let authority = identity("me").authority().clone();
        assert!(mediator.remove(&authority).is_some());
        mediator
            .add(identity("me-too"), IdentityOptions::default())
            .unwrap();
    }
}
