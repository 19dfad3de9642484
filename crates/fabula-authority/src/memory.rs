//! Scheme module for the in-memory `memory:` authority scheme

use std::sync::Arc;

use fabula_connect::{Authority, MemoryAuthority, MemoryAuthorityOptions};
use fabula_core::{AuthorityUri, ChronicleUri, FabulaResult};

use crate::registry::{AuthorityConfig, SchemeModule};

/// Produces [`MemoryAuthority`] instances for `memory://` URIs. Every
/// authority under this scheme can operate without explicit registration,
/// so a default config is always available.
#[derive(Default)]
pub struct MemorySchemeModule;

impl MemorySchemeModule {
    pub fn new() -> Self {
        MemorySchemeModule
    }
}

impl SchemeModule for MemorySchemeModule {
    fn scheme(&self) -> &'static str {
        "memory"
    }

    fn authority_uri_of(&self, chronicle: &ChronicleUri) -> FabulaResult<AuthorityUri> {
        Ok(chronicle.authority().clone())
    }

    fn default_config(&self, authority: &AuthorityUri) -> Option<AuthorityConfig> {
        Some(AuthorityConfig::new(authority.clone()))
    }

    fn create_authority(&self, config: &AuthorityConfig) -> FabulaResult<Arc<dyn Authority>> {
        Ok(Arc::new(MemoryAuthority::new(
            config.uri.clone(),
            MemoryAuthorityOptions {
                reject_duplicate_commands: config.reject_duplicate_commands,
            },
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_authority_uri_is_chronicle_prefix() {
        let module = MemorySchemeModule::new();
        let chronicle = ChronicleUri::parse("memory://origin?id=x").unwrap();
        let authority = module.authority_uri_of(&chronicle).unwrap();
        assert_eq!(authority.as_str(), "memory://origin");
    }

    #[tokio::test]
    async fn test_created_authority_opens_connections() {
        let module = MemorySchemeModule::new();
        let uri = AuthorityUri::parse("memory://origin").unwrap();
        let config = module.default_config(&uri).unwrap();
        let authority = module.create_authority(&config).unwrap();
        let chronicle = ChronicleUri::parse("memory://origin?id=x").unwrap();
        let connection = authority.open_connection(chronicle.clone()).await.unwrap();
        assert_eq!(connection.chronicle(), &chronicle);
    }
}
