//! Authority registry
//!
//! Resolves a chronicle's authority from its URI: the URI scheme selects a
//! registered scheme module, the module (or a pre-registered explicit
//! config) supplies the authority configuration, and the resulting
//! authority instance is cached for the registry's lifetime. Resolution
//! failures always carry the offending URI and the scheme/config state -
//! nothing is silently defaulted.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use fabula_connect::Authority;
use fabula_core::{
    AuthorityUri, ChronicleUri, FabulaError, FabulaResult, OperationContext,
};

/// Configuration for one authority instance.
#[derive(Clone, Debug)]
pub struct AuthorityConfig {
    pub uri: AuthorityUri,
    /// Human-readable label for diagnostics.
    pub label: Option<String>,
    /// Whether the authority refuses to chronicle a command id twice.
    pub reject_duplicate_commands: bool,
}

impl AuthorityConfig {
    pub fn new(uri: AuthorityUri) -> Self {
        AuthorityConfig {
            uri,
            label: None,
            reject_duplicate_commands: true,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

/// One URI scheme's factory surface: derive the authority URI of a
/// chronicle, produce default configuration, instantiate authorities.
pub trait SchemeModule: Send + Sync {
    fn scheme(&self) -> &'static str;

    /// Derive the authority URI governing `chronicle`.
    fn authority_uri_of(&self, chronicle: &ChronicleUri) -> FabulaResult<AuthorityUri>;

    /// Default configuration for an authority under this scheme, if the
    /// scheme can operate without explicit registration.
    fn default_config(&self, authority: &AuthorityUri) -> Option<AuthorityConfig>;

    fn create_authority(&self, config: &AuthorityConfig) -> FabulaResult<Arc<dyn Authority>>;
}

/// Maps authority URIs to exactly one live authority instance each.
#[derive(Default)]
pub struct AuthorityRegistry {
    schemes: RwLock<HashMap<String, Arc<dyn SchemeModule>>>,
    configs: RwLock<HashMap<AuthorityUri, AuthorityConfig>>,
    authorities: RwLock<HashMap<AuthorityUri, Arc<dyn Authority>>>,
}

impl AuthorityRegistry {
    pub fn new() -> Self {
        AuthorityRegistry::default()
    }

    /// Associate a URI scheme with its module. Fails if the scheme is
    /// already registered.
    pub fn register_scheme_module(&self, module: Arc<dyn SchemeModule>) -> FabulaResult<()> {
        let mut schemes = self.schemes.write();
        let scheme = module.scheme().to_string();
        if schemes.contains_key(&scheme) {
            return Err(FabulaError::DuplicateScheme(scheme));
        }
        tracing::debug!(%scheme, "scheme module registered");
        schemes.insert(scheme, module);
        Ok(())
    }

    /// Pre-register an explicit configuration for one authority URI.
    /// Fails if its scheme has no registered module.
    pub fn register_authority_config(&self, config: AuthorityConfig) -> FabulaResult<()> {
        let scheme = config.uri.scheme().to_string();
        if !self.schemes.read().contains_key(&scheme) {
            return Err(FabulaError::UnknownScheme {
                scheme,
                uri: config.uri.to_string(),
            });
        }
        let mut configs = self.configs.write();
        if configs.contains_key(&config.uri) {
            return Err(FabulaError::DuplicateAuthorityConfig(config.uri));
        }
        configs.insert(config.uri.clone(), config);
        Ok(())
    }

    /// The cached authority for `uri`, created on first call via the
    /// scheme module's factory.
    pub fn resolve_authority(&self, uri: &AuthorityUri) -> FabulaResult<Arc<dyn Authority>> {
        if let Some(authority) = self.authorities.read().get(uri) {
            return Ok(Arc::clone(authority));
        }
        self.instantiate(uri)
            .during("resolve_authority", || self.resolution_state(uri))
    }

    /// Derive the authority URI from a chronicle URI via its scheme
    /// module, then resolve as usual.
    pub fn resolve_authority_of_chronicle(
        &self,
        chronicle: &ChronicleUri,
    ) -> FabulaResult<Arc<dyn Authority>> {
        let module = self
            .module_for(chronicle.authority().scheme())
            .during("resolve_authority_of_chronicle", || {
                self.resolution_state(chronicle.authority())
            })?;
        let authority_uri = module.authority_uri_of(chronicle)?;
        self.resolve_authority(&authority_uri)
    }

    fn instantiate(&self, uri: &AuthorityUri) -> FabulaResult<Arc<dyn Authority>> {
        let module = self.module_for(uri.scheme())?;
        let mut authorities = self.authorities.write();
        // Double-checked: another caller may have won the race while we
        // held no lock.
        if let Some(authority) = authorities.get(uri) {
            return Ok(Arc::clone(authority));
        }
        let config = match self.configs.read().get(uri) {
            Some(config) => config.clone(),
            None => {
                module
                    .default_config(uri)
                    .ok_or_else(|| FabulaError::MissingAuthorityConfig {
                        uri: uri.clone(),
                        scheme: uri.scheme().to_string(),
                    })?
            }
        };
        let authority = module.create_authority(&config)?;
        tracing::info!(uri = %uri, "authority instantiated");
        authorities.insert(uri.clone(), Arc::clone(&authority));
        Ok(authority)
    }

    fn module_for(&self, scheme: &str) -> FabulaResult<Arc<dyn SchemeModule>> {
        self.schemes
            .read()
            .get(scheme)
            .cloned()
            .ok_or_else(|| FabulaError::UnknownScheme {
                scheme: scheme.to_string(),
                uri: String::new(),
            })
    }

    fn resolution_state(&self, uri: &AuthorityUri) -> String {
        let schemes: Vec<String> = self.schemes.read().keys().cloned().collect();
        let has_config = self.configs.read().contains_key(uri);
        format!("uri {uri}, registered schemes {schemes:?}, explicit config: {has_config}")
    }
}
