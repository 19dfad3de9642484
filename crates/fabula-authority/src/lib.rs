//! Fabula Authority - Authority resolution and identity mediation
//!
//! Maps chronicle and authority URIs to live authority instances:
//! - Scheme modules produce configuration and instantiate authorities for
//!   one URI scheme each
//! - The registry caches exactly one authority per distinct authority URI
//! - The identity mediator binds one public identity per authority for
//!   command attribution
//!
//! Both the registry and the mediator are explicit, constructor-injected
//! instances owned by the top-level gateway, never process-wide state.

pub mod identity;
pub mod memory;
pub mod registry;

pub use identity::*;
pub use memory::*;
pub use registry::*;
