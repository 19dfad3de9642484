//! Fabula Connect - Upstream connection layer
//!
//! The reconciliation engine drives everything upstream of it through the
//! [`Connection`] contract: request replay of confirmed truths, submit
//! speculative commands, and subscribe to the live truth feed. Connections
//! chain - a local persistence connection wraps a remote-authority
//! connection as its upstream - and tear down by cancelling their
//! outstanding futures with an error kind distinguishable from authority
//! rejection.

pub mod authority;
pub mod connection;
pub mod scribe;

pub use authority::*;
pub use connection::*;
pub use scribe::*;
