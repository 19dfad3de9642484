//! Identity types for the Fabula protocol
//!
//! Command identifiers are 64-bit tokens: wide enough that independently
//! issuing actors do not collide in practice, small enough to stay cheap
//! as hash-map keys on the reconciliation hot path.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Command identity - names one speculative command before (and after)
/// confirmation. Either a locally generated token or a signed derivation
/// handed out by an identity authority.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct CommandId(pub u64);

impl CommandId {
    pub const ZERO: CommandId = CommandId(0);

    #[inline]
    pub fn new(id: u64) -> Self {
        CommandId(id)
    }

    #[inline]
    pub fn to_bytes(self) -> [u8; 8] {
        self.0.to_le_bytes()
    }

    #[inline]
    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        CommandId(u64::from_le_bytes(bytes))
    }
}

impl fmt::Debug for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Command({:016x})", self.0)
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Position in a chronicle's event log.
///
/// Used both for authoritative truth positions (`log.index`, gapless and
/// strictly increasing, assigned by the authority) and for provisional
/// command positions assigned locally before confirmation.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct LogIndex(pub u64);

impl LogIndex {
    pub const ZERO: LogIndex = LogIndex(0);

    #[inline]
    pub fn new(index: u64) -> Self {
        LogIndex(index)
    }

    /// The position immediately after this one.
    #[inline]
    pub fn next(self) -> Self {
        LogIndex(self.0 + 1)
    }
}

impl fmt::Debug for LogIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Log({})", self.0)
    }
}

impl fmt::Display for LogIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_id_roundtrip() {
        let id = CommandId::new(0xDEADBEEF_CAFEBABE);
        let bytes = id.to_bytes();
        let recovered = CommandId::from_bytes(bytes);
        assert_eq!(id, recovered);
    }

    #[test]
    fn test_log_index_ordering() {
        let first = LogIndex::new(0);
        let second = first.next();
        assert!(first < second);
        assert_eq!(second, LogIndex::new(1));
    }
}
