//! Chronicle and authority URIs
//!
//! A chronicle is identified as `<authority-uri>?id=<chronicle-id>`: the
//! authority part names the service responsible for numbering and conflict
//! resolution, the `id` query names one event log under that authority.
//! Both forms are used as registry and connection-table keys and therefore
//! hash and order by their canonical string rendering.

use std::fmt;
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::{FabulaError, FabulaResult};

/// Authority identity - `<scheme>://<location>` prefix of a chronicle URI.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AuthorityUri {
    raw: String,
}

impl AuthorityUri {
    /// Parse an authority URI. The scheme is everything before the first
    /// `:`; an empty scheme or a missing separator is malformed.
    pub fn parse(raw: &str) -> FabulaResult<Self> {
        let scheme_len = raw
            .find(':')
            .ok_or_else(|| FabulaError::MalformedAuthorityUri(raw.to_string()))?;
        if scheme_len == 0 || raw.contains('?') {
            return Err(FabulaError::MalformedAuthorityUri(raw.to_string()));
        }
        Ok(AuthorityUri {
            raw: raw.to_string(),
        })
    }

    /// URI scheme, used to select the scheme module that can instantiate
    /// this authority.
    pub fn scheme(&self) -> &str {
        &self.raw[..self.raw.find(':').unwrap_or(0)]
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Debug for AuthorityUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Authority({})", self.raw)
    }
}

impl fmt::Display for AuthorityUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for AuthorityUri {
    type Err = FabulaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AuthorityUri::parse(s)
    }
}

/// Chronicle identity - one event log, `<authority-uri>?id=<chronicle-id>`.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChronicleUri {
    authority: AuthorityUri,
    id: String,
}

impl ChronicleUri {
    pub fn new(authority: AuthorityUri, id: impl Into<String>) -> FabulaResult<Self> {
        let id = id.into();
        if id.is_empty() || id.contains('&') || id.contains('?') {
            return Err(FabulaError::MalformedChronicleUri(format!(
                "{authority}?id={id}"
            )));
        }
        Ok(ChronicleUri { authority, id })
    }

    /// Parse a chronicle URI of the form `<authority>?id=<chronicle-id>`.
    pub fn parse(raw: &str) -> FabulaResult<Self> {
        let (authority, query) = raw
            .split_once('?')
            .ok_or_else(|| FabulaError::MalformedChronicleUri(raw.to_string()))?;
        let id = query
            .strip_prefix("id=")
            .ok_or_else(|| FabulaError::MalformedChronicleUri(raw.to_string()))?;
        if id.is_empty() || id.contains('&') {
            return Err(FabulaError::MalformedChronicleUri(raw.to_string()));
        }
        let authority = AuthorityUri::parse(authority)
            .map_err(|_| FabulaError::MalformedChronicleUri(raw.to_string()))?;
        ChronicleUri::new(authority, id)
    }

    /// The authority responsible for this chronicle.
    pub fn authority(&self) -> &AuthorityUri {
        &self.authority
    }

    /// The chronicle id under its authority.
    pub fn chronicle_id(&self) -> &str {
        &self.id
    }
}

impl fmt::Debug for ChronicleUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Chronicle({self})")
    }
}

impl fmt::Display for ChronicleUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}?id={}", self.authority, self.id)
    }
}

impl FromStr for ChronicleUri {
    type Err = FabulaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ChronicleUri::parse(s)
    }
}

// Chronicle URIs key JSON maps in the multi-chronicle envelope, so they
// serialize as their canonical string form.
impl Serialize for ChronicleUri {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ChronicleUri {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        ChronicleUri::parse(&raw).map_err(de::Error::custom)
    }
}

impl Serialize for AuthorityUri {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for AuthorityUri {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        AuthorityUri::parse(&raw).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_authority_uri_scheme() {
        let uri = AuthorityUri::parse("memory://origin").unwrap();
        assert_eq!(uri.scheme(), "memory");
        assert_eq!(uri.as_str(), "memory://origin");
    }

    #[test]
    fn test_authority_uri_rejects_query() {
        assert!(AuthorityUri::parse("memory://origin?id=x").is_err());
        assert!(AuthorityUri::parse("no-scheme-here").is_err());
        assert!(AuthorityUri::parse(":empty").is_err());
    }

    #[test]
    fn test_chronicle_uri_roundtrip() {
        let raw = "memory://origin?id=journal-7";
        let uri = ChronicleUri::parse(raw).unwrap();
        assert_eq!(uri.authority().as_str(), "memory://origin");
        assert_eq!(uri.chronicle_id(), "journal-7");
        assert_eq!(uri.to_string(), raw);
    }

    #[test]
    fn test_chronicle_uri_malformed() {
        assert!(ChronicleUri::parse("memory://origin").is_err());
        assert!(ChronicleUri::parse("memory://origin?id=").is_err());
        assert!(ChronicleUri::parse("memory://origin?name=x").is_err());
        assert!(ChronicleUri::parse("memory://origin?id=a&b=c").is_err());
    }

    #[test]
    fn test_chronicle_uri_serde_as_string() {
        let uri = ChronicleUri::parse("memory://origin?id=log").unwrap();
        let json = serde_json::to_string(&uri).unwrap();
        assert_eq!(json, "\"memory://origin?id=log\"");
        let back: ChronicleUri = serde_json::from_str(&json).unwrap();
        assert_eq!(back, uri);
    }

    proptest::proptest! {
        #[test]
        fn test_chronicle_uri_display_parse(id in "[a-z0-9-]{1,24}") {
            let authority = AuthorityUri::parse("memory://origin").unwrap();
            let uri = ChronicleUri::new(authority, id).unwrap();
            let reparsed = ChronicleUri::parse(&uri.to_string()).unwrap();
            proptest::prop_assert_eq!(uri, reparsed);
        }
    }
}
