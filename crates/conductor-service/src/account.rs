use std::fmt;
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// The stable identifier of a peer account.
///
/// Account ids are lowercase ASCII alphanumerics plus `-` and `_`, between
/// 1 and 64 bytes, so they can double as log fields and store keys without
/// escaping.
#[derive(Clone, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct AccountId(String);

const MAX_ACCOUNT_ID_LENGTH: usize = 64;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid account id")]
pub struct AccountIdError {}

impl AccountId {
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for AccountId {
    type Err = AccountIdError;

    fn from_str(id: &str) -> Result<Self, Self::Err> {
        let valid_length = !id.is_empty() && id.len() <= MAX_ACCOUNT_ID_LENGTH;
        let valid_bytes = id
            .bytes()
            .all(|byte| byte.is_ascii_lowercase() || byte.is_ascii_digit() || byte == b'-' || byte == b'_');
        if valid_length && valid_bytes {
            Ok(AccountId(id.to_string()))
        } else {
            Err(AccountIdError {})
        }
    }
}

impl AsRef<str> for AccountId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str(&self.0)
    }
}

impl fmt::Debug for AccountId {
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.debug_tuple("AccountId").field(&self.0).finish()
    }
}

impl Serialize for AccountId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for AccountId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let string = String::deserialize(deserializer)?;
        AccountId::from_str(&string).map_err(de::Error::custom)
    }
}

/// How this node relates to the peer on the other side of an account.
///
/// Parents assign us our address space, peers exchange routes with us as
/// equals, children receive address space from us.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountRelation {
    Parent,
    Peer,
    Child,
}

impl fmt::Display for AccountRelation {
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str(match self {
            AccountRelation::Parent => "parent",
            AccountRelation::Peer => "peer",
            AccountRelation::Child => "child",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_reasonable_ids() {
        for id in &["alice", "peer-0", "node_7", "a"] {
            assert_eq!(AccountId::from_str(id).unwrap().as_str(), *id);
        }
    }

    #[test]
    fn rejects_bad_ids() {
        for id in &["", "Alice", "has space", "ünïcode", "dot.dot"] {
            assert!(AccountId::from_str(id).is_err(), "{:?}", id);
        }
        let too_long = "a".repeat(MAX_ACCOUNT_ID_LENGTH + 1);
        assert!(AccountId::from_str(&too_long).is_err());
    }

    #[test]
    fn round_trips_through_serde() {
        let id: AccountId = serde_json::from_str("\"peer-1\"").unwrap();
        assert_eq!(id.as_str(), "peer-1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"peer-1\"");
        assert!(serde_json::from_str::<AccountId>("\"BAD ID\"").is_err());
    }
}
