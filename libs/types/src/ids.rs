//! Identifier types for pipeline entities
//!
//! Sessions use UUID v7 so that transitions logged across a long-running
//! process sort chronologically.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for one streaming session.
///
/// A fresh id is minted every time the state machine leaves `idle`, so
/// log lines from two sessions separated by a reconnect never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Create a new SessionId with current timestamp
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Instrument name as reported by the capture layer (e.g. `EURUSD_otc`).
///
/// Names are compared exactly after trimming surrounding whitespace; the
/// upstream feed is case-sensitive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssetId(String);

impl AssetId {
    /// Try to create an AssetId, returning None for blank names.
    pub fn try_new(name: impl AsRef<str>) -> Option<Self> {
        let trimmed = name.as_ref().trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_string()))
        }
    }

    /// Create an AssetId from a name known to be non-blank.
    ///
    /// # Panics
    /// Panics if the name is empty after trimming.
    pub fn new(name: impl AsRef<str>) -> Self {
        Self::try_new(name).expect("AssetId must not be blank")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name safe to embed in a file name: path separators and other
    /// reserved characters become `-`.
    pub fn file_stem(&self) -> String {
        self.0
            .chars()
            .map(|c| match c {
                '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '-',
                c if c.is_whitespace() => '-',
                c => c,
            })
            .collect()
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for AssetId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_uniqueness() {
        let id1 = SessionId::new();
        let id2 = SessionId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_session_id_ordering_follows_creation() {
        let first = SessionId::new();
        let second = SessionId::new();
        assert!(first < second);
    }

    #[test]
    fn test_asset_id_trims() {
        let asset = AssetId::new("  EURUSD_otc ");
        assert_eq!(asset.as_str(), "EURUSD_otc");
    }

    #[test]
    fn test_asset_id_rejects_blank() {
        assert!(AssetId::try_new("   ").is_none());
        assert!(AssetId::try_new("").is_none());
    }

    #[test]
    fn test_asset_id_is_case_sensitive() {
        assert_ne!(AssetId::new("eurusd"), AssetId::new("EURUSD"));
    }

    #[test]
    fn test_file_stem_replaces_separators() {
        let asset = AssetId::new("BTC/USD otc");
        assert_eq!(asset.file_stem(), "BTC-USD-otc");
    }

    #[test]
    fn test_asset_id_serializes_transparently() {
        let json = serde_json::to_string(&AssetId::new("EURUSD")).unwrap();
        assert_eq!(json, "\"EURUSD\"");
    }
}
