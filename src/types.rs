//! Shared types used across modules
//!
//! This module contains types that are used by multiple modules
//! to avoid circular dependencies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single user/agent exchange, as written to the dialogue log
///
/// Serialized with the `user` / `agent` keys the training script reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DialogueRecord {
    /// Position in the log, strictly increasing from 0
    pub turn_index: u64,
    #[serde(rename = "user")]
    pub user_text: String,
    #[serde(rename = "agent")]
    pub agent_text: String,
    pub timestamp: DateTime<Utc>,
}

impl DialogueRecord {
    pub fn new(turn_index: u64, user_text: impl Into<String>, agent_text: impl Into<String>) -> Self {
        Self {
            turn_index,
            user_text: user_text.into(),
            agent_text: agent_text.into(),
            timestamp: Utc::now(),
        }
    }

    /// Text stored in the similarity index for this record
    pub fn document(&self) -> String {
        format!("User: {}\nAgent: {}", self.user_text, self.agent_text)
    }

    /// Index id for this record
    pub fn memory_id(&self) -> String {
        format!("turn_{}", self.turn_index)
    }
}

/// A record's indexed form: document text plus its embedding
#[derive(Debug, Clone)]
pub struct MemoryEntry {
    pub turn_index: u64,
    pub document: String,
    pub embedding: Vec<f32>,
}

impl MemoryEntry {
    pub fn from_record(record: &DialogueRecord, embedding: Vec<f32>) -> Self {
        Self {
            turn_index: record.turn_index,
            document: record.document(),
            embedding,
        }
    }
}

/// A memory returned by a similarity query
#[derive(Debug, Clone)]
pub struct ScoredMemory {
    pub turn_index: u64,
    pub document: String,
    /// Cosine similarity to the query
    pub score: f32,
}

/// Ordered model version, stored as integer tenths (`v1.2` is 12)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VersionTag {
    tenths: u32,
}

impl VersionTag {
    /// The version used when no marker exists
    pub const INITIAL: VersionTag = VersionTag { tenths: 1 };

    pub fn tenths(&self) -> u32 {
        self.tenths
    }

    /// The next version (+0.1)
    pub fn next(&self) -> Result<Self, crate::error::EvolutionError> {
        let tenths = self.tenths.checked_add(1).ok_or_else(|| {
            crate::error::EvolutionError::VersionStateCorrupt(format!("{} has no successor", self))
        })?;
        Ok(Self { tenths })
    }

    /// Parse a `v<major>.<minor>` tag with a single minor digit
    pub fn parse(s: &str) -> Option<Self> {
        let body = s.trim().strip_prefix('v')?;
        let (major, minor) = body.split_once('.')?;
        if major.is_empty() || minor.len() != 1 {
            return None;
        }
        if !major.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let major: u32 = major.parse().ok()?;
        let minor = minor.chars().next()?.to_digit(10)?;
        Some(Self {
            tenths: major.checked_mul(10)?.checked_add(minor)?,
        })
    }
}

impl Default for VersionTag {
    fn default() -> Self {
        Self::INITIAL
    }
}

impl std::fmt::Display for VersionTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}.{}", self.tenths / 10, self.tenths % 10)
    }
}

impl std::str::FromStr for VersionTag {
    type Err = crate::error::EvolutionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| {
            crate::error::EvolutionError::VersionStateCorrupt(format!("invalid version tag {:?}", s))
        })
    }
}

/// The live model version and when it was recorded
#[derive(Debug, Clone)]
pub struct ModelVersion {
    pub version_tag: VersionTag,
    pub created_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_parse_and_display() {
        let v = VersionTag::parse("v0.1").unwrap();
        assert_eq!(v, VersionTag::INITIAL);
        assert_eq!(v.to_string(), "v0.1");

        let v = VersionTag::parse(" v12.3\n").unwrap();
        assert_eq!(v.tenths(), 123);
        assert_eq!(v.to_string(), "v12.3");
    }

    #[test]
    fn test_version_rejects_garbage() {
        for bad in ["", "v", "0.1", "v0", "v0.", "v.1", "v0.12", "vx.1", "v0.x", "v-1.0", "v0.1junk"] {
            assert!(VersionTag::parse(bad).is_none(), "accepted {:?}", bad);
        }
    }

    #[test]
    fn test_version_next_rolls_over_minor() {
        let v = VersionTag::parse("v0.9").unwrap().next().unwrap();
        assert_eq!(v.to_string(), "v1.0");
        assert!(v > VersionTag::parse("v0.9").unwrap());
    }

    #[test]
    fn test_version_next_at_limit_is_an_error() {
        let last = VersionTag::parse("v429496729.5").unwrap();
        assert_eq!(last.tenths(), u32::MAX);
        assert_eq!(last.next().unwrap_err().kind(), "VersionStateCorrupt");
    }

    #[test]
    fn test_dialogue_record_document() {
        let record = DialogueRecord::new(4, "hi", "hello there");
        assert_eq!(record.document(), "User: hi\nAgent: hello there");
        assert_eq!(record.memory_id(), "turn_4");
    }

    #[test]
    fn test_dialogue_record_json_keys() {
        let record = DialogueRecord::new(0, "q", "a");
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["user"], "q");
        assert_eq!(json["agent"], "a");
        assert_eq!(json["turn_index"], 0);
    }
}
