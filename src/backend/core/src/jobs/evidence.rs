//! Evidence diffs reported by the execution runner.
//!
//! The runner computes the diff; this module only bounds the sample list.

use chrono::{DateTime, Utc};
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};

/// Kind of change a sample represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffType {
    Created,
    Updated,
    Removed,
}

/// One example of a changed knowledge-base entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceSample {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub urn_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_id: Option<String>,
    pub diff_type: DiffType,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quote: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl EvidenceSample {
    pub fn new(diff_type: DiffType, source: impl Into<String>) -> Self {
        Self {
            urn_id: None,
            chunk_id: None,
            diff_type,
            source: source.into(),
            section: None,
            quote: None,
            updated_at: None,
        }
    }

    pub fn with_urn(mut self, urn_id: impl Into<String>) -> Self {
        self.urn_id = Some(urn_id.into());
        self
    }

    pub fn with_chunk(mut self, chunk_id: impl Into<String>) -> Self {
        self.chunk_id = Some(chunk_id.into());
        self
    }

    pub fn with_section(mut self, section: impl Into<String>) -> Self {
        self.section = Some(section.into());
        self
    }

    pub fn with_quote(mut self, quote: impl Into<String>) -> Self {
        self.quote = Some(quote.into());
        self
    }

    pub fn with_updated_at(mut self, updated_at: DateTime<Utc>) -> Self {
        self.updated_at = Some(updated_at);
        self
    }

    /// URN if present, otherwise chunk id.
    pub fn identifier(&self) -> Option<&str> {
        self.urn_id.as_deref().or(self.chunk_id.as_deref())
    }
}

/// Counts of created, updated and removed entries plus a bounded sample list.
///
/// `total_changes` is serialized for readers but never stored.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct EvidenceDiff {
    pub created: u64,
    pub updated: u64,
    pub removed: u64,
    #[serde(default)]
    pub samples: Vec<EvidenceSample>,
}

impl EvidenceDiff {
    pub fn new(created: u64, updated: u64, removed: u64) -> Self {
        Self {
            created,
            updated,
            removed,
            samples: Vec::new(),
        }
    }

    pub fn with_sample(mut self, sample: EvidenceSample) -> Self {
        self.samples.push(sample);
        self
    }

    pub fn total_changes(&self) -> u64 {
        self.created + self.updated + self.removed
    }
}

impl Serialize for EvidenceDiff {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("EvidenceDiff", 5)?;
        state.serialize_field("created", &self.created)?;
        state.serialize_field("updated", &self.updated)?;
        state.serialize_field("removed", &self.removed)?;
        state.serialize_field("total_changes", &self.total_changes())?;
        state.serialize_field("samples", &self.samples)?;
        state.end()
    }
}

/// Bounds the sample list of incoming diffs.
#[derive(Debug, Clone, Copy)]
pub struct EvidenceTracker {
    sample_cap: usize,
}

impl Default for EvidenceTracker {
    fn default() -> Self {
        Self { sample_cap: 20 }
    }
}

impl EvidenceTracker {
    pub fn new(sample_cap: usize) -> Self {
        Self { sample_cap }
    }

    pub fn sample_cap(&self) -> usize {
        self.sample_cap
    }

    /// Truncate samples to the cap. Counts are left exactly as reported.
    pub fn track(&self, mut diff: EvidenceDiff) -> EvidenceDiff {
        if diff.samples.len() > self.sample_cap {
            tracing::debug!(
                reported = diff.samples.len(),
                kept = self.sample_cap,
                "Truncating evidence samples"
            );
            diff.samples.truncate(self.sample_cap);
        }
        diff
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(i: usize) -> EvidenceSample {
        EvidenceSample::new(DiffType::Created, "filings").with_urn(format!("urn:doc:{}", i))
    }

    #[test]
    fn test_total_changes_is_derived() {
        let diff = EvidenceDiff::new(5, 2, 0);
        assert_eq!(diff.total_changes(), 7);

        let json = serde_json::to_value(&diff).unwrap();
        assert_eq!(json["total_changes"], 7);

        // A stale total on input is ignored
        let parsed: EvidenceDiff =
            serde_json::from_str(r#"{"created":1,"updated":1,"removed":1,"total_changes":99}"#).unwrap();
        assert_eq!(parsed.total_changes(), 3);
    }

    #[test]
    fn test_tracker_truncates_samples_only() {
        let mut diff = EvidenceDiff::new(30, 0, 0);
        for i in 0..30 {
            diff = diff.with_sample(sample(i));
        }

        let tracked = EvidenceTracker::default().track(diff);
        assert_eq!(tracked.samples.len(), 20);
        assert_eq!(tracked.created, 30);
        assert_eq!(tracked.samples[0].identifier(), Some("urn:doc:0"));
    }

    #[test]
    fn test_tracker_keeps_short_lists() {
        let diff = EvidenceDiff::new(1, 0, 0).with_sample(sample(1));
        let tracked = EvidenceTracker::new(5).track(diff.clone());
        assert_eq!(tracked, diff);
    }

    #[test]
    fn test_sample_identifier_falls_back_to_chunk() {
        let s = EvidenceSample::new(DiffType::Removed, "news")
            .with_chunk("chunk-7")
            .with_section("Risk Factors")
            .with_quote("material weakness");
        assert_eq!(s.identifier(), Some("chunk-7"));
    }
}
