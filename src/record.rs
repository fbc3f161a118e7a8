//! Product records as seen by the pipeline.
//!
//! Only the marker fields matter to phase derivation; everything else a
//! record carries travels as an opaque JSON payload.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable identity of a record.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

impl From<&str> for RecordId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for RecordId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A single progress marker, in pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Marker {
    Translation,
    SearchResult,
    ChosenCandidate,
    EnrichedDetails,
    Audit,
    Approval,
}

impl Marker {
    pub const ALL: [Marker; 6] = [
        Marker::Translation,
        Marker::SearchResult,
        Marker::ChosenCandidate,
        Marker::EnrichedDetails,
        Marker::Audit,
        Marker::Approval,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Marker::Translation => "translation",
            Marker::SearchResult => "comparable search result",
            Marker::ChosenCandidate => "chosen candidate",
            Marker::EnrichedDetails => "enriched details",
            Marker::Audit => "audit",
            Marker::Approval => "approval",
        }
    }
}

impl fmt::Display for Marker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Presence flags encoding pipeline progress. A missing field deserializes
/// as `false`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Markers {
    #[serde(default)]
    pub has_translation: bool,
    #[serde(default)]
    pub has_search_result: bool,
    #[serde(default)]
    pub has_chosen_candidate: bool,
    #[serde(default)]
    pub has_enriched_details: bool,
    #[serde(default)]
    pub is_audited: bool,
    #[serde(default)]
    pub is_approved: bool,
}

impl Markers {
    pub fn is_set(&self, marker: Marker) -> bool {
        match marker {
            Marker::Translation => self.has_translation,
            Marker::SearchResult => self.has_search_result,
            Marker::ChosenCandidate => self.has_chosen_candidate,
            Marker::EnrichedDetails => self.has_enriched_details,
            Marker::Audit => self.is_audited,
            Marker::Approval => self.is_approved,
        }
    }

    pub fn set(&mut self, marker: Marker, value: bool) {
        let slot = match marker {
            Marker::Translation => &mut self.has_translation,
            Marker::SearchResult => &mut self.has_search_result,
            Marker::ChosenCandidate => &mut self.has_chosen_candidate,
            Marker::EnrichedDetails => &mut self.has_enriched_details,
            Marker::Audit => &mut self.is_audited,
            Marker::Approval => &mut self.is_approved,
        };
        *slot = value;
    }

    /// Markers set up to and including `marker`, in pipeline order.
    pub fn through(marker: Marker) -> Self {
        let mut markers = Self::default();
        for m in Marker::ALL.into_iter().take_while(|m| *m <= marker) {
            markers.set(m, true);
        }
        markers
    }
}

/// A product undergoing enrichment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    #[serde(default)]
    pub markers: Markers,
    /// Free-form error marker; a record carrying one is in a permanent error state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Fields the pipeline does not interpret.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub payload: serde_json::Value,
}

impl Record {
    pub fn new(id: impl Into<RecordId>) -> Self {
        Self {
            id: id.into(),
            markers: Markers::default(),
            error: None,
            payload: serde_json::Value::Null,
        }
    }

    pub fn with_markers(mut self, markers: Markers) -> Self {
        self.markers = markers;
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn is_errored(&self) -> bool {
        self.error.as_deref().is_some_and(|e| !e.trim().is_empty())
    }
}

/// A human decision supplied at a gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Decision {
    /// A comparable listing was picked as the reference candidate.
    CandidateChosen { candidate_id: String },
    /// The record is approved for listing.
    Approved,
    /// The reviewer declined; the record stays where it is.
    Rejected { reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_markers_deserialize_as_false() {
        let record: Record = serde_json::from_str(r#"{"id": "sku-1"}"#).unwrap();
        assert_eq!(record.markers, Markers::default());
        assert!(!record.is_errored());
        assert!(record.payload.is_null());
    }

    #[test]
    fn test_partial_markers() {
        let record: Record = serde_json::from_str(
            r#"{"id": "sku-2", "markers": {"has_translation": true}, "payload": {"title": "Kettle"}}"#,
        )
        .unwrap();
        assert!(record.markers.has_translation);
        assert!(!record.markers.has_search_result);
        assert_eq!(record.payload["title"], "Kettle");
    }

    #[test]
    fn test_markers_through() {
        let markers = Markers::through(Marker::ChosenCandidate);
        assert!(markers.is_set(Marker::Translation));
        assert!(markers.is_set(Marker::SearchResult));
        assert!(markers.is_set(Marker::ChosenCandidate));
        assert!(!markers.is_set(Marker::EnrichedDetails));
    }

    #[test]
    fn test_blank_error_is_not_errored() {
        assert!(!Record::new("a").with_error("  ").is_errored());
        assert!(Record::new("a").with_error("bad hts code").is_errored());
    }

    #[test]
    fn test_decision_serialization() {
        let json = serde_json::to_string(&Decision::CandidateChosen {
            candidate_id: "ebay-123".into(),
        })
        .unwrap();
        assert!(json.contains("candidate_chosen"));
        assert!(json.contains("ebay-123"));
    }
}
