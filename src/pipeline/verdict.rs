//! Structured Assess verdict parsing.
//!
//! The Assess model is asked for a JSON object; models wrap it in prose or
//! code fences often enough that extraction has to be lenient. Anything
//! unparseable becomes a not-approved verdict carrying the raw text, so a
//! confused assessor can never wave a draft through.

use serde::{Deserialize, Serialize};

/// The sole input to the orchestrator's refine-loop decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssessVerdict {
    #[serde(default)]
    pub approved: bool,
    #[serde(default)]
    pub feedback: String,
    #[serde(default)]
    pub score: f64,
}

/// Extract a verdict from model output.
pub fn parse_verdict(text: &str) -> AssessVerdict {
    if let Ok(verdict) = serde_json::from_str::<AssessVerdict>(text.trim()) {
        return verdict;
    }

    // Look for an embedded JSON object (code fences, surrounding prose).
    if let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) {
        if start < end {
            if let Ok(verdict) = serde_json::from_str::<AssessVerdict>(&text[start..=end]) {
                return verdict;
            }
        }
    }

    AssessVerdict {
        approved: false,
        feedback: text.trim().to_string(),
        score: 0.0,
    }
}
