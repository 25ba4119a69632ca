//! `QualityReport`: the Reflector's judgment of in-progress execution
//! (spec §3, §4.8).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityStatus {
    Good,
    Concerning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityRecommendation {
    Continue,
    Adjust,
    Replan,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityReport {
    pub status: QualityStatus,
    pub recommendation: QualityRecommendation,
    pub confidence: f32,
    pub issues: Vec<String>,
    pub suggestions: Vec<String>,
}

impl QualityReport {
    pub fn good() -> Self {
        Self {
            status: QualityStatus::Good,
            recommendation: QualityRecommendation::Continue,
            confidence: 1.0,
            issues: Vec::new(),
            suggestions: Vec::new(),
        }
    }

    pub fn concerning(recommendation: QualityRecommendation, issue: impl Into<String>) -> Self {
        Self {
            status: QualityStatus::Concerning,
            recommendation,
            confidence: 0.6,
            issues: vec![issue.into()],
            suggestions: Vec::new(),
        }
    }

    pub fn should_replan(&self) -> bool {
        self.recommendation == QualityRecommendation::Replan
    }
}
