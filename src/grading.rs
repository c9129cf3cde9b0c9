use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Percent slack when comparing against a threshold, so totals like 23.4/26
/// land on 90.0 instead of 89.99999.
const PERCENT_EPSILON: f64 = 1e-9;

#[derive(Debug, Error)]
pub enum GradingError {
    #[error("total max score must be positive, got {0}")]
    NonPositiveMaxScore(f64),
    #[error("grade thresholds must not be empty")]
    NoThresholds,
    #[error("max score for subject {subject} is invalid: {value}")]
    InvalidSubjectMax { subject: String, value: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectMax {
    pub subject: String,
    pub max_score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeThreshold {
    pub letter: String,
    pub min_percent: f64,
}

/// Subject maxima and letter thresholds.
///
/// | Letter | Percentage of max |
/// |--------|-------------------|
/// | A      | >= 90             |
/// | B      | >= 70             |
/// | C      | >= 50             |
/// | D      | otherwise         |
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradingConfig {
    pub subject_max_scores: Vec<SubjectMax>,
    pub thresholds: Vec<GradeThreshold>,
}

impl Default for GradingConfig {
    fn default() -> Self {
        let subject = |name: &str, max_score: f64| SubjectMax {
            subject: name.to_string(),
            max_score,
        };
        let tier = |letter: &str, min_percent: f64| GradeThreshold {
            letter: letter.to_string(),
            min_percent,
        };
        Self {
            subject_max_scores: vec![
                subject("语文", 10.0),
                subject("数学", 10.0),
                subject("英语", 6.0),
            ],
            thresholds: vec![
                tier("A", 90.0),
                tier("B", 70.0),
                tier("C", 50.0),
                tier("D", 0.0),
            ],
        }
    }
}

impl GradingConfig {
    pub const FILE_NAME: &'static str = "grading.json";

    /// Reads `grading.json` from the workspace, falling back to defaults when
    /// the file does not exist.
    pub fn load_from_workspace(workspace: &Path) -> anyhow::Result<Self> {
        let path = workspace.join(Self::FILE_NAME);
        if !path.is_file() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("read {}", path.display()))?;
        let cfg: GradingConfig = serde_json::from_str(&text)
            .with_context(|| format!("parse {}", path.display()))?;
        Ok(cfg)
    }

    pub fn total_max_score(&self) -> f64 {
        self.subject_max_scores.iter().map(|s| s.max_score).sum()
    }

    /// Highest letter whose threshold `pct` meets; the lowest tier otherwise.
    pub fn grade_for_percentage(&self, pct: f64) -> &str {
        for t in &self.thresholds {
            if pct + PERCENT_EPSILON >= t.min_percent {
                return &t.letter;
            }
        }
        self.thresholds
            .last()
            .map(|t| t.letter.as_str())
            .unwrap_or("")
    }
}

#[derive(Debug, Clone)]
pub struct GradeCalculator {
    config: GradingConfig,
    total_max: f64,
}

impl GradeCalculator {
    /// Validates the table and sorts thresholds descending.
    pub fn new(mut config: GradingConfig) -> Result<Self, GradingError> {
        for s in &config.subject_max_scores {
            if !s.max_score.is_finite() || s.max_score < 0.0 {
                return Err(GradingError::InvalidSubjectMax {
                    subject: s.subject.clone(),
                    value: s.max_score,
                });
            }
        }
        let total_max = config.total_max_score();
        if total_max <= 0.0 || !total_max.is_finite() {
            return Err(GradingError::NonPositiveMaxScore(total_max));
        }
        if config.thresholds.is_empty() {
            return Err(GradingError::NoThresholds);
        }
        config.thresholds.sort_by(|a, b| {
            b.min_percent
                .partial_cmp(&a.min_percent)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(Self { config, total_max })
    }

    pub fn config(&self) -> &GradingConfig {
        &self.config
    }

    pub fn total_max_score(&self) -> f64 {
        self.total_max
    }

    pub fn percentage(&self, total_score: f64) -> f64 {
        total_score * 100.0 / self.total_max
    }

    pub fn calculate_grade(&self, total_score: f64) -> String {
        self.config
            .grade_for_percentage(self.percentage(total_score))
            .to_string()
    }
}

impl Default for GradeCalculator {
    fn default() -> Self {
        let config = GradingConfig::default();
        let total_max = config.total_max_score();
        Self { config, total_max }
    }
}

pub fn color_for_grade(letter: &str) -> &'static str {
    match letter {
        "A" => "#90EE90",
        "B" => "#87CEEB",
        "C" | "D" => "#FFB6C1",
        _ => "",
    }
}
