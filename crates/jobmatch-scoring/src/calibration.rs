use chrono::{DateTime, Utc};
use jobmatch_core::{Category, CategoryBands, ErrorKind, LlmAssessment, MatchResult, Posting};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum CalibrationError {
    #[error("weight {name} must be a finite number >= 0, got {value}")]
    InvalidWeight { name: &'static str, value: f64 },
    #[error("calibration weights cannot both be zero")]
    ZeroWeights,
}

impl CalibrationError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Config
    }
}

/// Mixing coefficients for the evaluator confidence and the scaled similarity score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationWeights {
    w_llm: f64,
    w_embed: f64,
}

impl Default for CalibrationWeights {
    fn default() -> Self {
        Self {
            w_llm: 0.7,
            w_embed: 0.3,
        }
    }
}

impl CalibrationWeights {
    pub fn new(w_llm: f64, w_embed: f64) -> Result<Self, CalibrationError> {
        for (name, value) in [("w_llm", w_llm), ("w_embed", w_embed)] {
            if !value.is_finite() || value < 0.0 {
                return Err(CalibrationError::InvalidWeight { name, value });
            }
        }
        if w_llm == 0.0 && w_embed == 0.0 {
            return Err(CalibrationError::ZeroWeights);
        }
        Ok(Self { w_llm, w_embed })
    }

    pub fn w_llm(&self) -> f64 {
        self.w_llm
    }

    pub fn w_embed(&self) -> f64 {
        self.w_embed
    }
}

fn scaled_embed(embed_score: f64) -> f64 {
    if embed_score.is_nan() {
        return 0.0;
    }
    embed_score.clamp(0.0, 1.0) * 100.0
}

fn to_score(value: f64) -> u8 {
    value.round().clamp(0.0, 100.0) as u8
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ScoreCalibrator {
    weights: CalibrationWeights,
    bands: CategoryBands,
}

impl ScoreCalibrator {
    pub fn new(weights: CalibrationWeights, bands: CategoryBands) -> Self {
        Self { weights, bands }
    }

    pub fn weights(&self) -> CalibrationWeights {
        self.weights
    }

    pub fn bands(&self) -> CategoryBands {
        self.bands
    }

    /// Weighted blend when an assessment exists, otherwise the scaled similarity alone.
    pub fn calibrate(&self, embed_score: f64, llm: Option<&LlmAssessment>) -> (u8, Category) {
        let embed = scaled_embed(embed_score);
        let final_score = match llm {
            Some(assessment) => {
                to_score(self.weights.w_llm * f64::from(assessment.confidence) + self.weights.w_embed * embed)
            }
            None => to_score(embed),
        };
        (final_score, self.bands.category_for(final_score))
    }

    pub fn score(
        &self,
        posting: Posting,
        profile_fingerprint: &str,
        embed_score: f64,
        llm: Option<LlmAssessment>,
        evaluated_at: DateTime<Utc>,
    ) -> MatchResult {
        let (final_score, category) = self.calibrate(embed_score, llm.as_ref());
        MatchResult {
            posting,
            profile_fingerprint: profile_fingerprint.to_string(),
            embed_score,
            llm,
            final_score,
            category,
            evaluated_at,
        }
    }
}
