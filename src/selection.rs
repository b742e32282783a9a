//! Turning confidence sliders into range bounds for selection queries.
//!
//! The query layer filters detections with an inclusive
//! `conf BETWEEN lower AND upper`. The bounds it needs depend on what the user
//! is selecting: a specific category uses the sliders as-is, "all detections"
//! must never match the zero-confidence no-detection rows, and "empty" inverts
//! confidence.

use crate::document::RunInfo;
use crate::{
    DEFAULT_CONSERVATIVE_DETECTION_THRESHOLD, DEFAULT_TYPICAL_CLASSIFICATION_THRESHOLD,
    DEFAULT_TYPICAL_DETECTION_THRESHOLD,
};

/// Smallest bound that still excludes zero-confidence rows.
pub const JUST_ABOVE_ZERO: f64 = 0.00001;
/// Highest value the UI offers for the upper slider.
pub const NEAR_MAXIMUM: f64 = 0.99;
pub const NEAR_MAXIMUM_TOLERANCE: f64 = 0.0001;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SelectionMode {
    /// Select images by how empty they are; confidence is inverted.
    InterpretAsEmpty,
    /// Any detection of any category.
    AllDetections,
    #[default]
    SpecificCategory,
}

/// Inclusive bounds for a `BETWEEN` predicate.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ConfidenceBounds {
    pub lower: f64,
    pub upper: f64,
}

pub fn compute_bounds(mode: SelectionMode, low: f64, high: f64) -> ConfidenceBounds {
    match mode {
        SelectionMode::SpecificCategory => ConfidenceBounds {
            lower: low,
            upper: high,
        },
        SelectionMode::AllDetections => ConfidenceBounds {
            lower: if low == 0.0 { JUST_ABOVE_ZERO } else { low },
            upper: if high == 0.0 { JUST_ABOVE_ZERO } else { high },
        },
        SelectionMode::InterpretAsEmpty => {
            // Inverting swaps the ends. A near-maximum upper slider maps to just
            // above zero so images whose best detection is below 0.01 still match.
            let lower = if (high - NEAR_MAXIMUM).abs() < NEAR_MAXIMUM_TOLERANCE {
                JUST_ABOVE_ZERO
            } else {
                1.0 - high
            };
            ConfidenceBounds {
                lower,
                upper: 1.0 - low,
            }
        }
    }
}

/// The store's current thresholds, passed explicitly to whatever needs them.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ThresholdContext {
    pub typical_detection: f64,
    pub conservative_detection: f64,
    pub typical_classification: f64,
}

impl Default for ThresholdContext {
    fn default() -> Self {
        Self {
            typical_detection: DEFAULT_TYPICAL_DETECTION_THRESHOLD,
            conservative_detection: DEFAULT_CONSERVATIVE_DETECTION_THRESHOLD,
            typical_classification: DEFAULT_TYPICAL_CLASSIFICATION_THRESHOLD,
        }
    }
}

impl From<&RunInfo> for ThresholdContext {
    fn from(info: &RunInfo) -> Self {
        Self {
            typical_detection: info.typical_detection_threshold,
            conservative_detection: info.conservative_detection_threshold,
            typical_classification: info.typical_classification_threshold,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RecognitionType {
    #[default]
    Empty,
    Detection,
    Classification,
}

/// Recognition criteria for a custom selection.
#[derive(Clone, Debug, PartialEq)]
pub struct RecognitionSelection {
    pub use_recognition: bool,
    pub mode: SelectionMode,
    pub rank_by_confidence: bool,
    pub recognition_type: RecognitionType,
    pub detection_category: String,
    pub classification_category: String,
    /// Upper confidence slider.
    pub upper_threshold: f64,
    detection_threshold: Option<f64>,
    classification_threshold: Option<f64>,
    context: ThresholdContext,
}

impl RecognitionSelection {
    pub fn new(context: ThresholdContext) -> Self {
        Self {
            use_recognition: false,
            mode: SelectionMode::SpecificCategory,
            rank_by_confidence: false,
            recognition_type: RecognitionType::Empty,
            detection_category: "1".to_string(),
            classification_category: "1".to_string(),
            upper_threshold: 1.0,
            detection_threshold: None,
            classification_threshold: None,
            context,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.use_recognition
    }

    pub fn clear(&mut self) {
        self.use_recognition = false;
    }

    /// Lower confidence slider; the store's typical threshold until set.
    pub fn detection_threshold(&self) -> f64 {
        self.detection_threshold
            .unwrap_or(self.context.typical_detection)
    }

    pub fn set_detection_threshold(&mut self, value: f64) {
        self.detection_threshold = Some(value);
    }

    pub fn classification_threshold(&self) -> f64 {
        self.classification_threshold
            .unwrap_or(self.context.typical_classification)
    }

    pub fn set_classification_threshold(&mut self, value: f64) {
        self.classification_threshold = Some(value);
    }

    pub fn conservative_detection_threshold(&self) -> f64 {
        self.context.conservative_detection
    }

    /// Swap in new store thresholds, e.g. after another import. Explicit
    /// slider values are kept.
    pub fn set_context(&mut self, context: ThresholdContext) {
        self.context = context;
    }

    pub fn detection_bounds(&self) -> ConfidenceBounds {
        compute_bounds(self.mode, self.detection_threshold(), self.upper_threshold)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-12
    }

    #[test]
    fn specific_category_passes_through() {
        let b = compute_bounds(SelectionMode::SpecificCategory, 0.3, 0.7);
        assert_eq!(b, ConfidenceBounds { lower: 0.3, upper: 0.7 });
    }

    #[test]
    fn all_detections_never_includes_zero() {
        let b = compute_bounds(SelectionMode::AllDetections, 0.0, 0.0);
        assert_eq!(b.lower, JUST_ABOVE_ZERO);
        assert_eq!(b.upper, JUST_ABOVE_ZERO);
        let b = compute_bounds(SelectionMode::AllDetections, 0.0, 0.5);
        assert_eq!(b, ConfidenceBounds { lower: JUST_ABOVE_ZERO, upper: 0.5 });
    }

    #[test]
    fn empty_inverts_and_swaps() {
        let b = compute_bounds(SelectionMode::InterpretAsEmpty, 0.2, 0.6);
        assert!(close(b.lower, 0.4));
        assert!(close(b.upper, 0.8));
    }

    #[test]
    fn empty_near_maximum_maps_to_just_above_zero() {
        let b = compute_bounds(SelectionMode::InterpretAsEmpty, 0.0, 0.99);
        assert_eq!(b.lower, JUST_ABOVE_ZERO);
        assert_eq!(b.upper, 1.0);
        let b = compute_bounds(SelectionMode::InterpretAsEmpty, 0.0, 0.98);
        assert!(close(b.lower, 0.02));
    }

    #[test]
    fn selection_defaults_come_from_context() {
        let context = ThresholdContext {
            typical_detection: 0.2,
            conservative_detection: 0.05,
            typical_classification: 0.6,
        };
        let mut selection = RecognitionSelection::new(context);
        assert_eq!(selection.detection_threshold(), 0.2);
        assert_eq!(selection.classification_threshold(), 0.6);
        assert_eq!(selection.conservative_detection_threshold(), 0.05);
        assert_eq!(
            selection.detection_bounds(),
            ConfidenceBounds { lower: 0.2, upper: 1.0 }
        );

        selection.set_detection_threshold(0.5);
        selection.set_context(ThresholdContext::default());
        assert_eq!(selection.detection_threshold(), 0.5);
        assert_eq!(
            selection.classification_threshold(),
            DEFAULT_TYPICAL_CLASSIFICATION_THRESHOLD
        );
    }

    #[test]
    fn context_from_run_info() {
        let info = RunInfo {
            typical_detection_threshold: 0.15,
            ..RunInfo::default()
        };
        let context = ThresholdContext::from(&info);
        assert_eq!(context.typical_detection, 0.15);
        assert_eq!(
            context.conservative_detection,
            DEFAULT_CONSERVATIVE_DETECTION_THRESHOLD
        );
    }
}
