//! Passing-confidence policy for lesson attempts.

use crate::prediction::{Mode, Model};
use std::collections::HashMap;

/// Category-level fallbacks used when a label has no override of its own.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThresholdDefaults {
    pub letters: f32,
    pub numbers: f32,
    pub gestures: f32,
    pub fallback: f32,
}

impl Default for ThresholdDefaults {
    fn default() -> Self {
        Self {
            letters: 0.75,
            numbers: 0.85,
            gestures: 0.80,
            fallback: 0.70,
        }
    }
}

/// Per-class overrides tuned against the shipped classifiers.
const CLASS_OVERRIDES: &[(&str, f32)] = &[
    ("A", 0.60),
    ("E", 0.40),
    ("F", 0.40),
    ("G", 0.40),
    ("K", 0.60),
    ("M", 0.45),
    ("N", 0.50),
    ("O", 0.40),
    ("P", 0.40),
    ("S", 0.45),
    ("T", 0.40),
    ("U", 0.20),
    ("W", 0.55),
    ("Z", 0.35),
    ("0", 0.60),
    ("2", 0.50),
    ("3", 0.70),
    ("4", 0.60),
    ("6", 0.60),
    ("7", 0.60),
    ("8", 0.60),
    ("9", 0.60),
    ("ALL DONE", 0.70),
    ("EAT", 0.40),
    ("DRINK", 0.45),
    ("SLEEP", 0.50),
    ("BATH", 0.70),
    ("MOM", 0.25),
    ("DAD", 0.30),
    ("THANK YOU", 0.25),
    ("HELP", 0.25),
    ("LOVE YOU", 0.50),
    ("PLAY", 0.45),
    ("BOOK", 0.20),
    ("BALL", 0.20),
    ("MUSIC", 0.25),
    ("DOG", 0.45),
    ("MORE", 0.40),
    ("PLEASE", 0.40),
];

/// Maps `(mode, model, predicted label)` to the confidence a prediction needs
/// before it counts as a pass.
///
/// Resolution order: per-class override, gestures default (gestures model),
/// numbers default (numbers mode), letters default (letters mode), fallback.
#[derive(Debug, Clone)]
pub struct ThresholdPolicy {
    defaults: ThresholdDefaults,
    overrides: HashMap<String, f32>,
}

impl Default for ThresholdPolicy {
    fn default() -> Self {
        Self {
            defaults: ThresholdDefaults::default(),
            overrides: CLASS_OVERRIDES
                .iter()
                .map(|(label, value)| (label.to_string(), *value))
                .collect(),
        }
    }
}

impl ThresholdPolicy {
    /// A policy with only the category defaults.
    pub fn without_overrides(defaults: ThresholdDefaults) -> Self {
        Self {
            defaults,
            overrides: HashMap::new(),
        }
    }

    /// Adds or replaces the override for one label. Values are clamped into
    /// `(0, 1]`.
    pub fn with_override(mut self, label: impl Into<String>, threshold: f32) -> Self {
        self.overrides
            .insert(label.into(), threshold.clamp(f32::EPSILON, 1.0));
        self
    }

    pub fn threshold(&self, mode: Mode, model: Model, label: &str) -> f32 {
        if let Some(value) = self.overrides.get(label) {
            return *value;
        }
        if model == Model::Gestures {
            return self.defaults.gestures;
        }
        match mode {
            Mode::Numbers => self.defaults.numbers,
            Mode::Letters => self.defaults.letters,
            Mode::Auto => self.defaults.fallback,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_numbers_mode_default() {
        let policy = ThresholdPolicy::default();
        assert_abs_diff_eq!(policy.threshold(Mode::Numbers, Model::Letters, "5"), 0.85);
    }

    #[test]
    fn test_gestures_model_ignores_mode() {
        let policy = ThresholdPolicy::default();
        for mode in [Mode::Letters, Mode::Numbers, Mode::Auto] {
            assert_abs_diff_eq!(policy.threshold(mode, Model::Gestures, "DIAPER"), 0.80);
        }
    }

    #[test]
    fn test_letters_and_auto_defaults() {
        let policy = ThresholdPolicy::default();
        assert_abs_diff_eq!(policy.threshold(Mode::Letters, Model::Letters, "B"), 0.75);
        assert_abs_diff_eq!(policy.threshold(Mode::Auto, Model::Letters, "B"), 0.70);
    }

    #[test]
    fn test_override_takes_precedence() {
        let policy = ThresholdPolicy::default();
        assert_abs_diff_eq!(policy.threshold(Mode::Letters, Model::Letters, "U"), 0.20);
        assert_abs_diff_eq!(policy.threshold(Mode::Letters, Model::Gestures, "MORE"), 0.40);

        let custom = ThresholdPolicy::without_overrides(ThresholdDefaults::default())
            .with_override("5", 0.9);
        assert_abs_diff_eq!(custom.threshold(Mode::Numbers, Model::Letters, "5"), 0.9);
        assert_abs_diff_eq!(custom.threshold(Mode::Numbers, Model::Gestures, "5"), 0.9);
        assert_abs_diff_eq!(custom.threshold(Mode::Numbers, Model::Letters, "6"), 0.85);
    }

    #[test]
    fn test_override_is_clamped() {
        let policy = ThresholdPolicy::without_overrides(ThresholdDefaults::default())
            .with_override("X", 1.5);
        assert_abs_diff_eq!(policy.threshold(Mode::Letters, Model::Letters, "X"), 1.0);
    }
}
