use serde::{Deserialize, Serialize};
use std::fmt;

/// Restricts the letters/numbers classifier to one label space.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Letters,
    Numbers,
    Auto,
}

/// Which classifier the inference backend runs for a connection.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Model {
    #[default]
    Letters,
    Gestures,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Letters => "letters",
            Mode::Numbers => "numbers",
            Mode::Auto => "auto",
        }
    }
}

impl Model {
    pub fn as_str(&self) -> &'static str {
        match self {
            Model::Letters => "letters",
            Model::Gestures => "gestures",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of the ranked candidate list returned with each prediction.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LabelProb {
    #[serde(rename = "name")]
    pub label: String,
    #[serde(rename = "p")]
    pub prob: f32,
}

/// A decoded classification for one frame.
///
/// Produced fresh for every inbound result message and handed to listeners
/// immediately; nothing keeps these around.
#[derive(Debug, Clone, PartialEq)]
pub struct PredictionResult {
    pub top_label: Option<String>,
    pub confidence: Option<f32>,
    pub candidates: Vec<LabelProb>,
    pub motion_score: Option<f32>,
    pub hand_confidence: Option<f32>,
    pub feature_count: u32,
    /// `None` when the backend runs a model without a mode filter.
    pub mode: Option<Mode>,
    pub model: Model,
}

/// Raw gesture classifier indices and the vocabulary they stand for.
const GESTURE_NAMES: [&str; 21] = [
    "ALL DONE",
    "BALL",
    "BATH",
    "BOOK",
    "DAD",
    "DIAPER",
    "DOG",
    "DRINK",
    "EAT",
    "HELP",
    "HEY, KEEP IT PG!",
    "LOVE YOU",
    "MILK",
    "MOM",
    "MORE",
    "MUSIC",
    "PLAY",
    "PLEASE",
    "SLEEP",
    "SORRY",
    "THANK YOU",
];

/// Maps a raw gesture index such as `"14"` to its name. Unknown indices come
/// back unchanged.
pub fn gesture_name(raw: &str) -> &str {
    raw.trim()
        .parse::<usize>()
        .ok()
        .and_then(|idx| GESTURE_NAMES.get(idx).copied())
        .unwrap_or(raw)
}

/// Surfaces a wire label the way listeners expect to see it for `model`.
pub fn display_label(raw: &str, model: Model) -> String {
    match model {
        Model::Gestures => gesture_name(raw).to_string(),
        Model::Letters => raw.to_string(),
    }
}

impl PredictionResult {
    /// Rewrites the top label and every candidate through the gesture table
    /// when the result came from the gestures model.
    pub fn with_display_labels(mut self) -> Self {
        if self.model == Model::Gestures {
            self.top_label = self
                .top_label
                .map(|label| display_label(&label, Model::Gestures));
            for candidate in &mut self.candidates {
                candidate.label = display_label(&candidate.label, Model::Gestures);
            }
        }
        self
    }
}
