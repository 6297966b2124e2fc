//! Lesson metadata as served by the lessons endpoint.

use crate::prediction::{Mode, Model};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Lesson {
    /// `<category>_<sign>`, e.g. `letters_A` or `gesture_MORE`.
    pub lesson_id: String,
    pub title: String,
    #[serde(default)]
    pub image_url: Option<String>,
    pub category: String,
    #[serde(default)]
    pub difficulty: String,
    /// Percentage in `[0, 100]`.
    #[serde(default)]
    pub passing_accuracy: f32,
    #[serde(rename = "gained_XP", default)]
    pub gained_xp: u32,
    #[serde(default)]
    pub instructions: String,
    #[serde(default)]
    pub order: i32,
    #[serde(default)]
    pub is_active: Option<bool>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct LessonsResponse {
    pub lessons: Vec<Lesson>,
}

impl Lesson {
    /// The sign a learner has to produce, taken from the lesson id.
    pub fn target_sign(&self) -> &str {
        self.lesson_id.split('_').nth(1).unwrap_or_default()
    }

    pub fn is_gesture(&self) -> bool {
        matches!(self.category.as_str(), "gesture" | "gestures") || self.lesson_id.starts_with("gesture")
    }

    pub fn mode(&self) -> Mode {
        let target = self.target_sign();
        let numeric = !target.is_empty() && target.chars().all(|c| c.is_ascii_digit());
        if self.category == "numbers" || numeric {
            Mode::Numbers
        } else {
            Mode::Letters
        }
    }

    pub fn model(&self) -> Model {
        if self.is_gesture() {
            Model::Gestures
        } else {
            Model::Letters
        }
    }

    fn is_listed(&self) -> bool {
        self.is_active != Some(false)
    }
}

/// Previous and next lesson ids around `current_id` among the active lessons
/// of `category`, ordered by `order`.
pub fn neighbours(current_id: &str, category: &str, lessons: &[Lesson]) -> (Option<String>, Option<String>) {
    let mut same_category: Vec<&Lesson> = lessons
        .iter()
        .filter(|l| l.is_listed() && l.category == category)
        .collect();
    same_category.sort_by_key(|l| l.order);

    let Some(idx) = same_category.iter().position(|l| l.lesson_id == current_id) else {
        return (None, None);
    };
    let prev = idx
        .checked_sub(1)
        .and_then(|i| same_category.get(i))
        .map(|l| l.lesson_id.clone());
    let next = same_category.get(idx + 1).map(|l| l.lesson_id.clone());
    (prev, next)
}
