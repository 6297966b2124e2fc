//! Profile models returned by the REST backend.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    #[default]
    Beginner,
    Intermediate,
    Advanced,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Level::Beginner => write!(f, "beginner"),
            Level::Intermediate => write!(f, "intermediate"),
            Level::Advanced => write!(f, "advanced"),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub user_name: String,
    pub email: String,
    #[serde(default)]
    pub nickname: Option<String>,
    #[serde(default)]
    pub avatar_src: Option<String>,
    #[serde(default)]
    pub xp: u32,
    /// Average lesson grade in `[0, 100]`.
    #[serde(default)]
    pub lessons_avg_grade: f32,
    #[serde(default)]
    pub daily_streak: u32,
    #[serde(default)]
    pub level: Level,
}

impl User {
    pub fn display_name(&self) -> &str {
        self.nickname.as_deref().unwrap_or(&self.user_name)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct UserStats {
    pub total_lessons: u32,
    pub completed_lessons: u32,
    pub average_score: f32,
    pub total_attempts: u32,
    #[serde(rename = "totalXP")]
    pub total_xp: u32,
}
