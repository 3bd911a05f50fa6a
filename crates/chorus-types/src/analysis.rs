//! Scene analysis results.
//!
//! An [`AnalysisResult`] classifies one incoming message into a scene type,
//! a primary emotion with intensity, topic tags, and the agents recommended
//! to respond.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::conversation::ConversationMode;

/// The kind of exchange a message calls for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SceneType {
    EmotionalSupport,
    ProblemSolving,
    Celebration,
    Information,
    CasualChat,
}

impl SceneType {
    pub const ALL: [SceneType; 5] = [
        SceneType::EmotionalSupport,
        SceneType::ProblemSolving,
        SceneType::Celebration,
        SceneType::Information,
        SceneType::CasualChat,
    ];
}

impl fmt::Display for SceneType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SceneType::EmotionalSupport => write!(f, "emotional_support"),
            SceneType::ProblemSolving => write!(f, "problem_solving"),
            SceneType::Celebration => write!(f, "celebration"),
            SceneType::Information => write!(f, "information"),
            SceneType::CasualChat => write!(f, "casual_chat"),
        }
    }
}

impl FromStr for SceneType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "emotional_support" => Ok(SceneType::EmotionalSupport),
            "problem_solving" => Ok(SceneType::ProblemSolving),
            "celebration" => Ok(SceneType::Celebration),
            "information" => Ok(SceneType::Information),
            "casual_chat" => Ok(SceneType::CasualChat),
            other => Err(format!("invalid scene type: '{other}'")),
        }
    }
}

/// Primary emotion detected in a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmotionKind {
    Sad,
    Anxious,
    Angry,
    Happy,
    Neutral,
}

impl fmt::Display for EmotionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmotionKind::Sad => write!(f, "sad"),
            EmotionKind::Anxious => write!(f, "anxious"),
            EmotionKind::Angry => write!(f, "angry"),
            EmotionKind::Happy => write!(f, "happy"),
            EmotionKind::Neutral => write!(f, "neutral"),
        }
    }
}

impl FromStr for EmotionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "sad" => Ok(EmotionKind::Sad),
            "anxious" => Ok(EmotionKind::Anxious),
            "angry" => Ok(EmotionKind::Angry),
            "happy" => Ok(EmotionKind::Happy),
            "neutral" => Ok(EmotionKind::Neutral),
            other => Err(format!("invalid emotion: '{other}'")),
        }
    }
}

/// Emotion with an intensity in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Emotion {
    pub primary: EmotionKind,
    pub intensity: f64,
}

impl Emotion {
    pub fn neutral() -> Self {
        Self {
            primary: EmotionKind::Neutral,
            intensity: 0.0,
        }
    }
}

/// Where an analysis came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisSource {
    Model,
    Keyword,
    Cache,
}

/// Classification of one incoming message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub scene_type: SceneType,
    pub emotion: Emotion,
    pub topics: Vec<String>,
    /// Always within `[0, 1]`.
    pub confidence: f64,
    /// Agent role tags, drawn from the available set, in preference order.
    pub recommended: Vec<String>,
    pub reasoning: String,
    pub source: AnalysisSource,
    pub analyzed_at: DateTime<Utc>,
}

/// Per-call context handed to the analyzer alongside the message.
#[derive(Debug, Clone, Default)]
pub struct AnalysisContext {
    pub mode: ConversationMode,
    /// Scene of the previous turn, used when nothing in the message matches.
    pub previous_scene: Option<SceneType>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scene_type_roundtrip() {
        for scene in SceneType::ALL {
            let parsed: SceneType = scene.to_string().parse().unwrap();
            assert_eq!(scene, parsed);
        }
    }

    #[test]
    fn test_scene_type_serde_matches_display() {
        let json = serde_json::to_string(&SceneType::EmotionalSupport).unwrap();
        assert_eq!(json, "\"emotional_support\"");
    }

    #[test]
    fn test_emotion_parse_trims() {
        assert_eq!(" Sad ".parse::<EmotionKind>().unwrap(), EmotionKind::Sad);
        assert!("bored".parse::<EmotionKind>().is_err());
    }
}
