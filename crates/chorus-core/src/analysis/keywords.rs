//! Deterministic keyword classification.
//!
//! The fallback path of the scene analyzer. Pure functions over lowercased
//! text with Chinese and English keyword tables; every result is a valid
//! [`AnalysisResult`] with a confidence capped below what the model path can
//! report.

use chrono::Utc;

use chorus_types::analysis::{
    AnalysisContext, AnalysisResult, AnalysisSource, Emotion, EmotionKind, SceneType,
};

/// Confidence assigned when no keyword matched at all.
pub const NO_MATCH_CONFIDENCE: f64 = 0.3;
const BASE_CONFIDENCE: f64 = 0.45;
const PER_HIT_CONFIDENCE: f64 = 0.1;
const MAX_KEYWORD_CONFIDENCE: f64 = 0.8;

const SCENE_KEYWORDS: &[(SceneType, &[&str])] = &[
    (
        SceneType::EmotionalSupport,
        &[
            "心情", "不太好", "不好受", "难过", "伤心", "困难", "压力", "焦虑", "孤独", "委屈",
            "失落", "崩溃", "想哭", "累了", "sad", "upset", "stressed", "lonely", "depressed",
            "anxious", "struggling", "bad day", "hurt",
        ],
    ),
    (
        SceneType::ProblemSolving,
        &[
            "怎么办", "如何", "怎么做", "方法", "建议", "解决", "办法", "步骤", "how to",
            "how do", "what should", "fix", "solve", "advice", "help me",
        ],
    ),
    (
        SceneType::Celebration,
        &[
            "开心", "高兴", "成功", "太好了", "庆祝", "升职", "通过了", "好消息", "happy",
            "excited", "great news", "celebrate", "promoted", "passed",
        ],
    ),
    (
        SceneType::Information,
        &[
            "什么是", "为什么", "介绍", "解释", "是什么", "what is", "why", "explain",
            "tell me about",
        ],
    ),
    (
        SceneType::CasualChat,
        &["你好", "哈哈", "聊聊", "无聊", "在吗", "hello", "lol", "bored", "what's up"],
    ),
];

const EMOTION_KEYWORDS: &[(EmotionKind, &[&str])] = &[
    (
        EmotionKind::Sad,
        &[
            "难过", "伤心", "心情不好", "不太好", "失落", "沮丧", "想哭", "sad", "down", "upset",
            "depressed",
        ],
    ),
    (
        EmotionKind::Anxious,
        &[
            "焦虑", "担心", "压力", "紧张", "害怕", "困难", "anxious", "worried", "stressed",
            "nervous",
        ],
    ),
    (
        EmotionKind::Angry,
        &["生气", "愤怒", "气死", "烦死", "angry", "furious", "annoyed"],
    ),
    (
        EmotionKind::Happy,
        &["开心", "高兴", "太好了", "兴奋", "happy", "excited", "glad"],
    ),
];

const INTENSIFIERS: &[&str] = &["很", "非常", "太", "特别", "真的", "超级", "really", "very", "so "];

const TOPIC_KEYWORDS: &[(&str, &[&str])] = &[
    (
        "work",
        &["工作", "上班", "老板", "同事", "加班", "项目", "job", "work", "boss", "office"],
    ),
    (
        "study",
        &["学习", "考试", "作业", "学校", "exam", "study", "school", "homework"],
    ),
    (
        "relationship",
        &["朋友", "恋爱", "男朋友", "女朋友", "家人", "分手", "friend", "partner", "family", "breakup"],
    ),
    (
        "health",
        &["身体", "睡眠", "失眠", "生病", "health", "sleep", "sick", "insomnia"],
    ),
    ("money", &["钱", "工资", "房租", "money", "salary", "rent"]),
];

/// Role tags suited to each scene, most suited first.
pub fn preferred_roles(scene: SceneType) -> &'static [&'static str] {
    match scene {
        SceneType::EmotionalSupport => &["empathy", "practical", "encouragement"],
        SceneType::ProblemSolving => &["practical", "analyst", "empathy"],
        SceneType::Celebration => &["encouragement", "humor", "empathy"],
        SceneType::Information => &["analyst", "practical"],
        SceneType::CasualChat => &["humor", "empathy", "encouragement"],
    }
}

fn count_hits(text: &str, keywords: &[&str]) -> usize {
    keywords.iter().filter(|k| text.contains(*k)).count()
}

/// Best-matching scene and its hit count, or `None` when nothing matched.
///
/// Ties go to the scene listed first.
pub fn classify_scene(text: &str) -> Option<(SceneType, usize)> {
    let text = text.to_lowercase();
    let mut best: Option<(SceneType, usize)> = None;
    for (scene, keywords) in SCENE_KEYWORDS {
        let hits = count_hits(&text, keywords);
        if hits > 0 && best.is_none_or(|(_, b)| hits > b) {
            best = Some((*scene, hits));
        }
    }
    best
}

/// Primary emotion with an intensity in `[0, 1]`.
pub fn detect_emotion(text: &str) -> Emotion {
    let text = text.to_lowercase();
    let mut best: Option<(EmotionKind, usize)> = None;
    for (kind, keywords) in EMOTION_KEYWORDS {
        let hits = count_hits(&text, keywords);
        if hits > 0 && best.is_none_or(|(_, b)| hits > b) {
            best = Some((*kind, hits));
        }
    }
    match best {
        Some((primary, hits)) => {
            let boost = if count_hits(&text, INTENSIFIERS) > 0 { 0.15 } else { 0.0 };
            let intensity = (0.3 + 0.2 * hits as f64 + boost).clamp(0.0, 1.0);
            Emotion { primary, intensity }
        }
        None => Emotion::neutral(),
    }
}

/// Topic tags mentioned in the text, in table order.
pub fn detect_topics(text: &str) -> Vec<String> {
    let text = text.to_lowercase();
    TOPIC_KEYWORDS
        .iter()
        .filter(|(_, keywords)| count_hits(&text, keywords) > 0)
        .map(|(topic, _)| topic.to_string())
        .collect()
}

/// Recommendations for a scene, restricted to `available`.
///
/// Falls back to the first available id so callers always get at least one
/// recommendation when any agent exists.
pub fn recommend(scene: SceneType, available: &[String]) -> Vec<String> {
    let mut recommended: Vec<String> = preferred_roles(scene)
        .iter()
        .filter(|role| available.iter().any(|a| a == *role))
        .map(|role| role.to_string())
        .collect();
    if recommended.is_empty() {
        if let Some(first) = available.first() {
            recommended.push(first.clone());
        }
    }
    recommended
}

/// Full keyword-based analysis. Never fails.
pub fn analyze(message: &str, available: &[String], context: &AnalysisContext) -> AnalysisResult {
    let (scene_type, confidence, reasoning) = match classify_scene(message) {
        Some((scene, hits)) => (
            scene,
            (BASE_CONFIDENCE + PER_HIT_CONFIDENCE * hits as f64).min(MAX_KEYWORD_CONFIDENCE),
            format!("keyword match: {hits} {scene} keyword(s)"),
        ),
        None => match context.previous_scene {
            Some(previous) => (
                previous,
                NO_MATCH_CONFIDENCE,
                format!("no keywords matched; continuing previous scene {previous}"),
            ),
            None => (
                SceneType::CasualChat,
                NO_MATCH_CONFIDENCE,
                "no keywords matched; defaulting to casual chat".to_string(),
            ),
        },
    };

    AnalysisResult {
        scene_type,
        emotion: detect_emotion(message),
        topics: detect_topics(message),
        confidence: confidence.clamp(0.0, 1.0),
        recommended: recommend(scene_type, available),
        reasoning,
        source: AnalysisSource::Keyword,
        analyzed_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn bad_day_at_work_is_emotional_support() {
        let available = ids(&["empathy", "practical", "encouragement"]);
        let result = analyze(
            "我今天心情不太好，工作遇到了困难",
            &available,
            &AnalysisContext::default(),
        );
        assert_eq!(result.scene_type, SceneType::EmotionalSupport);
        assert!(result.recommended.contains(&"empathy".to_string()));
        assert!(result.recommended.contains(&"practical".to_string()));
        assert!(result.confidence >= 0.5);
        assert!(result.confidence <= MAX_KEYWORD_CONFIDENCE);
        assert_eq!(result.topics, vec!["work"]);
        assert_eq!(result.emotion.primary, EmotionKind::Sad);
    }

    #[test]
    fn problem_solving_in_english() {
        let (scene, hits) = classify_scene("How to fix my resume? Any advice?").unwrap();
        assert_eq!(scene, SceneType::ProblemSolving);
        assert_eq!(hits, 3);
    }

    #[test]
    fn no_match_uses_previous_scene() {
        let ctx = AnalysisContext {
            previous_scene: Some(SceneType::Celebration),
            ..Default::default()
        };
        let result = analyze("嗯嗯", &ids(&["humor"]), &ctx);
        assert_eq!(result.scene_type, SceneType::Celebration);
        assert_eq!(result.confidence, NO_MATCH_CONFIDENCE);
    }

    #[test]
    fn no_match_without_history_is_casual() {
        let result = analyze("...", &ids(&["humor"]), &AnalysisContext::default());
        assert_eq!(result.scene_type, SceneType::CasualChat);
        assert_eq!(result.recommended, vec!["humor"]);
    }

    #[test]
    fn recommend_falls_back_to_first_available() {
        let rec = recommend(SceneType::Information, &ids(&["poet", "critic"]));
        assert_eq!(rec, vec!["poet"]);
        assert!(recommend(SceneType::Information, &[]).is_empty());
    }

    #[test]
    fn emotion_intensity_is_bounded() {
        let emotion = detect_emotion("非常非常难过伤心沮丧失落想哭 really sad down upset depressed");
        assert_eq!(emotion.primary, EmotionKind::Sad);
        assert!(emotion.intensity <= 1.0);
        assert_eq!(detect_emotion("the sky").primary, EmotionKind::Neutral);
    }

    #[test]
    fn confidence_never_exceeds_cap() {
        let text = "心情 难过 伤心 困难 压力 焦虑 孤独 委屈 失落 崩溃";
        let result = analyze(text, &[], &AnalysisContext::default());
        assert!((result.confidence - MAX_KEYWORD_CONFIDENCE).abs() < f64::EPSILON);
        assert!(result.recommended.is_empty());
    }
}
