//! Scene analyzer: model-backed classification with keyword fallback.
//!
//! `SceneAnalyzer::analyze` never fails. It consults the cache first, asks
//! the analysis model on a miss, and falls back to [`keywords::analyze`] when
//! the model is unavailable, errors, times out, returns unparseable output,
//! or reports a confidence below the configured threshold.
//!
//! Stale cache hits are served immediately while a single background task
//! refreshes the entry.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;
use thiserror::Error;

use chorus_types::analysis::{
    AnalysisContext, AnalysisResult, AnalysisSource, Emotion, EmotionKind, SceneType,
};
use chorus_types::config::AnalysisConfig;
use chorus_types::llm::{CompletionRequest, LlmError, Message, ModelBinding};

use super::cache::{normalize, AnalysisCache, CacheLookup};
use super::keywords;
use crate::llm::box_provider::BoxLlmProvider;

/// Recent history lines shown to the analysis model.
const HISTORY_LINES: usize = 6;

const ANALYSIS_SYSTEM_PROMPT: &str = r#"You classify the latest user message of a group chat so the right persona agents can reply.

Return a single JSON object with exactly these fields:
- "scene_type": one of "emotional_support", "problem_solving", "celebration", "information", "casual_chat"
- "emotion": {"primary": one of "sad", "anxious", "angry", "happy", "neutral", "intensity": number 0-1}
- "topics": array of short lowercase topic tags
- "confidence": number 0-1
- "recommended": array of agent ids chosen ONLY from the available agents, best first
- "reasoning": one short sentence

Return only the JSON object, no prose."#;

/// Why the model path was abandoned for a message.
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("analysis provider failed: {0}")]
    Provider(#[from] LlmError),

    #[error("analysis call timed out")]
    Timeout,

    #[error("unparseable analysis output: {0}")]
    Malformed(String),

    #[error("confidence {0:.2} below threshold")]
    LowConfidence(f64),
}

#[derive(Debug, Deserialize)]
struct RawEmotion {
    primary: String,
    #[serde(default)]
    intensity: f64,
}

#[derive(Debug, Deserialize)]
struct RawAnalysis {
    scene_type: String,
    #[serde(default)]
    emotion: Option<RawEmotion>,
    #[serde(default)]
    topics: Vec<String>,
    confidence: f64,
    #[serde(default)]
    recommended: Vec<String>,
    #[serde(default)]
    reasoning: String,
}

#[derive(Debug, Clone)]
struct AnalysisModel {
    provider: Arc<BoxLlmProvider>,
    binding: ModelBinding,
}

/// Classifies incoming messages into scenes and recommends agents.
///
/// Cheap to clone; clones share the cache.
#[derive(Debug, Clone)]
pub struct SceneAnalyzer {
    model: Option<AnalysisModel>,
    config: AnalysisConfig,
    cache: AnalysisCache,
}

impl SceneAnalyzer {
    /// Analyzer that only ever uses keyword matching.
    pub fn keyword_only(config: AnalysisConfig) -> Self {
        let cache = cache_for(&config);
        Self {
            model: None,
            config,
            cache,
        }
    }

    /// Analyzer backed by the given provider and model binding.
    pub fn with_model(
        provider: Arc<BoxLlmProvider>,
        binding: ModelBinding,
        config: AnalysisConfig,
    ) -> Self {
        let cache = cache_for(&config);
        Self {
            model: Some(AnalysisModel { provider, binding }),
            config,
            cache,
        }
    }

    pub fn cache(&self) -> &AnalysisCache {
        &self.cache
    }

    /// Analyze `message`. Always returns a result whose recommendations are
    /// drawn from `available`.
    #[tracing::instrument(
        name = "analyze_scene",
        skip_all,
        fields(available = available.len(), history = history.len())
    )]
    pub async fn analyze(
        &self,
        message: &str,
        history: &[Message],
        available: &[String],
        context: &AnalysisContext,
    ) -> AnalysisResult {
        let model = match &self.model {
            Some(model) if self.config.enabled => model,
            _ => return keywords::analyze(message, available, context),
        };

        let key = normalize(message);
        if key.is_empty() {
            return keywords::analyze(message, available, context);
        }

        match self.cache.get(&key) {
            CacheLookup::Fresh(cached) => {
                tracing::debug!("analysis cache hit");
                return from_cache(cached, available);
            }
            CacheLookup::Stale(cached) => {
                tracing::debug!("analysis cache hit (stale), refreshing in background");
                self.spawn_refresh(key, message, history, available);
                return from_cache(cached, available);
            }
            CacheLookup::Miss => {}
        }

        match self.call_model(model, message, history, available).await {
            Ok(result) => {
                self.cache.insert(key, result.clone());
                result
            }
            Err(e) => {
                tracing::warn!(error = %e, "scene analysis fell back to keywords");
                keywords::analyze(message, available, context)
            }
        }
    }

    fn spawn_refresh(&self, key: String, message: &str, history: &[Message], available: &[String]) {
        let Some(model) = self.model.clone() else {
            return;
        };
        if !self.cache.try_begin_refresh(&key) {
            return;
        }
        let this = self.clone();
        let message = message.to_string();
        let history = history.to_vec();
        let available = available.to_vec();
        tokio::spawn(async move {
            match this.call_model(&model, &message, &history, &available).await {
                Ok(result) => this.cache.insert(key.clone(), result),
                Err(e) => tracing::debug!(error = %e, "background analysis refresh failed"),
            }
            this.cache.finish_refresh(&key);
        });
    }

    async fn call_model(
        &self,
        model: &AnalysisModel,
        message: &str,
        history: &[Message],
        available: &[String],
    ) -> Result<AnalysisResult, AnalysisError> {
        let request = CompletionRequest {
            model: model.binding.model.clone(),
            messages: vec![Message::user(build_prompt(message, history, available))],
            system: Some(ANALYSIS_SYSTEM_PROMPT.to_string()),
            max_tokens: 512,
            temperature: Some(0.0),
            stream: false,
            stop_sequences: None,
        };

        let timeout = Duration::from_secs(self.config.timeout_secs);
        let response = tokio::time::timeout(timeout, model.provider.complete(&request))
            .await
            .map_err(|_| AnalysisError::Timeout)??;

        let result = parse_analysis(&response.content, available)?;
        if result.confidence < self.config.min_confidence {
            return Err(AnalysisError::LowConfidence(result.confidence));
        }
        Ok(result)
    }
}

fn cache_for(config: &AnalysisConfig) -> AnalysisCache {
    AnalysisCache::new(
        Duration::from_secs(config.cache_ttl_secs),
        Duration::from_secs(config.refresh_after_secs),
        config.cache_capacity,
    )
}

/// Re-target a cached result at the agents available now.
fn from_cache(mut cached: AnalysisResult, available: &[String]) -> AnalysisResult {
    cached.recommended.retain(|id| available.contains(id));
    if cached.recommended.is_empty() {
        cached.recommended = keywords::recommend(cached.scene_type, available);
    }
    cached.source = AnalysisSource::Cache;
    cached
}

fn build_prompt(message: &str, history: &[Message], available: &[String]) -> String {
    let mut prompt = format!("Available agents: {}\n", available.join(", "));
    let start = history.len().saturating_sub(HISTORY_LINES);
    if start < history.len() {
        prompt.push_str("\nRecent conversation:\n");
        for m in &history[start..] {
            prompt.push_str(&format!("{}: {}\n", m.role, m.content));
        }
    }
    prompt.push_str(&format!("\nLatest message:\n{message}\n"));
    prompt
}

/// The outermost `{ ... }` span, tolerating code fences and chatter.
fn json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

/// Parse model output into a result restricted to `available`.
fn parse_analysis(content: &str, available: &[String]) -> Result<AnalysisResult, AnalysisError> {
    let json = json_object(content)
        .ok_or_else(|| AnalysisError::Malformed("no JSON object in output".to_string()))?;
    let raw: RawAnalysis =
        serde_json::from_str(json).map_err(|e| AnalysisError::Malformed(e.to_string()))?;

    let scene_type: SceneType = raw.scene_type.parse().map_err(AnalysisError::Malformed)?;
    if !raw.confidence.is_finite() {
        return Err(AnalysisError::Malformed("non-finite confidence".to_string()));
    }

    let emotion = match raw.emotion {
        Some(e) => Emotion {
            primary: e.primary.parse().unwrap_or(EmotionKind::Neutral),
            intensity: if e.intensity.is_finite() {
                e.intensity.clamp(0.0, 1.0)
            } else {
                0.0
            },
        },
        None => Emotion::neutral(),
    };

    let mut recommended: Vec<String> = Vec::new();
    for id in raw.recommended {
        let id = id.trim().to_string();
        if available.contains(&id) && !recommended.contains(&id) {
            recommended.push(id);
        }
    }
    if recommended.is_empty() {
        recommended = keywords::recommend(scene_type, available);
    }

    Ok(AnalysisResult {
        scene_type,
        emotion,
        topics: raw
            .topics
            .into_iter()
            .map(|t| t.trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .collect(),
        confidence: raw.confidence.clamp(0.0, 1.0),
        recommended,
        reasoning: raw.reasoning,
        source: AnalysisSource::Model,
        analyzed_at: Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::scripted::{ScriptedProvider, ScriptedReply};
    use chorus_types::llm::{ModelPricing, ProviderCapabilities};

    const GOOD: &str = r#"{"scene_type":"problem_solving","emotion":{"primary":"anxious","intensity":0.4},"topics":["Work"],"confidence":0.9,"recommended":["practical","ghost","practical","empathy"],"reasoning":"asks for steps"}"#;

    fn binding() -> ModelBinding {
        ModelBinding {
            id: "analysis".into(),
            provider: "scripted".into(),
            model: "analysis-model".into(),
            context_length: 8_000,
            capabilities: ProviderCapabilities::default(),
            pricing: ModelPricing::default(),
        }
    }

    fn available() -> Vec<String> {
        vec!["empathy".into(), "practical".into(), "encouragement".into()]
    }

    fn analyzer(provider: ScriptedProvider) -> SceneAnalyzer {
        SceneAnalyzer::with_model(
            Arc::new(BoxLlmProvider::new(provider)),
            binding(),
            AnalysisConfig::default(),
        )
    }

    #[tokio::test]
    async fn model_result_is_filtered_to_available() {
        let provider =
            ScriptedProvider::new("scripted").push_reply("analysis-model", ScriptedReply::text(GOOD));
        let result = analyzer(provider)
            .analyze("how do I plan this", &[], &available(), &AnalysisContext::default())
            .await;
        assert_eq!(result.source, AnalysisSource::Model);
        assert_eq!(result.scene_type, SceneType::ProblemSolving);
        assert_eq!(result.recommended, vec!["practical", "empathy"]);
        assert_eq!(result.topics, vec!["work"]);
        assert_eq!(result.emotion.primary, EmotionKind::Anxious);
    }

    #[tokio::test]
    async fn fenced_json_is_accepted() {
        let fenced = format!("Sure!\n```json\n{GOOD}\n```");
        let provider =
            ScriptedProvider::new("scripted").push_reply("analysis-model", ScriptedReply::text(fenced));
        let result = analyzer(provider)
            .analyze("x y z", &[], &available(), &AnalysisContext::default())
            .await;
        assert_eq!(result.source, AnalysisSource::Model);
    }

    #[tokio::test]
    async fn provider_error_falls_back_to_keywords() {
        let provider = ScriptedProvider::new("scripted").push_reply(
            "analysis-model",
            ScriptedReply::error(LlmError::RateLimited { retry_after_ms: None }),
        );
        let result = analyzer(provider)
            .analyze(
                "我今天心情不太好，工作遇到了困难",
                &[],
                &available(),
                &AnalysisContext::default(),
            )
            .await;
        assert_eq!(result.source, AnalysisSource::Keyword);
        assert_eq!(result.scene_type, SceneType::EmotionalSupport);
        assert!(result.recommended.contains(&"empathy".to_string()));
        assert!(result.recommended.contains(&"practical".to_string()));
        assert!(result.confidence >= 0.5);
    }

    #[tokio::test]
    async fn garbage_and_low_confidence_fall_back() {
        let low = GOOD.replace("0.9", "0.2");
        let provider = ScriptedProvider::new("scripted")
            .push_reply("analysis-model", ScriptedReply::text("I think it's sad"))
            .push_reply("analysis-model", ScriptedReply::text(low));
        let analyzer = analyzer(provider);
        let ctx = AnalysisContext::default();
        let first = analyzer.analyze("first message", &[], &available(), &ctx).await;
        let second = analyzer.analyze("second message", &[], &available(), &ctx).await;
        assert_eq!(first.source, AnalysisSource::Keyword);
        assert_eq!(second.source, AnalysisSource::Keyword);
        assert!(analyzer.cache().is_empty());
    }

    #[tokio::test]
    async fn repeated_message_is_served_from_cache() {
        let provider = ScriptedProvider::new("scripted").with_default("analysis-model", ScriptedReply::text(GOOD));
        let log = provider.call_log();
        let analyzer = analyzer(provider);
        let ctx = AnalysisContext::default();
        analyzer.analyze("Need  help", &[], &available(), &ctx).await;
        let cached = analyzer
            .analyze("need help ", &[], &["empathy".to_string()], &ctx)
            .await;
        assert_eq!(log.len(), 1);
        assert_eq!(cached.source, AnalysisSource::Cache);
        assert_eq!(cached.recommended, vec!["empathy"]);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_hit_refreshes_in_background() {
        let provider = ScriptedProvider::new("scripted").with_default("analysis-model", ScriptedReply::text(GOOD));
        let log = provider.call_log();
        let analyzer = analyzer(provider);
        let ctx = AnalysisContext::default();
        analyzer.analyze("plan my week", &[], &available(), &ctx).await;

        tokio::time::advance(Duration::from_secs(1_300)).await;
        let stale = analyzer.analyze("plan my week", &[], &available(), &ctx).await;
        assert_eq!(stale.source, AnalysisSource::Cache);

        for _ in 0..20 {
            if log.len() == 2 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(log.len(), 2);
        let fresh = analyzer.cache().get("plan my week");
        assert!(matches!(fresh, CacheLookup::Fresh(_)));
    }

    #[tokio::test]
    async fn keyword_only_never_calls_a_model() {
        let analyzer = SceneAnalyzer::keyword_only(AnalysisConfig::default());
        let result = analyzer
            .analyze("great news, I got promoted!", &[], &available(), &AnalysisContext::default())
            .await;
        assert_eq!(result.source, AnalysisSource::Keyword);
        assert_eq!(result.scene_type, SceneType::Celebration);
        assert!((0.0..=1.0).contains(&result.confidence));
    }

    #[test]
    fn unknown_scene_is_malformed() {
        let err = parse_analysis(r#"{"scene_type":"party","confidence":0.9}"#, &available())
            .unwrap_err();
        assert!(matches!(err, AnalysisError::Malformed(_)));
    }
}
