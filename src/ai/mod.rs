//! Generative-AI annotation: per-message analysis (summary, category,
//! priority, sentiment, action items, reply suggestions) and free-form email
//! composition. The engine treats analysis failure as non-fatal and falls
//! back to [`fallback_annotation`].
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::errors::{AppError, AppResult};
use crate::types::{now_ts, AiAnnotation, Category, Priority, Sentiment};

const BODY_PROMPT_MAX_CHARS: usize = 2000;

const ANALYSIS_PROMPT: &str = r#"Analyze this email and provide a structured response in JSON format.

Email:
From: {from}
Subject: {subject}
Body: {body}

Provide your analysis in this exact JSON format (no markdown, just raw JSON):
{
  "summary": "A one-sentence summary of the email (max 100 characters)",
  "category": "work" or "personal" or "newsletter" or "spam",
  "priority": "high" or "medium" or "low",
  "sentiment": "positive" or "neutral" or "negative" or "urgent",
  "actionItems": ["action item 1", "action item 2"] (max 3 items, or empty array if none),
  "suggestedReplies": [
    "A professional/formal response (1-2 sentences)",
    "A casual/friendly response (1-2 sentences)",
    "A brief/short response (1 sentence)"
  ]
}

Rules:
- Keep summary under 100 characters
- Detect if this is spam, newsletter, or legitimate email
- Identify urgency from tone and content
- Extract clear, actionable items
- Generate helpful response suggestions that make sense for this email
- Return ONLY valid JSON, no other text"#;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tone {
    Professional,
    Casual,
    Brief,
}

impl Tone {
    /// Unknown or missing tones fall back to professional.
    pub fn parse(raw: Option<&str>) -> Self {
        match raw.map(|s| s.trim().to_ascii_lowercase()).as_deref() {
            Some("casual") => Tone::Casual,
            Some("brief") => Tone::Brief,
            _ => Tone::Professional,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Tone::Professional => "professional",
            Tone::Casual => "casual",
            Tone::Brief => "brief",
        }
    }

    fn instructions(&self) -> &'static str {
        match self {
            Tone::Professional => {
                "Write in a formal, professional business tone. Use proper salutations and \
                 closings. Be respectful and clear."
            }
            Tone::Casual => {
                "Write in a friendly, conversational tone. Be warm and personable while \
                 remaining appropriate."
            }
            Tone::Brief => {
                "Write a concise, to-the-point email. Keep it short (2-3 sentences max) while \
                 covering the essential information."
            }
        }
    }
}

pub struct EmailInput<'a> {
    pub subject: &'a str,
    pub from: &'a str,
    pub body: &'a str,
}

#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn analyze(&self, email: &EmailInput<'_>) -> AppResult<AiAnnotation>;

    async fn compose(
        &self,
        prompt: &str,
        tone: Tone,
        context: Option<&str>,
    ) -> AppResult<String>;
}

/// The annotation persisted when analysis is unavailable: no derived fields,
/// but a deterministic set of exactly three reply suggestions.
pub fn fallback_annotation() -> AiAnnotation {
    AiAnnotation {
        summary: None,
        category: None,
        priority: None,
        sentiment: None,
        action_items: Vec::new(),
        suggested_replies: default_replies(),
        analyzed_at: None,
    }
}

pub fn default_replies() -> Vec<String> {
    vec![
        "Thank you for your email.".to_string(),
        "Thanks for reaching out!".to_string(),
        "Got it, thanks!".to_string(),
    ]
}

// --- Gemini-backed implementation ---

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RawAnalysis {
    summary: Option<String>,
    category: Option<String>,
    priority: Option<String>,
    sentiment: Option<String>,
    action_items: Vec<String>,
    suggested_replies: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct GenerateResponse {
    candidates: Vec<Candidate>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Candidate {
    content: CandidateContent,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CandidateContent {
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CandidatePart {
    text: String,
}

#[derive(Clone)]
pub struct GeminiClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl GeminiClient {
    pub fn new(base_url: &str, api_key: &str, model: &str, timeout: Duration) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Unexpected(format!("building http client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        })
    }

    async fn generate(&self, prompt: &str) -> AppResult<String> {
        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url, self.model
        );
        let payload = json!({
            "contents": [{ "parts": [{ "text": prompt }] }],
        });

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|e| AppError::Analysis(format!("completion request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::Analysis(format!(
                "completion API returned status {status}"
            )));
        }

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|e| AppError::Analysis(format!("decoding completion response: {e}")))?;

        parsed
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content.parts.into_iter().next())
            .map(|p| p.text)
            .ok_or_else(|| AppError::Analysis("completion response had no candidates".into()))
    }
}

#[async_trait]
impl Analyzer for GeminiClient {
    async fn analyze(&self, email: &EmailInput<'_>) -> AppResult<AiAnnotation> {
        let body_excerpt: String = email.body.chars().take(BODY_PROMPT_MAX_CHARS).collect();
        let prompt = ANALYSIS_PROMPT
            .replace("{from}", email.from)
            .replace("{subject}", email.subject)
            .replace("{body}", &body_excerpt);

        let raw = self.generate(&prompt).await?;
        parse_analysis(&raw)
    }

    async fn compose(
        &self,
        prompt: &str,
        tone: Tone,
        context: Option<&str>,
    ) -> AppResult<String> {
        let context_block = context
            .filter(|c| !c.trim().is_empty())
            .map(|c| format!("CONTEXT: The user is replying to or referencing: {c}\n\n"))
            .unwrap_or_default();

        let full_prompt = format!(
            "You are an AI email writing assistant. Generate a complete email based on the \
             user's prompt.\n\n{tone_text}\n\n{context_block}USER PROMPT: {prompt}\n\n\
             Generate ONLY the email body text. Do NOT include:\n\
             - Subject line (unless specifically requested)\n\
             - Salutation like \"Dear...\" or \"Hi...\" (unless specifically requested)\n\
             - Closing signature (unless specifically requested)\n\
             - Any explanations or meta-text\n\n\
             Just write the actual email content that the user would paste into their email.",
            tone_text = tone.instructions(),
        );

        let text = self.generate(&full_prompt).await?;
        Ok(text.trim().to_string())
    }
}

/// Parses the model's JSON answer, tolerating markdown code fences. Unknown
/// enum values map to `None` rather than failing the whole analysis.
pub fn parse_analysis(raw: &str) -> AppResult<AiAnnotation> {
    let cleaned = strip_code_fences(raw);
    let parsed: RawAnalysis = serde_json::from_str(cleaned)
        .map_err(|e| AppError::Analysis(format!("analysis response was not valid JSON: {e}")))?;

    let suggested_replies = if parsed.suggested_replies.is_empty() {
        default_replies()
    } else {
        parsed.suggested_replies
    };

    Ok(AiAnnotation {
        summary: parsed.summary.filter(|s| !s.trim().is_empty()),
        category: parsed.category.as_deref().and_then(Category::parse),
        priority: parsed.priority.as_deref().and_then(Priority::parse),
        sentiment: parsed.sentiment.as_deref().and_then(Sentiment::parse),
        action_items: parsed.action_items,
        suggested_replies,
        analyzed_at: Some(now_ts()),
    })
}

fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let trimmed = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    trimmed.strip_suffix("```").unwrap_or(trimmed).trim()
}
