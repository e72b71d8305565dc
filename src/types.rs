use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Coarse mailbox category assigned by the analyzer.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Work,
    Personal,
    Newsletter,
    Spam,
}

impl Category {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "work" => Some(Category::Work),
            "personal" => Some(Category::Personal),
            "newsletter" => Some(Category::Newsletter),
            "spam" => Some(Category::Spam),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Work => "work",
            Category::Personal => "personal",
            Category::Newsletter => "newsletter",
            Category::Spam => "spam",
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "high" => Some(Priority::High),
            "medium" => Some(Priority::Medium),
            "low" => Some(Priority::Low),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Sentiment {
    Positive,
    Neutral,
    Negative,
    Urgent,
}

impl Sentiment {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "positive" => Some(Sentiment::Positive),
            "neutral" => Some(Sentiment::Neutral),
            "negative" => Some(Sentiment::Negative),
            "urgent" => Some(Sentiment::Urgent),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Sentiment::Positive => "positive",
            Sentiment::Neutral => "neutral",
            Sentiment::Negative => "negative",
            Sentiment::Urgent => "urgent",
        }
    }
}

/// Derived fields attached to a message by the analyzer. All fields stay
/// `None`/empty when analysis was unavailable, except `suggested_replies`
/// which always carries the deterministic fallback suggestions.
#[derive(Clone, Debug, Default)]
pub struct AiAnnotation {
    pub summary: Option<String>,
    pub category: Option<Category>,
    pub priority: Option<Priority>,
    pub sentiment: Option<Sentiment>,
    pub action_items: Vec<String>,
    pub suggested_replies: Vec<String>,
    pub analyzed_at: Option<i64>,
}

#[derive(Clone, Debug)]
pub struct UserRecord {
    pub id: i64,
    pub google_id: String,
    pub email: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub token_expiry: Option<i64>,
    /// Opaque change cursor issued by the mailbox provider.
    pub history_id: Option<String>,
    /// Watch subscription expiry, provider epoch millis.
    pub watch_expiration: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl UserRecord {
    /// Token considered stale one minute before the recorded expiry.
    pub fn token_expired(&self, now: i64) -> bool {
        match self.token_expiry {
            Some(expiry) => expiry - 60 <= now,
            None => false,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub id: i64,
    pub user_id: i64,
    pub gmail_id: String,
    pub thread_id: String,
    pub subject: String,
    #[serde(rename = "from")]
    pub from_addr: String,
    #[serde(rename = "to")]
    pub to_addrs: String,
    pub body: String,
    pub snippet: String,
    pub received_at: i64,
    pub is_read: bool,
    pub ai_summary: Option<String>,
    pub ai_category: Option<Category>,
    pub ai_priority: Option<Priority>,
    pub ai_sentiment: Option<Sentiment>,
    pub ai_action_items: Vec<String>,
    pub ai_suggested_replies: Vec<String>,
    pub ai_analyzed_at: Option<i64>,
}

/// A message composed from the provider representation plus its annotation,
/// ready for insertion.
#[derive(Clone, Debug)]
pub struct NewMessage {
    pub user_id: i64,
    pub gmail_id: String,
    pub thread_id: String,
    pub subject: String,
    pub from_addr: String,
    pub to_addrs: String,
    pub body: String,
    pub snippet: String,
    pub received_at: i64,
    pub is_read: bool,
    pub annotation: AiAnnotation,
}

pub fn now_ts() -> i64 {
    Utc::now().timestamp()
}
