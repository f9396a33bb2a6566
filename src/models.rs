use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// The article being worked on. Produced by generation or rehydrated from history.
///
/// Fields the backend returns beyond the known ones are kept in `extra` so that
/// save-draft sends back everything generation produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Article {
    pub title: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub author: String,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "empty_as_none")]
    pub digest: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_at: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub content_length: u64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub image_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "empty_as_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "empty_as_none")]
    pub content_source_url: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Article {
    /// Rebuild an article from a history record and its rehydrated body.
    pub fn from_record(record: &HistoryRecord, content: String) -> Self {
        Self {
            title: record.title.clone(),
            author: record.author.clone(),
            digest: record.digest.clone(),
            content,
            generated_at: record.generated_at.clone(),
            content_length: record.content_length,
            image_count: record.image_count,
            image_url: None,
            content_source_url: record.content_source_url.clone(),
            extra: Map::new(),
        }
    }
}

/// Backend-issued `media_id` of a persisted draft. Single use: publishing consumes it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DraftHandle(String);

impl DraftHandle {
    pub fn new(media_id: impl Into<String>) -> Self {
        Self(media_id.into())
    }

    pub fn media_id(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DraftHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Server-side record status. Ordered: a record only ever moves forward, and an
/// unrecognised status ranks below every known one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HistoryStatus {
    #[default]
    Unknown,
    Generated,
    Saved,
    Published,
}

impl<'de> Deserialize<'de> for HistoryStatus {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(match raw.trim().to_ascii_lowercase().as_str() {
            "generated" => HistoryStatus::Generated,
            "saved" => HistoryStatus::Saved,
            "published" => HistoryStatus::Published,
            _ => HistoryStatus::Unknown,
        })
    }
}

impl HistoryStatus {
    pub fn label(self) -> &'static str {
        match self {
            HistoryStatus::Unknown => "unknown",
            HistoryStatus::Generated => "generated",
            HistoryStatus::Saved => "saved",
            HistoryStatus::Published => "published",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub id: Option<String>,
    pub title: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub status: HistoryStatus,
    #[serde(default)]
    pub generated_at: Option<String>,
    #[serde(default)]
    pub published_at: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub content_length: u64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub image_count: u32,
    #[serde(default, deserialize_with = "null_as_default")]
    pub author: String,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub digest: Option<String>,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub content_source_url: Option<String>,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub media_id: Option<String>,
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub publish_id: Option<String>,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub publish_time: Option<String>,
    #[serde(default)]
    pub enable_mass_send: Option<bool>,
    #[serde(default)]
    pub mass_sent: Option<bool>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub cache_files: Vec<String>,
}

/// Identity used to match a record across refreshes. Titles are not unique, so
/// records without a backend id fall back to title plus generation time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RecordKey {
    Id(String),
    TitleAt { title: String, generated_at: Option<String> },
}

/// Which per-record actions the panel may offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecordAffordances {
    pub view: bool,
    pub load_to_preview: bool,
    pub publish_draft: bool,
    pub schedule: bool,
    pub pending_indicator: bool,
}

impl HistoryRecord {
    pub fn key(&self) -> RecordKey {
        match &self.id {
            Some(id) => RecordKey::Id(id.clone()),
            None => RecordKey::TitleAt {
                title: self.title.clone(),
                generated_at: self.generated_at.clone(),
            },
        }
    }

    /// A publish time is registered and the backend has not published yet.
    pub fn is_pending_schedule(&self) -> bool {
        self.publish_time.as_deref().is_some_and(|t| !t.trim().is_empty()) && self.status != HistoryStatus::Published
    }

    pub fn has_content(&self) -> bool {
        !self.cache_files.is_empty()
    }

    pub fn affordances(&self) -> RecordAffordances {
        let pending = self.is_pending_schedule();
        RecordAffordances {
            view: self.has_content(),
            load_to_preview: self.status == HistoryStatus::Generated && self.has_content(),
            publish_draft: self.status == HistoryStatus::Saved && self.media_id.is_some() && !pending,
            schedule: self.status != HistoryStatus::Published && !pending && self.has_content() && self.id.is_some(),
            pending_indicator: pending,
        }
    }
}

/// Body of `schedule-publish`. Keyed by media_id; `draft_id` names the originating record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduleRequest {
    pub media_id: String,
    pub publish_time: String,
    pub draft_id: String,
    pub enable_mass_send: bool,
}

/// Body of `generate-article`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerateRequest {
    pub title: String,
    pub word_count: u32,
    pub image_count: u32,
    pub format_template: String,
    pub ai_model: String,
    pub image_model: String,
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SavedDraft {
    pub media_id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PublishReceipt {
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub publish_id: Option<String>,
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub msg_data_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArticleContent {
    pub content: String,
}

/// Newest body written to the backend's cache directory.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheFile {
    pub filename: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub modified_time: Option<String>,
    pub content: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelList {
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default)]
    pub current_model: Option<String>,
}

/// Read-only view of the backend's configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BackendConfig {
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub content_source_url: Option<String>,
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

impl BackendConfig {
    /// All settings as display pairs, secrets masked.
    pub fn display_entries(&self) -> Vec<(String, String)> {
        let mut entries = Vec::new();
        if let Some(author) = &self.author {
            entries.push(("author".to_string(), author.clone()));
        }
        if let Some(url) = &self.content_source_url {
            entries.push(("content_source_url".to_string(), url.clone()));
        }
        let mut other: Vec<_> = self.other.iter().collect();
        other.sort_by(|a, b| a.0.cmp(b.0));
        for (key, value) in other {
            let rendered = match value {
                Value::String(s) => s.clone(),
                v => v.to_string(),
            };
            let secret = key.contains("key") || key.contains("secret");
            entries.push((key.clone(), if secret { mask(&rendered) } else { rendered }));
        }
        entries
    }
}

fn mask(secret: &str) -> String {
    if secret.is_empty() {
        return String::new();
    }
    let tail: String = secret.chars().rev().take(4).collect::<Vec<_>>().into_iter().rev().collect();
    if secret.chars().count() <= 8 {
        "****".to_string()
    } else {
        format!("****{tail}")
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn empty_as_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.filter(|s| !s.trim().is_empty()))
}

fn opt_string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(s)) if !s.is_empty() => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}
