use std::fmt;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadFile(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("validation error: {0}")]
    Validation(String),
}

/// Network, HTTP or envelope failure. The backend never got to say what went wrong.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request to {endpoint} failed: {source}")]
    Http { endpoint: String, source: reqwest::Error },
    #[error("{endpoint} returned HTTP {status}: {body}")]
    Status { endpoint: String, status: u16, body: String },
    #[error("malformed response from {endpoint}: {message}")]
    Malformed { endpoint: String, message: String },
}

/// Structured `error_type` reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    QuotaExceeded,
    InvalidKey,
    Other(String),
    Unclassified,
}

impl ErrorKind {
    pub fn from_error_type(error_type: Option<&str>) -> Self {
        match error_type {
            None | Some("") => ErrorKind::Unclassified,
            Some("quota_exceeded") => ErrorKind::QuotaExceeded,
            Some("invalid_key") => ErrorKind::InvalidKey,
            Some(other) => ErrorKind::Other(other.to_string()),
        }
    }
}

/// The envelope came back with `success: false`.
#[derive(Debug, Error)]
#[error("{endpoint}: {message}")]
pub struct BackendError {
    pub endpoint: String,
    pub message: String,
    pub kind: ErrorKind,
    pub details: Option<String>,
    pub debug_info: Option<serde_json::Value>,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl ApiError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ApiError::Transport(_) => ErrorKind::Unclassified,
            ApiError::Backend(e) => e.kind.clone(),
        }
    }
}

/// Client-side precondition failures. Raised before any request is sent.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("article title must not be empty")]
    EmptyTitle,
    #[error("no article is loaded")]
    NoArticle,
    #[error("no saved draft to publish, save the article as a draft first")]
    NoDraft,
    #[error("cannot {action} while {state}")]
    IllegalTransition { action: Action, state: String },
    #[error("record '{0}' already has a pending scheduled publish")]
    AlreadyScheduled(String),
    #[error("record '{0}' is already published")]
    AlreadyPublished(String),
    #[error("record '{0}' has no stored content")]
    MissingContent(String),
    #[error("record '{0}' has no saved draft")]
    MissingMediaId(String),
    #[error("draft {0} was already submitted for publishing, save the article again")]
    DraftAlreadyUsed(String),
    #[error("record '{0}' has no backend id")]
    MissingRecordId(String),
    #[error("publish time {0} is not in the future")]
    PublishTimeInPast(String),
    #[error("invalid publish time '{0}': expected YYYY-MM-DD HH:MM[:SS]")]
    InvalidPublishTime(String),
}

/// User-initiated operations, used in logs and error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Generate,
    SaveDraft,
    Publish,
    MassSend,
    LoadFromHistory,
    RefreshPreview,
    Schedule,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Action::Generate => "generate article",
            Action::SaveDraft => "save draft",
            Action::Publish => "publish draft",
            Action::MassSend => "broadcast article",
            Action::LoadFromHistory => "load article",
            Action::RefreshPreview => "refresh preview",
            Action::Schedule => "schedule publish",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("{action} failed: {source}")]
    Api { action: Action, source: ApiError },
}

impl ControllerError {
    pub fn api(action: Action, source: ApiError) -> Self {
        ControllerError::Api { action, source }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ControllerError::Validation(_) => ErrorKind::Unclassified,
            ControllerError::Api { source, .. } => source.kind(),
        }
    }

    /// Text meant for the person at the panel. Quota and credential failures get
    /// their own wording since they need different fixes.
    pub fn user_message(&self) -> String {
        match self {
            ControllerError::Validation(e) => e.to_string(),
            ControllerError::Api { action, source } => match source.kind() {
                ErrorKind::QuotaExceeded => format!(
                    "{action} failed: API quota exhausted. Switch to another model or wait for the quota to reset."
                ),
                ErrorKind::InvalidKey => {
                    format!("{action} failed: API key rejected. Check the key configured on the backend.")
                }
                _ => match source {
                    ApiError::Backend(e) => format!("{action} failed: {}", e.message),
                    ApiError::Transport(e) => format!("{action} failed: {e}"),
                },
            },
        }
    }
}
