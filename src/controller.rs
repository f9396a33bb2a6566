//! Publication lifecycle of the working article.
//!
//! ```text
//! Idle ──generate──▶ Generating ──ok──▶ Previewing ──save──▶ DraftSaved ──publish──▶ Published
//!                        │ err                                    ▲   │ err
//!                        ▼                                        └───┘
//!                   prior state
//! ```
//!
//! Loading a history record moves any state to `Previewing`. The draft handle is
//! single use: it is taken out before publish-draft is sent and never put back.

use std::collections::HashSet;

use serde_json::{Map, Value};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::api::BackendClient;
use crate::config::{Config, GenerationConfig};
use crate::error::{Action, ApiError, ControllerError, ValidationError};
use crate::models::{
    Article, DraftHandle, GenerateRequest, HistoryRecord, HistoryStatus, PublishReceipt, RecordAffordances,
};
use crate::progress::ProgressEstimator;
use crate::reconcile::{HistorySnapshot, RefreshTrigger};
use crate::rewrite::ImageProxy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Idle,
    Generating,
    Previewing,
    DraftSaved,
    Published,
}

impl LifecycleState {
    pub fn label(self) -> &'static str {
        match self {
            LifecycleState::Idle => "idle",
            LifecycleState::Generating => "generating",
            LifecycleState::Previewing => "previewing",
            LifecycleState::DraftSaved => "draft saved",
            LifecycleState::Published => "published",
        }
    }
}

/// Which controls are usable right now. Derived from controller state only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Affordances {
    pub generate: bool,
    pub save_draft: bool,
    pub publish: bool,
    pub refresh_preview: bool,
    pub load_from_history: bool,
}

impl Affordances {
    pub fn project(state: LifecycleState, has_article: bool, has_draft: bool, busy: bool) -> Self {
        if busy {
            return Self::default();
        }
        Self {
            generate: matches!(
                state,
                LifecycleState::Idle | LifecycleState::Previewing | LifecycleState::Published
            ),
            save_draft: has_article
                && !has_draft
                && matches!(state, LifecycleState::Previewing | LifecycleState::DraftSaved),
            publish: has_draft,
            refresh_preview: has_article,
            load_from_history: true,
        }
    }
}

/// What renderers observe. Published on every transition.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerSnapshot {
    pub state: LifecycleState,
    pub affordances: Affordances,
    pub busy: Option<Action>,
    pub title: Option<String>,
    pub media_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct GenerateOptions {
    pub title: String,
    pub word_count: u32,
    pub image_count: u32,
    pub format_template: String,
    pub ai_model: String,
    pub image_model: String,
    pub params: Map<String, Value>,
}

impl GenerateOptions {
    /// Request defaults from `[generation]`. The template file is read by the caller.
    pub fn from_config(title: impl Into<String>, config: &GenerationConfig) -> Self {
        Self {
            title: title.into(),
            word_count: config.word_count,
            image_count: config.image_count,
            format_template: String::new(),
            ai_model: config.ai_model.clone(),
            image_model: config.image_model.clone(),
            params: config.params.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BroadcastStatus {
    NotRequested,
    Sent,
    /// Publish succeeded but returned no publish_id to broadcast with.
    Skipped,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishOutcome {
    pub publish_id: Option<String>,
    pub broadcast: BroadcastStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviewRefresh {
    pub filename: String,
    pub size: u64,
    pub modified_time: Option<String>,
    pub rewritten_images: usize,
    pub discarded_draft: bool,
}

pub struct Controller {
    api: BackendClient,
    images: ImageProxy,
    estimator: ProgressEstimator,
    refresh: RefreshTrigger,
    state: LifecycleState,
    article: Option<Article>,
    draft: Option<DraftHandle>,
    /// Operation in flight and the state to fall back to if it never finishes.
    pending: Option<(Action, LifecycleState)>,
    /// media_ids already sent to publish-draft in this session.
    used_drafts: HashSet<String>,
    /// Record ids scheduled in this session that history has not yet reported as scheduled.
    scheduled: HashSet<String>,
    tx: watch::Sender<ControllerSnapshot>,
}

impl Controller {
    pub fn new(api: BackendClient, config: &Config, refresh: RefreshTrigger) -> Self {
        let initial = ControllerSnapshot {
            state: LifecycleState::Idle,
            affordances: Affordances::project(LifecycleState::Idle, false, false, false),
            busy: None,
            title: None,
            media_id: None,
        };
        let (tx, _rx) = watch::channel(initial);
        Self {
            api,
            images: ImageProxy::new(&config.images),
            estimator: ProgressEstimator::new(&config.progress),
            refresh,
            state: LifecycleState::Idle,
            article: None,
            draft: None,
            pending: None,
            used_drafts: HashSet::new(),
            scheduled: HashSet::new(),
            tx,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn article(&self) -> Option<&Article> {
        self.article.as_ref()
    }

    pub fn draft(&self) -> Option<&DraftHandle> {
        self.draft.as_ref()
    }

    pub fn affordances(&self) -> Affordances {
        Affordances::project(
            self.state,
            self.article.is_some(),
            self.draft.is_some(),
            self.pending.is_some(),
        )
    }

    pub fn subscribe(&self) -> watch::Receiver<ControllerSnapshot> {
        self.tx.subscribe()
    }

    pub fn progress(&self) -> &ProgressEstimator {
        &self.estimator
    }

    pub(crate) fn api(&self) -> &BackendClient {
        &self.api
    }

    /// Mark a media_id as sent to publish-draft. Returns false if it already was.
    pub(crate) fn claim_draft(&mut self, media_id: &str) -> bool {
        self.used_drafts.insert(media_id.to_string())
    }

    pub fn draft_used(&self, media_id: &str) -> bool {
        self.used_drafts.contains(media_id)
    }

    pub(crate) fn mark_scheduled(&mut self, record_id: &str) {
        self.scheduled.insert(record_id.to_string());
    }

    pub fn scheduled_locally(&self, record_id: &str) -> bool {
        self.scheduled.contains(record_id)
    }

    /// Forget local schedule marks once history reports the record as scheduled or published.
    pub fn observe_history(&mut self, snapshot: &HistorySnapshot) {
        self.scheduled.retain(|id| match snapshot.find(id) {
            Some(record) => !(record.is_pending_schedule() || record.status == HistoryStatus::Published),
            None => true,
        });
    }

    /// Per-record actions, narrowed by what this session has already done.
    pub fn record_affordances(&self, record: &HistoryRecord) -> RecordAffordances {
        let mut a = record.affordances();
        if record.media_id.as_deref().is_some_and(|m| self.draft_used(m)) {
            a.publish_draft = false;
        }
        if record.id.as_deref().is_some_and(|id| self.scheduled_locally(id)) {
            a.schedule = false;
            a.publish_draft = false;
            a.pending_indicator = true;
        }
        a
    }

    pub(crate) fn request_refresh(&self) {
        self.refresh.request();
    }

    fn snapshot(&self) -> ControllerSnapshot {
        ControllerSnapshot {
            state: self.state,
            affordances: self.affordances(),
            busy: self.pending.map(|(action, _)| action),
            title: self.article.as_ref().map(|a| a.title.clone()),
            media_id: self.draft.as_ref().map(|d| d.media_id().to_string()),
        }
    }

    fn notify(&self) {
        self.tx.send_replace(self.snapshot());
    }

    /// Undo the bookkeeping of an operation whose future was dropped mid-flight.
    pub(crate) fn settle(&mut self) {
        if let Some((action, prior)) = self.pending.take() {
            warn!(%action, state = prior.label(), "previous operation was abandoned, restoring state");
            self.state = prior;
            self.notify();
        }
    }

    pub(crate) fn begin(&mut self, action: Action) -> LifecycleState {
        let prior = self.state;
        self.pending = Some((action, prior));
        self.notify();
        prior
    }

    pub(crate) fn finish(&mut self, state: LifecycleState) {
        self.pending = None;
        self.state = state;
        self.notify();
    }

    fn illegal(&self, action: Action) -> ControllerError {
        ValidationError::IllegalTransition {
            action,
            state: self.state.label().to_string(),
        }
        .into()
    }

    fn fail(&mut self, action: Action, prior: LifecycleState, source: ApiError) -> ControllerError {
        self.finish(prior);
        let err = ControllerError::api(action, source);
        error!(%action, error_kind = ?err.kind(), error = %err, "operation failed, state restored");
        err
    }

    /// Rewrite protected image URLs and make the article the working article.
    fn capture(&mut self, mut article: Article) {
        let (content, rewritten) = self.images.rewrite(&article.content);
        if rewritten > 0 {
            info!(title = %article.title, rewritten, "routed images through proxy");
        }
        article.content = content;
        self.article = Some(article);
    }

    /// Ask the backend for a new article. Progress is published on the estimator.
    pub async fn generate(&mut self, options: GenerateOptions) -> Result<(), ControllerError> {
        self.settle();
        let title = options.title.trim();
        if title.is_empty() {
            return Err(ValidationError::EmptyTitle.into());
        }
        if !self.affordances().generate {
            return Err(self.illegal(Action::Generate));
        }

        let request = GenerateRequest {
            title: title.to_string(),
            word_count: options.word_count,
            image_count: options.image_count,
            format_template: options.format_template,
            ai_model: options.ai_model,
            image_model: options.image_model,
            params: options.params,
        };

        let prior = self.begin(Action::Generate);
        self.state = LifecycleState::Generating;
        self.notify();
        info!(
            title = %request.title,
            ai_model = %request.ai_model,
            image_model = %request.image_model,
            word_count = request.word_count,
            image_count = request.image_count,
            "generating article"
        );

        let run = self.estimator.start(request.image_count);
        match self.api.generate_article(&request).await {
            Ok(article) => {
                run.complete();
                info!(
                    title = %article.title,
                    content_length = article.content_length,
                    image_count = article.image_count,
                    "article generated"
                );
                self.capture(article);
                self.draft = None;
                self.finish(LifecycleState::Previewing);
                self.request_refresh();
                Ok(())
            }
            Err(e) => {
                run.fail();
                Err(self.fail(Action::Generate, prior, e))
            }
        }
    }

    /// Persist the working article as a draft; on success publishing becomes possible.
    pub async fn save_draft(&mut self) -> Result<DraftHandle, ControllerError> {
        self.settle();
        let Some(article) = self.article.clone() else {
            return Err(ValidationError::NoArticle.into());
        };
        if !self.affordances().save_draft {
            return Err(self.illegal(Action::SaveDraft));
        }

        let prior = self.begin(Action::SaveDraft);
        info!(title = %article.title, "saving draft");
        match self.api.save_draft(&article).await {
            Ok(handle) => {
                info!(title = %article.title, media_id = %handle, "draft saved");
                self.draft = Some(handle.clone());
                self.finish(LifecycleState::DraftSaved);
                self.request_refresh();
                Ok(handle)
            }
            Err(e) => Err(self.fail(Action::SaveDraft, prior, e)),
        }
    }

    /// Publish the saved draft, optionally broadcasting it afterwards.
    ///
    /// The handle is consumed whether or not publishing succeeds.
    pub async fn publish(&mut self, mass_send: bool) -> Result<PublishOutcome, ControllerError> {
        self.settle();
        let Some(handle) = self.draft.take() else {
            return Err(ValidationError::NoDraft.into());
        };

        self.claim_draft(handle.media_id());
        let prior = self.begin(Action::Publish);
        info!(media_id = %handle, mass_send, "publishing draft");
        match self.api.publish_draft(&handle).await {
            Ok(receipt) => {
                info!(
                    media_id = %handle,
                    publish_id = ?receipt.publish_id,
                    msg_data_id = ?receipt.msg_data_id,
                    "draft published"
                );
                self.state = LifecycleState::Published;
                self.notify();
                let broadcast = broadcast(&self.api, &receipt, mass_send).await;
                self.finish(LifecycleState::Published);
                self.request_refresh();
                Ok(PublishOutcome {
                    publish_id: receipt.publish_id,
                    broadcast,
                })
            }
            Err(e) => Err(self.fail(Action::Publish, prior, e)),
        }
    }

    /// Replace the working article with a history record's stored content.
    pub async fn load_from_history(&mut self, record: &HistoryRecord) -> Result<(), ControllerError> {
        self.settle();
        if !record.has_content() {
            return Err(ValidationError::MissingContent(record.title.clone()).into());
        }

        let prior = self.begin(Action::LoadFromHistory);
        match self.api.article_content(&record.cache_files).await {
            Ok(content) => {
                self.capture(Article::from_record(record, content));
                if let Some(stale) = self.draft.take() {
                    info!(media_id = %stale, "dropping draft handle of the previous article");
                }
                self.finish(LifecycleState::Previewing);
                info!(title = %record.title, "loaded article from history");
                Ok(())
            }
            Err(e) => Err(self.fail(Action::LoadFromHistory, prior, e)),
        }
    }

    /// Swap in the newest cache artifact as the working article's body.
    ///
    /// A saved draft no longer matches the new body, so its handle is discarded.
    pub async fn refresh_preview(&mut self) -> Result<PreviewRefresh, ControllerError> {
        self.settle();
        if self.article.is_none() {
            return Err(ValidationError::NoArticle.into());
        }

        let prior = self.begin(Action::RefreshPreview);
        match self.api.latest_cache_file().await {
            Ok(file) => {
                let (content, rewritten_images) = self.images.rewrite(&file.content);
                if let Some(article) = self.article.as_mut() {
                    article.content = content;
                }
                let discarded_draft = self.draft.take().is_some();
                if discarded_draft {
                    info!(filename = %file.filename, "content changed after save, draft handle discarded");
                }
                self.finish(LifecycleState::Previewing);
                info!(filename = %file.filename, size = file.size, rewritten_images, "preview refreshed");
                Ok(PreviewRefresh {
                    filename: file.filename,
                    size: file.size,
                    modified_time: file.modified_time,
                    rewritten_images,
                    discarded_draft,
                })
            }
            Err(e) => Err(self.fail(Action::RefreshPreview, prior, e)),
        }
    }

    /// Drop the working article and return to `Idle`.
    pub fn clear(&mut self) {
        self.settle();
        self.article = None;
        self.draft = None;
        self.state = LifecycleState::Idle;
        self.notify();
    }
}

/// Broadcast after a successful publish. Never fails the publish itself.
pub(crate) async fn broadcast(api: &BackendClient, receipt: &PublishReceipt, mass_send: bool) -> BroadcastStatus {
    if !mass_send {
        return BroadcastStatus::NotRequested;
    }
    let Some(publish_id) = receipt.publish_id.as_deref() else {
        warn!("publish returned no publish_id, broadcast skipped");
        return BroadcastStatus::Skipped;
    };
    match api.mass_send(publish_id).await {
        Ok(()) => {
            info!(publish_id, "broadcast sent");
            BroadcastStatus::Sent
        }
        Err(e) => {
            let err = ControllerError::api(Action::MassSend, e);
            warn!(publish_id, error = %err, "broadcast failed, publish stands");
            BroadcastStatus::Failed(err.user_message())
        }
    }
}
