//! Terminal control panel: rendering plus the interactive prompt loop.

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use inquire::{Confirm, CustomType, InquireError, Select, Text};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::api::BackendClient;
use crate::config::Config;
use crate::controller::{BroadcastStatus, Controller, ControllerSnapshot, GenerateOptions, PublishOutcome};
use crate::error::ControllerError;
use crate::models::{Article, HistoryRecord, HistoryStatus, RecordAffordances};
use crate::progress::{Progress, ProgressEstimator, ProgressState};
use crate::reconcile::{HistorySnapshot, HistoryStore, Reconciler, RefreshTrigger, reconcile_loop};
use crate::schedule::{publish_saved_record, schedule_record};

const PREVIEW_WIDTH: usize = 100;

/// Article header plus its body rendered as plain text.
pub fn render_preview(article: &Article) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# {}", article.title);
    if !article.author.is_empty() {
        let _ = writeln!(out, "by {}", article.author);
    }
    if let Some(digest) = &article.digest {
        let _ = writeln!(out, "> {digest}");
    }
    let _ = writeln!(
        out,
        "{} chars, {} images{}",
        article.content_length,
        article.image_count,
        article
            .generated_at
            .as_deref()
            .map(|at| format!(", generated {at}"))
            .unwrap_or_default()
    );
    out.push('\n');
    let body = html2text::from_read(article.content.as_bytes(), PREVIEW_WIDTH).unwrap_or_else(|_| article.content.clone());
    out.push_str(body.trim_end());
    out.push('\n');
    out
}

fn badge(status: HistoryStatus) -> &'static str {
    match status {
        HistoryStatus::Generated => "[generated]",
        HistoryStatus::Saved => "[saved]    ",
        HistoryStatus::Published => "[published]",
        HistoryStatus::Unknown => "[?]        ",
    }
}

/// One history line: status badge, title, timestamps and a pending-schedule marker.
pub fn render_record(record: &HistoryRecord) -> String {
    render_record_as(record, record.affordances())
}

fn render_record_as(record: &HistoryRecord, affordances: RecordAffordances) -> String {
    let mut line = format!("{} {}", badge(record.status), record.title);
    if let Some(id) = &record.id {
        let _ = write!(line, " (#{id})");
    }
    if let Some(at) = record.published_at.as_deref().or(record.generated_at.as_deref()) {
        let _ = write!(line, "  {at}");
    }
    if affordances.pending_indicator {
        // Scheduled here but not yet reported back by the backend.
        match &record.publish_time {
            Some(at) => {
                let _ = write!(line, "  [scheduled {at}");
                if record.enable_mass_send == Some(true) {
                    line.push_str(", broadcast");
                }
                line.push(']');
            }
            None => line.push_str("  [scheduled]"),
        }
    }
    if record.mass_sent == Some(true) {
        line.push_str("  [broadcast sent]");
    }
    line
}

pub fn render_history(snapshot: &HistorySnapshot, published: bool) -> String {
    let records = if published { &snapshot.published } else { &snapshot.generated };
    if records.is_empty() {
        return "No records.\n".to_string();
    }
    let mut out = String::new();
    for record in records {
        out.push_str(&render_record(record));
        out.push('\n');
    }
    if let Some(at) = snapshot.fetched_at {
        let _ = writeln!(out, "-- fetched {}", at.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    out
}

pub fn render_status(snapshot: &ControllerSnapshot) -> String {
    let mut line = format!("state: {}", snapshot.state.label());
    if let Some(title) = &snapshot.title {
        let _ = write!(line, " | article: {title}");
    }
    if let Some(media_id) = &snapshot.media_id {
        let _ = write!(line, " | draft: {media_id}");
    }
    if let Some(action) = snapshot.busy {
        let _ = write!(line, " | busy: {action}");
    }
    line
}

pub fn render_outcome(outcome: &PublishOutcome) -> String {
    let mut line = match &outcome.publish_id {
        Some(id) => format!("Published (publish_id {id})."),
        None => "Published.".to_string(),
    };
    match &outcome.broadcast {
        BroadcastStatus::NotRequested => {}
        BroadcastStatus::Sent => line.push_str(" Broadcast sent."),
        BroadcastStatus::Skipped => line.push_str(" Broadcast skipped: no publish_id returned."),
        BroadcastStatus::Failed(msg) => {
            let _ = write!(line, " Broadcast failed: {msg}");
        }
    }
    line
}

/// Print progress lines to stderr for runs started after this call.
pub fn spawn_progress_printer(estimator: &ProgressEstimator) -> (u64, JoinHandle<()>) {
    let mut rx: watch::Receiver<Progress> = estimator.subscribe();
    let baseline = rx.borrow_and_update().run;
    let handle = tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            let p = rx.borrow_and_update().clone();
            if p.run <= baseline {
                continue;
            }
            match p.state {
                ProgressState::Running => eprintln!("[{:>3}%] {}", p.percent, p.label),
                ProgressState::Completed => {
                    eprintln!("[100%] {}", p.label);
                    return;
                }
                ProgressState::Failed => {
                    eprintln!("[{:>3}%] stopped", p.percent);
                    return;
                }
                ProgressState::Idle => {}
            }
        }
    });
    (baseline, handle)
}

/// Wait for the printer if a run was started, otherwise stop it.
pub async fn finish_progress_printer(estimator: &ProgressEstimator, baseline: u64, handle: JoinHandle<()>) {
    if estimator.current().run > baseline {
        let _ = tokio::time::timeout(Duration::from_secs(1), handle).await;
    } else {
        handle.abort();
    }
}

/// Run a generation with progress printed to stderr.
pub async fn generate_with_progress(controller: &mut Controller, options: GenerateOptions) -> Result<(), ControllerError> {
    let (baseline, printer) = spawn_progress_printer(controller.progress());
    let result = controller.generate(options).await;
    finish_progress_printer(controller.progress(), baseline, printer).await;
    result
}

fn prompt<T>(result: Result<T, InquireError>) -> Result<Option<T>> {
    match result {
        Ok(v) => Ok(Some(v)),
        Err(InquireError::OperationCanceled | InquireError::OperationInterrupted) => Ok(None),
        Err(e) => Err(e).context("reading input"),
    }
}

/// Inquire blocks the thread; keep the reconciler's worker free.
fn ask<T>(f: impl FnOnce() -> Result<T, InquireError>) -> Result<Option<T>> {
    prompt(tokio::task::block_in_place(f))
}

fn report(err: &ControllerError) {
    println!("Error: {}", err.user_message());
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MenuItem {
    Generate,
    ViewPreview,
    SaveDraft,
    Publish,
    RefreshPreview,
    Discard,
    History,
    PublishHistory,
    Quit,
}

impl std::fmt::Display for MenuItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            MenuItem::Generate => "Generate article",
            MenuItem::ViewPreview => "View preview",
            MenuItem::SaveDraft => "Save draft",
            MenuItem::Publish => "Publish draft",
            MenuItem::RefreshPreview => "Refresh preview from latest cache file",
            MenuItem::Discard => "Discard article",
            MenuItem::History => "Generation history",
            MenuItem::PublishHistory => "Publish history",
            MenuItem::Quit => "Quit",
        })
    }
}

fn menu(controller: &Controller) -> Vec<MenuItem> {
    let a = controller.affordances();
    let mut items = Vec::new();
    if a.generate {
        items.push(MenuItem::Generate);
    }
    if controller.article().is_some() {
        items.push(MenuItem::ViewPreview);
    }
    if a.save_draft {
        items.push(MenuItem::SaveDraft);
    }
    if a.publish {
        items.push(MenuItem::Publish);
    }
    if a.refresh_preview {
        items.push(MenuItem::RefreshPreview);
        items.push(MenuItem::Discard);
    }
    if a.load_from_history {
        items.push(MenuItem::History);
    }
    items.push(MenuItem::PublishHistory);
    items.push(MenuItem::Quit);
    items
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordAction {
    View,
    Load,
    PublishDraft,
    Schedule,
    Back,
}

impl std::fmt::Display for RecordAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            RecordAction::View => "View",
            RecordAction::Load => "Load into preview",
            RecordAction::PublishDraft => "Publish saved draft",
            RecordAction::Schedule => "Schedule publish",
            RecordAction::Back => "Back",
        })
    }
}

fn record_actions(a: RecordAffordances) -> Vec<RecordAction> {
    let mut actions = Vec::new();
    if a.view {
        actions.push(RecordAction::View);
    }
    if a.load_to_preview {
        actions.push(RecordAction::Load);
    }
    if a.publish_draft {
        actions.push(RecordAction::PublishDraft);
    }
    if a.schedule {
        actions.push(RecordAction::Schedule);
    }
    actions.push(RecordAction::Back);
    actions
}

struct Panel {
    config: Config,
    controller: Controller,
    store: Arc<HistoryStore>,
}

/// Interactive loop. History is reconciled in the background for its whole lifetime.
pub async fn run(config: Config, client: BackendClient) -> Result<()> {
    let store = Arc::new(HistoryStore::new());
    let trigger = RefreshTrigger::new();
    let reconciler = Arc::new(Reconciler::new(client.clone(), store.clone()));
    let cancel = CancellationToken::new();
    let reconcile_handle = tokio::spawn(reconcile_loop(
        reconciler,
        trigger.clone(),
        config.reconcile.interval_duration(),
        cancel.clone(),
    ));

    let controller = Controller::new(client, &config, trigger);
    let mut panel = Panel {
        config,
        controller,
        store,
    };
    let result = panel.main_loop().await;

    cancel.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(5), reconcile_handle).await;
    info!("panel closed");
    result
}

impl Panel {
    async fn main_loop(&mut self) -> Result<()> {
        loop {
            self.controller.observe_history(&self.store.current());
            println!();
            println!("{}", render_status(&self.controller.subscribe().borrow()));
            let items = menu(&self.controller);
            let Some(choice) = ask(|| Select::new("Action:", items).prompt())? else {
                return Ok(());
            };
            match choice {
                MenuItem::Generate => self.generate().await?,
                MenuItem::ViewPreview => {
                    if let Some(article) = self.controller.article() {
                        println!("{}", render_preview(article));
                    }
                }
                MenuItem::SaveDraft => match self.controller.save_draft().await {
                    Ok(handle) => println!("Draft saved (media_id {handle})."),
                    Err(e) => report(&e),
                },
                MenuItem::Publish => {
                    if let Some(draft) = self.controller.draft() {
                        println!("Publishing draft {draft}.");
                    }
                    let Some(mass_send) = ask(|| Confirm::new("Broadcast after publishing?").with_default(false).prompt())?
                    else {
                        continue;
                    };
                    match self.controller.publish(mass_send).await {
                        Ok(outcome) => println!("{}", render_outcome(&outcome)),
                        Err(e) => report(&e),
                    }
                }
                MenuItem::RefreshPreview => match self.controller.refresh_preview().await {
                    Ok(r) => {
                        match r.modified_time.as_deref() {
                            Some(at) => println!("Preview replaced with {} ({} bytes, modified {at}).", r.filename, r.size),
                            None => println!("Preview replaced with {} ({} bytes).", r.filename, r.size),
                        }
                        if r.discarded_draft {
                            println!("The saved draft no longer matches and was discarded; save again before publishing.");
                        }
                    }
                    Err(e) => report(&e),
                },
                MenuItem::Discard => self.controller.clear(),
                MenuItem::History => self.browse_history().await?,
                MenuItem::PublishHistory => print!("{}", render_history(&self.store.current(), true)),
                MenuItem::Quit => return Ok(()),
            }
        }
    }

    async fn generate(&mut self) -> Result<()> {
        let defaults = &self.config.generation;
        let Some(title) = ask(|| Text::new("Title:").prompt())? else {
            return Ok(());
        };
        let Some(image_count) = ask(|| {
            CustomType::<u32>::new("Images:")
                .with_default(defaults.image_count)
                .prompt()
        })?
        else {
            return Ok(());
        };

        let mut options = GenerateOptions::from_config(title, defaults);
        options.image_count = image_count;
        if let Some(path) = &defaults.format_template {
            options.format_template = std::fs::read_to_string(path)
                .with_context(|| format!("reading format template {}", path.display()))?;
        }

        match generate_with_progress(&mut self.controller, options).await {
            Ok(()) => {
                if let Some(article) = self.controller.article() {
                    println!("{}", render_preview(article));
                }
            }
            Err(e) => report(&e),
        }
        Ok(())
    }

    async fn browse_history(&mut self) -> Result<()> {
        let snapshot = self.store.current();
        self.controller.observe_history(&snapshot);
        if snapshot.generated.is_empty() {
            println!("No generation history yet.");
            return Ok(());
        }
        let records = snapshot.generated.clone();
        let labels: Vec<String> = records
            .iter()
            .map(|r| render_record_as(r, self.controller.record_affordances(r)))
            .collect();
        let Some(label) = ask(|| Select::new("Record:", labels.clone()).prompt())? else {
            return Ok(());
        };
        let Some(record) = labels.iter().position(|l| *l == label).and_then(|i| records.get(i)) else {
            return Ok(());
        };

        let actions = record_actions(self.controller.record_affordances(record));
        let Some(action) = ask(|| Select::new("Record action:", actions).prompt())? else {
            return Ok(());
        };
        match action {
            RecordAction::View => match self.controller.api().article_content(&record.cache_files).await {
                Ok(content) => println!("{}", render_preview(&Article::from_record(record, content))),
                Err(e) => println!("Error: {e}"),
            },
            RecordAction::Load => match self.controller.load_from_history(record).await {
                Ok(()) => println!("Loaded '{}' into the preview.", record.title),
                Err(e) => report(&e),
            },
            RecordAction::PublishDraft => {
                let Some(mass_send) = ask(|| Confirm::new("Broadcast after publishing?").with_default(false).prompt())?
                else {
                    return Ok(());
                };
                match publish_saved_record(&mut self.controller, record, mass_send).await {
                    Ok(outcome) => println!("{}", render_outcome(&outcome)),
                    Err(e) => report(&e),
                }
            }
            RecordAction::Schedule => {
                let Some(at) = ask(|| Text::new("Publish at (YYYY-MM-DD HH:MM):").prompt())? else {
                    return Ok(());
                };
                let Some(mass_send) = ask(|| Confirm::new("Broadcast when published?").with_default(false).prompt())?
                else {
                    return Ok(());
                };
                let tz = self.config.timezone();
                match schedule_record(&mut self.controller, record, &at, mass_send, tz, Utc::now()).await {
                    Ok(s) => println!("Scheduled '{}' for {} ({}).", record.title, s.publish_time, tz),
                    Err(e) => {
                        warn!(error = %e, "schedule failed");
                        report(&e);
                    }
                }
            }
            RecordAction::Back => {}
        }
        Ok(())
    }
}
