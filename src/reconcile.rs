use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Notify, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::BackendClient;
use crate::error::ApiError;
use crate::models::{HistoryRecord, HistoryStatus, RecordKey};

/// Locally displayed copy of the backend's history lists.
#[derive(Debug, Clone, Default)]
pub struct HistorySnapshot {
    /// Sequence number of the fetch that produced this snapshot (0 = never fetched).
    pub seq: u64,
    pub generated: Vec<HistoryRecord>,
    pub published: Vec<HistoryRecord>,
    pub fetched_at: Option<DateTime<Utc>>,
}

impl HistorySnapshot {
    pub fn find(&self, id: &str) -> Option<&HistoryRecord> {
        self.generated.iter().find(|r| r.id.as_deref() == Some(id))
    }
}

pub struct HistoryStore {
    tx: watch::Sender<Arc<HistorySnapshot>>,
}

impl Default for HistoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl HistoryStore {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Arc::new(HistorySnapshot::default()));
        Self { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<HistorySnapshot>> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> Arc<HistorySnapshot> {
        self.tx.borrow().clone()
    }

    /// Replace the snapshot with a fetch result.
    ///
    /// Rejected when a fetch issued later has already landed. Records missing from
    /// the fetch are dropped; a record never moves back to a lower status.
    pub fn apply(
        &self,
        seq: u64,
        generated: Vec<HistoryRecord>,
        published: Vec<HistoryRecord>,
        fetched_at: DateTime<Utc>,
    ) -> bool {
        self.tx.send_if_modified(|current| {
            if seq <= current.seq {
                return false;
            }
            let generated = hold_status(&current.generated, generated);
            let published = hold_status(&current.published, published);
            *current = Arc::new(HistorySnapshot {
                seq,
                generated,
                published,
                fetched_at: Some(fetched_at),
            });
            true
        })
    }
}

fn hold_status(previous: &[HistoryRecord], mut incoming: Vec<HistoryRecord>) -> Vec<HistoryRecord> {
    let shown: HashMap<RecordKey, HistoryStatus> = previous.iter().map(|r| (r.key(), r.status)).collect();
    for record in &mut incoming {
        if let Some(&status) = shown.get(&record.key())
            && status > record.status
        {
            debug!(title = %record.title, shown = status.label(), fetched = record.status.label(), "keeping newer status");
            record.status = status;
        }
    }
    incoming
}

/// Wakes the reconcile loop for an immediate refresh.
#[derive(Clone, Default)]
pub struct RefreshTrigger(Arc<Notify>);

impl RefreshTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.notify_one();
    }

    pub(crate) async fn requested(&self) {
        self.0.notified().await;
    }
}

pub struct Reconciler {
    api: BackendClient,
    store: Arc<HistoryStore>,
    next_seq: AtomicU64,
}

impl Reconciler {
    pub fn new(api: BackendClient, store: Arc<HistoryStore>) -> Self {
        Self {
            api,
            store,
            next_seq: AtomicU64::new(0),
        }
    }

    pub fn store(&self) -> &Arc<HistoryStore> {
        &self.store
    }

    /// Fetch both history lists and offer them to the store.
    /// Returns whether the result was applied.
    pub async fn refresh(&self) -> Result<bool, ApiError> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let (generated, published) = tokio::try_join!(self.api.generation_history(), self.api.publish_history())?;
        let (g, p) = (generated.len(), published.len());

        let applied = self.store.apply(seq, generated, published, Utc::now());
        if applied {
            debug!(seq, generated = g, published = p, "history snapshot replaced");
        } else {
            debug!(seq, "newer history already applied, discarding fetch");
        }
        Ok(applied)
    }
}

/// Refresh history every `interval` and whenever the trigger fires.
///
/// Each refresh runs in its own task, so a slow fetch never delays the next one;
/// the store's sequence check sorts out the ordering.
pub async fn reconcile_loop(
    reconciler: Arc<Reconciler>,
    trigger: RefreshTrigger,
    interval: Duration,
    cancel: CancellationToken,
) {
    info!(interval_secs = interval.as_secs(), "history reconciler started");
    spawn_refresh(&reconciler, "startup", &cancel);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("history reconciler shutting down");
                return;
            }
            _ = tokio::time::sleep(interval) => spawn_refresh(&reconciler, "interval", &cancel),
            _ = trigger.requested() => spawn_refresh(&reconciler, "on-demand", &cancel),
        }
    }
}

fn spawn_refresh(reconciler: &Arc<Reconciler>, reason: &'static str, cancel: &CancellationToken) {
    let reconciler = reconciler.clone();
    let cancel = cancel.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => {}
            result = reconciler.refresh() => {
                if let Err(e) = result {
                    warn!(reason, error = %e, "history refresh failed, keeping previous snapshot");
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use serde_json::{Value, json};

    use super::*;
    use crate::api::{GENERATION_HISTORY, PUBLISH_HISTORY};
    use crate::transport::scripted::ScriptedTransport;

    fn rec(id: &str, title: &str, status: &str) -> Value {
        json!({ "id": id, "title": title, "status": status, "cache_files": ["cache/x.html"] })
    }

    fn setup() -> (Arc<ScriptedTransport>, Arc<Reconciler>) {
        let t = Arc::new(ScriptedTransport::new());
        let reconciler = Arc::new(Reconciler::new(
            BackendClient::new(t.clone()),
            Arc::new(HistoryStore::new()),
        ));
        (t, reconciler)
    }

    fn titles(records: &[HistoryRecord]) -> Vec<&str> {
        records.iter().map(|r| r.title.as_str()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn older_slow_fetch_does_not_overwrite_newer() {
        let (t, reconciler) = setup();
        t.reply_after(GENERATION_HISTORY, Duration::from_secs(5), json!([rec("1", "stale", "generated")]));
        t.reply(GENERATION_HISTORY, json!([rec("1", "fresh", "saved")]));
        t.reply(PUBLISH_HISTORY, json!([]));
        t.reply(PUBLISH_HISTORY, json!([]));

        let (older, newer) = tokio::join!(reconciler.refresh(), reconciler.refresh());

        assert!(newer.unwrap());
        assert!(!older.unwrap());
        let snapshot = reconciler.store().current();
        assert_eq!(snapshot.seq, 2);
        assert_eq!(titles(&snapshot.generated), vec!["fresh"]);
    }

    #[tokio::test]
    async fn remote_list_is_authoritative() {
        let (t, reconciler) = setup();
        t.reply(
            GENERATION_HISTORY,
            json!([rec("1", "a", "generated"), rec("2", "b", "generated")]),
        );
        t.reply(PUBLISH_HISTORY, json!([]));
        t.reply(GENERATION_HISTORY, json!([rec("2", "b", "generated")]));
        t.reply(PUBLISH_HISTORY, json!([]));

        reconciler.refresh().await.unwrap();
        assert_eq!(titles(&reconciler.store().current().generated), vec!["a", "b"]);
        reconciler.refresh().await.unwrap();
        assert_eq!(titles(&reconciler.store().current().generated), vec!["b"]);
    }

    #[tokio::test]
    async fn displayed_status_never_regresses() {
        let (t, reconciler) = setup();
        t.reply(GENERATION_HISTORY, json!([rec("1", "a", "published")]));
        t.reply(PUBLISH_HISTORY, json!([]));
        t.reply(GENERATION_HISTORY, json!([rec("1", "a", "saved"), rec("2", "b", "generated")]));
        t.reply(PUBLISH_HISTORY, json!([]));

        reconciler.refresh().await.unwrap();
        reconciler.refresh().await.unwrap();
        let snapshot = reconciler.store().current();
        assert_eq!(snapshot.find("1").unwrap().status, HistoryStatus::Published);
        assert_eq!(snapshot.find("2").unwrap().status, HistoryStatus::Generated);
    }

    #[tokio::test]
    async fn unrecognised_status_ranks_below_known_ones() {
        let (t, reconciler) = setup();
        t.reply(
            GENERATION_HISTORY,
            json!([rec("1", "a", "published"), rec("2", "b", "archived")]),
        );
        t.reply(PUBLISH_HISTORY, json!([]));
        t.reply(
            GENERATION_HISTORY,
            json!([rec("1", "a", "archived"), rec("2", "b", "generated")]),
        );
        t.reply(PUBLISH_HISTORY, json!([]));

        reconciler.refresh().await.unwrap();
        assert_eq!(reconciler.store().current().find("2").unwrap().status, HistoryStatus::Unknown);

        reconciler.refresh().await.unwrap();
        let snapshot = reconciler.store().current();
        assert_eq!(snapshot.find("1").unwrap().status, HistoryStatus::Published);
        assert_eq!(snapshot.find("2").unwrap().status, HistoryStatus::Generated);
    }

    #[tokio::test]
    async fn scheduled_record_clears_pending_once_published() {
        let (t, reconciler) = setup();
        let mut pending = rec("1", "a", "saved");
        pending["publish_time"] = json!("2026-10-20 08:00:00");
        let mut done = pending.clone();
        done["status"] = json!("published");
        t.reply(GENERATION_HISTORY, json!([pending]));
        t.reply(PUBLISH_HISTORY, json!([]));
        t.reply(GENERATION_HISTORY, json!([done]));
        t.reply(PUBLISH_HISTORY, json!([{ "title": "a", "publish_id": "P1" }]));

        reconciler.refresh().await.unwrap();
        assert!(reconciler.store().current().find("1").unwrap().is_pending_schedule());

        reconciler.refresh().await.unwrap();
        let snapshot = reconciler.store().current();
        let record = snapshot.find("1").unwrap();
        assert!(!record.is_pending_schedule());
        assert!(!record.affordances().pending_indicator);
        assert_eq!(snapshot.published.len(), 1);
    }

    #[tokio::test]
    async fn failed_fetch_keeps_previous_snapshot() {
        let (t, reconciler) = setup();
        t.reply(GENERATION_HISTORY, json!([rec("1", "a", "generated")]));
        t.reply(PUBLISH_HISTORY, json!([]));
        t.fail(GENERATION_HISTORY, None, "history file locked");
        t.reply(PUBLISH_HISTORY, json!([]));

        reconciler.refresh().await.unwrap();
        assert!(reconciler.refresh().await.is_err());
        assert_eq!(titles(&reconciler.store().current().generated), vec!["a"]);
    }

    #[tokio::test(start_paused = true)]
    async fn loop_refreshes_on_interval_and_on_demand() {
        let (t, reconciler) = setup();
        let trigger = RefreshTrigger::new();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(reconcile_loop(
            reconciler.clone(),
            trigger.clone(),
            Duration::from_secs(30),
            cancel.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(t.count(GENERATION_HISTORY), 1);

        trigger.request();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(t.count(GENERATION_HISTORY), 2);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(t.count(GENERATION_HISTORY), 3);

        cancel.cancel();
        handle.await.unwrap();
    }
}
