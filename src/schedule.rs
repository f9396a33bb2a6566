//! Scheduled and deferred publishing of history records.
//!
//! These run through the controller's busy bookkeeping but never touch the
//! working article: a record is rehydrated, saved as its own draft and handed to
//! the backend's scheduler.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use tracing::{info, warn};

use crate::controller::{BroadcastStatus, Controller, PublishOutcome, broadcast};
use crate::error::{Action, ControllerError, ValidationError};
use crate::models::{Article, DraftHandle, HistoryRecord, HistoryStatus, ScheduleRequest};

const WIRE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const INPUT_FORMATS: [&str; 4] = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledPublish {
    pub record_id: String,
    pub media_id: String,
    pub publish_time: String,
    pub enable_mass_send: bool,
}

/// Parse a wall-clock publish time in `tz` and require it to lie after `now`.
/// Returns the time in the backend's `YYYY-MM-DD HH:MM:SS` form.
pub fn parse_publish_time(input: &str, tz: Tz, now: DateTime<Utc>) -> Result<String, ValidationError> {
    let input = input.trim();
    let naive = INPUT_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(input, fmt).ok())
        .ok_or_else(|| ValidationError::InvalidPublishTime(input.to_string()))?;

    // Times skipped by a DST jump do not exist locally.
    let local = tz
        .from_local_datetime(&naive)
        .earliest()
        .ok_or_else(|| ValidationError::InvalidPublishTime(input.to_string()))?;

    if local.with_timezone(&Utc) <= now {
        return Err(ValidationError::PublishTimeInPast(input.to_string()));
    }
    Ok(naive.format(WIRE_FORMAT).to_string())
}

fn check_schedulable(record: &HistoryRecord) -> Result<String, ValidationError> {
    if record.is_pending_schedule() {
        return Err(ValidationError::AlreadyScheduled(record.title.clone()));
    }
    if record.status == HistoryStatus::Published {
        return Err(ValidationError::AlreadyPublished(record.title.clone()));
    }
    if !record.has_content() {
        return Err(ValidationError::MissingContent(record.title.clone()));
    }
    record
        .id
        .clone()
        .ok_or_else(|| ValidationError::MissingRecordId(record.title.clone()))
}

/// Register a future publish of `record`: fetch its content, save it as a
/// draft, then submit the schedule. Stops at the first failure.
pub async fn schedule_record(
    controller: &mut Controller,
    record: &HistoryRecord,
    publish_time: &str,
    enable_mass_send: bool,
    tz: Tz,
    now: DateTime<Utc>,
) -> Result<ScheduledPublish, ControllerError> {
    controller.settle();
    let record_id = check_schedulable(record)?;
    if controller.scheduled_locally(&record_id) {
        return Err(ValidationError::AlreadyScheduled(record.title.clone()).into());
    }
    let publish_time = parse_publish_time(publish_time, tz, now)?;

    let prior = controller.begin(Action::Schedule);
    let result = submit(controller, record, record_id, publish_time, enable_mass_send).await;
    controller.finish(prior);

    match &result {
        Ok(scheduled) => {
            info!(
                title = %record.title,
                media_id = %scheduled.media_id,
                publish_time = %scheduled.publish_time,
                enable_mass_send,
                "publish scheduled"
            );
            controller.mark_scheduled(&scheduled.record_id);
            controller.request_refresh();
        }
        Err(e) => warn!(title = %record.title, error = %e, "scheduling aborted"),
    }
    result
}

async fn submit(
    controller: &Controller,
    record: &HistoryRecord,
    record_id: String,
    publish_time: String,
    enable_mass_send: bool,
) -> Result<ScheduledPublish, ControllerError> {
    let api = controller.api();

    let content = api
        .article_content(&record.cache_files)
        .await
        .map_err(|e| ControllerError::api(Action::LoadFromHistory, e))?;

    let article = Article::from_record(record, content);
    let handle = api
        .save_draft(&article)
        .await
        .map_err(|e| ControllerError::api(Action::SaveDraft, e))?;

    let request = ScheduleRequest {
        media_id: handle.media_id().to_string(),
        publish_time,
        draft_id: record_id,
        enable_mass_send,
    };
    api.schedule_publish(&request)
        .await
        .map_err(|e| ControllerError::api(Action::Schedule, e))?;

    Ok(ScheduledPublish {
        record_id: request.draft_id,
        media_id: request.media_id,
        publish_time: request.publish_time,
        enable_mass_send,
    })
}

/// Publish a record that already has a saved draft on the backend.
pub async fn publish_saved_record(
    controller: &mut Controller,
    record: &HistoryRecord,
    mass_send: bool,
) -> Result<PublishOutcome, ControllerError> {
    controller.settle();
    if record.status == HistoryStatus::Published {
        return Err(ValidationError::AlreadyPublished(record.title.clone()).into());
    }
    if record.is_pending_schedule() {
        return Err(ValidationError::AlreadyScheduled(record.title.clone()).into());
    }
    if record.id.as_deref().is_some_and(|id| controller.scheduled_locally(id)) {
        return Err(ValidationError::AlreadyScheduled(record.title.clone()).into());
    }
    let Some(media_id) = record.media_id.clone() else {
        return Err(ValidationError::MissingMediaId(record.title.clone()).into());
    };
    // Single use: claimed before sending, never released.
    if !controller.claim_draft(&media_id) {
        return Err(ValidationError::DraftAlreadyUsed(media_id).into());
    }
    let handle = DraftHandle::new(media_id);

    let prior = controller.begin(Action::Publish);
    let published = controller.api().publish_draft(&handle).await;
    let outcome = match published {
        Ok(receipt) => {
            info!(
                title = %record.title,
                media_id = %handle,
                publish_id = ?receipt.publish_id,
                msg_data_id = ?receipt.msg_data_id,
                "saved draft published"
            );
            let status = broadcast(controller.api(), &receipt, mass_send).await;
            Ok(PublishOutcome {
                publish_id: receipt.publish_id,
                broadcast: status,
            })
        }
        Err(e) => Err(ControllerError::api(Action::Publish, e)),
    };
    controller.finish(prior);

    match &outcome {
        Ok(o) => {
            if o.broadcast != BroadcastStatus::NotRequested {
                info!(title = %record.title, broadcast = ?o.broadcast, "broadcast result");
            }
            controller.request_refresh();
        }
        Err(e) => warn!(title = %record.title, error = %e, "publishing saved draft failed"),
    }
    outcome
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::{Value, json};

    use super::*;
    use crate::api::{ARTICLE_CONTENT, BackendClient, MASS_SEND, PUBLISH_DRAFT, SAVE_DRAFT, SCHEDULE_PUBLISH};
    use crate::config::Config;
    use crate::controller::LifecycleState;
    use crate::reconcile::{HistorySnapshot, RefreshTrigger};
    use crate::transport::scripted::ScriptedTransport;

    fn setup() -> (Arc<ScriptedTransport>, Controller) {
        let t = Arc::new(ScriptedTransport::new());
        let c = Controller::new(BackendClient::new(t.clone()), &Config::default(), RefreshTrigger::new());
        (t, c)
    }

    fn now() -> DateTime<Utc> {
        // 2026-10-19 12:00 in Shanghai.
        Utc.with_ymd_and_hms(2026, 10, 19, 4, 0, 0).unwrap()
    }

    fn shanghai() -> Tz {
        chrono_tz::Asia::Shanghai
    }

    fn record(extra: Value) -> HistoryRecord {
        let mut base = json!({
            "id": "42",
            "title": "Autumn notes",
            "status": "generated",
            "author": "Desk",
            "cache_files": ["cache/42.html"],
        });
        if let (Some(b), Value::Object(e)) = (base.as_object_mut(), extra) {
            b.extend(e);
        }
        serde_json::from_value(base).unwrap()
    }

    async fn schedule(c: &mut Controller, r: &HistoryRecord, at: &str) -> Result<ScheduledPublish, ControllerError> {
        schedule_record(c, r, at, true, shanghai(), now()).await
    }

    #[test]
    fn publish_time_formats() {
        assert_eq!(
            parse_publish_time("2026-10-20 08:00", shanghai(), now()).unwrap(),
            "2026-10-20 08:00:00"
        );
        assert_eq!(
            parse_publish_time(" 2026-10-20T08:00:30 ", shanghai(), now()).unwrap(),
            "2026-10-20 08:00:30"
        );
        assert!(matches!(
            parse_publish_time("tomorrow", shanghai(), now()),
            Err(ValidationError::InvalidPublishTime(_))
        ));
    }

    #[test]
    fn publish_time_is_read_in_configured_zone() {
        // 11:30 Shanghai is already past at 12:00 Shanghai, but not in UTC.
        assert!(matches!(
            parse_publish_time("2026-10-19 11:30", shanghai(), now()),
            Err(ValidationError::PublishTimeInPast(_))
        ));
        assert!(parse_publish_time("2026-10-19 11:30", chrono_tz::UTC, now()).is_ok());
    }

    #[test]
    fn nonexistent_local_time_is_invalid() {
        // Clocks in New York jump from 02:00 to 03:00 on 2027-03-14.
        assert!(matches!(
            parse_publish_time("2027-03-14 02:30", chrono_tz::America::New_York, now()),
            Err(ValidationError::InvalidPublishTime(_))
        ));
    }

    #[tokio::test]
    async fn schedules_through_its_own_draft() {
        let (t, mut c) = setup();
        t.reply(ARTICLE_CONTENT, json!({ "content": "<p>stored</p>" }));
        t.reply(SAVE_DRAFT, json!({ "media_id": "M42" }));
        t.reply(SCHEDULE_PUBLISH, json!({ "job_id": "j1" }));

        let scheduled = schedule(&mut c, &record(json!({})), "2026-10-20 08:00").await.unwrap();
        assert_eq!(scheduled.media_id, "M42");
        assert_eq!(t.endpoints(), vec![ARTICLE_CONTENT, SAVE_DRAFT, SCHEDULE_PUBLISH]);

        let saved = &t.bodies(SAVE_DRAFT)[0]["article"];
        assert_eq!(saved["title"], "Autumn notes");
        assert_eq!(saved["content"], "<p>stored</p>");
        assert_eq!(
            t.bodies(SCHEDULE_PUBLISH)[0],
            json!({
                "media_id": "M42",
                "publish_time": "2026-10-20 08:00:00",
                "draft_id": "42",
                "enable_mass_send": true,
            })
        );
        // The working article is untouched.
        assert_eq!(c.state(), LifecycleState::Idle);
        assert!(c.article().is_none());
    }

    #[tokio::test]
    async fn save_failure_stops_before_scheduling() {
        let (t, mut c) = setup();
        t.reply(ARTICLE_CONTENT, json!({ "content": "<p>stored</p>" }));
        t.fail(SAVE_DRAFT, Some("quota_exceeded"), "quota");

        let err = schedule(&mut c, &record(json!({})), "2026-10-20 08:00").await.unwrap_err();
        assert!(matches!(err, ControllerError::Api { action: Action::SaveDraft, .. }));
        assert_eq!(t.count(SCHEDULE_PUBLISH), 0);
        assert!(c.affordances().generate);
    }

    #[tokio::test]
    async fn validation_happens_before_any_request() {
        let (t, mut c) = setup();
        let cases = [
            (record(json!({ "publish_time": "2026-10-20 08:00:00", "status": "saved" })), "2026-10-21 08:00"),
            (record(json!({ "status": "published" })), "2026-10-21 08:00"),
            (record(json!({ "cache_files": [] })), "2026-10-21 08:00"),
            (record(json!({ "id": null })), "2026-10-21 08:00"),
            (record(json!({})), "2026-10-18 08:00"),
        ];
        for (r, at) in &cases {
            let err = schedule(&mut c, r, at).await.unwrap_err();
            assert!(matches!(err, ControllerError::Validation(_)), "{err}");
        }
        assert!(t.endpoints().is_empty());
    }

    #[tokio::test]
    async fn publishes_saved_record_and_broadcasts() {
        let (t, mut c) = setup();
        t.reply(PUBLISH_DRAFT, json!({ "publish_id": 9001 }));
        t.reply(MASS_SEND, Value::Null);

        let r = record(json!({ "status": "saved", "media_id": "M42" }));
        let outcome = publish_saved_record(&mut c, &r, true).await.unwrap();
        assert_eq!(outcome.publish_id.as_deref(), Some("9001"));
        assert_eq!(outcome.broadcast, BroadcastStatus::Sent);
        assert_eq!(t.bodies(PUBLISH_DRAFT)[0]["media_id"], "M42");
        assert_eq!(t.bodies(MASS_SEND)[0]["publish_id"], "9001");
    }

    #[tokio::test]
    async fn saved_draft_is_never_sent_twice() {
        let (t, mut c) = setup();
        t.fail(PUBLISH_DRAFT, None, "system busy");
        t.reply(PUBLISH_DRAFT, json!({ "publish_id": "P2" }));
        let r = record(json!({ "status": "saved", "media_id": "M42" }));
        assert!(c.record_affordances(&r).publish_draft);

        assert!(matches!(
            publish_saved_record(&mut c, &r, false).await,
            Err(ControllerError::Api { action: Action::Publish, .. })
        ));
        let again = publish_saved_record(&mut c, &r, false).await.unwrap_err();
        assert!(matches!(again, ControllerError::Validation(ValidationError::DraftAlreadyUsed(ref m)) if m == "M42"));
        assert_eq!(t.count(PUBLISH_DRAFT), 1);
        assert!(!c.record_affordances(&r).publish_draft);
    }

    #[tokio::test]
    async fn successful_publish_also_consumes_the_draft() {
        let (t, mut c) = setup();
        t.reply(PUBLISH_DRAFT, json!({ "publish_id": "P1", "msg_data_id": 5 }));
        let r = record(json!({ "status": "saved", "media_id": "M42" }));

        publish_saved_record(&mut c, &r, false).await.unwrap();
        assert!(publish_saved_record(&mut c, &r, false).await.is_err());
        assert_eq!(t.count(PUBLISH_DRAFT), 1);
    }

    #[tokio::test]
    async fn record_is_scheduled_once_until_history_catches_up() {
        let (t, mut c) = setup();
        t.reply(ARTICLE_CONTENT, json!({ "content": "<p>stored</p>" }));
        t.reply(SAVE_DRAFT, json!({ "media_id": "M42" }));
        t.reply(SCHEDULE_PUBLISH, Value::Null);
        let r = record(json!({}));

        schedule(&mut c, &r, "2026-10-20 08:00").await.unwrap();
        let a = c.record_affordances(&r);
        assert!(!a.schedule && a.pending_indicator);

        let err = schedule(&mut c, &r, "2026-10-21 08:00").await.unwrap_err();
        assert!(matches!(err, ControllerError::Validation(ValidationError::AlreadyScheduled(_))));
        assert_eq!(t.count(ARTICLE_CONTENT), 1);
        assert_eq!(t.count(SCHEDULE_PUBLISH), 1);

        // A stale snapshot without publish_time keeps the local mark.
        let stale = HistorySnapshot {
            seq: 1,
            generated: vec![r.clone()],
            ..Default::default()
        };
        c.observe_history(&stale);
        assert!(c.scheduled_locally("42"));

        let reported = HistorySnapshot {
            seq: 2,
            generated: vec![record(json!({ "publish_time": "2026-10-20 08:00:00" }))],
            ..Default::default()
        };
        c.observe_history(&reported);
        assert!(!c.scheduled_locally("42"));
    }

    #[tokio::test]
    async fn failed_schedule_leaves_record_schedulable() {
        let (t, mut c) = setup();
        t.reply(ARTICLE_CONTENT, json!({ "content": "<p>stored</p>" }));
        t.reply(SAVE_DRAFT, json!({ "media_id": "M42" }));
        t.fail(SCHEDULE_PUBLISH, None, "publish time too close");
        let r = record(json!({}));

        assert!(schedule(&mut c, &r, "2026-10-20 08:00").await.is_err());
        assert!(!c.scheduled_locally("42"));
        assert!(c.record_affordances(&r).schedule);
    }

    #[tokio::test]
    async fn saved_record_without_media_id_is_rejected() {
        let (t, mut c) = setup();
        let err = publish_saved_record(&mut c, &record(json!({ "status": "saved" })), false)
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::Validation(ValidationError::MissingMediaId(_))));
        assert!(t.endpoints().is_empty());
    }
}
