//! Synthetic progress for article generation.
//!
//! The backend gives no progress feedback, so a precomputed list of checkpoints
//! is walked on a timer while the request is outstanding. The signal is
//! non-decreasing, holds at the cap until the request resolves, and only reaches
//! 100 when the caller reports success.

use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::ProgressConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub percent: u8,
    pub label: String,
}

impl Checkpoint {
    fn new(percent: u32, label: impl Into<String>) -> Self {
        Self {
            percent: percent.min(100) as u8,
            label: label.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressState {
    Idle,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    /// Increments with every `start`, so a stale timer can recognise it lost its run.
    pub run: u64,
    pub percent: u8,
    pub label: String,
    pub state: ProgressState,
}

impl Progress {
    fn idle() -> Self {
        Self {
            run: 0,
            percent: 0,
            label: String::new(),
            state: ProgressState::Idle,
        }
    }
}

/// Checkpoints for one generation, spreading per-image steps across the
/// configured image range.
pub fn plan(image_count: u32, config: &ProgressConfig) -> Vec<Checkpoint> {
    let start = config.image_range_start as u32;
    let end = (config.image_range_end as u32).max(start);
    let cap = (config.cap as u32).max(end).min(99);

    let mut checkpoints: Vec<Checkpoint> = [
        (5, "Submitting request"),
        (12, "Researching topic"),
        (20, "Drafting outline"),
        (28, "Writing article body"),
    ]
    .into_iter()
    .map(|(p, label)| Checkpoint::new(p.min(start), label))
    .collect();

    if image_count == 0 {
        checkpoints.push(Checkpoint::new(start, "Polishing text"));
        checkpoints.push(Checkpoint::new(end, "Reviewing article"));
    } else {
        let steps = image_count * 2;
        let span = end - start;
        for k in 0..steps {
            let image = k / 2 + 1;
            let label = if k % 2 == 0 {
                format!("Generating image {image}/{image_count}")
            } else {
                format!("Placing image {image}/{image_count}")
            };
            checkpoints.push(Checkpoint::new(start + span * k / steps, label));
        }
        checkpoints.push(Checkpoint::new(end, "Images ready"));
    }

    checkpoints.push(Checkpoint::new(end + (cap - end) / 2, "Applying format template"));
    checkpoints.push(Checkpoint::new(cap, "Almost done, waiting for the backend"));
    checkpoints
}

/// Owns the published progress value; each generation gets its own `ProgressRun`.
pub struct ProgressEstimator {
    config: ProgressConfig,
    tick: Duration,
    tx: watch::Sender<Progress>,
}

impl ProgressEstimator {
    pub fn new(config: &ProgressConfig) -> Self {
        let (tx, _rx) = watch::channel(Progress::idle());
        Self {
            config: config.clone(),
            tick: config.tick_duration(),
            tx,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Progress> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> Progress {
        self.tx.borrow().clone()
    }

    /// Begin estimating. Must be called inside a tokio runtime.
    pub fn start(&self, image_count: u32) -> ProgressRun {
        let run = self.tx.borrow().run + 1;
        self.tx.send_replace(Progress {
            run,
            percent: 0,
            label: "Starting".to_string(),
            state: ProgressState::Running,
        });

        let cancel = CancellationToken::new();
        let checkpoints = plan(image_count, &self.config);
        debug!(run, image_count, checkpoints = checkpoints.len(), "progress estimator started");
        tokio::spawn(advance(self.tx.clone(), run, checkpoints, self.tick, cancel.clone()));

        ProgressRun {
            run,
            tx: self.tx.clone(),
            cancel,
        }
    }
}

async fn advance(
    tx: watch::Sender<Progress>,
    run: u64,
    checkpoints: Vec<Checkpoint>,
    tick: Duration,
    cancel: CancellationToken,
) {
    for checkpoint in checkpoints {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(tick) => {}
        }
        tx.send_if_modified(|p| {
            if p.run != run || p.state != ProgressState::Running || checkpoint.percent < p.percent {
                return false;
            }
            p.percent = checkpoint.percent;
            p.label = checkpoint.label.clone();
            true
        });
    }
    // Exhausted: the last checkpoint is the cap, hold there until resolved.
}

/// Handle for one estimated operation. Dropping it stops the timer.
pub struct ProgressRun {
    run: u64,
    tx: watch::Sender<Progress>,
    cancel: CancellationToken,
}

impl ProgressRun {
    /// The operation succeeded: jump to 100 and stop.
    pub fn complete(self) {
        self.finish(ProgressState::Completed);
    }

    /// The operation failed: stop where we are.
    pub fn fail(self) {
        self.finish(ProgressState::Failed);
    }

    fn finish(&self, state: ProgressState) {
        self.cancel.cancel();
        let run = self.run;
        self.tx.send_if_modified(|p| {
            if p.run != run || p.state != ProgressState::Running {
                return false;
            }
            if state == ProgressState::Completed {
                p.percent = 100;
                p.label = "Done".to_string();
            }
            p.state = state;
            true
        });
        debug!(run, ?state, "progress estimator stopped");
    }
}

impl Drop for ProgressRun {
    fn drop(&mut self) {
        if !self.cancel.is_cancelled() {
            // Abandoned without an outcome.
            self.finish(ProgressState::Failed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ProgressConfig {
        ProgressConfig::default()
    }

    fn assert_non_decreasing(points: &[Checkpoint]) {
        for w in points.windows(2) {
            assert!(w[0].percent <= w[1].percent, "{:?} then {:?}", w[0], w[1]);
        }
    }

    #[test]
    fn plan_is_monotonic_and_capped() {
        for images in [0, 1, 3, 10, 60] {
            let points = plan(images, &config());
            assert_non_decreasing(&points);
            assert!(points.iter().all(|c| c.percent <= 99));
            assert_eq!(points.last().unwrap().percent, 99);
        }
    }

    #[test]
    fn more_images_means_more_checkpoints_in_range() {
        let in_range = |n| {
            plan(n, &config())
                .into_iter()
                .filter(|c| (35..=94).contains(&c.percent))
                .count()
        };
        assert!(in_range(5) > in_range(2));
        assert!(in_range(2) > in_range(0));
    }

    #[test]
    fn image_steps_stay_inside_range() {
        let points = plan(4, &config());
        let image_points: Vec<_> = points.iter().filter(|c| c.label.contains("image")).collect();
        assert_eq!(image_points.len(), 8);
        assert_eq!(image_points[0].percent, 35);
        assert!(image_points.iter().all(|c| (35..94).contains(&c.percent)));
    }

    #[test]
    fn narrow_config_still_monotonic() {
        let cfg = ProgressConfig {
            tick: "100ms".to_string(),
            image_range_start: 10,
            image_range_end: 10,
            cap: 11,
        };
        let points = plan(3, &cfg);
        assert_non_decreasing(&points);
        assert_eq!(points.last().unwrap().percent, 11);
    }

    #[tokio::test(start_paused = true)]
    async fn run_is_non_decreasing_then_completes_at_100() {
        let estimator = ProgressEstimator::new(&config());
        let mut rx = estimator.subscribe();
        let run = estimator.start(3);

        let mut seen = vec![rx.borrow_and_update().percent];
        while seen.last() != Some(&99) {
            rx.changed().await.unwrap();
            let p = rx.borrow_and_update().clone();
            assert_eq!(p.state, ProgressState::Running);
            seen.push(p.percent);
        }
        for w in seen.windows(2) {
            assert!(w[0] <= w[1]);
        }

        // Holds at the cap however long the backend takes.
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(estimator.current().percent, 99);

        run.complete();
        let done = estimator.current();
        assert_eq!(done.percent, 100);
        assert_eq!(done.state, ProgressState::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_stops_without_reaching_100() {
        let estimator = ProgressEstimator::new(&config());
        let run = estimator.start(1);
        tokio::time::sleep(Duration::from_millis(2500)).await;
        let before = estimator.current().percent;
        assert!(before > 0 && before < 99);

        run.fail();
        tokio::time::sleep(Duration::from_secs(60)).await;
        let after = estimator.current();
        assert_eq!(after.state, ProgressState::Failed);
        assert_eq!(after.percent, before);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_run_stops_timer() {
        let estimator = ProgressEstimator::new(&config());
        {
            let _run = estimator.start(2);
            tokio::time::sleep(Duration::from_millis(900)).await;
        }
        let frozen = estimator.current();
        assert_eq!(frozen.state, ProgressState::Failed);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(estimator.current(), frozen);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_run_cannot_touch_new_run() {
        let estimator = ProgressEstimator::new(&config());
        let first = estimator.start(2);
        let second = estimator.start(0);
        first.complete();
        let p = estimator.current();
        assert_eq!(p.run, 2);
        assert_eq!(p.state, ProgressState::Running);
        second.fail();
    }
}
