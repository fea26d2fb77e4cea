use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration as ChronoDuration, FixedOffset, NaiveTime, TimeZone, Utc};
use tracing::{error, info, warn};

use trendpulse_types::Window;

use crate::config::{Config, ScheduleConfig};
use crate::ingest::PlatformFetcher;
use crate::pipeline;

/// What a scheduler tick runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Ingest,
    PeriodMerge,
    GlobalMerge,
    CategoryMetrics,
}

/// The next trigger strictly after `after`, in local (offset) time.
///
/// Daily tables only: ingestion at the configured hours on the hour, period
/// merge at `merge_hours:period_minute`, global merge at
/// `merge_hours:global_minute`, metrics at `metrics_hour:00`. Missed slots
/// are never back-filled; whatever is next in wall time wins.
pub fn next_trigger(
    after: DateTime<FixedOffset>,
    schedule: &ScheduleConfig,
) -> (DateTime<FixedOffset>, Trigger) {
    let mut best: Option<(DateTime<FixedOffset>, Trigger)> = None;

    let mut consider = |at: DateTime<FixedOffset>, trigger: Trigger| {
        if at <= after {
            return;
        }
        match &best {
            Some((current, _)) if *current <= at => {}
            _ => best = Some((at, trigger)),
        }
    };

    for day_offset in 0..=1 {
        let date = after.date_naive() + ChronoDuration::days(day_offset);
        let offset = *after.offset();

        let local = |hour: u32, minute: u32| -> Option<DateTime<FixedOffset>> {
            let time = NaiveTime::from_hms_opt(hour, minute, 0)?;
            offset.from_local_datetime(&date.and_time(time)).single()
        };

        for &hour in &schedule.ingest_hours {
            if let Some(at) = local(hour, 0) {
                consider(at, Trigger::Ingest);
            }
        }
        for &hour in &schedule.merge_hours {
            if let Some(at) = local(hour, schedule.period_merge_minute) {
                consider(at, Trigger::PeriodMerge);
            }
            if let Some(at) = local(hour, schedule.global_merge_minute) {
                consider(at, Trigger::GlobalMerge);
            }
        }
        if let Some(at) = local(schedule.metrics_hour, 0) {
            consider(at, Trigger::CategoryMetrics);
        }
    }

    best.expect("schedule tables are non-empty")
}

/// In-process serialization of stage runs: two invocations of the same
/// (stage, window) must not overlap. A held key makes the tick a skip, not a
/// queue.
#[derive(Clone, Default)]
pub struct StageLocks {
    held: Arc<Mutex<HashSet<String>>>,
}

pub struct StageGuard {
    held: Arc<Mutex<HashSet<String>>>,
    key: String,
}

impl StageLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self, stage: &str, window: &Window) -> Option<StageGuard> {
        let key = format!("{}@{}", stage, window);
        let mut held = self.held.lock().expect("stage lock set poisoned");
        if held.contains(&key) {
            return None;
        }
        held.insert(key.clone());
        Some(StageGuard {
            held: self.held.clone(),
            key,
        })
    }
}

impl Drop for StageGuard {
    fn drop(&mut self) {
        let mut held = self.held.lock().expect("stage lock set poisoned");
        held.remove(&self.key);
    }
}

/// Single-process scheduler: sleeps until the next trigger, spawns the stage
/// under its (stage, window) lock, repeats. Ingestion only runs when the
/// embedding process registered platform fetchers; the merge stages and the
/// metrics recompute are self-contained.
pub struct Scheduler {
    config: Config,
    fetchers: Vec<Arc<dyn PlatformFetcher>>,
    locks: StageLocks,
}

impl Scheduler {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            fetchers: Vec::new(),
            locks: StageLocks::new(),
        }
    }

    pub fn with_fetchers(mut self, fetchers: Vec<Arc<dyn PlatformFetcher>>) -> Self {
        self.fetchers = fetchers;
        self
    }

    /// Run until `shutdown` resolves.
    pub async fn run_until(self, shutdown: impl std::future::Future<Output = ()>) {
        tokio::select! {
            _ = self.run_loop() => {}
            _ = shutdown => {
                info!("scheduler shutting down");
            }
        }
    }

    async fn run_loop(&self) {
        let offset = FixedOffset::east_opt(self.config.schedule.utc_offset_hours * 3600)
            .unwrap_or_else(|| FixedOffset::east_opt(0).unwrap());

        loop {
            let now = Utc::now().with_timezone(&offset);
            let (at, trigger) = next_trigger(now, &self.config.schedule);
            let wait = (at - now).to_std().unwrap_or_default();
            info!(trigger = ?trigger, at = %at, wait_secs = wait.as_secs(), "next trigger");
            tokio::time::sleep(wait).await;

            self.fire(trigger);
        }
    }

    fn fire(&self, trigger: Trigger) {
        let window = Window::current(self.config.schedule.utc_offset_hours);
        let config = self.config.clone();

        match trigger {
            Trigger::Ingest => {
                if self.fetchers.is_empty() {
                    warn!("ingest trigger fired but no platform fetchers are registered");
                    return;
                }
                let fetchers = self.fetchers.clone();
                tokio::spawn(async move {
                    match pipeline::run_ingest_stage(&config, &fetchers).await {
                        Ok(report) => info!(
                            run_id = %report.run_id,
                            new_items = report.new_items,
                            "scheduled ingestion finished"
                        ),
                        Err(err) => error!(error = %err, "scheduled ingestion failed"),
                    }
                });
            }
            Trigger::PeriodMerge => {
                let Some(guard) = self.locks.try_acquire("period_merge", &window) else {
                    warn!(window = %window, "period merge already running for this window, skipping tick");
                    return;
                };
                tokio::spawn(async move {
                    let _guard = guard;
                    match pipeline::run_period_stage(&config, Some(window)).await {
                        Ok(report) => info!(
                            run_id = %report.run_id,
                            kept = report.kept_items,
                            dropped = report.dropped_items,
                            "scheduled period merge finished"
                        ),
                        Err(err) => error!(error = %err, "scheduled period merge failed"),
                    }
                });
            }
            Trigger::GlobalMerge => {
                let Some(guard) = self.locks.try_acquire("global_merge", &window) else {
                    warn!(window = %window, "global merge already running for this window, skipping tick");
                    return;
                };
                tokio::spawn(async move {
                    let _guard = guard;
                    match pipeline::run_global_stage(&config, Some(window)).await {
                        Ok(report) => info!(
                            run_id = %report.run_id,
                            merged = report.merge_count,
                            created = report.new_count,
                            "scheduled global merge finished"
                        ),
                        Err(err) => error!(error = %err, "scheduled global merge failed"),
                    }
                });
            }
            Trigger::CategoryMetrics => {
                tokio::spawn(async move {
                    match tokio::task::spawn_blocking(move || pipeline::run_metrics_stage(&config))
                        .await
                    {
                        Ok(Ok(_)) => info!("scheduled metrics recompute finished"),
                        Ok(Err(err)) => error!(error = %err, "metrics recompute failed"),
                        Err(err) => error!(error = %err, "metrics task panicked"),
                    }
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trendpulse_testing::test_window;

    fn at(hour: u32, minute: u32) -> DateTime<FixedOffset> {
        let offset = FixedOffset::east_opt(8 * 3600).unwrap();
        offset
            .with_ymd_and_hms(2025, 11, 7, hour, minute, 0)
            .unwrap()
    }

    #[test]
    fn test_morning_gap_hits_next_ingest() {
        let schedule = ScheduleConfig::default();
        let (when, trigger) = next_trigger(at(9, 0), &schedule);
        assert_eq!(trigger, Trigger::Ingest);
        assert_eq!(when, at(10, 0));
    }

    #[test]
    fn test_merge_sequence_after_noon_ingest() {
        let schedule = ScheduleConfig::default();

        let (when, trigger) = next_trigger(at(12, 0), &schedule);
        assert_eq!(trigger, Trigger::PeriodMerge);
        assert_eq!(when, at(12, 15));

        let (when, trigger) = next_trigger(at(12, 15), &schedule);
        assert_eq!(trigger, Trigger::GlobalMerge);
        assert_eq!(when, at(12, 30));

        let (when, trigger) = next_trigger(at(12, 30), &schedule);
        assert_eq!(trigger, Trigger::Ingest);
        assert_eq!(when, at(14, 0));
    }

    #[test]
    fn test_late_night_wraps_to_metrics() {
        let schedule = ScheduleConfig::default();
        let (when, trigger) = next_trigger(at(22, 30), &schedule);
        assert_eq!(trigger, Trigger::CategoryMetrics);
        assert_eq!(when.time(), NaiveTime::from_hms_opt(1, 0, 0).unwrap());
        assert_eq!(when.date_naive().to_string(), "2025-11-08");
    }

    #[test]
    fn test_trigger_is_strictly_after() {
        let schedule = ScheduleConfig::default();
        // Exactly on a trigger instant: that instant must not fire again.
        let (when, _) = next_trigger(at(10, 0), &schedule);
        assert!(when > at(10, 0));
    }

    #[test]
    fn test_stage_locks_exclude_same_stage_and_window() {
        let locks = StageLocks::new();
        let window = test_window();

        let guard = locks.try_acquire("period_merge", &window);
        assert!(guard.is_some());
        assert!(locks.try_acquire("period_merge", &window).is_none());
        // A different stage for the same window is fine.
        assert!(locks.try_acquire("global_merge", &window).is_some());

        drop(guard);
        assert!(locks.try_acquire("period_merge", &window).is_some());
    }
}
