//! Repeating a full sweep at a fixed interval.
//!
//! Each repetition gets its own base name, `{i}_{timestamp}__{test_name}`, so
//! the CSVs and result files of successive runs never overwrite each other.

use crate::error::AppResult;
use crate::sweep::orchestrator::{wait_with_progress, SweepOrchestrator, SweepReport};
use chrono::{Local, NaiveDateTime};
use std::time::Duration;
use tracing::info;

/// Timestamp layout used in repetition names, e.g. `07_Mar_2024__14_05_09`.
pub const REPEAT_TIMESTAMP_FORMAT: &str = "%d_%b_%Y__%H_%M_%S";

/// Base name of repetition `index` (1-based) started at `at`.
pub fn repeat_name(index: u32, at: NaiveDateTime, base: &str) -> String {
    format!("{}_{}__{}", index, at.format(REPEAT_TIMESTAMP_FORMAT), base)
}

fn hms(duration: Duration) -> String {
    let secs = duration.as_secs();
    format!(
        "{} hours, {} minutes, and {} seconds",
        secs / 3600,
        (secs % 3600) / 60,
        secs % 60
    )
}

/// Runs the sweep `count` times, waiting `interval` after each run but the
/// last.
///
/// The orchestrator's base name is restored afterwards, also when a run
/// fails. The first failure stops the series.
pub async fn run_repeated(
    orchestrator: &mut SweepOrchestrator,
    interval: Duration,
    count: u32,
) -> AppResult<Vec<SweepReport>> {
    let base = orchestrator.test_name().to_string();
    let total = interval * count;
    let finish = Local::now() + chrono::Duration::from_std(total).unwrap_or_else(|_| chrono::Duration::zero());
    info!(
        "Performing {} measurements over {}. Estimated completion after: {}",
        count,
        hms(total),
        finish.format("%c")
    );

    let result = run_series(orchestrator, &base, interval, count).await;
    orchestrator.set_test_name(base);
    result
}

async fn run_series(
    orchestrator: &mut SweepOrchestrator,
    base: &str,
    interval: Duration,
    count: u32,
) -> AppResult<Vec<SweepReport>> {
    let mut reports = Vec::new();
    for i in 1..=count {
        let name = repeat_name(i, Local::now().naive_local(), base);
        info!(run = i, test = %name, "Starting measurement");
        orchestrator.set_test_name(name);
        reports.push(orchestrator.run().await?);
        info!(run = i, "Measurement complete");

        if i < count {
            info!("Waiting for {}", hms(interval));
            wait_with_progress(interval, orchestrator.plan().progress_interval, "interval").await;
        }
    }
    Ok(reports)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::{EventLog, MockAnalyzer, MockBiasSource};
    use crate::sweep::SweepPlan;
    use chrono::NaiveDate;
    use tempfile::tempdir;

    #[test]
    fn names_follow_timestamp_layout() {
        let at = NaiveDate::from_ymd_opt(2024, 3, 7)
            .and_then(|d| d.and_hms_opt(14, 5, 9))
            .unwrap();
        assert_eq!(repeat_name(2, at, "RFTtest"), "2_07_Mar_2024__14_05_09__RFTtest");
    }

    #[test]
    fn hms_splits_seconds() {
        assert_eq!(
            hms(Duration::from_secs(3725)),
            "1 hours, 2 minutes, and 5 seconds"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn repeats_and_restores_base_name() {
        let dir = tempdir().unwrap();
        let log = EventLog::new();
        let mut sweep = SweepOrchestrator::new(
            SweepPlan::new("drift", dir.path()),
            Box::new(MockAnalyzer::new(log.clone())),
        )
        .with_source(Box::new(MockBiasSource::new("A", log.clone())), vec![1.0]);

        let start = tokio::time::Instant::now();
        let reports = run_repeated(&mut sweep, Duration::from_secs(60), 3)
            .await
            .unwrap();

        assert_eq!(reports.len(), 3);
        assert!(start.elapsed() >= Duration::from_secs(120));
        assert!(start.elapsed() < Duration::from_secs(180));
        for (i, report) in reports.iter().enumerate() {
            assert!(report.test_name.starts_with(&format!("{}_", i + 1)));
            assert!(report.test_name.ends_with("__drift"));
        }
        assert_eq!(sweep.test_name(), "drift");
        assert_eq!(log.matching("analyzer:measure").len(), 3);
    }

    #[tokio::test]
    async fn failure_stops_series_and_restores_name() {
        let dir = tempdir().unwrap();
        let log = EventLog::new();
        let mut sweep = SweepOrchestrator::new(
            SweepPlan::new("drift", dir.path()),
            Box::new(MockAnalyzer::new(log.clone()).fail_on_measure(2)),
        )
        .with_source(Box::new(MockBiasSource::new("A", log.clone())), vec![1.0]);

        assert!(run_repeated(&mut sweep, Duration::ZERO, 3).await.is_err());
        assert_eq!(sweep.test_name(), "drift");
        assert_eq!(log.matching("analyzer:measure").len(), 2);
    }
}
