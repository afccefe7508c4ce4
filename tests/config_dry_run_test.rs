//! The shipped sample configuration, loaded and rehearsed with simulated instruments.

use bias_sweep::app::{build_orchestrator, run_configured};
use bias_sweep::config::{RepeatConfig, Settings};
use bias_sweep::data::read_record;
use bias_sweep::SweepError;
use tempfile::tempdir;

const SAMPLE: &str = include_str!("../config/sweep.toml");

fn sample_in(dir: &std::path::Path) -> Settings {
    let mut settings = Settings::from_toml_str(SAMPLE).unwrap();
    settings.storage.local_dir = dir.to_path_buf();
    settings.sweep.settle_delay_secs = 0.0;
    settings
}

#[test]
fn sample_config_is_valid() {
    let settings = Settings::from_toml_str(SAMPLE).unwrap();
    assert_eq!(settings.bias_sources.len(), 2);
    assert_eq!(settings.bias_sources[1].voltages.values(), vec![0.0, 2.0, 4.0]);

    let params = settings.sweep_plan().params;
    assert_eq!(params.get("points"), Some("401"));
    assert_eq!(params.get("avg_mode"), Some("SWEEP"));
}

#[test]
fn sample_config_loads_from_disk() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("sweep.toml");
    std::fs::write(&path, SAMPLE).unwrap();

    let settings = Settings::load(&path).unwrap();
    assert_eq!(settings.sweep.test_name, "RFTtest");
    assert_eq!(settings.timeouts.fetch_ms, 1_200_000);
}

#[tokio::test]
async fn sample_plan_lists_every_artifact() {
    let dir = tempdir().unwrap();
    let sweep = build_orchestrator(&sample_in(dir.path()), true).await.unwrap();

    assert_eq!(sweep.combination_count(), 6);
    assert_eq!(
        sweep.planned_artifacts(),
        vec![
            "RFTtest_A0V_B0V",
            "RFTtest_A0V_B2V",
            "RFTtest_A0V_B4V",
            "RFTtest_A1V_B0V",
            "RFTtest_A1V_B2V",
            "RFTtest_A1V_B4V",
        ]
    );
}

#[tokio::test]
async fn dry_run_writes_one_csv_per_source() {
    let dir = tempdir().unwrap();
    let settings = sample_in(dir.path());
    let mut sweep = build_orchestrator(&settings, true).await.unwrap();

    let reports = run_configured(&mut sweep, &settings).await.unwrap();

    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].combinations.len(), 6);
    for label in ["A", "B"] {
        let path = dir.path().join(format!("RFTtest_{}.csv", label));
        assert!(read_record(&path).unwrap().len() >= 6);
    }
}

#[tokio::test(start_paused = true)]
async fn repeated_dry_run_produces_timestamped_runs() {
    let dir = tempdir().unwrap();
    let mut settings = sample_in(dir.path());
    settings.sweep.repeat = Some(RepeatConfig {
        interval_secs: 60.0,
        count: 2,
    });
    let mut sweep = build_orchestrator(&settings, true).await.unwrap();

    let reports = run_configured(&mut sweep, &settings).await.unwrap();

    assert_eq!(reports.len(), 2);
    assert!(reports[0].test_name.starts_with("1_"));
    assert!(reports[0].test_name.ends_with("__RFTtest"));
    assert!(reports[1].test_name.starts_with("2_"));
    assert_eq!(sweep.test_name(), "RFTtest");
}

#[test]
fn unbalanced_port_list_is_rejected() {
    let broken = SAMPLE.replace("ports = [1, 2]", "ports = [1, 1]");
    let err = Settings::from_toml_str(&broken).unwrap_err();
    assert!(matches!(err, SweepError::Configuration(_)));
}
