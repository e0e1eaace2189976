use std::error::Error;
use std::fs;
use std::time::Duration;

use pipengine::config::{EngineConfig, RawEngineConfig, load_and_validate};
use pipengine::errors::EngineError;

type TestResult = Result<(), Box<dyn Error>>;

fn parse(toml: &str) -> Result<EngineConfig, EngineError> {
    let raw: RawEngineConfig = toml::from_str(toml)?;
    EngineConfig::try_from(raw)
}

fn expect_config_error(toml: &str, needle: &str) {
    match parse(toml) {
        Err(EngineError::ConfigError(msg)) => {
            assert!(msg.contains(needle), "message {msg:?} lacks {needle:?}")
        }
        other => panic!("expected config error containing {needle:?}, got {other:?}"),
    }
}

#[test]
fn no_file_means_defaults() -> TestResult {
    let config = load_and_validate(None)?;
    assert_eq!(config.reconcile.wait_poll(), Duration::from_secs(5));
    assert_eq!(config.reconcile.throttler_capacity, 0);
    assert!(config.reconcile.strict_schedule);
    assert_eq!(config.retry.max_retries, 3);
    assert_eq!(config.gc.resource_ttl_success_secs, 1800);
    assert!(!config.gc.archive_analyzed);
    assert!(!config.gc.archive_finished);
    assert_eq!(config.gc.archive_retain_finished_secs, 2_592_000);
    assert!(config.gc.tracking_since.is_none());
    Ok(())
}

#[test]
fn file_sections_override_defaults() -> TestResult {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("engine.toml");
    fs::write(
        &path,
        r#"
[reconcile]
wait_poll_secs = 2
throttler_capacity = 8

[retry]
max_retries = 5
floor_secs = 1

[gc]
archive_finished = true
archive_retain_analyzed_secs = 3600
resource_ttl_failed_secs = 60
tracking_since = "2024-01-01T00:00:00Z"
"#,
    )?;

    let config = load_and_validate(Some(&path))?;
    assert_eq!(config.reconcile.wait_poll_secs, 2);
    assert_eq!(config.reconcile.throttler_capacity, 8);
    // Unset keys keep their defaults.
    assert_eq!(config.reconcile.redeliver_secs, 60);
    assert_eq!(config.retry.max_retries, 5);
    assert_eq!(config.retry.floor_secs, 1);
    assert_eq!(config.retry.ceiling_secs, 600);
    assert!(config.gc.archive_finished);
    assert!(!config.gc.archive_analyzed);
    assert_eq!(config.gc.archive_retain_analyzed_secs, 3600);
    assert_eq!(config.gc.resource_ttl_failed_secs, 60);
    assert!(config.gc.tracking_since.is_some());

    let policy = config.gc.policy();
    assert!(policy.archive_finished);
    assert!(!policy.archive_for(pipengine::model::Status::Analyzed));
    assert!(policy.archive_for(pipengine::model::Status::Failed));
    assert_eq!(policy.resource_ttl_failed_secs, 60);
    Ok(())
}

#[test]
fn zero_intervals_are_rejected() {
    expect_config_error("[reconcile]\nwait_poll_secs = 0", "wait_poll_secs");
    expect_config_error("[reconcile]\nredeliver_secs = 0", "redeliver_secs");
    expect_config_error("[gc]\nlock_ttl_secs = 0", "lock_ttl_secs");
    expect_config_error("[gc]\ncompensate_page_size = 0", "compensate_page_size");
    expect_config_error("[gc]\narchive_retain_analyzed_secs = 0", "archive_retain_analyzed_secs");
}

#[test]
fn retry_backoff_bounds_are_checked() {
    expect_config_error("[retry]\nratio = 0.5", "ratio");
    expect_config_error("[retry]\nceiling_secs = 10\nfloor_secs = 20", "ceiling_secs");
}

#[test]
fn gc_prefixes_must_not_overlap() {
    expect_config_error(
        "[gc]\nresource_prefix = \"/gc\"\ndatabase_prefix = \"/gc/db\"",
        "overlap",
    );
    expect_config_error("[gc]\nlock_prefix = \"\"", "must not be empty");
}

#[test]
fn missing_file_is_an_io_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let err = load_and_validate(Some(&dir.path().join("absent.toml"))).unwrap_err();
    assert!(matches!(err, EngineError::IoError(_)), "got {err:?}");
}
