// src/config/validate.rs

use crate::config::model::{EngineConfig, GcSection, RawEngineConfig, ReconcileSection, RetrySection};
use crate::errors::{EngineError, Result};

impl TryFrom<RawEngineConfig> for EngineConfig {
    type Error = EngineError;

    fn try_from(raw: RawEngineConfig) -> std::result::Result<Self, Self::Error> {
        validate_config(&raw)?;
        Ok(EngineConfig::new_unchecked(raw.reconcile, raw.retry, raw.gc))
    }
}

pub fn validate_config(cfg: &RawEngineConfig) -> Result<()> {
    validate_reconcile(&cfg.reconcile)?;
    validate_retry(&cfg.retry)?;
    validate_gc(&cfg.gc)?;
    Ok(())
}

fn validate_reconcile(section: &ReconcileSection) -> Result<()> {
    if section.wait_poll_secs == 0 {
        return Err(EngineError::ConfigError(
            "[reconcile].wait_poll_secs must be >= 1 (got 0)".to_string(),
        ));
    }
    if section.redeliver_secs == 0 {
        return Err(EngineError::ConfigError(
            "[reconcile].redeliver_secs must be >= 1 (got 0)".to_string(),
        ));
    }
    Ok(())
}

fn validate_retry(section: &RetrySection) -> Result<()> {
    if section.ratio.is_nan() || section.ratio < 1.0 {
        return Err(EngineError::ConfigError(format!(
            "[retry].ratio must be >= 1.0 (got {})",
            section.ratio
        )));
    }
    if section.ceiling_secs < section.floor_secs {
        return Err(EngineError::ConfigError(format!(
            "[retry].ceiling_secs ({}) must not be below floor_secs ({})",
            section.ceiling_secs, section.floor_secs
        )));
    }
    Ok(())
}

fn validate_gc(section: &GcSection) -> Result<()> {
    let positive = [
        ("lock_ttl_secs", section.lock_ttl_secs),
        ("ensure_interval_secs", section.ensure_interval_secs),
        ("ensure_retry_secs", section.ensure_retry_secs),
        ("compensate_interval_secs", section.compensate_interval_secs),
        ("delay_ttl_secs", section.delay_ttl_secs),
        ("archive_retain_analyzed_secs", section.archive_retain_analyzed_secs),
        ("archive_retain_finished_secs", section.archive_retain_finished_secs),
    ];
    for (field, value) in positive {
        if value == 0 {
            return Err(EngineError::ConfigError(format!(
                "[gc].{field} must be >= 1 (got 0)"
            )));
        }
    }

    if section.compensate_page_size == 0 {
        return Err(EngineError::ConfigError(
            "[gc].compensate_page_size must be >= 1 (got 0)".to_string(),
        ));
    }

    let prefixes = [
        &section.resource_prefix,
        &section.database_prefix,
        &section.lock_prefix,
    ];
    if prefixes.iter().any(|p| p.is_empty()) {
        return Err(EngineError::ConfigError(
            "[gc] key prefixes must not be empty".to_string(),
        ));
    }
    for (i, a) in prefixes.iter().enumerate() {
        for b in prefixes.iter().skip(i + 1) {
            if a.starts_with(b.as_str()) || b.starts_with(a.as_str()) {
                return Err(EngineError::ConfigError(format!(
                    "[gc] key prefixes overlap: '{a}' and '{b}'"
                )));
            }
        }
    }
    Ok(())
}
