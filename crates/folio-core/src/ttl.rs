//! TTL specifications and time helpers
//!
//! Collection TTLs arrive in three forms: a duration string (`"100ms"`,
//! `"5s"`, `"2m"`, `"1h"`), a bare number of milliseconds, or a boolean
//! (`true` selects a default of five minutes). Expiry is judged against the
//! record's ttl-key timestamp: a record is expired once
//! `now - stamp > ttl`.

use crate::error::{FolioError, FolioResult};
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Default TTL selected by `ttl: true` in a collection config.
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

/// Current wall-clock time in epoch milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// TTL configuration value as accepted from collection configs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TtlSpec {
    /// `true` = default TTL, `false` = disabled
    Enabled(bool),
    /// Milliseconds
    Millis(u64),
    /// Duration string: `"100ms"`, `"5s"`, `"2m"`, `"1h"`
    Text(String),
}

impl TtlSpec {
    /// Resolve the spec to a concrete duration, or `None` when disabled.
    pub fn resolve(&self) -> FolioResult<Option<Duration>> {
        match self {
            TtlSpec::Enabled(false) => Ok(None),
            TtlSpec::Enabled(true) => Ok(Some(DEFAULT_TTL)),
            TtlSpec::Millis(ms) => Ok(Some(Duration::from_millis(*ms))),
            TtlSpec::Text(text) => parse_duration(text).map(Some),
        }
    }
}

/// Parse a `"<number><unit>"` duration string. Units: ms, s, m, h.
pub fn parse_duration(text: &str) -> FolioResult<Duration> {
    let trimmed = text.trim();
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| FolioError::config(format!("duration '{}' is missing a unit", trimmed)))?;
    let (digits, unit) = trimmed.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| FolioError::config(format!("duration '{}' has no numeric part", trimmed)))?;
    let millis = match unit {
        "ms" => value,
        "s" => value * 1_000,
        "m" => value * 60_000,
        "h" => value * 3_600_000,
        other => {
            return Err(FolioError::config(format!(
                "unknown duration unit '{}' in '{}'",
                other, trimmed
            )))
        }
    };
    Ok(Duration::from_millis(millis))
}

/// Whether a record stamped at `stamp_ms` has outlived `ttl` as of `now_ms`.
pub fn is_expired(stamp_ms: u64, ttl: Duration, now_ms: u64) -> bool {
    now_ms.saturating_sub(stamp_ms) > ttl.as_millis() as u64
}
