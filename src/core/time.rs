//! Wall-clock capability and date formatting for conflict copies.
//!
//! Wall time here is attribution only (conflict arbitration, conflict-copy
//! dates). It is never used for ordering revisions.

use std::sync::Arc;

use time::format_description::FormatItem;
use time::macros::format_description;
use time::OffsetDateTime;

/// Injected clock so tests can pin time.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// System clock; the default for real folders.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

/// Fixed clock for tests.
#[derive(Clone, Copy, Debug)]
pub struct FixedClock(pub u64);

impl Clock for FixedClock {
    fn now_ms(&self) -> u64 {
        self.0
    }
}

pub fn system_clock() -> Arc<dyn Clock> {
    Arc::new(SystemClock)
}

const DATE_FORMAT: &[FormatItem<'static>] = format_description!("[year]-[month]-[day]");

/// Render epoch milliseconds as the `YYYY-MM-DD` used in conflict-copy names.
pub fn format_conflict_date(epoch_ms: u64) -> String {
    let secs = (epoch_ms / 1000) as i64;
    OffsetDateTime::from_unix_timestamp(secs)
        .ok()
        .and_then(|dt| dt.format(&DATE_FORMAT).ok())
        .unwrap_or_else(|| "1970-01-01".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_epoch_date() {
        assert_eq!(format_conflict_date(0), "1970-01-01");
        // 2016-03-14 00:00:00 UTC
        assert_eq!(format_conflict_date(1_457_913_600_000), "2016-03-14");
    }

    #[test]
    fn fixed_clock_is_fixed() {
        let c = FixedClock(42);
        assert_eq!(c.now_ms(), 42);
        assert_eq!(c.now_ms(), 42);
    }
}
