//! Trigger scheduling for ReplicationSources
//!
//! Decides whether a sync is due and when the next one should start. All
//! functions take `now` explicitly; nothing here reads the clock.
//!
//! A source syncs on its cron schedule, once per change of its manual trigger
//! token, or continuously when it has neither. A sync is expected to finish
//! before the schedule's following boundary; finishing after the one after
//! that means a whole interval was skipped.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;
use kube::ResourceExt;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use scribe_common::crd::{ReplicationSource, ReplicationSourceStatus};
use scribe_common::metrics::SyncMetrics;
use scribe_common::error::UNKNOWN_CONTEXT;
use scribe_common::Error;

// =============================================================================
// Metrics seam
// =============================================================================

/// Sink for the per-object sync health metrics
#[cfg_attr(test, automock)]
pub trait SyncRecorder: Send + Sync {
    /// Raise (true) or clear (false) the out-of-sync flag
    fn set_out_of_sync(&self, out_of_sync: bool);

    /// Count one skipped sync interval
    fn inc_missed_intervals(&self);

    /// Record the duration of a completed sync
    fn observe_sync_duration(&self, seconds: f64);
}

impl SyncRecorder for SyncMetrics {
    fn set_out_of_sync(&self, out_of_sync: bool) {
        SyncMetrics::set_out_of_sync(self, out_of_sync)
    }

    fn inc_missed_intervals(&self) {
        SyncMetrics::inc_missed_intervals(self)
    }

    fn observe_sync_duration(&self, seconds: f64) {
        SyncMetrics::observe_sync_duration(self, seconds)
    }
}

// =============================================================================
// Schedule arithmetic
// =============================================================================

const WEEKDAYS: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];

fn invalid_schedule(expr: &str, reason: impl std::fmt::Display) -> Error {
    Error::configuration_for_field(
        UNKNOWN_CONTEXT,
        "spec.trigger.schedule",
        format!("invalid schedule {:?}: {}", expr, reason),
    )
}

/// A day-of-week value: 0-7 with Sunday as 0 or 7, or a three-letter name
fn weekday_value(token: &str) -> Option<usize> {
    match token.parse::<usize>() {
        Ok(n) => (n <= 7).then_some(n),
        Err(_) => WEEKDAYS
            .iter()
            .position(|day| day.eq_ignore_ascii_case(token)),
    }
}

/// Rewrite a standard day-of-week field as weekday names.
///
/// The parser numbers days 1-7 from Sunday, while cron schedules number
/// them 0-6 (7 also meaning Sunday). Names mean the same to both.
fn day_of_week_field(field: &str) -> Option<String> {
    if field == "*" || field == "?" {
        return Some(field.to_string());
    }

    let mut days = [false; 7];
    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => (range, step.parse::<usize>().ok().filter(|s| *s > 0)?),
            None => (part, 1),
        };
        let (first, last) = match range.split_once('-') {
            _ if range == "*" => (0, 6),
            Some((first, last)) => (weekday_value(first)?, weekday_value(last)?),
            None if step > 1 => (weekday_value(range)?, 6),
            None => {
                let day = weekday_value(range)?;
                (day, day)
            }
        };
        if first > last {
            return None;
        }
        for day in (first..=last).step_by(step) {
            days[day % 7] = true;
        }
    }

    let names: Vec<&str> = WEEKDAYS
        .iter()
        .zip(days)
        .filter_map(|(name, set)| set.then_some(*name))
        .collect();
    Some(names.join(","))
}

/// Parse a cron expression.
///
/// Accepts the five-field form (`minute hour day-of-month month day-of-week`)
/// and descriptors such as `@hourly`. Sub-minute precision is not offered, so
/// the seconds field the parser expects is pinned to zero.
pub fn parse_schedule(expr: &str) -> Result<Schedule, Error> {
    let trimmed = expr.trim();
    let normalized = if trimmed.starts_with('@') {
        trimmed.to_string()
    } else {
        let fields: Vec<&str> = trimmed.split_whitespace().collect();
        let [minute, hour, day_of_month, month, day_of_week] = fields[..] else {
            return Err(invalid_schedule(expr, "expected 5 fields or a @descriptor"));
        };
        let day_of_week = day_of_week_field(day_of_week)
            .ok_or_else(|| invalid_schedule(expr, "invalid day-of-week field"))?;
        format!(
            "0 {} {} {} {} {}",
            minute, hour, day_of_month, month, day_of_week
        )
    };

    Schedule::from_str(&normalized).map_err(|e| invalid_schedule(expr, e))
}

/// When the next sync is due.
///
/// `None` without a schedule. Without a previous sync the answer is `now`.
/// Otherwise the first occurrence strictly after `last_sync`.
pub fn compute_next_sync(
    schedule: Option<&Schedule>,
    last_sync: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let schedule = schedule?;
    match last_sync {
        None => Some(now),
        Some(last) => schedule.after(&last).next(),
    }
}

/// Whether `now` has reached the second occurrence after `last_completed`.
///
/// The first occurrence is when the next sync starts; it must finish before
/// the second.
pub fn is_past_deadline(
    schedule: &Schedule,
    last_completed: DateTime<Utc>,
    now: DateTime<Utc>,
) -> bool {
    let mut upcoming = schedule.after(&last_completed);
    match (upcoming.next(), upcoming.next()) {
        (Some(_), Some(deadline)) => now >= deadline,
        _ => false,
    }
}

fn effective_schedule(source: &ReplicationSource) -> Result<Option<Schedule>, Error> {
    source
        .spec
        .effective_schedule()
        .map(|expr| parse_schedule(expr).map_err(|e| e.with_source_name(source.name_any())))
        .transpose()
}

/// Recompute `nextSyncTime` and raise the out-of-sync flag when warranted
fn update_next_sync(
    source: &ReplicationSource,
    status: &mut ReplicationSourceStatus,
    metrics: &dyn SyncRecorder,
    now: DateTime<Utc>,
) -> Result<(), Error> {
    let schedule = effective_schedule(source)?;

    match status.last_sync_time {
        None => metrics.set_out_of_sync(true),
        Some(last) => {
            if schedule
                .as_ref()
                .is_some_and(|s| is_past_deadline(s, last, now))
            {
                metrics.set_out_of_sync(true);
            }
        }
    }

    status.next_sync_time = compute_next_sync(schedule.as_ref(), status.last_sync_time, now);
    Ok(())
}

// =============================================================================
// Pipeline-facing operations
// =============================================================================

/// Whether a sync should start now.
///
/// Always refreshes `status.nextSyncTime` first. A manual token that the last
/// completed sync already satisfied blocks syncing regardless of schedule.
pub fn should_sync_now(
    source: &ReplicationSource,
    status: &mut ReplicationSourceStatus,
    metrics: &dyn SyncRecorder,
    now: DateTime<Utc>,
) -> Result<bool, Error> {
    update_next_sync(source, status, metrics, now)?;

    if let Some(token) = source.spec.manual_token() {
        if status.last_manual_sync.as_deref() == Some(token) {
            debug!(token, "manual trigger already satisfied");
            return Ok(false);
        }
    }

    match status.next_sync_time {
        Some(next) if next > now => {
            debug!(next = %next, "sync not yet due");
            Ok(false)
        }
        _ => Ok(true),
    }
}

/// Bookkeeping once a sync has completed.
///
/// A completion past the deadline counts a missed interval but leaves the
/// out-of-sync flag as it was; any other completion clears the flag.
pub fn record_sync_completed(
    source: &ReplicationSource,
    status: &mut ReplicationSourceStatus,
    metrics: &dyn SyncRecorder,
    now: DateTime<Utc>,
) -> Result<(), Error> {
    let schedule = effective_schedule(source)?;

    match (schedule.as_ref(), status.last_sync_time) {
        (Some(schedule), Some(previous)) if is_past_deadline(schedule, previous, now) => {
            metrics.inc_missed_intervals();
        }
        _ => metrics.set_out_of_sync(false),
    }

    status.last_sync_time = Some(now);
    status.last_manual_sync = source.spec.manual_token().map(str::to_string);

    update_next_sync(source, status, metrics, now)
}
