//! Daily refresh scheduler
//!
//! Fires one `Startup` refresh after a delay, then a `Scheduled` refresh every
//! day at a wall-clock time in the configured zone.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use tokio::time;

use crate::config::{Config, ConfigError};
use crate::models::{TriggerOutcome, TriggerSource};
use crate::services::orchestrator::RefreshOrchestrator;

pub struct SchedulerConfig {
    pub tz: Tz,
    pub hour: u32,
    pub minute: u32,
    /// 0 disables the startup refresh
    pub initial_delay_secs: u64,
}

impl SchedulerConfig {
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        Ok(Self {
            tz: config.scheduler_tz()?,
            hour: config.refresh_hour,
            minute: config.refresh_minute,
            initial_delay_secs: config.initial_refresh_delay_secs,
        })
    }
}

/// Resolve a local wall-clock time. Ambiguous times take the earlier
/// instant; times skipped by a DST jump move to the next valid minute.
fn resolve_local(tz: Tz, naive: NaiveDateTime) -> Option<DateTime<Tz>> {
    let mut candidate = naive;
    // A DST gap never exceeds a few hours
    for _ in 0..=240 {
        if let Some(t) = tz.from_local_datetime(&candidate).earliest() {
            return Some(t);
        }
        candidate += ChronoDuration::minutes(1);
    }
    None
}

/// First `hour:minute` in `tz` strictly after `now`
pub fn next_run_after(now: DateTime<Utc>, tz: Tz, hour: u32, minute: u32) -> DateTime<Utc> {
    let mut date = now.with_timezone(&tz).date_naive();
    for _ in 0..3 {
        if let Some(naive) = date.and_hms_opt(hour, minute, 0) {
            if let Some(local) = resolve_local(tz, naive) {
                let candidate = local.with_timezone(&Utc);
                if candidate > now {
                    return candidate;
                }
            }
        }
        match date.succ_opt() {
            Some(next) => date = next,
            None => break,
        }
    }
    now + ChronoDuration::days(1)
}

/// Run the scheduler loop. Spawn with `tokio::spawn`; never returns.
pub async fn start_scheduler(orchestrator: Arc<RefreshOrchestrator>, config: SchedulerConfig) {
    tracing::info!(
        "Starting refresh scheduler (daily at {:02}:{:02} {}, startup delay {}s)",
        config.hour,
        config.minute,
        config.tz,
        config.initial_delay_secs
    );

    if config.initial_delay_secs > 0 {
        let startup = orchestrator.clone();
        let delay = Duration::from_secs(config.initial_delay_secs);
        tokio::spawn(async move {
            time::sleep(delay).await;
            fire(&startup, TriggerSource::Startup);
        });
    }

    loop {
        let now = Utc::now();
        let next = next_run_after(now, config.tz, config.hour, config.minute);
        let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
        tracing::info!(next_run = %next.with_timezone(&config.tz), wait_secs = wait.as_secs(), "Next scheduled refresh");

        time::sleep(wait).await;
        fire(&orchestrator, TriggerSource::Scheduled);
    }
}

fn fire(orchestrator: &Arc<RefreshOrchestrator>, source: TriggerSource) {
    match orchestrator.trigger(source) {
        TriggerOutcome::Started => tracing::info!(trigger = %source, "Refresh triggered"),
        TriggerOutcome::AlreadyRunning => {
            tracing::warn!(trigger = %source, "Skipped: a refresh is already running")
        }
    }
}
