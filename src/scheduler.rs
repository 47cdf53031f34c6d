//! Scheduler for the periodic evaluation pass.
//!
//! A polling loop rather than a long sleep until the next cron time: polling
//! every minute lets us detect sleep/wake time jumps and catch up on a run
//! that was missed while the host was suspended, as long as it is still
//! within the grace period.

use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;

use crate::config::{EngineConfig, ScheduleEntry};
use crate::db::EngineDb;
use crate::dispatch::{Dispatcher, HttpPushGateway, PushGateway};
use crate::engine::{run_pass, RunContext};
use crate::error::EngineError;
use crate::signals::{default_registry, SignalRegistry};
use crate::template::PlaceholderRenderer;

/// Grace period for a missed run (2 hours).
const MISSED_RUN_GRACE_PERIOD_SECS: i64 = 7200;

/// Time jump threshold to detect sleep/wake (5 minutes).
const TIME_JUMP_THRESHOLD_SECS: i64 = 300;

/// Poll interval for the scheduler loop (1 minute).
const POLL_INTERVAL_SECS: u64 = 60;

/// How an evaluation pass came to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunTrigger {
    Scheduled,
    Missed,
}

pub struct Scheduler {
    db: EngineDb,
    config: EngineConfig,
    push: Option<HttpPushGateway>,
    registry: SignalRegistry,
    renderer: PlaceholderRenderer,
    last_scheduled_run: Option<DateTime<Utc>>,
}

impl Scheduler {
    pub fn new(db: EngineDb, config: EngineConfig) -> Self {
        let push = config
            .push_gateway_url
            .clone()
            .map(HttpPushGateway::new);
        Self {
            db,
            config,
            push,
            registry: default_registry(),
            renderer: PlaceholderRenderer,
            last_scheduled_run: None,
        }
    }

    /// Run the scheduler loop indefinitely.
    pub async fn run(&mut self) {
        let mut last_check = Utc::now();

        loop {
            tokio::time::sleep(Duration::from_secs(POLL_INTERVAL_SECS)).await;

            let now = Utc::now();

            // Detect sleep: time jumped more than the threshold
            let time_jump = (now - last_check).num_seconds();
            if time_jump > TIME_JUMP_THRESHOLD_SECS {
                log::info!(
                    "Detected system wake (time jumped {} seconds), checking for a missed run",
                    time_jump
                );
                self.check_missed_run(now);
            }

            self.check_and_run_due(now);

            last_check = now;
        }
    }

    fn check_and_run_due(&mut self, now: DateTime<Utc>) {
        if !self.config.schedule.enabled {
            return;
        }
        match due_now(&self.config.schedule, self.last_scheduled_run, now) {
            Ok(true) => self.execute_pass(now, RunTrigger::Scheduled),
            Ok(false) => {}
            Err(e) => log::warn!("Schedule check failed: {}", e),
        }
    }

    fn check_missed_run(&mut self, now: DateTime<Utc>) {
        if !self.config.schedule.enabled {
            return;
        }
        match missed_since(&self.config.schedule, self.last_scheduled_run, now) {
            Ok(Some(missed_at)) => {
                log::info!("Found missed run (was due {}), running now", missed_at);
                self.execute_pass(now, RunTrigger::Missed);
            }
            Ok(None) => {}
            Err(e) => log::warn!("Missed-run check failed: {}", e),
        }
    }

    fn execute_pass(&mut self, now: DateTime<Utc>, trigger: RunTrigger) {
        self.last_scheduled_run = Some(now);

        let push_ref: Option<&dyn PushGateway> =
            self.push.as_ref().map(|p| p as &dyn PushGateway);
        let ctx = RunContext::new(&self.registry, &self.renderer, Dispatcher::new(push_ref));

        match run_pass(&self.db, &ctx) {
            Ok(summary) => {
                log::info!("Pass ({:?}) complete: {}", trigger, summary);
            }
            Err(EngineError::RunLockHeld) => {
                log::warn!("Skipping pass: another invocation holds the run lock");
            }
            Err(e) => {
                log::error!("Pass ({:?}) failed: {}", trigger, e);
            }
        }
    }
}

/// Parse a 5-field cron expression. The cron crate expects 6 fields (with
/// seconds), so "0" is prepended.
pub fn parse_cron(expr: &str) -> Result<Schedule, EngineError> {
    let full_expr = format!("0 {}", expr);
    full_expr.parse::<Schedule>().map_err(|e| {
        EngineError::Configuration(format!("Invalid cron expression '{}': {}", expr, e))
    })
}

fn parse_tz(entry: &ScheduleEntry) -> Result<Tz, EngineError> {
    entry
        .timezone
        .parse()
        .map_err(|_| EngineError::Configuration(format!("Invalid timezone: {}", entry.timezone)))
}

/// True when `now` falls within the firing window of the entry's cron
/// schedule and that scheduled time has not already run.
fn due_now(
    entry: &ScheduleEntry,
    last_run: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<bool, EngineError> {
    let schedule = parse_cron(&entry.cron)?;
    let tz = parse_tz(entry)?;
    let now_local = now.with_timezone(&tz);

    let mut scheduled_times = schedule.after(&(now_local - chrono::Duration::minutes(2)));
    if let Some(next_time) = scheduled_times.next() {
        let next_utc = next_time.with_timezone(&Utc);
        let diff = (now - next_utc).num_seconds().abs();

        // Within 2 minutes of the scheduled time; wider than the poll
        // interval to tolerate a late wakeup
        if diff < 120 {
            if let Some(last) = last_run {
                if (last - next_utc).num_seconds().abs() < 60 {
                    return Ok(false); // Already ran
                }
            }
            return Ok(true);
        }
    }
    Ok(false)
}

/// Most recent scheduled time inside the grace window that has not run yet.
fn missed_since(
    entry: &ScheduleEntry,
    last_run: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, EngineError> {
    let schedule = parse_cron(&entry.cron)?;
    let tz = parse_tz(entry)?;
    let now_local = now.with_timezone(&tz);
    let grace_start = now_local - chrono::Duration::seconds(MISSED_RUN_GRACE_PERIOD_SECS);

    for scheduled in schedule.after(&grace_start) {
        let scheduled_utc = scheduled.with_timezone(&Utc);
        if scheduled_utc > now {
            break;
        }
        if let Some(last) = last_run {
            if last >= scheduled_utc {
                continue; // Already ran
            }
        }
        return Ok(Some(scheduled_utc));
    }
    Ok(None)
}

/// Next scheduled run time, for the `status` subcommand.
pub fn next_run_time(entry: &ScheduleEntry) -> Result<DateTime<Utc>, EngineError> {
    let schedule = parse_cron(&entry.cron)?;
    let tz = parse_tz(entry)?;
    let next = schedule
        .upcoming(tz)
        .next()
        .ok_or_else(|| EngineError::Configuration("No upcoming scheduled time".to_string()))?;
    Ok(next.with_timezone(&Utc))
}
