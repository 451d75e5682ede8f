//! Once-a-day rollover at local midnight.

use crate::bus::EventBus;
use crate::db::Database;
use crate::events::MidnightEvent;
use crate::summarize::{BulkReport, SummarizationManager};
use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use std::sync::Arc;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Fires once each time the local calendar date moves forward.
#[derive(Debug, Clone)]
pub struct MidnightDetector {
    timezone: Tz,
    last_date: NaiveDate,
}

impl MidnightDetector {
    pub fn new(timezone: Tz, now: DateTime<Utc>) -> Self {
        Self {
            timezone,
            last_date: now.with_timezone(&timezone).date_naive(),
        }
    }

    /// True on the first observation after local midnight. A clock that moves
    /// backwards never fires and never rewinds the remembered date.
    pub fn observe(&mut self, now: DateTime<Utc>) -> bool {
        let today = now.with_timezone(&self.timezone).date_naive();
        if today > self.last_date {
            self.last_date = today;
            true
        } else {
            false
        }
    }
}

pub struct MidnightScheduler {
    bus: EventBus,
    timezone: Tz,
    check_interval: Duration,
}

impl MidnightScheduler {
    pub fn new(bus: EventBus, timezone: Tz, check_interval: Duration) -> Self {
        Self {
            bus,
            timezone,
            check_interval,
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut detector = MidnightDetector::new(self.timezone, Utc::now());
        let mut ticker = interval(self.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(timezone = %self.timezone, "Scheduler: watching for midnight");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let now = Utc::now();
            if detector.observe(now) {
                info!(timezone = %self.timezone, "Scheduler: midnight reached");
                if let Err(e) = self.bus.publish(&MidnightEvent { triggered_at: now }) {
                    error!("Scheduler: failed to publish midnight event: {}", e);
                }
            }
        }
        info!("Scheduler: stopped");
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RolloverReport {
    /// None when the active chats could not be listed.
    pub summaries: Option<BulkReport>,
    pub counters_reset: usize,
}

/// Bulk summarization of recent activity followed by a counter reset.
pub struct MidnightRollover {
    summarizer: Arc<SummarizationManager>,
    db: Database,
    lookback: Duration,
}

impl MidnightRollover {
    pub fn new(summarizer: Arc<SummarizationManager>, db: Database, lookback: Duration) -> Self {
        Self {
            summarizer,
            db,
            lookback,
        }
    }

    pub async fn run(&self, event: &MidnightEvent) -> anyhow::Result<RolloverReport> {
        let lookback = chrono::Duration::from_std(self.lookback).unwrap_or_else(|_| chrono::Duration::hours(24));
        let since = event.triggered_at - lookback;

        let summaries = match self.summarizer.summarize_active_chats(since).await {
            Ok(report) => Some(report),
            Err(e) => {
                error!(kind = e.kind(), "Rollover: bulk summarization failed: {}", e);
                None
            }
        };

        // Counters are reset whether or not summarization went through.
        let counters_reset = self.db.run_blocking(|db| db.reset_all_counters()).await?;

        match &summaries {
            Some(report) if report.failures.is_empty() => info!(
                groups = report.groups,
                counters_reset,
                "Rollover: complete"
            ),
            Some(report) => warn!(
                groups = report.groups,
                failed = report.failures.len(),
                counters_reset,
                "Rollover: complete with failures"
            ),
            None => warn!(counters_reset, "Rollover: counters reset without summarization"),
        }

        Ok(RolloverReport {
            summaries,
            counters_reset,
        })
    }
}
