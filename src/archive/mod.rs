//! Periodic archival of dimension aggregates.
//!
//! Every dimension runs its own loop: compute the next interval boundary
//! aligned to the Unix epoch, sleep until it, snapshot every entity of the
//! dimension, write each snapshot to the warehouse, repeat. The wait is
//! recomputed from the wall clock on every cycle so sleeps never accumulate
//! drift, and a boundary is never archived twice by the same loop.
//!
//! Failures stay inside one cycle of one dimension: a failed query skips the
//! cycle, a failed write is counted and the remaining entities are still
//! written.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::export::health::HealthMetrics;
use crate::hub::{QueryError, StatsHub};
use crate::store::AggregationStore;
use crate::warehouse::{Snapshot, Warehouse};

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Source of wall-clock time for boundary alignment.
pub trait WallClock: Send + Sync + 'static {
    fn now(&self) -> SystemTime;
}

/// The system wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl WallClock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Rounds `t` down to a multiple of `interval` since the Unix epoch.
///
/// Times before the epoch clamp to the epoch. A zero interval returns `t`.
pub fn truncate(t: SystemTime, interval: Duration) -> SystemTime {
    let step = interval.as_nanos();
    if step == 0 {
        return t;
    }

    let since = t.duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos();
    let aligned = since - since % step;

    UNIX_EPOCH
        + Duration::new(
            (aligned / NANOS_PER_SEC) as u64,
            (aligned % NANOS_PER_SEC) as u32,
        )
}

/// First boundary strictly after `t`.
pub fn next_boundary(t: SystemTime, interval: Duration) -> SystemTime {
    truncate(t, interval) + interval
}

/// A dimension and how often it is archived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DimensionSchedule {
    pub name: String,
    pub interval: Duration,
}

impl DimensionSchedule {
    pub fn new(name: &str, interval: Duration) -> Self {
        Self {
            name: name.to_string(),
            interval,
        }
    }
}

/// How a cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Every entity was written.
    Ok,
    /// Some writes failed.
    Partial,
    /// Nothing was written: the query failed or every write failed.
    Failed,
}

impl CycleOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Partial => "partial",
            Self::Failed => "failed",
        }
    }
}

/// Summary of one archive cycle for one dimension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub dimension: String,
    pub boundary: SystemTime,
    pub entities: usize,
    pub written: usize,
    pub failed: usize,
}

impl CycleReport {
    pub fn outcome(&self) -> CycleOutcome {
        if self.failed == 0 {
            CycleOutcome::Ok
        } else if self.written == 0 {
            CycleOutcome::Failed
        } else {
            CycleOutcome::Partial
        }
    }
}

/// Runs one archive cycle: snapshots every entity of `dimension` at `boundary`.
///
/// Each entity is written independently. Write failures are logged and
/// counted in the report. A query failure aborts the cycle with an error.
pub async fn archive_once<S, W>(
    hub: &StatsHub<S>,
    warehouse: &W,
    dimension: &str,
    boundary: SystemTime,
) -> Result<CycleReport, QueryError>
where
    S: AggregationStore,
    W: Warehouse,
{
    let mut dims = hub.query_dims(&[dimension]).await?;
    let entities = dims.remove(dimension).unwrap_or_default();

    let mut report = CycleReport {
        dimension: dimension.to_string(),
        boundary,
        entities: entities.len(),
        written: 0,
        failed: 0,
    };

    for (entity, stats) in entities {
        let snapshot = Snapshot {
            dimension: dimension.to_string(),
            entity,
            stats,
            boundary,
        };

        match warehouse.write(&snapshot).await {
            Ok(()) => {
                report.written += 1;
                debug!(dimension, entity = %snapshot.entity, "snapshot written");
            }
            Err(e) => {
                report.failed += 1;
                warn!(
                    dimension,
                    entity = %snapshot.entity,
                    warehouse = warehouse.name(),
                    error = %format!("{e:#}"),
                    "writing snapshot",
                );
            }
        }
    }

    Ok(report)
}

/// Schedules archive cycles for a set of dimensions.
pub struct Archiver<S, W, C = SystemClock> {
    hub: StatsHub<S>,
    warehouse: Arc<W>,
    clock: Arc<C>,
    schedules: Vec<DimensionSchedule>,
    health: Option<Arc<HealthMetrics>>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl<S, W> Archiver<S, W, SystemClock>
where
    S: AggregationStore + 'static,
    W: Warehouse + 'static,
{
    /// Creates an archiver using the system clock.
    pub fn new(
        hub: StatsHub<S>,
        warehouse: Arc<W>,
        schedules: Vec<DimensionSchedule>,
    ) -> Result<Self> {
        if schedules.is_empty() {
            bail!("archiver needs at least one dimension");
        }
        for (idx, schedule) in schedules.iter().enumerate() {
            if schedule.interval.is_zero() {
                bail!("archive interval for {} must be positive", schedule.name);
            }
            if schedules[..idx].iter().any(|s| s.name == schedule.name) {
                bail!("dimension {} scheduled twice", schedule.name);
            }
        }

        Ok(Self {
            hub,
            warehouse,
            clock: Arc::new(SystemClock),
            schedules,
            health: None,
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
        })
    }
}

impl<S, W, C> Archiver<S, W, C>
where
    S: AggregationStore + 'static,
    W: Warehouse + 'static,
    C: WallClock,
{
    /// Replaces the wall clock used for boundary alignment.
    pub fn with_clock<C2: WallClock>(self, clock: C2) -> Archiver<S, W, C2> {
        Archiver {
            hub: self.hub,
            warehouse: self.warehouse,
            clock: Arc::new(clock),
            schedules: self.schedules,
            health: self.health,
            cancel: self.cancel,
            tasks: self.tasks,
        }
    }

    /// Records cycle outcomes in the given metrics.
    pub fn with_health(mut self, health: Arc<HealthMetrics>) -> Self {
        self.health = Some(health);
        self
    }

    /// Configured schedules.
    pub fn schedules(&self) -> &[DimensionSchedule] {
        &self.schedules
    }

    /// Spawns one loop per dimension. Calling it again is a no-op.
    pub fn start(&mut self) {
        if !self.tasks.is_empty() {
            return;
        }

        for schedule in &self.schedules {
            let task = DimensionTask {
                hub: self.hub.clone(),
                warehouse: Arc::clone(&self.warehouse),
                clock: Arc::clone(&self.clock),
                schedule: schedule.clone(),
                health: self.health.clone(),
            };

            info!(
                dimension = %schedule.name,
                interval = ?schedule.interval,
                "archiver started",
            );

            self.tasks.push(tokio::spawn(task.run(self.cancel.child_token())));
        }
    }

    /// Stops scheduling new cycles and waits for in-flight cycles to finish.
    pub async fn stop(&mut self) {
        self.cancel.cancel();

        for handle in self.tasks.drain(..) {
            if let Err(e) = handle.await {
                error!(error = %e, "archiver task failed");
            }
        }
    }
}

struct DimensionTask<S, W, C> {
    hub: StatsHub<S>,
    warehouse: Arc<W>,
    clock: Arc<C>,
    schedule: DimensionSchedule,
    health: Option<Arc<HealthMetrics>>,
}

impl<S, W, C> DimensionTask<S, W, C>
where
    S: AggregationStore,
    W: Warehouse,
    C: WallClock,
{
    async fn run(self, cancel: CancellationToken) {
        let interval = self.schedule.interval;
        let mut last_boundary: Option<SystemTime> = None;

        loop {
            let now = self.clock.now();
            let mut boundary = next_boundary(now, interval);
            if let Some(last) = last_boundary {
                if boundary <= last {
                    boundary = last + interval;
                }
            }
            let wait = boundary.duration_since(now).unwrap_or_default();

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }

            self.fire(boundary).await;
            last_boundary = Some(boundary);
        }

        debug!(dimension = %self.schedule.name, "archiver stopped");
    }

    async fn fire(&self, boundary: SystemTime) {
        let dimension = self.schedule.name.as_str();
        let started = Instant::now();

        let outcome = match archive_once(&self.hub, self.warehouse.as_ref(), dimension, boundary).await
        {
            Ok(report) => {
                let outcome = report.outcome();
                let at = DateTime::<Utc>::from(boundary);
                match outcome {
                    CycleOutcome::Ok => info!(
                        dimension,
                        boundary = %at,
                        entities = report.entities,
                        "archived dimension",
                    ),
                    CycleOutcome::Partial => warn!(
                        dimension,
                        boundary = %at,
                        entities = report.entities,
                        written = report.written,
                        failed = report.failed,
                        "archived dimension with failed writes",
                    ),
                    CycleOutcome::Failed => error!(
                        dimension,
                        boundary = %at,
                        entities = report.entities,
                        "archiving dimension: every write failed",
                    ),
                }

                if let Some(health) = &self.health {
                    health
                        .snapshots_written_total
                        .with_label_values(&[dimension])
                        .inc_by(report.written as f64);
                    health
                        .snapshot_write_errors_total
                        .with_label_values(&[dimension])
                        .inc_by(report.failed as f64);
                }

                outcome
            }
            Err(e) => {
                error!(dimension, error = %e, "querying dimension for archive, skipping cycle");
                CycleOutcome::Failed
            }
        };

        if let Some(health) = &self.health {
            health
                .archive_cycles_total
                .with_label_values(&[dimension, outcome.as_str()])
                .inc();
            health
                .archive_cycle_duration
                .with_label_values(&[dimension])
                .observe(started.elapsed().as_secs_f64());
        }
    }
}
