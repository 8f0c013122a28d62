//! Dining philosophers workload
//!
//! Every philosopher needs all of its forks to eat. Forks are named
//! resources in one pool, locked through the context API, so a
//! philosopher never holds some forks while waiting for others.

use crate::config::DinnerConfig;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use respool_core::config::PoolConfig;
use respool_core::context;
use respool_core::domain::events::{InMemoryEventStore, spawn_recorder};
use respool_core::prelude::*;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Barrier;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How long philosophers get to sit down
const SEATING_TIMEOUT: Duration = Duration::from_secs(1);

/// Lock wait times of one philosopher
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WaitStats {
    pub count: u64,
    pub total_ms: u64,
    pub min_ms: Option<u64>,
    pub max_ms: Option<u64>,
}

impl WaitStats {
    pub fn record(&mut self, waited: Duration) {
        let ms = waited.as_millis() as u64;
        self.count += 1;
        self.total_ms += ms;
        self.min_ms = Some(self.min_ms.map_or(ms, |min| min.min(ms)));
        self.max_ms = Some(self.max_ms.map_or(ms, |max| max.max(ms)));
    }

    pub fn avg_ms(&self) -> Option<u64> {
        (self.count > 0).then(|| self.total_ms / self.count)
    }
}

/// What one philosopher achieved
#[derive(Debug, Clone, Serialize)]
pub struct PhilosopherStats {
    pub name: String,
    pub forks: Vec<String>,
    pub meals: u64,
    pub failed_attempts: u64,
    pub wait: WaitStats,
    /// Left the table in time
    pub finished: bool,
}

/// Pool state after the table closed
#[derive(Debug, Clone, Serialize)]
pub struct PoolCheck {
    pub all_unlocked: bool,
    pub active_users: usize,
    pub resources: usize,
    pub context_users: usize,
}

impl PoolCheck {
    fn of(pool: &LockManager<String>) -> Self {
        Self {
            all_unlocked: pool.is_all_unlocked(),
            active_users: pool.active_user_count(),
            resources: pool.resource_count(),
            context_users: pool.context_user_count(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.all_unlocked && self.active_users == 0 && self.resources == 0 && self.context_users == 0
    }
}

/// Outcome of a dinner
#[derive(Debug, Clone, Serialize)]
pub struct DinnerReport {
    pub philosophers: Vec<PhilosopherStats>,
    /// Lock event counts by event type
    pub events: BTreeMap<String, usize>,
    pub missed_events: u64,
    pub pool: PoolCheck,
}

impl DinnerReport {
    pub fn total_meals(&self) -> u64 {
        self.philosophers.iter().map(|p| p.meals).sum()
    }

    /// Render the report as plain text
    pub fn render_text(&self, quiet: bool) -> String {
        let mut out = String::new();
        if !quiet {
            let _ = writeln!(out, "Philosopher stats:");
            for p in &self.philosophers {
                let _ = write!(out, "{} meals = {}", p.name, p.meals);
                if let (Some(avg), Some(min), Some(max)) = (p.wait.avg_ms(), p.wait.min_ms, p.wait.max_ms) {
                    let _ = write!(
                        out,
                        ", wait time avg / min / max / total - {} / {} / {} / {}",
                        avg, min, max, p.wait.total_ms
                    );
                }
                if p.failed_attempts > 0 {
                    let _ = write!(out, ", failed attempts = {}", p.failed_attempts);
                }
                if !p.finished {
                    let _ = write!(out, " (did not leave the table)");
                }
                out.push('\n');
            }

            let _ = writeln!(out, "Lock events:");
            for (event_type, count) in &self.events {
                let _ = writeln!(out, "  {} = {}", event_type, count);
            }
        }

        let verdict = if self.pool.is_empty() {
            "pool empty"
        } else {
            "POOL NOT EMPTY"
        };
        let _ = writeln!(
            out,
            "Meals: {}, {} (held: {}, users: {}, resources: {}, context users: {})",
            self.total_meals(),
            verdict,
            !self.pool.all_unlocked,
            self.pool.active_users,
            self.pool.resources,
            self.pool.context_users
        );
        out
    }
}

/// Settings shared by all philosophers
#[derive(Debug, Clone)]
struct Etiquette {
    eat: Duration,
    eat_random_ms: u64,
    think: Duration,
    max_wait: Option<Duration>,
    ordered_start: bool,
}

impl From<&DinnerConfig> for Etiquette {
    fn from(config: &DinnerConfig) -> Self {
        Self {
            eat: Duration::from_millis(config.eat_ms),
            eat_random_ms: config.eat_random_ms,
            think: Duration::from_millis(config.think_ms),
            max_wait: config.max_wait(),
            ordered_start: config.ordered_start,
        }
    }
}

struct Philosopher {
    number: usize,
    name: String,
    forks: Vec<String>,
    rng: StdRng,
    stats: PhilosopherStats,
}

impl Philosopher {
    fn new(config: &DinnerConfig, number: usize) -> Self {
        let name = format!("P{}", number);
        let forks = config.forks_of(number);
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(number as u64)),
            None => StdRng::from_entropy(),
        };
        let stats = PhilosopherStats {
            name: name.clone(),
            forks: forks.clone(),
            meals: 0,
            failed_attempts: 0,
            wait: WaitStats::default(),
            finished: false,
        };
        Self {
            number,
            name,
            forks,
            rng,
            stats,
        }
    }

    async fn dine(
        mut self,
        pool: LockManager<String>,
        table: Arc<Barrier>,
        stop: CancellationToken,
        etiquette: Etiquette,
    ) -> PhilosopherStats {
        info!(philosopher = %self.name, forks = ?self.forks, "At table");
        tokio::select! {
            _ = table.wait() => {}
            () = stop.cancelled() => return self.stats,
        }

        let mut first_think = true;
        while !stop.is_cancelled() {
            self.think(&etiquette, &stop, first_think).await;
            first_think = false;

            let started = Instant::now();
            if !self.pick_up_forks(&pool, &etiquette, &stop).await {
                break;
            }
            self.stats.wait.record(started.elapsed());

            if self.eat(&etiquette, &stop).await {
                self.stats.meals += 1;
            }
            pool.unlock_context().await;
        }

        self.stats.finished = true;
        self.stats
    }

    /// Keep trying until the forks are ours, false if the table closed
    async fn pick_up_forks(
        &mut self,
        pool: &LockManager<String>,
        etiquette: &Etiquette,
        stop: &CancellationToken,
    ) -> bool {
        let mut failed = 0;
        loop {
            match pool
                .lock_names_with_cancel(self.forks.iter().cloned(), etiquette.max_wait, stop)
                .await
            {
                Ok(()) => {
                    if failed > 0 {
                        debug!(philosopher = %self.name, attempts = failed + 1, "Got forks");
                    }
                    return true;
                }
                Err(LockError::Timeout { waited_ms, .. }) => {
                    failed += 1;
                    self.stats.failed_attempts += 1;
                    debug!(
                        philosopher = %self.name,
                        waited_ms,
                        attempt = failed,
                        "Did not acquire forks in time"
                    );
                }
                Err(err @ LockError::ConsistencyViolation { .. }) => {
                    failed += 1;
                    self.stats.failed_attempts += 1;
                    error!(philosopher = %self.name, failed, error = %err, "Pool inconsistent");
                    pool.unlock_context().await;
                }
                Err(LockError::Cancelled { .. }) => return false,
                Err(err) => {
                    error!(philosopher = %self.name, error = %err, "Rudely removed from table");
                    return false;
                }
            }
        }
    }

    async fn think(&mut self, etiquette: &Etiquette, stop: &CancellationToken, first: bool) {
        if !etiquette.think.is_zero() {
            pause(etiquette.think, stop).await;
        }
        if first && etiquette.ordered_start {
            // Pick up the first forks one by one
            pause(Duration::from_millis(self.number as u64), stop).await;
        }
    }

    /// Eat with the forks held, false if the table closed mid-meal
    async fn eat(&mut self, etiquette: &Etiquette, stop: &CancellationToken) -> bool {
        if etiquette.eat.is_zero() {
            return !stop.is_cancelled();
        }
        let extra = if etiquette.eat_random_ms > 0 {
            self.rng.gen_range(0..etiquette.eat_random_ms)
        } else {
            0
        };
        let eat_time = etiquette.eat + Duration::from_millis(extra);
        debug!(philosopher = %self.name, eat_ms = eat_time.as_millis() as u64, "Eating");
        pause(eat_time, stop).await
    }
}

/// Sleep unless the table closes first, true if the full time passed
async fn pause(duration: Duration, stop: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        () = stop.cancelled() => false,
        () = tokio::time::sleep(duration) => true,
    }
}

/// Seat the philosophers, let them dine, and report
pub async fn run(config: &DinnerConfig, pool_config: PoolConfig) -> anyhow::Result<DinnerReport> {
    config.validate()?;
    pool_config.validate()?;

    let pool = LockManager::<String>::new(pool_config);
    let store = Arc::new(InMemoryEventStore::new());
    let recorder = spawn_recorder(Arc::clone(&store), pool.subscribe());

    let stop = CancellationToken::new();
    let table = Arc::new(Barrier::new(config.philosophers + 1));
    let etiquette = Etiquette::from(config);

    let mut seats: Vec<(PhilosopherStats, JoinHandle<PhilosopherStats>)> = Vec::new();
    for number in 1..=config.philosophers {
        let philosopher = Philosopher::new(config, number);
        let placeholder = philosopher.stats.clone();
        let name = philosopher.name.clone();
        let task = tokio::spawn(context::scope_named(
            name,
            philosopher.dine(pool.clone(), Arc::clone(&table), stop.clone(), etiquette.clone()),
        ));
        seats.push((placeholder, task));
    }

    if tokio::time::timeout(SEATING_TIMEOUT, table.wait()).await.is_err() {
        stop.cancel();
        anyhow::bail!("Missing one or more philosophers at the table");
    }
    tokio::time::sleep(Duration::from_millis(config.dining_ms)).await;
    stop.cancel();

    let grace = Duration::from_millis(500 + config.eat_ms + config.eat_random_ms + config.think_ms);
    let deadline = Instant::now() + grace;
    let mut philosophers = Vec::with_capacity(seats.len());
    for (placeholder, mut task) in seats {
        match tokio::time::timeout_at(deadline, &mut task).await {
            Ok(Ok(stats)) => philosophers.push(stats),
            Ok(Err(err)) => {
                error!(philosopher = %placeholder.name, error = %err, "Philosopher task failed");
                philosophers.push(placeholder);
            }
            Err(_) => {
                warn!(philosopher = %placeholder.name, "Philosopher did not leave the table");
                task.abort();
                philosophers.push(placeholder);
            }
        }
    }

    let check = PoolCheck::of(&pool);
    if !check.all_unlocked {
        warn!("One or more philosophers lost a fork");
    }
    if check.active_users > 0 {
        warn!(users = check.active_users, "One or more philosophers were not removed from the pool");
    }
    if check.context_users > 0 {
        warn!(users = check.context_users, "One or more context-bound philosophers were not removed from the pool");
    }

    drop(pool);
    let missed_events = match tokio::time::timeout(Duration::from_secs(1), recorder).await {
        Ok(Ok(missed)) => missed,
        _ => {
            warn!("Event recorder did not finish, event counts may be incomplete");
            0
        }
    };

    Ok(DinnerReport {
        philosophers,
        events: store.counts_by_type(),
        missed_events,
        pool: check,
    })
}
