//! Sweep orchestration.
//!
//! [`SweepOrchestrator::run_sweep`] is the single entry point that ties the
//! pieces together:
//!
//! ```text
//! spec + RunOptions
//!      │
//!      ▼
//! full_hash in sweep cache? ──yes──► cached ResultGrid
//!      │ no
//!      ▼
//! CoordinateGrid ─► cells ─► JobCache::submit ─► ResultGrid::set
//!      │
//!      ▼
//! over_time? ─► concat with history ─► history cache
//!      │
//!      ▼
//! sweep cache ◄── ResultGrid
//! ```

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::cache::CacheHandle;
use crate::config::{ExecutorConfig, RunOptions};
use crate::coordinator::{CoordinateGrid, GridCell, SweepCoordinator, SweepSpecification, OVER_TIME_DIM};
use crate::error::{SweepError, SweepResult};
use crate::grid::ResultGrid;
use crate::hash::{Digest, HashFold};
use crate::jobs::{Job, JobCache, JobFuture, RunStats};
use crate::worker::{Record, Worker};

/// Result of one [`SweepOrchestrator::run_sweep`] call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepOutcome {
    /// The filled result grid (the accumulated history for over-time runs).
    pub grid: ResultGrid,
    /// Job counters of this run. All zero when served from the sweep cache.
    pub stats: RunStats,
    /// Specification hash including repeats; keys the sweep and history caches.
    pub full_hash: Digest,
    /// Specification hash excluding repeats.
    pub sample_hash: Digest,
    /// Whether the grid came from the sweep cache without running any cell.
    pub from_sweep_cache: bool,
}

/// Runs sweeps against the caches of one [`CacheHandle`].
#[derive(Debug)]
pub struct SweepOrchestrator {
    handle: CacheHandle,
}

impl SweepOrchestrator {
    pub const fn new(handle: CacheHandle) -> Self {
        Self { handle }
    }

    pub const fn handle(&self) -> &CacheHandle {
        &self.handle
    }

    /// Runs `spec` with `worker` under `options`.
    ///
    /// A worker failure aborts the run with [`SweepError::Job`] naming the
    /// failing coordinate. Cells that completed before the failure remain in
    /// the sample cache, so a re-run only computes the rest.
    pub fn run_sweep(
        &self,
        spec: &SweepSpecification,
        worker: Arc<dyn Worker>,
        options: &RunOptions,
    ) -> SweepResult<SweepOutcome> {
        self.run_sweep_at(spec, worker, options, SweepCoordinator::new())
    }

    /// Like [`run_sweep`](Self::run_sweep) with an explicit coordinator,
    /// which fixes the time stamp of over-time runs.
    pub fn run_sweep_at(
        &self,
        spec: &SweepSpecification,
        worker: Arc<dyn Worker>,
        options: &RunOptions,
        coordinator: SweepCoordinator,
    ) -> SweepResult<SweepOutcome> {
        options.validate()?;
        let spec = apply_options(spec, options)?;
        let full_hash = spec.hash(true)?;
        let sample_hash = spec.hash(false)?;
        let key = full_hash.to_hex();

        tracing::info!(
            bench = spec.bench_name(),
            title = %spec.title(),
            hash = %full_hash,
            "Running sweep"
        );

        if (options.use_cache || options.only_plot) && !options.clear_cache {
            if let Some(grid) = self.handle.sweep_cache().get(&key)? {
                tracing::info!(hash = %full_hash, "Sweep cache hit");
                return Ok(SweepOutcome {
                    grid,
                    stats: RunStats::default(),
                    full_hash,
                    sample_hash,
                    from_sweep_cache: true,
                });
            }
        }
        if options.only_plot {
            return Err(SweepError::CacheMissRequired { hash: key });
        }

        let session = self.handle.session(spec.bench_name())?;
        if options.clear_sample_cache {
            let evicted = session.sample_cache().clear_tag(spec.tag())?;
            tracing::info!(tag = spec.tag(), evicted, "Cleared sample cache");
        }

        let coords = coordinator.build_grid(&spec)?;
        let mut grid = ResultGrid::allocate(&coords, spec.result_vars());

        let store = options
            .cache_samples
            .then(|| Arc::clone(session.sample_cache()));
        let jobs = JobCache::new(store, options.executor, options.overwrite_sample_cache)?;
        let isolate = options.isolate_samples.then_some(sample_hash);

        let mut run = CellRun {
            spec: &spec,
            coords: &coords,
            grid: &mut grid,
            jobs: &jobs,
            worker: &worker,
            isolate,
        };
        let filled = match options.executor {
            ExecutorConfig::Serial => run.serial(),
            ExecutorConfig::Parallel { .. } => run.parallel(),
        };
        let stats = jobs.stats();
        drop(jobs);
        filled?;

        tracing::info!(
            cells = coords.total_cells(),
            hits = stats.cache_hits,
            invocations = stats.worker_invocations,
            "Sweep complete"
        );

        if spec.over_time() {
            grid = self.accumulate_history(&key, spec.tag(), grid, options.clear_history)?;
        }

        self.handle.sweep_cache().put(&key, spec.tag(), grid.clone())?;

        Ok(SweepOutcome {
            grid,
            stats,
            full_hash,
            sample_hash,
            from_sweep_cache: false,
        })
    }

    fn accumulate_history(
        &self,
        key: &str,
        tag: &str,
        grid: ResultGrid,
        clear_history: bool,
    ) -> SweepResult<ResultGrid> {
        let history = self.handle.history();
        let prior = if clear_history {
            history.remove(key)?;
            None
        } else {
            history.get(key)?
        };

        let merged = match prior {
            Some(prior) => match prior.concat(&grid, OVER_TIME_DIM) {
                Ok(merged) => merged,
                Err(err) => {
                    tracing::warn!(error = %err, "Discarding incompatible history");
                    grid
                }
            },
            None => grid,
        };
        tracing::debug!(
            snapshots = merged.coords(OVER_TIME_DIM).map_or(0, <[_]>::len),
            "Updated history"
        );
        history.put(key, tag, merged.clone())?;
        Ok(merged)
    }
}

/// Copy of `spec` with the run options applied.
fn apply_options(spec: &SweepSpecification, options: &RunOptions) -> SweepResult<SweepSpecification> {
    let mut spec = match options.level {
        Some(level) => spec.with_level(level)?,
        None => spec.clone(),
    };
    if let Some(repeats) = options.repeats {
        spec = spec.with_repeats(repeats);
    }
    if options.over_time {
        spec = spec.with_over_time(true);
    }
    if options.time_event.is_some() {
        spec = spec.with_time_event(options.time_event.clone());
    }
    Ok(spec)
}

/// Sample-cache key of one cell input.
#[must_use]
pub fn cell_cache_key(input: &Record, tag: &str, isolate: Option<Digest>) -> Digest {
    let fold = HashFold::new().with(input).with(tag);
    match isolate {
        Some(sample_hash) => fold.with(&sample_hash).finish(),
        None => fold.finish(),
    }
}

/// Evaluation of every cell of one grid.
struct CellRun<'a> {
    spec: &'a SweepSpecification,
    coords: &'a CoordinateGrid,
    grid: &'a mut ResultGrid,
    jobs: &'a JobCache,
    worker: &'a Arc<dyn Worker>,
    isolate: Option<Digest>,
}

impl CellRun<'_> {
    fn submit(&self, id: usize, cell: &GridCell) -> JobFuture {
        self.jobs.submit(Job {
            id,
            worker: Arc::clone(self.worker),
            cache_key: cell_cache_key(&cell.input, self.spec.tag(), self.isolate),
            input: cell.input.clone(),
            tag: self.spec.tag().to_string(),
        })
    }

    /// Submits and awaits one cell at a time, stopping at the first failure.
    fn serial(&mut self) -> SweepResult<()> {
        let coords = self.coords;
        for (id, cell) in coords.cells().enumerate() {
            let future = self.submit(id, &cell);
            self.store(&cell.index, future)?;
        }
        Ok(())
    }

    /// Submits every cell, then drains the futures in coordinate order.
    fn parallel(&mut self) -> SweepResult<()> {
        let coords = self.coords;
        let pending: Vec<(Vec<usize>, JobFuture)> = coords
            .cells()
            .enumerate()
            .map(|(id, cell)| {
                let future = self.submit(id, &cell);
                (cell.index, future)
            })
            .collect();
        for (index, future) in pending {
            self.store(&index, future)?;
        }
        Ok(())
    }

    fn store(&mut self, index: &[usize], future: JobFuture) -> SweepResult<()> {
        let output = future.result().map_err(|source| SweepError::Job {
            coordinate: self.coords.coordinate_label(index),
            source,
        })?;

        for rv in self.spec.result_vars() {
            let value = output.get(rv.name()).ok_or_else(|| SweepError::MissingResult {
                name: rv.name().to_string(),
                coordinate: self.coords.coordinate_label(index),
            })?;
            self.grid.set(rv.name(), index, value)?;
        }
        Ok(())
    }
}
