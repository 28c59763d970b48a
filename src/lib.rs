//! # sweepbench - Cached parameter sweeps for benchmarks
//!
//! sweepbench evaluates a worker function over the Cartesian product of
//! declared input variables, stores every cell's outputs in a dense result
//! grid, and persists results so that repeating an identical sweep, or
//! extending one to a finer sampling level, recomputes only what is new.
//!
//! ## Core Concepts
//!
//! - **SweepVariable**: A named input dimension sampled at a dyadic level
//! - **ResultVariable**: A declared output of the worker (scalar, vector or reference)
//! - **SweepSpecification**: Inputs, results, constants, tag, repeats and over-time settings
//! - **ResultGrid**: Dense N-dimensional storage of every result over the grid
//! - **JobCache**: At-most-once worker evaluation per cell, backed by an on-disk store
//! - **SweepOrchestrator**: Runs a specification end to end against a cache root
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use sweepbench::{
//!     CacheConfig, CacheHandle, Record, ResultVariable, RunOptions, SweepOrchestrator,
//!     SweepSpecification, SweepVariable, WorkerError,
//! };
//!
//! let spec = SweepSpecification::builder("distance")
//!     .input(SweepVariable::float("x", 0.0, 1.0)?)
//!     .input(SweepVariable::float("y", 0.0, 1.0)?)
//!     .result(ResultVariable::scalar("d").units("m"))
//!     .level(3)
//!     .build()?;
//!
//! let worker = Arc::new(|input: &Record| -> Result<Record, WorkerError> {
//!     let x = input.float("x").ok_or("missing x")?;
//!     let y = input.float("y").ok_or("missing y")?;
//!     Ok(Record::new().with("d", x.hypot(y)))
//! });
//!
//! let orchestrator = SweepOrchestrator::new(CacheHandle::open("cachedir", CacheConfig::default())?);
//! let outcome = orchestrator.run_sweep(&spec, worker, &RunOptions::default().use_cache(true))?;
//! assert_eq!(outcome.grid.shape(), &[3, 3]);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Core types
pub mod error;
pub mod hash;
pub mod level;
pub mod result_variable;
pub mod value;
pub mod variable;
pub mod worker;

// Grid expansion and storage
pub mod coordinator;
pub mod grid;

// Persistence and execution
pub mod cache;
pub mod config;
pub mod jobs;
pub mod orchestrator;

// Re-export primary types at crate root for convenience
pub use cache::{CacheConfig, CacheHandle, CacheSession, CacheStore};
pub use config::{ExecutorConfig, RunOptions};
pub use coordinator::{
    spec_hash, CoordinateGrid, GridCell, SweepCoordinator, SweepSpecification,
    SweepSpecificationBuilder, OVER_TIME_DIM, REPEAT_DIM,
};
pub use error::{
    ConfigError, GridError, JobError, StorageError, SweepError, SweepResult, WorkerError,
};
pub use grid::{GridIndices, ResultGrid};
pub use hash::{hash, Digest, HashFold, PersistentHash};
pub use jobs::{Job, JobCache, JobFuture, RunStats};
pub use orchestrator::{cell_cache_key, SweepOrchestrator, SweepOutcome};
pub use result_variable::{OptimizeDirection, ResultKind, ResultVariable};
pub use value::Value;
pub use variable::{Domain, SweepVariable, VariableKind};
pub use worker::{Record, Worker};
