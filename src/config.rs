//! Run configuration.
//!
//! [`RunOptions`] controls one `run_sweep` call: which caches are consulted
//! or cleared, the sampling level, repeats, over-time accumulation and how
//! cells are executed. Command-line front ends map their flags onto it
//! one-to-one through [`RunOptions::from_args`].

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::level;

/// How cell jobs are executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ExecutorConfig {
    /// Run each job inline on the calling thread.
    #[default]
    Serial,
    /// Run jobs on a bounded pool of worker threads.
    Parallel {
        /// Number of worker threads.
        workers: usize,
        /// Maximum queued jobs before submission blocks.
        queue_capacity: usize,
    },
}

impl ExecutorConfig {
    /// Default queued jobs per worker thread.
    pub const QUEUE_PER_WORKER: usize = 64;

    /// Parallel executor with `workers` threads and a proportional queue.
    #[must_use]
    pub fn parallel(workers: usize) -> Self {
        let workers = workers.max(1);
        Self::Parallel {
            workers,
            queue_capacity: workers.saturating_mul(Self::QUEUE_PER_WORKER),
        }
    }

    #[must_use]
    pub const fn is_parallel(&self) -> bool {
        matches!(self, Self::Parallel { .. })
    }
}

/// Options of one sweep run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunOptions {
    /// Return a cached whole-sweep result when one exists.
    pub use_cache: bool,
    /// Ignore (and replace) any cached whole-sweep result.
    pub clear_cache: bool,
    /// Cache individual cell results.
    pub cache_samples: bool,
    /// Recompute cells even when cached, replacing the stored values.
    pub overwrite_sample_cache: bool,
    /// Evict this sweep's tag from the sample cache before running.
    pub clear_sample_cache: bool,
    /// Only read the sweep cache; fail instead of computing.
    pub only_plot: bool,
    /// Sampling level applied to every input variable.
    pub level: Option<u32>,
    /// Repetitions of every cell.
    pub repeats: Option<usize>,
    /// Accumulate results along a time dimension.
    pub over_time: bool,
    /// Discard accumulated history before this run.
    pub clear_history: bool,
    /// Label of the over-time coordinate instead of the current time.
    pub time_event: Option<String>,
    /// Key cells by this exact sweep so no other sweep reuses them.
    pub isolate_samples: bool,
    pub executor: ExecutorConfig,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            use_cache: false,
            clear_cache: false,
            cache_samples: true,
            overwrite_sample_cache: false,
            clear_sample_cache: false,
            only_plot: false,
            level: None,
            repeats: None,
            over_time: false,
            clear_history: false,
            time_event: None,
            isolate_samples: false,
            executor: ExecutorConfig::Serial,
        }
    }
}

impl RunOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn use_cache(mut self, yes: bool) -> Self {
        self.use_cache = yes;
        self
    }

    #[must_use]
    pub fn clear_cache(mut self, yes: bool) -> Self {
        self.clear_cache = yes;
        self
    }

    #[must_use]
    pub fn cache_samples(mut self, yes: bool) -> Self {
        self.cache_samples = yes;
        self
    }

    #[must_use]
    pub fn overwrite_sample_cache(mut self, yes: bool) -> Self {
        self.overwrite_sample_cache = yes;
        self
    }

    #[must_use]
    pub fn clear_sample_cache(mut self, yes: bool) -> Self {
        self.clear_sample_cache = yes;
        self
    }

    #[must_use]
    pub fn only_plot(mut self, yes: bool) -> Self {
        self.only_plot = yes;
        self
    }

    #[must_use]
    pub fn level(mut self, level: u32) -> Self {
        self.level = Some(level);
        self
    }

    #[must_use]
    pub fn repeats(mut self, repeats: usize) -> Self {
        self.repeats = Some(repeats);
        self
    }

    #[must_use]
    pub fn over_time(mut self, yes: bool) -> Self {
        self.over_time = yes;
        self
    }

    #[must_use]
    pub fn clear_history(mut self, yes: bool) -> Self {
        self.clear_history = yes;
        self
    }

    #[must_use]
    pub fn time_event(mut self, label: impl Into<String>) -> Self {
        self.time_event = Some(label.into());
        self
    }

    #[must_use]
    pub fn isolate_samples(mut self, yes: bool) -> Self {
        self.isolate_samples = yes;
        self
    }

    #[must_use]
    pub fn executor(mut self, executor: ExecutorConfig) -> Self {
        self.executor = executor;
        self
    }

    /// Checks option values and combinations.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(level) = self.level {
            level::checked_level(level)?;
        }
        if self.repeats == Some(0) {
            return Err(invalid("--repeats", "must be at least 1"));
        }
        if let ExecutorConfig::Parallel {
            workers,
            queue_capacity,
        } = self.executor
        {
            if workers == 0 {
                return Err(invalid("--parallel", "needs at least one worker"));
            }
            if queue_capacity == 0 {
                return Err(invalid("queue_capacity", "must be at least 1"));
            }
        }
        if self.time_event.is_some() && !self.over_time {
            return Err(invalid("--time-event", "requires --over-time"));
        }
        Ok(())
    }

    /// Parses command-line flags.
    ///
    /// Recognised flags: `--use-cache`, `--clear-cache`, `--cache-samples`,
    /// `--no-cache-samples`, `--overwrite-sample-cache`,
    /// `--clear-sample-cache`, `--only-plot`, `--level N`, `--repeats N`,
    /// `--over-time`, `--clear-history`, `--time-event LABEL`,
    /// `--isolate-samples` and `--parallel N`. Values may also be given as
    /// `--flag=value`.
    pub fn from_args<I, S>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut options = Self::default();
        let mut args = args.into_iter().map(|s| s.as_ref().to_string());

        while let Some(arg) = args.next() {
            let (flag, inline) = match arg.split_once('=') {
                Some((flag, value)) => (flag.to_string(), Some(value.to_string())),
                None => (arg, None),
            };
            let mut value = |name: &str| -> Result<String, ConfigError> {
                inline
                    .clone()
                    .or_else(|| args.next())
                    .ok_or_else(|| invalid(name, "expects a value"))
            };

            match flag.as_str() {
                "--use-cache" => options.use_cache = true,
                "--clear-cache" => options.clear_cache = true,
                "--cache-samples" => options.cache_samples = true,
                "--no-cache-samples" => options.cache_samples = false,
                "--overwrite-sample-cache" => options.overwrite_sample_cache = true,
                "--clear-sample-cache" => options.clear_sample_cache = true,
                "--only-plot" => options.only_plot = true,
                "--over-time" => options.over_time = true,
                "--clear-history" => options.clear_history = true,
                "--isolate-samples" => options.isolate_samples = true,
                "--level" => options.level = Some(parse_number(&flag, &value(&flag)?)?),
                "--repeats" => options.repeats = Some(parse_number(&flag, &value(&flag)?)?),
                "--time-event" => options.time_event = Some(value(&flag)?),
                "--parallel" => {
                    options.executor = ExecutorConfig::parallel(parse_number(&flag, &value(&flag)?)?);
                }
                other => return Err(invalid(other, "unknown flag")),
            }
        }

        options.validate()?;
        Ok(options)
    }
}

fn invalid(option: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidOption {
        option: option.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_number<T: std::str::FromStr>(flag: &str, raw: &str) -> Result<T, ConfigError> {
    raw.parse()
        .map_err(|_| invalid(flag, &format!("'{raw}' is not a valid number")))
}
