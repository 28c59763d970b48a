//! Sweep variable declarations.
//!
//! A `SweepVariable` names one axis of variation and knows how to produce a
//! finite, ordered list of samples for a given level. Variables are
//! immutable once built: binding a level or a sample count returns a copy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::hash::{Digest, HashFold, PersistentHash};
use crate::level;
use crate::value::{canonical_float, Value};

/// Default sample count of a float range when no level is given.
pub const DEFAULT_FLOAT_SAMPLES: usize = 10;

/// Default sample count of an integer range when no level is given: the
/// resolution of [`level::MAX_LEVEL`]. Smaller ranges are returned whole.
pub const DEFAULT_INT_SAMPLES: usize = 1025;

/// Kind of sweep variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariableKind {
    Int,
    Float,
    Categorical,
    Bool,
    TimeSnapshot,
    TimeEvent,
}

impl VariableKind {
    /// Stable name used in hashes and messages.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Int => "int",
            Self::Float => "float",
            Self::Categorical => "categorical",
            Self::Bool => "bool",
            Self::TimeSnapshot => "time_snapshot",
            Self::TimeEvent => "time_event",
        }
    }
}

/// The values a variable may take.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Domain {
    /// Closed float interval.
    Float { low: f64, high: f64 },
    /// Closed integer interval.
    Int { low: i64, high: i64 },
    /// Explicit ordered set.
    Values { values: Vec<Value> },
}

impl Domain {
    fn canonical(&self) -> String {
        match self {
            Self::Float { low, high } => {
                format!("float[{},{}]", canonical_float(*low), canonical_float(*high))
            }
            Self::Int { low, high } => format!("int[{low},{high}]"),
            Self::Values { values } => {
                let parts: Vec<String> = values.iter().map(Value::canonical).collect();
                format!("values{{{}}}", parts.join(";"))
            }
        }
    }
}

/// A declared axis of variation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepVariable {
    name: String,
    kind: VariableKind,
    domain: Domain,
    samples: Option<usize>,
    level: Option<u32>,
    units: String,
    description: String,
}

impl SweepVariable {
    /// Creates a builder for a variable named `name`.
    #[must_use]
    pub fn builder(name: impl Into<String>) -> SweepVariableBuilder {
        SweepVariableBuilder::new(name)
    }

    /// Float range `[low, high]`.
    pub fn float(name: impl Into<String>, low: f64, high: f64) -> Result<Self, ConfigError> {
        Self::builder(name).bounds(low, high).build()
    }

    /// Integer range `[low, high]`.
    pub fn int(name: impl Into<String>, low: i64, high: i64) -> Result<Self, ConfigError> {
        Self::builder(name).int_bounds(low, high).build()
    }

    /// Ordered categorical set.
    pub fn categorical<I, V>(name: impl Into<String>, values: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Self::builder(name).values(values).build()
    }

    /// Boolean variable sampled as `[false, true]`.
    pub fn boolean(name: impl Into<String>) -> Result<Self, ConfigError> {
        Self::builder(name)
            .kind(VariableKind::Bool)
            .values([false, true])
            .build()
    }

    /// Single time snapshot, used as the over-time meta variable.
    pub fn time_snapshot(name: impl Into<String>, at: DateTime<Utc>) -> Result<Self, ConfigError> {
        Self::builder(name)
            .kind(VariableKind::TimeSnapshot)
            .values([at])
            .build()
    }

    /// Single labelled time event, used as the over-time meta variable.
    pub fn time_event(name: impl Into<String>, label: impl Into<String>) -> Result<Self, ConfigError> {
        let label: String = label.into();
        Self::builder(name)
            .kind(VariableKind::TimeEvent)
            .values([label])
            .build()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub const fn kind(&self) -> VariableKind {
        self.kind
    }

    pub const fn domain(&self) -> &Domain {
        &self.domain
    }

    pub fn units(&self) -> &str {
        &self.units
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub const fn level(&self) -> Option<u32> {
        self.level
    }

    pub const fn samples(&self) -> Option<usize> {
        self.samples
    }

    /// Copy of this variable sampled at `level`.
    pub fn with_level(&self, level: u32) -> Result<Self, ConfigError> {
        let level = level::checked_level(level)?;
        Ok(Self {
            level: Some(level),
            ..self.clone()
        })
    }

    /// Copy of this variable with an explicit sample count and no level.
    #[must_use]
    pub fn with_samples(&self, samples: usize) -> Self {
        Self {
            samples: Some(samples.max(1)),
            level: None,
            ..self.clone()
        }
    }

    /// Ordered samples at the bound level, or at the sample count when no
    /// level is bound.
    #[must_use]
    pub fn values(&self) -> Vec<Value> {
        match self.level {
            Some(level) => self.values_at_level(level),
            None => self.values_by_count(),
        }
    }

    /// Ordered samples at `level`.
    #[must_use]
    pub fn values_at_level(&self, level: u32) -> Vec<Value> {
        match &self.domain {
            Domain::Float { low, high } => level::float_values(*low, *high, level)
                .into_iter()
                .map(Value::Float)
                .collect(),
            Domain::Int { low, high } => level::int_values(*low, *high, level)
                .into_iter()
                .map(Value::Int)
                .collect(),
            Domain::Values { values } => level::select(values, level),
        }
    }

    fn values_by_count(&self) -> Vec<Value> {
        match &self.domain {
            Domain::Float { low, high } => {
                let count = self.samples.unwrap_or(DEFAULT_FLOAT_SAMPLES);
                let mut out = level::linspace(*low, *high, count);
                out.dedup();
                out.into_iter().map(Value::Float).collect()
            }
            Domain::Int { low, high } => {
                let count = self.samples.unwrap_or(DEFAULT_INT_SAMPLES);
                level::int_linspace(*low, *high, count)
                    .into_iter()
                    .map(Value::Int)
                    .collect()
            }
            Domain::Values { values } => match self.samples {
                Some(count) if count < values.len() => values[..count].to_vec(),
                _ => values.clone(),
            },
        }
    }
}

impl PersistentHash for SweepVariable {
    /// Name, kind, domain, units and the resolved sample list.
    ///
    /// The description is documentation only and is left out.
    fn persistent_hash(&self) -> Digest {
        HashFold::new()
            .with(self.name.as_str())
            .with(self.kind.as_str())
            .with(self.domain.canonical().as_str())
            .with(self.units.as_str())
            .with(&self.values())
            .finish()
    }
}

/// Builder for [`SweepVariable`].
#[derive(Debug, Clone, Default)]
pub struct SweepVariableBuilder {
    name: String,
    kind: Option<VariableKind>,
    bounds: Option<(f64, f64)>,
    int_bounds: Option<(i64, i64)>,
    values: Option<Vec<Value>>,
    samples: Option<usize>,
    level: Option<u32>,
    units: Option<String>,
    description: Option<String>,
}

impl SweepVariableBuilder {
    /// Creates a new builder.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Sets the kind explicitly; otherwise it is inferred from the domain.
    #[must_use]
    pub fn kind(mut self, kind: VariableKind) -> Self {
        self.kind = Some(kind);
        self
    }

    /// Float bounds.
    #[must_use]
    pub fn bounds(mut self, low: f64, high: f64) -> Self {
        self.bounds = Some((low, high));
        self
    }

    /// Integer bounds.
    #[must_use]
    pub fn int_bounds(mut self, low: i64, high: i64) -> Self {
        self.int_bounds = Some((low, high));
        self
    }

    /// Explicit ordered sample set.
    #[must_use]
    pub fn values<I, V>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.values = Some(values.into_iter().map(Into::into).collect());
        self
    }

    /// Explicit sample count used when no level is bound.
    #[must_use]
    pub fn samples(mut self, samples: usize) -> Self {
        self.samples = Some(samples);
        self
    }

    /// Binds a level.
    #[must_use]
    pub fn level(mut self, level: u32) -> Self {
        self.level = Some(level);
        self
    }

    #[must_use]
    pub fn units(mut self, units: impl Into<String>) -> Self {
        self.units = Some(units.into());
        self
    }

    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Builds the variable.
    ///
    /// Returns `MissingDomain` when neither bounds nor a non-empty value set
    /// were given.
    #[allow(clippy::cast_precision_loss)]
    pub fn build(self) -> Result<SweepVariable, ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::EmptyName);
        }

        let domain = if let Some(values) = self.values.filter(|v| !v.is_empty()) {
            Domain::Values { values }
        } else if let Some((low, high)) = self.int_bounds {
            if low > high {
                return Err(ConfigError::InvalidBounds {
                    name: self.name,
                    low: low as f64,
                    high: high as f64,
                });
            }
            Domain::Int { low, high }
        } else if let Some((low, high)) = self.bounds {
            if low.is_nan() || high.is_nan() || low > high {
                return Err(ConfigError::InvalidBounds {
                    name: self.name,
                    low,
                    high,
                });
            }
            Domain::Float { low, high }
        } else {
            return Err(ConfigError::MissingDomain { name: self.name });
        };

        let kind = self.kind.unwrap_or(match &domain {
            Domain::Float { .. } => VariableKind::Float,
            Domain::Int { .. } => VariableKind::Int,
            Domain::Values { .. } => VariableKind::Categorical,
        });

        let level = self.level.map(level::checked_level).transpose()?;

        Ok(SweepVariable {
            name: self.name,
            kind,
            domain,
            samples: self.samples,
            level,
            units: self.units.unwrap_or_default(),
            description: self.description.unwrap_or_default(),
        })
    }
}
