//! Result variable declarations.
//!
//! A result variable names one output of the worker. Scalars occupy one slot
//! array in the result grid; a fixed-size vector is split into one scalar
//! slot array per component so the grid stays rectangular; references hold
//! opaque values (paths, labels, JSON blobs) that are carried, not reduced.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::hash::{Digest, HashFold, PersistentHash};

/// Desired direction when comparing results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizeDirection {
    Minimize,
    Maximize,
    #[default]
    None,
}

impl OptimizeDirection {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Minimize => "minimize",
            Self::Maximize => "maximize",
            Self::None => "none",
        }
    }
}

/// Storage kind of a result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResultKind {
    Scalar,
    /// Fixed-size vector; `components` are the slot-name suffixes.
    Vector { components: Vec<String> },
    Reference,
}

/// A declared worker output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultVariable {
    name: String,
    kind: ResultKind,
    units: String,
    description: String,
    direction: OptimizeDirection,
}

impl ResultVariable {
    /// Scalar result.
    #[must_use]
    pub fn scalar(name: impl Into<String>) -> Self {
        Self::with_kind(name, ResultKind::Scalar)
    }

    /// Vector result of `len` components named `name_0 … name_{len-1}`.
    pub fn vector(name: impl Into<String>, len: usize) -> Result<Self, ConfigError> {
        let name = name.into();
        if len == 0 {
            return Err(ConfigError::EmptyVector { name });
        }
        let components = (0..len).map(|i| i.to_string()).collect();
        Ok(Self::with_kind(name, ResultKind::Vector { components }))
    }

    /// Three-component vector with slots `name_x`, `name_y`, `name_z`.
    #[must_use]
    pub fn vec3(name: impl Into<String>) -> Self {
        let components = ["x", "y", "z"].iter().map(|c| (*c).to_string()).collect();
        Self::with_kind(name, ResultKind::Vector { components })
    }

    /// Opaque reference result.
    #[must_use]
    pub fn reference(name: impl Into<String>) -> Self {
        Self::with_kind(name, ResultKind::Reference)
    }

    fn with_kind(name: impl Into<String>, kind: ResultKind) -> Self {
        Self {
            name: name.into(),
            kind,
            units: String::new(),
            description: String::new(),
            direction: OptimizeDirection::None,
        }
    }

    #[must_use]
    pub fn units(mut self, units: impl Into<String>) -> Self {
        self.units = units.into();
        self
    }

    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    #[must_use]
    pub fn direction(mut self, direction: OptimizeDirection) -> Self {
        self.direction = direction;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub const fn kind(&self) -> &ResultKind {
        &self.kind
    }

    pub fn unit_label(&self) -> &str {
        &self.units
    }

    pub fn description_text(&self) -> &str {
        &self.description
    }

    pub const fn optimize_direction(&self) -> OptimizeDirection {
        self.direction
    }

    /// Names of the slot arrays this result occupies in a grid.
    #[must_use]
    pub fn slot_names(&self) -> Vec<String> {
        match &self.kind {
            ResultKind::Vector { components } => components
                .iter()
                .map(|c| format!("{}_{c}", self.name))
                .collect(),
            ResultKind::Scalar | ResultKind::Reference => vec![self.name.clone()],
        }
    }
}

impl PersistentHash for ResultVariable {
    fn persistent_hash(&self) -> Digest {
        let kind = match &self.kind {
            ResultKind::Scalar => "scalar".to_string(),
            ResultKind::Vector { components } => format!("vector[{}]", components.join(",")),
            ResultKind::Reference => "reference".to_string(),
        };
        HashFold::new()
            .with(self.name.as_str())
            .with(kind.as_str())
            .with(self.units.as_str())
            .with(self.direction.as_str())
            .finish()
    }
}
