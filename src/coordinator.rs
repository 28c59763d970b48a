//! Sweep specification and coordinate-grid expansion.
//!
//! The coordinator turns a [`SweepSpecification`] into a [`CoordinateGrid`]:
//! the Cartesian product of every input variable's samples, followed by the
//! meta dimensions (`repeat`, then `over_time`). Each cell carries its index
//! tuple and its canonical input record, which includes the bound constants.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::grid::GridIndices;
use crate::hash::{Digest, HashFold};
use crate::level;
use crate::result_variable::ResultVariable;
use crate::value::Value;
use crate::variable::SweepVariable;
use crate::worker::Record;

/// Name of the repeat meta dimension.
pub const REPEAT_DIM: &str = "repeat";

/// Name of the over-time meta dimension.
pub const OVER_TIME_DIM: &str = "over_time";

/// Declarative description of one sweep.
///
/// A variable that appears both as an input and as a constant is removed
/// from the constants whenever the specification is built or modified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepSpecification {
    bench_name: String,
    title: Option<String>,
    input_vars: Vec<SweepVariable>,
    result_vars: Vec<ResultVariable>,
    const_vars: Vec<(SweepVariable, Value)>,
    tag: String,
    repeats: usize,
    over_time: bool,
    time_event: Option<String>,
    level: Option<u32>,
}

impl SweepSpecification {
    /// Creates a builder for a sweep of `bench_name`.
    #[must_use]
    pub fn builder(bench_name: impl Into<String>) -> SweepSpecificationBuilder {
        SweepSpecificationBuilder::new(bench_name)
    }

    pub fn bench_name(&self) -> &str {
        &self.bench_name
    }

    /// Explicit title, or one derived from the input (or constant) names.
    #[must_use]
    pub fn title(&self) -> String {
        if let Some(title) = &self.title {
            return title.clone();
        }
        let names: Vec<&str> = if self.input_vars.is_empty() {
            self.const_vars.iter().map(|(v, _)| v.name()).collect()
        } else {
            self.input_vars.iter().map(SweepVariable::name).collect()
        };
        names.join(" vs ")
    }

    pub fn input_vars(&self) -> &[SweepVariable] {
        &self.input_vars
    }

    pub fn result_vars(&self) -> &[ResultVariable] {
        &self.result_vars
    }

    pub fn const_vars(&self) -> &[(SweepVariable, Value)] {
        &self.const_vars
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub const fn repeats(&self) -> usize {
        self.repeats
    }

    pub const fn over_time(&self) -> bool {
        self.over_time
    }

    pub fn time_event(&self) -> Option<&str> {
        self.time_event.as_deref()
    }

    pub const fn level(&self) -> Option<u32> {
        self.level
    }

    /// Copy sampled at `level`.
    pub fn with_level(&self, level: u32) -> Result<Self, ConfigError> {
        let level = level::checked_level(level)?;
        Ok(Self {
            level: Some(level),
            ..self.clone()
        })
    }

    /// Copy with `repeats` repetitions per cell (at least one).
    #[must_use]
    pub fn with_repeats(&self, repeats: usize) -> Self {
        Self {
            repeats: repeats.max(1),
            ..self.clone()
        }
    }

    #[must_use]
    pub fn with_over_time(&self, over_time: bool) -> Self {
        Self {
            over_time,
            ..self.clone()
        }
    }

    #[must_use]
    pub fn with_time_event(&self, time_event: Option<String>) -> Self {
        Self {
            time_event,
            ..self.clone()
        }
    }

    #[must_use]
    pub fn with_tag(&self, tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            ..self.clone()
        }
    }

    /// Copy with an extra input variable.
    #[must_use]
    pub fn with_input(&self, var: SweepVariable) -> Self {
        let mut spec = self.clone();
        spec.input_vars.retain(|v| v.name() != var.name());
        spec.input_vars.push(var);
        spec.fold_constants();
        spec
    }

    /// Copy with `var` bound to `value`.
    #[must_use]
    pub fn with_constant(&self, var: SweepVariable, value: impl Into<Value>) -> Self {
        let mut spec = self.clone();
        spec.const_vars.retain(|(v, _)| v.name() != var.name());
        spec.const_vars.push((var, value.into()));
        spec.fold_constants();
        spec
    }

    fn fold_constants(&mut self) {
        let inputs = &self.input_vars;
        self.const_vars
            .retain(|(c, _)| !inputs.iter().any(|i| i.name() == c.name()));
    }

    /// Input variables with the specification's level applied.
    pub fn resolved_inputs(&self) -> Result<Vec<SweepVariable>, ConfigError> {
        self.input_vars
            .iter()
            .map(|v| match self.level {
                Some(level) => v.with_level(level),
                None => Ok(v.clone()),
            })
            .collect()
    }

    /// Meta variables active for a run at `time`.
    pub fn meta_vars(&self, time: DateTime<Utc>) -> Result<Vec<SweepVariable>, ConfigError> {
        let mut meta = Vec::new();
        if self.repeats > 1 {
            let repeats = i64::try_from(self.repeats).map_err(|_| ConfigError::InvalidOption {
                option: "repeats".to_string(),
                reason: format!("{} is too large", self.repeats),
            })?;
            meta.push(SweepVariable::int(REPEAT_DIM, 1, repeats)?.with_samples(self.repeats));
        }
        if self.over_time {
            let var = match &self.time_event {
                Some(label) => SweepVariable::time_event(OVER_TIME_DIM, label.clone())?,
                None => SweepVariable::time_snapshot(OVER_TIME_DIM, time)?,
            };
            meta.push(var);
        }
        Ok(meta)
    }

    /// Persistent hash of the semantic content. See [`spec_hash`].
    pub fn hash(&self, include_repeats: bool) -> Result<Digest, ConfigError> {
        spec_hash(self, include_repeats)
    }
}

/// Builder for [`SweepSpecification`].
#[derive(Debug, Clone)]
pub struct SweepSpecificationBuilder {
    bench_name: String,
    title: Option<String>,
    input_vars: Vec<SweepVariable>,
    result_vars: Vec<ResultVariable>,
    const_vars: Vec<(SweepVariable, Value)>,
    tag: String,
    repeats: usize,
    over_time: bool,
    time_event: Option<String>,
    level: Option<u32>,
}

impl SweepSpecificationBuilder {
    #[must_use]
    pub fn new(bench_name: impl Into<String>) -> Self {
        Self {
            bench_name: bench_name.into(),
            title: None,
            input_vars: Vec::new(),
            result_vars: Vec::new(),
            const_vars: Vec::new(),
            tag: String::new(),
            repeats: 1,
            over_time: false,
            time_event: None,
            level: None,
        }
    }

    #[must_use]
    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    #[must_use]
    pub fn input(mut self, var: SweepVariable) -> Self {
        self.input_vars.push(var);
        self
    }

    #[must_use]
    pub fn result(mut self, var: ResultVariable) -> Self {
        self.result_vars.push(var);
        self
    }

    #[must_use]
    pub fn constant(mut self, var: SweepVariable, value: impl Into<Value>) -> Self {
        self.const_vars.push((var, value.into()));
        self
    }

    #[must_use]
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = tag.into();
        self
    }

    #[must_use]
    pub fn repeats(mut self, repeats: usize) -> Self {
        self.repeats = repeats;
        self
    }

    #[must_use]
    pub fn over_time(mut self, over_time: bool) -> Self {
        self.over_time = over_time;
        self
    }

    #[must_use]
    pub fn time_event(mut self, label: impl Into<String>) -> Self {
        self.time_event = Some(label.into());
        self
    }

    #[must_use]
    pub fn level(mut self, level: u32) -> Self {
        self.level = Some(level);
        self
    }

    /// Builds the specification.
    ///
    /// Rejects an empty sweep, duplicate input or result names, a level of
    /// zero and a zero repeat count.
    pub fn build(self) -> Result<SweepSpecification, ConfigError> {
        if self.input_vars.is_empty() && self.const_vars.is_empty() && self.title.is_none() {
            return Err(ConfigError::EmptySweep);
        }
        if self.repeats == 0 {
            return Err(ConfigError::InvalidOption {
                option: "repeats".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        check_unique(self.input_vars.iter().map(|v| v.name().to_string()))?;
        check_unique(self.result_vars.iter().flat_map(ResultVariable::slot_names))?;
        let level = self.level.map(level::checked_level).transpose()?;

        let mut spec = SweepSpecification {
            bench_name: self.bench_name,
            title: self.title,
            input_vars: self.input_vars,
            result_vars: self.result_vars,
            const_vars: self.const_vars,
            tag: self.tag,
            repeats: self.repeats,
            over_time: self.over_time,
            time_event: self.time_event,
            level,
        };
        spec.fold_constants();
        Ok(spec)
    }
}

fn check_unique(names: impl Iterator<Item = String>) -> Result<(), ConfigError> {
    let mut seen = std::collections::HashSet::new();
    for name in names {
        if !seen.insert(name.clone()) {
            return Err(ConfigError::DuplicateName { name });
        }
    }
    Ok(())
}

/// Persistent hash of a specification.
///
/// Folds bench name, title, the over-time flag, the repeat count (when
/// `include_repeats`), tag, then every level-resolved input variable, every
/// result variable and every constant pair. The time-event label is a
/// coordinate of the over-time dimension and is left out, so successive
/// events accumulate under one history key.
pub fn spec_hash(spec: &SweepSpecification, include_repeats: bool) -> Result<Digest, ConfigError> {
    let mut fold = HashFold::new();
    fold.push(spec.bench_name.as_str());
    fold.push(spec.title().as_str());
    fold.push(&spec.over_time);
    if include_repeats {
        fold.push(&spec.repeats);
    }
    fold.push(spec.tag.as_str());
    for var in spec.resolved_inputs()? {
        fold.push(&var);
    }
    for var in &spec.result_vars {
        fold.push(var);
    }
    for pair in &spec.const_vars {
        fold.push(pair);
    }
    Ok(fold.finish())
}

/// One cell of a [`CoordinateGrid`].
#[derive(Debug, Clone, PartialEq)]
pub struct GridCell {
    pub index: Vec<usize>,
    pub input: Record,
}

/// The expanded coordinate space of a sweep.
#[derive(Debug, Clone, PartialEq)]
pub struct CoordinateGrid {
    dims: Vec<String>,
    coords: Vec<Vec<Value>>,
    constants: Record,
}

impl CoordinateGrid {
    /// Dimension names, inputs first then meta dimensions.
    pub fn dims(&self) -> &[String] {
        &self.dims
    }

    /// Number of samples along each dimension.
    #[must_use]
    pub fn shape(&self) -> Vec<usize> {
        self.coords.iter().map(Vec::len).collect()
    }

    /// Ordered samples along `dim`.
    pub fn coords(&self, dim: &str) -> Option<&[Value]> {
        self.dims
            .iter()
            .position(|d| d == dim)
            .map(|i| self.coords[i].as_slice())
    }

    /// Samples of every dimension, in dimension order.
    pub fn all_coords(&self) -> &[Vec<Value>] {
        &self.coords
    }

    /// Bound constants included in every cell's input.
    pub const fn constants(&self) -> &Record {
        &self.constants
    }

    /// Number of cells.
    #[must_use]
    pub fn total_cells(&self) -> usize {
        self.coords.iter().map(Vec::len).product()
    }

    /// Canonical input of the cell at `index`, or `None` when out of range.
    ///
    /// The over-time coordinate only labels the grid; it is not part of
    /// the input handed to the worker or of the cell cache key.
    #[must_use]
    pub fn input_at(&self, index: &[usize]) -> Option<Record> {
        if index.len() != self.dims.len() {
            return None;
        }
        let mut input = self.constants.clone();
        for ((dim, samples), &i) in self.dims.iter().zip(&self.coords).zip(index) {
            let sample = samples.get(i)?;
            if dim != OVER_TIME_DIM {
                input.insert(dim.clone(), sample.clone());
            }
        }
        Some(input)
    }

    /// Human-readable `name=value` label of the cell at `index`.
    #[must_use]
    pub fn coordinate_label(&self, index: &[usize]) -> String {
        let parts: Vec<String> = self
            .dims
            .iter()
            .zip(&self.coords)
            .zip(index)
            .map(|((dim, samples), &i)| match samples.get(i) {
                Some(v) => format!("{dim}={v}"),
                None => format!("{dim}=?"),
            })
            .collect();
        if parts.is_empty() {
            "()".to_string()
        } else {
            parts.join(", ")
        }
    }

    /// Cells in row-major order (last dimension varies fastest).
    pub fn cells(&self) -> impl Iterator<Item = GridCell> + '_ {
        GridIndices::new(self.shape()).filter_map(move |index| {
            let input = self.input_at(&index)?;
            Some(GridCell { index, input })
        })
    }
}

/// Expands specifications into coordinate grids.
#[derive(Debug, Clone, Copy)]
pub struct SweepCoordinator {
    run_time: DateTime<Utc>,
}

impl SweepCoordinator {
    /// Coordinator stamping over-time sweeps with the current time.
    #[must_use]
    pub fn new() -> Self {
        Self::at(Utc::now())
    }

    /// Coordinator stamping over-time sweeps with `run_time`.
    #[must_use]
    pub const fn at(run_time: DateTime<Utc>) -> Self {
        Self { run_time }
    }

    pub const fn run_time(&self) -> DateTime<Utc> {
        self.run_time
    }

    /// Expands `spec` at its level into a coordinate grid.
    pub fn build_grid(&self, spec: &SweepSpecification) -> Result<CoordinateGrid, ConfigError> {
        if spec.input_vars.is_empty() && spec.const_vars.is_empty() && spec.title.is_none() {
            return Err(ConfigError::EmptySweep);
        }

        let mut vars = spec.resolved_inputs()?;
        vars.extend(spec.meta_vars(self.run_time)?);

        let dims: Vec<String> = vars.iter().map(|v| v.name().to_string()).collect();
        check_unique(dims.iter().cloned())?;
        let coords: Vec<Vec<Value>> = vars.iter().map(SweepVariable::values).collect();

        let constants: Record = spec
            .const_vars
            .iter()
            .map(|(var, value)| (var.name().to_string(), value.clone()))
            .collect();

        tracing::debug!(
            bench = %spec.bench_name,
            dims = ?dims,
            cells = coords.iter().map(Vec::len).product::<usize>(),
            "Expanded coordinate grid"
        );

        Ok(CoordinateGrid {
            dims,
            coords,
            constants,
        })
    }
}

impl Default for SweepCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(name: &str) -> SweepVariable {
        SweepVariable::float(name, 0.0, 1.0).unwrap()
    }

    fn two_input_spec() -> SweepSpecification {
        SweepSpecification::builder("bench")
            .input(unit("x"))
            .input(unit("y"))
            .result(ResultVariable::scalar("z"))
            .level(3)
            .build()
            .unwrap()
    }

    #[test]
    fn test_shape_matches_levels() {
        let grid = SweepCoordinator::new().build_grid(&two_input_spec()).unwrap();
        assert_eq!(grid.shape(), vec![3, 3]);
        assert_eq!(grid.total_cells(), 9);
        assert_eq!(grid.cells().count(), 9);
    }

    #[test]
    fn test_cells_are_row_major() {
        let grid = SweepCoordinator::new().build_grid(&two_input_spec()).unwrap();
        let indices: Vec<Vec<usize>> = grid.cells().map(|c| c.index).take(4).collect();
        assert_eq!(indices, vec![vec![0, 0], vec![0, 1], vec![0, 2], vec![1, 0]]);
    }

    #[test]
    fn test_constant_folding() {
        let spec = SweepSpecification::builder("bench")
            .input(unit("x"))
            .constant(unit("x"), 0.25)
            .constant(unit("c"), 7.0)
            .build()
            .unwrap();
        assert_eq!(spec.const_vars().len(), 1);
        assert_eq!(spec.const_vars()[0].0.name(), "c");

        let grid = SweepCoordinator::new().build_grid(&spec).unwrap();
        assert!(grid.constants().get("x").is_none());
        let cell = grid.cells().next().unwrap();
        assert_eq!(cell.input.float("c"), Some(7.0));

        let spec = spec.with_constant(unit("y"), 1.0).with_input(unit("y"));
        assert!(spec.const_vars().iter().all(|(v, _)| v.name() != "y"));
    }

    #[test]
    fn test_empty_sweep_rejected() {
        let err = SweepSpecification::builder("bench").build().unwrap_err();
        assert_eq!(err, ConfigError::EmptySweep);

        let titled = SweepSpecification::builder("bench").title("single").build().unwrap();
        let grid = SweepCoordinator::new().build_grid(&titled).unwrap();
        assert_eq!(grid.total_cells(), 1);
        assert_eq!(grid.cells().count(), 1);
    }

    #[test]
    fn test_meta_dims_follow_inputs() {
        let spec = two_input_spec().with_repeats(2).with_over_time(true);
        let grid = SweepCoordinator::new().build_grid(&spec).unwrap();
        assert_eq!(grid.dims(), ["x", "y", REPEAT_DIM, OVER_TIME_DIM]);
        assert_eq!(grid.shape(), vec![3, 3, 2, 1]);

        let cell = grid.cells().next().unwrap();
        assert_eq!(cell.input.int(REPEAT_DIM), Some(1));
        assert!(cell.input.get(OVER_TIME_DIM).is_none());
        assert_eq!(cell.input.len(), 3);
        assert!(grid.coordinate_label(&cell.index).contains("over_time="));
    }

    #[test]
    fn test_time_event_label_is_coordinate() {
        let spec = two_input_spec()
            .with_over_time(true)
            .with_time_event(Some("v1.2".to_string()));
        let grid = SweepCoordinator::new().build_grid(&spec).unwrap();
        assert_eq!(grid.coords(OVER_TIME_DIM), Some(&[Value::from("v1.2")][..]));
    }

    #[test]
    fn test_default_title() {
        assert_eq!(two_input_spec().title(), "x vs y");
    }

    #[test]
    fn test_spec_hash_is_structural() {
        let a = two_input_spec();
        let b = two_input_spec();
        assert_eq!(spec_hash(&a, true).unwrap(), spec_hash(&b, true).unwrap());

        let higher = a.with_level(4).unwrap();
        assert_ne!(spec_hash(&a, true).unwrap(), spec_hash(&higher, true).unwrap());

        let repeated = a.with_repeats(3);
        assert_ne!(spec_hash(&a, true).unwrap(), spec_hash(&repeated, true).unwrap());
        assert_eq!(spec_hash(&a, false).unwrap(), spec_hash(&repeated, false).unwrap());

        let tagged = a.with_tag("other");
        assert_ne!(spec_hash(&a, true).unwrap(), spec_hash(&tagged, true).unwrap());

        let event = a.with_time_event(Some("e".to_string()));
        assert_eq!(spec_hash(&a, true).unwrap(), spec_hash(&event, true).unwrap());
    }

    #[test]
    fn test_duplicate_inputs_rejected() {
        let err = SweepSpecification::builder("bench")
            .input(unit("x"))
            .input(unit("x"))
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateName { .. }));
    }

    #[test]
    fn test_coordinate_label() {
        let grid = SweepCoordinator::new().build_grid(&two_input_spec()).unwrap();
        assert_eq!(grid.coordinate_label(&[1, 2]), "x=0.5, y=1");
    }
}
