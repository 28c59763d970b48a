//! Dense N-dimensional result storage.
//!
//! A [`ResultGrid`] holds one flat slot array per scalar result (or vector
//! component), indexed row-major by the coordinate grid's dimensions.
//! Numeric slots start as `NaN`; reference slots start empty. Reductions
//! over the repeat dimension are computed on read and return new grids.

use serde::{Deserialize, Serialize};

use crate::coordinator::{CoordinateGrid, REPEAT_DIM};
use crate::error::GridError;
use crate::result_variable::{ResultKind, ResultVariable};
use crate::value::{float_repr, Value};

/// Row-major strides for `shape`.
pub(crate) fn compute_strides(shape: &[usize]) -> Vec<usize> {
    if shape.is_empty() {
        return Vec::new();
    }
    let mut strides = vec![1; shape.len()];
    for i in (0..shape.len() - 1).rev() {
        strides[i] = strides[i + 1] * shape[i + 1];
    }
    strides
}

/// Iterator over every index tuple of a shape, last dimension fastest.
///
/// A rank-0 shape yields the empty tuple once.
#[derive(Debug, Clone)]
pub struct GridIndices {
    shape: Vec<usize>,
    current: Vec<usize>,
    done: bool,
}

impl GridIndices {
    #[must_use]
    pub fn new(shape: Vec<usize>) -> Self {
        let done = shape.iter().any(|&n| n == 0);
        let current = vec![0; shape.len()];
        Self {
            shape,
            current,
            done,
        }
    }
}

impl Iterator for GridIndices {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let result = self.current.clone();

        if self.shape.is_empty() {
            self.done = true;
            return Some(result);
        }

        for i in (0..self.shape.len()).rev() {
            self.current[i] += 1;
            if self.current[i] < self.shape[i] {
                break;
            }
            self.current[i] = 0;
            if i == 0 {
                self.done = true;
            }
        }

        Some(result)
    }
}

/// Backing storage of one slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "values", rename_all = "snake_case")]
pub enum SlotData {
    Numeric(#[serde(with = "float_repr::seq")] Vec<f64>),
    Reference(Vec<Option<Value>>),
}

impl SlotData {
    fn empty_like(&self, len: usize) -> Self {
        match self {
            Self::Numeric(_) => Self::Numeric(vec![f64::NAN; len]),
            Self::Reference(_) => Self::Reference(vec![None; len]),
        }
    }

    fn copy_cell(&mut self, to: usize, from: &Self, at: usize) {
        match (self, from) {
            (Self::Numeric(dst), Self::Numeric(src)) => dst[to] = src[at],
            (Self::Reference(dst), Self::Reference(src)) => dst[to] = src[at].clone(),
            _ => {}
        }
    }
}

/// One slot array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotArray {
    name: String,
    result: String,
    data: SlotData,
}

impl SlotArray {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the result variable this slot belongs to.
    pub fn result(&self) -> &str {
        &self.result
    }

    pub const fn data(&self) -> &SlotData {
        &self.data
    }
}

/// Dense result storage for one sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultGrid {
    dims: Vec<String>,
    coords: Vec<Vec<Value>>,
    shape: Vec<usize>,
    results: Vec<ResultVariable>,
    slots: Vec<SlotArray>,
}

impl ResultGrid {
    /// Allocates sentinel-filled slots for every result over `grid`.
    #[must_use]
    pub fn allocate(grid: &CoordinateGrid, result_vars: &[ResultVariable]) -> Self {
        let shape = grid.shape();
        let len = shape.iter().product();
        let slots = result_vars
            .iter()
            .flat_map(|rv| {
                let data = match rv.kind() {
                    ResultKind::Reference => SlotData::Reference(vec![None; len]),
                    ResultKind::Scalar | ResultKind::Vector { .. } => {
                        SlotData::Numeric(vec![f64::NAN; len])
                    }
                };
                rv.slot_names().into_iter().map(move |name| SlotArray {
                    name,
                    result: rv.name().to_string(),
                    data: data.clone(),
                })
            })
            .collect();

        Self {
            dims: grid.dims().to_vec(),
            coords: grid.all_coords().to_vec(),
            shape,
            results: result_vars.to_vec(),
            slots,
        }
    }

    pub fn dims(&self) -> &[String] {
        &self.dims
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Number of cells.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ordered samples along `dim`.
    pub fn coords(&self, dim: &str) -> Option<&[Value]> {
        self.dim_index(dim).map(|i| self.coords[i].as_slice())
    }

    /// Slot names, in declaration order.
    pub fn variable_names(&self) -> impl Iterator<Item = &str> {
        self.slots.iter().map(SlotArray::name)
    }

    pub fn result_vars(&self) -> &[ResultVariable] {
        &self.results
    }

    pub fn slot(&self, name: &str) -> Option<&SlotArray> {
        self.slots.iter().find(|s| s.name == name)
    }

    /// Declaration (with units, description, direction) of a result or slot.
    pub fn metadata(&self, name: &str) -> Option<&ResultVariable> {
        let result = self.slot(name).map_or(name, SlotArray::result);
        self.results.iter().find(|rv| rv.name() == result)
    }

    /// Replaces the units and description of result `var`.
    pub fn attach_metadata(
        &mut self,
        var: &str,
        units: impl Into<String>,
        description: impl Into<String>,
    ) -> Result<(), GridError> {
        let rv = self
            .results
            .iter_mut()
            .find(|rv| rv.name() == var)
            .ok_or_else(|| GridError::UnknownVariable {
                name: var.to_string(),
            })?;
        *rv = rv.clone().units(units).description(description);
        Ok(())
    }

    fn dim_index(&self, dim: &str) -> Option<usize> {
        self.dims.iter().position(|d| d == dim)
    }

    /// Flat offset of `index`, checking arity and bounds.
    pub fn flat_index(&self, index: &[usize]) -> Result<usize, GridError> {
        let out_of_range = || GridError::IndexOutOfRange {
            index: index.to_vec(),
            shape: self.shape.clone(),
        };
        if index.len() != self.shape.len() {
            return Err(out_of_range());
        }
        let strides = compute_strides(&self.shape);
        let mut flat = 0;
        for ((&i, &n), &stride) in index.iter().zip(&self.shape).zip(&strides) {
            if i >= n {
                return Err(out_of_range());
            }
            flat += i * stride;
        }
        Ok(flat)
    }

    fn slot_mut(&mut self, name: &str) -> Result<&mut SlotArray, GridError> {
        self.slots
            .iter_mut()
            .find(|s| s.name == name)
            .ok_or_else(|| GridError::UnknownVariable {
                name: name.to_string(),
            })
    }

    /// Stores `value` for result `var` at `index`.
    ///
    /// Vector values are split across the component slots.
    pub fn set(&mut self, var: &str, index: &[usize], value: &Value) -> Result<(), GridError> {
        let flat = self.flat_index(index)?;
        let rv = self
            .results
            .iter()
            .find(|rv| rv.name() == var)
            .cloned()
            .ok_or_else(|| GridError::UnknownVariable {
                name: var.to_string(),
            })?;

        let mismatch = |expected: String| GridError::ResultTypeMismatch {
            name: var.to_string(),
            expected,
            actual: value.type_name().to_string(),
        };

        match rv.kind() {
            ResultKind::Scalar => {
                let x = value
                    .as_float()
                    .ok_or_else(|| mismatch("a number".to_string()))?;
                if let SlotData::Numeric(data) = &mut self.slot_mut(var)?.data {
                    data[flat] = x;
                }
            }
            ResultKind::Vector { components } => {
                let xs = value
                    .as_vector()
                    .filter(|xs| xs.len() == components.len())
                    .ok_or_else(|| mismatch(format!("a vector of {}", components.len())))?;
                for (slot_name, &x) in rv.slot_names().iter().zip(xs) {
                    if let SlotData::Numeric(data) = &mut self.slot_mut(slot_name)?.data {
                        data[flat] = x;
                    }
                }
            }
            ResultKind::Reference => {
                if let SlotData::Reference(data) = &mut self.slot_mut(var)?.data {
                    data[flat] = Some(value.clone());
                }
            }
        }
        Ok(())
    }

    /// Value of a slot or result at `index`. A vector result name returns
    /// the recomposed vector; an unset reference reads as `Null`.
    #[must_use]
    pub fn get(&self, name: &str, index: &[usize]) -> Option<Value> {
        let flat = self.flat_index(index).ok()?;
        if let Some(slot) = self.slot(name) {
            return Some(match &slot.data {
                SlotData::Numeric(data) => Value::Float(data[flat]),
                SlotData::Reference(data) => data[flat].clone().unwrap_or(Value::Null),
            });
        }
        let rv = self.results.iter().find(|rv| rv.name() == name)?;
        let xs = rv
            .slot_names()
            .iter()
            .map(|s| self.numeric(s).map(|data| data[flat]))
            .collect::<Option<Vec<f64>>>()?;
        Some(Value::Vector(xs))
    }

    /// Raw numeric data of a slot.
    pub fn numeric(&self, name: &str) -> Option<&[f64]> {
        match &self.slot(name)?.data {
            SlotData::Numeric(data) => Some(data),
            SlotData::Reference(_) => None,
        }
    }

    /// Raw reference data of a slot.
    pub fn references(&self, name: &str) -> Option<&[Option<Value>]> {
        match &self.slot(name)?.data {
            SlotData::Reference(data) => Some(data),
            SlotData::Numeric(_) => None,
        }
    }

    /// Nearest-coordinate lookup.
    ///
    /// Every dimension longer than one must be selected. Numeric and time
    /// coordinates snap to the closest sample; others must match exactly.
    #[must_use]
    pub fn value_at(&self, name: &str, selectors: &[(&str, Value)]) -> Option<Value> {
        let mut index = Vec::with_capacity(self.dims.len());
        for (dim, samples) in self.dims.iter().zip(&self.coords) {
            let i = match selectors.iter().find(|(d, _)| *d == dim.as_str()) {
                Some((_, target)) => nearest(samples, target)?,
                None if samples.len() == 1 => 0,
                None => return None,
            };
            index.push(i);
        }
        self.get(name, &index)
    }

    /// Mean over the repeat dimension, ignoring `NaN` cells.
    #[must_use]
    pub fn mean_over_repeats(&self) -> Self {
        self.reduce_repeats(mean)
    }

    /// Population standard deviation over the repeat dimension, ignoring
    /// `NaN` cells.
    #[must_use]
    pub fn std_over_repeats(&self) -> Self {
        self.reduce_repeats(|xs| {
            let m = mean(xs);
            if m.is_nan() {
                return f64::NAN;
            }
            mean(&xs.iter().map(|x| (x - m) * (x - m)).collect::<Vec<_>>()).sqrt()
        })
    }

    fn reduce_repeats(&self, reduce: impl Fn(&[f64]) -> f64) -> Self {
        let Some(axis) = self.dim_index(REPEAT_DIM) else {
            return self.clone();
        };

        let mut dims = self.dims.clone();
        dims.remove(axis);
        let mut coords = self.coords.clone();
        coords.remove(axis);
        let mut shape = self.shape.clone();
        let depth = shape.remove(axis);
        let len = shape.iter().product();
        let strides = compute_strides(&self.shape);

        let slots = self
            .slots
            .iter()
            .map(|slot| {
                let mut data = slot.data.empty_like(len);
                for (flat, out_index) in GridIndices::new(shape.clone()).enumerate() {
                    let offsets: Vec<usize> = (0..depth)
                        .map(|k| {
                            let mut full = out_index.clone();
                            full.insert(axis, k);
                            offset_of(&full, &strides)
                        })
                        .collect();
                    match (&mut data, &slot.data) {
                        (SlotData::Numeric(dst), SlotData::Numeric(src)) => {
                            let xs: Vec<f64> = offsets
                                .iter()
                                .map(|&o| src[o])
                                .filter(|x| !x.is_nan())
                                .collect();
                            dst[flat] = reduce(&xs);
                        }
                        (SlotData::Reference(dst), SlotData::Reference(src)) => {
                            dst[flat] = offsets.iter().find_map(|&o| src[o].clone());
                        }
                        _ => {}
                    }
                }
                SlotArray {
                    name: slot.name.clone(),
                    result: slot.result.clone(),
                    data,
                }
            })
            .collect();

        Self {
            dims,
            coords,
            shape,
            results: self.results.clone(),
            slots,
        }
    }

    /// Concatenates `other` after `self` along `dim`.
    ///
    /// Both grids must have the same dimensions, slots, and identical
    /// coordinates on every other dimension.
    pub fn concat(&self, other: &Self, dim: &str) -> Result<Self, GridError> {
        let incompatible = |reason: String| GridError::IncompatibleGrids { reason };

        if self.dims != other.dims {
            return Err(incompatible(format!(
                "dimensions differ: {:?} vs {:?}",
                self.dims, other.dims
            )));
        }
        let axis = self
            .dim_index(dim)
            .ok_or_else(|| incompatible(format!("no dimension '{dim}'")))?;
        for (i, name) in self.dims.iter().enumerate() {
            if i != axis && self.coords[i] != other.coords[i] {
                return Err(incompatible(format!("coordinates of '{name}' differ")));
            }
        }
        let names: Vec<&str> = self.variable_names().collect();
        let other_names: Vec<&str> = other.variable_names().collect();
        if names != other_names {
            return Err(incompatible("result variables differ".to_string()));
        }

        let split = self.shape[axis];
        let mut shape = self.shape.clone();
        shape[axis] += other.shape[axis];
        let mut coords = self.coords.clone();
        coords[axis].extend(other.coords[axis].iter().cloned());
        let len = shape.iter().product();

        let own_strides = compute_strides(&self.shape);
        let other_strides = compute_strides(&other.shape);

        let slots = self
            .slots
            .iter()
            .zip(&other.slots)
            .map(|(mine, theirs)| {
                let mut data = mine.data.empty_like(len);
                for (flat, mut index) in GridIndices::new(shape.clone()).enumerate() {
                    if index[axis] < split {
                        data.copy_cell(flat, &mine.data, offset_of(&index, &own_strides));
                    } else {
                        index[axis] -= split;
                        data.copy_cell(flat, &theirs.data, offset_of(&index, &other_strides));
                    }
                }
                SlotArray {
                    name: mine.name.clone(),
                    result: mine.result.clone(),
                    data,
                }
            })
            .collect();

        Ok(Self {
            dims: self.dims.clone(),
            coords,
            shape,
            results: self.results.clone(),
            slots,
        })
    }
}

fn offset_of(index: &[usize], strides: &[usize]) -> usize {
    index.iter().zip(strides).map(|(i, s)| i * s).sum()
}

fn mean(xs: &[f64]) -> f64 {
    if xs.is_empty() {
        return f64::NAN;
    }
    #[allow(clippy::cast_precision_loss)]
    let n = xs.len() as f64;
    xs.iter().sum::<f64>() / n
}

fn nearest(samples: &[Value], target: &Value) -> Option<usize> {
    let distance = |v: &Value| -> Option<f64> {
        if let (Some(a), Some(b)) = (v.as_time(), target.as_time()) {
            #[allow(clippy::cast_precision_loss)]
            return Some((a - b).num_milliseconds().unsigned_abs() as f64);
        }
        match (v, target) {
            (Value::Float(_) | Value::Int(_), Value::Float(_) | Value::Int(_)) => {
                Some((v.as_float()? - target.as_float()?).abs())
            }
            _ => (v == target).then_some(0.0),
        }
    };
    samples
        .iter()
        .enumerate()
        .filter_map(|(i, v)| distance(v).map(|d| (i, d)))
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(i, _)| i)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::{SweepCoordinator, SweepSpecification};
    use crate::variable::SweepVariable;

    fn grid_for(repeats: usize, results: Vec<ResultVariable>) -> ResultGrid {
        let mut builder = SweepSpecification::builder("bench")
            .input(SweepVariable::float("x", 0.0, 1.0).unwrap())
            .level(2)
            .repeats(repeats);
        for rv in results {
            builder = builder.result(rv);
        }
        let spec = builder.build().unwrap();
        let coords = SweepCoordinator::new().build_grid(&spec).unwrap();
        ResultGrid::allocate(&coords, spec.result_vars())
    }

    #[test]
    fn test_allocate_fills_sentinels() {
        let grid = grid_for(
            1,
            vec![ResultVariable::scalar("t"), ResultVariable::reference("path")],
        );
        assert_eq!(grid.shape(), [2]);
        assert!(grid.numeric("t").unwrap().iter().all(|x| x.is_nan()));
        assert_eq!(grid.get("path", &[0]), Some(Value::Null));
    }

    #[test]
    fn test_set_and_get() {
        let mut grid = grid_for(1, vec![ResultVariable::scalar("t")]);
        grid.set("t", &[1], &Value::Float(2.5)).unwrap();
        assert_eq!(grid.get("t", &[1]), Some(Value::Float(2.5)));
        assert_eq!(grid.value_at("t", &[("x", Value::Float(0.9))]), Some(Value::Float(2.5)));
    }

    #[test]
    fn test_out_of_range_index_is_error() {
        let mut grid = grid_for(1, vec![ResultVariable::scalar("t")]);
        let err = grid.set("t", &[2], &Value::Float(1.0)).unwrap_err();
        assert!(matches!(err, GridError::IndexOutOfRange { .. }));
        let err = grid.set("t", &[0, 0], &Value::Float(1.0)).unwrap_err();
        assert!(matches!(err, GridError::IndexOutOfRange { .. }));
    }

    #[test]
    fn test_vector_split_into_components() {
        let mut grid = grid_for(1, vec![ResultVariable::vec3("v")]);
        grid.set("v", &[0], &Value::Vector(vec![1.0, 2.0, 3.0])).unwrap();
        assert_eq!(grid.numeric("v_y").unwrap()[0], 2.0);
        assert_eq!(grid.get("v", &[0]), Some(Value::Vector(vec![1.0, 2.0, 3.0])));

        let err = grid.set("v", &[0], &Value::Vector(vec![1.0])).unwrap_err();
        assert!(matches!(err, GridError::ResultTypeMismatch { .. }));
    }

    #[test]
    fn test_repeat_reductions() {
        let mut grid = grid_for(2, vec![ResultVariable::scalar("t")]);
        assert_eq!(grid.shape(), [2, 2]);
        grid.set("t", &[0, 0], &Value::Float(1.0)).unwrap();
        grid.set("t", &[0, 1], &Value::Float(3.0)).unwrap();
        grid.set("t", &[1, 0], &Value::Float(5.0)).unwrap();

        let mean = grid.mean_over_repeats();
        assert_eq!(mean.dims(), ["x"]);
        assert_eq!(mean.numeric("t").unwrap(), [2.0, 5.0]);

        let std = grid.std_over_repeats();
        assert_eq!(std.numeric("t").unwrap(), [1.0, 0.0]);

        assert!(grid.numeric("t").unwrap()[3].is_nan());
    }

    #[test]
    fn test_metadata_roundtrips_through_serde() {
        let mut grid = grid_for(1, vec![ResultVariable::vec3("v")]);
        grid.attach_metadata("v", "m/s", "velocity").unwrap();
        assert_eq!(grid.metadata("v_x").map(ResultVariable::unit_label), Some("m/s"));

        let json = serde_json::to_string(&grid).unwrap();
        let back: ResultGrid = serde_json::from_str(&json).unwrap();
        assert_eq!(back.metadata("v").map(ResultVariable::description_text), Some("velocity"));
        assert_eq!(back.shape(), grid.shape());
        assert!(back.numeric("v_z").unwrap()[0].is_nan());

        assert!(grid.attach_metadata("missing", "", "").is_err());
    }

    #[test]
    fn test_concat_along_dimension() {
        let mut a = grid_for(1, vec![ResultVariable::scalar("t")]);
        a.set("t", &[0], &Value::Float(1.0)).unwrap();
        a.set("t", &[1], &Value::Float(2.0)).unwrap();
        let joined = a.concat(&a, "x").unwrap();
        assert_eq!(joined.shape(), [4]);
        assert_eq!(joined.numeric("t").unwrap(), [1.0, 2.0, 1.0, 2.0]);
        assert_eq!(joined.coords("x").map(<[Value]>::len), Some(4));

        assert!(a.concat(&a, "nope").is_err());
    }

    #[test]
    fn test_rank_zero_indices() {
        let indices: Vec<Vec<usize>> = GridIndices::new(Vec::new()).collect();
        assert_eq!(indices, vec![Vec::<usize>::new()]);
        assert_eq!(GridIndices::new(vec![2, 3]).count(), 6);
    }
}
