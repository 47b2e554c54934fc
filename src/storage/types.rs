//! Core data types for the tensorization engine
//!
//! This module defines the fundamental types used throughout the storage layer:
//! - `ElementType` / `Scalar` / `ArrayData`: element kinds, fill values and owned buffers
//! - `FieldRequest` / `FieldValue`: what a caller asks for and what it gets back
//! - `AccessMode`, `RangeMode`, `Interpolation`, `AosKind`, `TimeBasis`: per-action policy
//!
//! Size vectors follow the record model's convention: the fastest-varying
//! axis comes first and the time axis, when present, is the trailing entry.
//! Storage axes hold the size vector reversed, so buffers are byte-identical
//! in both views.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;

use crate::storage::error::{StorageError, StorageResult};

/// Axis extents; most datasets have well under eight axes
pub type Dims = SmallVec<[usize; 8]>;

/// Highest field rank a request may declare
pub const MAX_RANK: usize = 7;

/// Fill value for integer fields
pub const INT_FILL: i32 = -999_999_999;

/// Fill value for floating point fields
pub const FLOAT_FILL: f64 = -9.0e40;

/// Element kind of a field
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ElementType {
    Char,
    Int32,
    Float64,
    Complex128,
}

impl ElementType {
    /// Bytes per stored cell, used to size chunks
    pub fn size(&self) -> usize {
        match self {
            ElementType::Char => 1,
            ElementType::Int32 => 4,
            ElementType::Float64 => 8,
            ElementType::Complex128 => 16,
        }
    }

    /// Fill value of an ordinary field of this type
    pub fn fill(&self) -> Scalar {
        match self {
            ElementType::Char => Scalar::Char(String::new()),
            ElementType::Int32 => Scalar::Int32(INT_FILL),
            ElementType::Float64 => Scalar::Float64(FLOAT_FILL),
            ElementType::Complex128 => Scalar::Complex128(Complex64::new(FLOAT_FILL, FLOAT_FILL)),
        }
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElementType::Char => write!(f, "char"),
            ElementType::Int32 => write!(f, "int32"),
            ElementType::Float64 => write!(f, "float64"),
            ElementType::Complex128 => write!(f, "complex128"),
        }
    }
}

/// Double precision complex number
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Complex64 {
    pub re: f64,
    pub im: f64,
}

impl Complex64 {
    pub fn new(re: f64, im: f64) -> Self {
        Self { re, im }
    }
}

impl fmt::Display for Complex64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.re, self.im)
    }
}

/// A single cell value, used for fill values and attributes
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Scalar {
    Char(String),
    Int32(i32),
    Float64(f64),
    Complex128(Complex64),
}

impl Scalar {
    pub fn element_type(&self) -> ElementType {
        match self {
            Scalar::Char(_) => ElementType::Char,
            Scalar::Int32(_) => ElementType::Int32,
            Scalar::Float64(_) => ElementType::Float64,
            Scalar::Complex128(_) => ElementType::Complex128,
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Char(s) => write!(f, "{:?}", s),
            Scalar::Int32(v) => write!(f, "{}", v),
            Scalar::Float64(v) => write!(f, "{}", v),
            Scalar::Complex128(v) => write!(f, "{}", v),
        }
    }
}

/// Owned, typed element buffer crossing the engine boundary
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ArrayData {
    Char(Vec<String>),
    Int32(Vec<i32>),
    Float64(Vec<f64>),
    Complex128(Vec<Complex64>),
}

impl ArrayData {
    /// Buffer of `len` copies of `fill`
    pub fn filled(fill: &Scalar, len: usize) -> Self {
        match fill {
            Scalar::Char(s) => ArrayData::Char(vec![s.clone(); len]),
            Scalar::Int32(v) => ArrayData::Int32(vec![*v; len]),
            Scalar::Float64(v) => ArrayData::Float64(vec![*v; len]),
            Scalar::Complex128(v) => ArrayData::Complex128(vec![*v; len]),
        }
    }

    pub fn element_type(&self) -> ElementType {
        match self {
            ArrayData::Char(_) => ElementType::Char,
            ArrayData::Int32(_) => ElementType::Int32,
            ArrayData::Float64(_) => ElementType::Float64,
            ArrayData::Complex128(_) => ElementType::Complex128,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ArrayData::Char(v) => v.len(),
            ArrayData::Int32(v) => v.len(),
            ArrayData::Float64(v) => v.len(),
            ArrayData::Complex128(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True when every element equals `fill`
    pub fn is_all(&self, fill: &Scalar) -> bool {
        match (self, fill) {
            (ArrayData::Char(v), Scalar::Char(f)) => v.iter().all(|x| x == f),
            (ArrayData::Int32(v), Scalar::Int32(f)) => v.iter().all(|x| x == f),
            (ArrayData::Float64(v), Scalar::Float64(f)) => v.iter().all(|x| x == f),
            (ArrayData::Complex128(v), Scalar::Complex128(f)) => v.iter().all(|x| x == f),
            _ => false,
        }
    }

    /// Integer view, used for shape records
    pub fn as_int32(&self) -> Option<&[i32]> {
        match self {
            ArrayData::Int32(v) => Some(v),
            _ => None,
        }
    }

    /// Float view, used for time vectors
    pub fn as_float64(&self) -> Option<&[f64]> {
        match self {
            ArrayData::Float64(v) => Some(v),
            _ => None,
        }
    }

    /// Keep only the first `len` elements
    pub fn truncate(&mut self, len: usize) {
        match self {
            ArrayData::Char(v) => v.truncate(len),
            ArrayData::Int32(v) => v.truncate(len),
            ArrayData::Float64(v) => v.truncate(len),
            ArrayData::Complex128(v) => v.truncate(len),
        }
    }
}

/// Whether an action reads or writes its record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    Write,
}

/// Whole time-resolved arrays vs one time step per call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RangeMode {
    Global,
    Slice,
}

/// Policy for turning a query time into slice indices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Interpolation {
    Closest,
    Previous,
    Linear,
}

/// Static struct arrays have a caller-declared size; dynamic ones grow by
/// one element per time step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AosKind {
    Static,
    Dynamic,
}

/// How the record organises its time vectors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeBasis {
    /// One `time` vector at the record root
    Shared,
    /// Each dynamic branch carries its own time vector
    PerBranch,
    /// The record holds no time-dependent data
    Independent,
}

impl TimeBasis {
    pub fn from_flag(flag: i32) -> Option<Self> {
        match flag {
            1 => Some(TimeBasis::Shared),
            0 => Some(TimeBasis::PerBranch),
            2 => Some(TimeBasis::Independent),
            _ => None,
        }
    }

    pub fn flag(&self) -> i32 {
        match self {
            TimeBasis::Shared => 1,
            TimeBasis::PerBranch => 0,
            TimeBasis::Independent => 2,
        }
    }
}

/// Slice-mode read parameters supplied when an action opens
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SliceQuery {
    pub time: f64,
    pub interpolation: Interpolation,
}

impl SliceQuery {
    pub fn new(time: f64, interpolation: Interpolation) -> Self {
        Self {
            time,
            interpolation,
        }
    }
}

/// A read or write of one field at the current AOS position
#[derive(Debug, Clone, PartialEq)]
pub struct FieldRequest {
    /// Structural path relative to the innermost open struct array
    pub path: String,
    pub element_type: ElementType,
    /// Declared field rank
    pub rank: usize,
    /// Extents, fastest-varying first; ignored by reads
    pub size: Dims,
    /// Time vector path for time-dependent fields
    pub timebase: Option<String>,
}

impl FieldRequest {
    /// Request for reading a field of the given rank
    pub fn new(path: impl Into<String>, element_type: ElementType, rank: usize) -> Self {
        Self {
            path: path.into(),
            element_type,
            rank,
            size: Dims::new(),
            timebase: None,
        }
    }

    /// Request carrying the extents of the data being written
    pub fn sized(path: impl Into<String>, element_type: ElementType, size: &[usize]) -> Self {
        Self {
            path: path.into(),
            element_type,
            rank: size.len(),
            size: Dims::from_slice(size),
            timebase: None,
        }
    }

    /// Builder method: mark the field time-dependent
    pub fn timebase(mut self, timebase: impl Into<String>) -> Self {
        self.timebase = Some(timebase.into());
        self
    }

    pub fn is_time_dependent(&self) -> bool {
        self.timebase.is_some()
    }

    /// Reject ranks and type/rank combinations the engine does not store
    pub fn validate(&self) -> StorageResult<()> {
        if self.rank > MAX_RANK {
            return Err(StorageError::InvalidRequest(format!(
                "field '{}' has rank {}, maximum is {}",
                self.path, self.rank, MAX_RANK
            )));
        }
        if self.element_type == ElementType::Char && !(1..=2).contains(&self.rank) {
            return Err(StorageError::InvalidRequest(format!(
                "char field '{}' must have rank 1 or 2, got {}",
                self.path, self.rank
            )));
        }
        Ok(())
    }

    /// Check a write buffer against the declared size vector
    pub fn validate_data(&self, data: &ArrayData) -> StorageResult<()> {
        self.validate()?;
        if self.size.len() != self.rank {
            return Err(StorageError::InvalidRequest(format!(
                "field '{}': size vector has {} entries for rank {}",
                self.path,
                self.size.len(),
                self.rank
            )));
        }
        if data.element_type() != self.element_type {
            return Err(StorageError::InvalidRequest(format!(
                "field '{}' declared {} but got {} data",
                self.path,
                self.element_type,
                data.element_type()
            )));
        }
        let expected = match (self.element_type, self.rank) {
            (ElementType::Char, 1) => 1,
            (ElementType::Char, _) => self.size[0],
            _ => self.size.iter().product(),
        };
        if data.len() != expected {
            return Err(StorageError::InvalidRequest(format!(
                "field '{}': expected {} elements, got {}",
                self.path,
                expected,
                data.len()
            )));
        }
        Ok(())
    }
}

/// Storage field axes for a size vector
///
/// Numeric fields store the reversed size vector. A plain string is a
/// single opaque cell with no field axes; an array of strings keeps one
/// axis holding the string count.
pub fn storage_field_dims(element_type: ElementType, size: &[usize]) -> Dims {
    match element_type {
        ElementType::Char if size.len() <= 1 => Dims::new(),
        ElementType::Char => Dims::from_slice(&size[..1]),
        _ => size.iter().rev().copied().collect(),
    }
}

/// Number of storage field axes for a field of `rank`
pub fn storage_field_rank(element_type: ElementType, rank: usize) -> usize {
    match element_type {
        ElementType::Char if rank <= 1 => 0,
        ElementType::Char => 1,
        _ => rank,
    }
}

/// Size vector of data read back from storage field axes
pub fn size_from_storage(element_type: ElementType, rank: usize, field_dims: &[usize], data: &ArrayData) -> Dims {
    match (element_type, data) {
        (ElementType::Char, ArrayData::Char(strings)) => {
            let longest = strings.iter().map(|s| s.len()).max().unwrap_or(0);
            if rank <= 1 {
                smallvec::smallvec![longest]
            } else {
                smallvec::smallvec![strings.len(), longest]
            }
        }
        _ => field_dims.iter().rev().copied().collect(),
    }
}

/// Outcome of time interpolation on a read
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Interpolated {
    /// Data taken verbatim from one slice
    Exact,
    /// Element-wise blend of two bracketing slices
    Blended { alpha: f64 },
    /// Bracketing slices disagreed; the lower slice was returned
    Degraded,
}

/// Data returned by a successful read
#[derive(Debug, Clone, PartialEq)]
pub struct FieldValue {
    pub data: ArrayData,
    /// Extents, fastest-varying first
    pub size: Dims,
    pub interpolation: Interpolated,
}

impl FieldValue {
    pub fn rank(&self) -> usize {
        self.size.len()
    }
}
