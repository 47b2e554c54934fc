//! Hyperslab selection
//!
//! Computes, for one request, the window in storage coordinates and the
//! matching window in the dense transfer buffer. Storage axes are the
//! struct-array axes followed by the field axes (outermost field axis
//! first, which is where the time axis lives for dynamic fields).

use crate::storage::chunk_store::Hyperslab;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::{Dims, RangeMode};

/// How one struct-array axis is addressed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AosPick {
    /// A single element
    At(usize),
    /// The first `n` elements, for bulk access across the axis
    Span(usize),
}

/// Inputs describing one transfer
#[derive(Debug, Clone)]
pub struct SelectionRequest<'a> {
    pub mode: RangeMode,
    pub aos: &'a [AosPick],
    /// Requested extents of the field axes, storage order
    pub field_dims: &'a [usize],
    /// In slice mode, the single position selected on the outermost
    /// field axis (the append position for writes, the resolved slice
    /// for reads)
    pub time_slice: Option<usize>,
}

/// Result of a selection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    /// Rank-0 dataset: transfer the single cell
    All,
    Window {
        storage: Hyperslab,
        buffer: Hyperslab,
    },
}

impl Selection {
    /// Number of cells transferred
    pub fn volume(&self) -> usize {
        match self {
            Selection::All => 1,
            Selection::Window { storage, .. } => storage.volume(),
        }
    }

    /// Storage window, with the rank-0 sentinel expanded
    pub fn storage(&self) -> Hyperslab {
        match self {
            Selection::All => Hyperslab::all(&[]),
            Selection::Window { storage, .. } => storage.clone(),
        }
    }

    /// Window in the dense transfer buffer
    ///
    /// The caller's buffer is row-major over `buffer().count` and holds
    /// exactly `buffer().volume()` cells, for writes and reads alike.
    pub fn buffer(&self) -> Hyperslab {
        match self {
            Selection::All => Hyperslab::all(&[]),
            Selection::Window { buffer, .. } => buffer.clone(),
        }
    }
}

/// Per-dataset selector; remembers the last buffer window
#[derive(Debug, Default)]
pub struct HyperslabSelector {
    buffer: Option<Hyperslab>,
    rebuilds: usize,
}

impl HyperslabSelector {
    pub fn new() -> Self {
        Self::default()
    }

    /// How many times the buffer window had to be rebuilt
    pub fn rebuilds(&self) -> usize {
        self.rebuilds
    }

    pub fn select(&mut self, req: &SelectionRequest<'_>) -> StorageResult<Selection> {
        if req.aos.is_empty() && req.field_dims.is_empty() {
            if req.time_slice.is_some() && req.mode == RangeMode::Slice {
                return Err(StorageError::InvalidRequest(
                    "time slice requested on a dataset without field axes".into(),
                ));
            }
            return Ok(Selection::All);
        }

        let mut offset = Dims::new();
        let mut count = Dims::new();
        for pick in req.aos {
            match *pick {
                AosPick::At(index) => {
                    offset.push(index);
                    count.push(1);
                }
                AosPick::Span(n) => {
                    offset.push(0);
                    count.push(n);
                }
            }
        }

        let slice = match (req.mode, req.time_slice) {
            (RangeMode::Slice, Some(position)) => {
                if req.field_dims.is_empty() {
                    return Err(StorageError::InvalidRequest(
                        "time slice requested on a field without axes".into(),
                    ));
                }
                Some(position)
            }
            _ => None,
        };

        for (axis, &extent) in req.field_dims.iter().enumerate() {
            match slice {
                Some(position) if axis == 0 => {
                    offset.push(position);
                    count.push(1);
                }
                _ => {
                    offset.push(0);
                    count.push(extent);
                }
            }
        }

        let reuse = self
            .buffer
            .as_ref()
            .map(|b| b.count == count)
            .unwrap_or(false);
        if !reuse {
            self.buffer = Some(Hyperslab::all(&count));
            self.rebuilds += 1;
        }
        let buffer = self
            .buffer
            .clone()
            .unwrap_or_else(|| Hyperslab::all(&count));

        Ok(Selection::Window {
            storage: Hyperslab::new(offset, count),
            buffer,
        })
    }
}
