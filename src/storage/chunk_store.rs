//! Chunked array store primitive
//!
//! The engine sees storage only through the `ChunkStore` trait: named
//! multi-axis arrays inside groups, every axis growable, fixed chunk dims,
//! hyperslab read/write and group attributes. `ZarrStore` (see
//! `zarr_store`) implements it over a Zarr V3 hierarchy.

use serde::{Deserialize, Serialize};

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::{ArrayData, Dims, ElementType, Scalar};

/// What a dataset holds
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DatasetKind {
    /// Ordinary field data
    Field,
    /// Per-tuple field shapes (`<field>_SHAPE`)
    Shape,
    /// Per-tuple struct-array counts (`<aos>_AOS_SHAPE`)
    AosShape,
}

/// Dataset description stored alongside the chunks
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatasetMeta {
    pub element_type: ElementType,
    pub kind: DatasetKind,
    /// Leading axes indexed by struct-array position
    pub aos_rank: usize,
    /// Rank the field was declared with (may differ from its axis count for strings)
    pub field_rank: usize,
    /// Current extents of every axis
    pub dims: Dims,
    pub chunk_dims: Dims,
    pub fill: Scalar,
    /// Chunk cache hint requested at creation, in bytes (0 = none)
    pub cache_bytes: usize,
}

impl DatasetMeta {
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Cells per chunk
    pub fn chunk_volume(&self) -> usize {
        self.chunk_dims.iter().product()
    }

    /// Check that chunk rank and fill type agree with the dataset
    pub fn validate(&self) -> StorageResult<()> {
        if self.chunk_dims.len() != self.dims.len() {
            return Err(StorageError::InvalidRequest(format!(
                "chunk rank {} does not match dataset rank {}",
                self.chunk_dims.len(),
                self.dims.len()
            )));
        }
        if self.fill.element_type() != self.element_type {
            return Err(StorageError::InvalidRequest(format!(
                "fill value type {} does not match dataset type {}",
                self.fill.element_type(),
                self.element_type
            )));
        }
        Ok(())
    }
}

/// A storage-space window: offset and count per axis
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hyperslab {
    pub offset: Dims,
    pub count: Dims,
}

impl Hyperslab {
    pub fn new(offset: Dims, count: Dims) -> Self {
        Self { offset, count }
    }

    /// Window covering every cell of `dims`
    pub fn all(dims: &[usize]) -> Self {
        Self {
            offset: dims.iter().map(|_| 0).collect(),
            count: Dims::from_slice(dims),
        }
    }

    pub fn rank(&self) -> usize {
        self.count.len()
    }

    /// Number of selected cells
    pub fn volume(&self) -> usize {
        self.count.iter().product()
    }
}

/// Primitive operation set of a chunked, extensible array store
pub trait ChunkStore {
    /// Create a group; returns false if it already existed
    fn create_group(&mut self, group: &str) -> StorageResult<bool>;

    fn group_exists(&self, group: &str) -> bool;

    /// Remove a group and all its datasets; returns false if absent
    fn delete_group(&mut self, group: &str) -> StorageResult<bool>;

    fn list_groups(&self) -> StorageResult<Vec<String>>;

    fn list_datasets(&mut self, group: &str) -> StorageResult<Vec<String>>;

    fn dataset_exists(&self, group: &str, name: &str) -> bool;

    /// Create a dataset; path-like or reserved names are refused
    fn create_dataset(&mut self, group: &str, name: &str, meta: DatasetMeta) -> StorageResult<()>;

    /// Metadata of an existing dataset; a missing dataset is an error
    fn dataset_meta(&mut self, group: &str, name: &str) -> StorageResult<DatasetMeta>;

    fn resize(&mut self, group: &str, name: &str, dims: &[usize]) -> StorageResult<()>;

    fn read_slab(&mut self, group: &str, name: &str, slab: &Hyperslab) -> StorageResult<ArrayData>;

    fn write_slab(&mut self, group: &str, name: &str, slab: &Hyperslab, data: &ArrayData) -> StorageResult<()>;

    fn set_attribute(&mut self, group: &str, key: &str, value: Scalar) -> StorageResult<()>;

    fn attribute(&mut self, group: &str, key: &str) -> StorageResult<Option<Scalar>>;

    /// Persist buffered changes
    fn flush(&mut self) -> StorageResult<()>;
}

/// Chunk store wrapper for tests: counts existence lookups per dataset
/// name and can drop the last element of every read
#[cfg(test)]
pub(crate) mod recording {
    use std::cell::RefCell;
    use std::collections::HashMap;

    use super::{ChunkStore, DatasetMeta, Hyperslab};
    use crate::storage::error::StorageResult;
    use crate::storage::types::{ArrayData, Scalar};

    pub struct RecordingStore<S> {
        pub inner: S,
        pub short_reads: bool,
        lookups: RefCell<HashMap<String, usize>>,
    }

    impl<S: ChunkStore> RecordingStore<S> {
        pub fn new(inner: S) -> Self {
            Self {
                inner,
                short_reads: false,
                lookups: RefCell::new(HashMap::new()),
            }
        }

        /// How often `dataset_exists` was asked about `name`
        pub fn lookups(&self, name: &str) -> usize {
            self.lookups.borrow().get(name).copied().unwrap_or(0)
        }
    }

    impl<S: ChunkStore> ChunkStore for RecordingStore<S> {
        fn create_group(&mut self, group: &str) -> StorageResult<bool> {
            self.inner.create_group(group)
        }

        fn group_exists(&self, group: &str) -> bool {
            self.inner.group_exists(group)
        }

        fn delete_group(&mut self, group: &str) -> StorageResult<bool> {
            self.inner.delete_group(group)
        }

        fn list_groups(&self) -> StorageResult<Vec<String>> {
            self.inner.list_groups()
        }

        fn list_datasets(&mut self, group: &str) -> StorageResult<Vec<String>> {
            self.inner.list_datasets(group)
        }

        fn dataset_exists(&self, group: &str, name: &str) -> bool {
            *self.lookups.borrow_mut().entry(name.to_string()).or_insert(0) += 1;
            self.inner.dataset_exists(group, name)
        }

        fn create_dataset(&mut self, group: &str, name: &str, meta: DatasetMeta) -> StorageResult<()> {
            self.inner.create_dataset(group, name, meta)
        }

        fn dataset_meta(&mut self, group: &str, name: &str) -> StorageResult<DatasetMeta> {
            self.inner.dataset_meta(group, name)
        }

        fn resize(&mut self, group: &str, name: &str, dims: &[usize]) -> StorageResult<()> {
            self.inner.resize(group, name, dims)
        }

        fn read_slab(&mut self, group: &str, name: &str, slab: &Hyperslab) -> StorageResult<ArrayData> {
            let mut data = self.inner.read_slab(group, name, slab)?;
            if self.short_reads && !data.is_empty() {
                data.truncate(data.len() - 1);
            }
            Ok(data)
        }

        fn write_slab(&mut self, group: &str, name: &str, slab: &Hyperslab, data: &ArrayData) -> StorageResult<()> {
            self.inner.write_slab(group, name, slab, data)
        }

        fn set_attribute(&mut self, group: &str, key: &str, value: Scalar) -> StorageResult<()> {
            self.inner.set_attribute(group, key, value)
        }

        fn attribute(&mut self, group: &str, key: &str) -> StorageResult<Option<Scalar>> {
            self.inner.attribute(group, key)
        }

        fn flush(&mut self) -> StorageResult<()> {
            self.inner.flush()
        }
    }
}
