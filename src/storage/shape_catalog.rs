//! Shape records
//!
//! Field datasets are sized to the watermark, so the true extent of each
//! cell is kept aside:
//! - `<field>_SHAPE`: per AOS-index tuple, the size vector last written
//! - `<aos>_AOS_SHAPE`: per parent tuple, the live element count of a
//!   struct array
//!
//! Both are int32 datasets filled with 0, and a shape whose first entry is
//! 0 means nothing is stored at that tuple.

use tracing::debug;

use crate::storage::chunk_store::ChunkStore;
use crate::storage::dataset::{ChunkPolicy, DatasetHandle, DatasetLayout, HandleCache};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::hyperslab::{AosPick, SelectionRequest};
use crate::storage::types::{ArrayData, Dims, RangeMode};

pub const SHAPE_SUFFIX: &str = "_SHAPE";
pub const AOS_SHAPE_SUFFIX: &str = "_AOS_SHAPE";

/// Name of the shape record of a tensorized field
pub fn shape_name(field: &str) -> String {
    format!("{}{}", field, SHAPE_SUFFIX)
}

/// Name of the count record of a tensorized struct array
pub fn aos_shape_name(aos: &str) -> String {
    format!("{}{}", aos, AOS_SHAPE_SUFFIX)
}

fn to_i32(values: &[usize], what: &str) -> StorageResult<Vec<i32>> {
    values
        .iter()
        .map(|&v| {
            i32::try_from(v).map_err(|_| StorageError::InvalidRequest(format!("{} extent {} too large", what, v)))
        })
        .collect()
}

fn grown(dims: &[usize], indices: &[usize]) -> Dims {
    dims.iter()
        .zip(indices)
        .map(|(&d, &i)| d.max(i + 1))
        .collect()
}

/// Reads and writes `_SHAPE` / `_AOS_SHAPE` records, caching their handles
#[derive(Debug)]
pub struct ShapeCatalog {
    handles: HandleCache,
    policy: ChunkPolicy,
}

impl ShapeCatalog {
    pub fn new(capacity: usize, policy: ChunkPolicy) -> Self {
        Self {
            handles: HandleCache::new(capacity),
            policy,
        }
    }

    /// Cached handle for an existing record, if the record exists
    fn existing<S: ChunkStore + ?Sized>(
        &mut self,
        store: &mut S,
        group: &str,
        name: &str,
    ) -> StorageResult<Option<&mut DatasetHandle>> {
        if !self.handles.contains(name) {
            if !store.dataset_exists(group, name) {
                return Ok(None);
            }
            let handle = DatasetHandle::open(store, group, name)?;
            self.handles.insert(handle);
        }
        Ok(self.handles.get_mut(name))
    }

    fn get_or_create<S: ChunkStore + ?Sized>(
        &mut self,
        store: &mut S,
        group: &str,
        name: &str,
        layout: &DatasetLayout,
    ) -> StorageResult<&mut DatasetHandle> {
        if !self.handles.contains(name) {
            let handle = if store.dataset_exists(group, name) {
                DatasetHandle::open(store, group, name)?
            } else {
                DatasetHandle::create(store, group, name, layout, &self.policy)?
            };
            self.handles.insert(handle);
        }
        self.handles
            .get_mut(name)
            .ok_or_else(|| StorageError::InvariantViolation(format!("shape handle '{}' lost from cache", name)))
    }

    fn read_record<S: ChunkStore + ?Sized>(
        &mut self,
        store: &mut S,
        group: &str,
        name: &str,
        indices: &[usize],
    ) -> StorageResult<Option<Vec<i32>>> {
        let Some(handle) = self.existing(store, group, name)? else {
            return Ok(None);
        };
        if handle.aos_rank() != indices.len() {
            return Err(StorageError::InvariantViolation(format!(
                "record '{}' has {} AOS axes, got {} indices",
                name,
                handle.aos_rank(),
                indices.len()
            )));
        }
        let outside = indices
            .iter()
            .zip(handle.watermark())
            .any(|(&i, &extent)| i >= extent);
        if outside {
            return Ok(None);
        }
        let aos: Vec<AosPick> = indices.iter().map(|&i| AosPick::At(i)).collect();
        let field_dims = Dims::from_slice(handle.field_watermark());
        let data = handle.read(
            store,
            &SelectionRequest {
                mode: RangeMode::Global,
                aos: &aos,
                field_dims: &field_dims,
                time_slice: None,
            },
        )?;
        match data {
            ArrayData::Int32(values) => Ok(Some(values)),
            other => Err(StorageError::InvariantViolation(format!(
                "record '{}' holds {} data",
                name,
                other.element_type()
            ))),
        }
    }

    fn write_record<S: ChunkStore + ?Sized>(
        &mut self,
        store: &mut S,
        group: &str,
        name: &str,
        layout: &DatasetLayout,
        indices: &[usize],
        values: Vec<i32>,
    ) -> StorageResult<()> {
        let aos_dims = grown(&layout.aos_dims, indices);
        let handle = self.get_or_create(store, group, name, layout)?;
        if handle.aos_rank() != indices.len() || handle.field_watermark() != layout.field_dims.as_slice() {
            return Err(StorageError::InvariantViolation(format!(
                "record '{}' layout changed: {} AOS axes, field axes {:?}",
                name,
                handle.aos_rank(),
                handle.field_watermark()
            )));
        }
        // keep AOS axes at least as large as already persisted
        let aos_dims: Dims = aos_dims
            .iter()
            .zip(handle.watermark())
            .map(|(&d, &w)| d.max(w))
            .collect();
        handle.extend(store, &layout.field_dims, &aos_dims)?;
        let aos: Vec<AosPick> = indices.iter().map(|&i| AosPick::At(i)).collect();
        handle.write(
            store,
            &SelectionRequest {
                mode: RangeMode::Global,
                aos: &aos,
                field_dims: &layout.field_dims,
                time_slice: None,
            },
            &ArrayData::Int32(values),
        )
    }

    /// Size vector stored for `field` at `indices`, or `None` when absent
    pub fn read_shape<S: ChunkStore + ?Sized>(
        &mut self,
        store: &mut S,
        group: &str,
        field: &str,
        indices: &[usize],
    ) -> StorageResult<Option<Dims>> {
        let record = self.read_record(store, group, &shape_name(field), indices)?;
        Ok(record.and_then(|values| match values.first() {
            None | Some(0) => None,
            Some(_) => Some(values.iter().map(|&v| v.max(0) as usize).collect()),
        }))
    }

    /// Record the size vector of `field` at `indices`
    pub fn write_shape<S: ChunkStore + ?Sized>(
        &mut self,
        store: &mut S,
        group: &str,
        field: &str,
        indices: &[usize],
        aos_dims: &[usize],
        shape: &[usize],
    ) -> StorageResult<()> {
        let layout = DatasetLayout::shape(shape.len(), aos_dims);
        let values = to_i32(shape, "shape")?;
        self.write_record(store, group, &shape_name(field), &layout, indices, values)
    }

    /// Live element count of struct array `aos` below `parent`; 0 when absent
    pub fn read_aos_count<S: ChunkStore + ?Sized>(
        &mut self,
        store: &mut S,
        group: &str,
        aos: &str,
        parent: &[usize],
    ) -> StorageResult<usize> {
        let record = self.read_record(store, group, &aos_shape_name(aos), parent)?;
        Ok(record
            .and_then(|values| values.first().copied())
            .map(|v| v.max(0) as usize)
            .unwrap_or(0))
    }

    pub fn write_aos_count<S: ChunkStore + ?Sized>(
        &mut self,
        store: &mut S,
        group: &str,
        aos: &str,
        parent: &[usize],
        parent_dims: &[usize],
        count: usize,
    ) -> StorageResult<()> {
        let layout = DatasetLayout::aos_count(parent_dims);
        let values = to_i32(&[count], "struct array")?;
        self.write_record(store, group, &aos_shape_name(aos), &layout, parent, values)
    }

    /// Add one element to a dynamic struct array; returns the previous count
    pub fn grow_aos_count<S: ChunkStore + ?Sized>(
        &mut self,
        store: &mut S,
        group: &str,
        aos: &str,
        parent: &[usize],
        parent_dims: &[usize],
    ) -> StorageResult<usize> {
        let previous = self.read_aos_count(store, group, aos, parent)?;
        self.write_aos_count(store, group, aos, parent, parent_dims, previous + 1)?;
        debug!("Struct array {} grew to {} element(s)", aos, previous + 1);
        Ok(previous)
    }

    pub fn is_cached(&self, name: &str) -> bool {
        self.handles.contains(name)
    }

    pub fn cached_names(&self) -> Vec<String> {
        self.handles.names()
    }

    /// Drop cached handles whose name matches `pred`
    pub fn evict_where(&mut self, pred: impl FnMut(&str) -> bool) -> usize {
        self.handles.evict_where(pred)
    }

    pub fn clear(&mut self) {
        self.handles.clear();
    }
}
