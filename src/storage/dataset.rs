//! Dataset handles
//!
//! A `DatasetHandle` owns one store dataset for the duration of an action.
//! It tracks three sets of extents:
//! - current dims: the shape of the most recent request (may shrink)
//! - watermark dims: the persisted extents (never shrink)
//! - chunk dims: fixed when the dataset is created
//!
//! `HandleCache` is the bounded, name-keyed map the orchestrator keeps
//! handles in between calls.

use std::collections::HashMap;
use tracing::debug;

use crate::storage::chunk_store::{ChunkStore, DatasetKind, DatasetMeta};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::hyperslab::{HyperslabSelector, SelectionRequest};
use crate::storage::types::{storage_field_dims, storage_field_rank, ArrayData, Dims, ElementType, Scalar};

/// Default chunk byte budget (2 MiB)
pub const DEFAULT_CHUNK_BUDGET: usize = 2 * 1024 * 1024;

/// Default lower bound on field-axis chunk extents
pub const DEFAULT_MIN_FIELD_CHUNK: usize = 10;

/// Chunk sizing parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPolicy {
    pub budget_bytes: usize,
    pub min_field_chunk: usize,
}

impl Default for ChunkPolicy {
    fn default() -> Self {
        Self {
            budget_bytes: DEFAULT_CHUNK_BUDGET,
            min_field_chunk: DEFAULT_MIN_FIELD_CHUNK,
        }
    }
}

impl ChunkPolicy {
    /// Largest chunk volume in cells for an element of `element_size` bytes
    pub fn max_volume(&self, element_size: usize) -> usize {
        (self.budget_bytes / element_size.max(1)).max(1)
    }

    /// Chunk extents for a new dataset
    ///
    /// Starts from the full extents. When that is over budget and the
    /// field axes alone already exceed it, AOS axes drop to 1 and field
    /// axes are halved down to `min_field_chunk`; otherwise field axes stay
    /// whole and AOS axes are halved down to 1.
    pub fn chunk_dims(&self, aos_dims: &[usize], field_dims: &[usize], element_size: usize) -> Dims {
        let vmax = self.max_volume(element_size);
        let mut aos: Dims = aos_dims.iter().map(|&d| d.max(1)).collect();
        let mut field: Dims = field_dims.iter().map(|&d| d.max(1)).collect();
        let volume = |v: &Dims| v.iter().product::<usize>();

        if volume(&aos) * volume(&field) > vmax {
            if volume(&field) > vmax {
                aos.iter_mut().for_each(|a| *a = 1);
                while volume(&field) > vmax {
                    let mut changed = false;
                    for (axis, chunk) in field.iter_mut().enumerate() {
                        let floor = self.min_field_chunk.min(field_dims[axis]).max(1);
                        if *chunk > floor {
                            *chunk = (*chunk / 2).max(floor);
                            changed = true;
                        }
                    }
                    if !changed {
                        break;
                    }
                }
            } else {
                while volume(&aos) * volume(&field) > vmax {
                    let mut changed = false;
                    for chunk in aos.iter_mut() {
                        if *chunk > 1 {
                            *chunk /= 2;
                            changed = true;
                        }
                    }
                    if !changed {
                        break;
                    }
                }
            }
        }

        aos.into_iter().chain(field).collect()
    }
}

/// Everything needed to create a dataset
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetLayout {
    pub element_type: ElementType,
    pub kind: DatasetKind,
    /// Declared rank of the field
    pub field_rank: usize,
    /// Field axis extents, storage order
    pub field_dims: Dims,
    pub aos_dims: Dims,
    /// Chunk cache hint in bytes (0 = none)
    pub cache_bytes: usize,
}

impl DatasetLayout {
    /// Layout of an ordinary field from its caller-order size vector
    pub fn field(element_type: ElementType, size: &[usize], aos_dims: &[usize]) -> Self {
        Self {
            element_type,
            kind: DatasetKind::Field,
            field_rank: size.len(),
            field_dims: storage_field_dims(element_type, size),
            aos_dims: Dims::from_slice(aos_dims),
            cache_bytes: 0,
        }
    }

    /// Layout of a `_SHAPE` record for a field of `field_rank`
    pub fn shape(field_rank: usize, aos_dims: &[usize]) -> Self {
        Self {
            element_type: ElementType::Int32,
            kind: DatasetKind::Shape,
            field_rank: 1,
            field_dims: smallvec::smallvec![field_rank],
            aos_dims: Dims::from_slice(aos_dims),
            cache_bytes: 0,
        }
    }

    /// Layout of an `_AOS_SHAPE` record below `parent_dims`
    pub fn aos_count(parent_dims: &[usize]) -> Self {
        Self {
            element_type: ElementType::Int32,
            kind: DatasetKind::AosShape,
            field_rank: 1,
            field_dims: smallvec::smallvec![1],
            aos_dims: Dims::from_slice(parent_dims),
            cache_bytes: 0,
        }
    }

    /// Builder method: request a chunk cache
    pub fn cache(mut self, bytes: usize) -> Self {
        self.cache_bytes = bytes;
        self
    }

    fn fill(&self) -> Scalar {
        match self.kind {
            DatasetKind::Field => self.element_type.fill(),
            DatasetKind::Shape | DatasetKind::AosShape => Scalar::Int32(0),
        }
    }
}

/// One open dataset
#[derive(Debug)]
pub struct DatasetHandle {
    group: String,
    name: String,
    meta: DatasetMeta,
    current: Dims,
    selector: HyperslabSelector,
}

impl DatasetHandle {
    /// Create a dataset and return a handle to it
    pub fn create<S: ChunkStore + ?Sized>(
        store: &mut S,
        group: &str,
        name: &str,
        layout: &DatasetLayout,
        policy: &ChunkPolicy,
    ) -> StorageResult<Self> {
        let expected_axes = match layout.kind {
            DatasetKind::Field => storage_field_rank(layout.element_type, layout.field_rank),
            DatasetKind::Shape | DatasetKind::AosShape => 1,
        };
        if layout.field_dims.len() != expected_axes {
            return Err(StorageError::InvalidRequest(format!(
                "dataset '{}': {} field axes for declared rank {}",
                name,
                layout.field_dims.len(),
                layout.field_rank
            )));
        }

        let dims: Dims = layout
            .aos_dims
            .iter()
            .chain(layout.field_dims.iter())
            .copied()
            .collect();
        let chunk_dims = policy.chunk_dims(&layout.aos_dims, &layout.field_dims, layout.element_type.size());
        let meta = DatasetMeta {
            element_type: layout.element_type,
            kind: layout.kind,
            aos_rank: layout.aos_dims.len(),
            field_rank: layout.field_rank,
            dims: dims.clone(),
            chunk_dims,
            fill: layout.fill(),
            cache_bytes: layout.cache_bytes,
        };
        store
            .create_dataset(group, name, meta.clone())
            .map_err(|e| match e {
                StorageError::Storage { .. } => e,
                other => StorageError::storage(name, "create", other),
            })?;
        debug!(
            "Created dataset {} dims={:?} chunk={:?}",
            name,
            meta.dims.as_slice(),
            meta.chunk_dims.as_slice()
        );

        Ok(Self {
            group: group.to_string(),
            name: name.to_string(),
            meta,
            current: dims,
            selector: HyperslabSelector::new(),
        })
    }

    /// Re-attach to an existing dataset; a missing dataset is an error
    pub fn open<S: ChunkStore + ?Sized>(store: &mut S, group: &str, name: &str) -> StorageResult<Self> {
        let meta = store.dataset_meta(group, name)?;
        debug!("Opened dataset {} watermark={:?}", name, meta.dims.as_slice());
        Ok(Self {
            group: group.to_string(),
            name: name.to_string(),
            current: meta.dims.clone(),
            meta,
            selector: HyperslabSelector::new(),
        })
    }

    /// Reject reuse of this handle for a field of another type or rank
    pub fn check_compatible(&self, element_type: ElementType, field_rank: usize) -> StorageResult<()> {
        if self.meta.field_rank != field_rank {
            return Err(StorageError::InvariantViolation(format!(
                "dataset '{}' holds a rank {} field, request has rank {}",
                self.name, self.meta.field_rank, field_rank
            )));
        }
        if self.meta.element_type != element_type {
            return Err(StorageError::InvalidRequest(format!(
                "dataset '{}' holds {} data, request is {}",
                self.name, self.meta.element_type, element_type
            )));
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn element_type(&self) -> ElementType {
        self.meta.element_type
    }

    pub fn kind(&self) -> DatasetKind {
        self.meta.kind
    }

    pub fn rank(&self) -> usize {
        self.meta.rank()
    }

    pub fn aos_rank(&self) -> usize {
        self.meta.aos_rank
    }

    pub fn field_rank(&self) -> usize {
        self.meta.field_rank
    }

    /// Number of storage field axes
    pub fn field_axes(&self) -> usize {
        self.meta.rank() - self.meta.aos_rank
    }

    pub fn current_dims(&self) -> &[usize] {
        &self.current
    }

    pub fn watermark(&self) -> &[usize] {
        &self.meta.dims
    }

    /// Watermark restricted to the field axes
    pub fn field_watermark(&self) -> &[usize] {
        &self.meta.dims[self.meta.aos_rank..]
    }

    pub fn chunk_dims(&self) -> &[usize] {
        &self.meta.chunk_dims
    }

    pub fn selector(&self) -> &HyperslabSelector {
        &self.selector
    }

    /// Adopt a new working shape, growing the watermark where exceeded
    ///
    /// Returns true when the store had to be resized.
    pub fn extend<S: ChunkStore + ?Sized>(
        &mut self,
        store: &mut S,
        field_dims: &[usize],
        aos_dims: &[usize],
    ) -> StorageResult<bool> {
        let requested: Dims = aos_dims.iter().chain(field_dims.iter()).copied().collect();
        if requested.len() != self.rank() || aos_dims.len() != self.meta.aos_rank {
            return Err(StorageError::InvariantViolation(format!(
                "dataset '{}' has rank {} ({} AOS axes), extend asked for {} ({} AOS axes)",
                self.name,
                self.rank(),
                self.meta.aos_rank,
                requested.len(),
                aos_dims.len()
            )));
        }
        let grown: Dims = requested
            .iter()
            .zip(self.meta.dims.iter())
            .map(|(&r, &w)| r.max(w))
            .collect();
        let resized = self.raise_watermark(store, &grown)?;
        self.current = requested;
        Ok(resized)
    }

    /// Set the persisted extents; lowering any axis is an invariant violation
    pub fn raise_watermark<S: ChunkStore + ?Sized>(&mut self, store: &mut S, dims: &[usize]) -> StorageResult<bool> {
        if dims.len() != self.rank() {
            return Err(StorageError::InvariantViolation(format!(
                "dataset '{}' rank is fixed at {}, got {} extents",
                self.name,
                self.rank(),
                dims.len()
            )));
        }
        if let Some(axis) = (0..dims.len()).find(|&a| dims[a] < self.meta.dims[a]) {
            return Err(StorageError::InvariantViolation(format!(
                "dataset '{}' axis {} below watermark ({} < {})",
                self.name, axis, dims[axis], self.meta.dims[axis]
            )));
        }
        if dims == self.meta.dims.as_slice() {
            return Ok(false);
        }
        store.resize(&self.group, &self.name, dims).map_err(|e| match e {
            StorageError::InvariantViolation(_) | StorageError::Storage { .. } => e,
            other => StorageError::storage(self.name.as_str(), "resize", other),
        })?;
        debug!(
            "Resized dataset {} {:?} -> {:?}",
            self.name,
            self.meta.dims.as_slice(),
            dims
        );
        self.meta.dims = Dims::from_slice(dims);
        Ok(true)
    }

    /// Write a dense buffer into the selected window
    pub fn write<S: ChunkStore + ?Sized>(
        &mut self,
        store: &mut S,
        req: &SelectionRequest<'_>,
        data: &ArrayData,
    ) -> StorageResult<()> {
        let selection = self.selector.select(req)?;
        let buffer = selection.buffer();
        if data.len() != buffer.volume() {
            return Err(StorageError::InvalidRequest(format!(
                "dataset '{}': buffer holds {} elements, buffer window covers {}",
                self.name,
                data.len(),
                buffer.volume()
            )));
        }
        store.write_slab(&self.group, &self.name, &selection.storage(), data)
    }

    /// Read the selected window into a dense buffer
    pub fn read<S: ChunkStore + ?Sized>(&mut self, store: &mut S, req: &SelectionRequest<'_>) -> StorageResult<ArrayData> {
        let selection = self.selector.select(req)?;
        let data = store.read_slab(&self.group, &self.name, &selection.storage())?;
        let expected = selection.buffer().volume();
        if data.len() != expected {
            return Err(StorageError::storage(
                self.name.as_str(),
                "read",
                format!("store returned {} elements for a buffer window of {}", data.len(), expected),
            ));
        }
        Ok(data)
    }
}

/// Bounded map of open handles keyed by tensorized name
///
/// When full, inserting evicts the least recently used handle.
#[derive(Debug)]
pub struct HandleCache {
    capacity: usize,
    tick: u64,
    entries: HashMap<String, (u64, DatasetHandle)>,
}

impl HandleCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            tick: 0,
            entries: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut DatasetHandle> {
        self.tick += 1;
        let tick = self.tick;
        self.entries.get_mut(name).map(|(used, handle)| {
            *used = tick;
            handle
        })
    }

    /// Insert a handle; returns the name of the handle evicted to make room
    pub fn insert(&mut self, handle: DatasetHandle) -> Option<String> {
        let mut evicted = None;
        if self.entries.len() >= self.capacity && !self.entries.contains_key(handle.name()) {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, (used, _))| *used)
                .map(|(name, _)| name.clone());
            if let Some(name) = oldest {
                self.entries.remove(&name);
                debug!("Handle cache full, evicted {}", name);
                evicted = Some(name);
            }
        }
        self.tick += 1;
        self.entries.insert(handle.name().to_string(), (self.tick, handle));
        evicted
    }

    pub fn remove(&mut self, name: &str) -> Option<DatasetHandle> {
        self.entries.remove(name).map(|(_, h)| h)
    }

    /// Drop every handle matching `pred`; returns how many were dropped
    pub fn evict_where(&mut self, mut pred: impl FnMut(&str) -> bool) -> usize {
        let before = self.entries.len();
        self.entries.retain(|name, _| !pred(name));
        before - self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
