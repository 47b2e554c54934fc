//! Tensor store orchestration
//!
//! Turns structural paths plus the struct-array position stack into
//! tensorized dataset names, and drives handles, shape records and time
//! slicing for every call of an action:
//!
//! ```text
//! begin_action ─┬─ begin_aos ─ set_aos_index ─ end_aos ─┬─ end_action
//!               └──────── read_field / write_field ─────┘
//! ```
//!
//! - Write path: name → get-or-create handle → extend → select → write → shape record
//! - Read path: name → missing memo → handle → time slice → shape record → select → read → blend
//!
//! Handles stay cached for the action and are released as soon as the
//! caller leaves a struct array while sitting on the last element at every
//! enclosing level.

use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::storage::action::{
    join, tensorize, Action, ActionArena, ActionId, AosFrame, OperationContext, AOS_MARKER, PATH_MARKER,
};
use crate::storage::chunk_store::ChunkStore;
use crate::storage::dataset::{ChunkPolicy, DatasetHandle, DatasetLayout, HandleCache};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::hyperslab::{AosPick, SelectionRequest};
use crate::storage::shape_catalog::{aos_shape_name, ShapeCatalog};
use crate::storage::time_slice::{blend, SliceSelection, TimeSliceResolver};
use crate::storage::types::{
    size_from_storage, storage_field_dims, storage_field_rank, AccessMode, AosKind, ArrayData, Dims, ElementType, FieldRequest,
    FieldValue, Interpolated, RangeMode, Scalar, SliceQuery, TimeBasis,
};

/// Reserved field recording how the record organises time
pub const HOMOGENEOUS_TIME_FIELD: &str = "ids_properties/homogeneous_time";

/// Shared time vector at the record root
pub const TIME_FIELD: &str = "time";

/// Version stamped on every record group
pub const BACKEND_VERSION: &str = "1.0";

/// Runtime configuration of the engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub chunk: ChunkPolicy,
    /// Bound on cached handles (fields and shape records each)
    pub max_open_handles: usize,
    /// Chunk cache hint recorded on field datasets
    pub chunk_cache_bytes: usize,
    /// Emit a warning when interpolation falls back to the lower slice
    pub warn_on_shape_mismatch: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk: ChunkPolicy::default(),
            max_open_handles: 4096,
            chunk_cache_bytes: 5 * 1024 * 1024, // 5MB
            warn_on_shape_mismatch: true,
        }
    }
}

/// Snapshot of the action state a single call needs
struct Cursor {
    op: OperationContext,
    path: String,
    positions: Dims,
    extents: Dims,
    /// Depth and chosen slices of the timed struct array, if entered
    timed: Option<(usize, Option<SliceSelection>)>,
}

impl Cursor {
    fn from_action(action: &Action) -> StorageResult<Self> {
        let timed = action.timed_level().map(|level| {
            let slice = action.frames().nth(level).and_then(|f| f.slice);
            (level, slice)
        });
        Ok(Self {
            op: action.operation()?.clone(),
            path: action.current_path().to_string(),
            positions: action.positions(),
            extents: action.extents(),
            timed,
        })
    }

    /// Struct-array extents large enough for the current positions
    fn aos_dims(&self) -> Dims {
        self.extents
            .iter()
            .zip(self.positions.iter())
            .map(|(&e, &p)| e.max(p + 1))
            .collect()
    }

    /// Whether a time-dependent field appends or reads along its own time axis
    fn slices_field_axis(&self, req: &FieldRequest) -> bool {
        self.op.range == RangeMode::Slice
            && req.is_time_dependent()
            && self.timed.is_none()
            && storage_field_rank(req.element_type, req.rank) > 0
    }
}

/// One cell read back from a field dataset
struct Cell {
    data: ArrayData,
    /// Extents actually read, storage order
    field_dims: Dims,
    /// Stored size vector (empty for cells without field axes)
    shape: Dims,
}

/// Position of the time entry in a caller-order size vector
fn time_entry(element_type: ElementType, rank: usize) -> usize {
    match element_type {
        ElementType::Char => 0,
        _ => rank.saturating_sub(1),
    }
}

fn aos_picks(positions: &[usize]) -> Vec<AosPick> {
    positions.iter().map(|&p| AosPick::At(p)).collect()
}

fn major_version(version: &str) -> &str {
    version.split('.').next().unwrap_or(version).trim()
}

/// Whether `name` lies below a struct array whose count record is known absent
fn under_missing_branch(action: &Action, name: &str) -> bool {
    name.match_indices(AOS_MARKER).any(|(at, marker)| {
        let aos = &name[..at + marker.len()];
        aos.len() < name.len() && action.is_missing(&aos_shape_name(aos))
    })
}

fn lost_handle(name: &str) -> StorageError {
    StorageError::InvariantViolation(format!("handle '{}' lost from cache", name))
}

/// Cached handle for `name`, opening it if the dataset exists
fn cached_or_open<'c, S: ChunkStore + ?Sized>(
    store: &mut S,
    fields: &'c mut HandleCache,
    group: &str,
    name: &str,
) -> StorageResult<Option<&'c mut DatasetHandle>> {
    if !fields.contains(name) {
        if !store.dataset_exists(group, name) {
            return Ok(None);
        }
        let handle = DatasetHandle::open(store, group, name)?;
        if let Some(evicted) = fields.insert(handle) {
            debug!("Evicted {} to open {}", evicted, name);
        }
    }
    Ok(fields.get_mut(name))
}

/// Read one field cell at `positions`, honouring its shape record
#[allow(clippy::too_many_arguments)]
fn read_cell<S: ChunkStore + ?Sized>(
    store: &mut S,
    fields: &mut HandleCache,
    shapes: &mut ShapeCatalog,
    group: &str,
    name: &str,
    element_type: ElementType,
    rank: usize,
    positions: &[usize],
    time_slice: Option<usize>,
) -> StorageResult<Option<Cell>> {
    let (aos_rank, field_axes, watermark) = match cached_or_open(store, fields, group, name)? {
        Some(handle) => {
            handle.check_compatible(element_type, rank)?;
            (handle.aos_rank(), handle.field_axes(), Dims::from_slice(handle.watermark()))
        }
        None => return Ok(None),
    };
    if aos_rank > positions.len() {
        return Err(StorageError::InvariantViolation(format!(
            "dataset '{}' has {} AOS axes but only {} struct arrays are open",
            name,
            aos_rank,
            positions.len()
        )));
    }
    let positions = &positions[..aos_rank];
    if positions.iter().zip(watermark.iter()).any(|(&p, &w)| p >= w) {
        return Ok(None);
    }

    let (shape, mut field_dims) = if field_axes > 0 {
        match shapes.read_shape(store, group, name, positions)? {
            Some(shape) => {
                let dims = storage_field_dims(element_type, &shape);
                (shape, dims)
            }
            None => return Ok(None),
        }
    } else {
        (Dims::new(), Dims::new())
    };
    if let Some(t) = time_slice {
        if field_dims.is_empty() || t >= field_dims[0] {
            return Ok(None);
        }
    }

    let picks = aos_picks(positions);
    let handle = fields.get_mut(name).ok_or_else(|| lost_handle(name))?;
    let data = handle.read(
        store,
        &SelectionRequest {
            mode: if time_slice.is_some() {
                RangeMode::Slice
            } else {
                RangeMode::Global
            },
            aos: &picks,
            field_dims: &field_dims,
            time_slice,
        },
    )?;
    if time_slice.is_some() {
        field_dims[0] = 1;
    }
    if field_axes == 0 && data.is_all(&element_type.fill()) {
        return Ok(None);
    }
    Ok(Some(Cell {
        data,
        field_dims,
        shape,
    }))
}

/// Orchestration facade over a chunk store
///
/// One top-level action may be in flight at a time; callers sharing a
/// store across threads must serialize actions themselves.
pub struct TensorStore<S: ChunkStore> {
    store: S,
    config: EngineConfig,
    fields: HandleCache,
    shapes: ShapeCatalog,
    actions: ActionArena,
    /// Time organisation per record group, cached after the first lookup
    time_basis: HashMap<String, TimeBasis>,
}

impl<S: ChunkStore> TensorStore<S> {
    pub fn new(store: S, config: EngineConfig) -> Self {
        Self {
            fields: HandleCache::new(config.max_open_handles),
            shapes: ShapeCatalog::new(config.max_open_handles, config.chunk),
            store,
            config,
            actions: ActionArena::new(),
            time_basis: HashMap::new(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn into_inner(self) -> S {
        self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn cursor(&self, id: ActionId) -> StorageResult<Cursor> {
        Cursor::from_action(self.actions.get(id)?)
    }

    // ========================================================================
    // Actions
    // ========================================================================

    /// Open a record group for reading or writing (OPEN_GROUP)
    ///
    /// An existing group must be stamped with the same major backend
    /// version; writes create and stamp a missing group.
    pub fn begin_action(
        &mut self,
        group: &str,
        access: AccessMode,
        range: RangeMode,
        slice: Option<SliceQuery>,
    ) -> StorageResult<ActionId> {
        if !self.actions.is_empty() {
            return Err(StorageError::InvalidRequest(
                "another action is already in flight on this store".into(),
            ));
        }
        if access == AccessMode::Read && range == RangeMode::Slice && slice.is_none() {
            return Err(StorageError::InvalidRequest(
                "slice reads need a query time and interpolation policy".into(),
            ));
        }
        if self.store.group_exists(group) {
            self.check_backend_version(group)?;
        } else if access == AccessMode::Write && self.store.create_group(group)? {
            self.store
                .set_attribute(group, "backend_version", Scalar::Char(BACKEND_VERSION.into()))?;
            self.store
                .set_attribute(group, "created_at", Scalar::Char(chrono::Utc::now().to_rfc3339()))?;
            info!("Created record group {}", group);
        }

        let id = self.actions.insert(Action::new(OperationContext {
            group: group.to_string(),
            access,
            range,
            slice,
        }));
        debug!("Began {:?} {:?} action on {}", access, range, group);
        Ok(id)
    }

    /// Refuse a record group stamped with another major backend version
    fn check_backend_version(&mut self, group: &str) -> StorageResult<()> {
        match self.store.attribute(group, "backend_version")? {
            Some(Scalar::Char(found)) if major_version(&found) == major_version(BACKEND_VERSION) => Ok(()),
            Some(Scalar::Char(found)) => Err(StorageError::storage(
                group,
                "open",
                format!("backend version {} is not compatible with {}", found, BACKEND_VERSION),
            )),
            Some(other) => Err(StorageError::storage(
                group,
                "open",
                format!("backend version stored as {} value {}", other.element_type(), other),
            )),
            None => {
                warn!("Record group {} carries no backend version", group);
                Ok(())
            }
        }
    }

    /// Finish an action, releasing every handle (CLOSE_GROUP)
    pub fn end_action(&mut self, id: ActionId) -> StorageResult<()> {
        let action = self.actions.remove(id)?;
        if action.depth() > 0 {
            warn!("Action closed with {} struct array(s) still entered", action.depth());
        }
        self.fields.clear();
        self.shapes.clear();
        let op = action.operation()?;
        if op.access == AccessMode::Write {
            self.store.flush()?;
        }
        debug!("Ended action on {}", op.group);
        Ok(())
    }

    /// Remove a whole record group
    pub fn delete_record(&mut self, group: &str) -> StorageResult<bool> {
        if !self.actions.is_empty() {
            return Err(StorageError::InvalidRequest(
                "cannot delete a record while an action is in flight".into(),
            ));
        }
        self.fields.clear();
        self.shapes.clear();
        self.time_basis.remove(group);
        let deleted = self.store.delete_group(group)?;
        if deleted {
            info!("Deleted record group {}", group);
        }
        Ok(deleted)
    }

    pub fn flush(&mut self) -> StorageResult<()> {
        self.store.flush()
    }

    // ========================================================================
    // Struct arrays
    // ========================================================================

    /// Enter the struct array at `path` (ENTER_AOS); returns its visible size
    ///
    /// Writes record the element count: the outermost dynamic array in
    /// slice mode grows by one element (the caller then addresses it as
    /// index 0), everything else, dynamic arrays nested below it included,
    /// stores `size`. Reads return the stored count, or 1 for a dynamic
    /// array resolved to a time slice. A branch whose count record is
    /// absent reads as empty and is not looked up again in this action.
    pub fn begin_aos(&mut self, id: ActionId, path: &str, kind: AosKind, size: usize) -> StorageResult<usize> {
        let cur = self.cursor(id)?;
        let group = cur.op.group.clone();
        let tensorized = format!("{}{}", join(&cur.path, path), AOS_MARKER);

        let frame = match cur.op.access {
            AccessMode::Write => {
                self.actions.get_mut(id)?.clear_missing(&aos_shape_name(&tensorized));
                if cur.op.range == RangeMode::Slice && kind == AosKind::Dynamic && cur.timed.is_none() {
                    let previous = self.shapes.grow_aos_count(
                        &mut self.store,
                        &group,
                        &tensorized,
                        &cur.positions,
                        &cur.aos_dims(),
                    )?;
                    AosFrame {
                        tensorized,
                        kind,
                        size: 1,
                        extent: previous + 1,
                        base: previous,
                        index: 0,
                        slice: None,
                    }
                } else {
                    self.shapes.write_aos_count(
                        &mut self.store,
                        &group,
                        &tensorized,
                        &cur.positions,
                        &cur.aos_dims(),
                        size,
                    )?;
                    AosFrame {
                        tensorized,
                        kind,
                        size,
                        extent: size,
                        base: 0,
                        index: 0,
                        slice: None,
                    }
                }
            }
            AccessMode::Read => {
                let record = aos_shape_name(&tensorized);
                let known_missing = {
                    let action = self.actions.get(id)?;
                    action.is_missing(&record) || under_missing_branch(action, &tensorized)
                };
                let count = if known_missing {
                    0
                } else if !self.shapes.is_cached(&record) && !self.store.dataset_exists(&group, &record) {
                    self.actions.get_mut(id)?.mark_missing(record);
                    0
                } else {
                    self.shapes
                        .read_aos_count(&mut self.store, &group, &tensorized, &cur.positions)?
                };
                let timed_here = cur.op.range == RangeMode::Slice
                    && kind == AosKind::Dynamic
                    && cur.timed.is_none()
                    && count > 0
                    && self.time_basis(&group)? != TimeBasis::Independent;
                if timed_here {
                    let query = cur
                        .op
                        .slice
                        .ok_or_else(|| StorageError::InvalidRequest("slice read without a query time".into()))?;
                    let selection = self
                        .aos_time_vector(&cur, &tensorized, count)?
                        .and_then(|times| TimeSliceResolver::new(query.interpolation).resolve(&times, query.time));
                    match selection {
                        Some(sel) => AosFrame {
                            tensorized,
                            kind,
                            size: 1,
                            extent: count,
                            base: sel.lower(),
                            index: 0,
                            slice: Some(sel),
                        },
                        None => AosFrame {
                            tensorized,
                            kind,
                            size: 0,
                            extent: count,
                            base: 0,
                            index: 0,
                            slice: None,
                        },
                    }
                } else {
                    AosFrame {
                        tensorized,
                        kind,
                        size: count,
                        extent: count,
                        base: 0,
                        index: 0,
                        slice: None,
                    }
                }
            }
        };

        let visible = frame.size;
        self.actions.get_mut(id)?.push(frame);
        Ok(visible)
    }

    /// Move the innermost struct array to another element
    pub fn set_aos_index(&mut self, id: ActionId, index: usize) -> StorageResult<()> {
        let frame = self
            .actions
            .get_mut(id)?
            .innermost_mut()
            .ok_or_else(|| StorageError::InvalidRequest("no struct array entered".into()))?;
        if index >= frame.size {
            return Err(StorageError::InvalidRequest(format!(
                "index {} outside struct array '{}' of size {}",
                index, frame.tensorized, frame.size
            )));
        }
        frame.index = index;
        Ok(())
    }

    /// Leave the innermost struct array (LEAVE_AOS)
    pub fn end_aos(&mut self, id: ActionId) -> StorageResult<()> {
        let action = self.actions.get_mut(id)?;
        let release = action.all_at_last();
        let frame = action.pop()?;
        if release {
            let prefix = format!("{}{}", frame.tensorized, PATH_MARKER);
            let own = aos_shape_name(&frame.tensorized);
            let under = |name: &str| name.starts_with(&prefix) || name == own;
            let released = self.fields.evict_where(under) + self.shapes.evict_where(under);
            debug!("Released {} handle(s) under {}", released, frame.tensorized);
        }
        Ok(())
    }

    // ========================================================================
    // Fields
    // ========================================================================

    /// Write one field at the current position (WRITE_FIELD)
    pub fn write_field(&mut self, id: ActionId, req: &FieldRequest, data: &ArrayData) -> StorageResult<()> {
        req.validate_data(data)?;
        let cur = self.cursor(id)?;
        if cur.op.access != AccessMode::Write {
            return Err(StorageError::InvalidRequest(format!(
                "field '{}' written in a read action",
                req.path
            )));
        }
        let name = join(&cur.path, &req.path);
        if req.size.iter().any(|&s| s == 0) {
            debug!("Skipping empty write of {}", name);
            return Ok(());
        }

        let group = cur.op.group.clone();
        let field_dims = storage_field_dims(req.element_type, &req.size);
        let aos_dims = cur.aos_dims();
        let time_idx = time_entry(req.element_type, req.rank);
        let appending = cur.slices_field_axis(req);
        if appending && field_dims[0] != 1 {
            return Err(StorageError::InvalidRequest(format!(
                "slice write of '{}' carries {} time steps, expected 1",
                name, field_dims[0]
            )));
        }

        // tuples keep their own slice count in the shape record
        let append_at = if appending {
            self.shapes
                .read_shape(&mut self.store, &group, &name, &cur.positions)?
                .and_then(|shape| shape.get(time_idx).copied())
                .unwrap_or(0)
        } else {
            0
        };

        if !self.fields.contains(&name) {
            let handle = if self.store.dataset_exists(&group, &name) {
                DatasetHandle::open(&mut self.store, &group, &name)?
            } else {
                let layout =
                    DatasetLayout::field(req.element_type, &req.size, &aos_dims).cache(self.config.chunk_cache_bytes);
                DatasetHandle::create(&mut self.store, &group, &name, &layout, &self.config.chunk)?
            };
            if let Some(evicted) = self.fields.insert(handle) {
                debug!("Evicted {} to open {}", evicted, name);
            }
        }
        let handle = self.fields.get_mut(&name).ok_or_else(|| lost_handle(&name))?;
        handle.check_compatible(req.element_type, req.rank)?;
        if handle.aos_rank() != aos_dims.len() {
            return Err(StorageError::InvariantViolation(format!(
                "dataset '{}' has {} AOS axes, {} struct arrays are open",
                name,
                handle.aos_rank(),
                aos_dims.len()
            )));
        }

        let mut extent = field_dims.clone();
        if appending {
            extent[0] = append_at + 1;
        }
        handle.extend(&mut self.store, &extent, &aos_dims)?;
        let picks = aos_picks(&cur.positions);
        handle.write(
            &mut self.store,
            &SelectionRequest {
                mode: if appending {
                    RangeMode::Slice
                } else {
                    RangeMode::Global
                },
                aos: &picks,
                field_dims: &field_dims,
                time_slice: appending.then_some(append_at),
            },
            data,
        )?;

        if !field_dims.is_empty() {
            let mut shape = req.size.clone();
            if appending {
                shape[time_idx] = append_at + 1;
            }
            self.shapes
                .write_shape(&mut self.store, &group, &name, &cur.positions, &aos_dims, &shape)?;
        }

        self.actions.get_mut(id)?.clear_missing(&name);
        if name == tensorize(HOMOGENEOUS_TIME_FIELD) {
            if let Some(basis) = data
                .as_int32()
                .and_then(|v| v.first().copied())
                .and_then(TimeBasis::from_flag)
            {
                self.time_basis.insert(group, basis);
            }
        }
        Ok(())
    }

    /// Read one field at the current position (READ_FIELD)
    ///
    /// `Ok(None)` means nothing is stored there.
    pub fn read_field(&mut self, id: ActionId, req: &FieldRequest) -> StorageResult<Option<FieldValue>> {
        req.validate()?;
        let cur = self.cursor(id)?;
        let group = cur.op.group.clone();
        let name = join(&cur.path, &req.path);

        {
            let action = self.actions.get(id)?;
            if action.is_missing(&name) || under_missing_branch(action, &name) {
                return Ok(None);
            }
        }
        if !self.fields.contains(&name) && !self.store.dataset_exists(&group, &name) {
            self.actions.get_mut(id)?.mark_missing(name);
            return Ok(None);
        }

        let mut time_selection = None;
        if cur.slices_field_axis(req) && self.time_basis(&group)? != TimeBasis::Independent {
            let query = cur
                .op
                .slice
                .ok_or_else(|| StorageError::InvalidRequest("slice read without a query time".into()))?;
            let Some(times) = self.field_time_vector(&cur, req)? else {
                return Ok(None);
            };
            let Some(selection) = TimeSliceResolver::new(query.interpolation).resolve(&times, query.time) else {
                return Ok(None);
            };
            time_selection = Some(selection);
        }

        let Some(lower) = read_cell(
            &mut self.store,
            &mut self.fields,
            &mut self.shapes,
            &group,
            &name,
            req.element_type,
            req.rank,
            &cur.positions,
            time_selection.map(|s| s.lower()),
        )?
        else {
            return Ok(None);
        };

        let mut value = FieldValue {
            size: size_from_storage(req.element_type, req.rank, &lower.field_dims, &lower.data),
            data: lower.data,
            interpolation: Interpolated::Exact,
        };

        // upper bracket: along the field's own time axis, or along the timed struct array
        let upper = match (time_selection, cur.timed) {
            (Some(SliceSelection::Bracket { upper, alpha, .. }), _) => Some((cur.positions.clone(), Some(upper), alpha)),
            (None, Some((level, Some(SliceSelection::Bracket { upper, alpha, .. }))))
                if cur.op.range == RangeMode::Slice =>
            {
                let mut positions = cur.positions.clone();
                positions[level] = upper;
                Some((positions, None, alpha))
            }
            _ => None,
        };

        if let Some((positions, slice, alpha)) = upper {
            let upper_cell = read_cell(
                &mut self.store,
                &mut self.fields,
                &mut self.shapes,
                &group,
                &name,
                req.element_type,
                req.rank,
                &positions,
                slice,
            )?;
            match upper_cell {
                Some(cell) if cell.shape == lower.shape => match blend(&value.data, &cell.data, alpha) {
                    Some(blended) => {
                        value.data = blended;
                        value.interpolation = Interpolated::Blended { alpha };
                    }
                    None => debug!("Not blending {} field {}", req.element_type, name),
                },
                _ => {
                    if self.config.warn_on_shape_mismatch {
                        warn!(
                            "Bracketing slices of {} differ in shape; returning the lower slice",
                            name
                        );
                    }
                    value.interpolation = Interpolated::Degraded;
                }
            }
        }

        Ok(Some(value))
    }

    // ========================================================================
    // Time bases
    // ========================================================================

    /// Time organisation of a record, read once from its reserved flag
    pub fn time_basis(&mut self, group: &str) -> StorageResult<TimeBasis> {
        if let Some(basis) = self.time_basis.get(group) {
            return Ok(*basis);
        }
        let cell = read_cell(
            &mut self.store,
            &mut self.fields,
            &mut self.shapes,
            group,
            &tensorize(HOMOGENEOUS_TIME_FIELD),
            ElementType::Int32,
            0,
            &[],
            None,
        )?;
        let flag = cell.and_then(|c| c.data.as_int32().and_then(|v| v.first().copied()));
        let basis = match flag.map(|f| (f, TimeBasis::from_flag(f))) {
            Some((_, Some(basis))) => basis,
            Some((f, None)) => {
                warn!("Record {} has unknown time flag {}; assuming a shared time basis", group, f);
                TimeBasis::Shared
            }
            None => {
                warn!("Record {} has no time flag; assuming a shared time basis", group);
                TimeBasis::Shared
            }
        };
        self.time_basis.insert(group.to_string(), basis);
        Ok(basis)
    }

    /// Time vector governing a dynamic field outside any timed struct array
    fn field_time_vector(&mut self, cur: &Cursor, req: &FieldRequest) -> StorageResult<Option<Vec<f64>>> {
        let group = cur.op.group.as_str();
        let name = match self.time_basis(group)? {
            TimeBasis::Shared => TIME_FIELD.to_string(),
            TimeBasis::PerBranch | TimeBasis::Independent => match req.timebase.as_deref() {
                Some(tb) if tb.starts_with('/') => tensorize(tb),
                Some(tb) => join(&cur.path, tb),
                None => return Ok(None),
            },
        };
        let cell = read_cell(
            &mut self.store,
            &mut self.fields,
            &mut self.shapes,
            group,
            &name,
            ElementType::Float64,
            1,
            &cur.positions,
            None,
        )?;
        Ok(cell.and_then(|c| c.data.as_float64().map(|v| v.to_vec())))
    }

    /// Time vector of a dynamic struct array holding `count` elements
    fn aos_time_vector(&mut self, cur: &Cursor, aos: &str, count: usize) -> StorageResult<Option<Vec<f64>>> {
        let group = cur.op.group.as_str();
        match self.time_basis(group)? {
            TimeBasis::Independent => Ok(None),
            TimeBasis::Shared => {
                let cell = read_cell(
                    &mut self.store,
                    &mut self.fields,
                    &mut self.shapes,
                    group,
                    TIME_FIELD,
                    ElementType::Float64,
                    1,
                    &[],
                    None,
                )?;
                Ok(cell.and_then(|c| {
                    c.data.as_float64().map(|v| {
                        let mut times = v.to_vec();
                        times.truncate(count);
                        times
                    })
                }))
            }
            TimeBasis::PerBranch => {
                let name = format!("{}{}{}", aos, PATH_MARKER, TIME_FIELD);
                let Some(handle) = cached_or_open(&mut self.store, &mut self.fields, group, &name)? else {
                    return Ok(None);
                };
                handle.check_compatible(ElementType::Float64, 0)?;
                let level = cur.positions.len();
                if handle.aos_rank() != level + 1 {
                    return Err(StorageError::InvariantViolation(format!(
                        "time vector '{}' has {} AOS axes, expected {}",
                        name,
                        handle.aos_rank(),
                        level + 1
                    )));
                }
                let watermark = handle.watermark();
                if cur.positions.iter().zip(watermark).any(|(&p, &w)| p >= w) {
                    return Ok(None);
                }
                let n = count.min(watermark[level]);
                let mut picks = aos_picks(&cur.positions);
                picks.push(AosPick::Span(n));
                let data = handle.read(
                    &mut self.store,
                    &SelectionRequest {
                        mode: RangeMode::Global,
                        aos: &picks,
                        field_dims: &[],
                        time_slice: None,
                    },
                )?;
                Ok(data.as_float64().map(|v| v.to_vec()))
            }
        }
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    /// Names of every cached handle (fields and shape records)
    pub fn cached_handles(&self) -> Vec<String> {
        let mut names = self.fields.names();
        names.extend(self.shapes.cached_names());
        names.sort();
        names
    }

    pub fn is_cached(&self, name: &str) -> bool {
        self.fields.contains(name) || self.shapes.is_cached(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::chunk_store::recording::RecordingStore;
    use crate::storage::zarr_store::{CompressionType, ZarrStore};
    use crate::storage::types::{Complex64, Interpolation};
    use tempfile::tempdir;

    const GROUP: &str = "core_profiles";

    fn create_test_store() -> TensorStore<ZarrStore> {
        TensorStore::new(ZarrStore::memory(), EngineConfig::default())
    }

    fn write(ts: &mut TensorStore<ZarrStore>, range: RangeMode) -> ActionId {
        ts.begin_action(GROUP, AccessMode::Write, range, None).unwrap()
    }

    fn read(ts: &mut TensorStore<ZarrStore>) -> ActionId {
        ts.begin_action(GROUP, AccessMode::Read, RangeMode::Global, None).unwrap()
    }

    fn read_slice(ts: &mut TensorStore<ZarrStore>, time: f64, policy: Interpolation) -> ActionId {
        ts.begin_action(GROUP, AccessMode::Read, RangeMode::Slice, Some(SliceQuery::new(time, policy)))
            .unwrap()
    }

    fn floats(size: &[usize]) -> ArrayData {
        ArrayData::Float64((0..size.iter().product::<usize>()).map(|v| v as f64 * 0.5).collect())
    }

    fn set_time_flag(ts: &mut TensorStore<ZarrStore>, id: ActionId, basis: TimeBasis) {
        ts.write_field(
            id,
            &FieldRequest::sized(HOMOGENEOUS_TIME_FIELD, ElementType::Int32, &[]),
            &ArrayData::Int32(vec![basis.flag()]),
        )
        .unwrap();
    }

    #[test]
    fn test_round_trip_all_types_and_ranks() {
        let mut ts = create_test_store();
        let mut cases: Vec<(String, FieldRequest, ArrayData)> = Vec::new();
        for rank in 0..=7 {
            let size: Vec<usize> = (0..rank).map(|a| if a % 2 == 0 { 2 } else { 3 }).collect();
            let n: usize = size.iter().product();
            let path = format!("f64_r{}", rank);
            cases.push((path.clone(), FieldRequest::sized(&path, ElementType::Float64, &size), floats(&size)));
            let path = format!("i32_r{}", rank);
            cases.push((
                path.clone(),
                FieldRequest::sized(&path, ElementType::Int32, &size),
                ArrayData::Int32((0..n as i32).collect()),
            ));
            let path = format!("c128_r{}", rank);
            cases.push((
                path.clone(),
                FieldRequest::sized(&path, ElementType::Complex128, &size),
                ArrayData::Complex128((0..n).map(|v| Complex64::new(v as f64, -(v as f64))).collect()),
            ));
        }
        cases.push((
            "label".into(),
            FieldRequest::sized("label", ElementType::Char, &[5]),
            ArrayData::Char(vec!["hello".into()]),
        ));
        cases.push((
            "names".into(),
            FieldRequest::sized("names", ElementType::Char, &[3, 4]),
            ArrayData::Char(vec!["ab".into(), "abcd".into(), "c".into()]),
        ));

        // at the root and inside element 1 of a struct array
        let id = write(&mut ts, RangeMode::Global);
        for (_, req, data) in &cases {
            ts.write_field(id, req, data).unwrap();
        }
        ts.begin_aos(id, "profiles_1d", AosKind::Static, 2).unwrap();
        ts.set_aos_index(id, 1).unwrap();
        for (_, req, data) in &cases {
            ts.write_field(id, req, data).unwrap();
        }
        ts.end_aos(id).unwrap();
        ts.end_action(id).unwrap();

        let id = read(&mut ts);
        for (path, req, data) in &cases {
            let value = ts
                .read_field(id, &FieldRequest::new(path.as_str(), req.element_type, req.rank))
                .unwrap()
                .unwrap_or_else(|| panic!("{} missing at root", path));
            assert_eq!(&value.data, data, "{}", path);
            assert_eq!(value.size, req.size, "{}", path);
            assert_eq!(value.interpolation, Interpolated::Exact);
        }
        assert_eq!(ts.begin_aos(id, "profiles_1d", AosKind::Static, 0).unwrap(), 2);
        ts.set_aos_index(id, 1).unwrap();
        for (path, req, data) in &cases {
            let value = ts
                .read_field(id, &FieldRequest::new(path.as_str(), req.element_type, req.rank))
                .unwrap()
                .unwrap_or_else(|| panic!("{} missing in struct array", path));
            assert_eq!(&value.data, data, "{}", path);
            assert_eq!(value.size, req.size, "{}", path);
        }
        // element 0 was never written
        ts.set_aos_index(id, 0).unwrap();
        assert!(ts
            .read_field(id, &FieldRequest::new("f64_r2", ElementType::Float64, 2))
            .unwrap()
            .is_none());
        assert!(ts
            .read_field(id, &FieldRequest::new("i32_r0", ElementType::Int32, 0))
            .unwrap()
            .is_none());
        ts.end_aos(id).unwrap();
        ts.end_action(id).unwrap();
    }

    #[test]
    fn test_ragged_shapes_across_struct_array() {
        let mut ts = create_test_store();
        let lengths = [3usize, 7, 1];
        let id = write(&mut ts, RangeMode::Global);
        ts.begin_aos(id, "ion", AosKind::Static, lengths.len()).unwrap();
        for (i, &len) in lengths.iter().enumerate() {
            ts.set_aos_index(id, i).unwrap();
            ts.write_field(
                id,
                &FieldRequest::sized("density", ElementType::Float64, &[len]),
                &ArrayData::Float64(vec![i as f64; len]),
            )
            .unwrap();
        }
        ts.end_aos(id).unwrap();
        ts.end_action(id).unwrap();

        assert!(ts.store().dataset_exists(GROUP, "ion[]&density_SHAPE"));
        let meta = ts.store_mut().dataset_meta(GROUP, "ion[]&density").unwrap();
        assert_eq!(meta.dims.as_slice(), &[3, 7]);

        let id = read(&mut ts);
        assert_eq!(ts.begin_aos(id, "ion", AosKind::Static, 0).unwrap(), 3);
        for (i, &len) in lengths.iter().enumerate() {
            ts.set_aos_index(id, i).unwrap();
            let value = ts
                .read_field(id, &FieldRequest::new("density", ElementType::Float64, 1))
                .unwrap()
                .unwrap();
            assert_eq!(value.size.as_slice(), &[len]);
            assert_eq!(value.data, ArrayData::Float64(vec![i as f64; len]));
        }
        ts.end_aos(id).unwrap();
        ts.end_action(id).unwrap();
    }

    #[test]
    fn test_growth_only_watermark() {
        let mut ts = create_test_store();
        for size in [[2usize, 3], [2, 5], [2, 4]] {
            let id = write(&mut ts, RangeMode::Global);
            ts.write_field(id, &FieldRequest::sized("psi", ElementType::Float64, &size), &floats(&size))
                .unwrap();
            ts.end_action(id).unwrap();

            let id = read(&mut ts);
            let value = ts
                .read_field(id, &FieldRequest::new("psi", ElementType::Float64, 2))
                .unwrap()
                .unwrap();
            assert_eq!(value.size.as_slice(), &size);
            assert_eq!(value.data, floats(&size));
            ts.end_action(id).unwrap();
        }
        // storage axes hold the size vector reversed
        let meta = ts.store_mut().dataset_meta(GROUP, "psi").unwrap();
        assert_eq!(meta.dims.as_slice(), &[5, 2]);
    }

    #[test]
    fn test_dynamic_struct_array_slice_appends() {
        let mut ts = create_test_store();
        let n = 5;
        for step in 0..n {
            let id = write(&mut ts, RangeMode::Slice);
            if step == 0 {
                set_time_flag(&mut ts, id, TimeBasis::PerBranch);
            }
            assert_eq!(ts.begin_aos(id, "time_slice", AosKind::Dynamic, 0).unwrap(), 1);
            ts.write_field(
                id,
                &FieldRequest::sized("time", ElementType::Float64, &[]),
                &ArrayData::Float64(vec![step as f64]),
            )
            .unwrap();
            ts.write_field(
                id,
                &FieldRequest::sized("psi", ElementType::Float64, &[step + 1]),
                &ArrayData::Float64(vec![step as f64; step + 1]),
            )
            .unwrap();
            ts.end_aos(id).unwrap();
            ts.end_action(id).unwrap();

            let id = read(&mut ts);
            assert_eq!(ts.begin_aos(id, "time_slice", AosKind::Dynamic, 0).unwrap(), step + 1);
            ts.end_aos(id).unwrap();
            ts.end_action(id).unwrap();
        }

        let id = read(&mut ts);
        assert_eq!(ts.begin_aos(id, "time_slice", AosKind::Dynamic, 0).unwrap(), n);
        for step in 0..n {
            ts.set_aos_index(id, step).unwrap();
            let psi = ts
                .read_field(id, &FieldRequest::new("psi", ElementType::Float64, 1))
                .unwrap()
                .unwrap();
            assert_eq!(psi.data, ArrayData::Float64(vec![step as f64; step + 1]));
        }
        ts.end_aos(id).unwrap();
        ts.end_action(id).unwrap();
    }

    #[test]
    fn test_slice_read_of_dynamic_struct_array() {
        let mut ts = create_test_store();
        let id = write(&mut ts, RangeMode::Global);
        set_time_flag(&mut ts, id, TimeBasis::PerBranch);
        ts.begin_aos(id, "time_slice", AosKind::Dynamic, 4).unwrap();
        for i in 0..4 {
            ts.set_aos_index(id, i).unwrap();
            ts.write_field(id, &FieldRequest::sized("time", ElementType::Float64, &[]), &ArrayData::Float64(vec![i as f64]))
                .unwrap();
            ts.write_field(
                id,
                &FieldRequest::sized("ip", ElementType::Int32, &[]),
                &ArrayData::Int32(vec![10 * (i as i32 + 1)]),
            )
            .unwrap();
        }
        ts.end_aos(id).unwrap();
        ts.end_action(id).unwrap();

        for (policy, expected) in [(Interpolation::Closest, 20), (Interpolation::Previous, 20)] {
            let id = read_slice(&mut ts, 1.4, policy);
            assert_eq!(ts.begin_aos(id, "time_slice", AosKind::Dynamic, 0).unwrap(), 1);
            let ip = ts.read_field(id, &FieldRequest::new("ip", ElementType::Int32, 0)).unwrap().unwrap();
            assert_eq!(ip.data, ArrayData::Int32(vec![expected]));
            ts.end_aos(id).unwrap();
            ts.end_action(id).unwrap();
        }

        // 10 * (1 + 0.25) between ip=10 and ip=20
        let id = read_slice(&mut ts, 0.25, Interpolation::Linear);
        ts.begin_aos(id, "time_slice", AosKind::Dynamic, 0).unwrap();
        let ip = ts.read_field(id, &FieldRequest::new("ip", ElementType::Int32, 0)).unwrap().unwrap();
        assert_eq!(ip.data, ArrayData::Int32(vec![13]));
        assert_eq!(ip.interpolation, Interpolated::Blended { alpha: 0.25 });
        ts.end_aos(id).unwrap();
        ts.end_action(id).unwrap();

        let id = read_slice(&mut ts, 10.0, Interpolation::Linear);
        ts.begin_aos(id, "time_slice", AosKind::Dynamic, 0).unwrap();
        let ip = ts.read_field(id, &FieldRequest::new("ip", ElementType::Int32, 0)).unwrap().unwrap();
        assert_eq!(ip.data, ArrayData::Int32(vec![40]));
        assert_eq!(ip.interpolation, Interpolated::Exact);
        ts.end_aos(id).unwrap();
        ts.end_action(id).unwrap();
    }

    #[test]
    fn test_slice_appends_on_shared_time_basis() {
        let mut ts = create_test_store();
        let values = [[10, 100], [20, 200], [30, 300], [40, 400]];
        for (step, pair) in values.iter().enumerate() {
            let id = write(&mut ts, RangeMode::Slice);
            set_time_flag(&mut ts, id, TimeBasis::Shared);
            ts.write_field(
                id,
                &FieldRequest::sized("time", ElementType::Float64, &[1]).timebase("time"),
                &ArrayData::Float64(vec![step as f64]),
            )
            .unwrap();
            ts.write_field(
                id,
                &FieldRequest::sized("global_quantities/ip", ElementType::Int32, &[2, 1]).timebase("time"),
                &ArrayData::Int32(pair.to_vec()),
            )
            .unwrap();
            ts.end_action(id).unwrap();
        }

        let id = read(&mut ts);
        let full = ts
            .read_field(id, &FieldRequest::new("global_quantities/ip", ElementType::Int32, 2))
            .unwrap()
            .unwrap();
        assert_eq!(full.size.as_slice(), &[2, 4]);
        assert_eq!(full.data, ArrayData::Int32(vec![10, 100, 20, 200, 30, 300, 40, 400]));
        let time = ts.read_field(id, &FieldRequest::new("time", ElementType::Float64, 1)).unwrap().unwrap();
        assert_eq!(time.data, ArrayData::Float64(vec![0.0, 1.0, 2.0, 3.0]));
        ts.end_action(id).unwrap();

        let req = FieldRequest::new("global_quantities/ip", ElementType::Int32, 2).timebase("time");
        let id = read_slice(&mut ts, 1.4, Interpolation::Closest);
        let slice = ts.read_field(id, &req).unwrap().unwrap();
        assert_eq!(slice.size.as_slice(), &[2, 1]);
        assert_eq!(slice.data, ArrayData::Int32(vec![20, 200]));
        ts.end_action(id).unwrap();

        let id = read_slice(&mut ts, 1.25, Interpolation::Linear);
        let slice = ts.read_field(id, &req).unwrap().unwrap();
        assert_eq!(slice.data, ArrayData::Int32(vec![23, 225]));
        ts.end_action(id).unwrap();

        let id = read_slice(&mut ts, -1.0, Interpolation::Linear);
        let slice = ts.read_field(id, &req).unwrap().unwrap();
        assert_eq!(slice.data, ArrayData::Int32(vec![10, 100]));
        ts.end_action(id).unwrap();
    }

    #[test]
    fn test_linear_degrades_on_shape_mismatch() {
        let mut ts = create_test_store();
        let id = write(&mut ts, RangeMode::Global);
        set_time_flag(&mut ts, id, TimeBasis::PerBranch);
        ts.begin_aos(id, "profiles_1d", AosKind::Dynamic, 2).unwrap();
        for (i, len) in [2usize, 3].into_iter().enumerate() {
            ts.set_aos_index(id, i).unwrap();
            ts.write_field(id, &FieldRequest::sized("time", ElementType::Float64, &[]), &ArrayData::Float64(vec![i as f64]))
                .unwrap();
            ts.write_field(
                id,
                &FieldRequest::sized("te", ElementType::Float64, &[len]),
                &ArrayData::Float64(vec![1.0 + i as f64; len]),
            )
            .unwrap();
            ts.write_field(
                id,
                &FieldRequest::sized("label", ElementType::Char, &[2]),
                &ArrayData::Char(vec![format!("s{}", i)]),
            )
            .unwrap();
        }
        ts.end_aos(id).unwrap();
        ts.end_action(id).unwrap();

        let id = read_slice(&mut ts, 0.5, Interpolation::Linear);
        ts.begin_aos(id, "profiles_1d", AosKind::Dynamic, 0).unwrap();
        let te = ts.read_field(id, &FieldRequest::new("te", ElementType::Float64, 1)).unwrap().unwrap();
        assert_eq!(te.interpolation, Interpolated::Degraded);
        assert_eq!(te.data, ArrayData::Float64(vec![1.0, 1.0]));

        let label = ts.read_field(id, &FieldRequest::new("label", ElementType::Char, 1)).unwrap().unwrap();
        assert_eq!(label.data, ArrayData::Char(vec!["s0".into()]));
        assert_eq!(label.interpolation, Interpolated::Exact);

        let time = ts.read_field(id, &FieldRequest::new("time", ElementType::Float64, 0)).unwrap().unwrap();
        assert_eq!(time.data, ArrayData::Float64(vec![0.5]));
        ts.end_aos(id).unwrap();
        ts.end_action(id).unwrap();
    }

    #[test]
    fn test_nested_dynamic_array_in_slice_write() {
        let mut ts = create_test_store();
        for step in 0..2usize {
            let id = write(&mut ts, RangeMode::Slice);
            if step == 0 {
                set_time_flag(&mut ts, id, TimeBasis::PerBranch);
            }
            assert_eq!(ts.begin_aos(id, "time_slice", AosKind::Dynamic, 0).unwrap(), 1);
            ts.write_field(
                id,
                &FieldRequest::sized("time", ElementType::Float64, &[]),
                &ArrayData::Float64(vec![step as f64]),
            )
            .unwrap();
            // only the outermost dynamic array appends, the nested one keeps its size
            assert_eq!(ts.begin_aos(id, "profiles_2d", AosKind::Dynamic, 3).unwrap(), 3);
            for i in 0..3 {
                ts.set_aos_index(id, i).unwrap();
                ts.write_field(
                    id,
                    &FieldRequest::sized("psi", ElementType::Float64, &[2]),
                    &ArrayData::Float64(vec![(10 * step + i) as f64; 2]),
                )
                .unwrap();
            }
            assert!(ts.set_aos_index(id, 3).is_err());
            ts.end_aos(id).unwrap();
            ts.end_aos(id).unwrap();
            ts.end_action(id).unwrap();
        }

        let id = read(&mut ts);
        assert_eq!(ts.begin_aos(id, "time_slice", AosKind::Dynamic, 0).unwrap(), 2);
        for step in 0..2usize {
            ts.set_aos_index(id, step).unwrap();
            assert_eq!(ts.begin_aos(id, "profiles_2d", AosKind::Dynamic, 0).unwrap(), 3);
            ts.set_aos_index(id, 2).unwrap();
            let psi = ts
                .read_field(id, &FieldRequest::new("psi", ElementType::Float64, 1))
                .unwrap()
                .unwrap();
            assert_eq!(psi.data, ArrayData::Float64(vec![(10 * step + 2) as f64; 2]));
            ts.end_aos(id).unwrap();
        }
        ts.end_aos(id).unwrap();
        ts.end_action(id).unwrap();
    }

    #[test]
    fn test_slice_write_rejects_several_time_steps() {
        let mut ts = create_test_store();
        let id = write(&mut ts, RangeMode::Slice);
        set_time_flag(&mut ts, id, TimeBasis::Shared);
        let err = ts
            .write_field(
                id,
                &FieldRequest::sized("global_quantities/ip", ElementType::Float64, &[2, 3]).timebase("time"),
                &floats(&[2, 3]),
            )
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidRequest(_)));
        ts.end_action(id).unwrap();
        assert!(!ts.store().dataset_exists(GROUP, "global_quantities&ip"));
    }

    #[test]
    fn test_degraded_without_shape_mismatch_warning() {
        let config = EngineConfig {
            warn_on_shape_mismatch: false,
            ..EngineConfig::default()
        };
        let mut ts = TensorStore::new(ZarrStore::memory(), config);
        let id = write(&mut ts, RangeMode::Global);
        set_time_flag(&mut ts, id, TimeBasis::PerBranch);
        ts.begin_aos(id, "profiles_1d", AosKind::Dynamic, 2).unwrap();
        for (i, len) in [4usize, 1].into_iter().enumerate() {
            ts.set_aos_index(id, i).unwrap();
            ts.write_field(id, &FieldRequest::sized("time", ElementType::Float64, &[]), &ArrayData::Float64(vec![i as f64]))
                .unwrap();
            ts.write_field(id, &FieldRequest::sized("ne", ElementType::Float64, &[len]), &ArrayData::Float64(vec![2.0; len]))
                .unwrap();
        }
        ts.end_aos(id).unwrap();
        ts.end_action(id).unwrap();

        let id = read_slice(&mut ts, 0.25, Interpolation::Linear);
        ts.begin_aos(id, "profiles_1d", AosKind::Dynamic, 0).unwrap();
        let ne = ts.read_field(id, &FieldRequest::new("ne", ElementType::Float64, 1)).unwrap().unwrap();
        assert_eq!(ne.interpolation, Interpolated::Degraded);
        assert_eq!(ne.data, ArrayData::Float64(vec![2.0; 4]));
        ts.end_aos(id).unwrap();
        ts.end_action(id).unwrap();
        assert!(!ts.config().warn_on_shape_mismatch);
    }

    #[test]
    fn test_missing_branch_looked_up_once() {
        let mut ts = TensorStore::new(RecordingStore::new(ZarrStore::memory()), EngineConfig::default());
        let id = ts.begin_action(GROUP, AccessMode::Write, RangeMode::Global, None).unwrap();
        ts.write_field(id, &FieldRequest::sized("a", ElementType::Int32, &[]), &ArrayData::Int32(vec![1]))
            .unwrap();
        ts.end_action(id).unwrap();

        let id = ts.begin_action(GROUP, AccessMode::Read, RangeMode::Global, None).unwrap();
        for _ in 0..3 {
            assert_eq!(ts.begin_aos(id, "profiles_1d", AosKind::Static, 0).unwrap(), 0);
            assert_eq!(ts.begin_aos(id, "ion", AosKind::Static, 0).unwrap(), 0);
            assert!(ts
                .read_field(id, &FieldRequest::new("density", ElementType::Float64, 1))
                .unwrap()
                .is_none());
            ts.end_aos(id).unwrap();
            ts.end_aos(id).unwrap();
        }
        ts.end_action(id).unwrap();

        let store = ts.store();
        assert_eq!(store.lookups("profiles_1d[]_AOS_SHAPE"), 1);
        assert_eq!(store.lookups("profiles_1d[]&ion[]_AOS_SHAPE"), 0);
        assert_eq!(store.lookups("profiles_1d[]&ion[]&density"), 0);

        // the memo lives only as long as the action
        let id = ts.begin_action(GROUP, AccessMode::Read, RangeMode::Global, None).unwrap();
        assert_eq!(ts.begin_aos(id, "profiles_1d", AosKind::Static, 0).unwrap(), 0);
        ts.end_aos(id).unwrap();
        ts.end_action(id).unwrap();
        assert_eq!(ts.store().lookups("profiles_1d[]_AOS_SHAPE"), 2);
    }

    #[test]
    fn test_backend_major_version_checked() {
        let mut ts = create_test_store();
        let id = write(&mut ts, RangeMode::Global);
        ts.write_field(id, &FieldRequest::sized("a", ElementType::Int32, &[]), &ArrayData::Int32(vec![5]))
            .unwrap();
        ts.end_action(id).unwrap();

        ts.store_mut()
            .set_attribute(GROUP, "backend_version", Scalar::Char("2.0".into()))
            .unwrap();
        for access in [AccessMode::Read, AccessMode::Write] {
            let err = ts.begin_action(GROUP, access, RangeMode::Global, None).unwrap_err();
            assert!(matches!(err, StorageError::Storage { op: "open", .. }));
        }

        ts.store_mut()
            .set_attribute(GROUP, "backend_version", Scalar::Char("1.3".into()))
            .unwrap();
        let id = read(&mut ts);
        let a = ts.read_field(id, &FieldRequest::new("a", ElementType::Int32, 0)).unwrap().unwrap();
        assert_eq!(a.data, ArrayData::Int32(vec![5]));
        ts.end_action(id).unwrap();

        // groups without a stamp are opened with a warning
        ts.store_mut().create_group("bare").unwrap();
        let id = ts.begin_action("bare", AccessMode::Read, RangeMode::Global, None).unwrap();
        ts.end_action(id).unwrap();
    }

    #[test]
    fn test_missing_field_has_no_side_effects() {
        let mut ts = create_test_store();
        let id = write(&mut ts, RangeMode::Global);
        ts.write_field(id, &FieldRequest::sized("a", ElementType::Int32, &[]), &ArrayData::Int32(vec![1]))
            .unwrap();
        ts.end_action(id).unwrap();
        let before = ts.store_mut().list_datasets(GROUP).unwrap();

        let id = read(&mut ts);
        let req = FieldRequest::new("never/written", ElementType::Float64, 1);
        assert!(ts.read_field(id, &req).unwrap().is_none());
        // answered from the memo the second time
        assert!(ts.read_field(id, &req).unwrap().is_none());
        assert_eq!(ts.begin_aos(id, "absent", AosKind::Static, 0).unwrap(), 0);
        ts.end_aos(id).unwrap();
        ts.end_action(id).unwrap();

        assert_eq!(ts.store_mut().list_datasets(GROUP).unwrap(), before);
        assert!(!ts.store().dataset_exists(GROUP, "never&written"));

        // reads of an unknown record create nothing either
        let id = ts
            .begin_action("unknown", AccessMode::Read, RangeMode::Global, None)
            .unwrap();
        assert!(ts.read_field(id, &req).unwrap().is_none());
        ts.end_action(id).unwrap();
        assert!(!ts.store().group_exists("unknown"));
    }

    #[test]
    fn test_handles_released_on_last_sibling() {
        let mut ts = create_test_store();
        let id = write(&mut ts, RangeMode::Global);
        ts.begin_aos(id, "coil", AosKind::Static, 2).unwrap();
        for i in 0..2 {
            ts.set_aos_index(id, i).unwrap();
            ts.write_field(id, &FieldRequest::sized("current", ElementType::Float64, &[3]), &floats(&[3]))
                .unwrap();
            ts.begin_aos(id, "element", AosKind::Static, 3).unwrap();
            for j in 0..3 {
                ts.set_aos_index(id, j).unwrap();
                ts.write_field(id, &FieldRequest::sized("turns", ElementType::Int32, &[]), &ArrayData::Int32(vec![j as i32]))
                    .unwrap();
            }
            ts.end_aos(id).unwrap();
            if i == 0 {
                // outer array not on its last element yet
                assert!(ts.is_cached("coil[]&element[]&turns"));
            }
        }
        assert!(ts.is_cached("coil[]&current"));
        ts.end_aos(id).unwrap();

        let remaining = ts.cached_handles();
        assert!(
            remaining.iter().all(|n| !n.starts_with("coil[]")),
            "still cached: {:?}",
            remaining
        );
        ts.end_action(id).unwrap();
        assert!(ts.cached_handles().is_empty());
    }

    #[test]
    fn test_rank_reuse_is_invariant_violation() {
        let mut ts = create_test_store();
        let id = write(&mut ts, RangeMode::Global);
        ts.write_field(id, &FieldRequest::sized("b", ElementType::Float64, &[2]), &floats(&[2]))
            .unwrap();
        let err = ts
            .write_field(id, &FieldRequest::sized("b", ElementType::Float64, &[2, 2]), &floats(&[2, 2]))
            .unwrap_err();
        assert!(matches!(err, StorageError::InvariantViolation(_)));
        ts.end_action(id).unwrap();
    }

    #[test]
    fn test_action_protocol_errors() {
        let mut ts = create_test_store();
        let id = write(&mut ts, RangeMode::Global);
        assert!(matches!(
            ts.begin_action(GROUP, AccessMode::Read, RangeMode::Global, None),
            Err(StorageError::InvalidRequest(_))
        ));
        assert!(ts.end_aos(id).is_err());
        assert!(ts.set_aos_index(id, 0).is_err());
        ts.begin_aos(id, "a", AosKind::Static, 2).unwrap();
        assert!(ts.set_aos_index(id, 2).is_err());
        ts.end_aos(id).unwrap();
        ts.end_action(id).unwrap();

        assert!(matches!(ts.end_action(id), Err(StorageError::UnknownAction)));
        assert!(matches!(
            ts.read_field(id, &FieldRequest::new("x", ElementType::Int32, 0)),
            Err(StorageError::UnknownAction)
        ));
        assert!(matches!(
            ts.begin_action(GROUP, AccessMode::Read, RangeMode::Slice, None),
            Err(StorageError::InvalidRequest(_))
        ));

        let id = read(&mut ts);
        let err = ts
            .write_field(id, &FieldRequest::sized("x", ElementType::Int32, &[]), &ArrayData::Int32(vec![1]))
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidRequest(_)));
        ts.end_action(id).unwrap();
    }

    #[test]
    fn test_group_header_and_delete() {
        let mut ts = create_test_store();
        let id = write(&mut ts, RangeMode::Global);
        set_time_flag(&mut ts, id, TimeBasis::Independent);
        ts.end_action(id).unwrap();

        assert_eq!(
            ts.store_mut().attribute(GROUP, "backend_version").unwrap(),
            Some(Scalar::Char(BACKEND_VERSION.into()))
        );
        assert!(ts.store_mut().attribute(GROUP, "created_at").unwrap().is_some());
        assert_eq!(ts.time_basis(GROUP).unwrap(), TimeBasis::Independent);

        assert!(ts.delete_record(GROUP).unwrap());
        assert!(!ts.store().group_exists(GROUP));
        assert!(!ts.delete_record(GROUP).unwrap());
    }

    #[test]
    fn test_zarr_store_persists_record() {
        let dir = tempdir().unwrap();
        {
            let store = ZarrStore::open(dir.path(), CompressionType::Zstd).unwrap();
            let mut ts = TensorStore::new(store, EngineConfig::default());
            let id = ts
                .begin_action("magnetics", AccessMode::Write, RangeMode::Global, None)
                .unwrap();
            ts.begin_aos(id, "flux_loop", AosKind::Static, 2).unwrap();
            ts.set_aos_index(id, 1).unwrap();
            ts.write_field(
                id,
                &FieldRequest::sized("name", ElementType::Char, &[4]),
                &ArrayData::Char(vec!["FL02".into()]),
            )
            .unwrap();
            ts.end_aos(id).unwrap();
            ts.end_action(id).unwrap();
        }

        let store = ZarrStore::open(dir.path(), CompressionType::Zstd).unwrap();
        let mut ts = TensorStore::new(store, EngineConfig::default());
        let id = ts
            .begin_action("magnetics", AccessMode::Read, RangeMode::Global, None)
            .unwrap();
        assert_eq!(ts.begin_aos(id, "flux_loop", AosKind::Static, 0).unwrap(), 2);
        ts.set_aos_index(id, 1).unwrap();
        let name = ts
            .read_field(id, &FieldRequest::new("name", ElementType::Char, 1))
            .unwrap()
            .unwrap();
        assert_eq!(name.data, ArrayData::Char(vec!["FL02".into()]));
        assert_eq!(name.size.as_slice(), &[4]);
        ts.end_aos(id).unwrap();
        ts.end_action(id).unwrap();
    }

    #[test]
    fn test_independent_stores_on_separate_threads() {
        std::thread::scope(|scope| {
            for t in 0..4 {
                scope.spawn(move || {
                    let mut ts = create_test_store();
                    let id = write(&mut ts, RangeMode::Global);
                    ts.write_field(
                        id,
                        &FieldRequest::sized("v", ElementType::Int32, &[2]),
                        &ArrayData::Int32(vec![t, t + 1]),
                    )
                    .unwrap();
                    ts.end_action(id).unwrap();

                    let id = read(&mut ts);
                    let v = ts.read_field(id, &FieldRequest::new("v", ElementType::Int32, 1)).unwrap().unwrap();
                    assert_eq!(v.data, ArrayData::Int32(vec![t, t + 1]));
                    ts.end_action(id).unwrap();
                });
            }
        });
    }
}
