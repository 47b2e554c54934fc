//! Zarr-backed chunk store
//!
//! Every record group is a Zarr V3 group and every tensorized dataset a
//! Zarr V3 array below it. The `DatasetMeta` of a dataset rides in the
//! array attributes under `idstensor`; group attributes hold tagged
//! `Scalar`s. Persistence uses a `FilesystemStore`, tests the in-memory
//! store, both behind `ReadableWritableListableStorage`.
//!
//! Logical to physical shape:
//! ```text
//!  rank 0            → [1]
//!  Complex128 [d..]  → [d.., 2]   (Float64 re/im pairs)
//!  Char              → String data type (vlen-utf8)
//! ```

use std::collections::HashMap;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};
use zarrs::array::codec::{BytesToBytesCodecTraits, GzipCodec, ZstdCodec};
use zarrs::array::{Array, ArrayBuilder, DataType, FillValue};
use zarrs::array_subset::ArraySubset;
use zarrs::filesystem::FilesystemStore;
use zarrs::group::{Group, GroupBuilder};
use zarrs::storage::store::MemoryStore;
use zarrs::storage::{
    ListableStorageTraits, ReadableStorageTraits, ReadableWritableListableStorage,
    ReadableWritableListableStorageTraits, StoreKey, StorePrefix, WritableStorageTraits,
};

use crate::storage::chunk_store::{ChunkStore, DatasetMeta, Hyperslab};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::{ArrayData, Complex64, Dims, ElementType, Scalar};

/// Array attribute carrying the dataset description
const META_ATTRIBUTE: &str = "idstensor";

const GZIP_LEVEL: u32 = 5;
const ZSTD_LEVEL: i32 = 5;

/// Compression applied to every chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionType {
    None,
    Gzip,
    Zstd,
}

impl CompressionType {
    fn codecs(&self) -> StorageResult<Vec<Arc<dyn BytesToBytesCodecTraits>>> {
        Ok(match self {
            CompressionType::None => Vec::new(),
            CompressionType::Gzip => vec![Arc::new(
                GzipCodec::new(GZIP_LEVEL).map_err(|e| StorageError::storage("", "create", e))?,
            )],
            CompressionType::Zstd => vec![Arc::new(ZstdCodec::new(ZSTD_LEVEL, false))],
        })
    }
}

/// Reject names that would escape their node or collide with reserved keys
pub(crate) fn validate_name(what: &str, name: &str) -> StorageResult<()> {
    if name.is_empty()
        || name.contains('/')
        || name.contains('\\')
        || name.starts_with('.')
        || name.starts_with("__")
    {
        return Err(StorageError::InvalidRequest(format!("invalid {} name '{}'", what, name)));
    }
    Ok(())
}

fn group_path(group: &str) -> String {
    format!("/{}", group)
}

fn array_path(group: &str, name: &str) -> String {
    format!("/{}/{}", group, name)
}

fn node_key(path: &str) -> StorageResult<StoreKey> {
    StoreKey::new(format!("{}/zarr.json", path.trim_start_matches('/')))
        .map_err(|e| StorageError::InvalidRequest(e.to_string()))
}

/// Trailing storage axes a logical shape needs
fn physical_tail(element_type: ElementType, rank: usize) -> &'static [u64] {
    match (element_type, rank) {
        (ElementType::Complex128, _) => &[2],
        (_, 0) => &[1],
        _ => &[],
    }
}

fn physical_shape(element_type: ElementType, dims: &[usize]) -> Vec<u64> {
    dims.iter()
        .map(|&d| d as u64)
        .chain(physical_tail(element_type, dims.len()).iter().copied())
        .collect()
}

fn physical_ranges(element_type: ElementType, slab: &Hyperslab) -> Vec<Range<u64>> {
    slab.offset
        .iter()
        .zip(&slab.count)
        .map(|(&o, &c)| o as u64..(o + c) as u64)
        .chain(physical_tail(element_type, slab.rank()).iter().map(|&n| 0..n))
        .collect()
}

fn data_type(element_type: ElementType) -> DataType {
    match element_type {
        ElementType::Char => DataType::String,
        ElementType::Int32 => DataType::Int32,
        ElementType::Float64 | ElementType::Complex128 => DataType::Float64,
    }
}

fn fill_value(fill: &Scalar) -> FillValue {
    match fill {
        Scalar::Char(s) => FillValue::new(s.as_bytes().to_vec()),
        Scalar::Int32(v) => FillValue::from(*v),
        Scalar::Float64(v) => FillValue::from(*v),
        Scalar::Complex128(c) => FillValue::from(c.re),
    }
}

type ZarrArray = Array<dyn ReadableWritableListableStorageTraits>;

struct OpenDataset {
    array: ZarrArray,
    meta: DatasetMeta,
}

/// Chunk store over a Zarr V3 hierarchy
pub struct ZarrStore {
    storage: ReadableWritableListableStorage,
    root: Option<PathBuf>,
    compression: CompressionType,
    open: HashMap<(String, String), OpenDataset>,
}

impl ZarrStore {
    /// Wrap any readable, writable and listable zarr storage
    pub fn with_storage(storage: ReadableWritableListableStorage, compression: CompressionType) -> Self {
        Self {
            storage,
            root: None,
            compression,
            open: HashMap::new(),
        }
    }

    /// Store held entirely in memory
    pub fn memory() -> Self {
        Self::with_storage(Arc::new(MemoryStore::new()), CompressionType::None)
    }

    /// Open (or create) a store rooted at `root`
    pub fn open(root: impl AsRef<Path>, compression: CompressionType) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        let fs = FilesystemStore::new(&root).map_err(|e| StorageError::storage(root.display().to_string(), "open", e))?;
        info!("Opened zarr store at {:?} ({:?})", root, compression);
        let mut store = Self::with_storage(Arc::new(fs), compression);
        store.root = Some(root);
        Ok(store)
    }

    /// Filesystem root, if the store is persisted
    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    pub fn compression(&self) -> CompressionType {
        self.compression
    }

    /// Raw storage, shared with zarr readers outside the engine
    pub fn storage(&self) -> ReadableWritableListableStorage {
        self.storage.clone()
    }

    fn node_exists(&self, path: &str) -> bool {
        match node_key(path) {
            Ok(key) => matches!(self.storage.get(&key), Ok(Some(_))),
            Err(_) => false,
        }
    }

    fn open_group(&self, group: &str, op: &'static str) -> StorageResult<Group<dyn ReadableWritableListableStorageTraits>> {
        validate_name("group", group)?;
        if !self.node_exists(&group_path(group)) {
            return Err(StorageError::storage(group, op, "group does not exist"));
        }
        Group::open(self.storage.clone(), &group_path(group)).map_err(|e| StorageError::storage(group, op, e))
    }

    /// Open a dataset if it is not cached yet
    fn dataset(&mut self, group: &str, name: &str, op: &'static str) -> StorageResult<&mut OpenDataset> {
        let key = (group.to_string(), name.to_string());
        if !self.open.contains_key(&key) {
            if !self.dataset_exists(group, name) {
                return Err(StorageError::storage(name, op, "no such dataset"));
            }
            let array = Array::open(self.storage.clone(), &array_path(group, name))
                .map_err(|e| StorageError::storage(name, op, e))?;
            let value = array
                .attributes()
                .get(META_ATTRIBUTE)
                .cloned()
                .ok_or_else(|| StorageError::Corruption(format!("dataset '{}' carries no {} attribute", name, META_ATTRIBUTE)))?;
            let meta: DatasetMeta = serde_json::from_value(value)?;
            let expected = physical_shape(meta.element_type, &meta.dims);
            if array.shape() != expected.as_slice() {
                return Err(StorageError::Corruption(format!(
                    "dataset '{}' has shape {:?}, its description says {:?}",
                    name,
                    array.shape(),
                    expected
                )));
            }
            debug!("Opened dataset {}/{} with dims {:?}", group, name, meta.dims);
            self.open.insert(key.clone(), OpenDataset { array, meta });
        }
        self.open
            .get_mut(&key)
            .ok_or_else(|| StorageError::storage(name, op, "dataset vanished from cache"))
    }
}

fn check_window(meta: &DatasetMeta, slab: &Hyperslab) -> StorageResult<()> {
    if slab.rank() != meta.rank() || slab.offset.len() != slab.count.len() {
        return Err(StorageError::InvalidRequest(format!(
            "window rank {} on a rank {} dataset",
            slab.rank(),
            meta.rank()
        )));
    }
    for axis in 0..slab.rank() {
        if slab.offset[axis] + slab.count[axis] > meta.dims[axis] {
            return Err(StorageError::InvalidRequest(format!(
                "window [{}, +{}) exceeds extent {} on axis {}",
                slab.offset[axis], slab.count[axis], meta.dims[axis], axis
            )));
        }
    }
    Ok(())
}

fn describe(meta: &DatasetMeta) -> StorageResult<Map<String, Value>> {
    let mut attributes = Map::new();
    attributes.insert(META_ATTRIBUTE.to_string(), serde_json::to_value(meta)?);
    Ok(attributes)
}

impl ChunkStore for ZarrStore {
    fn create_group(&mut self, group: &str) -> StorageResult<bool> {
        validate_name("group", group)?;
        if self.node_exists(&group_path(group)) {
            return Ok(false);
        }
        let g = GroupBuilder::new()
            .build(self.storage.clone(), &group_path(group))
            .map_err(|e| StorageError::storage(group, "create_group", e))?;
        g.store_metadata()
            .map_err(|e| StorageError::storage(group, "create_group", e))?;
        info!("Created group {}", group);
        Ok(true)
    }

    fn group_exists(&self, group: &str) -> bool {
        validate_name("group", group).is_ok() && self.node_exists(&group_path(group))
    }

    fn delete_group(&mut self, group: &str) -> StorageResult<bool> {
        validate_name("group", group)?;
        self.open.retain(|(g, _), _| g != group);
        if !self.node_exists(&group_path(group)) {
            return Ok(false);
        }
        let prefix = StorePrefix::new(format!("{}/", group)).map_err(|e| StorageError::InvalidRequest(e.to_string()))?;
        self.storage
            .erase_prefix(&prefix)
            .map_err(|e| StorageError::storage(group, "delete_group", e))?;
        Ok(true)
    }

    fn list_groups(&self) -> StorageResult<Vec<String>> {
        let listing = self
            .storage
            .list_dir(&StorePrefix::root())
            .map_err(|e| StorageError::storage("/", "list", e))?;
        let mut groups: Vec<String> = listing
            .prefixes()
            .iter()
            .map(|p| p.as_str().trim_end_matches('/').to_string())
            .filter(|g| self.group_exists(g))
            .collect();
        groups.sort();
        Ok(groups)
    }

    fn list_datasets(&mut self, group: &str) -> StorageResult<Vec<String>> {
        if !self.group_exists(group) {
            return Ok(Vec::new());
        }
        let prefix = StorePrefix::new(format!("{}/", group)).map_err(|e| StorageError::InvalidRequest(e.to_string()))?;
        let listing = self
            .storage
            .list_dir(&prefix)
            .map_err(|e| StorageError::storage(group, "list", e))?;
        let mut names: Vec<String> = listing
            .prefixes()
            .iter()
            .filter_map(|p| p.as_str().strip_prefix(prefix.as_str()))
            .map(|n| n.trim_end_matches('/').to_string())
            .filter(|n| self.dataset_exists(group, n))
            .collect();
        names.sort();
        Ok(names)
    }

    fn dataset_exists(&self, group: &str, name: &str) -> bool {
        if self.open.contains_key(&(group.to_string(), name.to_string())) {
            return true;
        }
        validate_name("group", group).is_ok()
            && validate_name("dataset", name).is_ok()
            && self.node_exists(&array_path(group, name))
    }

    fn create_dataset(&mut self, group: &str, name: &str, mut meta: DatasetMeta) -> StorageResult<()> {
        validate_name("dataset", name)?;
        meta.validate()?;
        if !self.group_exists(group) {
            return Err(StorageError::storage(name, "create", format!("group '{}' does not exist", group)));
        }
        if self.dataset_exists(group, name) {
            return Err(StorageError::storage(name, "create", "dataset already exists"));
        }
        for c in meta.chunk_dims.iter_mut() {
            *c = (*c).max(1);
        }

        let chunk_shape = physical_shape(meta.element_type, &meta.chunk_dims);
        let mut builder = ArrayBuilder::new(
            physical_shape(meta.element_type, &meta.dims),
            data_type(meta.element_type),
            chunk_shape.try_into().map_err(|e| StorageError::storage(name, "create", e))?,
            fill_value(&meta.fill),
        );
        builder.bytes_to_bytes_codecs(self.compression.codecs()?);
        builder.attributes(describe(&meta)?);
        let array = builder
            .build(self.storage.clone(), &array_path(group, name))
            .map_err(|e| StorageError::storage(name, "create", e))?;
        array
            .store_metadata()
            .map_err(|e| StorageError::storage(name, "create", e))?;

        debug!("Created dataset {}/{} dims {:?} chunks {:?}", group, name, meta.dims, meta.chunk_dims);
        self.open
            .insert((group.to_string(), name.to_string()), OpenDataset { array, meta });
        Ok(())
    }

    fn dataset_meta(&mut self, group: &str, name: &str) -> StorageResult<DatasetMeta> {
        Ok(self.dataset(group, name, "open")?.meta.clone())
    }

    fn resize(&mut self, group: &str, name: &str, dims: &[usize]) -> StorageResult<()> {
        let open = self.dataset(group, name, "resize")?;
        if dims.len() != open.meta.rank() {
            return Err(StorageError::InvariantViolation(format!(
                "resize to rank {} on a rank {} dataset",
                dims.len(),
                open.meta.rank()
            )));
        }
        if let Some(axis) = (0..dims.len()).find(|&a| dims[a] < open.meta.dims[a]) {
            return Err(StorageError::InvariantViolation(format!(
                "axis {} would shrink from {} to {}",
                axis, open.meta.dims[axis], dims[axis]
            )));
        }
        if open.meta.dims.as_slice() == dims {
            return Ok(());
        }
        open.meta.dims = Dims::from_slice(dims);
        open.array.set_shape(physical_shape(open.meta.element_type, dims));
        let value = serde_json::to_value(&open.meta)?;
        open.array.attributes_mut().insert(META_ATTRIBUTE.to_string(), value);
        open.array
            .store_metadata()
            .map_err(|e| StorageError::storage(name, "resize", e))
    }

    fn read_slab(&mut self, group: &str, name: &str, slab: &Hyperslab) -> StorageResult<ArrayData> {
        let open = self.dataset(group, name, "read")?;
        check_window(&open.meta, slab).map_err(|e| StorageError::storage(name, "read", e))?;
        if slab.volume() == 0 {
            return Ok(ArrayData::filled(&open.meta.fill, 0));
        }
        let subset = ArraySubset::new_with_ranges(&physical_ranges(open.meta.element_type, slab));
        let fail = |e: zarrs::array::ArrayError| StorageError::storage(name, "read", e);
        Ok(match open.meta.element_type {
            ElementType::Char => ArrayData::Char(open.array.retrieve_array_subset_elements::<String>(&subset).map_err(fail)?),
            ElementType::Int32 => ArrayData::Int32(open.array.retrieve_array_subset_elements::<i32>(&subset).map_err(fail)?),
            ElementType::Float64 => ArrayData::Float64(open.array.retrieve_array_subset_elements::<f64>(&subset).map_err(fail)?),
            ElementType::Complex128 => {
                let pairs = open.array.retrieve_array_subset_elements::<f64>(&subset).map_err(fail)?;
                ArrayData::Complex128(pairs.chunks_exact(2).map(|p| Complex64::new(p[0], p[1])).collect())
            }
        })
    }

    fn write_slab(&mut self, group: &str, name: &str, slab: &Hyperslab, data: &ArrayData) -> StorageResult<()> {
        let open = self.dataset(group, name, "write")?;
        check_window(&open.meta, slab).map_err(|e| StorageError::storage(name, "write", e))?;
        if data.element_type() != open.meta.element_type {
            return Err(StorageError::storage(
                name,
                "write",
                format!("{} buffer for a {} dataset", data.element_type(), open.meta.element_type),
            ));
        }
        if data.len() != slab.volume() {
            return Err(StorageError::storage(
                name,
                "write",
                format!("buffer holds {} elements for a window of {}", data.len(), slab.volume()),
            ));
        }
        if slab.volume() == 0 {
            return Ok(());
        }
        let subset = ArraySubset::new_with_ranges(&physical_ranges(open.meta.element_type, slab));
        match data {
            ArrayData::Char(v) => open.array.store_array_subset_elements::<String>(&subset, v),
            ArrayData::Int32(v) => open.array.store_array_subset_elements::<i32>(&subset, v),
            ArrayData::Float64(v) => open.array.store_array_subset_elements::<f64>(&subset, v),
            ArrayData::Complex128(v) => {
                let pairs: Vec<f64> = v.iter().flat_map(|c| [c.re, c.im]).collect();
                open.array.store_array_subset_elements::<f64>(&subset, &pairs)
            }
        }
        .map_err(|e| StorageError::storage(name, "write", e))
    }

    fn set_attribute(&mut self, group: &str, key: &str, value: Scalar) -> StorageResult<()> {
        let mut g = self.open_group(group, "set_attribute")?;
        g.attributes_mut().insert(key.to_string(), serde_json::to_value(&value)?);
        g.store_metadata()
            .map_err(|e| StorageError::storage(group, "set_attribute", e))
    }

    fn attribute(&mut self, group: &str, key: &str) -> StorageResult<Option<Scalar>> {
        if !self.group_exists(group) {
            return Ok(None);
        }
        let g = self.open_group(group, "attribute")?;
        match g.attributes().get(key) {
            Some(value) => match serde_json::from_value::<Scalar>(value.clone()) {
                Ok(scalar) => Ok(Some(scalar)),
                Err(e) => {
                    warn!("Ignoring unreadable attribute {}/{}: {}", group, key, e);
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    fn flush(&mut self) -> StorageResult<()> {
        // every zarrs store call is written through
        Ok(())
    }
}
