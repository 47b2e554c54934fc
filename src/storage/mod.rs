//! IDS Tensor Storage Engine
//!
//! This module maps hierarchical records onto chunked N-dimensional datasets:
//!
//! - **types**: Element types, owned buffers, field requests and modes
//! - **chunk_store**: The `ChunkStore` primitive, dataset metadata and windows
//! - **zarr_store**: `ChunkStore` over Zarr V3, on disk or in memory
//! - **dataset**: Dataset handles, chunk sizing and the handle cache
//! - **hyperslab**: Storage and buffer window selection
//! - **shape_catalog**: `_SHAPE` / `_AOS_SHAPE` records
//! - **time_slice**: Slice resolution and interpolation
//! - **action**: Action arena and context stack
//! - **tensor_store**: Orchestration facade
//! - **error**: Error types
//!
//! # Architecture
//!
//! ```text
//! Write Path:
//!   FieldRequest → tensorized name → DatasetHandle (create/extend) → Hyperslab → ChunkStore
//!                                  └→ ShapeCatalog (_SHAPE)
//!
//! Read Path:
//!   FieldRequest → missing memo → TimeSliceResolver → ShapeCatalog → Hyperslab → blend
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use idstensor::storage::*;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = ZarrStore::open("./data", CompressionType::Zstd)?;
//!     let mut ts = TensorStore::new(store, EngineConfig::default());
//!
//!     // Write one time slice of a dynamic struct array
//!     let id = ts.begin_action("equilibrium", AccessMode::Write, RangeMode::Slice, None)?;
//!     ts.begin_aos(id, "time_slice", AosKind::Dynamic, 0)?;
//!     ts.write_field(
//!         id,
//!         &FieldRequest::sized("time", ElementType::Float64, &[]),
//!         &ArrayData::Float64(vec![0.1]),
//!     )?;
//!     ts.end_aos(id)?;
//!     ts.end_action(id)?;
//!
//!     // Read it back interpolated
//!     let query = SliceQuery::new(0.1, Interpolation::Linear);
//!     let id = ts.begin_action("equilibrium", AccessMode::Read, RangeMode::Slice, Some(query))?;
//!     ts.begin_aos(id, "time_slice", AosKind::Dynamic, 0)?;
//!     let time = ts.read_field(id, &FieldRequest::new("time", ElementType::Float64, 0))?;
//!     ts.end_aos(id)?;
//!     ts.end_action(id)?;
//!
//!     println!("{:?}", time);
//!     Ok(())
//! }
//! ```

pub mod action;
pub mod chunk_store;
pub mod dataset;
pub mod error;
pub mod hyperslab;
pub mod shape_catalog;
pub mod tensor_store;
pub mod time_slice;
pub mod types;
pub mod zarr_store;

// Re-export commonly used types
pub use action::{tensorize, ActionId, AOS_MARKER, PATH_MARKER};
pub use chunk_store::{ChunkStore, DatasetKind, DatasetMeta, Hyperslab};
pub use dataset::{ChunkPolicy, DatasetHandle, DatasetLayout, HandleCache};
pub use error::{StorageError, StorageResult};
pub use hyperslab::{AosPick, HyperslabSelector, Selection, SelectionRequest};
pub use shape_catalog::{aos_shape_name, shape_name, ShapeCatalog};
pub use tensor_store::{EngineConfig, TensorStore, BACKEND_VERSION, HOMOGENEOUS_TIME_FIELD, TIME_FIELD};
pub use time_slice::{blend, SliceSelection, TimeSliceResolver};
pub use types::{
    AccessMode, AosKind, ArrayData, Complex64, Dims, ElementType, FieldRequest, FieldValue, Interpolated,
    Interpolation, RangeMode, Scalar, SliceQuery, TimeBasis,
};
pub use zarr_store::{CompressionType, ZarrStore};
