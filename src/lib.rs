//! # idstensor
//!
//! Tensorization engine for hierarchical IDS records - maps trees of
//! structures, struct arrays and typed N-dimensional fields onto chunked,
//! growable array datasets.
//!
//! ## Features
//!
//! - **Tensorized layout**: every struct-array level becomes a leading dataset axis
//! - **Ragged data**: per-tuple `_SHAPE` records keep the true extent of each cell
//! - **Growth-only datasets**: extents only ever grow, so appends never rewrite data
//! - **Time slicing**: CLOSEST / PREVIOUS / LINEAR reads of single time steps
//! - **Zarr store**: datasets persist as Zarr V3 arrays, gzip or zstd compressed
//!
//! ## Modules
//!
//! - [`storage`]: Tensor store, chunk stores and their building blocks
//! - [`config`]: TOML configuration with environment overrides
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use idstensor::storage::*;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut ts = TensorStore::new(ZarrStore::memory(), EngineConfig::default());
//!
//!     // Write a ragged struct array
//!     let id = ts.begin_action("core_profiles", AccessMode::Write, RangeMode::Global, None)?;
//!     ts.begin_aos(id, "profiles_1d", AosKind::Static, 2)?;
//!     for (i, len) in [3usize, 5].into_iter().enumerate() {
//!         ts.set_aos_index(id, i)?;
//!         ts.write_field(
//!             id,
//!             &FieldRequest::sized("grid/rho_tor_norm", ElementType::Float64, &[len]),
//!             &ArrayData::Float64(vec![0.5; len]),
//!         )?;
//!     }
//!     ts.end_aos(id)?;
//!     ts.end_action(id)?;
//!
//!     // Read element 1 back
//!     let id = ts.begin_action("core_profiles", AccessMode::Read, RangeMode::Global, None)?;
//!     ts.begin_aos(id, "profiles_1d", AosKind::Static, 0)?;
//!     ts.set_aos_index(id, 1)?;
//!     let rho = ts.read_field(id, &FieldRequest::new("grid/rho_tor_norm", ElementType::Float64, 1))?;
//!     ts.end_aos(id)?;
//!     ts.end_action(id)?;
//!
//!     println!("Read {:?}", rho.map(|v| v.size));
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod storage;

// Re-export top-level types for convenience
pub use storage::{
    AccessMode, AosKind, ArrayData, ChunkStore, CompressionType, ElementType, EngineConfig, FieldRequest,
    FieldValue, Interpolated, Interpolation, RangeMode, SliceQuery, StorageError, StorageResult, TensorStore,
    ZarrStore,
};

pub use config::{Config, ConfigError, EngineSettings, LoggingConfig, StoreConfig};
