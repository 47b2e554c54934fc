//! idstensor CLI
//!
//! Command-line interface for tensorized record stores:
//! - List records and datasets
//! - Inspect dataset metadata
//! - Dump dataset contents
//! - Write and read back a demo record
//! - Print the default configuration

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use idstensor::config::{generate_default_config, Config};
use idstensor::storage::*;

#[derive(Parser)]
#[command(name = "idstensor")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Inspect and exercise tensorized IDS record stores")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file (default: ./idstensor.toml, then ~/.config/idstensor/config.toml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Output format (table, json)
    #[arg(short, long, default_value = "table", global = true)]
    pub format: String,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List records, or the datasets of one record
    Ls {
        /// Store directory
        dir: PathBuf,
        /// Record group
        group: Option<String>,
    },

    /// Show dataset metadata
    Info {
        dir: PathBuf,
        group: String,
        /// Tensorized dataset name, e.g. "profiles_1d[]&grid&rho_tor_norm"
        dataset: String,
    },

    /// Print every cell of a dataset
    Dump {
        dir: PathBuf,
        group: String,
        dataset: String,
    },

    /// Write a small record with a dynamic struct array and read it back
    Demo {
        /// Store directory (default: configured data_dir)
        dir: Option<PathBuf>,
    },

    /// Generate default config file
    Config {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::load_with_env(path).with_context(|| format!("loading {:?}", path))?,
        None => Config::load_default(),
    };
    init_logging(&config);

    match cli.command {
        Commands::Ls { dir, group } => {
            let mut store = open_store(&dir, &config)?;
            let names = match &group {
                Some(group) => {
                    if !store.group_exists(group) {
                        bail!("no record named {:?} in {:?}", group, dir);
                    }
                    store.list_datasets(group)?
                }
                None => store.list_groups()?,
            };
            match cli.format.as_str() {
                "json" => println!("{}", serde_json::to_string_pretty(&names)?),
                _ => {
                    if names.is_empty() {
                        println!("(empty)");
                    }
                    for name in names {
                        println!("{}", name);
                    }
                }
            }
        }

        Commands::Info { dir, group, dataset } => {
            let mut store = open_store(&dir, &config)?;
            let meta = store
                .dataset_meta(&group, &dataset)
                .with_context(|| format!("reading metadata of {}/{}", group, dataset))?;
            match cli.format.as_str() {
                "json" => println!("{}", serde_json::to_string_pretty(&meta)?),
                _ => {
                    println!("Dataset:     {}/{}", group, dataset);
                    println!("Kind:        {:?}", meta.kind);
                    println!("Type:        {}", meta.element_type);
                    println!("Field rank:  {}", meta.field_rank);
                    println!("AOS axes:    {}", meta.aos_rank);
                    println!("Extents:     {:?}", meta.dims.as_slice());
                    println!("Chunks:      {:?}", meta.chunk_dims.as_slice());
                    println!("Fill:        {}", meta.fill);
                    println!("Cache hint:  {} bytes", meta.cache_bytes);
                    for key in ["backend_version", "created_at"] {
                        if let Some(value) = store.attribute(&group, key)? {
                            println!("{:<12} {}", format!("{}:", key), value);
                        }
                    }
                }
            }
        }

        Commands::Dump { dir, group, dataset } => {
            let mut store = open_store(&dir, &config)?;
            let meta = store.dataset_meta(&group, &dataset)?;
            let data = store
                .read_slab(&group, &dataset, &Hyperslab::all(&meta.dims))
                .with_context(|| format!("reading {}/{}", group, dataset))?;
            match cli.format.as_str() {
                "json" => println!("{}", serde_json::to_string_pretty(&data)?),
                _ => print_cells(&meta.dims, &data),
            }
        }

        Commands::Demo { dir } => {
            let dir = dir.unwrap_or_else(|| config.store.data_path());
            run_demo(&dir, &config)?;
        }

        Commands::Config { output } => {
            let content = generate_default_config();
            match output {
                Some(path) => {
                    std::fs::write(&path, content).with_context(|| format!("writing {:?}", path))?;
                    println!("Config written to {:?}", path);
                }
                None => print!("{}", content),
            }
        }
    }

    Ok(())
}

fn init_logging(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| format!("idstensor={}", config.logging.level)),
    );
    let registry = tracing_subscriber::registry().with(filter);
    if config.logging.format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn open_store(dir: &Path, config: &Config) -> Result<ZarrStore> {
    ZarrStore::open(dir, config.store.compression).with_context(|| format!("opening store at {:?}", dir))
}

/// One line per cell: multi-index then value
fn print_cells(dims: &[usize], data: &ArrayData) {
    let cell = |i: usize| -> String {
        match data {
            ArrayData::Char(v) => format!("{:?}", v[i]),
            ArrayData::Int32(v) => v[i].to_string(),
            ArrayData::Float64(v) => v[i].to_string(),
            ArrayData::Complex128(v) => v[i].to_string(),
        }
    };
    for i in 0..data.len() {
        let mut index = vec![0usize; dims.len()];
        let mut rest = i;
        for axis in (0..dims.len()).rev() {
            index[axis] = rest % dims[axis].max(1);
            rest /= dims[axis].max(1);
        }
        println!("{:?} {}", index, cell(i));
    }
}

fn run_demo(dir: &Path, config: &Config) -> Result<()> {
    const GROUP: &str = "demo_equilibrium";

    let store = open_store(dir, config)?;
    let mut ts = TensorStore::new(store, config.to_engine_config());
    tracing::info!("idstensor v{} demo in {:?}", env!("CARGO_PKG_VERSION"), dir);
    ts.delete_record(GROUP)?;

    // One slice-mode write per time step; the profile grows each step
    for step in 0..4usize {
        let time = 0.1 * step as f64;
        let id = ts.begin_action(GROUP, AccessMode::Write, RangeMode::Slice, None)?;
        ts.write_field(
            id,
            &FieldRequest::sized(HOMOGENEOUS_TIME_FIELD, ElementType::Int32, &[]),
            &ArrayData::Int32(vec![TimeBasis::PerBranch.flag()]),
        )?;
        ts.begin_aos(id, "time_slice", AosKind::Dynamic, 0)?;
        ts.write_field(
            id,
            &FieldRequest::sized("time", ElementType::Float64, &[]),
            &ArrayData::Float64(vec![time]),
        )?;
        ts.write_field(
            id,
            &FieldRequest::sized("global_quantities/ip", ElementType::Float64, &[]),
            &ArrayData::Float64(vec![1.0e6 * (1.0 + step as f64)]),
        )?;
        let points = 3 + step;
        ts.write_field(
            id,
            &FieldRequest::sized("profiles_1d/psi", ElementType::Float64, &[points]),
            &ArrayData::Float64((0..points).map(|p| p as f64 * time).collect()),
        )?;
        ts.end_aos(id)?;
        ts.end_action(id)?;
    }
    tracing::info!("Wrote 4 time slices to {}", GROUP);

    let query = SliceQuery::new(0.15, Interpolation::Linear);
    let id = ts.begin_action(GROUP, AccessMode::Read, RangeMode::Slice, Some(query))?;
    ts.begin_aos(id, "time_slice", AosKind::Dynamic, 0)?;
    let ip = ts.read_field(id, &FieldRequest::new("global_quantities/ip", ElementType::Float64, 0))?;
    let psi = ts.read_field(id, &FieldRequest::new("profiles_1d/psi", ElementType::Float64, 1))?;
    ts.end_aos(id)?;
    ts.end_action(id)?;

    match ip {
        Some(value) => println!("ip @ t=0.15: {:?} ({:?})", value.data, value.interpolation),
        None => println!("ip @ t=0.15: not found"),
    }
    match psi {
        Some(value) => println!("psi @ t=0.15: {:?} ({:?})", value.data, value.interpolation),
        None => println!("psi @ t=0.15: not found"),
    }
    Ok(())
}
