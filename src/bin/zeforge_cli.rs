use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use zeforge::backend::ze_backend::ZeRuntime;
use zeforge::backend::{BackendConfig, BackendKind};
use zeforge::logging::init_logging_from_env;
use zeforge::model::{checkpoint_layout, Checkpoint, Model};

#[derive(Parser, Debug)]
#[command(name = "zeforge-cli", version)]
#[command(about = "Run single-token decode steps on the CPU or a Level Zero GPU", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Feed tokens at successive positions and report the logits of each step
    Decode {
        /// Path to the float32 checkpoint
        #[arg(long)]
        checkpoint: PathBuf,
        /// Backend to run on (cpu or level-zero); defaults to ZEFORGE_BACKEND or cpu
        #[arg(long)]
        backend: Option<BackendKind>,
        /// Precompiled kernel module for the Level Zero backend
        #[arg(long)]
        kernels: Option<PathBuf>,
        /// Level Zero device index
        #[arg(long)]
        device: Option<usize>,
        /// CPU worker threads
        #[arg(long)]
        threads: Option<usize>,
        /// Use the vector CPU kernels when available
        #[arg(long)]
        vector: bool,
        /// Record device kernel timestamps
        #[arg(long)]
        profile: bool,
        /// Comma-separated token ids
        #[arg(long, value_delimiter = ',', required = true)]
        tokens: Vec<usize>,
        /// Print one JSON object per step
        #[arg(long)]
        json: bool,
    },
    /// Print checkpoint hyperparameters and tensor layout
    Inspect {
        #[arg(long)]
        checkpoint: PathBuf,
    },
    /// Report whether a Level Zero device is usable
    Device {
        /// Kernel module to build as part of the check
        #[arg(long)]
        kernels: Option<PathBuf>,
        #[arg(long, default_value_t = 0)]
        device: usize,
    },
}

#[derive(Debug, Serialize)]
struct StepReport {
    position: usize,
    token: usize,
    argmax: usize,
    max_logit: f32,
    elapsed_us: u128,
    #[serde(skip_serializing_if = "Option::is_none")]
    kernel_us: Option<u128>,
}

fn main() -> anyhow::Result<()> {
    init_logging_from_env().context("failed to initialize logging")?;
    let cli = Cli::parse();
    match cli.command {
        Commands::Decode {
            checkpoint,
            backend,
            kernels,
            device,
            threads,
            vector,
            profile,
            tokens,
            json,
        } => {
            let mut config = BackendConfig::from_env()?;
            if let Some(kind) = backend {
                config = config.with_backend(kind);
            }
            if let Some(path) = kernels {
                config = config.with_kernel_path(path);
            }
            if let Some(index) = device {
                config = config.with_device_index(index);
            }
            if let Some(n) = threads {
                config = config.with_num_threads(n);
            }
            if vector {
                config = config.with_vector_kernels(true);
            }
            if profile {
                config = config.with_profiling(true);
            }
            decode(&checkpoint, &config, &tokens, json)
        }
        Commands::Inspect { checkpoint } => inspect(&checkpoint),
        Commands::Device { kernels, device } => probe_device(kernels, device),
    }
}

fn decode(
    path: &Path,
    config: &BackendConfig,
    tokens: &[usize],
    json: bool,
) -> anyhow::Result<()> {
    let mut model = Model::load(path, config)
        .with_context(|| format!("failed to load {}", path.display()))?;
    if !json {
        println!(
            "{} backend, {}",
            model.backend_name(),
            model.params()
        );
    }

    for (position, &token) in tokens.iter().enumerate() {
        let start = Instant::now();
        let logits = model
            .forward(token, position)
            .with_context(|| format!("decode failed at position {}", position))?;
        let elapsed = start.elapsed();
        let (argmax, max_logit) = logits
            .iter()
            .copied()
            .enumerate()
            .fold((0, f32::NEG_INFINITY), |best, (i, v)| if v > best.1 { (i, v) } else { best });

        let report = StepReport {
            position,
            token,
            argmax,
            max_logit,
            elapsed_us: elapsed.as_micros(),
            kernel_us: model.last_kernel_time().map(|d| d.as_micros()),
        };
        if json {
            println!("{}", serde_json::to_string(&report)?);
        } else {
            print!(
                "pos {:>4}  token {:>6} -> {:>6}  (logit {:>9.4})  {:>8} us",
                report.position, report.token, report.argmax, report.max_logit, report.elapsed_us
            );
            match report.kernel_us {
                Some(us) => println!("  [kernel {} us]", us),
                None => println!(),
            }
        }
    }
    Ok(())
}

fn inspect(path: &Path) -> anyhow::Result<()> {
    let checkpoint = Checkpoint::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let params = checkpoint.params();
    println!("=== Parameters ===");
    println!("{}", params);
    println!(
        "head_size={} kv_dim={} kv_mul={}",
        params.head_size(),
        params.kv_dim(),
        params.kv_mul()
    );

    println!("\n=== Tensors ===");
    let mut offset = 0usize;
    for spec in checkpoint_layout(params) {
        println!("{:<16} {:>12} floats  @ byte {}", spec.name, spec.len, offset);
        offset += spec.len * 4;
    }
    let available = checkpoint.weight_bytes().len();
    println!("\nweight bytes: {} expected, {} present", offset, available);
    if available < offset {
        anyhow::bail!("checkpoint is truncated");
    }
    Ok(())
}

fn probe_device(kernels: Option<PathBuf>, device: usize) -> anyhow::Result<()> {
    if !ZeRuntime::is_available() {
        println!("No Level Zero device available");
        return Ok(());
    }
    let Some(path) = kernels else {
        println!("Level Zero loader and device present (pass --kernels to build a module)");
        return Ok(());
    };
    let config = BackendConfig::level_zero(path).with_device_index(device);
    let runtime = ZeRuntime::initialize(&config).context("runtime initialization failed")?;
    println!("API version: {}", runtime.api_version());
    println!("Device:      {}", runtime.device_info());
    Ok(())
}
