use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use buffer_test::backend::native::NativeInstance;
use buffer_test::{execute, load_config, HarnessConfig};
use tracing::error;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};
use wgpu::Backends;

const DEFAULT_CONFIG: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/default_config.bin"));

fn print_usage() {
    eprintln!("Usage: buffer-test [OPTIONS]");
    eprintln!();
    eprintln!("  --config <path>     JSON harness configuration (default: built-in)");
    eprintln!("  --timeout-ms <n>    Fence wait bound in milliseconds");
    eprintln!("  --help              Show this help");
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_filter(
                    EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| EnvFilter::new("warn")),
                ),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();

    let mut config_path: Option<PathBuf> = None;
    let mut timeout_ms: Option<u64> = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" => {
                i += 1;
                if i < args.len() { config_path = Some(PathBuf::from(&args[i])); }
            }
            "--timeout-ms" => {
                i += 1;
                if i < args.len() { timeout_ms = args[i].parse().ok(); }
            }
            "--help" | "-h" => {
                print_usage();
                return ExitCode::SUCCESS;
            }
            other => {
                eprintln!("Unknown flag: {}", other);
                print_usage();
                return ExitCode::FAILURE;
            }
        }
        i += 1;
    }

    let loaded = match &config_path {
        Some(path) => load_config(path),
        None => bincode::deserialize::<HarnessConfig>(DEFAULT_CONFIG)
            .map_err(|e| buffer_test::Error::InvalidConfig(format!("built-in config: {}", e))),
    };
    let mut config = match loaded {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    if let Some(ms) = timeout_ms {
        config.fence_timeout_ms = ms;
    }

    let backends = config
        .backends_bits
        .and_then(Backends::from_bits)
        .unwrap_or(Backends::all());
    let instance = NativeInstance::new(backends, Duration::from_millis(config.fence_timeout_ms));

    let stdout = std::io::stdout();
    match execute(&instance, &config, stdout.lock()) {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "run aborted");
            eprintln!("Run aborted: {}", e);
            ExitCode::FAILURE
        }
    }
}
