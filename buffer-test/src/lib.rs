use std::fmt;
use std::path::Path;
use std::time::Duration;

pub use buffer_test_types::{
    AddressingMode, AllocationSource, DataType, HarnessConfig, IndexWidth, LogicalDomain, Shape,
    TestCase,
};

pub mod alloc;
pub mod backend;
pub mod dispatch;
pub mod host_memory;
pub mod layout;
pub mod matrix;
pub mod probe;
pub mod validation;
pub mod variant;
pub mod verify;

pub use crate::dispatch::{DispatchProtocol, Phase};
pub use crate::matrix::{enumerate, run_all, DeviceReport};
pub use crate::probe::{probe, Capabilities, SkipReason};
pub use crate::validation::validate;
pub use crate::verify::{CaseRecord, Outcome, RawScalar, Summary, Transcript, Verdict};

#[derive(Debug)]
pub enum Error {
    InvalidConfig(String),
    Allocation {
        what: String,
        requested: u64,
        limit: u64,
    },
    SyncTimeout(Duration),
    Unsupported(String),
    Protocol(String),
    Device(String),
    Io(std::io::Error),
}

impl Error {
    /// Errors that end the whole run instead of a single device pass.
    pub fn is_run_fatal(&self) -> bool {
        matches!(self, Error::SyncTimeout(_) | Error::Io(_))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidConfig(msg) => write!(f, "invalid config: {}", msg),
            Error::Allocation {
                what,
                requested,
                limit,
            } => write!(
                f,
                "allocation failed: {} ({} requested, limit {})",
                what,
                probe::format_size(*requested),
                probe::format_size(*limit)
            ),
            Error::SyncTimeout(after) => {
                write!(f, "fence did not signal within {} ms", after.as_millis())
            }
            Error::Unsupported(msg) => write!(f, "unsupported: {}", msg),
            Error::Protocol(msg) => write!(f, "protocol violation: {}", msg),
            Error::Device(msg) => write!(f, "device error: {}", msg),
            Error::Io(e) => write!(f, "io error: {}", e),
        }
    }
}

impl std::error::Error for Error {}

pub fn load_config(path: &Path) -> Result<HarnessConfig, Error> {
    let json = std::fs::read_to_string(path).map_err(Error::Io)?;
    let config: HarnessConfig = serde_json::from_str(&json)
        .map_err(|e| Error::InvalidConfig(format!("{}: {}", path.display(), e)))?;
    validate(&config)?;
    Ok(config)
}

pub fn execute<I: backend::Instance, W: std::io::Write>(
    instance: &I,
    config: &HarnessConfig,
    out: W,
) -> Result<(Vec<DeviceReport>, Transcript<W>), Error> {
    validate(config)?;
    let mut transcript = Transcript::new(out);
    let reports = run_all(instance, config, &mut transcript)?;
    let total = transcript.summary();
    transcript.line(format!(
        "Total: {} passed, {} failed, {} skipped",
        total.passed, total.failed, total.skipped
    ))?;
    Ok((reports, transcript))
}
