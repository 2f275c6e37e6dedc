//! Crate-level error types.
//!
//! Errors fall into the categories the orchestration layer distinguishes:
//!
//! - [`ConfigError`]: raised while building a [`ChannelRegistry`] or an [`Experiment`], before any
//!   hardware is touched.
//! - [`DaqError`]: a fault reported by the acquisition driver (NI-DAQmx status code plus the
//!   extended error string). Surfaced as [`Error::Hardware`], or as [`Error::Timeout`] when the
//!   status code denotes an expired wait.
//! - [`TdmsError`]: the trace container could not be parsed.
//!
//! [`ChannelRegistry`]: crate::registry::ChannelRegistry
//! [`Experiment`]: crate::experiment::Experiment

use std::path::PathBuf;

pub use crate::daq::DaqError;
pub use crate::tdms::TdmsError;

/// Invalid experiment or registry configuration. Never produced after hardware programming started.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("Digital output {name} is not registered. Registered digital outputs are {registered:?}")]
    UnknownDigitalOutput {
        name: String,
        registered: Vec<String>,
    },

    #[error("Analog input {name} is not registered. Registered analog inputs are {registered:?}")]
    UnknownAnalogInput {
        name: String,
        registered: Vec<String>,
    },

    #[error("Waveform for {name} has {found} samples, expected {expected} (sample_rate * duration)")]
    WaveformLength {
        name: String,
        expected: usize,
        found: usize,
    },

    #[error("Sample rate must be positive and finite, got {0}")]
    NonPositiveRate(f64),

    #[error("Duration must be positive and finite, got {0}")]
    NonPositiveDuration(f64),

    #[error("sample_rate={sample_rate} and duration={duration} yield zero samples")]
    NoSamples { sample_rate: f64, duration: f64 },

    #[error("Parent directory of log file {0} does not exist")]
    MissingLogDirectory(PathBuf),

    #[error("Channel {name} has malformed {kind} address {address:?}, expected format {expected}")]
    MalformedAddress {
        name: String,
        kind: &'static str,
        address: String,
        expected: &'static str,
    },

    #[error("Failed to parse channel registry: {0}")]
    RegistryParse(String),

    #[error("Snapshot entry {0:?} is reserved and cannot be passed as an extra value")]
    ReservedSnapshotKey(String),
}

/// Crate-level error type.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("DAQ hardware error: {0}")]
    Hardware(DaqError),

    #[error("Acquisition did not complete within {timeout_s} s: {source}")]
    Timeout {
        timeout_s: f64,
        #[source]
        source: DaqError,
    },

    #[error("{}: {source}", .path.display())]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed trace container {}: {source}", .path.display())]
    Container {
        path: PathBuf,
        #[source]
        source: TdmsError,
    },

    #[error("Channel {group}/{channel} not found in {}", .path.display())]
    MissingChannel {
        path: PathBuf,
        group: String,
        channel: String,
    },

    #[error("Channel {channel} in {} has {found} samples, expected {expected}", .path.display())]
    ChannelLength {
        path: PathBuf,
        channel: String,
        expected: usize,
        found: usize,
    },

    #[error("Failed to serialize run snapshot: {0}")]
    Snapshot(#[from] serde_json::Error),
}

impl Error {
    /// Wraps a driver fault, classifying expired waits as [`Error::Timeout`].
    pub fn from_daq(err: DaqError, timeout_s: f64) -> Self {
        if err.is_timeout() {
            Error::Timeout {
                timeout_s,
                source: err,
            }
        } else {
            Error::Hardware(err)
        }
    }

    /// Builds an [`Error::File`] for `path`.
    pub fn file(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::File {
            path: path.into(),
            source,
        }
    }
}

impl From<DaqError> for Error {
    fn from(err: DaqError) -> Self {
        Error::Hardware(err)
    }
}

/// Crate-level result type.
pub type Result<T> = std::result::Result<T, Error>;
