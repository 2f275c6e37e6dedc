//! # Imaging rig acquisition backend
//!
//! `imagingrig_backend` runs synchronized acquisitions on a National Instruments (NI) DAQ device
//! for a one-photon imaging rig. Digital outputs drive the camera, LED and pump triggers with
//! sample-by-sample waveforms while every analog input, including the camera's exposure output,
//! is recorded into a TDMS log by the driver. The recorded traces are then flattened into a table
//! and saved, together with caller-provided run metadata, as a JSON snapshot.
//!
//! ## Modules
//!
//! - [`registry`]: symbolic channel names to hardware addresses ([`ChannelRegistry`]).
//! - [`experiment`]: the [`Experiment`] orchestrator (validate, run, extract, persist).
//! - [`daq`]: the driver interface and the [`ScopedTask`] release guard.
//! - [`nidaqmx`]: NI-DAQmx binding (feature `nidaqmx`).
//! - [`sim`]: simulated device used by the tests and the demo.
//! - [`tdms`]: TDMS reader and writer.
//! - [`table`]: [`TraceTable`], the extracted traces.
//! - [`error`]: error types.
//!
//! ## Example
//!
//! ```no_run
//! use imagingrig_backend::*;
//! use indexmap::IndexMap;
//! use std::sync::Arc;
//!
//! let mut do_data = IndexMap::new();
//! do_data.insert("camera_trigger".to_string(), vec![1.; 100]);
//! let mut exp = Experiment::new(
//!     Arc::new(ChannelRegistry::imaging_rig()),
//!     do_data,
//!     "run.tdms",
//!     10.,
//!     10.,
//! )?;
//! exp.run_tasks(&SimDevice::new())?;
//! let table = exp.tdms_to_dataframe()?;
//! exp.save_dataframe(&table, serde_json::json!({"odor": "A"}), IndexMap::new())?;
//! # Ok::<(), imagingrig_backend::Error>(())
//! ```
//!
//! With the `python` feature the crate builds as a Python extension module exposing `Experiment`.

pub mod daq;
pub mod error;
pub mod experiment;
#[cfg(feature = "nidaqmx")]
pub mod nidaqmx;
#[cfg(feature = "python")]
pub mod python;
pub mod registry;
pub mod sim;
pub mod table;
pub mod tdms;
pub mod utils;

pub use crate::daq::{AiTask, DaqDriver, DaqError, DaqTask, DoTask, ScopedTask};
pub use crate::error::{ConfigError, Error, Result};
pub use crate::experiment::{Experiment, RunSnapshot};
#[cfg(feature = "nidaqmx")]
pub use crate::nidaqmx::{reset_ni_device, NiDriver};
pub use crate::registry::ChannelRegistry;
pub use crate::sim::{SimConfig, SimDevice, SimFault, SimOperation};
pub use crate::table::TraceTable;
pub use crate::tdms::{TdmsError, TdmsFile};

#[cfg(feature = "python")]
use pyo3::prelude::*;

#[cfg(feature = "python")]
#[pymodule]
fn imagingrig_backend(_py: Python, m: &PyModule) -> PyResult<()> {
    m.add_class::<python::PyExperiment>()?;
    Ok(())
}
