//! Driver-agnostic interface to the acquisition device.
//!
//! The orchestration in [`crate::experiment`] only needs a handful of capabilities from a DAQ
//! driver: create analog-input and digital-output tasks, add channels by physical address,
//! configure finite hardware-clocked sampling, stream analog input to a TDMS log file while
//! keeping it readable in-process, arm the analog side on the digital start trigger, write a
//! digital waveform matrix without starting, start, and perform a blocking read of the whole
//! acquisition. These are captured by the
//! [`DaqTask`], [`AiTask`], [`DoTask`] and [`DaqDriver`] traits.
//!
//! Two implementations ship with the crate:
//! - [`crate::nidaqmx::NiDriver`] (feature `nidaqmx`) calls into the NI-DAQmx C library.
//! - [`crate::sim::SimDevice`] emulates a device in-process and is used by the tests.
//!
//! ## Scoped release
//!
//! Hardware tasks must never be left configured or running when an acquisition fails.
//! [`ScopedTask`] owns a task and stops and clears it when dropped, so every exit path of the
//! caller (success, `?` propagation or panic unwinding) releases the device.

use ndarray::Array2;
use std::ops::{Deref, DerefMut};
use std::path::Path;

/// DAQmx status: some or all of the requested samples have not yet been acquired.
pub const DAQMX_ERROR_SAMPLES_NOT_YET_AVAILABLE: i32 = -200284;
/// DAQmx status: the wait for task completion timed out.
pub const DAQMX_ERROR_WAIT_UNTIL_DONE_TIMEOUT: i32 = -200560;
/// Status for failures detected on the client side, with no DAQmx counterpart.
pub const CLIENT_ERROR: i32 = -1;

/// A fault reported by the acquisition driver.
///
/// `code` follows NI-DAQmx conventions (negative values are errors), `message` carries the
/// driver's extended error description.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[error("DAQmx Error {code}: {message}")]
pub struct DaqError {
    pub code: i32,
    pub message: String,
}

impl DaqError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Whether the fault means a blocking call ran out of time.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self.code,
            DAQMX_ERROR_SAMPLES_NOT_YET_AVAILABLE | DAQMX_ERROR_WAIT_UNTIL_DONE_TIMEOUT
        )
    }
}

/// How digital lines are grouped into virtual channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineGrouping {
    /// One virtual channel per physical line.
    ChanPerLine,
    /// All lines of the address form a single virtual channel.
    ChanForAllLines,
}

/// Disk-logging mode of an analog-input task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoggingMode {
    /// Samples go to disk only.
    Log,
    /// Samples go to disk and stay available to `read_all`.
    LogAndRead,
}

/// What to do if the log file already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoggingOperation {
    Open,
    OpenOrCreate,
    CreateOrReplace,
    Create,
}

/// Operations shared by every hardware task.
pub trait DaqTask {
    /// Name the task was created with.
    fn name(&self) -> &str;

    /// Configures finite sampling on the onboard clock, rising edge, `samps_per_chan` samples.
    fn cfg_samp_clk_timing(&mut self, samp_rate: f64, samps_per_chan: u64) -> Result<(), DaqError>;

    fn start(&mut self) -> Result<(), DaqError>;
    fn stop(&mut self) -> Result<(), DaqError>;

    /// Releases the task handle. Calling `clear` more than once is a no-op.
    fn clear(&mut self) -> Result<(), DaqError>;
}

/// Analog-input task capabilities.
pub trait AiTask: DaqTask {
    /// Adds a voltage channel at `physical_channel`, named `assigned_name` in reads and logs.
    fn add_ai_voltage_chan(&mut self, physical_channel: &str, assigned_name: &str)
        -> Result<(), DaqError>;

    /// Makes a started task wait for a rising edge on the terminal `trigger_source`, for
    /// example `/Dev1/do/StartTrigger`.
    fn cfg_dig_edge_start_trig(&mut self, trigger_source: &str) -> Result<(), DaqError>;

    /// Streams every acquired sample to a TDMS file at `path`.
    fn configure_logging(
        &mut self,
        path: &Path,
        mode: LoggingMode,
        operation: LoggingOperation,
    ) -> Result<(), DaqError>;

    /// Blocks until the finite acquisition is complete (or `timeout_s` elapses) and returns
    /// all samples, one row per channel in creation order.
    fn read_all(&mut self, timeout_s: f64) -> Result<Array2<f64>, DaqError>;
}

/// Digital-output task capabilities.
pub trait DoTask: DaqTask {
    fn add_do_chan(
        &mut self,
        lines: &str,
        assigned_name: &str,
        grouping: LineGrouping,
    ) -> Result<(), DaqError>;

    /// Writes `data` (one row per channel, one column per sample) into the output buffer.
    /// Returns the number of samples per channel written.
    fn write_digital_lines(&mut self, data: &Array2<bool>, auto_start: bool)
        -> Result<usize, DaqError>;
}

/// Factory for hardware tasks on one acquisition device.
pub trait DaqDriver {
    fn create_ai_task(&self, name: &str) -> Result<Box<dyn AiTask>, DaqError>;
    fn create_do_task(&self, name: &str) -> Result<Box<dyn DoTask>, DaqError>;
}

/// Owns a hardware task and releases it (stop, then clear) when dropped.
///
/// Release errors cannot be propagated from `Drop`; they are logged instead.
pub struct ScopedTask<T: DaqTask + ?Sized> {
    task: Box<T>,
}

impl<T: DaqTask + ?Sized> ScopedTask<T> {
    pub fn new(task: Box<T>) -> Self {
        log::debug!("Acquired task {}", task.name());
        Self { task }
    }

    fn release(&mut self) {
        if let Err(err) = self.task.stop() {
            log::warn!("Failed to stop task {}: {}", self.task.name(), err);
        }
        match self.task.clear() {
            Ok(()) => log::debug!("Released task {}", self.task.name()),
            Err(err) => log::warn!("Failed to clear task {}: {}", self.task.name(), err),
        }
    }
}

impl<T: DaqTask + ?Sized> Deref for ScopedTask<T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.task
    }
}

impl<T: DaqTask + ?Sized> DerefMut for ScopedTask<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.task
    }
}

impl<T: DaqTask + ?Sized> Drop for ScopedTask<T> {
    fn drop(&mut self) {
        self.release()
    }
}
