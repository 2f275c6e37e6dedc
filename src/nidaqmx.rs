//! Provides a minimal rust wrapper for the parts of the NI-DAQmx C library the rig needs.
//!
//! ## Overview
//!
//! [`NiTask`] owns an NI-DAQmx task handle and maps its methods onto DAQmx C-functions: creating
//! analog-input voltage channels and digital-output line channels, configuring the sample clock,
//! disk logging to TDMS, writing digital lines and reading analog samples. It implements the
//! [`DaqTask`], [`AiTask`] and [`DoTask`] traits, and [`NiDriver`] hands out such tasks as a
//! [`DaqDriver`].
//!
//! **Refer to the implementations on [`NiTask`] for the wrapped methods and invoked
//! [DAQmx C-functions](https://www.ni.com/docs/en-US/bundle/ni-daqmx-c-api-ref/page/cdaqmx/help_file_title.html)**
//!
//! ## Error Handling
//!
//! Every C call goes through [`daqmx_call`], which turns a negative status into a [`DaqError`]
//! carrying the extended error string. In addition to being returned, NI-DAQmx driver errors are
//! appended to the `nidaqmx_error.logs` file in the directory of the calling process.
//!
//! ## Cleanup
//!
//! `NiTask` clears its handle on drop unless it was cleared explicitly before.
//!
//! This module is only compiled with the `nidaqmx` feature, which links against `NIDAQmx`.

use libc;
use ndarray::Array2;
use std::ffi::CString;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use crate::daq::*;

type CConstStr = *const libc::c_char;
type CCharBuf = *mut libc::c_char;
type CFloat64 = libc::c_double;
type CUint32 = libc::c_uint;
type CUint64 = libc::c_ulonglong;
type CBool32 = libc::c_uint;
type CInt32 = libc::c_int;
pub type TaskHandle = *mut libc::c_void;

pub const DAQMX_VAL_RISING: CInt32 = 10280;
pub const DAQMX_VAL_VOLTS: CInt32 = 10348;
pub const DAQMX_VAL_FINITESAMPS: CInt32 = 10178;
pub const DAQMX_VAL_CFG_DEFAULT: CInt32 = -1;
pub const DAQMX_VAL_AUTO: CInt32 = -1;
pub const DAQMX_VAL_GROUPBYCHANNEL: CBool32 = 0;
pub const DAQMX_VAL_WAITINFINITELY: CFloat64 = -1.0;
pub const DAQMX_VAL_CHANPERLINE: CInt32 = 0;
pub const DAQMX_VAL_CHANFORALLLINES: CInt32 = 1;
pub const DAQMX_VAL_LOG: CInt32 = 15844;
pub const DAQMX_VAL_LOGANDREAD: CInt32 = 15842;
pub const DAQMX_VAL_OPEN: CInt32 = 10437;
pub const DAQMX_VAL_OPENORCREATE: CInt32 = 15846;
pub const DAQMX_VAL_CREATEORREPLACE: CInt32 = 15847;
pub const DAQMX_VAL_CREATE: CInt32 = 15848;

/// Input range of the rig's analog channels, in volts.
const AI_MIN_VOLTS: CFloat64 = -10.;
const AI_MAX_VOLTS: CFloat64 = 10.;

#[link(name = "NIDAQmx")]
extern "C" {
    fn DAQmxResetDevice(name: CConstStr) -> CInt32;
    fn DAQmxGetExtendedErrorInfo(errorString: CCharBuf, bufferSize: CUint32) -> CInt32;

    fn DAQmxCreateTask(taskName: CConstStr, taskHandle_ptr: &mut TaskHandle) -> CInt32;
    fn DAQmxStartTask(handle: TaskHandle) -> CInt32;
    fn DAQmxStopTask(handle: TaskHandle) -> CInt32;
    fn DAQmxClearTask(handle: TaskHandle) -> CInt32;

    fn DAQmxCfgSampClkTiming(
        handle: TaskHandle,
        src: CConstStr,
        rate: CFloat64,
        activeEdge: CInt32,
        sampleMode: CInt32,
        sampsPerChan: CUint64,
    ) -> CInt32;

    fn DAQmxCreateAIVoltageChan(
        handle: TaskHandle,
        physicalChannel: CConstStr,
        nameToAssignToChannel: CConstStr,
        terminalConfig: CInt32,
        minVal: CFloat64,
        maxVal: CFloat64,
        units: CInt32,
        customScaleName: CConstStr,
    ) -> CInt32;
    fn DAQmxCreateDOChan(
        handle: TaskHandle,
        lines: CConstStr,
        name: CConstStr,
        lineGrouping: CInt32,
    ) -> CInt32;

    fn DAQmxConfigureLogging(
        handle: TaskHandle,
        filePath: CConstStr,
        loggingMode: CInt32,
        groupName: CConstStr,
        operation: CInt32,
    ) -> CInt32;

    fn DAQmxCfgDigEdgeStartTrig(
        handle: TaskHandle,
        triggerSource: CConstStr,
        triggerEdge: CInt32,
    ) -> CInt32;

    fn DAQmxWriteDigitalLines(
        handle: TaskHandle,
        seqLen: CInt32,
        autoStart: CBool32,
        timeout: CFloat64,
        dataLayout: CBool32,
        writeArray: *const u8,
        sampsPerChanWritten: *mut CInt32,
        reserved: *mut CBool32,
    ) -> CInt32;
    fn DAQmxReadAnalogF64(
        handle: TaskHandle,
        numSampsPerChan: CInt32,
        timeout: CFloat64,
        fillMode: CBool32,
        readArray: *mut CFloat64,
        arraySizeInSamps: CUint32,
        sampsPerChanRead: *mut CInt32,
        reserved: *mut CBool32,
    ) -> CInt32;
}

/// Calls a DAQmx C-function and converts a negative status into a [`DaqError`].
///
/// On error the extended error information is fetched with `DAQmxGetExtendedErrorInfo`, logged,
/// and appended to `nidaqmx_error.logs`.
///
/// ```ignore
/// daqmx_call(|| unsafe { DAQmxStartTask(handle) })?;
/// ```
pub fn daqmx_call<F: FnOnce() -> CInt32>(func: F) -> Result<(), DaqError> {
    let err_code = func();
    if err_code >= 0 {
        return Ok(());
    }
    let mut err_buff = [0 as libc::c_char; 2048];
    unsafe {
        DAQmxGetExtendedErrorInfo(err_buff.as_mut_ptr(), 2048 as CUint32);
    }
    let error_string = unsafe { std::ffi::CStr::from_ptr(err_buff.as_ptr()) }
        .to_string_lossy()
        .into_owned();
    log::error!("DAQmx Error {}: {}", err_code, error_string);

    // Write the error to log file
    let logged = OpenOptions::new()
        .append(true)
        .create(true)
        .open("./nidaqmx_error.logs")
        .and_then(|mut file| writeln!(file, "DAQmx Error {}: {}", err_code, error_string));
    if let Err(e) = logged {
        log::warn!("Failed to write error to nidaqmx_error.logs: {}", e);
    }
    Err(DaqError::new(err_code, error_string))
}

fn c_string(s: &str) -> Result<CString, DaqError> {
    CString::new(s).map_err(|_| {
        DaqError::new(
            CLIENT_ERROR,
            format!("{:?} contains an interior NUL byte", s),
        )
    })
}

/// Resets a National Instruments (NI) device, aborting its tasks and returning it to its
/// power-on state.
///
/// ```ignore
/// reset_ni_device("Dev1")?;
/// ```
pub fn reset_ni_device(name: &str) -> Result<(), DaqError> {
    let name_cstr = c_string(name)?;
    daqmx_call(|| unsafe { DAQmxResetDevice(name_cstr.as_ptr()) })
}

/// An NI-DAQmx task.
///
/// Besides the handle it remembers what the read buffer needs: the number of analog channels
/// and the configured samples per channel.
pub struct NiTask {
    handle: TaskHandle,
    name: String,
    n_ai_channels: usize,
    samps_per_chan: u64,
    cleared: bool,
}

impl NiTask {
    pub fn new(name: &str) -> Result<Self, DaqError> {
        let mut taskhandle: TaskHandle = std::ptr::null_mut();
        let task_name_cstr = c_string(name)?;
        daqmx_call(|| unsafe { DAQmxCreateTask(task_name_cstr.as_ptr(), &mut taskhandle) })?;
        Ok(Self {
            handle: taskhandle,
            name: name.to_string(),
            n_ai_channels: 0,
            samps_per_chan: 0,
            cleared: false,
        })
    }
}

impl DaqTask for NiTask {
    fn name(&self) -> &str {
        &self.name
    }

    fn cfg_samp_clk_timing(&mut self, samp_rate: f64, samps_per_chan: u64) -> Result<(), DaqError> {
        let src_cstring = c_string("")?;
        daqmx_call(|| unsafe {
            DAQmxCfgSampClkTiming(
                self.handle,
                src_cstring.as_ptr(),
                samp_rate as CFloat64,
                DAQMX_VAL_RISING,
                DAQMX_VAL_FINITESAMPS,
                samps_per_chan as CUint64,
            )
        })?;
        self.samps_per_chan = samps_per_chan;
        Ok(())
    }

    fn start(&mut self) -> Result<(), DaqError> {
        daqmx_call(|| unsafe { DAQmxStartTask(self.handle) })
    }

    fn stop(&mut self) -> Result<(), DaqError> {
        if self.cleared {
            return Ok(());
        }
        daqmx_call(|| unsafe { DAQmxStopTask(self.handle) })
    }

    fn clear(&mut self) -> Result<(), DaqError> {
        if self.cleared {
            return Ok(());
        }
        // A failed clear still invalidates the handle
        self.cleared = true;
        daqmx_call(|| unsafe { DAQmxClearTask(self.handle) })
    }
}

impl AiTask for NiTask {
    fn add_ai_voltage_chan(&mut self, physical_channel: &str, assigned_name: &str) -> Result<(), DaqError> {
        let name_cstr = c_string(physical_channel)?;
        let assigned_name_cstr = c_string(assigned_name)?;
        daqmx_call(|| unsafe {
            DAQmxCreateAIVoltageChan(
                self.handle,
                name_cstr.as_ptr(),
                assigned_name_cstr.as_ptr(),
                DAQMX_VAL_CFG_DEFAULT,
                AI_MIN_VOLTS,
                AI_MAX_VOLTS,
                DAQMX_VAL_VOLTS,
                std::ptr::null(),
            )
        })?;
        self.n_ai_channels += 1;
        Ok(())
    }

    fn cfg_dig_edge_start_trig(&mut self, trigger_source: &str) -> Result<(), DaqError> {
        let trigger_source_cstr = c_string(trigger_source)?;
        daqmx_call(|| unsafe {
            DAQmxCfgDigEdgeStartTrig(self.handle, trigger_source_cstr.as_ptr(), DAQMX_VAL_RISING)
        })
    }

    fn configure_logging(
        &mut self,
        path: &Path,
        mode: LoggingMode,
        operation: LoggingOperation,
    ) -> Result<(), DaqError> {
        let path_cstr = c_string(&path.to_string_lossy())?;
        // Null group name: the driver names the group after the task
        let mode = match mode {
            LoggingMode::Log => DAQMX_VAL_LOG,
            LoggingMode::LogAndRead => DAQMX_VAL_LOGANDREAD,
        };
        let operation = match operation {
            LoggingOperation::Open => DAQMX_VAL_OPEN,
            LoggingOperation::OpenOrCreate => DAQMX_VAL_OPENORCREATE,
            LoggingOperation::CreateOrReplace => DAQMX_VAL_CREATEORREPLACE,
            LoggingOperation::Create => DAQMX_VAL_CREATE,
        };
        daqmx_call(|| unsafe {
            DAQmxConfigureLogging(
                self.handle,
                path_cstr.as_ptr(),
                mode,
                std::ptr::null(),
                operation,
            )
        })
    }

    fn read_all(&mut self, timeout_s: f64) -> Result<Array2<f64>, DaqError> {
        let n_chan = self.n_ai_channels;
        let buf_size = n_chan * self.samps_per_chan as usize;
        let mut buf = vec![0. as CFloat64; buf_size];
        let mut nread: CInt32 = 0;
        daqmx_call(|| unsafe {
            DAQmxReadAnalogF64(
                self.handle,
                DAQMX_VAL_AUTO,
                timeout_s as CFloat64,
                DAQMX_VAL_GROUPBYCHANNEL,
                buf.as_mut_ptr(),
                buf_size as CUint32,
                &mut nread as *mut CInt32,
                std::ptr::null_mut(),
            )
        })?;
        // Grouped by channel: each channel's samples are packed back to back
        let nread = nread.max(0) as usize;
        buf.truncate(n_chan * nread);
        Array2::from_shape_vec((n_chan, nread), buf)
            .map_err(|e| DaqError::new(CLIENT_ERROR, format!("Unexpected read layout: {}", e)))
    }
}

impl DoTask for NiTask {
    fn add_do_chan(&mut self, lines: &str, assigned_name: &str, grouping: LineGrouping) -> Result<(), DaqError> {
        let lines_cstr = c_string(lines)?;
        let assigned_name_cstr = c_string(assigned_name)?;
        let grouping = match grouping {
            LineGrouping::ChanPerLine => DAQMX_VAL_CHANPERLINE,
            LineGrouping::ChanForAllLines => DAQMX_VAL_CHANFORALLLINES,
        };
        daqmx_call(|| unsafe {
            DAQmxCreateDOChan(
                self.handle,
                lines_cstr.as_ptr(),
                assigned_name_cstr.as_ptr(),
                grouping,
            )
        })
    }

    fn write_digital_lines(&mut self, data: &Array2<bool>, auto_start: bool) -> Result<usize, DaqError> {
        // Standard layout, rows are channels
        let signal_arr: Array2<u8> = data.map(|&b| b as u8);
        let mut nwritten: CInt32 = 0;
        daqmx_call(|| unsafe {
            DAQmxWriteDigitalLines(
                self.handle,
                signal_arr.shape()[1] as CInt32,
                auto_start as CBool32,
                DAQMX_VAL_WAITINFINITELY,
                DAQMX_VAL_GROUPBYCHANNEL,
                signal_arr.as_ptr(),
                &mut nwritten as *mut CInt32,
                std::ptr::null_mut(),
            )
        })?;
        Ok(nwritten as usize)
    }
}

// Define deletion behavior
impl Drop for NiTask {
    fn drop(&mut self) {
        if let Err(e) = self.clear() {
            log::warn!("Failed to clear task {} on drop: {}", self.name, e);
        }
    }
}

/// [`DaqDriver`] backed by the installed NI-DAQmx driver.
#[derive(Debug, Default, Clone, Copy)]
pub struct NiDriver;

impl DaqDriver for NiDriver {
    fn create_ai_task(&self, name: &str) -> Result<Box<dyn AiTask>, DaqError> {
        Ok(Box::new(NiTask::new(name)?))
    }

    fn create_do_task(&self, name: &str) -> Result<Box<dyn DoTask>, DaqError> {
        Ok(Box::new(NiTask::new(name)?))
    }
}
