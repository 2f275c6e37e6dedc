//! In-process simulation of the acquisition device.
//!
//! [`SimDevice`] implements [`DaqDriver`] without hardware so that experiments can be run, and
//! their failure paths exercised, on any machine.
//!
//! - Starting a digital-output task publishes its written waveform over a crossbeam channel to
//!   every live analog-input task of the device. [`AiTask::read_all`] waits on that channel with
//!   the requested timeout and fails with a DAQmx timeout status when nothing arrives.
//!   An analog task armed on a `do/StartTrigger` terminal only receives the waveform if it was
//!   started before the digital task; one armed on any other terminal never does.
//! - An analog channel whose assigned name matches a digital-output channel reads back
//!   [`SimConfig::high_volts`] while that line is high and 0 V otherwise. The `camera_output`
//!   channel mirrors the `camera_trigger` line.
//! - With logging configured the samples are also written to a TDMS file, one group named after
//!   the task and one channel per assigned name carrying the waveform properties.
//! - [`SimFault`] injects a driver error at a chosen operation, or stalls the generation.
//! - Every task is recorded in a ledger ([`SimDevice::tasks`]) together with its channels,
//!   timing and whether it was released.

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};
use ndarray::Array2;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::daq::*;
use crate::tdms::{Properties, PropertyValue, TdmsWriter};

/// DAQmx status: the task handle is invalid or was cleared.
pub const DAQMX_ERROR_INVALID_TASK: i32 = -200088;
/// DAQmx status: generation cannot start because the output buffer is empty.
pub const DAQMX_ERROR_EMPTY_OUTPUT_BUFFER: i32 = -200462;

const CAMERA_TRIGGER: &str = "camera_trigger";
const CAMERA_OUTPUT: &str = "camera_output";
const DO_START_TRIGGER: &str = "/do/StartTrigger";

/// Driver operations at which a fault can be injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimOperation {
    CreateAiTask,
    CreateDoTask,
    AddAiChan,
    StartTrigger,
    ConfigureLogging,
    AiTiming,
    AddDoChan,
    DoTiming,
    WriteDigital,
    StartAi,
    StartDo,
    ReadAll,
    Stop,
    Clear,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SimFault {
    /// The operation fails with DAQmx status `code`.
    FailAt { operation: SimOperation, code: i32 },
    /// Generation never starts, so reads time out.
    Stall,
}

#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Voltage read back from a high digital line
    pub high_volts: f64,
    /// Make `read_all` take as long as the acquisition would
    pub realtime: bool,
    /// Factor applied to every wait (pacing and timeouts)
    pub time_scale: f64,
    pub fault: Option<SimFault>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            high_volts: 5.,
            realtime: false,
            time_scale: 1.,
            fault: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    AnalogInput,
    DigitalOutput,
}

/// Ledger entry for a task created on a [`SimDevice`].
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRecord {
    pub name: String,
    pub kind: TaskKind,
    /// `(physical address, assigned name)` in creation order
    pub channels: Vec<(String, String)>,
    pub timing: Option<(f64, u64)>,
    pub start_trigger: Option<String>,
    pub logging: Option<PathBuf>,
    pub started: bool,
    pub released: bool,
}

struct DoFrame {
    lines: Vec<(String, Vec<bool>)>,
}

struct Shared {
    config: SimConfig,
    ledger: Mutex<Vec<TaskRecord>>,
    subscribers: Mutex<Vec<(usize, Sender<Arc<DoFrame>>)>>,
}

impl Shared {
    fn check(&self, operation: SimOperation) -> Result<(), DaqError> {
        match &self.config.fault {
            Some(SimFault::FailAt { operation: op, code }) if *op == operation => Err(DaqError::new(
                *code,
                format!("Simulated failure at {:?}", operation),
            )),
            _ => Ok(()),
        }
    }

    fn register(&self, name: &str, kind: TaskKind) -> usize {
        let mut ledger = self.ledger.lock();
        ledger.push(TaskRecord {
            name: name.to_string(),
            kind,
            channels: Vec::new(),
            timing: None,
            start_trigger: None,
            logging: None,
            started: false,
            released: false,
        });
        ledger.len() - 1
    }

    fn update(&self, id: usize, f: impl FnOnce(&mut TaskRecord)) {
        if let Some(record) = self.ledger.lock().get_mut(id) {
            f(record)
        }
    }

    fn scaled(&self, secs: f64) -> Duration {
        Duration::from_secs_f64((secs * self.config.time_scale).max(0.))
    }
}

/// A simulated DAQ device. Cloning yields another handle to the same device.
#[derive(Clone)]
pub struct SimDevice {
    shared: Arc<Shared>,
}

impl Default for SimDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl SimDevice {
    pub fn new() -> Self {
        Self::with_config(SimConfig::default())
    }

    pub fn with_config(config: SimConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                ledger: Mutex::new(Vec::new()),
                subscribers: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn with_fault(fault: SimFault) -> Self {
        Self::with_config(SimConfig {
            fault: Some(fault),
            ..Default::default()
        })
    }

    pub fn config(&self) -> &SimConfig {
        &self.shared.config
    }

    /// Snapshot of every task created so far.
    pub fn tasks(&self) -> Vec<TaskRecord> {
        self.shared.ledger.lock().clone()
    }

    pub fn all_released(&self) -> bool {
        self.shared.ledger.lock().iter().all(|t| t.released)
    }
}

impl DaqDriver for SimDevice {
    fn create_ai_task(&self, name: &str) -> Result<Box<dyn AiTask>, DaqError> {
        self.shared.check(SimOperation::CreateAiTask)?;
        let id = self.shared.register(name, TaskKind::AnalogInput);
        let (tx, rx) = bounded(1);
        self.shared.subscribers.lock().push((id, tx));
        log::debug!("Simulated AI task {} created", name);
        Ok(Box::new(SimAiTask {
            core: TaskCore::new(self.shared.clone(), id, name),
            channels: Vec::new(),
            logging: None,
            rx,
        }))
    }

    fn create_do_task(&self, name: &str) -> Result<Box<dyn DoTask>, DaqError> {
        self.shared.check(SimOperation::CreateDoTask)?;
        let id = self.shared.register(name, TaskKind::DigitalOutput);
        log::debug!("Simulated DO task {} created", name);
        Ok(Box::new(SimDoTask {
            core: TaskCore::new(self.shared.clone(), id, name),
            channels: Vec::new(),
            written: None,
        }))
    }
}

/// State shared by both task kinds.
struct TaskCore {
    shared: Arc<Shared>,
    id: usize,
    name: String,
    timing: Option<(f64, u64)>,
    released: bool,
}

impl TaskCore {
    fn new(shared: Arc<Shared>, id: usize, name: &str) -> Self {
        Self {
            shared,
            id,
            name: name.to_string(),
            timing: None,
            released: false,
        }
    }

    fn ensure_live(&self) -> Result<(), DaqError> {
        if self.released {
            return Err(DaqError::new(
                DAQMX_ERROR_INVALID_TASK,
                format!("Task {} has been cleared", self.name),
            ));
        }
        Ok(())
    }

    fn cfg_timing(&mut self, op: SimOperation, samp_rate: f64, samps_per_chan: u64) -> Result<(), DaqError> {
        self.shared.check(op)?;
        self.ensure_live()?;
        if !(samp_rate > 0.) || samps_per_chan == 0 {
            return Err(DaqError::new(
                CLIENT_ERROR,
                format!("Invalid timing: rate {} Hz, {} samples", samp_rate, samps_per_chan),
            ));
        }
        self.timing = Some((samp_rate, samps_per_chan));
        self.shared
            .update(self.id, |r| r.timing = Some((samp_rate, samps_per_chan)));
        Ok(())
    }

    fn timing(&self) -> Result<(f64, u64), DaqError> {
        self.timing.ok_or_else(|| {
            DaqError::new(
                CLIENT_ERROR,
                format!("Sample clock timing of task {} is not configured", self.name),
            )
        })
    }

    fn add_channel(&self, physical: &str, assigned: &str) {
        self.shared.update(self.id, |r| {
            r.channels.push((physical.to_string(), assigned.to_string()))
        });
    }

    fn stop(&mut self) -> Result<(), DaqError> {
        self.shared.check(SimOperation::Stop)?;
        Ok(())
    }

    fn clear(&mut self) -> Result<(), DaqError> {
        if self.released {
            return Ok(());
        }
        self.shared.check(SimOperation::Clear)?;
        self.released = true;
        let id = self.id;
        self.shared.subscribers.lock().retain(|(sub, _)| *sub != id);
        self.shared.update(id, |r| r.released = true);
        Ok(())
    }
}

struct SimAiTask {
    core: TaskCore,
    channels: Vec<String>,
    logging: Option<(PathBuf, LoggingMode, LoggingOperation)>,
    rx: Receiver<Arc<DoFrame>>,
}

impl SimAiTask {
    fn readback(&self, assigned: &str, frame: &DoFrame, n_samples: usize) -> Vec<f64> {
        let source = if assigned == CAMERA_OUTPUT {
            CAMERA_TRIGGER
        } else {
            assigned
        };
        let line = frame
            .lines
            .iter()
            .find(|(name, _)| name == source)
            .map(|(_, samples)| samples.as_slice())
            .unwrap_or(&[]);
        let high = self.core.shared.config.high_volts;
        (0..n_samples)
            .map(|i| match line.get(i) {
                Some(true) => high,
                _ => 0.,
            })
            .collect()
    }

    fn write_log(
        &self,
        path: &Path,
        operation: LoggingOperation,
        data: &Array2<f64>,
        samp_rate: f64,
    ) -> Result<(), DaqError> {
        match operation {
            LoggingOperation::Create if path.exists() => {
                return Err(DaqError::new(
                    CLIENT_ERROR,
                    format!("Log file {} already exists", path.display()),
                ))
            }
            LoggingOperation::Open if !path.exists() => {
                return Err(DaqError::new(
                    CLIENT_ERROR,
                    format!("Log file {} does not exist", path.display()),
                ))
            }
            _ => {}
        }
        let mut writer = TdmsWriter::new();
        writer.set_group_property(
            &self.core.name,
            "sample_rate",
            PropertyValue::Float(samp_rate),
        );
        for (name, row) in self.channels.iter().zip(data.rows()) {
            let mut props = Properties::new();
            props.insert("NI_ChannelName".into(), PropertyValue::String(name.clone()));
            props.insert("unit_string".into(), PropertyValue::String("Volts".into()));
            props.insert("wf_start_offset".into(), PropertyValue::Float(0.));
            props.insert("wf_increment".into(), PropertyValue::Float(1. / samp_rate));
            props.insert("wf_samples".into(), PropertyValue::UInt(row.len() as u64));
            writer.add_channel(&self.core.name, name, row.to_vec(), props);
        }
        writer.write(path).map_err(|e| {
            DaqError::new(
                CLIENT_ERROR,
                format!("Failed to write log file {}: {}", path.display(), e),
            )
        })?;
        log::debug!("Simulated log written to {}", path.display());
        Ok(())
    }
}

impl DaqTask for SimAiTask {
    fn name(&self) -> &str {
        &self.core.name
    }
    fn cfg_samp_clk_timing(&mut self, samp_rate: f64, samps_per_chan: u64) -> Result<(), DaqError> {
        self.core.cfg_timing(SimOperation::AiTiming, samp_rate, samps_per_chan)
    }
    fn start(&mut self) -> Result<(), DaqError> {
        self.core.shared.check(SimOperation::StartAi)?;
        self.core.ensure_live()?;
        self.core.shared.update(self.core.id, |r| r.started = true);
        Ok(())
    }
    fn stop(&mut self) -> Result<(), DaqError> {
        self.core.stop()
    }
    fn clear(&mut self) -> Result<(), DaqError> {
        self.core.clear()
    }
}

impl AiTask for SimAiTask {
    fn add_ai_voltage_chan(&mut self, physical_channel: &str, assigned_name: &str) -> Result<(), DaqError> {
        self.core.shared.check(SimOperation::AddAiChan)?;
        self.core.ensure_live()?;
        self.channels.push(assigned_name.to_string());
        self.core.add_channel(physical_channel, assigned_name);
        Ok(())
    }

    fn cfg_dig_edge_start_trig(&mut self, trigger_source: &str) -> Result<(), DaqError> {
        self.core.shared.check(SimOperation::StartTrigger)?;
        self.core.ensure_live()?;
        let source = trigger_source.to_string();
        self.core
            .shared
            .update(self.core.id, |r| r.start_trigger = Some(source));
        Ok(())
    }

    fn configure_logging(
        &mut self,
        path: &Path,
        mode: LoggingMode,
        operation: LoggingOperation,
    ) -> Result<(), DaqError> {
        self.core.shared.check(SimOperation::ConfigureLogging)?;
        self.core.ensure_live()?;
        self.logging = Some((path.to_path_buf(), mode, operation));
        self.core
            .shared
            .update(self.core.id, |r| r.logging = Some(path.to_path_buf()));
        Ok(())
    }

    fn read_all(&mut self, timeout_s: f64) -> Result<Array2<f64>, DaqError> {
        self.core.shared.check(SimOperation::ReadAll)?;
        self.core.ensure_live()?;
        let (samp_rate, n_samples) = self.core.timing()?;
        if let Some((_, LoggingMode::Log, _)) = self.logging {
            return Err(DaqError::new(
                CLIENT_ERROR,
                "Samples cannot be read while logging in log-only mode",
            ));
        }
        self.core.shared.update(self.core.id, |r| r.started = true);

        let timed_out = || {
            DaqError::new(
                DAQMX_ERROR_SAMPLES_NOT_YET_AVAILABLE,
                format!(
                    "Some or all requested samples were not acquired within {} s",
                    timeout_s
                ),
            )
        };
        let frame = match self.rx.recv_timeout(self.core.shared.scaled(timeout_s)) {
            Ok(frame) => frame,
            Err(RecvTimeoutError::Timeout) => return Err(timed_out()),
            Err(RecvTimeoutError::Disconnected) => {
                return Err(DaqError::new(CLIENT_ERROR, "Simulated device disconnected"))
            }
        };

        if self.core.shared.config.realtime {
            let acquisition_s = n_samples as f64 / samp_rate;
            if acquisition_s > timeout_s {
                std::thread::sleep(self.core.shared.scaled(timeout_s));
                return Err(timed_out());
            }
            std::thread::sleep(self.core.shared.scaled(acquisition_s));
        }

        let n = n_samples as usize;
        let mut data = Array2::zeros((self.channels.len(), n));
        for (i, name) in self.channels.iter().enumerate() {
            let trace = self.readback(name, &frame, n);
            for (j, v) in trace.into_iter().enumerate() {
                data[[i, j]] = v;
            }
        }

        if let Some((path, _, operation)) = &self.logging {
            self.write_log(path, *operation, &data, samp_rate)?;
        }
        Ok(data)
    }
}

struct SimDoTask {
    core: TaskCore,
    channels: Vec<String>,
    written: Option<Array2<bool>>,
}

impl DaqTask for SimDoTask {
    fn name(&self) -> &str {
        &self.core.name
    }

    fn cfg_samp_clk_timing(&mut self, samp_rate: f64, samps_per_chan: u64) -> Result<(), DaqError> {
        self.core.cfg_timing(SimOperation::DoTiming, samp_rate, samps_per_chan)
    }

    fn start(&mut self) -> Result<(), DaqError> {
        self.core.shared.check(SimOperation::StartDo)?;
        self.core.ensure_live()?;
        let written = self.written.as_ref().ok_or_else(|| {
            DaqError::new(
                DAQMX_ERROR_EMPTY_OUTPUT_BUFFER,
                format!("No samples were written to task {} before start", self.core.name),
            )
        })?;
        self.core.shared.update(self.core.id, |r| r.started = true);

        if self.core.shared.config.fault == Some(SimFault::Stall) {
            log::debug!("Simulated DO task {} stalled", self.core.name);
            return Ok(());
        }
        let frame = Arc::new(DoFrame {
            lines: self
                .channels
                .iter()
                .cloned()
                .zip(written.rows().into_iter().map(|row| row.to_vec()))
                .collect(),
        });
        // Armed tasks that were not started yet, or wait on another terminal, miss this start
        let missed: Vec<usize> = self
            .core
            .shared
            .ledger
            .lock()
            .iter()
            .enumerate()
            .filter(|(_, r)| match &r.start_trigger {
                Some(source) => !r.started || !source.ends_with(DO_START_TRIGGER),
                None => false,
            })
            .map(|(id, _)| id)
            .collect();
        for (id, tx) in self.core.shared.subscribers.lock().iter() {
            if missed.contains(id) {
                log::debug!("Simulated task {} missed the start trigger", id);
                continue;
            }
            // A full slot means that task already holds a frame from an earlier start
            let _ = tx.try_send(frame.clone());
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<(), DaqError> {
        self.core.stop()
    }

    fn clear(&mut self) -> Result<(), DaqError> {
        self.core.clear()
    }
}

impl DoTask for SimDoTask {
    fn add_do_chan(&mut self, lines: &str, assigned_name: &str, _grouping: LineGrouping) -> Result<(), DaqError> {
        self.core.shared.check(SimOperation::AddDoChan)?;
        self.core.ensure_live()?;
        self.channels.push(assigned_name.to_string());
        self.core.add_channel(lines, assigned_name);
        Ok(())
    }

    fn write_digital_lines(&mut self, data: &Array2<bool>, auto_start: bool) -> Result<usize, DaqError> {
        self.core.shared.check(SimOperation::WriteDigital)?;
        self.core.ensure_live()?;
        if data.nrows() != self.channels.len() {
            return Err(DaqError::new(
                CLIENT_ERROR,
                format!(
                    "Write data has {} rows but task {} has {} channels",
                    data.nrows(),
                    self.core.name,
                    self.channels.len()
                ),
            ));
        }
        self.written = Some(data.clone());
        if auto_start {
            self.start()?;
        }
        Ok(data.ncols())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::tdms::TdmsFile;
    use ndarray::array;

    fn program(device: &SimDevice) -> (Box<dyn AiTask>, Box<dyn DoTask>) {
        let mut ai = device.create_ai_task("analog_inputs").unwrap();
        ai.add_ai_voltage_chan("Dev1/ai0", "camera_trigger").unwrap();
        ai.add_ai_voltage_chan("Dev1/ai6", "camera_output").unwrap();
        ai.add_ai_voltage_chan("Dev1/ai1", "led365_trigger").unwrap();
        ai.cfg_samp_clk_timing(10., 4).unwrap();

        let mut dout = device.create_do_task("digital_outputs").unwrap();
        dout.add_do_chan("Dev1/port0/line0", "camera_trigger", LineGrouping::ChanPerLine)
            .unwrap();
        dout.cfg_samp_clk_timing(10., 4).unwrap();
        (ai, dout)
    }

    #[test]
    fn readback_follows_digital_lines() {
        let device = SimDevice::new();
        let (mut ai, mut dout) = program(&device);
        let written = dout
            .write_digital_lines(&array![[true, false, true, true]], false)
            .unwrap();
        assert_eq!(written, 4);
        dout.start().unwrap();

        let data = ai.read_all(1.).unwrap();
        assert_eq!(data.shape(), &[3, 4]);
        assert_eq!(data.row(0).to_vec(), vec![5., 0., 5., 5.]);
        assert_eq!(data.row(1).to_vec(), vec![5., 0., 5., 5.]);
        assert_eq!(data.row(2).to_vec(), vec![0.; 4]);
    }

    #[test]
    fn logging_writes_tdms() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.tdms");
        let device = SimDevice::new();
        let (mut ai, mut dout) = program(&device);
        ai.configure_logging(&path, LoggingMode::LogAndRead, LoggingOperation::CreateOrReplace)
            .unwrap();
        dout.write_digital_lines(&array![[false, true, true, false]], true)
            .unwrap();
        ai.read_all(1.).unwrap();

        let file = TdmsFile::open(&path).unwrap();
        let chan = file.channel("analog_inputs", "camera_output").unwrap();
        assert_eq!(chan.data(), &[0., 5., 5., 0.]);
        let time = chan.time_track().unwrap();
        assert!((time[1] - 0.1).abs() < 1e-12);
        assert_eq!(device.tasks()[0].logging.as_deref(), Some(path.as_path()));
    }

    #[test]
    fn read_without_generation_times_out() {
        let device = SimDevice::with_config(SimConfig {
            time_scale: 0.01,
            ..Default::default()
        });
        let (mut ai, _dout) = program(&device);
        let err = ai.read_all(1.).unwrap_err();
        assert!(err.is_timeout());
    }

    #[test]
    fn stall_fault_times_out() {
        let device = SimDevice::with_config(SimConfig {
            time_scale: 0.01,
            fault: Some(SimFault::Stall),
            ..Default::default()
        });
        let (mut ai, mut dout) = program(&device);
        dout.write_digital_lines(&array![[true, true, true, true]], false)
            .unwrap();
        dout.start().unwrap();
        assert!(ai.read_all(1.).unwrap_err().is_timeout());
    }

    #[test]
    fn injected_fault_and_ledger() {
        let device = SimDevice::with_fault(SimFault::FailAt {
            operation: SimOperation::WriteDigital,
            code: -200077,
        });
        let (mut ai, mut dout) = program(&device);
        let err = dout
            .write_digital_lines(&array![[true, true, true, true]], false)
            .unwrap_err();
        assert_eq!(err.code, -200077);
        assert!(!device.all_released());

        ai.clear().unwrap();
        dout.clear().unwrap();
        dout.clear().unwrap();
        assert!(device.all_released());
        assert_eq!(
            dout.start().unwrap_err().code,
            DAQMX_ERROR_INVALID_TASK
        );

        let tasks = device.tasks();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].kind, TaskKind::AnalogInput);
        assert_eq!(tasks[0].channels[1], ("Dev1/ai6".to_string(), "camera_output".to_string()));
        assert_eq!(tasks[1].timing, Some((10., 4)));
    }

    #[test]
    fn armed_task_needs_start_before_generation() {
        let device = SimDevice::with_config(SimConfig {
            time_scale: 0.01,
            ..Default::default()
        });
        let (mut ai, mut dout) = program(&device);
        ai.cfg_dig_edge_start_trig("/Dev1/do/StartTrigger").unwrap();
        dout.write_digital_lines(&array![[true, false, false, true]], false)
            .unwrap();
        ai.start().unwrap();
        dout.start().unwrap();
        assert_eq!(ai.read_all(1.).unwrap().row(0).to_vec(), vec![5., 0., 0., 5.]);
        assert_eq!(
            device.tasks()[0].start_trigger.as_deref(),
            Some("/Dev1/do/StartTrigger")
        );

        // Generation started before the analog side was armed
        let (mut ai, mut dout) = program(&device);
        ai.cfg_dig_edge_start_trig("/Dev1/do/StartTrigger").unwrap();
        dout.write_digital_lines(&array![[true, true, true, true]], false)
            .unwrap();
        dout.start().unwrap();
        ai.start().unwrap();
        assert!(ai.read_all(1.).unwrap_err().is_timeout());

        // Armed on a terminal nothing drives
        let (mut ai, mut dout) = program(&device);
        ai.cfg_dig_edge_start_trig("/Dev1/PFI0").unwrap();
        dout.write_digital_lines(&array![[true, true, true, true]], false)
            .unwrap();
        ai.start().unwrap();
        dout.start().unwrap();
        assert!(ai.read_all(1.).unwrap_err().is_timeout());
    }

    #[test]
    fn start_requires_written_samples() {
        let device = SimDevice::new();
        let (_ai, mut dout) = program(&device);
        assert_eq!(dout.start().unwrap_err().code, DAQMX_ERROR_EMPTY_OUTPUT_BUFFER);
    }
}
