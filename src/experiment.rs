//! # Synchronized digital-output / analog-input runs with the `experiment` module
//!
//! An [`Experiment`] describes one acquisition on the imaging rig: which digital lines to drive
//! (camera trigger, LED triggers, pump) with which sample-by-sample waveforms, for how long and at
//! which rate, and where the driver should log the analog inputs.
//!
//! ## Lifecycle
//!
//! 1. **Construction** ([`Experiment::new`]) validates the request against a
//!    [`ChannelRegistry`] before any hardware is touched, normalizes the waveforms to booleans
//!    and derives the ordered recording-channel list: the requested outputs followed by the
//!    `camera_output` readback channel.
//! 2. **Execution** ([`Experiment::run_tasks`]) programs an analog-input task that records every
//!    recording channel into the log file and a digital-output task that plays the waveforms.
//!    The analog task is armed on the digital task's start trigger and started first, so starting
//!    the outputs starts both; it then blocks on reading the whole acquisition back. Both tasks are held by
//!    [`ScopedTask`] guards and released on every exit path.
//! 3. **Extraction** ([`Experiment::tdms_to_dataframe`]) parses the log into a [`TraceTable`].
//! 4. **Persistence** ([`Experiment::save_dataframe`]) writes the table, the caller's scan info
//!    and any extra values to a JSON snapshot next to the log file.
//!
//! ## Lenient waveforms
//!
//! Waveform samples are coerced to booleans (any nonzero value is high). Samples other than
//! exactly 0 or 1 do not fail construction; they produce a warning that is logged and kept in
//! [`Experiment::warnings`].

use indexmap::IndexMap;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::daq::*;
use crate::error::{ConfigError, Error, Result};
use crate::registry::ChannelRegistry;
use crate::table::TraceTable;
use crate::tdms::{TdmsError, TdmsFile};
use crate::utils::{sample_count, TickTimer};

/// Analog input recorded in every run, carrying the camera's exposure output.
pub const READBACK_CHANNEL: &str = "camera_output";
/// Name of the analog-input task, and of the group the driver logs it under.
pub const AI_TASK_NAME: &str = "analog_inputs";
pub const DO_TASK_NAME: &str = "digital_outputs";
/// Slack added to the run duration for the blocking read.
pub const READ_TIMEOUT_MARGIN_S: f64 = 5.;

const LOG_EXTENSION: &str = "tdms";
const SNAPSHOT_EXTENSION: &str = "json";
const RESERVED_SNAPSHOT_KEYS: [&str; 2] = ["dataframe", "scan_info"];

/// Coerces a waveform to booleans (nonzero is high).
/// The flag reports whether any sample was neither exactly 0 nor exactly 1.
pub fn normalize_waveform(samples: &[f64]) -> (Vec<bool>, bool) {
    let non_binary = samples.iter().any(|&v| v != 0. && v != 1.);
    (samples.iter().map(|&v| v != 0.).collect(), non_binary)
}

/// Start trigger terminal of the device owning `line`, e.g. `Dev1/port0/line0` gives
/// `/Dev1/do/StartTrigger`.
pub fn do_start_trigger(line: &str) -> String {
    let device = line.split('/').next().unwrap_or(line);
    format!("/{}/do/StartTrigger", device)
}

#[derive(Debug, Clone)]
pub struct Experiment {
    registry: Arc<ChannelRegistry>,
    logfile: PathBuf,
    sample_rate: f64,
    duration: f64,
    n_samples: usize,
    do_data: IndexMap<String, Vec<bool>>,
    analog_inputs: Vec<String>,
    warnings: Vec<String>,
    snapshot_path: Option<PathBuf>,
}

impl Experiment {
    /// Validates a run request.
    ///
    /// # Errors
    /// A [`ConfigError`] when the rate or duration is not positive, when they yield no samples,
    /// when an output or a recording channel is missing from `registry`, when a waveform length
    /// differs from `trunc(sample_rate * duration)`, or when the log file's directory does not
    /// exist.
    pub fn new(
        registry: Arc<ChannelRegistry>,
        do_data: IndexMap<String, Vec<f64>>,
        logfile: impl Into<PathBuf>,
        sample_rate: f64,
        duration: f64,
    ) -> std::result::Result<Self, ConfigError> {
        if !(sample_rate.is_finite() && sample_rate > 0.) {
            return Err(ConfigError::NonPositiveRate(sample_rate));
        }
        if !(duration.is_finite() && duration > 0.) {
            return Err(ConfigError::NonPositiveDuration(duration));
        }
        let n_samples = sample_count(sample_rate, duration);
        if n_samples == 0 {
            return Err(ConfigError::NoSamples {
                sample_rate,
                duration,
            });
        }

        let mut warnings = Vec::new();
        let mut normalized = IndexMap::with_capacity(do_data.len());
        for (name, samples) in do_data {
            registry.digital_line(&name)?;
            if samples.len() != n_samples {
                return Err(ConfigError::WaveformLength {
                    name,
                    expected: n_samples,
                    found: samples.len(),
                });
            }
            let (waveform, non_binary) = normalize_waveform(&samples);
            if non_binary {
                let msg = format!(
                    "Waveform for {} contains values other than 0 and 1; nonzero samples are driven high",
                    name
                );
                log::warn!("{}", msg);
                warnings.push(msg);
            }
            normalized.insert(name, waveform);
        }

        let mut analog_inputs: Vec<String> = normalized.keys().cloned().collect();
        if !analog_inputs.iter().any(|n| n == READBACK_CHANNEL) {
            analog_inputs.push(READBACK_CHANNEL.to_string());
        }
        for name in &analog_inputs {
            registry.analog_input(name)?;
        }

        let mut logfile: PathBuf = logfile.into();
        if logfile.extension().map_or(true, |ext| ext != LOG_EXTENSION) {
            let renamed = logfile.with_extension(LOG_EXTENSION);
            let msg = format!(
                "Log file {} renamed to {}: the driver only logs TDMS files",
                logfile.display(),
                renamed.display()
            );
            log::warn!("{}", msg);
            warnings.push(msg);
            logfile = renamed;
        }
        if let Some(parent) = logfile.parent() {
            if !parent.as_os_str().is_empty() && !parent.is_dir() {
                return Err(ConfigError::MissingLogDirectory(logfile));
            }
        }

        log::debug!(
            "Experiment configured: {} samples at {} Hz, outputs {:?}, recording {:?}",
            n_samples,
            sample_rate,
            normalized.keys().collect::<Vec<_>>(),
            analog_inputs
        );
        Ok(Self {
            registry,
            logfile,
            sample_rate,
            duration,
            n_samples,
            do_data: normalized,
            analog_inputs,
            warnings,
            snapshot_path: None,
        })
    }

    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }
    pub fn logfile(&self) -> &Path {
        &self.logfile
    }
    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }
    pub fn duration(&self) -> f64 {
        self.duration
    }
    pub fn n_samples(&self) -> usize {
        self.n_samples
    }
    /// Normalized waveforms, in request order.
    pub fn do_data(&self) -> &IndexMap<String, Vec<bool>> {
        &self.do_data
    }
    /// Recording channels: the requested outputs, then the readback channel.
    pub fn analog_inputs(&self) -> &[String] {
        &self.analog_inputs
    }
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }
    /// Path of the last snapshot written by [`Experiment::save_dataframe`].
    pub fn snapshot_path(&self) -> Option<&Path> {
        self.snapshot_path.as_deref()
    }
    pub fn read_timeout(&self) -> f64 {
        self.duration + READ_TIMEOUT_MARGIN_S
    }

    /// Digital-output matrix: one row per requested output, one column per sample.
    pub fn do_matrix(&self) -> Array2<bool> {
        let mut matrix = Array2::from_elem((self.do_data.len(), self.n_samples), false);
        for (mut row, waveform) in matrix.rows_mut().into_iter().zip(self.do_data.values()) {
            for (dst, src) in row.iter_mut().zip(waveform) {
                *dst = *src;
            }
        }
        matrix
    }

    /// Plays the digital waveforms while recording every analog input to the log file.
    ///
    /// Blocks until the acquisition completes or [`Experiment::read_timeout`] elapses. Returns the
    /// samples read, one row per recording channel. Both hardware tasks are stopped and cleared
    /// before this returns, whether it succeeds or not.
    pub fn run_tasks(&self, driver: &dyn DaqDriver) -> Result<Array2<f64>> {
        let mut timer = TickTimer::new();
        log::info!(
            "Starting acquisition: {} s at {} Hz, logging to {}",
            self.duration,
            self.sample_rate,
            self.logfile.display()
        );
        let do_matrix = self.do_matrix();

        let mut ai_task = ScopedTask::new(driver.create_ai_task(AI_TASK_NAME)?);
        let mut do_task = ScopedTask::new(driver.create_do_task(DO_TASK_NAME)?);
        let result = self.program_and_acquire(&mut *ai_task, &mut *do_task, &do_matrix);
        drop(do_task);
        drop(ai_task);

        match &result {
            Ok(data) => {
                timer.tick_log(&format!("Acquired {} samples per channel", data.ncols()));
            }
            Err(err) => log::error!("Acquisition failed, tasks released: {}", err),
        }
        result
    }

    fn program_and_acquire(
        &self,
        ai_task: &mut dyn AiTask,
        do_task: &mut dyn DoTask,
        do_matrix: &Array2<bool>,
    ) -> Result<Array2<f64>> {
        let n_samples = self.n_samples as u64;

        for name in &self.analog_inputs {
            ai_task.add_ai_voltage_chan(self.registry.analog_input(name)?, name)?;
        }
        ai_task.cfg_samp_clk_timing(self.sample_rate, n_samples)?;
        ai_task.configure_logging(
            &self.logfile,
            LoggingMode::LogAndRead,
            LoggingOperation::CreateOrReplace,
        )?;
        let trigger = self
            .do_data
            .keys()
            .next()
            .map(|name| self.registry.digital_line(name).map(do_start_trigger))
            .transpose()?;
        if let Some(trigger) = &trigger {
            ai_task.cfg_dig_edge_start_trig(trigger)?;
        }
        log::debug!("Programmed {} with {:?}", AI_TASK_NAME, self.analog_inputs);

        for name in self.do_data.keys() {
            do_task.add_do_chan(
                self.registry.digital_line(name)?,
                name,
                LineGrouping::ChanPerLine,
            )?;
        }
        do_task.cfg_samp_clk_timing(self.sample_rate, n_samples)?;
        let written = do_task.write_digital_lines(do_matrix, false)?;
        log::debug!(
            "Wrote {} samples per line to {}",
            written,
            DO_TASK_NAME
        );

        // Armed on the digital start trigger, so both sides share sample 0
        ai_task.start()?;
        do_task.start()?;
        let timeout_s = self.read_timeout();
        ai_task
            .read_all(timeout_s)
            .map_err(|err| Error::from_daq(err, timeout_s))
    }

    /// Reads the recording channels back from the log file.
    ///
    /// The `time` column comes from the first channel's waveform properties, or from
    /// `i / sample_rate` when the log carries none.
    pub fn tdms_to_dataframe(&self) -> Result<TraceTable> {
        let file = TdmsFile::open(&self.logfile).map_err(|err| match err {
            TdmsError::Io(io) => Error::file(&self.logfile, io),
            other => Error::Container {
                path: self.logfile.clone(),
                source: other,
            },
        })?;

        let mut time = None;
        let mut traces = Vec::with_capacity(self.analog_inputs.len());
        for name in &self.analog_inputs {
            let channel =
                file.channel(AI_TASK_NAME, name)
                    .ok_or_else(|| Error::MissingChannel {
                        path: self.logfile.clone(),
                        group: AI_TASK_NAME.to_string(),
                        channel: name.clone(),
                    })?;
            match time.as_ref().map(Vec::len) {
                None => {
                    time = Some(channel.time_track().unwrap_or_else(|| {
                        (0..channel.len())
                            .map(|i| i as f64 / self.sample_rate)
                            .collect()
                    }));
                }
                Some(expected) if expected != channel.len() => {
                    return Err(Error::ChannelLength {
                        path: self.logfile.clone(),
                        channel: name.clone(),
                        expected,
                        found: channel.len(),
                    });
                }
                Some(_) => {}
            }
            traces.push((name.clone(), channel.data().to_vec()));
        }
        let table = TraceTable::new(time.unwrap_or_default(), traces);
        log::debug!(
            "Extracted {} rows x {} columns from {}",
            table.n_rows(),
            table.n_columns(),
            self.logfile.display()
        );
        Ok(table)
    }

    /// Writes `{"dataframe": table, "scan_info": scan_info, ...extras}` as JSON next to the log
    /// file, replacing any earlier snapshot, and returns its path.
    ///
    /// `extras` is passed through unvalidated, except that it may not reuse the two reserved keys.
    pub fn save_dataframe(
        &mut self,
        table: &TraceTable,
        scan_info: Value,
        extras: IndexMap<String, Value>,
    ) -> Result<PathBuf> {
        if let Some(key) = extras
            .keys()
            .find(|k| RESERVED_SNAPSHOT_KEYS.contains(&k.as_str()))
        {
            return Err(ConfigError::ReservedSnapshotKey(key.clone()).into());
        }
        let snapshot = SnapshotRef {
            dataframe: table,
            scan_info: &scan_info,
            extras: &extras,
        };
        let bytes = serde_json::to_vec_pretty(&snapshot)?;
        let path = self.logfile.with_extension(SNAPSHOT_EXTENSION);
        fs::write(&path, bytes).map_err(|e| Error::file(&path, e))?;
        log::info!("Saved run snapshot to {}", path.display());
        self.snapshot_path = Some(path.clone());
        Ok(path)
    }
}

#[derive(Serialize)]
struct SnapshotRef<'a> {
    dataframe: &'a TraceTable,
    scan_info: &'a Value,
    #[serde(flatten)]
    extras: &'a IndexMap<String, Value>,
}

/// Contents of a snapshot written by [`Experiment::save_dataframe`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub dataframe: TraceTable,
    pub scan_info: Value,
    #[serde(flatten)]
    pub extras: IndexMap<String, Value>,
}

impl RunSnapshot {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| Error::file(path, e))?;
        Ok(serde_json::from_str(&text)?)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sim::{SimDevice, SimFault, SimOperation};
    use crate::tdms::TdmsWriter;
    use maplit::{btreemap, convert_args};
    use serde_json::json;

    fn two_line_registry() -> Arc<ChannelRegistry> {
        Arc::new(
            ChannelRegistry::new(
                convert_args!(btreemap!(
                    "camera_trigger" => "Dev1/port0/line0",
                    "led365_trigger" => "Dev1/port0/line1",
                )),
                convert_args!(btreemap!(
                    "camera_trigger" => "Dev1/ai0",
                    "led365_trigger" => "Dev1/ai1",
                    "camera_output" => "Dev1/ai6",
                )),
            )
            .unwrap(),
        )
    }

    fn do_data(entries: &[(&str, Vec<f64>)]) -> IndexMap<String, Vec<f64>> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn camera_trigger_scenario() {
        let exp = Experiment::new(
            two_line_registry(),
            do_data(&[("camera_trigger", vec![1.; 100])]),
            "run.tdms",
            10.,
            10.,
        )
        .unwrap();
        assert_eq!(exp.n_samples(), 100);
        assert_eq!(exp.analog_inputs(), &["camera_trigger", "camera_output"]);
        assert!(exp.warnings().is_empty());
        assert_eq!(exp.read_timeout(), 15.);
    }

    #[test]
    fn recording_list_keeps_request_order() {
        let exp = Experiment::new(
            two_line_registry(),
            do_data(&[
                ("led365_trigger", vec![0.; 10]),
                ("camera_trigger", vec![1.; 10]),
            ]),
            "run.tdms",
            10.,
            1.,
        )
        .unwrap();
        assert_eq!(
            exp.analog_inputs(),
            &["led365_trigger", "camera_trigger", "camera_output"]
        );
        let matrix = exp.do_matrix();
        assert_eq!(matrix.shape(), &[2, 10]);
        assert!(!matrix[[0, 3]] && matrix[[1, 3]]);
    }

    #[test]
    fn unknown_output_is_rejected() {
        let err = Experiment::new(
            two_line_registry(),
            do_data(&[("pump", vec![0.; 10])]),
            "run.tdms",
            10.,
            1.,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownDigitalOutput { name, .. } if name == "pump"));
    }

    #[test]
    fn unrecorded_output_is_rejected() {
        let registry = ChannelRegistry::new(
            convert_args!(btreemap!("camera_trigger" => "Dev1/port0/line0")),
            convert_args!(btreemap!("camera_trigger" => "Dev1/ai0")),
        )
        .unwrap();
        let err = Experiment::new(
            Arc::new(registry),
            do_data(&[("camera_trigger", vec![0.; 10])]),
            "run.tdms",
            10.,
            1.,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownAnalogInput { name, .. } if name == READBACK_CHANNEL));
    }

    #[test]
    fn waveform_length_must_match() {
        let err = Experiment::new(
            two_line_registry(),
            do_data(&[("camera_trigger", vec![0.; 99])]),
            "run.tdms",
            10.,
            10.,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::WaveformLength {
                expected: 100,
                found: 99,
                ..
            }
        ));
    }

    #[test]
    fn rate_and_duration_must_be_positive() {
        let new = |rate, duration| {
            Experiment::new(two_line_registry(), IndexMap::new(), "run.tdms", rate, duration)
        };
        assert!(matches!(new(0., 1.), Err(ConfigError::NonPositiveRate(_))));
        assert!(matches!(new(f64::NAN, 1.), Err(ConfigError::NonPositiveRate(_))));
        assert!(matches!(new(10., -1.), Err(ConfigError::NonPositiveDuration(_))));
        assert!(matches!(new(1., 0.5), Err(ConfigError::NoSamples { .. })));
        assert_eq!(new(10000., 10.).unwrap().n_samples(), 100000);
        assert_eq!(new(10., 1.).unwrap().n_samples(), 10);
    }

    #[test]
    fn start_trigger_terminal() {
        assert_eq!(do_start_trigger("Dev1/port0/line4"), "/Dev1/do/StartTrigger");
        assert_eq!(
            do_start_trigger("PXI1Slot6/port0/line0:7"),
            "/PXI1Slot6/do/StartTrigger"
        );
    }

    #[test]
    fn normalization() {
        assert_eq!(
            normalize_waveform(&[0., 2., -1., 1.]),
            (vec![false, true, true, true], true)
        );
        let (once, _) = normalize_waveform(&[1., 0., 1.]);
        let as_f64: Vec<f64> = once.iter().map(|&b| b as u8 as f64).collect();
        assert_eq!(normalize_waveform(&as_f64), (once, false));
    }

    #[test]
    fn non_binary_waveform_warns() {
        let exp = Experiment::new(
            two_line_registry(),
            do_data(&[("camera_trigger", vec![0., 2., -1., 1., 0., 0., 0., 0., 0., 0.])]),
            "run.tdms",
            10.,
            1.,
        )
        .unwrap();
        assert_eq!(exp.warnings().len(), 1);
        assert!(exp.warnings()[0].contains("camera_trigger"));
        assert_eq!(&exp.do_data()["camera_trigger"][..4], &[false, true, true, true]);
    }

    #[test]
    fn log_file_checks() {
        let exp = Experiment::new(
            two_line_registry(),
            IndexMap::new(),
            "run.dat",
            10.,
            1.,
        )
        .unwrap();
        assert_eq!(exp.logfile(), Path::new("run.tdms"));
        assert_eq!(exp.warnings().len(), 1);

        let err = Experiment::new(
            two_line_registry(),
            IndexMap::new(),
            "/definitely/not/a/dir/run.tdms",
            10.,
            1.,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::MissingLogDirectory(_)));
    }

    #[test]
    fn run_extract_persist() {
        let dir = tempfile::tempdir().unwrap();
        let mut exp = Experiment::new(
            two_line_registry(),
            do_data(&[
                ("camera_trigger", (0..20).map(|i| (i % 2) as f64).collect()),
                ("led365_trigger", vec![1.; 20]),
            ]),
            dir.path().join("run.tdms"),
            100.,
            0.2,
        )
        .unwrap();
        let device = SimDevice::new();
        let data = exp.run_tasks(&device).unwrap();
        assert_eq!(data.shape(), &[3, 20]);
        assert!(device.all_released());
        let tasks = device.tasks();
        assert_eq!(tasks[0].start_trigger.as_deref(), Some("/Dev1/do/StartTrigger"));
        assert!(tasks[0].started && tasks[1].started);

        let table = exp.tdms_to_dataframe().unwrap();
        assert_eq!(
            table.column_names().collect::<Vec<_>>(),
            vec!["time", "camera_trigger", "led365_trigger", "camera_output"]
        );
        assert_eq!(table.n_rows(), 20);
        assert_eq!(table.column("camera_output").unwrap()[1], 5.);
        assert!((table.time()[19] - 0.19).abs() < 1e-9);
        assert_eq!(exp.tdms_to_dataframe().unwrap(), table);

        let mut extras = IndexMap::new();
        extras.insert("animal".to_string(), json!("m12"));
        let path = exp
            .save_dataframe(&table, json!({"odor": "A", "trial": 3}), extras.clone())
            .unwrap();
        assert_eq!(path, dir.path().join("run.json"));
        assert_eq!(exp.snapshot_path(), Some(path.as_path()));

        let snapshot = RunSnapshot::load(&path).unwrap();
        assert_eq!(snapshot.dataframe, table);
        assert_eq!(snapshot.scan_info, json!({"odor": "A", "trial": 3}));
        assert_eq!(snapshot.extras, extras);
    }

    #[test]
    fn reserved_extras_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut exp = Experiment::new(
            two_line_registry(),
            IndexMap::new(),
            dir.path().join("run.tdms"),
            10.,
            1.,
        )
        .unwrap();
        let table = TraceTable::new(vec![0.], Vec::new());
        let mut extras = IndexMap::new();
        extras.insert("scan_info".to_string(), json!(1));
        let err = exp.save_dataframe(&table, Value::Null, extras).unwrap_err();
        assert!(matches!(
            err,
            Error::Config(ConfigError::ReservedSnapshotKey(key)) if key == "scan_info"
        ));
        assert!(exp.snapshot_path().is_none());
    }

    #[test]
    fn missing_log_is_a_file_error() {
        let dir = tempfile::tempdir().unwrap();
        let exp = Experiment::new(
            two_line_registry(),
            IndexMap::new(),
            dir.path().join("never_run.tdms"),
            10.,
            1.,
        )
        .unwrap();
        assert!(matches!(exp.tdms_to_dataframe(), Err(Error::File { .. })));
    }

    #[test]
    fn ragged_channels_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let exp = Experiment::new(
            two_line_registry(),
            do_data(&[("camera_trigger", vec![1.; 10])]),
            dir.path().join("run.tdms"),
            10.,
            1.,
        )
        .unwrap();
        let mut writer = TdmsWriter::new();
        writer.add_channel(AI_TASK_NAME, "camera_trigger", vec![5.; 10], Default::default());
        writer.add_channel(AI_TASK_NAME, READBACK_CHANNEL, vec![5.; 9], Default::default());
        writer.write(exp.logfile()).unwrap();
        match exp.tdms_to_dataframe() {
            Err(Error::ChannelLength {
                channel,
                expected,
                found,
                ..
            }) => {
                assert_eq!(channel, READBACK_CHANNEL);
                assert_eq!((expected, found), (10, 9));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn hardware_fault_releases_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let exp = Experiment::new(
            two_line_registry(),
            do_data(&[("camera_trigger", vec![1.; 10])]),
            dir.path().join("run.tdms"),
            10.,
            1.,
        )
        .unwrap();
        let device = SimDevice::with_fault(SimFault::FailAt {
            operation: SimOperation::AddDoChan,
            code: -200170,
        });
        match exp.run_tasks(&device) {
            Err(Error::Hardware(err)) => assert_eq!(err.code, -200170),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(device.tasks().len(), 2);
        assert!(device.all_released());
    }
}
