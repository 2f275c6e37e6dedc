use imagingrig_backend::*;
use indexmap::IndexMap;
use serde_json::json;
use std::sync::Arc;

fn rig() -> Arc<ChannelRegistry> {
    Arc::new(ChannelRegistry::imaging_rig())
}

fn pulses(n: usize, period: usize) -> Vec<f64> {
    (0..n).map(|i| if i % period == 0 { 1. } else { 0. }).collect()
}

fn fast_sim(fault: Option<SimFault>) -> SimDevice {
    SimDevice::with_config(SimConfig {
        time_scale: 0.01,
        fault,
        ..Default::default()
    })
}

#[test]
fn full_run_on_simulator() {
    let dir = tempfile::tempdir().unwrap();
    let mut do_data = IndexMap::new();
    do_data.insert("camera_trigger".to_string(), pulses(50, 5));
    do_data.insert("led450_trigger".to_string(), vec![1.; 50]);
    do_data.insert("pump".to_string(), vec![0.; 50]);

    // "pump" has no analog readback on the rig
    let err = Experiment::new(rig(), do_data.clone(), dir.path().join("run.tdms"), 50., 1.)
        .unwrap_err();
    assert!(matches!(err, ConfigError::UnknownAnalogInput { ref name, .. } if name == "pump"));

    do_data.shift_remove("pump");
    let mut exp = Experiment::new(rig(), do_data, dir.path().join("run.tdms"), 50., 1.).unwrap();
    assert_eq!(
        exp.analog_inputs(),
        &["camera_trigger", "led450_trigger", "camera_output"]
    );

    let device = SimDevice::new();
    let data = exp.run_tasks(&device).unwrap();
    assert_eq!(data.shape(), &[3, 50]);
    assert!(device.all_released());

    // Tasks were programmed through the registry
    let tasks = device.tasks();
    assert_eq!(tasks[0].name, "analog_inputs");
    assert_eq!(
        tasks[0].channels,
        vec![
            ("Dev1/ai0".to_string(), "camera_trigger".to_string()),
            ("Dev1/ai2".to_string(), "led450_trigger".to_string()),
            ("Dev1/ai6".to_string(), "camera_output".to_string()),
        ]
    );
    assert_eq!(tasks[1].name, "digital_outputs");
    assert_eq!(tasks[1].channels[1].0, "Dev1/port0/line2");
    assert_eq!(tasks[1].timing, Some((50., 50)));
    assert_eq!(tasks[0].start_trigger.as_deref(), Some("/Dev1/do/StartTrigger"));
    assert!(tasks.iter().all(|t| t.started));

    let table = exp.tdms_to_dataframe().unwrap();
    assert_eq!(table.n_rows(), exp.n_samples());
    assert_eq!(
        table.column_names().collect::<Vec<_>>(),
        vec!["time", "camera_trigger", "led450_trigger", "camera_output"]
    );
    assert_eq!(table.column("camera_output"), table.column("camera_trigger"));
    assert_eq!(table.column("led450_trigger").unwrap(), &[5.; 50][..]);
    assert_eq!(exp.tdms_to_dataframe().unwrap(), table);

    let mut extras = IndexMap::new();
    extras.insert("roi".to_string(), json!([[10, 20], [30, 40]]));
    extras.insert("notes".to_string(), json!(null));
    let path = exp
        .save_dataframe(&table, json!("baseline"), extras.clone())
        .unwrap();
    assert_eq!(path.extension().unwrap(), "json");

    let snapshot = RunSnapshot::load(&path).unwrap();
    assert_eq!(snapshot.dataframe, table);
    assert_eq!(snapshot.scan_info, json!("baseline"));
    assert_eq!(snapshot.extras, extras);

    // A second save overwrites the first
    let path2 = exp
        .save_dataframe(&table, json!("second"), IndexMap::new())
        .unwrap();
    assert_eq!(path, path2);
    assert_eq!(RunSnapshot::load(&path2).unwrap().scan_info, json!("second"));
}

#[test]
fn read_timeout_releases_tasks() {
    let dir = tempfile::tempdir().unwrap();
    let mut do_data = IndexMap::new();
    do_data.insert("camera_trigger".to_string(), vec![1.; 10]);
    let exp = Experiment::new(rig(), do_data, dir.path().join("run.tdms"), 100., 0.1).unwrap();

    let device = fast_sim(Some(SimFault::Stall));
    match exp.run_tasks(&device) {
        Err(Error::Timeout { timeout_s, source }) => {
            assert!((timeout_s - 5.1).abs() < 1e-9);
            assert!(source.is_timeout());
        }
        other => panic!("expected a timeout, got {:?}", other),
    }
    assert_eq!(device.tasks().len(), 2);
    assert!(device.all_released());
    assert!(!dir.path().join("run.tdms").exists());
}

#[test]
fn every_failure_point_releases_tasks() {
    let dir = tempfile::tempdir().unwrap();
    let mut do_data = IndexMap::new();
    do_data.insert("camera_trigger".to_string(), vec![1.; 10]);
    do_data.insert("led365_trigger".to_string(), vec![0.; 10]);
    let exp = Experiment::new(rig(), do_data, dir.path().join("run.tdms"), 100., 0.1).unwrap();

    let failing = [
        SimOperation::CreateAiTask,
        SimOperation::CreateDoTask,
        SimOperation::AddAiChan,
        SimOperation::AiTiming,
        SimOperation::ConfigureLogging,
        SimOperation::StartTrigger,
        SimOperation::AddDoChan,
        SimOperation::DoTiming,
        SimOperation::WriteDigital,
        SimOperation::StartAi,
        SimOperation::StartDo,
        SimOperation::ReadAll,
    ];
    for operation in failing {
        let device = fast_sim(Some(SimFault::FailAt {
            operation,
            code: -200279,
        }));
        match exp.run_tasks(&device) {
            Err(Error::Hardware(err)) => assert_eq!(err.code, -200279, "{:?}", operation),
            other => panic!("{:?}: unexpected {:?}", operation, other),
        }
        assert!(device.all_released(), "{:?} leaked a task", operation);
    }
}

#[test]
fn release_failures_do_not_mask_the_result() {
    let dir = tempfile::tempdir().unwrap();
    let mut do_data = IndexMap::new();
    do_data.insert("camera_trigger".to_string(), vec![1.; 10]);
    let exp = Experiment::new(rig(), do_data, dir.path().join("run.tdms"), 100., 0.1).unwrap();

    let device = fast_sim(Some(SimFault::FailAt {
        operation: SimOperation::Stop,
        code: -200010,
    }));
    let data = exp.run_tasks(&device).unwrap();
    assert_eq!(data.shape(), &[2, 10]);
    assert!(device.all_released());
}

#[test]
fn registry_file_drives_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let registry_path = dir.path().join("rig.toml");
    std::fs::write(
        &registry_path,
        r#"
[digital_outputs]
shutter = "PXI1Slot6/port0/line3"

[analog_inputs]
shutter = "PXI1Slot3/ai2"
camera_output = "PXI1Slot3/ai7"
"#,
    )
    .unwrap();
    let registry = Arc::new(ChannelRegistry::load(&registry_path).unwrap());

    let mut do_data = IndexMap::new();
    do_data.insert("shutter".to_string(), vec![0., 1., 1., 0.]);
    let exp = Experiment::new(registry, do_data, dir.path().join("shutter"), 4., 1.).unwrap();
    assert_eq!(exp.logfile(), dir.path().join("shutter.tdms"));
    assert_eq!(exp.warnings().len(), 1);

    let device = SimDevice::new();
    exp.run_tasks(&device).unwrap();
    let table = exp.tdms_to_dataframe().unwrap();
    assert_eq!(table.column("shutter").unwrap(), &[0., 5., 5., 0.]);
    // No camera_trigger line: the readback stays low
    assert_eq!(table.column("camera_output").unwrap(), &[0.; 4]);
    assert_eq!(device.tasks()[1].channels[0].0, "PXI1Slot6/port0/line3");
    assert_eq!(
        device.tasks()[0].start_trigger.as_deref(),
        Some("/PXI1Slot6/do/StartTrigger")
    );
}

#[test]
fn foreign_log_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut do_data = IndexMap::new();
    do_data.insert("camera_trigger".to_string(), vec![1.; 10]);
    let exp = Experiment::new(rig(), do_data, dir.path().join("run.tdms"), 10., 1.).unwrap();

    std::fs::write(exp.logfile(), b"definitely not a TDMS container").unwrap();
    assert!(matches!(exp.tdms_to_dataframe(), Err(Error::Container { .. })));

    // A valid container without the recording channels
    let mut writer = imagingrig_backend::tdms::TdmsWriter::new();
    writer.add_channel("analog_inputs", "camera_trigger", vec![0.; 10], Default::default());
    writer.write(exp.logfile()).unwrap();
    match exp.tdms_to_dataframe() {
        Err(Error::MissingChannel { group, channel, .. }) => {
            assert_eq!(group, "analog_inputs");
            assert_eq!(channel, "camera_output");
        }
        other => panic!("unexpected {:?}", other),
    }

    // Declared sizes that overflow are container errors
    let valid = writer.to_bytes();
    let mut bytes = valid.clone();
    bytes[20..28].copy_from_slice(&(u64::MAX - 8).to_le_bytes());
    std::fs::write(exp.logfile(), &bytes).unwrap();
    assert!(matches!(exp.tdms_to_dataframe(), Err(Error::Container { .. })));

    // Dimension 1 followed by the channel's value count
    let index = [&1u32.to_le_bytes()[..], &10u64.to_le_bytes()[..]].concat();
    let at = valid
        .windows(index.len())
        .position(|w| w == index.as_slice())
        .unwrap()
        + 4;
    let mut bytes = valid;
    bytes[at..at + 8].copy_from_slice(&(u64::MAX / 4).to_le_bytes());
    std::fs::write(exp.logfile(), &bytes).unwrap();
    assert!(matches!(exp.tdms_to_dataframe(), Err(Error::Container { .. })));
}
