use clap::Parser;
use imagingrig_backend::*;
use indexmap::IndexMap;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;

/// Demo run: camera triggers at 20 Hz with the 365 nm LED on for the first half.
#[derive(Parser)]
#[command(name = "imagingrig_backend_bin")]
#[command(about = "Runs a camera and LED acquisition on the imaging rig", long_about = None)]
struct Args {
    /// Run on the NI device instead of the simulator (needs the nidaqmx feature)
    #[arg(long)]
    hardware: bool,

    /// Sample rate in Hz
    #[arg(long, default_value_t = 1000.)]
    sample_rate: f64,

    /// Run duration in seconds
    #[arg(long, default_value_t = 2.)]
    duration: f64,

    /// TDMS log file, defaults to imagingrig_demo.tdms in the temp directory
    #[arg(long)]
    logfile: Option<PathBuf>,

    /// Channel registry TOML file, defaults to the built-in Dev1 wiring
    #[arg(long)]
    registry: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let n_samples = utils::sample_count(args.sample_rate, args.duration);
    let camera_period = ((args.sample_rate / 20.) as usize).max(1);
    let camera: Vec<f64> = (0..n_samples)
        .map(|i| if i % camera_period < camera_period.div_ceil(10) { 1. } else { 0. })
        .collect();
    let led: Vec<f64> = (0..n_samples)
        .map(|i| if i < n_samples / 2 { 1. } else { 0. })
        .collect();

    let mut do_data = IndexMap::new();
    do_data.insert("camera_trigger".to_string(), camera);
    do_data.insert("led365_trigger".to_string(), led);

    let registry = match &args.registry {
        Some(path) => ChannelRegistry::load(path)?,
        None => ChannelRegistry::imaging_rig(),
    };
    let logfile = args
        .logfile
        .unwrap_or_else(|| std::env::temp_dir().join("imagingrig_demo.tdms"));
    let mut exp = Experiment::new(
        Arc::new(registry),
        do_data,
        logfile,
        args.sample_rate,
        args.duration,
    )?;

    let data = if args.hardware {
        #[cfg(feature = "nidaqmx")]
        {
            exp.run_tasks(&NiDriver)?
        }
        #[cfg(not(feature = "nidaqmx"))]
        {
            log::error!("--hardware requires building with the nidaqmx feature");
            return Ok(());
        }
    } else {
        exp.run_tasks(&SimDevice::with_config(SimConfig {
            realtime: true,
            ..Default::default()
        }))?
    };
    log::info!("Read {} channels x {} samples", data.nrows(), data.ncols());

    let table = exp.tdms_to_dataframe()?;
    let mut extras = IndexMap::new();
    extras.insert("note".to_string(), json!("demo run"));
    let path = exp.save_dataframe(&table, json!({"stimulus": "led365", "trial": 0}), extras)?;
    log::info!("Snapshot with {} rows written to {}", table.n_rows(), path.display());
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn arguments() {
        Args::command().debug_assert();

        let args = Args::try_parse_from(["imagingrig_backend_bin"]).unwrap();
        assert!(!args.hardware);
        assert_eq!((args.sample_rate, args.duration), (1000., 2.));
        assert!(args.logfile.is_none() && args.registry.is_none());

        let args = Args::try_parse_from([
            "imagingrig_backend_bin",
            "--hardware",
            "--sample-rate",
            "500",
            "--logfile",
            "/data/run.tdms",
        ])
        .unwrap();
        assert!(args.hardware);
        assert_eq!(args.sample_rate, 500.);
        assert_eq!(args.logfile, Some(PathBuf::from("/data/run.tdms")));

        assert!(Args::try_parse_from(["imagingrig_backend_bin", "--duration", "two"]).is_err());
    }
}
