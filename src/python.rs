//! Python bindings for [`Experiment`], built with the `python` feature.
//!
//! ```python
//! from imagingrig_backend import Experiment
//! import numpy as np
//!
//! exp = Experiment({"camera_trigger": np.ones(100)}, "run.tdms", sample_rate=10, duration=10,
//!                  simulate=True)
//! exp.run_tasks()
//! df = exp.tdms_to_dataframe()
//! exp.save_dataframe(df, {"odor": "A"}, animal="m12")
//! ```
//!
//! Crate errors map onto Python exceptions: configuration problems raise `ValueError`, expired
//! reads raise `TimeoutError`, missing files raise `FileNotFoundError` (other I/O failures
//! `OSError`), missing channels raise `KeyError` and driver faults raise `RuntimeError`.

use indexmap::IndexMap;
use numpy::{IntoPyArray, PyArray2};
use pyo3::exceptions::{
    PyFileNotFoundError, PyKeyError, PyOSError, PyRuntimeError, PyTimeoutError, PyTypeError,
    PyValueError,
};
use pyo3::prelude::*;
use pyo3::types::{PyBool, PyDict, PyFloat, PyList, PyLong, PyString, PyTuple};
use serde_json::Value;
use std::sync::Arc;

use crate::daq::DaqDriver;
use crate::error::Error;
use crate::experiment::Experiment;
use crate::registry::ChannelRegistry;
use crate::sim::SimDevice;
use crate::table::{TraceTable, TIME_COLUMN};

impl From<Error> for PyErr {
    fn from(err: Error) -> PyErr {
        let msg = err.to_string();
        match err {
            Error::Config(_)
            | Error::Container { .. }
            | Error::ChannelLength { .. }
            | Error::Snapshot(_) => {
                PyValueError::new_err(msg)
            }
            Error::Timeout { .. } => PyTimeoutError::new_err(msg),
            Error::File { source, .. } if source.kind() == std::io::ErrorKind::NotFound => {
                PyFileNotFoundError::new_err(msg)
            }
            Error::File { .. } => PyOSError::new_err(msg),
            Error::MissingChannel { .. } => PyKeyError::new_err(msg),
            Error::Hardware(_) => PyRuntimeError::new_err(msg),
        }
    }
}

/// Converts a Python value for the snapshot. numpy arrays and scalars go through `tolist()`,
/// pandas objects through `to_dict()`. Dict keys are stringified, non-finite floats become null.
fn to_json(obj: &PyAny) -> PyResult<Value> {
    if obj.is_none() {
        return Ok(Value::Null);
    }
    // bool before int: Python bools are ints
    if let Ok(b) = obj.downcast::<PyBool>() {
        return Ok(Value::Bool(b.is_true()));
    }
    if obj.downcast::<PyLong>().is_ok() {
        if let Ok(v) = obj.extract::<i64>() {
            return Ok(Value::from(v));
        }
        if let Ok(v) = obj.extract::<u64>() {
            return Ok(Value::from(v));
        }
        return Ok(Value::from(obj.extract::<f64>()?));
    }
    if let Ok(f) = obj.downcast::<PyFloat>() {
        return Ok(Value::from(f.value()));
    }
    if let Ok(s) = obj.downcast::<PyString>() {
        return Ok(Value::String(s.to_str()?.to_string()));
    }
    if let Ok(dict) = obj.downcast::<PyDict>() {
        let mut map = serde_json::Map::with_capacity(dict.len());
        for (key, value) in dict.iter() {
            map.insert(key.str()?.to_str()?.to_string(), to_json(value)?);
        }
        return Ok(Value::Object(map));
    }
    if let Ok(list) = obj.downcast::<PyList>() {
        return list.iter().map(to_json).collect::<PyResult<_>>().map(Value::Array);
    }
    if let Ok(tuple) = obj.downcast::<PyTuple>() {
        return tuple.iter().map(to_json).collect::<PyResult<_>>().map(Value::Array);
    }
    for method in ["tolist", "to_dict"] {
        if obj.hasattr(method)? {
            return to_json(obj.call_method0(method)?);
        }
    }
    Err(PyTypeError::new_err(format!(
        "Values of type {} cannot be stored in a run snapshot",
        obj.get_type().name()?
    )))
}

#[pyclass(name = "Experiment")]
pub struct PyExperiment {
    inner: Experiment,
    simulate: bool,
}

impl PyExperiment {
    fn driver(&self) -> PyResult<Box<dyn DaqDriver + Send>> {
        if self.simulate {
            return Ok(Box::new(SimDevice::new()));
        }
        #[cfg(feature = "nidaqmx")]
        {
            Ok(Box::new(crate::nidaqmx::NiDriver))
        }
        #[cfg(not(feature = "nidaqmx"))]
        {
            Err(PyRuntimeError::new_err(
                "Built without the nidaqmx feature; pass simulate=True",
            ))
        }
    }
}

#[pymethods]
impl PyExperiment {
    #[new]
    #[pyo3(signature = (do_data, logfilename, sample_rate=10000., duration=10., registry_path=None, simulate=false))]
    fn new(
        do_data: &PyDict,
        logfilename: &str,
        sample_rate: f64,
        duration: f64,
        registry_path: Option<&str>,
        simulate: bool,
    ) -> PyResult<Self> {
        let registry = match registry_path {
            Some(path) => ChannelRegistry::load(path)?,
            None => ChannelRegistry::imaging_rig(),
        };
        let mut waveforms = IndexMap::with_capacity(do_data.len());
        for (name, samples) in do_data.iter() {
            waveforms.insert(name.extract::<String>()?, samples.extract::<Vec<f64>>()?);
        }
        let inner = Experiment::new(
            Arc::new(registry),
            waveforms,
            logfilename,
            sample_rate,
            duration,
        )
        .map_err(Error::from)?;
        Ok(Self { inner, simulate })
    }

    /// Runs the acquisition and returns the samples read, one row per recording channel.
    fn run_tasks<'py>(&self, py: Python<'py>) -> PyResult<&'py PyArray2<f64>> {
        let driver = self.driver()?;
        let inner = &self.inner;
        let data = py.allow_threads(move || inner.run_tasks(driver.as_ref()))?;
        Ok(data.into_pyarray(py))
    }

    /// Returns an ordered dict of column name to numpy array, `time` first.
    fn tdms_to_dataframe<'py>(&self, py: Python<'py>) -> PyResult<&'py PyDict> {
        let table = self.inner.tdms_to_dataframe()?;
        let dict = PyDict::new(py);
        for (name, column) in table.columns() {
            dict.set_item(name, column.to_vec().into_pyarray(py))?;
        }
        Ok(dict)
    }

    #[pyo3(signature = (dataframe, scan_info, **kwargs))]
    fn save_dataframe(
        &mut self,
        dataframe: &PyDict,
        scan_info: &PyAny,
        kwargs: Option<&PyDict>,
    ) -> PyResult<String> {
        let time: Vec<f64> = dataframe
            .get_item(TIME_COLUMN)
            .ok_or_else(|| PyKeyError::new_err(TIME_COLUMN))?
            .extract()?;
        let mut traces = Vec::new();
        for (name, column) in dataframe.iter() {
            let name: String = name.extract()?;
            if name != TIME_COLUMN {
                traces.push((name, column.extract::<Vec<f64>>()?));
            }
        }
        let table = TraceTable::new(time, traces);

        let mut extras = IndexMap::new();
        if let Some(kwargs) = kwargs {
            for (key, value) in kwargs.iter() {
                extras.insert(key.extract::<String>()?, to_json(value)?);
            }
        }
        let path = self
            .inner
            .save_dataframe(&table, to_json(scan_info)?, extras)?;
        Ok(path.to_string_lossy().into_owned())
    }

    #[getter]
    fn n_samples(&self) -> usize {
        self.inner.n_samples()
    }

    #[getter]
    fn analog_inputs(&self) -> Vec<String> {
        self.inner.analog_inputs().to_vec()
    }

    #[getter]
    fn warnings(&self) -> Vec<String> {
        self.inner.warnings().to_vec()
    }

    #[getter]
    fn logfile(&self) -> String {
        self.inner.logfile().to_string_lossy().into_owned()
    }

    #[getter]
    fn snapshot_path(&self) -> Option<String> {
        self.inner
            .snapshot_path()
            .map(|p| p.to_string_lossy().into_owned())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use numpy::PyArray1;
    use serde_json::json;

    #[test]
    fn numpy_values_become_json() {
        pyo3::prepare_freethreaded_python();
        Python::with_gil(|py| {
            let mask = PyArray1::from_vec(py, vec![0., 1.5, 0.]);
            assert_eq!(to_json(mask).unwrap(), json!([0., 1.5, 0.]));

            // numpy integer scalar
            let counts = mask.call_method1("astype", ("int64",)).unwrap();
            assert_eq!(to_json(counts.get_item(1).unwrap()).unwrap(), json!(1));

            let info = PyDict::new(py);
            info.set_item("roi", PyArray1::from_vec(py, vec![10i64, 20])).unwrap();
            info.set_item(3, "three").unwrap();
            info.set_item("nested", (1, None::<i32>, true, f64::NAN)).unwrap();
            assert_eq!(
                to_json(info).unwrap(),
                json!({"roi": [10, 20], "3": "three", "nested": [1, null, true, null]})
            );

            assert!(to_json(py.eval("object()", None, None).unwrap()).is_err());
        });
    }
}
