//! Symbolic channel names mapped to hardware addresses.
//!
//! A [`ChannelRegistry`] holds two tables: digital-output names to DO line addresses
//! (`Dev1/port0/line0`) and analog-input names to AI addresses (`Dev1/ai0`). It is validated when
//! built and immutable afterwards; experiments share it through an `Arc`.
//!
//! Registries come from three places:
//! - [`ChannelRegistry::imaging_rig`], the wiring of the one-photon imaging rig,
//! - a TOML file with `[digital_outputs]` and `[analog_inputs]` tables ([`ChannelRegistry::load`]),
//! - [`ChannelRegistry::new`] with explicit tables.
//!
//! ```toml
//! [digital_outputs]
//! camera_trigger = "Dev1/port0/line0"
//!
//! [analog_inputs]
//! camera_trigger = "Dev1/ai0"
//! camera_output = "Dev1/ai6"
//! ```

use maplit::{btreemap, convert_args};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::error::{ConfigError, Error, Result};

const DIGITAL_LINE_PATTERN: &str = r"^[^/\s]+/port\d+/line\d+$";
const DIGITAL_LINE_FORMAT: &str = "(device)/port(number)/line(number)";
const ANALOG_INPUT_PATTERN: &str = r"^[^/\s]+/ai\d+$";
const ANALOG_INPUT_FORMAT: &str = "(device)/ai(number)";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRegistry {
    digital_outputs: BTreeMap<String, String>,
    analog_inputs: BTreeMap<String, String>,
}

impl ChannelRegistry {
    /// Builds a registry, checking every address against its expected format.
    pub fn new(
        digital_outputs: BTreeMap<String, String>,
        analog_inputs: BTreeMap<String, String>,
    ) -> std::result::Result<Self, ConfigError> {
        validate_addresses(&digital_outputs, "digital line", DIGITAL_LINE_PATTERN, DIGITAL_LINE_FORMAT)?;
        validate_addresses(&analog_inputs, "analog input", ANALOG_INPUT_PATTERN, ANALOG_INPUT_FORMAT)?;
        Ok(Self {
            digital_outputs,
            analog_inputs,
        })
    }

    /// Wiring of the imaging rig on device `Dev1`.
    pub fn imaging_rig() -> Self {
        Self {
            digital_outputs: convert_args!(btreemap!(
                "camera_trigger" => "Dev1/port0/line0",
                "led365_trigger" => "Dev1/port0/line1",
                "led450_trigger" => "Dev1/port0/line2",
                "led550_trigger" => "Dev1/port0/line4",
                "pump" => "Dev1/port0/line5",
            )),
            analog_inputs: convert_args!(btreemap!(
                "camera_trigger" => "Dev1/ai0",
                "led365_trigger" => "Dev1/ai1",
                "led450_trigger" => "Dev1/ai2",
                "led550_trigger" => "Dev1/ai3",
                "led635_trigger" => "Dev1/ai4",
                "pump_trigger" => "Dev1/ai5",
                "camera_output" => "Dev1/ai6",
            )),
        }
    }

    pub fn from_toml_str(s: &str) -> std::result::Result<Self, ConfigError> {
        let parsed: ChannelRegistry =
            toml::from_str(s).map_err(|e| ConfigError::RegistryParse(e.to_string()))?;
        Self::new(parsed.digital_outputs, parsed.analog_inputs)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|e| Error::file(path, e))?;
        let registry = Self::from_toml_str(&contents)?;
        log::debug!(
            "Loaded channel registry from {} ({} digital outputs, {} analog inputs)",
            path.display(),
            registry.digital_outputs.len(),
            registry.analog_inputs.len()
        );
        Ok(registry)
    }

    pub fn to_toml_string(&self) -> std::result::Result<String, ConfigError> {
        toml::to_string(self).map_err(|e| ConfigError::RegistryParse(e.to_string()))
    }

    /// Hardware address of a digital output.
    pub fn digital_line(&self, name: &str) -> std::result::Result<&str, ConfigError> {
        self.digital_outputs
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| ConfigError::UnknownDigitalOutput {
                name: name.to_string(),
                registered: self.digital_output_names().map(String::from).collect(),
            })
    }

    /// Hardware address of an analog input.
    pub fn analog_input(&self, name: &str) -> std::result::Result<&str, ConfigError> {
        self.analog_inputs
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| ConfigError::UnknownAnalogInput {
                name: name.to_string(),
                registered: self.analog_input_names().map(String::from).collect(),
            })
    }

    pub fn digital_output_names(&self) -> impl Iterator<Item = &str> {
        self.digital_outputs.keys().map(String::as_str)
    }

    pub fn analog_input_names(&self) -> impl Iterator<Item = &str> {
        self.analog_inputs.keys().map(String::as_str)
    }
}

fn validate_addresses(
    table: &BTreeMap<String, String>,
    kind: &'static str,
    pattern: &str,
    format: &'static str,
) -> std::result::Result<(), ConfigError> {
    let re = Regex::new(pattern).map_err(|e| ConfigError::RegistryParse(e.to_string()))?;
    for (name, address) in table {
        if !re.is_match(address) {
            return Err(ConfigError::MalformedAddress {
                name: name.clone(),
                kind,
                address: address.clone(),
                expected: format,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn builtin_rig_is_valid() {
        let rig = ChannelRegistry::imaging_rig();
        let rebuilt =
            ChannelRegistry::new(rig.digital_outputs.clone(), rig.analog_inputs.clone()).unwrap();
        assert_eq!(rebuilt, rig);
        assert_eq!(rig.digital_line("led550_trigger").unwrap(), "Dev1/port0/line4");
        assert_eq!(rig.analog_input("camera_output").unwrap(), "Dev1/ai6");
    }

    #[test]
    fn unknown_names_list_registered() {
        let rig = ChannelRegistry::imaging_rig();
        match rig.digital_line("led635_trigger") {
            Err(ConfigError::UnknownDigitalOutput { name, registered }) => {
                assert_eq!(name, "led635_trigger");
                assert!(registered.contains(&"pump".to_string()));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            rig.analog_input("pump"),
            Err(ConfigError::UnknownAnalogInput { .. })
        ));
    }

    #[test]
    fn rejects_malformed_addresses() {
        let err = ChannelRegistry::new(
            convert_args!(btreemap!("camera_trigger" => "port0/line0")),
            BTreeMap::new(),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::MalformedAddress { kind: "digital line", .. }));

        let err = ChannelRegistry::new(
            BTreeMap::new(),
            convert_args!(btreemap!("camera_output" => "Dev1/port0/line6")),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::MalformedAddress { kind: "analog input", .. }));
    }

    #[test]
    fn toml_registry() {
        let registry = ChannelRegistry::from_toml_str(
            r#"
            [digital_outputs]
            camera_trigger = "PXI1Slot6/port0/line0"

            [analog_inputs]
            camera_trigger = "PXI1Slot3/ai0"
            camera_output = "PXI1Slot3/ai1"
            "#,
        )
        .unwrap();
        assert_eq!(registry.digital_line("camera_trigger").unwrap(), "PXI1Slot6/port0/line0");
        assert_eq!(registry.analog_input_names().collect::<Vec<_>>(), vec!["camera_output", "camera_trigger"]);

        let text = ChannelRegistry::imaging_rig().to_toml_string().unwrap();
        assert_eq!(ChannelRegistry::from_toml_str(&text).unwrap(), ChannelRegistry::imaging_rig());

        assert!(matches!(
            ChannelRegistry::from_toml_str("[digital_outputs]\ncamera_trigger = 3"),
            Err(ConfigError::RegistryParse(_))
        ));
    }
}
