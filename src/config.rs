use std::{path::Path, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    bridge::BridgeSettings,
    error::Error,
    serial::connection::ConnectionConfig,
};

/// The configuration used for running the bridge and its server.
///
/// Every field may be left out of a config file, in which case the default is used.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// The serial port to read from.
    /// Likely "/dev/ttyACMx" or "COMx".
    pub port: String,

    /// The speed of the serial port.
    pub baud: u32,

    /// Open the port right away when starting.
    /// If not, nothing is read until settings are applied.
    pub auto_connect: bool,

    /// Which TCP port the server listens on.
    pub listen_port: u16,

    /// Longest time a serial read blocks, in milliseconds.
    pub poll_interval_ms: u64,

    /// How many lines may queue up for a single subscriber.
    pub queue_capacity: usize,

    /// How many lines in a row a subscriber may miss before it is dropped.
    pub max_saturation: usize,

    /// If set, logs are also written to daily files in this directory.
    pub log_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        let bridge = BridgeSettings::default();

        Self {
            port: "COM3".into(),
            baud: 9600,
            auto_connect: true,
            listen_port: crate::server::DEFAULT_PORT,
            poll_interval_ms: bridge.poll_interval.as_millis() as u64,
            queue_capacity: bridge.queue_capacity,
            max_saturation: bridge.max_saturation,
            log_dir: None,
        }
    }
}

impl Config {
    fn ron() -> ron::Options {
        ron::Options::default()
            .with_default_extension(ron::extensions::Extensions::IMPLICIT_SOME)
            .with_default_extension(ron::extensions::Extensions::UNWRAP_NEWTYPES)
    }

    /// Deserialize a .ron file's contents.
    pub fn deserialize(input: &str) -> Result<Self, Error> {
        Self::ron()
            .from_str::<Config>(input)
            .map_err(|e| Error::BadConfig(format!("Could not parse config: {e}")))
    }

    /// An example configuration with some fields filled in.
    pub fn example() -> Self {
        Self {
            port: "/dev/ttyACM0".into(),
            baud: 115_200,
            log_dir: Some(PathBuf::from("logs")),
            ..Default::default()
        }
    }

    /// Serialize the configuration in a "pretty" (i.e. non-compact) fashion.
    pub fn serialize_pretty(&self) -> String {
        Self::ron()
            .to_string_pretty(self, ron::ser::PrettyConfig::default())
            .unwrap_or_else(|e| format!("<config not serializable: {e}>"))
    }

    /// Setup a new configuration from a RON file.
    pub fn new_from_path<P: AsRef<Path>>(p: P) -> Result<Self, Error> {
        let s = std::fs::read_to_string(p)?;

        Self::deserialize(&s)
    }

    /// The serial connection described by this config.
    pub fn connection(&self) -> Result<ConnectionConfig, Error> {
        ConnectionConfig::new(&self.port, self.baud).map_err(|e| Error::BadConfig(e.to_string()))
    }

    /// The bridge tunables described by this config.
    pub fn bridge_settings(&self) -> BridgeSettings {
        BridgeSettings {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            queue_capacity: self.queue_capacity,
            max_saturation: self.max_saturation,
            ..Default::default()
        }
    }

    /// Check the values make sense.
    pub fn validate(&self) -> Result<(), Error> {
        self.connection()?;

        if self.poll_interval_ms == 0 {
            return Err(Error::BadConfig(
                "The poll interval must be at least one millisecond".into(),
            ));
        }

        if self.queue_capacity == 0 {
            return Err(Error::BadConfig(
                "The queue capacity must be at least one line".into(),
            ));
        }

        if self.max_saturation == 0 {
            return Err(Error::BadConfig(
                "The max saturation must be at least one line".into(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn serialize() {
        let c = Config::example();

        println!("{}", c.serialize_pretty());
    }

    #[test]
    fn round_trip_example() {
        let c = Config::example();

        assert_eq!(Config::deserialize(&c.serialize_pretty()).unwrap(), c);
    }

    #[test]
    fn deserialize_partial() {
        let input = r#"
(
    port: "/dev/ttyUSB0",
    baud: 115200,
    log_dir: "/tmp/bridge-logs",
)
"#;
        let config = Config::deserialize(input).unwrap();

        assert_eq!(config.port, "/dev/ttyUSB0");
        assert_eq!(config.baud, 115_200);
        assert_eq!(config.log_dir, Some(PathBuf::from("/tmp/bridge-logs")));
        assert_eq!(config.queue_capacity, Config::default().queue_capacity);
        assert!(config.auto_connect);
    }

    #[test]
    fn not_ron() {
        let err = Config::deserialize("port = 3").unwrap_err();

        assert!(err.try_into_bad_config().is_ok());
    }

    #[test]
    fn bad_config_zero_baud() {
        let c = Config {
            baud: 0,
            ..Default::default()
        };

        let err = c.validate().unwrap_err().try_into_bad_config().unwrap();
        assert!(err.contains("baud"));
    }

    #[test]
    fn bad_config_zero_queue() {
        let c = Config {
            queue_capacity: 0,
            ..Default::default()
        };

        let err = c.validate().unwrap_err().try_into_bad_config().unwrap();
        assert!(err.contains("queue capacity"));
    }

    #[test]
    fn default_is_valid() {
        Config::default().validate().unwrap();
    }
}
