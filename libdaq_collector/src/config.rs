use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use super::constants::*;
use super::error::ConfigError;
use super::source_queue::OverflowPolicy;

/// Which key the stream merger joins on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeMode {
    #[default]
    Trigger,
    Timestamp,
}

/// Per-merger policy choices
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergerConfig {
    pub mode: MergeMode,
    pub queue_capacity: usize,
    pub overflow_policy: OverflowPolicy,
    /// Producer names that must be connected before anything is merged
    pub required_sources: Vec<String>,
}

impl Default for MergerConfig {
    fn default() -> Self {
        Self {
            mode: MergeMode::Trigger,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            overflow_policy: OverflowPolicy::Reject,
            required_sources: Vec::new(),
        }
    }
}

/// An optional processing stage placed between the merger and the sink. `kind` selects
/// the factory in the node registry, `params` are handed to it untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageConfig {
    pub name: String,
    pub kind: String,
    #[serde(default)]
    pub params: BTreeMap<String, serde_yaml::Value>,
}

/// Structure representing the application configuration. Contains the listener, merger
/// and output settings. Configs are seralizable and deserializable to YAML using serde and
/// serde_yaml
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub listen_address: String,
    pub collector_name: String,
    pub collector_id: u32,
    pub output_path: PathBuf,
    pub file_prefix: String,
    #[serde(default)]
    pub merger: MergerConfig,
    #[serde(default)]
    pub stages: Vec<StageConfig>,
    #[serde(default = "default_sink_buffer")]
    pub sink_buffer_capacity: usize,
    #[serde(default = "default_hub_capacity")]
    pub hub_capacity: usize,
}

fn default_sink_buffer() -> usize {
    DEFAULT_SINK_BUFFER
}

fn default_hub_capacity() -> usize {
    DEFAULT_HUB_CAPACITY
}

impl Default for Config {
    /// Generate a new Config object. The output path is a placeholder and must be set
    fn default() -> Self {
        Self {
            listen_address: String::from("127.0.0.1:44000"),
            collector_name: String::from("dc"),
            collector_id: 0,
            output_path: PathBuf::from("None"),
            file_prefix: String::from(""),
            merger: MergerConfig::default(),
            stages: Vec::new(),
            sink_buffer_capacity: DEFAULT_SINK_BUFFER,
            hub_capacity: DEFAULT_HUB_CAPACITY,
        }
    }
}

impl Config {
    /// Read the configuration in a YAML file
    /// Returns a Config if successful
    pub fn read_config_file(config_path: &Path) -> Result<Self, ConfigError> {
        if !config_path.exists() {
            return Err(ConfigError::BadFilePath(config_path.to_path_buf()));
        }

        let yaml_str = std::fs::read_to_string(config_path)?;
        let config = serde_yaml::from_str::<Self>(&yaml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Write the configuration to a YAML file
    pub fn write_config_file(&self, config_path: &Path) -> Result<(), ConfigError> {
        let yaml_str = serde_yaml::to_string(self)?;
        std::fs::write(config_path, yaml_str)?;
        Ok(())
    }

    /// Check the values serde cannot
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.collector_name.split_whitespace().count() != 1 {
            return Err(ConfigError::InvalidValue(
                "collector_name",
                format!("{:?} must be a single word", self.collector_name),
            ));
        }
        if self.hub_capacity == 0 {
            return Err(ConfigError::InvalidValue(
                "hub_capacity",
                String::from("must be at least 1"),
            ));
        }
        if self.sink_buffer_capacity == 0 {
            return Err(ConfigError::InvalidValue(
                "sink_buffer_capacity",
                String::from("must be at least 1"),
            ));
        }
        let mut names: Vec<&str> = self.stages.iter().map(|s| s.name.as_str()).collect();
        names.sort_unstable();
        if let Some(pair) = names.windows(2).find(|pair| pair[0] == pair[1]) {
            return Err(ConfigError::InvalidValue(
                "stages",
                format!("stage name {} is used twice", pair[0]),
            ));
        }
        Ok(())
    }

    /// Get the path to the output file of a run
    pub fn get_run_file_name(&self, run_number: u32) -> Result<PathBuf, ConfigError> {
        let run_file_path: PathBuf = self.output_path.join(format!(
            "{}{}.raw",
            self.file_prefix,
            self.get_run_str(run_number)
        ));
        if self.output_path.exists() {
            Ok(run_file_path)
        } else {
            Err(ConfigError::BadFilePath(self.output_path.clone()))
        }
    }

    /// Construct the run string
    fn get_run_str(&self, run_number: u32) -> String {
        format!("run{run_number:0>6}")
    }

    pub fn has_required_sources(&self) -> bool {
        !self.merger.required_sources.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yaml_surface() {
        let yaml = r#"
listen_address: 0.0.0.0:5000
collector_name: tlu_dc
collector_id: 7
output_path: /tmp
file_prefix: beam_
merger:
  mode: timestamp
  queue_capacity: 16
  overflow_policy: drop_oldest
  required_sources: [tlu, telescope]
stages:
  - name: every_other
    kind: prescale
    params:
      factor: 2
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.merger.mode, MergeMode::Timestamp);
        assert_eq!(config.merger.overflow_policy, OverflowPolicy::DropOldest);
        assert_eq!(config.merger.required_sources, vec!["tlu", "telescope"]);
        assert_eq!(config.stages[0].params["factor"].as_u64(), Some(2));
        assert_eq!(config.hub_capacity, DEFAULT_HUB_CAPACITY);
        assert!(config.validate().is_ok());
        assert!(config.has_required_sources());
    }

    #[test]
    fn test_template_round_trips() {
        let config = Config::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        assert_eq!(serde_yaml::from_str::<Config>(&yaml).unwrap(), config);
    }

    #[test]
    fn test_validation() {
        let mut config = Config::default();
        config.collector_name = String::from("two words");
        assert!(config.validate().is_err());

        let mut config = Config::default();
        let stage = StageConfig {
            name: String::from("a"),
            kind: String::from("prescale"),
            params: BTreeMap::new(),
        };
        config.stages = vec![stage.clone(), stage];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_run_file_name() {
        let mut config = Config::default();
        assert!(config.get_run_file_name(3).is_err());
        config.output_path = std::env::temp_dir();
        config.file_prefix = String::from("tb_");
        let path = config.get_run_file_name(42).unwrap();
        assert_eq!(path.file_name().unwrap(), "tb_run000042.raw");
    }
}
