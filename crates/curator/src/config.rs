use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

pub use common::{Environment, LogLevel};

use crate::errors::{CuratorError, Result};
use crate::labels::ClassMap;
use crate::source::SourceDataset;
use crate::types::{LabelFormat, Partition, UnifiedClass};

const ENV_PREFIX: &str = "CURATOR";

/// Requested partition proportions.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct SplitConfig {
    pub train: f64,
    pub val: f64,
    pub test: f64,
    /// Allowed gap between a partition's class shares and the global shares.
    pub tolerance: f64,
    /// Turn a tolerance breach into an error instead of a warning.
    pub strict_tolerance: bool,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            train: 0.7,
            val: 0.2,
            test: 0.1,
            tolerance: 0.02,
            strict_tolerance: false,
        }
    }
}

impl SplitConfig {
    pub fn ratio(&self, partition: Partition) -> f64 {
        match partition {
            Partition::Train => self.train,
            Partition::Val => self.val,
            Partition::Test => self.test,
        }
    }

    pub fn validate(&self) -> Result<()> {
        for partition in Partition::ALL {
            let ratio = self.ratio(partition);
            if !(0.0..=1.0).contains(&ratio) {
                return Err(CuratorError::Config(format!(
                    "split ratio for {partition} must be in [0, 1], got {ratio}"
                )));
            }
        }
        let sum = self.train + self.val + self.test;
        if (sum - 1.0).abs() > 1e-6 {
            return Err(CuratorError::Config(format!(
                "split ratios must sum to 1, got {sum}"
            )));
        }
        if !(0.0..=1.0).contains(&self.tolerance) {
            return Err(CuratorError::Config(format!(
                "split tolerance must be in [0, 1], got {}",
                self.tolerance
            )));
        }
        Ok(())
    }
}

/// One `[[sources]]` entry as written in the configuration file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SourceConfig {
    pub id: String,
    pub root: PathBuf,
    #[serde(default)]
    pub format: LabelFormat,
    /// Source class index (as a string key) to unified class.
    pub class_map: BTreeMap<String, UnifiedClass>,
    #[serde(default)]
    pub unlabeled_as_background: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CuratorConfig {
    pub environment: Environment,
    pub log_level: LogLevel,
    pub otel_endpoint: Option<String>,
    pub output_dir: PathBuf,
    pub seed: u64,
    pub copy_images: bool,
    pub max_invalid_fraction: f64,
    pub duplicate_similarity: f64,
    pub leakage_similarity: f64,
    pub min_background_fraction: f64,
    pub balance_tolerance: f64,
    pub class_targets: BTreeMap<UnifiedClass, f64>,
    pub ingest_timeout_secs: u64,
    pub max_images_per_source: Option<usize>,
    pub split: SplitConfig,
    pub sources: Vec<SourceConfig>,
}

impl Default for CuratorConfig {
    fn default() -> Self {
        Self {
            environment: Environment::from_env(),
            log_level: LogLevel::Info,
            otel_endpoint: None,
            output_dir: PathBuf::from("curated"),
            seed: 42,
            copy_images: false,
            max_invalid_fraction: 0.05,
            duplicate_similarity: 0.95,
            leakage_similarity: 0.85,
            min_background_fraction: 0.1,
            balance_tolerance: 0.02,
            class_targets: BTreeMap::new(),
            ingest_timeout_secs: 1800,
            max_images_per_source: None,
            split: SplitConfig::default(),
            sources: Vec::new(),
        }
    }
}

/// Values given on the command line; they win over file and environment.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub seed: Option<u64>,
    pub output_dir: Option<PathBuf>,
}

impl CuratorConfig {
    /// Layers the optional TOML file, then `CURATOR_*` environment variables
    /// (nested keys separated by `__`), then command-line overrides.
    pub fn load(path: Option<&Path>, overrides: &Overrides) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        if let Some(seed) = overrides.seed {
            builder = builder.set_override("seed", seed)?;
        }
        if let Some(output_dir) = &overrides.output_dir {
            builder = builder.set_override("output_dir", output_dir.display().to_string())?;
        }

        let config: CuratorConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.split.validate()?;

        for (name, value) in [
            ("max_invalid_fraction", self.max_invalid_fraction),
            ("duplicate_similarity", self.duplicate_similarity),
            ("leakage_similarity", self.leakage_similarity),
            ("min_background_fraction", self.min_background_fraction),
            ("balance_tolerance", self.balance_tolerance),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(CuratorError::Config(format!(
                    "{name} must be in [0, 1], got {value}"
                )));
            }
        }

        let target_sum: f64 = self.class_targets.values().sum();
        if self.class_targets.values().any(|t| !(0.0..=1.0).contains(t)) || target_sum > 1.0 + 1e-6 {
            return Err(CuratorError::Config(format!(
                "class targets must be shares in [0, 1] summing to at most 1, got {:?}",
                self.class_targets
            )));
        }

        if self.sources.is_empty() {
            return Err(CuratorError::Config("no sources configured".to_string()));
        }

        let mut seen = HashSet::new();
        for source in &self.sources {
            if source.id.is_empty()
                || !source.id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
            {
                // `__` separates the source id inside record ids
                return Err(CuratorError::Config(format!(
                    "source id '{}' must be non-empty ASCII letters, digits or '-'",
                    source.id
                )));
            }
            if !seen.insert(source.id.as_str()) {
                return Err(CuratorError::Config(format!(
                    "duplicate source id '{}'",
                    source.id
                )));
            }
            if source.class_map.is_empty() {
                return Err(CuratorError::Config(format!(
                    "source '{}' has an empty class_map",
                    source.id
                )));
            }
        }
        Ok(())
    }

    /// Registers the configured sources in file order.
    pub fn source_datasets(&self) -> Result<Vec<SourceDataset>> {
        self.sources
            .iter()
            .enumerate()
            .map(|(index, source)| {
                let class_map = source
                    .class_map
                    .iter()
                    .map(|(key, class)| {
                        key.trim().parse::<u32>().map(|idx| (idx, *class)).map_err(|_| {
                            CuratorError::Config(format!(
                                "source '{}': class_map key '{key}' is not a class index",
                                source.id
                            ))
                        })
                    })
                    .collect::<Result<ClassMap>>()?;

                Ok(SourceDataset {
                    id: source.id.clone(),
                    index,
                    root: source.root.clone(),
                    format: source.format,
                    class_map,
                    unlabeled_as_background: source.unlabeled_as_background,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    const SAMPLE: &str = r#"
seed = 7
output_dir = "/tmp/curated"
max_invalid_fraction = 0.1

[split]
train = 0.8
val = 0.1
test = 0.1

[class_targets]
background = 0.3

[[sources]]
id = "dfire"
root = "/data/dfire"
class_map = { "0" = "smoke", "1" = "fire" }

[[sources]]
id = "clouds"
root = "/data/clouds"
format = "xyxy"
class_map = { "0" = "background" }
unlabeled_as_background = true
"#;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    #[serial]
    fn test_loads_file_with_defaults() {
        let file = write_config(SAMPLE);
        let config = CuratorConfig::load(Some(file.path()), &Overrides::default()).unwrap();

        assert_eq!(config.seed, 7);
        assert_eq!(config.output_dir, PathBuf::from("/tmp/curated"));
        assert!((config.split.train - 0.8).abs() < 1e-9);
        assert!((config.split.tolerance - 0.02).abs() < 1e-9, "Default tolerance kept");
        assert!((config.duplicate_similarity - 0.95).abs() < 1e-9);
        assert_eq!(config.class_targets.get(&UnifiedClass::Background), Some(&0.3));

        let sources = config.source_datasets().unwrap();
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0].id, "dfire");
        assert_eq!(sources[0].index, 0);
        assert_eq!(sources[0].class_map.get(1), Some(UnifiedClass::Fire));
        assert_eq!(sources[1].format, LabelFormat::Xyxy);
        assert!(sources[1].unlabeled_as_background);
    }

    #[test]
    #[serial]
    fn test_overrides_win_over_file_and_env() {
        let file = write_config(SAMPLE);
        // SAFETY: serialized with the other environment tests.
        unsafe { std::env::set_var("CURATOR_SEED", "99") };
        let from_env = CuratorConfig::load(Some(file.path()), &Overrides::default()).unwrap();
        assert_eq!(from_env.seed, 99, "Environment should override the file");

        let overrides = Overrides {
            seed: Some(1234),
            output_dir: Some(PathBuf::from("/tmp/other")),
        };
        let config = CuratorConfig::load(Some(file.path()), &overrides).unwrap();
        unsafe { std::env::remove_var("CURATOR_SEED") };

        assert_eq!(config.seed, 1234);
        assert_eq!(config.output_dir, PathBuf::from("/tmp/other"));
    }

    #[test]
    fn test_rejects_bad_split_ratios() {
        let split = SplitConfig {
            train: 0.7,
            val: 0.2,
            test: 0.2,
            ..SplitConfig::default()
        };
        assert!(split.validate().is_err());
        assert!(SplitConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_duplicate_source_ids_and_bad_keys() {
        let source = SourceConfig {
            id: "a".to_string(),
            root: PathBuf::from("/a"),
            format: LabelFormat::Yolo,
            class_map: [("0".to_string(), UnifiedClass::Smoke)].into_iter().collect(),
            unlabeled_as_background: false,
        };
        let config = CuratorConfig {
            sources: vec![source.clone(), source.clone()],
            ..CuratorConfig::default()
        };
        assert!(config.validate().unwrap_err().to_string().contains("duplicate source id"));

        let bad_key = SourceConfig {
            class_map: [("smoke".to_string(), UnifiedClass::Smoke)].into_iter().collect(),
            ..source
        };
        let config = CuratorConfig {
            sources: vec![bad_key],
            ..CuratorConfig::default()
        };
        assert!(config.source_datasets().is_err());
    }

    #[test]
    fn test_rejects_source_ids_that_blur_record_ids() {
        for id in ["", "d_fire", "d fire", "a__b"] {
            let config = CuratorConfig {
                sources: vec![SourceConfig {
                    id: id.to_string(),
                    root: PathBuf::from("/a"),
                    format: LabelFormat::Yolo,
                    class_map: [("0".to_string(), UnifiedClass::Smoke)].into_iter().collect(),
                    unlabeled_as_background: false,
                }],
                ..CuratorConfig::default()
            };
            assert!(config.validate().is_err(), "'{id}' should be rejected");
        }
    }

    #[test]
    fn test_rejects_missing_sources() {
        let err = CuratorConfig::default().validate().unwrap_err();
        assert!(err.to_string().contains("no sources"));
    }
}
