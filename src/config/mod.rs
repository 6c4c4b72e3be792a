pub mod reader;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use config::{Config, File, FileFormat};
use thiserror::Error;

pub use reader::ConfigReader;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("could not load cluster config `{path}`: `{source}`")]
    Load {
        path: PathBuf,
        #[source]
        source: config::ConfigError,
    },

    #[error("missing option `{key}` in section `[{section}]`")]
    MissingOption { section: String, key: String },

    #[error("option `{key}` in section `[{section}]` is not an integer: `{value}`")]
    InvalidInteger {
        section: String,
        key: String,
        value: String,
    },

    #[error("could not render config template `{path}`: `{reason}`")]
    Render { path: PathBuf, reason: String },

    #[error("io error on `{path}`: `{source}`")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

type Sections = HashMap<String, HashMap<String, String>>;

/// Cluster configuration as read from a `pcluster` INI file.
///
/// Options are grouped in sections, `[global]` selects the active
/// `[cluster <template>]` section. Option names are lowercased on load and
/// quotes around values are dropped by the INI parser.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClusterConfig {
    sections: Sections,
}

impl ClusterConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let load_err = |source| ConfigError::Load {
            path: path.to_path_buf(),
            source,
        };

        let values = Config::builder()
            .add_source(File::new(&path.to_string_lossy(), FileFormat::Ini))
            .build()
            .and_then(|c| c.try_deserialize::<HashMap<String, config::Value>>())
            .map_err(load_err)?;

        let mut sections = Sections::new();
        for (name, value) in values {
            // options outside of any section are not part of the pcluster format
            let Ok(table) = value.into_table() else {
                continue;
            };
            // option names are case insensitive
            let options = table
                .into_iter()
                .map(|(k, v)| v.into_string().map(|v| (k.to_lowercase(), v)))
                .collect::<Result<HashMap<_, _>, _>>()
                .map_err(load_err)?;
            sections.insert(name, options);
        }

        Ok(Self { sections })
    }

    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.sections
            .get(section)
            .and_then(|options| options.get(key))
            .map(String::as_str)
    }

    pub fn get_or<'a>(&'a self, section: &str, key: &str, fallback: &'a str) -> &'a str {
        self.get(section, key).unwrap_or(fallback)
    }

    pub fn require(&self, section: &str, key: &str) -> Result<&str, ConfigError> {
        self.get(section, key)
            .ok_or_else(|| ConfigError::MissingOption {
                section: section.to_string(),
                key: key.to_string(),
            })
    }

    pub fn get_int(&self, section: &str, key: &str) -> Result<i64, ConfigError> {
        let value = self.require(section, key)?;
        value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidInteger {
                section: section.to_string(),
                key: key.to_string(),
                value: value.to_string(),
            })
    }

    /// Name of the `[cluster <template>]` section selected by `[global] cluster_template`.
    pub fn cluster_section(&self) -> String {
        format!(
            "cluster {}",
            self.get_or("global", "cluster_template", "default")
        )
    }

    #[cfg(test)]
    pub(crate) fn from_sections<const N: usize>(sections: [(&str, &[(&str, &str)]); N]) -> Self {
        let sections = sections
            .into_iter()
            .map(|(name, options)| {
                let options = options
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect();
                (name.to_string(), options)
            })
            .collect();
        Self { sections }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const CONFIG: &str = r#"
[global]
cluster_template = default

[aws]
aws_region_name = us-west-2

[cluster default]
base_os = centos7
scheduler = sge
initial_queue_size = 1
max_queue_size = 3
extra_json = { "cluster" : { "test_key" : "test_value_1" } }
"#;

    fn write_config(content: &str) -> NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".ini").tempfile().unwrap();
        write!(file, "{content}").unwrap();
        file
    }

    #[test]
    fn load_sections_with_spaces_in_names() {
        let file = write_config(CONFIG);
        let config = ClusterConfig::load(file.path()).unwrap();

        assert_eq!(config.get("cluster default", "base_os"), Some("centos7"));
        assert_eq!(config.get("aws", "aws_region_name"), Some("us-west-2"));
        assert_eq!(config.get_int("cluster default", "max_queue_size").unwrap(), 3);
        assert_eq!(
            config.get("cluster default", "extra_json"),
            Some(r#"{ "cluster" : { "test_key" : "test_value_1" } }"#)
        );
    }

    #[test]
    fn option_names_are_lowercased_and_quotes_dropped() {
        let file = write_config(
            "[cluster default]\nInitial_Queue_Size = 2\npre_install_args = \"R curl wget\"\n",
        );
        let config = ClusterConfig::load(file.path()).unwrap();

        assert_eq!(config.get("cluster default", "initial_queue_size"), Some("2"));
        assert_eq!(config.get("cluster default", "Initial_Queue_Size"), None);
        assert_eq!(config.get("cluster default", "pre_install_args"), Some("R curl wget"));
    }

    #[test]
    fn fallbacks_and_missing_options() {
        let file = write_config(CONFIG);
        let config = ClusterConfig::load(file.path()).unwrap();

        assert_eq!(config.get_or("cluster default", "vpc_settings", "public"), "public");
        assert_eq!(config.get_or("missing", "key", "fallback"), "fallback");
        assert_matches!(
            config.require("cluster default", "compute_instance_type"),
            Err(ConfigError::MissingOption { .. })
        );
        assert_matches!(
            config.get_int("cluster default", "scheduler"),
            Err(ConfigError::InvalidInteger { .. })
        );
    }

    #[test]
    fn cluster_section_follows_the_template() {
        let config = ClusterConfig::from_sections([("global", &[("cluster_template", "hit")])]);
        assert_eq!(config.cluster_section(), "cluster hit");
        assert_eq!(ClusterConfig::default().cluster_section(), "cluster default");
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert_matches!(
            ClusterConfig::load(&dir.path().join("missing.ini")),
            Err(ConfigError::Load { .. })
        );
    }
}
