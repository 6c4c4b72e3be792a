use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::{Captures, Regex};
use tracing::info;

use super::ConfigError;

pub const DEFAULT_CONFIG_TEMPLATE: &str = "pcluster.config.ini";

const PLACEHOLDER_RE: &str = r"\{\{\s*([A-Za-z0-9_]+)\s*\}\}";

fn placeholder_re() -> &'static Regex {
    static RE_ONCE: OnceLock<Regex> = OnceLock::new();
    RE_ONCE.get_or_init(|| Regex::new(PLACEHOLDER_RE).unwrap())
}

/// Renders cluster config templates from a test data directory.
///
/// Templates reference parameters as `{{ name }}`. Rendered files are written to
/// `output_dir` under the template file name.
#[derive(Debug, Clone)]
pub struct ConfigReader {
    datadir: PathBuf,
    output_dir: PathBuf,
    params: BTreeMap<String, String>,
}

impl ConfigReader {
    pub fn new(
        datadir: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
        params: BTreeMap<String, String>,
    ) -> Self {
        Self {
            datadir: datadir.into(),
            output_dir: output_dir.into(),
            params,
        }
    }

    /// Renders [DEFAULT_CONFIG_TEMPLATE] with the reader parameters.
    pub fn render_default(&self) -> Result<PathBuf, ConfigError> {
        self.render(DEFAULT_CONFIG_TEMPLATE, &BTreeMap::new())
    }

    /// Renders `template` with the reader parameters overridden by `extra`.
    pub fn render(
        &self,
        template: &str,
        extra: &BTreeMap<String, String>,
    ) -> Result<PathBuf, ConfigError> {
        let template_path = self.datadir.join(template);
        let content = fs::read_to_string(&template_path).map_err(|source| ConfigError::Io {
            path: template_path.clone(),
            source,
        })?;

        let rendered = render_template(&content, |key| {
            extra.get(key).or_else(|| self.params.get(key)).cloned()
        })
        .map_err(|reason| ConfigError::Render {
            path: template_path.clone(),
            reason,
        })?;

        fs::create_dir_all(&self.output_dir).map_err(|source| ConfigError::Io {
            path: self.output_dir.clone(),
            source,
        })?;
        let output_path = self.output_dir.join(template);
        write(&output_path, rendered)?;

        info!(template = %template_path.display(), output = %output_path.display(), "rendered cluster config");
        Ok(output_path)
    }
}

/// Replaces every `{{ key }}` in `content`, unknown keys are reported together.
fn render_template<F>(content: &str, lookup: F) -> Result<String, String>
where
    F: Fn(&str) -> Option<String>,
{
    let mut missing = Vec::new();
    let rendered = placeholder_re().replace_all(content, |caps: &Captures| {
        let key = &caps[1];
        lookup(key).unwrap_or_else(|| {
            missing.push(key.to_string());
            String::new()
        })
    });

    if !missing.is_empty() {
        return Err(format!("missing parameters: {}", missing.join(", ")));
    }
    Ok(rendered.into_owned())
}

/// Writes contents to a file and ensures data is flushed to disk before returning.
fn write(path: &Path, contents: impl AsRef<[u8]>) -> Result<(), ConfigError> {
    let io_err = |source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .map_err(io_err)?;
    file.write_all(contents.as_ref()).map_err(io_err)?;
    file.sync_data().map_err(io_err)
}
