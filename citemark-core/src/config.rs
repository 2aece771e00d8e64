use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ConfigError;
use crate::model::Scope;
use crate::resolver::{ResolverOptions, DEFAULT_CANDIDATE_OFFSETS};
use crate::snap::SNAP_TOLERANCE_PX;

pub const CONFIG_FILE_NAME: &str = "config.toml";

pub fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("net", "citemark", "citemark")
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub lookup: LookupConfig,
    pub scope: Scope,
    pub search: SearchConfig,
    pub snap: SnapConfig,
    pub viewer: ViewerConfig,
    pub render: RenderConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LookupConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub debug: bool,
    /// Per-request timeout; `None` leaves requests open until aborted.
    pub timeout_secs: Option<u64>,
}

impl Default for LookupConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:3002".to_string(),
            api_key: None,
            debug: true,
            timeout_secs: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub candidate_offsets: Vec<i64>,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            candidate_offsets: DEFAULT_CANDIDATE_OFFSETS.to_vec(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapConfig {
    pub tolerance_px: f64,
}

impl Default for SnapConfig {
    fn default() -> Self {
        Self {
            tolerance_px: SNAP_TOLERANCE_PX,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewerConfig {
    pub initial_scale: f32,
    pub min_scale: f32,
    pub max_scale: f32,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            initial_scale: 1.5,
            min_scale: 0.25,
            max_scale: 4.0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    /// Explicit path to the pdfium shared library.
    pub pdfium_library: Option<PathBuf>,
}

impl EngineConfig {
    /// Loads `path`, or the platform config file when `path` is `None`.
    ///
    /// A missing platform config file yields the defaults; environment
    /// overrides are applied last.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match project_dirs().map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME)) {
                Some(default_path) if default_path.exists() => Self::from_file(&default_path)?,
                _ => Self::default(),
            },
        };
        config.apply_env_overrides(|key| env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        debug!(path = %path.display(), "loaded config file");
        Self::from_toml(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn from_toml(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("CITEMARK_LOOKUP_URL").filter(|v| !v.trim().is_empty()) {
            self.lookup.base_url = url.trim().to_string();
        }
        if let Some(key) = lookup("CITEMARK_API_KEY").filter(|v| !v.trim().is_empty()) {
            self.lookup.api_key = Some(key.trim().to_string());
        }
        if let Some(flag) = lookup("CITEMARK_LOOKUP_DEBUG") {
            self.lookup.debug = flag.trim() != "0";
        }
        if let Some(path) = lookup("CITEMARK_PDFIUM_LIBRARY").filter(|v| !v.trim().is_empty()) {
            self.render.pdfium_library = Some(PathBuf::from(path.trim()));
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lookup.base_url.trim().is_empty() {
            return Err(ConfigError::Invalid("lookup.base_url must not be empty".into()));
        }
        if self.search.candidate_offsets.is_empty() {
            return Err(ConfigError::Invalid(
                "search.candidate_offsets needs at least one offset".into(),
            ));
        }
        if !(self.snap.tolerance_px.is_finite() && self.snap.tolerance_px >= 0.0) {
            return Err(ConfigError::Invalid(
                "snap.tolerance_px must be a non-negative number".into(),
            ));
        }
        let viewer = &self.viewer;
        if !(viewer.min_scale > 0.0 && viewer.min_scale <= viewer.max_scale) {
            return Err(ConfigError::Invalid(
                "viewer.min_scale must be positive and not above viewer.max_scale".into(),
            ));
        }
        Ok(())
    }

    pub fn resolver_options(&self) -> ResolverOptions {
        ResolverOptions {
            candidate_offsets: self.search.candidate_offsets.clone(),
            debug: self.lookup.debug,
        }
    }
}
