//! pyplay - orchestration layer for an interactive code playground
//!
//! This crate provides:
//! - An isolated execution context hosting a Python interpreter on its own thread
//! - A request/response message protocol and the UI-side proxy that drives it
//! - A lazily filled sample cache with generation-guarded selection
//! - An append-only output sink, a CLI and a REST API over one session

pub mod api;
pub mod context;
pub mod editor;
pub mod manifest;
pub mod output;
pub mod playground;
pub mod protocol;
pub mod proxy;
pub mod router;
pub mod sample;
pub mod session;

pub use context::{Interpreter, InterpreterError, OutputMode};
pub use manifest::{Manifest, ManifestError, SampleEntry};
pub use output::{OutputBuffer, OutputSink};
pub use playground::{Playground, PlaygroundEvent};
pub use protocol::{ContextMessage, HostMessage, RequestId};
pub use proxy::{ExecutionProxy, LifecycleEvent, ProxyError};
pub use router::{GenerationToken, SelectionRouter};
pub use sample::{Fetcher, Sample, SampleCache, SampleError};
pub use session::{Session, SessionError};

use sample::{FetchError, FsFetcher, HttpFetcher, PreloadedFetcher};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Errors from loading configuration or building what it describes
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error("Invalid sample source: {0}")]
    Fetcher(#[from] FetchError),

    #[error("Default sample '{0}' is not in the manifest")]
    UnknownDefaultSample(String),
}

/// Configuration for a playground session
#[derive(Debug, Clone, Deserialize)]
pub struct PlaygroundConfig {
    /// Manifest file; the built-in manifest when unset
    #[serde(default)]
    pub manifest: Option<PathBuf>,

    /// Where sample texts come from
    #[serde(default)]
    pub samples: SampleSourceConfig,

    /// Interpreter backend settings
    #[serde(default)]
    pub interpreter: InterpreterConfig,

    /// Request ids wrap back to zero after this value
    #[serde(default = "default_max_request_id")]
    pub max_request_id: u64,

    /// Sample selected for an empty fragment instead of the first entry
    #[serde(default)]
    pub default_sample: Option<String>,

    #[serde(default)]
    pub server: ServerConfig,
}

/// Largest integer a JavaScript client can hold exactly, minus one
fn default_max_request_id() -> u64 { (1u64 << 53) - 2 }

impl Default for PlaygroundConfig {
    fn default() -> Self {
        Self {
            manifest: None,
            samples: SampleSourceConfig::default(),
            interpreter: InterpreterConfig::default(),
            max_request_id: default_max_request_id(),
            default_sample: None,
            server: ServerConfig::default(),
        }
    }
}

impl PlaygroundConfig {
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    /// The configured manifest, checked against `default_sample`
    pub fn load_manifest(&self) -> Result<Manifest, ConfigError> {
        let manifest = match &self.manifest {
            Some(path) => Manifest::load(path)?,
            None => Manifest::builtin()?,
        };
        if let Some(id) = &self.default_sample
            && !manifest.contains(id)
        {
            return Err(ConfigError::UnknownDefaultSample(id.clone()));
        }
        Ok(manifest)
    }

    /// Sample cache over the configured fetcher
    pub fn sample_cache(&self, manifest: Arc<Manifest>) -> Result<SampleCache, ConfigError> {
        Ok(SampleCache::new(manifest, self.samples.fetcher()?))
    }
}

/// Sample text sources
#[derive(Debug, Clone, Deserialize)]
pub struct SampleSourceConfig {
    /// Directory manifest paths are resolved against
    #[serde(default = "default_samples_root")]
    pub root: PathBuf,

    /// Fetch over HTTP from this base URL instead of the filesystem
    #[serde(default)]
    pub base_url: Option<String>,

    /// Serve the built-in sample texts inline, without a fetch
    #[serde(default = "default_preload_builtin")]
    pub preload_builtin: bool,
}

fn default_samples_root() -> PathBuf { PathBuf::from("samples") }
fn default_preload_builtin() -> bool { true }

impl Default for SampleSourceConfig {
    fn default() -> Self {
        Self {
            root: default_samples_root(),
            base_url: None,
            preload_builtin: default_preload_builtin(),
        }
    }
}

impl SampleSourceConfig {
    pub fn fetcher(&self) -> Result<Arc<dyn Fetcher>, ConfigError> {
        let inner: Arc<dyn Fetcher> = match &self.base_url {
            Some(url) => Arc::new(HttpFetcher::new(url)?),
            None => Arc::new(FsFetcher::new(&self.root)),
        };
        if self.preload_builtin {
            Ok(Arc::new(PreloadedFetcher::new(
                manifest::builtin_sources(),
                inner,
            )))
        } else {
            Ok(inner)
        }
    }
}

/// Which interpreter the execution context hosts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterpreterBackend {
    /// A child process per execution
    #[default]
    Process,
    /// CPython inside the context thread (`embedded-python` feature)
    Embedded,
}

/// Interpreter settings
#[derive(Debug, Clone, Deserialize)]
pub struct InterpreterConfig {
    #[serde(default)]
    pub backend: InterpreterBackend,

    /// Interpreter executable (process backend)
    #[serde(default = "default_program")]
    pub program: String,

    /// Arguments before the module file (process backend)
    #[serde(default = "default_args")]
    pub args: Vec<String>,

    /// Where module files are written; a directory under the system temp dir
    /// when unset
    #[serde(default)]
    pub scratch_dir: Option<PathBuf>,

    /// Python run once after the interpreter starts (embedded backend)
    #[serde(default)]
    pub setup: Option<String>,

    /// Python run after every execution (embedded backend)
    #[serde(default)]
    pub cleanup_hook: Option<String>,

    #[serde(default)]
    pub output: OutputMode,
}

fn default_program() -> String { "python3".to_string() }
fn default_args() -> Vec<String> { vec!["-u".to_string()] }

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self {
            backend: InterpreterBackend::default(),
            program: default_program(),
            args: default_args(),
            scratch_dir: None,
            setup: None,
            cleanup_hook: None,
            output: OutputMode::default(),
        }
    }
}

impl InterpreterConfig {
    pub fn scratch_dir(&self) -> PathBuf {
        self.scratch_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("pyplay"))
    }
}

/// REST API settings
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_bind() -> String { "127.0.0.1:8080".to_string() }

impl Default for ServerConfig {
    fn default() -> Self {
        Self { bind: default_bind() }
    }
}
