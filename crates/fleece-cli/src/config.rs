//! Configuration management for Fleece CLI

use anyhow::{Context, Result};
use fleece_bench::{BenchMode, CommandEngine, NvidiaSmiMonitor, PromptSpec, SessionConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// CLI configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Model identifiers passed to the engine
    pub models: Vec<String>,

    /// Prompts in the matrix
    pub prompts: Vec<PromptConfig>,

    /// Text file prepended to every prompt
    pub document: Option<PathBuf>,

    /// Recorded repeats per (model, prompt)
    pub repeats: u32,

    /// Unrecorded warmup invocations per model
    pub warmup: u32,

    /// Benchmarking mode
    pub mode: BenchMode,

    /// Skip cells whose transcript is already complete
    pub resume: bool,

    /// Output directory for transcripts, tables and logs
    pub output_dir: PathBuf,

    /// Telemetry sampling configuration
    pub telemetry: TelemetryConfig,

    /// Inference engine configuration
    pub engine: EngineConfig,

    /// GPU query configuration
    pub gpu: GpuConfig,
}

/// One prompt: inline text or a path to a text file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptConfig {
    pub id: String,
    pub text: Option<String>,
    pub file: Option<PathBuf>,
}

/// Telemetry sampling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Sampling period in milliseconds
    pub interval_ms: u64,
}

/// Inference engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Engine executable
    pub command: String,

    /// Arguments for one invocation; `{model}` is substituted
    pub run_args: Vec<String>,

    /// Arguments that unload a model; `{model}` is substituted
    pub stop_args: Vec<String>,

    /// Per-invocation limit in seconds; unset waits indefinitely
    pub timeout_secs: Option<u64>,
}

/// GPU query configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GpuConfig {
    /// `nvidia-smi` executable
    pub command: String,

    /// GPU index to query; unset queries the first device
    pub index: Option<u32>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            models: Vec::new(),
            prompts: Vec::new(),
            document: None,
            repeats: 3,
            warmup: 1,
            mode: BenchMode::Steady,
            resume: false,
            output_dir: PathBuf::from("./bench_results"),
            telemetry: TelemetryConfig::default(),
            engine: EngineConfig::default(),
            gpu: GpuConfig::default(),
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self { interval_ms: 500 }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            command: "ollama".to_string(),
            run_args: vec!["run".into(), "{model}".into(), "--verbose".into()],
            stop_args: vec!["stop".into(), "{model}".into()],
            timeout_secs: None,
        }
    }
}

impl Default for GpuConfig {
    fn default() -> Self {
        Self {
            command: "nvidia-smi".to_string(),
            index: None,
        }
    }
}

/// Command-line values that take precedence over the file
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub models: Vec<String>,
    pub prompts: Vec<(String, String)>,
    pub document: Option<PathBuf>,
    pub repeats: Option<u32>,
    pub warmup: Option<u32>,
    pub fresh: bool,
    pub resume: bool,
    pub output_dir: Option<PathBuf>,
    pub timeout_secs: Option<u64>,
}

impl Config {
    /// Load configuration from file, falling back to defaults when it does not exist
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let config_path = match config_path {
            Some(path) => expand_path(path)?,
            None => Self::default_config_path(),
        };

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

            let config: Config = toml::from_str(&content)
                .with_context(|| {
                    format!("Failed to parse config file: {}", config_path.display())
                })?;

            Ok(config)
        } else {
            debug!("No config file at {}, using defaults", config_path.display());
            Ok(Config::default())
        }
    }

    /// Get default configuration file path
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| dirs::home_dir().unwrap_or_default().join(".config"))
            .join("fleece")
            .join("config.toml")
    }

    /// Apply command-line overrides
    pub fn merged(&self, overrides: &Overrides) -> Self {
        let mut config = self.clone();
        if !overrides.models.is_empty() {
            config.models = overrides.models.clone();
        }
        if !overrides.prompts.is_empty() {
            config.prompts = overrides
                .prompts
                .iter()
                .map(|(id, text)| PromptConfig {
                    id: id.clone(),
                    text: Some(text.clone()),
                    file: None,
                })
                .collect();
        }
        if let Some(document) = &overrides.document {
            config.document = Some(document.clone());
        }
        if let Some(repeats) = overrides.repeats {
            config.repeats = repeats;
        }
        if let Some(warmup) = overrides.warmup {
            config.warmup = warmup;
        }
        if overrides.fresh {
            config.mode = BenchMode::Fresh;
        }
        if overrides.resume {
            config.resume = true;
        }
        if let Some(dir) = &overrides.output_dir {
            config.output_dir = dir.clone();
        }
        if let Some(secs) = overrides.timeout_secs {
            config.engine.timeout_secs = Some(secs);
        }
        config
    }

    /// Resolve prompt files, the document and paths into a session configuration
    pub fn to_session_config(&self) -> Result<SessionConfig> {
        let prompts = self
            .prompts
            .iter()
            .map(PromptConfig::resolve)
            .collect::<Result<Vec<_>>>()?;

        let document = match &self.document {
            Some(path) => {
                let path = expand_path(path)?;
                let text = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read document: {}", path.display()))?;
                Some(text)
            }
            None => None,
        };

        Ok(SessionConfig {
            models: self.models.clone(),
            prompts,
            document,
            repeats: self.repeats,
            warmup: self.warmup,
            mode: self.mode,
            resume: self.resume,
            output_dir: expand_path(&self.output_dir)?,
            telemetry_interval: Duration::from_millis(self.telemetry.interval_ms),
            invocation_timeout: self.engine.timeout_secs.map(Duration::from_secs),
        })
    }

    /// Engine described by the `[engine]` section
    pub fn engine(&self) -> Result<CommandEngine> {
        let program = expand_path(Path::new(&self.engine.command))?;
        Ok(CommandEngine::new(program)
            .with_run_args(self.engine.run_args.clone())
            .with_stop_args(self.engine.stop_args.clone()))
    }

    /// GPU monitor described by the `[gpu]` section
    pub fn monitor(&self) -> Result<NvidiaSmiMonitor> {
        let program = expand_path(Path::new(&self.gpu.command))?;
        Ok(NvidiaSmiMonitor::new(program, self.gpu.index))
    }
}

impl PromptConfig {
    fn resolve(&self) -> Result<PromptSpec> {
        match (&self.text, &self.file) {
            (Some(text), None) => Ok(PromptSpec::new(self.id.clone(), text.clone())),
            (None, Some(file)) => {
                let path = expand_path(file)?;
                let text = std::fs::read_to_string(&path).with_context(|| {
                    format!("Failed to read prompt '{}' from {}", self.id, path.display())
                })?;
                Ok(PromptSpec::new(self.id.clone(), text.trim_end().to_string()))
            }
            (Some(_), Some(_)) => anyhow::bail!("Prompt '{}' sets both text and file", self.id),
            (None, None) => anyhow::bail!("Prompt '{}' needs either text or file", self.id),
        }
    }
}

/// Expand `~` and environment variables in a path
pub fn expand_path(path: &Path) -> Result<PathBuf> {
    let raw = path.to_string_lossy();
    let expanded = shellexpand::full(&raw)
        .with_context(|| format!("Failed to expand shell variables in path: {}", raw))?;
    Ok(PathBuf::from(expanded.as_ref()))
}
