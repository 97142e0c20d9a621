//! Inference engine collaborators

use crate::{BenchError, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// One engine invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationRequest {
    pub model: String,
    pub prompt: String,
}

impl InvocationRequest {
    /// Build a request, prepending `document` to the prompt when present
    pub fn new(model: impl Into<String>, prompt: &str, document: Option<&str>) -> Self {
        let prompt = match document {
            Some(doc) => format!("{}\n\n{}", doc, prompt),
            None => prompt.to_string(),
        };
        Self {
            model: model.into(),
            prompt,
        }
    }
}

/// Raw result of an invocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineOutput {
    /// Everything the engine printed, stdout then stderr
    pub transcript: String,
    /// Process exit code, if the engine exited normally
    pub exit_code: Option<i32>,
}

/// An external inference engine
#[async_trait]
pub trait InferenceEngine: Send + Sync {
    /// Run one prompt and return the transcript
    async fn invoke(&self, request: &InvocationRequest) -> Result<EngineOutput>;

    /// Release the model's resident state. Callers ignore failures.
    async fn unload(&self, model: &str) -> Result<()>;

    /// Engine version string, for the run log
    async fn version(&self) -> Option<String> {
        None
    }
}

/// [`InferenceEngine`] that shells out to a CLI such as `ollama`.
///
/// `{model}` in the argument templates is replaced with the model identifier.
/// The prompt is written to the child's stdin.
#[derive(Debug, Clone)]
pub struct CommandEngine {
    program: PathBuf,
    run_args: Vec<String>,
    stop_args: Vec<String>,
    version_args: Vec<String>,
}

impl CommandEngine {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            run_args: vec!["run".into(), "{model}".into(), "--verbose".into()],
            stop_args: vec!["stop".into(), "{model}".into()],
            version_args: vec!["--version".into()],
        }
    }

    pub fn with_run_args(mut self, args: Vec<String>) -> Self {
        self.run_args = args;
        self
    }

    pub fn with_stop_args(mut self, args: Vec<String>) -> Self {
        self.stop_args = args;
        self
    }

    fn expand(args: &[String], model: &str) -> Vec<String> {
        args.iter().map(|a| a.replace("{model}", model)).collect()
    }
}

impl Default for CommandEngine {
    fn default() -> Self {
        Self::new("ollama")
    }
}

#[async_trait]
impl InferenceEngine for CommandEngine {
    async fn invoke(&self, request: &InvocationRequest) -> Result<EngineOutput> {
        let args = Self::expand(&self.run_args, &request.model);
        debug!("Invoking {} {:?}", self.program.display(), args);

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                BenchError::Engine(format!("failed to spawn {}: {}", self.program.display(), e))
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            let prompt = request.prompt.clone();
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(prompt.as_bytes()).await {
                    debug!("Engine closed stdin early: {}", e);
                }
            });
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| BenchError::Engine(format!("failed to collect engine output: {}", e)))?;

        let mut transcript = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.stderr.is_empty() {
            if !transcript.is_empty() && !transcript.ends_with('\n') {
                transcript.push('\n');
            }
            transcript.push_str(&String::from_utf8_lossy(&output.stderr));
        }

        Ok(EngineOutput {
            transcript,
            exit_code: output.status.code(),
        })
    }

    async fn unload(&self, model: &str) -> Result<()> {
        let status = Command::new(&self.program)
            .args(Self::expand(&self.stop_args, model))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| BenchError::Engine(e.to_string()))?;
        if status.success() {
            Ok(())
        } else {
            Err(BenchError::Engine(format!("unload of {} exited with {}", model, status)))
        }
    }

    async fn version(&self) -> Option<String> {
        let output = Command::new(&self.program)
            .args(&self.version_args)
            .stdin(Stdio::null())
            .output()
            .await
            .ok()?;
        let text = String::from_utf8_lossy(&output.stdout);
        let line = text.lines().map(str::trim).find(|l| !l.is_empty())?;
        Some(line.to_string())
    }
}
