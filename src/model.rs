//! Language model client for the categorizer and commentary stages
//!
//! Defines the client trait the model-backed processing functions call.
//! Two implementations:
//! - `SubprocessModel`: runs a configured command, prompt on stdin, answer on stdout (production)
//! - `MockModel`: returns preconfigured responses (testing)

use crate::config::ModelCommand;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Errors from model client operations.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("model not available: {0}")]
    Unavailable(String),
    #[error("invocation failed: {0}")]
    InvocationFailed(String),
    #[error("response parse error: {0}")]
    ParseError(String),
}

/// Client trait for text completion.
///
/// Abstracts over transport (subprocess, mock) so stage processors
/// don't depend on how the model is reached.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Complete `prompt`, returning the model's raw text.
    async fn complete(&self, prompt: &str) -> Result<String, ModelError>;
}

/// Runs one process per completion.
///
/// The child is killed if the completion future is dropped, so a worker's
/// per-record timeout also reaps the process.
pub struct SubprocessModel {
    program: String,
    args: Vec<String>,
}

impl SubprocessModel {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn from_command(command: &ModelCommand) -> Self {
        Self::new(command.program.clone()).with_args(command.args.iter().cloned())
    }
}

#[async_trait]
impl LanguageModel for SubprocessModel {
    fn name(&self) -> &str {
        &self.program
    }

    async fn complete(&self, prompt: &str) -> Result<String, ModelError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ModelError::Unavailable(format!("{}: {}", self.program, e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            // A command may exit without reading its input; its status decides.
            match stdin.write_all(prompt.as_bytes()).await {
                Err(e) if e.kind() != std::io::ErrorKind::BrokenPipe => {
                    return Err(ModelError::InvocationFailed(format!("writing prompt: {}", e)));
                }
                _ => {}
            }
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| ModelError::InvocationFailed(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ModelError::InvocationFailed(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// Mock model for testing; returns preconfigured responses.
///
/// Scripted responses are consumed in order; once exhausted, the fallback
/// reply (if any) is returned for every further call.
pub struct MockModel {
    available: bool,
    script: Mutex<VecDeque<Result<String, ModelError>>>,
    fallback: Option<String>,
    prompts: Mutex<Vec<String>>,
}

impl MockModel {
    /// A model that always answers `reply`.
    pub fn replying(reply: impl Into<String>) -> Self {
        Self {
            available: true,
            script: Mutex::new(VecDeque::new()),
            fallback: Some(reply.into()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// A model that fails every call as unreachable.
    pub fn unavailable() -> Self {
        Self {
            available: false,
            script: Mutex::new(VecDeque::new()),
            fallback: None,
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// A model answering from `script`, then failing.
    pub fn scripted(script: Vec<Result<String, ModelError>>) -> Self {
        Self {
            available: true,
            script: Mutex::new(script.into()),
            fallback: None,
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Reply used once the script is exhausted.
    pub fn then_reply(mut self, reply: impl Into<String>) -> Self {
        self.fallback = Some(reply.into());
        self
    }

    /// Prompts received so far.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl LanguageModel for MockModel {
    fn name(&self) -> &str {
        "mock"
    }

    async fn complete(&self, prompt: &str) -> Result<String, ModelError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        if !self.available {
            return Err(ModelError::Unavailable(
                "mock model configured as unavailable".to_string(),
            ));
        }

        if let Some(next) = self.script.lock().unwrap().pop_front() {
            return next;
        }
        match &self.fallback {
            Some(reply) => Ok(reply.clone()),
            None => Err(ModelError::InvocationFailed("mock script exhausted".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_replying_model_returns_reply() {
        let model = MockModel::replying("technology");
        assert_eq!(model.complete("classify this").await.unwrap(), "technology");
        assert_eq!(model.prompts(), vec!["classify this".to_string()]);
    }

    #[tokio::test]
    async fn mock_unavailable_model_returns_error() {
        let model = MockModel::unavailable();
        let err = model.complete("x").await.unwrap_err();
        assert!(matches!(err, ModelError::Unavailable(_)));
    }

    #[tokio::test]
    async fn mock_script_runs_in_order_then_falls_back() {
        let model = MockModel::scripted(vec![
            Err(ModelError::InvocationFailed("overloaded".into())),
            Ok("first".into()),
        ])
        .then_reply("steady");

        assert!(model.complete("a").await.is_err());
        assert_eq!(model.complete("b").await.unwrap(), "first");
        assert_eq!(model.complete("c").await.unwrap(), "steady");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn subprocess_model_pipes_prompt_through_command() {
        let model = SubprocessModel::new("cat");
        assert_eq!(model.complete("  echoed prompt \n").await.unwrap(), "echoed prompt");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn subprocess_model_reports_failing_command() {
        let model = SubprocessModel::new("sh").with_args(["-c", "echo nope >&2; exit 3"]);
        let err = model.complete("x").await.unwrap_err();
        match err {
            ModelError::InvocationFailed(msg) => assert!(msg.contains("nope")),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn subprocess_model_reports_missing_program() {
        let model = SubprocessModel::new("definitely-not-a-real-model-binary");
        let err = model.complete("x").await.unwrap_err();
        assert!(matches!(err, ModelError::Unavailable(_)));
    }
}
