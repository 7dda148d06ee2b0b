//! Process-backed capabilities.
//!
//! Both implementations spawn a configured command, write their input to
//! stdin and read stdout, the same way a CLI model runner is driven.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::{Evaluator, TransformRequest, Transformer};
use crate::document::extract_document;
use crate::errors::TransformError;
use crate::snapshot::RuleResults;

/// Spawn `program args...` in `dir`, feed `input` on stdin, collect output.
async fn run_with_stdin(
    program: &str,
    args: &[String],
    dir: &Path,
    input: String,
    timeout: Duration,
) -> Result<std::process::Output, TransformError> {
    let mut child = Command::new(program)
        .args(args)
        .current_dir(dir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| TransformError::Fatal(format!("failed to spawn '{}': {}", program, e)))?;

    // Write stdin on its own task so a chatty child cannot deadlock on a full stdout pipe.
    let writer = child.stdin.take().map(|mut stdin| {
        tokio::spawn(async move {
            stdin.write_all(input.as_bytes()).await?;
            stdin.shutdown().await?;
            Ok::<(), std::io::Error>(())
        })
    });

    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| TransformError::Timeout(timeout))?
        .map_err(|e| TransformError::Transient(format!("failed to wait for '{}': {}", program, e)))?;

    if let Some(writer) = writer
        && let Ok(Err(e)) = writer.await
        && output.status.success()
    {
        return Err(TransformError::Transient(format!(
            "failed to write stdin of '{}': {}",
            program, e
        )));
    }

    Ok(output)
}

/// Transformer that pipes the pass prompt through an external command.
#[derive(Debug, Clone)]
pub struct CommandTransformer {
    program: String,
    args: Vec<String>,
    working_dir: PathBuf,
    timeout: Duration,
}

impl CommandTransformer {
    pub fn new(program: &str, args: Vec<String>, working_dir: PathBuf, timeout: Duration) -> Self {
        Self {
            program: program.to_string(),
            args,
            working_dir,
            timeout,
        }
    }
}

#[async_trait]
impl Transformer for CommandTransformer {
    async fn transform(&self, request: &TransformRequest) -> Result<String, TransformError> {
        let prompt = request.prompt();
        tracing::debug!(
            job_id = %request.job_id,
            pass = request.pass_number,
            program = %self.program,
            prompt_chars = prompt.len(),
            "spawning transformer"
        );

        let output = run_with_stdin(
            &self.program,
            &self.args,
            &self.working_dir,
            prompt,
            self.timeout,
        )
        .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TransformError::Transient(format!(
                "'{}' exited with {}: {}",
                self.program,
                output.status.code().unwrap_or(-1),
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8(output.stdout)
            .map_err(|e| TransformError::Fatal(format!("non UTF-8 output: {}", e)))?;
        let document = extract_document(&stdout);
        if document.is_empty() {
            return Err(TransformError::Transient(format!(
                "'{}' returned an empty document",
                self.program
            )));
        }
        Ok(document.to_string())
    }
}

/// Evaluator that pipes content through an external rule engine.
///
/// The command reads the document on stdin and prints a JSON object mapping
/// rule ids to `{"passed": bool, "value": any, "message": string}`.
#[derive(Debug, Clone)]
pub struct CommandEvaluator {
    program: String,
    args: Vec<String>,
    working_dir: PathBuf,
    timeout: Duration,
}

impl CommandEvaluator {
    pub fn new(program: &str, args: Vec<String>, working_dir: PathBuf, timeout: Duration) -> Self {
        Self {
            program: program.to_string(),
            args,
            working_dir,
            timeout,
        }
    }
}

#[async_trait]
impl Evaluator for CommandEvaluator {
    async fn evaluate(&self, content: &str) -> anyhow::Result<RuleResults> {
        let output = run_with_stdin(
            &self.program,
            &self.args,
            &self.working_dir,
            content.to_string(),
            self.timeout,
        )
        .await
        .map_err(|e| anyhow::anyhow!(e))
        .with_context(|| format!("Failed to run evaluator '{}'", self.program))?;

        if !output.status.success() {
            anyhow::bail!(
                "Evaluator '{}' exited with {}: {}",
                self.program,
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        serde_json::from_slice(&output.stdout)
            .with_context(|| format!("Evaluator '{}' printed invalid rule JSON", self.program))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::document::Document;
    use crate::pass::PassDefinition;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn script(dir: &TempDir, name: &str, body: &str) -> String {
        let path = dir.path().join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().to_string()
    }

    fn request() -> TransformRequest {
        let pass = PassDefinition::new(2, "Headers", "shorten headings");
        TransformRequest::new("job-1", &pass, &Document::parse("Intro\n\n## A Heading\n\nbody"))
    }

    #[tokio::test]
    async fn test_echo_transformer_returns_document() {
        let dir = TempDir::new().unwrap();
        let program = script(&dir, "echo.sh", "cat");
        let transformer = CommandTransformer::new(
            &program,
            vec![],
            dir.path().to_path_buf(),
            Duration::from_secs(10),
        );
        let out = transformer.transform(&request()).await.unwrap();
        assert_eq!(out, "Intro\n\n## A Heading\n\nbody");
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_transient() {
        let dir = TempDir::new().unwrap();
        let program = script(&dir, "fail.sh", "cat >/dev/null\necho 'rate limited' >&2\nexit 1");
        let transformer = CommandTransformer::new(
            &program,
            vec![],
            dir.path().to_path_buf(),
            Duration::from_secs(10),
        );
        let err = transformer.transform(&request()).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("rate limited"));
    }

    #[tokio::test]
    async fn test_missing_program_is_fatal() {
        let dir = TempDir::new().unwrap();
        let transformer = CommandTransformer::new(
            "/nonexistent/draftsmith-model",
            vec![],
            dir.path().to_path_buf(),
            Duration::from_secs(10),
        );
        let err = transformer.transform(&request()).await.unwrap_err();
        assert!(matches!(err, TransformError::Fatal(_)));
    }

    #[tokio::test]
    async fn test_slow_command_times_out() {
        let dir = TempDir::new().unwrap();
        let program = script(&dir, "slow.sh", "cat >/dev/null\nsleep 5");
        let transformer = CommandTransformer::new(
            &program,
            vec![],
            dir.path().to_path_buf(),
            Duration::from_millis(200),
        );
        let err = transformer.transform(&request()).await.unwrap_err();
        assert!(matches!(err, TransformError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_command_evaluator_parses_rules() {
        let dir = TempDir::new().unwrap();
        let program = script(
            &dir,
            "audit.sh",
            r#"cat >/dev/null
echo '{"h2-length":{"passed":true,"value":4,"message":"ok"},"intro":{"passed":false}}'"#,
        );
        let evaluator = CommandEvaluator::new(
            &program,
            vec![],
            dir.path().to_path_buf(),
            Duration::from_secs(10),
        );
        let rules = evaluator.evaluate("## Heading").await.unwrap();
        assert_eq!(rules.len(), 2);
        assert!(rules["h2-length"].passed);
        assert_eq!(rules["h2-length"].value, serde_json::json!(4));
        assert!(!rules["intro"].passed);
    }

    #[tokio::test]
    async fn test_command_evaluator_rejects_garbage() {
        let dir = TempDir::new().unwrap();
        let program = script(&dir, "bad.sh", "cat >/dev/null\necho not-json");
        let evaluator = CommandEvaluator::new(
            &program,
            vec![],
            dir.path().to_path_buf(),
            Duration::from_secs(10),
        );
        let err = evaluator.evaluate("x").await.unwrap_err();
        assert!(format!("{:#}", err).contains("invalid rule JSON"));
    }
}
