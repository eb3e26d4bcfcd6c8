//! Request signing for platforms that demand anti-scraping headers.
//!
//! The signing algorithms are maintained outside this crate. A `Signer` turns
//! the outgoing request into extra headers; spiders that have no signer fall
//! back to whatever the platform serves unsigned.

use std::process::Stdio;

use async_trait::async_trait;
use serde::Serialize;
use tokio::{io::AsyncWriteExt, process::Command};

use crate::{
    error::SignError,
    http::{Headers, Params},
};

#[derive(Debug, Clone, Copy, Serialize)]
pub struct SignRequest<'a> {
    pub url: &'a str,
    pub headers: &'a Headers,
    pub params: &'a Params,
}

#[async_trait]
pub trait Signer: Send + Sync {
    /// Headers to add to the request.
    async fn sign(&self, request: SignRequest<'_>) -> Result<Headers, SignError>;
}

/// Runs an external program per request: the request goes to stdin as JSON,
/// a JSON object of headers is expected on stdout.
#[derive(Debug, Clone)]
pub struct CommandSigner {
    program: String,
    args: Vec<String>,
}

impl CommandSigner {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Split a whitespace-separated command line. `None` when it is blank.
    pub fn from_command_line(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self::new(program, parts.collect()))
    }
}

#[async_trait]
impl Signer for CommandSigner {
    async fn sign(&self, request: SignRequest<'_>) -> Result<Headers, SignError> {
        let input = serde_json::to_vec(&request).map_err(|err| SignError::Output(err.to_string()))?;
        let spawn_err = |source| SignError::Spawn {
            program: self.program.clone(),
            source,
        };

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(spawn_err)?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&input).await.map_err(spawn_err)?;
        }
        let output = child.wait_with_output().await.map_err(spawn_err)?;
        if !output.status.success() {
            return Err(SignError::Failed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let values: serde_json::Map<String, serde_json::Value> = serde_json::from_slice(&output.stdout)
            .map_err(|err| SignError::Output(err.to_string()))?;
        Ok(values
            .into_iter()
            .map(|(name, value)| {
                let value = match value {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                };
                (name.to_ascii_lowercase(), value)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell(script: &str) -> CommandSigner {
        CommandSigner::new("sh", vec!["-c".into(), script.into()])
    }

    #[tokio::test]
    async fn reads_headers_from_the_program() {
        let signer = shell(r#"cat > /dev/null; printf '{"X-s": "XYW_abc", "X-t": 1700000000}'"#);
        let headers = signer
            .sign(SignRequest {
                url: "/api/sns/web/v1/user_posted",
                headers: &Headers::new(),
                params: &vec![("num".into(), "30".into())],
            })
            .await
            .unwrap();
        assert_eq!(headers["x-s"], "XYW_abc");
        assert_eq!(headers["x-t"], "1700000000");
    }

    #[tokio::test]
    async fn receives_the_request_as_json() {
        let signer = shell(r#"grep -q '"url":"/path"' && echo '{"ok":"yes"}'"#);
        let headers = signer
            .sign(SignRequest {
                url: "/path",
                headers: &Headers::new(),
                params: &Params::new(),
            })
            .await
            .unwrap();
        assert_eq!(headers["ok"], "yes");
    }

    #[tokio::test]
    async fn failing_programs_are_reported() {
        let err = shell("cat > /dev/null; echo boom >&2; exit 3")
            .sign(SignRequest {
                url: "/",
                headers: &Headers::new(),
                params: &Params::new(),
            })
            .await
            .unwrap_err();
        match err {
            SignError::Failed { stderr, .. } => assert_eq!(stderr, "boom"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn blank_command_lines_give_no_signer() {
        assert!(CommandSigner::from_command_line("   ").is_none());
        assert!(CommandSigner::from_command_line("node sign.js").is_some());
    }
}
