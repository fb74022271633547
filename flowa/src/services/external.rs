//! External collaborator commands
//!
//! Each call spawns the configured program, writes one JSON request to its
//! stdin and reads one JSON response from its stdout:
//!
//! ```text
//! request:  {"protocol": "flowa.service.v1", "operation": "select_windows", "request": {...}}
//! response: {"ok": {...}}
//!       or: {"error": {"kind": "missing_data" | "rejected", "message": "..."}}
//! ```
//!
//! A non-zero exit status or output that is not a valid response is an
//! unexpected error. Operations without a result (plot `render` and `merge`)
//! answer `{"ok": true}`.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::config::ServiceCommand;
use crate::models::Stream;
use crate::services::{
    MisfitMeasurement, MisfitQuantifier, MisfitRequest, PlotRequest, Plotter, PreprocessParams,
    Preprocessor, ServiceError, ServiceResult, WindowPicker, WindowRequest, WindowSelection,
};

const PROTOCOL: &str = "flowa.service.v1";
const STDERR_PREVIEW_CHARS: usize = 2_000;
const STDOUT_PREVIEW_CHARS: usize = 4_000;

/// A collaborator implemented by an external program
#[derive(Debug, Clone)]
pub struct ExternalService {
    role: &'static str,
    command: ServiceCommand,
}

#[derive(Debug, Serialize)]
struct Envelope<'a, T: Serialize> {
    protocol: &'static str,
    operation: &'a str,
    request: &'a T,
}

#[derive(Debug, Deserialize)]
struct ResponseEnvelope<T> {
    #[serde(default = "Option::default")]
    ok: Option<T>,
    #[serde(default)]
    error: Option<ErrorBody>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    kind: String,
    #[serde(default)]
    message: String,
}

impl ExternalService {
    pub fn new(role: &'static str, command: ServiceCommand) -> Self {
        Self { role, command }
    }

    /// Run one request/response exchange
    pub async fn invoke<Req, Resp>(&self, operation: &str, request: &Req) -> ServiceResult<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let payload = serde_json::to_vec(&Envelope {
            protocol: PROTOCOL,
            operation,
            request,
        })
        .context("Serialize service request failed")?;

        debug!(
            role = self.role,
            program = %self.command.program,
            operation,
            bytes = payload.len(),
            "Invoking external service"
        );

        let mut child = Command::new(&self.command.program)
            .args(&self.command.args)
            .kill_on_drop(true)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| {
                format!(
                    "Failed to spawn {} service '{}'",
                    self.role, self.command.program
                )
            })?;

        // Feed stdin from its own task so a child that answers before it has
        // read everything cannot deadlock on full pipes
        let writer = child.stdin.take().map(|mut stdin| {
            tokio::spawn(async move {
                stdin.write_all(&payload).await?;
                stdin.write_all(b"\n").await?;
                stdin.shutdown().await
            })
        });

        let output = child
            .wait_with_output()
            .await
            .context("Wait for service output failed")?;
        let written = match writer {
            Some(handle) => handle.await.context("Service stdin task failed")?,
            None => Ok(()),
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ServiceError::Unexpected(anyhow!(
                "{} service exited with {}. stderr={}",
                self.role,
                output.status,
                preview(&stderr, STDERR_PREVIEW_CHARS)
            )));
        }
        written.context("Write request to service failed")?;

        parse_response(&stdout).map_err(|e| match e {
            ServiceError::Unexpected(inner) => ServiceError::Unexpected(inner.context(format!(
                "Invalid {} service response. stdout={}",
                self.role,
                preview(&stdout, STDOUT_PREVIEW_CHARS)
            ))),
            categorized => categorized,
        })
    }
}

/// Decode one response document
///
/// The last non-empty line is taken as the response so that services may log
/// progress to stdout before answering.
pub(crate) fn parse_response<T: DeserializeOwned>(stdout: &str) -> ServiceResult<T> {
    let line = stdout
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .ok_or_else(|| anyhow!("empty response"))?;

    let envelope: ResponseEnvelope<T> =
        serde_json::from_str(line.trim()).context("response is not valid JSON")?;

    match (envelope.ok, envelope.error) {
        (Some(value), None) => Ok(value),
        (None, Some(err)) => match err.kind.as_str() {
            "missing_data" => Err(ServiceError::MissingData(err.message)),
            "rejected" => Err(ServiceError::Rejected(err.message)),
            other => Err(ServiceError::Unexpected(anyhow!(
                "unknown error kind '{}': {}",
                other,
                err.message
            ))),
        },
        (Some(_), Some(_)) => Err(ServiceError::Unexpected(anyhow!(
            "response carries both 'ok' and 'error'"
        ))),
        (None, None) => Err(ServiceError::Unexpected(anyhow!(
            "response carries neither 'ok' nor 'error'"
        ))),
    }
}

fn preview(text: &str, max_chars: usize) -> String {
    let mut out: String = text.chars().take(max_chars).collect();
    if text.chars().count() > max_chars {
        out.push_str("...");
    }
    out
}

#[async_trait]
impl Preprocessor for ExternalService {
    async fn preprocess(
        &self,
        stream: &Stream,
        params: &PreprocessParams,
    ) -> ServiceResult<Stream> {
        self.invoke("preprocess", &json!({ "stream": stream, "params": params }))
            .await
    }

    async fn convolve_stf(&self, stream: &Stream, half_duration: f64) -> ServiceResult<Stream> {
        self.invoke(
            "convolve_stf",
            &json!({ "stream": stream, "half_duration": half_duration }),
        )
        .await
    }
}

#[async_trait]
impl WindowPicker for ExternalService {
    async fn select_windows(&self, request: &WindowRequest) -> ServiceResult<WindowSelection> {
        self.invoke("select_windows", request).await
    }
}

#[async_trait]
impl MisfitQuantifier for ExternalService {
    async fn calculate(&self, request: &MisfitRequest) -> ServiceResult<MisfitMeasurement> {
        self.invoke("calculate_misfit", request).await
    }
}

#[async_trait]
impl Plotter for ExternalService {
    fn extension(&self) -> &str {
        self.command.extension.as_deref().unwrap_or("pdf")
    }

    async fn render(&self, request: &PlotRequest, output: &Path) -> ServiceResult<()> {
        let _: serde_json::Value = self
            .invoke("render", &json!({ "plot": request, "output": output }))
            .await?;
        Ok(())
    }

    async fn merge(&self, parts: &[PathBuf], output: &Path) -> ServiceResult<()> {
        let _: serde_json::Value = self
            .invoke("merge", &json!({ "parts": parts, "output": output }))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ok_response() {
        let value: f64 = parse_response("progress...\n{\"ok\": 1.5}\n").unwrap();
        assert_eq!(value, 1.5);
    }

    #[test]
    fn test_parse_categorized_errors() {
        let missing: ServiceResult<f64> =
            parse_response(r#"{"error": {"kind": "missing_data", "message": "no Z"}}"#);
        assert!(matches!(missing, Err(ServiceError::MissingData(m)) if m == "no Z"));

        let rejected: ServiceResult<f64> =
            parse_response(r#"{"error": {"kind": "rejected", "message": "bad"}}"#);
        assert!(matches!(rejected, Err(ServiceError::Rejected(_))));
    }

    #[test]
    fn test_parse_garbage_is_unexpected() {
        for text in ["", "not json", r#"{"neither": 1}"#, r#"{"error": {"kind": "boom"}}"#] {
            let result: ServiceResult<f64> = parse_response(text);
            assert!(
                matches!(result, Err(ServiceError::Unexpected(_))),
                "{:?}",
                text
            );
        }
    }

    #[test]
    fn test_preview_truncates() {
        assert_eq!(preview("abcdef", 3), "abc...");
        assert_eq!(preview("abc", 3), "abc");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_is_unexpected() {
        let service = ExternalService::new(
            "misfit",
            ServiceCommand {
                program: "sh".into(),
                args: vec!["-c".into(), "cat >/dev/null; echo oops >&2; exit 3".into()],
                extension: None,
            },
        );
        let result: ServiceResult<f64> = service.invoke("calculate_misfit", &json!({})).await;
        match result {
            Err(ServiceError::Unexpected(e)) => assert!(format!("{:#}", e).contains("oops")),
            other => panic!("expected unexpected error, got {:?}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_large_request_with_chatty_service() {
        // Writes well past a pipe buffer to stdout before reading its input
        let service = ExternalService::new(
            "misfit",
            ServiceCommand {
                program: "sh".into(),
                args: vec![
                    "-c".into(),
                    r#"i=0; while [ $i -lt 20000 ]; do echo "progress $i"; i=$((i+1)); done; cat >/dev/null; echo '{"ok": 0.5}'"#
                        .into(),
                ],
                extension: None,
            },
        );
        let request = json!({ "data": vec![1.0f64; 200_000] });
        let result: f64 = service.invoke("calculate_misfit", &request).await.unwrap();
        assert_eq!(result, 0.5);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_round_trip_through_shell() {
        let service = ExternalService::new(
            "misfit",
            ServiceCommand {
                program: "sh".into(),
                args: vec![
                    "-c".into(),
                    r#"cat >/dev/null; echo '{"ok": {"adjoint_source": [0.0, 1.0], "misfit": 0.25}}'"#
                        .into(),
                ],
                extension: None,
            },
        );
        let result: MisfitMeasurement = service
            .invoke("calculate_misfit", &json!({}))
            .await
            .unwrap();
        assert_eq!(result.misfit, 0.25);
        assert_eq!(result.adjoint_source.len(), 2);
    }
}
