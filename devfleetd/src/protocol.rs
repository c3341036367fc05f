//! JSON-lines protocol of the control socket: one request line, one
//! response line.

use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use devfleet_orchestration::{AgentProviderKind, OrchestrationError, TaskStatus, TaskType};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ControlRequest {
    Ping,
    Status,
    TaskAdd {
        description: String,
        #[serde(rename = "type", default)]
        task_type: Option<TaskType>,
        #[serde(default)]
        folder: Option<String>,
        #[serde(default)]
        priority: Option<u8>,
        #[serde(default)]
        confidence: Option<f64>,
        #[serde(default)]
        provider: Option<AgentProviderKind>,
    },
    TaskList {
        #[serde(default)]
        status: Option<TaskStatus>,
    },
    TaskCancel {
        id: String,
        #[serde(default)]
        reason: Option<String>,
    },
    Insights,
    ResolveInsight {
        id: String,
    },
    Shutdown,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ControlResponse {
    pub ok: bool,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ControlResponse {
    pub fn ok(data: Value) -> Self {
        Self {
            ok: true,
            data,
            code: None,
            error: None,
        }
    }

    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: Value::Null,
            code: Some(code.to_string()),
            error: Some(message.into()),
        }
    }

    /// `data` on success, the error message otherwise.
    pub fn into_result(self) -> Result<Value> {
        if self.ok {
            Ok(self.data)
        } else {
            Err(anyhow!(
                "{} ({})",
                self.error.unwrap_or_else(|| "request failed".to_string()),
                self.code.unwrap_or_else(|| "E_UNKNOWN".to_string())
            ))
        }
    }
}

impl From<OrchestrationError> for ControlResponse {
    fn from(err: OrchestrationError) -> Self {
        ControlResponse::error(err.code(), err.to_string())
    }
}

/// Send one request and wait (bounded) for its response.
pub async fn send(socket: &Path, request: &ControlRequest, timeout: Duration) -> Result<ControlResponse> {
    let exchange = async {
        let stream = UnixStream::connect(socket)
            .await
            .with_context(|| format!("connect to {}", socket.display()))?;
        let (reader, mut writer) = stream.into_split();
        let line = serde_json::to_string(request)? + "\n";
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;

        let mut reader = BufReader::new(reader);
        let mut response = String::new();
        if reader.read_line(&mut response).await? == 0 {
            return Err(anyhow!("daemon closed the connection without answering"));
        }
        let response: ControlResponse =
            serde_json::from_str(response.trim()).context("parse daemon response")?;
        Ok(response)
    };
    tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| anyhow!("daemon did not answer within {}ms", timeout.as_millis()))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_use_op_tags() {
        let raw = r#"{"op":"task_add","description":"fix login","type":"bug","provider":"codex"}"#;
        let request: ControlRequest = serde_json::from_str(raw).unwrap();
        assert_eq!(
            request,
            ControlRequest::TaskAdd {
                description: "fix login".into(),
                task_type: Some(TaskType::Bug),
                folder: None,
                priority: None,
                confidence: None,
                provider: Some(AgentProviderKind::Codex),
            }
        );
        assert_eq!(
            serde_json::to_string(&ControlRequest::Ping).unwrap(),
            r#"{"op":"ping"}"#
        );
    }

    #[test]
    fn error_responses_carry_codes() {
        let response: ControlResponse = OrchestrationError::not_found("task", "t9").into();
        assert!(!response.ok);
        assert_eq!(response.code.as_deref(), Some("E_NOT_FOUND"));
        let err = response.into_result().unwrap_err().to_string();
        assert!(err.contains("t9") && err.contains("E_NOT_FOUND"));
    }
}
