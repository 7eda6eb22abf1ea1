//! HTTP Task Executor：通过 JSON 接口驱动远端 Agent 进程
//!
//! - `POST {endpoint}/reset` body `{"mode": "soft", "wait_ticks": 40}` -> 初始观察
//! - `GET  {endpoint}/state` -> 遥测
//! - `POST {endpoint}/run`   body `{"task", "context", "reset_env"}` -> TaskOutcome
//!
//! 连接错误、超时、5xx、响应体格式错误都算 Transient；`/run` 的 4xx 算任务失败。

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::Serialize;

use crate::core::state::Telemetry;
use crate::executor::{ExecutorError, ResetOptions, TaskExecutor, TaskOutcome};

#[derive(Serialize)]
struct RunRequest<'a> {
    task: &'a str,
    context: &'a str,
    reset_env: bool,
}

/// 远端执行器客户端
pub struct HttpTaskExecutor {
    client: Client,
    endpoint: String,
}

impl HttpTaskExecutor {
    /// 构建客户端；request_timeout 同时约束长任务的 run 调用
    pub fn new(endpoint: &str, request_timeout: Duration) -> Result<Self, ExecutorError> {
        let client = Client::builder()
            .timeout(request_timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ExecutorError::Fatal(format!("http client build failed: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.endpoint, path)
    }

    async fn error_body(resp: Response) -> String {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if body.is_empty() {
            status.to_string()
        } else {
            format!("{status}: {body}")
        }
    }
}

fn transport_error(op: &str, e: reqwest::Error) -> ExecutorError {
    ExecutorError::Transient(format!("{op} request failed: {e}"))
}

#[async_trait]
impl TaskExecutor for HttpTaskExecutor {
    async fn reset(&self, options: ResetOptions) -> Result<serde_json::Value, ExecutorError> {
        let resp = self
            .client
            .post(self.url("reset"))
            .json(&options)
            .send()
            .await
            .map_err(|e| transport_error("reset", e))?;
        if !resp.status().is_success() {
            return Err(ExecutorError::Transient(format!(
                "reset rejected: {}",
                Self::error_body(resp).await
            )));
        }
        resp.json()
            .await
            .map_err(|e| ExecutorError::Transient(format!("reset body: {e}")))
    }

    async fn get_state(&self) -> Result<Telemetry, ExecutorError> {
        let resp = self
            .client
            .get(self.url("state"))
            .send()
            .await
            .map_err(|e| transport_error("state", e))?;
        if !resp.status().is_success() {
            return Err(ExecutorError::Transient(format!(
                "state rejected: {}",
                Self::error_body(resp).await
            )));
        }
        resp.json()
            .await
            .map_err(|e| ExecutorError::Transient(format!("state body: {e}")))
    }

    async fn run(
        &self,
        task: &str,
        context: &str,
        reset_env_first: bool,
    ) -> Result<TaskOutcome, ExecutorError> {
        let resp = self
            .client
            .post(self.url("run"))
            .json(&RunRequest {
                task,
                context,
                reset_env: reset_env_first,
            })
            .send()
            .await
            .map_err(|e| transport_error("run", e))?;

        let status = resp.status();
        if status.is_client_error() && status != StatusCode::REQUEST_TIMEOUT {
            return Err(ExecutorError::Task(format!(
                "Rollout error: {}",
                Self::error_body(resp).await
            )));
        }
        if !status.is_success() {
            return Err(ExecutorError::Transient(format!(
                "run failed: {}",
                Self::error_body(resp).await
            )));
        }
        resp.json()
            .await
            .map_err(|e| ExecutorError::Transient(format!("run body: {e}")))
    }
}
