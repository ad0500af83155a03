//! 基于reqwest的RPC客户端

mod retry;
mod supervisor;
mod worker;

use std::time::Duration;

use reqwest::Client;
use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

use scheduler_core::{config::HttpConfig, SchedulerError, SchedulerResult};

use crate::response::{ApiResponse, ErrorResponse};

pub use retry::RetryPolicy;
pub use supervisor::HttpSupervisorRpc;
pub use worker::{HttpTaskTransport, HttpWorkerRpc};

/// 对单个地址发起JSON POST请求，响应按`ApiResponse`信封解析
#[derive(Clone)]
pub struct RpcClient {
    client: Client,
    retry: RetryPolicy,
}

impl RpcClient {
    pub fn new(config: &HttpConfig) -> SchedulerResult<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| SchedulerError::Configuration(format!("创建HTTP客户端失败: {e}")))?;
        Ok(Self {
            client,
            retry: RetryPolicy::from_config(config),
        })
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub async fn post<B, T>(&self, address: &str, path: &str, body: &B) -> SchedulerResult<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = format!("http://{address}{path}");
        debug!("RPC请求: {}", url);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorResponse>(&text)
                .map(|e| e.message)
                .unwrap_or(text);
            return Err(SchedulerError::Rpc {
                status: Some(status.as_u16()),
                message: format!("{url}: {message}"),
            });
        }

        let envelope: ApiResponse<T> = response.json().await.map_err(transport_error)?;
        Ok(envelope.data)
    }
}

fn transport_error(e: reqwest::Error) -> SchedulerError {
    if e.is_timeout() {
        return SchedulerError::Timeout;
    }
    SchedulerError::Rpc {
        status: e.status().map(|s| s.as_u16()),
        message: e.to_string(),
    }
}
