use std::collections::HashMap;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{info, warn};

use scheduler_core::{
    models::{truncate_text, JobHandlerParam},
    traits::{ExecuteResult, ExecutionContext, JobHandler},
    SchedulerError, SchedulerResult,
};

/// 输出保留的最大字符数
const MAX_OUTPUT_LENGTH: usize = 1024;

/// Shell任务参数
///
/// 任务参数为JSON时按此结构解析，否则整个参数作为`sh -c`的命令行。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellTaskParams {
    /// 要执行的命令
    pub command: String,
    /// 命令参数
    pub args: Option<Vec<String>>,
    /// 工作目录
    pub working_dir: Option<String>,
    /// 环境变量
    pub env_vars: Option<HashMap<String, String>>,
}

impl ShellTaskParams {
    pub fn parse(text: &str) -> SchedulerResult<Self> {
        let text = text.trim();
        if text.is_empty() {
            return Err(SchedulerError::InvalidJobParam(
                "Shell命令不能为空".to_string(),
            ));
        }
        if text.starts_with('{') {
            let params: Self = serde_json::from_str(text)?;
            if params.command.trim().is_empty() {
                return Err(SchedulerError::InvalidJobParam(
                    "Shell命令不能为空".to_string(),
                ));
            }
            return Ok(params);
        }
        Ok(Self {
            command: "sh".to_string(),
            args: Some(vec!["-c".to_string(), text.to_string()]),
            working_dir: None,
            env_vars: None,
        })
    }
}

/// Shell任务处理器：暂停或取消时杀死子进程
#[derive(Debug, Default)]
pub struct ShellHandler;

impl ShellHandler {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl JobHandler for ShellHandler {
    async fn verify(&self, param: &JobHandlerParam) -> SchedulerResult<bool> {
        Ok(ShellTaskParams::parse(&param.job_param).is_ok())
    }

    async fn execute(&self, ctx: &ExecutionContext) -> SchedulerResult<ExecuteResult> {
        let start_time = Instant::now();
        let params = ShellTaskParams::parse(&ctx.task_param)?;
        let args = params.args.unwrap_or_default();
        info!(
            "执行Shell任务: task_id={}, command={}, args={:?}",
            ctx.task_id, params.command, args
        );

        let mut cmd = Command::new(&params.command);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .env("SCHEDULER_TASK_ID", ctx.task_id.to_string())
            .env("SCHEDULER_SHARD_INDEX", ctx.shard_index.to_string())
            .env("SCHEDULER_SHARD_COUNT", ctx.shard_count.to_string());
        if let Some(dir) = &params.working_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in params.env_vars.unwrap_or_default() {
            cmd.env(key, value);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| SchedulerError::TaskExecution(format!("启动Shell命令失败: {e}")))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| SchedulerError::TaskExecution("无法获取stdout".to_string()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| SchedulerError::TaskExecution("无法获取stderr".to_string()))?;
        let stdout_task = tokio::spawn(async move {
            let mut out = String::new();
            let _ = stdout.read_to_string(&mut out).await;
            out
        });
        let stderr_task = tokio::spawn(async move {
            let mut out = String::new();
            let _ = stderr.read_to_string(&mut out).await;
            out
        });

        let exit_status = tokio::select! {
            status = child.wait() => status
                .map_err(|e| SchedulerError::TaskExecution(format!("等待进程结束失败: {e}")))?,
            _ = ctx.cancel_token().cancelled() => {
                warn!("Shell任务被中断，终止进程: task_id={}", ctx.task_id);
                if let Err(e) = child.kill().await {
                    warn!("终止进程失败 task_id={}: {}", ctx.task_id, e);
                }
                return Ok(ExecuteResult::failure("任务被中断"));
            }
        };

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();
        info!(
            "Shell任务执行完成: task_id={}, exit_code={:?}, duration={}ms",
            ctx.task_id,
            exit_status.code(),
            start_time.elapsed().as_millis()
        );

        if exit_status.success() {
            let output = stdout.trim();
            if output.is_empty() {
                Ok(ExecuteResult::success())
            } else {
                Ok(ExecuteResult::success_with(truncate_text(
                    output,
                    MAX_OUTPUT_LENGTH,
                )))
            }
        } else {
            let reason = if stderr.trim().is_empty() {
                format!("命令执行失败，退出码: {:?}", exit_status.code())
            } else {
                stderr.trim().to_string()
            };
            Ok(ExecuteResult::failure(truncate_text(
                &reason,
                MAX_OUTPUT_LENGTH,
            )))
        }
    }
}

/// HTTP任务参数
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpTaskParams {
    /// 请求URL
    pub url: String,
    /// HTTP方法
    pub method: Option<String>,
    /// 请求头
    pub headers: Option<HashMap<String, String>>,
    /// 请求体
    pub body: Option<String>,
    /// 超时时间（毫秒）
    pub timeout_ms: Option<u64>,
}

impl HttpTaskParams {
    pub fn parse(text: &str) -> SchedulerResult<Self> {
        let params: Self = serde_json::from_str(text.trim())?;
        if params.url.trim().is_empty() {
            return Err(SchedulerError::InvalidJobParam("URL不能为空".to_string()));
        }
        Ok(params)
    }
}

/// HTTP任务处理器：非2xx响应视为执行失败
pub struct HttpHandler {
    client: reqwest::Client,
}

impl HttpHandler {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for HttpHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobHandler for HttpHandler {
    async fn verify(&self, param: &JobHandlerParam) -> SchedulerResult<bool> {
        Ok(HttpTaskParams::parse(&param.job_param).is_ok())
    }

    async fn execute(&self, ctx: &ExecutionContext) -> SchedulerResult<ExecuteResult> {
        let params = HttpTaskParams::parse(&ctx.task_param)?;
        let method = params.method.unwrap_or_else(|| "GET".to_string());
        info!(
            "执行HTTP任务: task_id={}, method={}, url={}",
            ctx.task_id, method, params.url
        );

        let method = reqwest::Method::from_bytes(method.to_uppercase().as_bytes())
            .map_err(|_| SchedulerError::InvalidJobParam(format!("不支持的HTTP方法: {method}")))?;
        let mut request = self.client.request(method, &params.url);
        if let Some(timeout_ms) = params.timeout_ms {
            request = request.timeout(Duration::from_millis(timeout_ms));
        }
        for (key, value) in params.headers.unwrap_or_default() {
            request = request.header(key, value);
        }
        if let Some(body) = params.body {
            request = request.body(body);
        }

        let response = tokio::select! {
            response = request.send() => response,
            _ = ctx.cancel_token().cancelled() => {
                return Ok(ExecuteResult::failure("任务被中断"));
            }
        };
        match response {
            Ok(response) => {
                let status = response.status();
                let body = response
                    .text()
                    .await
                    .unwrap_or_else(|e| format!("读取响应体失败: {e}"));
                let body = truncate_text(&body, MAX_OUTPUT_LENGTH);
                if status.is_success() {
                    Ok(ExecuteResult::success_with(body))
                } else {
                    Ok(ExecuteResult::failure(format!(
                        "HTTP请求失败，状态码: {}, 响应: {body}",
                        status.as_u16()
                    )))
                }
            }
            Err(e) => Ok(ExecuteResult::failure(format!("HTTP请求失败: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_params_accept_plain_command() {
        let params = ShellTaskParams::parse("echo hello").unwrap();
        assert_eq!(params.command, "sh");
        assert_eq!(
            params.args.unwrap(),
            vec!["-c".to_string(), "echo hello".to_string()]
        );
    }

    #[test]
    fn test_shell_params_accept_json() {
        let params =
            ShellTaskParams::parse(r#"{"command":"ls","args":["-l"],"working_dir":"/tmp"}"#)
                .unwrap();
        assert_eq!(params.command, "ls");
        assert_eq!(params.working_dir.as_deref(), Some("/tmp"));
        assert!(ShellTaskParams::parse("  ").is_err());
        assert!(ShellTaskParams::parse(r#"{"command":""}"#).is_err());
    }

    #[test]
    fn test_http_params_require_url() {
        let params =
            HttpTaskParams::parse(r#"{"url":"http://localhost/ping","method":"POST"}"#).unwrap();
        assert_eq!(params.method.as_deref(), Some("POST"));
        assert!(HttpTaskParams::parse(r#"{"url":""}"#).is_err());
        assert!(HttpTaskParams::parse("not json").is_err());
    }
}
