//! reqwest client for the dispatcher RPC surface.

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::transport::{CallFailure, CallPolicy, RpcError, call_with_retry};
use super::wire::{self, AUTH_HEADER, GetTaskRequest};
use crate::app::status::DispatcherStatus;
use crate::config::ClientConfig;
use crate::dispatcher::RefreshReport;
use crate::domain::{
    ClusterState, CrashReport, GetTaskReply, InvalidConfigReport, SuccessReport, TaskSn,
};
use crate::ports::{DispatcherAdmin, DispatcherApi};
use crate::store::TaskSubmission;

/// Talks to a remote dispatcher. Cheap to clone.
#[derive(Debug, Clone)]
pub struct HttpDispatcherClient {
    base: String,
    auth_key: Option<String>,
    http: reqwest::Client,
    policy: CallPolicy,
}

impl HttpDispatcherClient {
    pub fn new(config: &ClientConfig) -> Result<Self, RpcError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| RpcError::Request(e.to_string()))?;
        Ok(Self {
            base: config.base_url.trim_end_matches('/').to_string(),
            auth_key: config.auth_key.clone(),
            http,
            policy: config.call_policy.clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base
    }

    async fn post<B, T>(&self, method: &'static str, path: &str, body: &B) -> Result<T, RpcError>
    where
        B: Serialize + Sync + ?Sized,
        T: DeserializeOwned + Send,
    {
        let url = format!("{}{}", self.base, path);
        call_with_retry(method, &self.policy, || {
            let mut request = self.http.post(&url).json(body);
            if let Some(key) = &self.auth_key {
                request = request.header(AUTH_HEADER, key);
            }
            async move {
                let response = request.send().await.map_err(classify)?;
                let status = response.status();
                if status.is_server_error() {
                    return Err(CallFailure::Retriable(format!("server answered {status}")));
                }
                if !status.is_success() {
                    let body = response.text().await.unwrap_or_default();
                    return Err(CallFailure::Fatal(RpcError::Rejected {
                        method,
                        status: status.as_u16(),
                        body,
                    }));
                }
                response.json::<T>().await.map_err(classify)
            }
        })
        .await
    }
}

fn classify(err: reqwest::Error) -> CallFailure {
    if err.is_builder() {
        CallFailure::Fatal(RpcError::Request(err.to_string()))
    } else if err.is_decode() {
        CallFailure::Fatal(RpcError::Decode(err.to_string()))
    } else {
        // connect, timeout, reset mid-body
        CallFailure::Retriable(err.to_string())
    }
}

#[async_trait]
impl DispatcherApi for HttpDispatcherClient {
    async fn ping(&self, state: &ClusterState) -> Result<i32, RpcError> {
        self.post("ping", wire::PING, state).await
    }

    async fn get_task(
        &self,
        worker_name: &str,
        combine: Option<i64>,
    ) -> Result<GetTaskReply, RpcError> {
        let request = GetTaskRequest {
            worker_name: worker_name.to_string(),
            combine,
        };
        self.post("get_task", wire::GET_TASK, &request).await
    }

    async fn task_success(&self, report: &SuccessReport) -> Result<bool, RpcError> {
        self.post("task_success", wire::TASK_SUCCESS, report).await
    }

    async fn task_crash(&self, report: &CrashReport) -> Result<bool, RpcError> {
        self.post("task_crash", wire::TASK_CRASH, report).await
    }

    async fn invalid_config(&self, report: &InvalidConfigReport) -> Result<bool, RpcError> {
        self.post("invalid_config", wire::INVALID_CONFIG, report).await
    }
}

#[async_trait]
impl DispatcherAdmin for HttpDispatcherClient {
    async fn refresh(&self) -> Result<RefreshReport, RpcError> {
        self.post("refresh", wire::REFRESH, &wire::Empty {}).await
    }

    async fn status(&self) -> Result<DispatcherStatus, RpcError> {
        self.post("status", wire::STATUS, &wire::Empty {}).await
    }

    async fn shutdown(&self) -> Result<String, RpcError> {
        self.post("shutdown", wire::SHUTDOWN, &wire::Empty {}).await
    }

    async fn submit(&self, tasks: &[TaskSubmission]) -> Result<Vec<TaskSn>, RpcError> {
        self.post("submit", wire::SUBMIT, tasks).await
    }
}
