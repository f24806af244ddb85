//! Thin request layer for talking to a single engine.
//!
//! The trait is the seam the reconcilers poll through; tests substitute it
//! with scripted implementations. The http implementation is stateless, every
//! call is keyed by the target machine's address.

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;

use crate::error::ClientError;
use crate::machines::Machine;
use crate::model::{DeployedProcess, InstanceSnapshot, ReportedUserTask};

#[async_trait]
pub trait EngineApi: Send + Sync {
    /// Availability probe; false means the engine answered but is not taking requests.
    async fn get_status(&self, machine: &Machine) -> Result<bool, ClientError>;

    /// All deployments on the machine, restricted to the requested entries.
    async fn get_deployed_processes(
        &self,
        machine: &Machine,
        entries: Option<&str>,
    ) -> Result<Vec<DeployedProcess>, ClientError>;

    /// Full detail for one instance of one process deployment.
    async fn get_instance_information(
        &self,
        machine: &Machine,
        definition_id: &str,
        instance_id: &str,
    ) -> Result<InstanceSnapshot, ClientError>;

    /// Currently active user tasks on the machine.
    async fn get_active_user_tasks(
        &self,
        machine: &Machine,
    ) -> Result<Vec<ReportedUserTask>, ClientError>;

    /// Rendered form html for one active user task.
    async fn get_active_user_task_html(
        &self,
        machine: &Machine,
        instance_id: &str,
        task_id: &str,
        start_time: u64,
    ) -> Result<String, ClientError>;
}

pub struct HttpEngineApi {
    client: Client,
}

impl HttpEngineApi {
    pub fn new() -> Self {
        HttpEngineApi {
            client: Client::new(),
        }
    }

    fn base_url(machine: &Machine) -> Result<String, ClientError> {
        let host = machine
            .ip
            .as_deref()
            .or(machine.hostname.as_deref())
            .ok_or_else(|| ClientError::Unreachable {
                machine: machine.id.clone(),
            })?;
        Ok(format!("http://{}:{}", host, machine.port))
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        machine: &Machine,
        path: &str,
    ) -> Result<T, ClientError> {
        let url = format!("{}{}", Self::base_url(machine)?, path);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|source| Self::request_error(machine, source))?;

        let response = response
            .error_for_status()
            .map_err(|source| Self::request_error(machine, source))?;

        response.json().await.map_err(|source| ClientError::Payload {
            machine: machine.id.clone(),
            reason: source.to_string(),
        })
    }

    async fn get_text(&self, machine: &Machine, path: &str) -> Result<String, ClientError> {
        let url = format!("{}{}", Self::base_url(machine)?, path);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|source| Self::request_error(machine, source))?;

        let response = response
            .error_for_status()
            .map_err(|source| Self::request_error(machine, source))?;

        response.text().await.map_err(|source| ClientError::Payload {
            machine: machine.id.clone(),
            reason: source.to_string(),
        })
    }

    fn request_error(machine: &Machine, source: reqwest::Error) -> ClientError {
        if source.is_connect() || source.is_timeout() {
            ClientError::Unreachable {
                machine: machine.id.clone(),
            }
        } else {
            ClientError::Request {
                machine: machine.id.clone(),
                source,
            }
        }
    }
}

impl Default for HttpEngineApi {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EngineApi for HttpEngineApi {
    async fn get_status(&self, machine: &Machine) -> Result<bool, ClientError> {
        let url = format!("{}/status", Self::base_url(machine)?);
        match self.client.get(&url).send().await {
            Ok(response) => Ok(response.status().is_success()),
            Err(source) => Err(Self::request_error(machine, source)),
        }
    }

    async fn get_deployed_processes(
        &self,
        machine: &Machine,
        entries: Option<&str>,
    ) -> Result<Vec<DeployedProcess>, ClientError> {
        let path = match entries {
            Some(entries) => format!("/process?entries={}", entries),
            None => "/process".to_string(),
        };
        self.get_json(machine, &path).await
    }

    async fn get_instance_information(
        &self,
        machine: &Machine,
        definition_id: &str,
        instance_id: &str,
    ) -> Result<InstanceSnapshot, ClientError> {
        let path = format!("/process/{}/instance/{}", definition_id, instance_id);
        self.get_json(machine, &path).await
    }

    async fn get_active_user_tasks(
        &self,
        machine: &Machine,
    ) -> Result<Vec<ReportedUserTask>, ClientError> {
        self.get_json(machine, "/tasklist/api").await
    }

    async fn get_active_user_task_html(
        &self,
        machine: &Machine,
        instance_id: &str,
        task_id: &str,
        start_time: u64,
    ) -> Result<String, ClientError> {
        let path = format!(
            "/tasklist/api/userTask?instanceID={}&userTaskID={}&startTime={}",
            instance_id, task_id, start_time
        );
        self.get_text(machine, &path).await
    }
}
