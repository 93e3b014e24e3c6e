use anyhow::{anyhow, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::core::Config;

/// REST client for the control-plane API: resolves service names and asks
/// the remote side to start a process, returning the runtime endpoint the
/// attach protocol is then driven against.
#[derive(Debug, Clone)]
pub struct ApiClient {
    base_url: Url,
    client: Client,
    token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceResource {
    pub name: String,
    pub instance: String,
    pub web_url: Option<String>,
}

#[derive(Debug, Serialize)]
struct RunRequest<'a> {
    command: &'a [String],
}

#[derive(Debug, Deserialize)]
struct RunResponse {
    /// Opaque `host:port` of the started process's attach endpoint.
    endpoint: String,
}

impl ApiClient {
    pub fn from_config(config: &Config) -> Result<Self> {
        let base_url = Url::parse(&config.api.url)?;
        Ok(Self {
            base_url,
            client: config.transport()?.http,
            token: config.api.token.clone(),
        })
    }

    fn get(&self, path: &str) -> Result<reqwest::RequestBuilder> {
        let url = self.base_url.join(path)?;
        let mut request = self.client.get(url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        Ok(request)
    }

    fn post(&self, path: &str) -> Result<reqwest::RequestBuilder> {
        let url = self.base_url.join(path)?;
        let mut request = self.client.post(url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        Ok(request)
    }

    /// Look up a service on an instance.
    pub async fn get_service(&self, instance: &str, name: &str) -> Result<ServiceResource> {
        let path = format!("v1/instances/{instance}/services/{name}");
        tracing::debug!("GET /{path}");
        let response = self.get(&path)?.send().await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(anyhow!("Failed to get service: {status} - {error_text}"));
        }
        Ok(response.json().await?)
    }

    /// Ask the remote side to start `command` on the service; returns the
    /// `host:port` attach endpoint once the process is scheduled.
    pub async fn run_remote(&self, service: &ServiceResource, command: &[String]) -> Result<String> {
        let path = format!(
            "v1/instances/{}/services/{}/run",
            service.instance, service.name
        );
        tracing::debug!("POST /{path} command={command:?}");
        let response = self
            .post(&path)?
            .json(&RunRequest { command })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(anyhow!(
                "Failed to start remote command: {status} - {error_text}"
            ));
        }
        let run: RunResponse = response.json().await?;
        Ok(run.endpoint)
    }
}
