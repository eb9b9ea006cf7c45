//! Client for the identity/directory service.
//!
//! This module handles:
//! - Exchanging SSH password credentials for a bearer token
//! - Token validation
//! - Listing a user's containers and fetching their logs

use std::time::Duration;

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Timeout applied to every identity service call.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Failure of a directory call.
///
/// Callers log these; none of the detail is ever written to an SSH client.
#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("failed to reach identity service: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("identity service returned status {0}")]
    Status(StatusCode),

    #[error("failed to decode identity service response: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Backend target as listed by the directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Container {
    pub id: i64,
    pub container_id: String,
    pub name: String,
    pub status: String,
    pub ssh_port: u16,
    pub running: bool,
}

impl Container {
    /// First 12 characters of the container identifier.
    pub fn short_id(&self) -> &str {
        match self.container_id.char_indices().nth(12) {
            Some((idx, _)) => &self.container_id[..idx],
            None => &self.container_id,
        }
    }
}

/// Token and subject returned by a successful login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub token: String,
    pub subject_id: i64,
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginResponse {
    access_token: String,
    user: LoginUser,
}

#[derive(Deserialize)]
struct LoginUser {
    id: i64,
    #[allow(dead_code)]
    username: String,
}

/// HTTP client for the identity/directory service.
pub struct DirectoryClient {
    client: reqwest::Client,
    base_url: String,
}

impl DirectoryClient {
    /// Create a client rooted at `base_url` (e.g. `http://localhost:8080/api`).
    pub fn new(base_url: &str) -> Result<Self, DirectoryError> {
        let client = reqwest::Client::builder()
            .user_agent("container-gateway/0.1")
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Exchange a username/password pair for a bearer token and subject id.
    pub async fn authenticate(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Credentials, DirectoryError> {
        debug!("Authenticating '{}' against identity service", username);

        let response = self
            .client
            .post(self.url("/auth/login"))
            .json(&LoginRequest { username, password })
            .send()
            .await?;

        let login: LoginResponse = decode(response).await?;
        Ok(Credentials {
            token: login.access_token,
            subject_id: login.user.id,
        })
    }

    /// Check that a bearer token is still accepted.
    pub async fn validate_token(&self, token: &str) -> Result<(), DirectoryError> {
        let response = self
            .client
            .get(self.url("/auth/validate-token"))
            .bearer_auth(token)
            .send()
            .await?;

        if response.status() != StatusCode::OK {
            return Err(DirectoryError::Status(response.status()));
        }
        Ok(())
    }

    /// List the containers owned by the token's subject.
    pub async fn get_containers(&self, token: &str) -> Result<Vec<Container>, DirectoryError> {
        let response = self
            .client
            .get(self.url("/containers"))
            .bearer_auth(token)
            .send()
            .await?;

        let containers: Vec<Container> = decode(response).await?;
        debug!("Directory listed {} container(s)", containers.len());
        Ok(containers)
    }

    /// Fetch the last `lines` log lines of a container.
    pub async fn get_container_logs(
        &self,
        token: &str,
        container_id: i64,
        lines: u32,
    ) -> Result<Vec<String>, DirectoryError> {
        let response = self
            .client
            .get(self.url(&format!(
                "/containers/{}/logs?lines={}",
                container_id, lines
            )))
            .bearer_auth(token)
            .send()
            .await?;

        decode(response).await
    }
}

/// Require a 200 response and decode its JSON body.
async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, DirectoryError> {
    if response.status() != StatusCode::OK {
        return Err(DirectoryError::Status(response.status()));
    }
    let body = response.bytes().await?;
    Ok(serde_json::from_slice(&body)?)
}
