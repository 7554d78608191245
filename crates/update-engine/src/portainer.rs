//! Portainer gateway
//!
//! Talks to the stack orchestrator's REST API: list stacks, fetch the
//! stored compose file and environment, and trigger a redeploy. Supports
//! API-key and username/password (JWT) authentication; the JWT is cached
//! for the process lifetime. Self-hosted deployments frequently run with
//! self-signed certificates, so TLS validation can be relaxed via config.

use crate::config::{PortainerAuth, PortainerConfig};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum PortainerError {
    #[error("orchestrator authentication failed: {0}")]
    Auth(String),
    #[error("stack has no stored compose file")]
    StackFileMissing,
    #[error("orchestrator API error ({status}): {message}")]
    Api { status: u16, message: String },
    #[error("orchestrator transport error: {0}")]
    Transport(String),
}

impl From<reqwest::Error> for PortainerError {
    fn from(err: reqwest::Error) -> Self {
        PortainerError::Transport(err.to_string())
    }
}

/// Swarm stacks are type 1, compose stacks type 2. Anything else is not
/// managed by this daemon.
pub const STACK_TYPE_SWARM: i64 = 1;
pub const STACK_TYPE_COMPOSE: i64 = 2;

#[derive(Debug, Clone, Deserialize)]
pub struct Stack {
    #[serde(rename = "Id")]
    pub id: i64,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "EndpointId")]
    pub endpoint_id: i64,
    #[serde(rename = "Type")]
    pub stack_type: i64,
    #[serde(rename = "Env", default)]
    pub env: Vec<EnvVar>,
}

impl Stack {
    pub fn is_supported(&self) -> bool {
        matches!(self.stack_type, STACK_TYPE_SWARM | STACK_TYPE_COMPOSE)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

#[derive(Deserialize)]
struct StackFileEnvelope {
    #[serde(rename = "StackFileContent")]
    stack_file_content: String,
}

#[derive(Deserialize)]
struct AuthResponse {
    jwt: String,
}

#[derive(Serialize)]
struct RedeployRequest<'a> {
    #[serde(rename = "stackFileContent")]
    stack_file_content: &'a str,
    env: &'a [EnvVar],
    prune: bool,
    #[serde(rename = "pullImage")]
    pull_image: bool,
}

pub struct PortainerClient {
    base_url: String,
    auth: PortainerAuth,
    client: reqwest::Client,
    /// JWT from `/api/auth`, fetched once and reused.
    jwt: RwLock<Option<String>>,
}

impl PortainerClient {
    pub fn new(config: &PortainerConfig) -> Result<Self, PortainerError> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(config.insecure_tls)
            .build()?;
        Ok(Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            auth: config.auth.clone(),
            client,
            jwt: RwLock::new(None),
        })
    }

    pub async fn list_stacks(&self) -> Result<Vec<Stack>, PortainerError> {
        let url = format!("{}/api/stacks", self.base_url);
        let response = self.authorized(self.client.get(&url)).await?.send().await?;
        Self::check(&response)?;
        Ok(response.json().await?)
    }

    /// The compose file as stored by the orchestrator. Stacks created in
    /// the UI without a stored file answer 404, which callers treat as
    /// "skip this stack".
    pub async fn stack_file(&self, stack_id: i64) -> Result<String, PortainerError> {
        let url = format!("{}/api/stacks/{stack_id}/file", self.base_url);
        let response = self.authorized(self.client.get(&url)).await?.send().await?;
        if response.status().as_u16() == 404 {
            return Err(PortainerError::StackFileMissing);
        }
        Self::check(&response)?;
        let body = response.text().await?;
        match serde_json::from_str::<StackFileEnvelope>(&body) {
            Ok(envelope) => Ok(envelope.stack_file_content),
            Err(_) => Ok(body),
        }
    }

    pub async fn stack_env(&self, stack_id: i64) -> Result<Vec<EnvVar>, PortainerError> {
        let url = format!("{}/api/stacks/{stack_id}", self.base_url);
        let response = self.authorized(self.client.get(&url)).await?.send().await?;
        Self::check(&response)?;
        let stack: Stack = response.json().await?;
        Ok(stack.env)
    }

    /// Redeploy a stack with its original compose file and environment,
    /// forcing a pull and recreation of every service.
    pub async fn redeploy(
        &self,
        stack_id: i64,
        endpoint_id: i64,
        stack_file: &str,
        env: &[EnvVar],
    ) -> Result<(), PortainerError> {
        let url = format!("{}/api/stacks/{stack_id}", self.base_url);
        let body = RedeployRequest {
            stack_file_content: stack_file,
            env,
            prune: true,
            pull_image: true,
        };
        let request = self
            .client
            .put(&url)
            .query(&[
                ("endpointId", endpoint_id.to_string().as_str()),
                ("method", "string"),
                ("pullImage", "true"),
                ("recreate", "always"),
            ])
            .json(&body);
        let response = self.authorized(request).await?.send().await?;
        Self::check(&response)?;
        debug!(stack_id, endpoint_id, "stack redeploy accepted");
        Ok(())
    }

    async fn authorized(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::RequestBuilder, PortainerError> {
        match &self.auth {
            PortainerAuth::ApiKey(key) => Ok(request.header("X-API-Key", key)),
            PortainerAuth::Credentials { .. } => {
                let jwt = self.login().await?;
                Ok(request.bearer_auth(jwt))
            }
        }
    }

    async fn login(&self) -> Result<String, PortainerError> {
        if let Some(jwt) = self.jwt.read().clone() {
            return Ok(jwt);
        }
        let PortainerAuth::Credentials { username, password } = &self.auth else {
            unreachable!("login is only reached with credential auth");
        };
        let url = format!("{}/api/auth", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "username": username, "password": password }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(PortainerError::Auth(format!(
                "login rejected with status {}",
                response.status()
            )));
        }
        let auth: AuthResponse = response.json().await?;
        *self.jwt.write() = Some(auth.jwt.clone());
        Ok(auth.jwt)
    }

    fn check(response: &reqwest::Response) -> Result<(), PortainerError> {
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(PortainerError::Auth(format!("status {status}")));
        }
        Err(PortainerError::Api {
            status: status.as_u16(),
            message: status
                .canonical_reason()
                .unwrap_or("unexpected response")
                .to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn config(url: &str, auth: PortainerAuth) -> PortainerConfig {
        PortainerConfig {
            url: url.to_string(),
            auth,
            insecure_tls: false,
        }
    }

    #[tokio::test]
    async fn lists_stacks_with_api_key() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/stacks")
            .match_header("x-api-key", "secret")
            .with_status(200)
            .with_body(
                r#"[{"Id": 3, "Name": "web", "EndpointId": 1, "Type": 2,
                     "Env": [{"name": "TAG", "value": "prod"}]}]"#,
            )
            .create_async()
            .await;

        let client =
            PortainerClient::new(&config(&server.url(), PortainerAuth::ApiKey("secret".into())))
                .unwrap();
        let stacks = client.list_stacks().await.unwrap();

        assert_eq!(stacks.len(), 1);
        assert_eq!(stacks[0].name, "web");
        assert!(stacks[0].is_supported());
        assert_eq!(stacks[0].env[0].value, "prod");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn unwraps_the_stack_file_envelope() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/stacks/3/file")
            .with_status(200)
            .with_body(r#"{"StackFileContent": "services:\n  svc:\n    image: a/b:1\n"}"#)
            .create_async()
            .await;

        let client =
            PortainerClient::new(&config(&server.url(), PortainerAuth::ApiKey("k".into())))
                .unwrap();
        let yaml = client.stack_file(3).await.unwrap();
        assert!(yaml.starts_with("services:"));
    }

    #[tokio::test]
    async fn missing_stack_file_is_its_own_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/stacks/9/file")
            .with_status(404)
            .create_async()
            .await;

        let client =
            PortainerClient::new(&config(&server.url(), PortainerAuth::ApiKey("k".into())))
                .unwrap();
        assert!(matches!(
            client.stack_file(9).await,
            Err(PortainerError::StackFileMissing)
        ));
    }

    #[tokio::test]
    async fn redeploy_sends_pull_and_recreate() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("PUT", "/api/stacks/3")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("endpointId".into(), "2".into()),
                Matcher::UrlEncoded("method".into(), "string".into()),
                Matcher::UrlEncoded("pullImage".into(), "true".into()),
                Matcher::UrlEncoded("recreate".into(), "always".into()),
            ]))
            .match_body(Matcher::PartialJson(serde_json::json!({
                "prune": true,
                "pullImage": true,
            })))
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;

        let client =
            PortainerClient::new(&config(&server.url(), PortainerAuth::ApiKey("k".into())))
                .unwrap();
        let env = vec![EnvVar {
            name: "TAG".into(),
            value: "prod".into(),
        }];
        client
            .redeploy(3, 2, "services:\n  svc:\n    image: a/b:1\n", &env)
            .await
            .unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn credential_auth_logs_in_once_and_reuses_the_jwt() {
        let mut server = mockito::Server::new_async().await;
        let login = server
            .mock("POST", "/api/auth")
            .with_status(200)
            .with_body(r#"{"jwt": "token-1"}"#)
            .expect(1)
            .create_async()
            .await;
        let stacks = server
            .mock("GET", "/api/stacks")
            .match_header("authorization", "Bearer token-1")
            .with_status(200)
            .with_body("[]")
            .expect(2)
            .create_async()
            .await;

        let client = PortainerClient::new(&config(
            &server.url(),
            PortainerAuth::Credentials {
                username: "admin".into(),
                password: "pw".into(),
            },
        ))
        .unwrap();
        client.list_stacks().await.unwrap();
        client.list_stacks().await.unwrap();

        login.assert_async().await;
        stacks.assert_async().await;
    }

    #[tokio::test]
    async fn rejected_login_maps_to_auth_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/auth")
            .with_status(422)
            .create_async()
            .await;

        let client = PortainerClient::new(&config(
            &server.url(),
            PortainerAuth::Credentials {
                username: "admin".into(),
                password: "bad".into(),
            },
        ))
        .unwrap();
        assert!(matches!(
            client.list_stacks().await,
            Err(PortainerError::Auth(_))
        ));
    }
}
