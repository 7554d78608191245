//! Registry-direct freshness probe
//!
//! Asks the registry for the manifest digest of a tag without pulling it:
//! a HEAD against `/v2/<repo>/manifests/<tag>` whose `Docker-Content-Digest`
//! header is compared to the locally recorded repo digest. Unauthenticated
//! registries answer directly; otherwise the single Bearer challenge round
//! from the `WWW-Authenticate` header is followed. The answer is a hint:
//! an update still pulls through the engine.

use crate::reference::Reference;
use serde::Deserialize;
use tracing::debug;

const MANIFEST_ACCEPT: &str = "application/vnd.docker.distribution.manifest.v2+json";

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("registry transport error: {0}")]
    Transport(String),
    #[error("registry answered {0} for the manifest")]
    Status(u16),
    #[error("bearer challenge missing or malformed: {0}")]
    Challenge(String),
}

impl From<reqwest::Error> for RegistryError {
    fn from(err: reqwest::Error) -> Self {
        RegistryError::Transport(err.to_string())
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    #[serde(alias = "access_token")]
    token: String,
}

pub struct RegistryProbe {
    client: reqwest::Client,
}

impl RegistryProbe {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    /// The digest the registry currently serves for this reference's tag,
    /// or `None` when the registry does not expose one.
    pub async fn remote_digest(
        &self,
        reference: &Reference,
    ) -> Result<Option<String>, RegistryError> {
        let url = format!(
            "{}/v2/{}/manifests/{}",
            registry_endpoint(reference),
            reference.api_repository(),
            reference.tag()
        );

        let first = self
            .client
            .head(&url)
            .header("Accept", MANIFEST_ACCEPT)
            .send()
            .await?;

        let response = if first.status().as_u16() == 401 {
            let challenge = first
                .headers()
                .get("www-authenticate")
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| RegistryError::Challenge("no WWW-Authenticate header".into()))?;
            let token = self.fetch_token(challenge, reference).await?;
            self.client
                .head(&url)
                .header("Accept", MANIFEST_ACCEPT)
                .bearer_auth(token)
                .send()
                .await?
        } else {
            first
        };

        if !response.status().is_success() {
            return Err(RegistryError::Status(response.status().as_u16()));
        }

        let digest = response
            .headers()
            .get("docker-content-digest")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        debug!(reference = %reference, ?digest, "registry manifest digest");
        Ok(digest)
    }

    async fn fetch_token(
        &self,
        challenge: &str,
        reference: &Reference,
    ) -> Result<String, RegistryError> {
        let params = parse_bearer_challenge(challenge)
            .ok_or_else(|| RegistryError::Challenge(challenge.to_string()))?;
        let scope = params
            .scope
            .unwrap_or_else(|| format!("repository:{}:pull", reference.api_repository()));

        let mut request = self.client.get(&params.realm).query(&[("scope", scope)]);
        if let Some(service) = params.service {
            request = request.query(&[("service", service)]);
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(RegistryError::Challenge(format!(
                "token endpoint answered {}",
                response.status()
            )));
        }
        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| RegistryError::Challenge(e.to_string()))?;
        Ok(token.token)
    }
}

impl Default for RegistryProbe {
    fn default() -> Self {
        Self::new()
    }
}

struct BearerChallenge {
    realm: String,
    service: Option<String>,
    scope: Option<String>,
}

/// `Bearer realm="…",service="…",scope="…"`; only the realm is required.
fn parse_bearer_challenge(header: &str) -> Option<BearerChallenge> {
    let params = header.strip_prefix("Bearer ")?;
    let mut realm = None;
    let mut service = None;
    let mut scope = None;
    for part in params.split(',') {
        let (key, value) = part.trim().split_once('=')?;
        let value = value.trim_matches('"').to_string();
        match key {
            "realm" => realm = Some(value),
            "service" => service = Some(value),
            "scope" => scope = Some(value),
            _ => {}
        }
    }
    Some(BearerChallenge {
        realm: realm?,
        service,
        scope,
    })
}

/// Base URL of the v2 API for the reference's registry. Docker Hub pulls
/// go through registry-1; registries with a port (or localhost) are
/// assumed to be plain HTTP, which is how local registries run.
fn registry_endpoint(reference: &Reference) -> String {
    match reference.registry_host() {
        None => "https://registry-1.docker.io".to_string(),
        Some(host) if host.contains(':') || host == "localhost" => format!("http://{host}"),
        Some(host) => format!("https://{host}"),
    }
}
