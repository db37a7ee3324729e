//! Image builder: packages the function script into a container image
//! and pushes it to a registry. Builds are not transactional; a push
//! failure surfaces as a build failure and yields no usable reference.

#![forbid(unsafe_code)]

use std::collections::HashMap;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use base64::Engine as _;
use bollard::auth::DockerCredentials;
use bollard::image::{BuildImageOptions, PushImageOptions};
use bollard::Docker;
use futures::StreamExt;
use metrics::{counter, histogram};
use tracing::info;

use plinth_core::{ImageReference, ProgressSink, ProvisionError};

const DOCKERFILE: &str = include_str!("../runtime/Dockerfile");
const SERVER_SHIM: &str = include_str!("../runtime/server.js");

/// Image build capability consumed by the orchestrator. `name` is the
/// logical function name; `script` is the opaque payload baked into the
/// image.
#[async_trait]
pub trait ImageBuild: Send + Sync {
    async fn build(&self, name: &str, script: &str) -> Result<ImageReference, ProvisionError>;
}

/// Registry coordinates plus an optional base64 `username:password`
/// auth token.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub server: String,
    pub auth_token: Option<String>,
}

impl RegistryConfig {
    pub fn from_env() -> Self {
        Self {
            server: std::env::var("PLINTH_REGISTRY").unwrap_or_else(|_| "localhost:5000".to_string()),
            auth_token: std::env::var("PLINTH_REGISTRY_TOKEN").ok().filter(|t| !t.is_empty()),
        }
    }

    /// Full pushable coordinate for a function name.
    pub fn coordinate(&self, name: &str) -> String {
        format!("{}/{}:latest", self.server, name)
    }
}

/// Decode a registry auth token into (username, password). The token is
/// base64 over a colon-delimited pair; anything else is a malformed
/// credential, not a build failure.
pub fn decode_registry_token(token: &str) -> Result<(String, String), ProvisionError> {
    let raw = base64::engine::general_purpose::STANDARD
        .decode(token)
        .map_err(|e| ProvisionError::CredentialFormat(format!("not valid base64: {e}")))?;
    let text = String::from_utf8(raw)
        .map_err(|_| ProvisionError::CredentialFormat("decoded token is not UTF-8".into()))?;
    let parts: Vec<&str> = text.split(':').collect();
    if parts.len() != 2 {
        return Err(ProvisionError::CredentialFormat(format!(
            "expected username:password, got {} part(s)",
            parts.len()
        )));
    }
    Ok((parts[0].to_string(), parts[1].to_string()))
}

/// In-memory tar context for the docker build: the Dockerfile template
/// plus the Node runtime shim. The script itself travels as a build arg.
pub fn build_context() -> anyhow::Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    append_file(&mut builder, "Dockerfile", DOCKERFILE.as_bytes())?;
    append_file(&mut builder, "server.js", SERVER_SHIM.as_bytes())?;
    builder.into_inner().context("finishing build context tar")
}

fn append_file<W: std::io::Write>(builder: &mut tar::Builder<W>, name: &str, data: &[u8]) -> anyhow::Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, name, data)
        .with_context(|| format!("adding {name} to build context"))
}

/// Builder backed by the local Docker daemon.
pub struct DockerImageBuilder {
    registry: RegistryConfig,
    sink: std::sync::Arc<dyn ProgressSink>,
}

impl DockerImageBuilder {
    pub fn new(registry: RegistryConfig, sink: std::sync::Arc<dyn ProgressSink>) -> Self {
        Self { registry, sink }
    }

    fn credentials(&self) -> Result<Option<DockerCredentials>, ProvisionError> {
        match &self.registry.auth_token {
            None => Ok(None),
            Some(token) => {
                let (username, password) = decode_registry_token(token)?;
                Ok(Some(DockerCredentials {
                    username: Some(username),
                    password: Some(password),
                    serveraddress: Some(self.registry.server.clone()),
                    ..Default::default()
                }))
            }
        }
    }
}

#[async_trait]
impl ImageBuild for DockerImageBuilder {
    async fn build(&self, name: &str, script: &str) -> Result<ImageReference, ProvisionError> {
        let t0 = std::time::Instant::now();
        counter!("image_build_attempts", 1u64);

        // Credentials are resolved up front; a malformed token must not
        // reach the daemon as a build attempt.
        let credentials = self.credentials()?;

        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| ProvisionError::Build(anyhow!(e).context("connecting to docker daemon")))?;
        let coordinate = self.registry.coordinate(name);
        let context = build_context().map_err(ProvisionError::Build)?;

        let mut buildargs = HashMap::new();
        buildargs.insert("script".to_string(), script.to_string());
        let options = BuildImageOptions {
            t: coordinate.clone(),
            dockerfile: "Dockerfile".to_string(),
            buildargs,
            platform: "linux/amd64".to_string(),
            rm: true,
            ..Default::default()
        };

        info!(image = %coordinate, "building function image");
        let mut stream = docker.build_image(options, None, Some(context.into()));
        while let Some(msg) = stream.next().await {
            let chunk = msg.map_err(|e| {
                counter!("image_build_err", 1u64);
                ProvisionError::Build(anyhow!(e).context("docker build"))
            })?;
            if let Some(err) = chunk.error {
                counter!("image_build_err", 1u64);
                return Err(ProvisionError::Build(anyhow!("docker build: {err}")));
            }
            if let Some(text) = chunk.stream {
                for line in text.lines().filter(|l| !l.trim().is_empty()) {
                    self.sink.line(line);
                }
            }
        }

        info!(image = %coordinate, "pushing function image");
        let push_opts = PushImageOptions { tag: "latest".to_string() };
        let repo = format!("{}/{}", self.registry.server, name);
        let mut push = docker.push_image(&repo, Some(push_opts), credentials);
        while let Some(msg) = push.next().await {
            let chunk = msg.map_err(|e| {
                counter!("image_push_err", 1u64);
                ProvisionError::Build(anyhow!(e).context("docker push"))
            })?;
            if let Some(err) = chunk.error {
                counter!("image_push_err", 1u64);
                return Err(ProvisionError::Build(anyhow!("docker push: {err}")));
            }
            if let Some(status) = chunk.status {
                self.sink.line(&status);
            }
        }

        histogram!("image_build_ms", t0.elapsed().as_secs_f64() * 1000.0);
        counter!("image_build_ok", 1u64);
        Ok(ImageReference { image: coordinate, server: self.registry.server.clone() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_decodes_to_username_and_password() {
        let token = base64::engine::general_purpose::STANDARD.encode("alice:s3cret");
        let (user, pass) = decode_registry_token(&token).expect("valid token");
        assert_eq!(user, "alice");
        assert_eq!(pass, "s3cret");
    }

    #[test]
    fn token_with_wrong_part_count_is_a_credential_error() {
        for payload in ["no-colon-here", "a:b:c"] {
            let token = base64::engine::general_purpose::STANDARD.encode(payload);
            let err = decode_registry_token(&token).unwrap_err();
            assert!(matches!(err, ProvisionError::CredentialFormat(_)), "payload {payload:?} gave {err}");
        }
    }

    #[test]
    fn garbage_base64_is_a_credential_error() {
        let err = decode_registry_token("!!! not base64 !!!").unwrap_err();
        assert!(matches!(err, ProvisionError::CredentialFormat(_)));
    }

    #[test]
    fn build_context_carries_dockerfile_and_shim() {
        let bytes = build_context().expect("context");
        let mut archive = tar::Archive::new(&bytes[..]);
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().display().to_string())
            .collect();
        assert_eq!(names, vec!["Dockerfile", "server.js"]);
    }

    #[test]
    fn coordinate_includes_server_and_tag() {
        let cfg = RegistryConfig { server: "registry.example.com".into(), auth_token: None };
        assert_eq!(cfg.coordinate("hello"), "registry.example.com/hello:latest");
    }
}
