//! Plinth core types: provision requests, stack identity, credentials,
//! error kinds and progress sinks shared by every other crate.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

/// Output key a successful apply of a public exposure must carry.
pub const URL_OUTPUT: &str = "url";

/// Longest logical function name we accept. Concrete resource names are
/// `{name}-{uuid}` and Kubernetes caps names and label values at 63.
pub const MAX_NAME_LEN: usize = 26;

/// Error kinds surfaced by the provisioning pipeline. Each stage of the
/// stack sequence gets its own kind so failures stay attributable all
/// the way up to the HTTP boundary.
#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("configuration: missing required value {0}")]
    ConfigurationMissing(&'static str),
    #[error("validation: {0}")]
    Validation(String),
    #[error("build: {0}")]
    Build(anyhow::Error),
    #[error("credential: malformed registry credential: {0}")]
    CredentialFormat(String),
    #[error("upsert: {0}")]
    StackUpsert(anyhow::Error),
    #[error("config: {0}")]
    Config(anyhow::Error),
    #[error("plugin-install: {0}")]
    PluginInstall(anyhow::Error),
    #[error("refresh: {0}")]
    Refresh(anyhow::Error),
    #[error("apply: {0}")]
    Apply(anyhow::Error),
    #[error("output: expected key {0:?} missing from apply result")]
    MissingOutput(String),
    #[error("output: key {key:?} is {found}, expected a string")]
    OutputType { key: String, found: &'static str },
    #[error("destroy: {0}")]
    Destroy(anyhow::Error),
}

impl ProvisionError {
    /// Stage tag for logs and metrics labels.
    pub fn stage(&self) -> &'static str {
        match self {
            ProvisionError::ConfigurationMissing(_) => "startup",
            ProvisionError::Validation(_) => "validation",
            ProvisionError::Build(_) => "build",
            ProvisionError::CredentialFormat(_) => "credential",
            ProvisionError::StackUpsert(_) => "upsert",
            ProvisionError::Config(_) => "config",
            ProvisionError::PluginInstall(_) => "plugin-install",
            ProvisionError::Refresh(_) => "refresh",
            ProvisionError::Apply(_) => "apply",
            ProvisionError::MissingOutput(_) | ProvisionError::OutputType { .. } => "output",
            ProvisionError::Destroy(_) => "destroy",
        }
    }

    /// True for errors caused by bad caller input rather than a failed
    /// provisioning step. The HTTP layer maps these to 400.
    pub fn is_bad_input(&self) -> bool {
        matches!(self, ProvisionError::Validation(_))
    }
}

/// One function-deployment request: a logical name plus the script body
/// handed verbatim to the image builder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionRequest {
    pub name: String,
    pub script: String,
}

impl ProvisionRequest {
    pub fn new(name: impl Into<String>, script: impl Into<String>) -> Self {
        Self { name: name.into(), script: script.into() }
    }

    /// Reject bad input before any image or engine call is made.
    /// Names must be usable as Kubernetes resource name prefixes.
    pub fn validate(&self) -> Result<(), ProvisionError> {
        if self.name.is_empty() {
            return Err(ProvisionError::Validation("function name must not be empty".into()));
        }
        if self.name.len() > MAX_NAME_LEN {
            return Err(ProvisionError::Validation(format!(
                "function name {:?} exceeds {} characters",
                self.name, MAX_NAME_LEN
            )));
        }
        let ok_chars = self
            .name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-');
        let ok_edges = self.name.starts_with(|c: char| c.is_ascii_alphanumeric())
            && self.name.ends_with(|c: char| c.is_ascii_alphanumeric());
        if !ok_chars || !ok_edges {
            return Err(ProvisionError::Validation(format!(
                "function name {:?} must be a lowercase DNS label (a-z, 0-9, '-')",
                self.name
            )));
        }
        if self.script.trim().is_empty() {
            return Err(ProvisionError::Validation("script must not be empty".into()));
        }
        Ok(())
    }
}

/// Unique key of a stack at the declarative engine: stack name plus
/// project name. Resolution is always create-if-absent-else-select.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct StackIdentity {
    pub stack: String,
    pub project: String,
}

impl StackIdentity {
    pub fn new(stack: impl Into<String>, project: impl Into<String>) -> Self {
        Self { stack: stack.into(), project: project.into() }
    }

    /// Stack key for a logical function name: one stack per function,
    /// re-applied in place on repeat provisions.
    pub fn for_function(name: &str, project: &str) -> Self {
        Self::new(name, project)
    }

    pub fn key(&self) -> String {
        format!("{}/{}", self.project, self.stack)
    }
}

impl std::fmt::Display for StackIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.project, self.stack)
    }
}

/// Process-wide cloud credentials, read once at startup and injected
/// into every stack's configuration. The secret key is sensitive: it
/// must never show up in logs or progress output, so `Debug` redacts it.
#[derive(Clone)]
pub struct CloudCredentials {
    pub region: String,
    pub access_key: String,
    pub secret_key: String,
}

impl CloudCredentials {
    /// Read credentials from the environment. Every value is required;
    /// a missing or empty one is a fatal startup error.
    pub fn from_env() -> Result<Self, ProvisionError> {
        fn required(key: &'static str) -> Result<String, ProvisionError> {
            match std::env::var(key) {
                Ok(v) if !v.trim().is_empty() => Ok(v),
                _ => Err(ProvisionError::ConfigurationMissing(key)),
            }
        }
        Ok(Self {
            region: required("REGION")?,
            access_key: required("ACCESS_KEY")?,
            secret_key: required("SECRET_KEY")?,
        })
    }
}

impl std::fmt::Debug for CloudCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudCredentials")
            .field("region", &self.region)
            .field("access_key", &self.access_key)
            .field("secret_key", &"[redacted]")
            .finish()
    }
}

/// Pushed image coordinate produced by the image builder. The
/// declaration only carries this reference; it never rebuilds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageReference {
    /// Full pullable coordinate, e.g. `registry.example.com/hello:latest`.
    pub image: String,
    /// Registry server the image was pushed to.
    pub server: String,
}

/// Final output map of a successful apply.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApplyResult {
    pub outputs: BTreeMap<String, serde_json::Value>,
}

impl ApplyResult {
    pub fn with_output(key: impl Into<String>, value: serde_json::Value) -> Self {
        let mut outputs = BTreeMap::new();
        outputs.insert(key.into(), value);
        Self { outputs }
    }
}

/// Line-oriented progress sink. Implementations must keep lines intact
/// under concurrent writers; callers send one complete line at a time.
pub trait ProgressSink: Send + Sync {
    fn line(&self, line: &str);
}

/// Sink writing to process stdout, one locked write per line.
#[derive(Debug, Default)]
pub struct StdoutSink;

impl ProgressSink for StdoutSink {
    fn line(&self, line: &str) {
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        let _ = writeln!(out, "{}", line);
    }
}

/// In-memory sink for tests and capture.
#[derive(Debug, Default)]
pub struct MemorySink {
    lines: Mutex<Vec<String>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.lines.lock().unwrap().iter().any(|l| l.contains(needle))
    }
}

impl ProgressSink for MemorySink {
    fn line(&self, line: &str) {
        self.lines.lock().unwrap().push(line.to_string());
    }
}

/// Wrapper scrubbing sensitive values out of every line before it
/// reaches the inner sink. The stack manager wraps its sink with the
/// stack's secret config values so nothing downstream can leak them.
pub struct RedactingSink<S> {
    inner: S,
    secrets: Vec<String>,
}

impl<S: ProgressSink> RedactingSink<S> {
    pub fn new(inner: S, secrets: Vec<String>) -> Self {
        // An empty secret would match everywhere.
        let secrets = secrets.into_iter().filter(|s| !s.is_empty()).collect();
        Self { inner, secrets }
    }
}

impl<S: ProgressSink> ProgressSink for RedactingSink<S> {
    fn line(&self, line: &str) {
        let mut scrubbed = line.to_string();
        for secret in &self.secrets {
            if scrubbed.contains(secret.as_str()) {
                scrubbed = scrubbed.replace(secret.as_str(), "[secret]");
            }
        }
        self.inner.line(&scrubbed);
    }
}

impl<S: ProgressSink + ?Sized> ProgressSink for std::sync::Arc<S> {
    fn line(&self, line: &str) {
        (**self).line(line)
    }
}
