//! Provisioning orchestrator: composes image build, declaration,
//! stack lifecycle and output resolution into one blocking
//! `provision(name, script) -> url` call.

#![forbid(unsafe_code)]

use std::sync::Arc;

use metrics::counter;
use tracing::{error, info};

use plinth_core::{
    ApplyResult, CloudCredentials, ProvisionError, ProvisionRequest, StackIdentity, URL_OUTPUT,
};
use plinth_image::ImageBuild;
use plinth_stack::StackManager;

/// Default project name stacks are keyed under.
pub const DEFAULT_PROJECT: &str = "plinth-faas";

/// Pull the public URL out of an apply result. A missing key after a
/// reported-successful apply is a contract violation by the engine and
/// surfaces immediately; there is no retry and no silent default.
pub fn extract_url(result: &ApplyResult) -> Result<String, ProvisionError> {
    let value = result
        .outputs
        .get(URL_OUTPUT)
        .ok_or_else(|| ProvisionError::MissingOutput(URL_OUTPUT.to_string()))?;
    match value {
        serde_json::Value::String(s) => Ok(s.clone()),
        other => Err(ProvisionError::OutputType {
            key: URL_OUTPUT.to_string(),
            found: json_type_name(other),
        }),
    }
}

fn json_type_name(v: &serde_json::Value) -> &'static str {
    match v {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a bool",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}

/// The orchestrator. Holds no mutable state of its own beyond the
/// read-only process-wide credentials; each call runs the full pipeline
/// and blocks until the endpoint exists or a stage fails. Side effects
/// of earlier stages are not rolled back on later failure; operators
/// clean up with `destroy`.
pub struct Provisioner {
    builder: Arc<dyn ImageBuild>,
    manager: StackManager,
    creds: CloudCredentials,
    project: String,
    /// Dev-environment flag: cluster-internal exposure instead of a
    /// public load balancer.
    local: bool,
}

impl Provisioner {
    pub fn new(
        builder: Arc<dyn ImageBuild>,
        manager: StackManager,
        creds: CloudCredentials,
        local: bool,
    ) -> Self {
        Self { builder, manager, creds, project: DEFAULT_PROJECT.to_string(), local }
    }

    pub fn with_project(mut self, project: impl Into<String>) -> Self {
        self.project = project.into();
        self
    }

    fn identity(&self, name: &str) -> StackIdentity {
        StackIdentity::for_function(name, &self.project)
    }

    /// Provision a function: returns the public URL, or the first
    /// failing stage's error. Never both.
    pub async fn provision(&self, name: &str, script: &str) -> Result<String, ProvisionError> {
        counter!("provision_attempts", 1u64);
        let request = ProvisionRequest::new(name, script);
        // Bad input is rejected before any image or engine call.
        request.validate()?;

        let id = self.identity(&request.name);
        info!(stack = %id, "provisioning function");

        let image = self.builder.build(&request.name, &request.script).await.map_err(|e| {
            error!(stage = e.stage(), error = %e, "image build failed");
            e
        })?;

        let result = self
            .manager
            .up(&id, &self.creds, {
                let name = request.name.clone();
                let local = self.local;
                move || plinth_declare::declare(&name, &image, local)
            })
            .await
            .map_err(|e| {
                error!(stage = e.stage(), error = %e, "stack up failed");
                e
            })?;

        let url = extract_url(&result)?;
        if url.is_empty() {
            return Err(ProvisionError::OutputType { key: URL_OUTPUT.to_string(), found: "an empty string" });
        }
        counter!("provision_ok", 1u64);
        info!(stack = %id, url = %url, "function provisioned");
        Ok(url)
    }

    /// Tear down everything the function's stack owns. Explicit
    /// operator action; provisioning never destroys on its own.
    pub async fn destroy(&self, name: &str) -> Result<(), ProvisionError> {
        let id = self.identity(name);
        info!(stack = %id, "destroying function stack");
        self.manager.down(&id, &self.creds).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use plinth_core::{ImageReference, MemorySink, ProgressSink};
    use plinth_stack::FakeEngine;
    use std::sync::Mutex;

    /// Image builder double: records calls, optionally fails.
    #[derive(Default)]
    struct FakeBuilder {
        calls: Mutex<Vec<(String, String)>>,
        fail: bool,
    }

    #[async_trait]
    impl ImageBuild for FakeBuilder {
        async fn build(&self, name: &str, script: &str) -> Result<ImageReference, ProvisionError> {
            self.calls.lock().unwrap().push((name.to_string(), script.to_string()));
            if self.fail {
                return Err(ProvisionError::Build(anyhow::anyhow!("scripted build failure")));
            }
            Ok(ImageReference {
                image: format!("registry.test/{name}:latest"),
                server: "registry.test".into(),
            })
        }
    }

    fn creds() -> CloudCredentials {
        CloudCredentials {
            region: "us-west-2".into(),
            access_key: "AKIAEXAMPLE".into(),
            secret_key: "shhh-secret".into(),
        }
    }

    fn provisioner_with(
        engine: FakeEngine,
        builder: FakeBuilder,
    ) -> (Provisioner, Arc<FakeEngine>, Arc<FakeBuilder>, Arc<MemorySink>) {
        let engine = Arc::new(engine);
        let builder = Arc::new(builder);
        let sink: Arc<MemorySink> = Arc::new(MemorySink::new());
        let manager = StackManager::new(engine.clone(), sink.clone() as Arc<dyn ProgressSink>);
        let p = Provisioner::new(builder.clone(), manager, creds(), false);
        (p, engine, builder, sink)
    }

    #[tokio::test]
    async fn provision_returns_the_engine_url() {
        let (p, _engine, _builder, _sink) = provisioner_with(FakeEngine::new(), FakeBuilder::default());
        let url = p.provision("hello", "console.log('hi')").await.expect("provision succeeds");
        assert_eq!(url, "fake-lb.example.com");
    }

    #[tokio::test]
    async fn empty_script_is_rejected_before_any_build_or_engine_call() {
        let (p, engine, builder, _sink) = provisioner_with(FakeEngine::new(), FakeBuilder::default());
        let err = p.provision("bad", "").await.unwrap_err();
        assert!(matches!(err, ProvisionError::Validation(_)), "got {err}");
        assert!(builder.calls.lock().unwrap().is_empty(), "builder was called");
        assert!(engine.calls.lock().unwrap().is_empty(), "engine was called");
    }

    #[tokio::test]
    async fn build_failure_stops_before_the_engine() {
        let (p, engine, builder, _sink) =
            provisioner_with(FakeEngine::new(), FakeBuilder { fail: true, ..Default::default() });
        let err = p.provision("hello", "x()").await.unwrap_err();
        assert!(matches!(err, ProvisionError::Build(_)), "got {err}");
        assert_eq!(builder.calls.lock().unwrap().len(), 1);
        assert!(engine.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn repeated_provisions_of_one_name_get_distinct_concrete_names() {
        let (p, engine, _builder, _sink) = provisioner_with(FakeEngine::new(), FakeBuilder::default());
        p.provision("hello", "x()").await.unwrap();
        p.provision("hello", "x()").await.unwrap();
        let decls = engine.declarations.lock().unwrap();
        assert_eq!(decls.len(), 2);
        assert_ne!(decls[0].workload.name, decls[1].workload.name);
        assert_ne!(decls[0].exposure.name, decls[1].exposure.name);
        assert_eq!(decls[0].stack, "hello");
        assert_eq!(decls[1].stack, "hello");
    }

    #[tokio::test]
    async fn url_and_error_are_mutually_exclusive() {
        // Success path yields a non-empty URL.
        let (ok, ..) = provisioner_with(FakeEngine::new(), FakeBuilder::default());
        let url = ok.provision("a", "x()").await.unwrap();
        assert!(!url.is_empty());
        // Failure path yields an error and no URL at all.
        let (bad, ..) = provisioner_with(FakeEngine::failing_at("apply"), FakeBuilder::default());
        assert!(bad.provision("a", "x()").await.is_err());
    }

    #[tokio::test]
    async fn missing_url_output_is_a_named_error_not_a_default() {
        let (p, ..) = provisioner_with(FakeEngine::with_outputs(ApplyResult::default()), FakeBuilder::default());
        let err = p.provision("hello", "x()").await.unwrap_err();
        assert!(matches!(err, ProvisionError::MissingOutput(_)), "got {err}");
    }

    #[tokio::test]
    async fn non_string_url_output_is_a_type_error() {
        let outputs = ApplyResult::with_output(URL_OUTPUT, serde_json::json!(42));
        let (p, ..) = provisioner_with(FakeEngine::with_outputs(outputs), FakeBuilder::default());
        let err = p.provision("hello", "x()").await.unwrap_err();
        assert!(matches!(err, ProvisionError::OutputType { .. }), "got {err}");
    }

    #[tokio::test]
    async fn destroy_delegates_to_the_stack_manager() {
        let (p, engine, _builder, _sink) = provisioner_with(FakeEngine::new(), FakeBuilder::default());
        p.destroy("hello").await.expect("destroy succeeds");
        assert!(engine.calls.lock().unwrap().iter().any(|c| c == "destroy"));
    }

    #[test]
    fn extract_url_reads_the_url_output() {
        let result = ApplyResult::with_output(URL_OUTPUT, serde_json::json!("lb.example.com"));
        assert_eq!(extract_url(&result).unwrap(), "lb.example.com");
    }

    #[test]
    fn extract_url_names_the_offending_type() {
        let result = ApplyResult::with_output(URL_OUTPUT, serde_json::json!({ "nested": true }));
        let err = extract_url(&result).unwrap_err();
        assert!(err.to_string().contains("an object"), "got {err}");
    }
}
