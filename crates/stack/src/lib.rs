//! Stack lifecycle manager: the versioned, idempotent unit of declared
//! infrastructure. Sequences upsert -> config -> plugin -> refresh ->
//! apply (or destroy) against a pluggable declarative engine and tags
//! every failure with its stage.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tracing::info;

use plinth_core::{
    ApplyResult, CloudCredentials, ProgressSink, ProvisionError, RedactingSink, StackIdentity,
};
use plinth_declare::ResourceDeclaration;

pub mod kube;
pub use kube::KubeEngine;

/// Provider plugin the engine must have available, pinned.
pub const PROVIDER: &str = "kubernetes";
pub const PROVIDER_VERSION: &str = "v4.18.0";

/// One per-stack configuration value; `secret` values must never reach
/// any progress or log stream in the clear.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConfigValue {
    pub value: String,
    pub secret: bool,
}

impl ConfigValue {
    pub fn plain(value: impl Into<String>) -> Self {
        Self { value: value.into(), secret: false }
    }
    pub fn sensitive(value: impl Into<String>) -> Self {
        Self { value: value.into(), secret: true }
    }
}

/// Declarative infrastructure engine boundary. All operations are keyed
/// by stack identity; the engine owns whatever durable state exists.
/// Errors are raw here; the manager wraps them with stage kinds.
#[async_trait]
pub trait InfraEngine: Send + Sync {
    /// Create the stack if absent, else select it. Never fails merely
    /// because the stack already exists.
    async fn upsert(&self, id: &StackIdentity) -> anyhow::Result<()>;

    /// Replace the stack's configuration, honoring per-key sensitivity.
    async fn set_config(&self, id: &StackIdentity, config: BTreeMap<String, ConfigValue>) -> anyhow::Result<()>;

    /// Idempotently ensure the provider plugin is present at a pinned
    /// version.
    async fn ensure_plugin(&self, id: &StackIdentity, provider: &str, version: &str) -> anyhow::Result<()>;

    /// Reconcile last-known state with reality before applying.
    async fn refresh(&self, id: &StackIdentity, sink: &dyn ProgressSink) -> anyhow::Result<()>;

    /// Materialize the declaration and return the final output map.
    async fn apply(
        &self,
        id: &StackIdentity,
        decl: &ResourceDeclaration,
        sink: &dyn ProgressSink,
    ) -> anyhow::Result<ApplyResult>;

    /// Tear down everything the stack owns. Idempotent: destroying an
    /// already-empty stack succeeds trivially.
    async fn destroy(&self, id: &StackIdentity, sink: &dyn ProgressSink) -> anyhow::Result<()>;
}

/// Observable lifecycle position of a stack. Absence from the map is
/// the `Absent` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StackState {
    Selected,
    Configured,
    Refreshed,
    Applied,
}

/// Sequences stack operations against the engine. One call is either an
/// up (apply) or a down (destroy), never both. The manager adds no
/// stack-level lock of its own; serialization of concurrent operations
/// against one stack name is the engine's concern.
pub struct StackManager {
    engine: Arc<dyn InfraEngine>,
    sink: Arc<dyn ProgressSink>,
    states: Mutex<HashMap<String, StackState>>,
}

impl StackManager {
    pub fn new(engine: Arc<dyn InfraEngine>, sink: Arc<dyn ProgressSink>) -> Self {
        Self { engine, sink, states: Mutex::new(HashMap::new()) }
    }

    pub fn state(&self, id: &StackIdentity) -> Option<StackState> {
        self.states.lock().unwrap().get(&id.key()).copied()
    }

    fn set_state(&self, id: &StackIdentity, state: StackState) {
        self.states.lock().unwrap().insert(id.key(), state);
    }

    fn config_for(creds: &CloudCredentials) -> BTreeMap<String, ConfigValue> {
        let mut config = BTreeMap::new();
        config.insert("cloud:region".to_string(), ConfigValue::plain(&creds.region));
        config.insert("cloud:accessKey".to_string(), ConfigValue::plain(&creds.access_key));
        config.insert("cloud:secretKey".to_string(), ConfigValue::sensitive(&creds.secret_key));
        config
    }

    /// Shared prefix of up and down: select the stack and inject its
    /// configuration. Returns the redacting sink the rest of the call
    /// must stream through.
    async fn select_and_configure(
        &self,
        id: &StackIdentity,
        creds: &CloudCredentials,
    ) -> Result<RedactingSink<Arc<dyn ProgressSink>>, ProvisionError> {
        let sink = RedactingSink::new(self.sink.clone(), vec![creds.secret_key.clone()]);

        self.engine.upsert(id).await.map_err(ProvisionError::StackUpsert)?;
        self.set_state(id, StackState::Selected);
        sink.line(&format!("created/selected stack {id}"));

        self.engine
            .set_config(id, Self::config_for(creds))
            .await
            .map_err(ProvisionError::Config)?;
        self.set_state(id, StackState::Configured);
        sink.line(&format!("configured stack {id}"));

        Ok(sink)
    }

    /// Full up sequence. The declaration closure is bound here and
    /// invoked only once the stack is refreshed, immediately before
    /// apply.
    pub async fn up<F>(
        &self,
        id: &StackIdentity,
        creds: &CloudCredentials,
        declare: F,
    ) -> Result<ApplyResult, ProvisionError>
    where
        F: FnOnce() -> ResourceDeclaration + Send,
    {
        let t0 = std::time::Instant::now();
        counter!("stack_up_attempts", 1u64);

        let sink = self.select_and_configure(id, creds).await?;

        self.engine
            .ensure_plugin(id, PROVIDER, PROVIDER_VERSION)
            .await
            .map_err(ProvisionError::PluginInstall)?;
        sink.line(&format!("provider plugin {PROVIDER} {PROVIDER_VERSION} present"));

        sink.line("starting refresh");
        self.engine.refresh(id, &sink).await.map_err(ProvisionError::Refresh)?;
        self.set_state(id, StackState::Refreshed);
        sink.line("refresh succeeded");

        let decl = declare();
        sink.line("starting update");
        let result = self.engine.apply(id, &decl, &sink).await.map_err(ProvisionError::Apply)?;
        self.set_state(id, StackState::Applied);
        sink.line("update succeeded");

        info!(stack = %id, elapsed_ms = t0.elapsed().as_millis() as u64, "stack up complete");
        histogram!("stack_up_ms", t0.elapsed().as_secs_f64() * 1000.0);
        counter!("stack_up_ok", 1u64);
        Ok(result)
    }

    /// Tear down the stack. After a successful destroy the manager
    /// forgets the identity entirely, so a later call against the same
    /// name starts a fresh select cycle.
    pub async fn down(&self, id: &StackIdentity, creds: &CloudCredentials) -> Result<(), ProvisionError> {
        counter!("stack_down_attempts", 1u64);
        let sink = self.select_and_configure(id, creds).await?;

        sink.line("starting destroy");
        self.engine.destroy(id, &sink).await.map_err(ProvisionError::Destroy)?;
        self.states.lock().unwrap().remove(&id.key());
        sink.line(&format!("destroyed stack {id}"));
        counter!("stack_down_ok", 1u64);
        Ok(())
    }
}

// ----------------- Fake engine for tests -----------------

/// In-memory engine recording every call, with optional scripted
/// failure at a single stage. Used by stack and orchestrator tests.
#[derive(Default)]
pub struct FakeEngine {
    pub calls: Mutex<Vec<String>>,
    pub declarations: Mutex<Vec<ResourceDeclaration>>,
    pub config: Mutex<BTreeMap<String, ConfigValue>>,
    outputs: Mutex<Option<ApplyResult>>,
    fail_at: Option<&'static str>,
    /// Echo configuration values into the progress stream during apply,
    /// the way a chatty engine might. Exercises redaction.
    pub echo_config: bool,
}

impl FakeEngine {
    pub fn new() -> Self {
        let mut me = Self::default();
        me.outputs = Mutex::new(Some(ApplyResult::with_output(
            plinth_core::URL_OUTPUT,
            serde_json::json!("fake-lb.example.com"),
        )));
        me
    }

    pub fn failing_at(stage: &'static str) -> Self {
        let mut me = Self::new();
        me.fail_at = Some(stage);
        me
    }

    pub fn with_outputs(outputs: ApplyResult) -> Self {
        let me = Self::new();
        *me.outputs.lock().unwrap() = Some(outputs);
        me
    }

    pub fn echoing_config() -> Self {
        let mut me = Self::new();
        me.echo_config = true;
        me
    }

    fn record(&self, op: &'static str) -> anyhow::Result<()> {
        self.calls.lock().unwrap().push(op.to_string());
        if self.fail_at == Some(op) {
            anyhow::bail!("scripted {op} failure");
        }
        Ok(())
    }
}

#[async_trait]
impl InfraEngine for FakeEngine {
    async fn upsert(&self, _id: &StackIdentity) -> anyhow::Result<()> {
        self.record("upsert")
    }

    async fn set_config(&self, _id: &StackIdentity, config: BTreeMap<String, ConfigValue>) -> anyhow::Result<()> {
        self.record("set_config")?;
        *self.config.lock().unwrap() = config;
        Ok(())
    }

    async fn ensure_plugin(&self, _id: &StackIdentity, _provider: &str, _version: &str) -> anyhow::Result<()> {
        self.record("ensure_plugin")
    }

    async fn refresh(&self, _id: &StackIdentity, sink: &dyn ProgressSink) -> anyhow::Result<()> {
        self.record("refresh")?;
        sink.line("refresh: no drift");
        Ok(())
    }

    async fn apply(
        &self,
        _id: &StackIdentity,
        decl: &ResourceDeclaration,
        sink: &dyn ProgressSink,
    ) -> anyhow::Result<ApplyResult> {
        self.record("apply")?;
        if self.echo_config {
            for (key, cv) in self.config.lock().unwrap().iter() {
                sink.line(&format!("config {key}={}", cv.value));
            }
        }
        sink.line(&format!("applied deployment/{}", decl.workload.name));
        sink.line(&format!("applied service/{}", decl.exposure.name));
        self.declarations.lock().unwrap().push(decl.clone());
        let outputs = self.outputs.lock().unwrap().clone();
        Ok(outputs.unwrap_or_default())
    }

    async fn destroy(&self, _id: &StackIdentity, sink: &dyn ProgressSink) -> anyhow::Result<()> {
        self.record("destroy")?;
        sink.line("destroy complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plinth_core::{ImageReference, MemorySink};

    fn creds() -> CloudCredentials {
        CloudCredentials {
            region: "us-west-2".into(),
            access_key: "AKIAEXAMPLE".into(),
            secret_key: "very-secret-key".into(),
        }
    }

    fn image() -> ImageReference {
        ImageReference { image: "reg.example.com/fn:latest".into(), server: "reg.example.com".into() }
    }

    fn manager(engine: FakeEngine) -> (StackManager, Arc<FakeEngine>, Arc<MemorySink>) {
        let engine = Arc::new(engine);
        let sink = Arc::new(MemorySink::new());
        let mgr = StackManager::new(engine.clone(), sink.clone());
        (mgr, engine, sink)
    }

    #[tokio::test]
    async fn up_runs_stages_in_order_and_lands_applied() {
        let (mgr, engine, _sink) = manager(FakeEngine::new());
        let id = StackIdentity::for_function("hello", "plinth-faas");
        let result = mgr
            .up(&id, &creds(), || plinth_declare::declare("hello", &image(), false))
            .await
            .expect("up succeeds");
        assert_eq!(
            engine.calls.lock().unwrap().as_slice(),
            ["upsert", "set_config", "ensure_plugin", "refresh", "apply"]
        );
        assert_eq!(mgr.state(&id), Some(StackState::Applied));
        assert!(result.outputs.contains_key(plinth_core::URL_OUTPUT));
    }

    #[tokio::test]
    async fn refresh_failure_aborts_before_apply_with_refresh_kind() {
        let (mgr, engine, _sink) = manager(FakeEngine::failing_at("refresh"));
        let id = StackIdentity::for_function("hello", "plinth-faas");
        let err = mgr
            .up(&id, &creds(), || plinth_declare::declare("hello", &image(), false))
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::Refresh(_)), "got {err}");
        assert!(!engine.calls.lock().unwrap().iter().any(|c| c == "apply"));
        // Config stuck; refresh never completed.
        assert_eq!(mgr.state(&id), Some(StackState::Configured));
    }

    #[tokio::test]
    async fn plugin_failure_surfaces_plugin_install_kind() {
        let (mgr, _engine, _sink) = manager(FakeEngine::failing_at("ensure_plugin"));
        let id = StackIdentity::for_function("hello", "plinth-faas");
        let err = mgr
            .up(&id, &creds(), || plinth_declare::declare("hello", &image(), false))
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::PluginInstall(_)), "got {err}");
        assert_eq!(err.stage(), "plugin-install");
    }

    #[tokio::test]
    async fn secret_key_never_reaches_progress_output() {
        let (mgr, _engine, sink) = manager(FakeEngine::echoing_config());
        let id = StackIdentity::for_function("hello", "plinth-faas");
        mgr.up(&id, &creds(), || plinth_declare::declare("hello", &image(), false))
            .await
            .expect("up succeeds");
        let lines = sink.lines();
        assert!(!lines.is_empty());
        assert!(!lines.iter().any(|l| l.contains("very-secret-key")), "secret leaked: {lines:?}");
        // Plain config still passes through.
        assert!(sink.contains("cloud:region=us-west-2"));
        assert!(sink.contains("cloud:secretKey=[secret]"));
    }

    #[tokio::test]
    async fn destroy_on_never_applied_stack_succeeds_and_forgets_it() {
        let (mgr, engine, _sink) = manager(FakeEngine::new());
        let id = StackIdentity::for_function("fresh", "plinth-faas");
        mgr.down(&id, &creds()).await.expect("down succeeds");
        assert_eq!(
            engine.calls.lock().unwrap().as_slice(),
            ["upsert", "set_config", "destroy"]
        );
        // Forgotten: a later call starts from Absent.
        assert_eq!(mgr.state(&id), None);
    }

    #[tokio::test]
    async fn reapply_against_same_stack_is_reentrant() {
        let (mgr, engine, _sink) = manager(FakeEngine::new());
        let id = StackIdentity::for_function("hello", "plinth-faas");
        for _ in 0..2 {
            mgr.up(&id, &creds(), || plinth_declare::declare("hello", &image(), false))
                .await
                .expect("up succeeds");
        }
        assert_eq!(mgr.state(&id), Some(StackState::Applied));
        let decls = engine.declarations.lock().unwrap();
        assert_eq!(decls.len(), 2);
        // Same logical stack, distinct concrete resource names.
        assert_eq!(decls[0].stack, decls[1].stack);
        assert_ne!(decls[0].workload.name, decls[1].workload.name);
    }
}
