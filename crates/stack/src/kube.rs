//! Kubernetes-backed declarative engine: server-side apply of the
//! declared manifests, label-based pruning, LB output resolution.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams};
use kube::discovery::Discovery;
use kube::Client;
use metrics::{counter, histogram};
use tracing::info;

use plinth_core::{ApplyResult, ProgressSink, StackIdentity, URL_OUTPUT};
use plinth_declare::{ExposureKind, ResourceDeclaration, STACK_LABEL};

use crate::{ConfigValue, InfraEngine};

/// Field manager name for server-side apply.
const FIELD_MANAGER: &str = "plinth";

#[derive(Debug, Default)]
struct StackRecord {
    config: BTreeMap<String, ConfigValue>,
}

/// Engine over a Kubernetes cluster. Stack records live in memory; the
/// cluster itself is the durable backend (ownership is recoverable from
/// the stack label). Mutating operations hold the per-stack record lock
/// for their full duration, so concurrent applies against one stack
/// name serialize while distinct names proceed in parallel.
pub struct KubeEngine {
    namespace: String,
    lb_timeout: Duration,
    lb_poll: Duration,
    stacks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<StackRecord>>>>,
}

impl KubeEngine {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            lb_timeout: Duration::from_secs(300),
            lb_poll: Duration::from_secs(2),
            stacks: Mutex::new(HashMap::new()),
        }
    }

    /// Namespace and LB wait knobs from the environment:
    /// `PLINTH_NAMESPACE`, `PLINTH_LB_TIMEOUT_SECS`, `PLINTH_LB_POLL_SECS`.
    pub fn from_env() -> Self {
        let secs = |key: &str, default: u64| {
            std::env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
        };
        Self {
            namespace: std::env::var("PLINTH_NAMESPACE").unwrap_or_else(|_| "default".to_string()),
            lb_timeout: Duration::from_secs(secs("PLINTH_LB_TIMEOUT_SECS", 300)),
            lb_poll: Duration::from_secs(secs("PLINTH_LB_POLL_SECS", 2)),
            stacks: Mutex::new(HashMap::new()),
        }
    }

    fn selector(id: &StackIdentity) -> String {
        format!("{}={}", STACK_LABEL, id.stack)
    }

    fn record(&self, id: &StackIdentity) -> Result<Arc<tokio::sync::Mutex<StackRecord>>> {
        self.stacks
            .lock()
            .unwrap()
            .get(&id.key())
            .cloned()
            .ok_or_else(|| anyhow!("stack {id} not selected"))
    }

    async fn client() -> Result<Client> {
        Client::try_default().await.context("building kube client")
    }

    /// Wait for the load balancer to allocate an ingress hostname/IP.
    /// The exposure resource is eventually consistent; the poll interval
    /// and deadline are deployment knobs, not part of the contract.
    async fn await_ingress(&self, client: Client, name: &str, sink: &dyn ProgressSink) -> Result<String> {
        let api: Api<Service> = Api::namespaced(client, &self.namespace);
        let deadline = std::time::Instant::now() + self.lb_timeout;
        loop {
            let svc = api.get(name).await.with_context(|| format!("reading service/{name}"))?;
            let ingress = svc
                .status
                .as_ref()
                .and_then(|s| s.load_balancer.as_ref())
                .and_then(|lb| lb.ingress.as_ref())
                .and_then(|v| v.first());
            if let Some(addr) = ingress {
                if let Some(host) = addr.hostname.clone().or_else(|| addr.ip.clone()) {
                    return Ok(host);
                }
            }
            if std::time::Instant::now() >= deadline {
                bail!(
                    "timed out after {:?} waiting for load balancer address on service/{name}",
                    self.lb_timeout
                );
            }
            sink.line(&format!("waiting for load balancer on service/{name}"));
            tokio::time::sleep(self.lb_poll).await;
        }
    }

    /// Names that are labeled as owned by the stack but no longer
    /// declared. Nameless items cannot be addressed for deletion.
    fn stale_names(live: impl IntoIterator<Item = Option<String>>, keep: &str) -> Vec<String> {
        live.into_iter().flatten().filter(|name| name != keep).collect()
    }

    /// Delete owned resources of one kind that are no longer declared.
    /// A failed delete fails the apply: a stale prior exposure left
    /// behind would keep serving (and billing) under the old address.
    async fn prune<K>(
        &self,
        api: &Api<K>,
        id: &StackIdentity,
        kind: &str,
        keep: &str,
        sink: &dyn ProgressSink,
    ) -> Result<()>
    where
        K: kube::Resource + Clone + serde::de::DeserializeOwned + std::fmt::Debug,
        K::DynamicType: Default,
    {
        let lp = ListParams::default().labels(&Self::selector(id));
        let live = api.list(&lp).await.with_context(|| format!("listing {kind}s for prune"))?;
        for name in Self::stale_names(live.items.into_iter().map(|i| i.meta().name.clone()), keep) {
            api.delete(&name, &DeleteParams::default())
                .await
                .with_context(|| format!("pruning stale {kind}/{name}"))?;
            sink.line(&format!("pruned {kind}/{name}"));
        }
        Ok(())
    }

    /// Live lookup used by the operator CLI: the public address of the
    /// stack's exposure, if one has been allocated.
    pub async fn lookup_url(&self, id: &StackIdentity) -> Result<Option<String>> {
        let client = Self::client().await?;
        let api: Api<Service> = Api::namespaced(client, &self.namespace);
        let lp = ListParams::default().labels(&Self::selector(id));
        let services = api.list(&lp).await.context("listing stack services")?;
        for svc in services.items {
            let host = svc
                .status
                .as_ref()
                .and_then(|s| s.load_balancer.as_ref())
                .and_then(|lb| lb.ingress.as_ref())
                .and_then(|v| v.first())
                .and_then(|a| a.hostname.clone().or_else(|| a.ip.clone()));
            if host.is_some() {
                return Ok(host);
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl InfraEngine for KubeEngine {
    async fn upsert(&self, id: &StackIdentity) -> Result<()> {
        // Create-if-absent, select otherwise. Existence is never an error.
        let mut stacks = self.stacks.lock().unwrap();
        stacks.entry(id.key()).or_default();
        Ok(())
    }

    async fn set_config(&self, id: &StackIdentity, config: BTreeMap<String, ConfigValue>) -> Result<()> {
        let record = self.record(id)?;
        record.lock().await.config = config;
        Ok(())
    }

    async fn ensure_plugin(&self, _id: &StackIdentity, provider: &str, version: &str) -> Result<()> {
        // The cluster itself is the provider here: verify it serves the
        // kinds the declarations need.
        let client = Self::client().await?;
        let discovery = Discovery::new(client).run().await.context("running api discovery")?;
        let mut has_deployment = false;
        let mut has_service = false;
        for group in discovery.groups() {
            for (ar, _caps) in group.recommended_resources() {
                match (ar.group.as_str(), ar.kind.as_str()) {
                    ("apps", "Deployment") => has_deployment = true,
                    ("", "Service") => has_service = true,
                    _ => {}
                }
            }
        }
        if !has_deployment || !has_service {
            bail!("cluster does not serve apps/v1 Deployment and v1 Service (provider {provider} {version})");
        }
        info!(provider, version, "provider plugin available");
        Ok(())
    }

    async fn refresh(&self, id: &StackIdentity, sink: &dyn ProgressSink) -> Result<()> {
        let record = self.record(id)?;
        let _guard = record.lock().await;

        // Pure live listing: the cluster is the state backend, so
        // refresh only reports what the stack label currently owns.
        let client = Self::client().await?;
        let lp = ListParams::default().labels(&Self::selector(id));
        let deployments: Api<Deployment> = Api::namespaced(client.clone(), &self.namespace);
        let services: Api<Service> = Api::namespaced(client, &self.namespace);

        for d in deployments.list(&lp).await.context("listing stack deployments")?.items {
            if let Some(name) = d.metadata.name {
                sink.line(&format!("refresh: deployment/{name}"));
            }
        }
        for s in services.list(&lp).await.context("listing stack services")?.items {
            if let Some(name) = s.metadata.name {
                sink.line(&format!("refresh: service/{name}"));
            }
        }
        Ok(())
    }

    async fn apply(
        &self,
        id: &StackIdentity,
        decl: &ResourceDeclaration,
        sink: &dyn ProgressSink,
    ) -> Result<ApplyResult> {
        let t0 = std::time::Instant::now();
        counter!("engine_apply_attempts", 1u64);

        let record = self.record(id)?;
        let _guard = record.lock().await;

        let client = Self::client().await?;
        let deployments: Api<Deployment> = Api::namespaced(client.clone(), &self.namespace);
        let services: Api<Service> = Api::namespaced(client.clone(), &self.namespace);
        let pp = PatchParams::apply(FIELD_MANAGER).force();

        deployments
            .patch(&decl.workload.name, &pp, &Patch::Apply(&decl.deployment_manifest()))
            .await
            .with_context(|| format!("applying deployment/{}", decl.workload.name))?;
        sink.line(&format!("applied deployment/{}", decl.workload.name));

        services
            .patch(&decl.exposure.name, &pp, &Patch::Apply(&decl.service_manifest()))
            .await
            .with_context(|| format!("applying service/{}", decl.exposure.name))?;
        sink.line(&format!("applied service/{}", decl.exposure.name));

        // Update-in-place at the stack level: older concrete names of
        // this logical function are no longer declared, so prune them.
        self.prune(&deployments, id, "deployment", &decl.workload.name, sink).await?;
        self.prune(&services, id, "service", &decl.exposure.name, sink).await?;

        let url = match decl.exposure.kind {
            ExposureKind::Public => self.await_ingress(client, &decl.exposure.name, sink).await?,
            ExposureKind::ClusterInternal => {
                format!("{}.{}.svc.cluster.local", decl.exposure.name, self.namespace)
            }
        };

        histogram!("engine_apply_ms", t0.elapsed().as_secs_f64() * 1000.0);
        counter!("engine_apply_ok", 1u64);
        Ok(ApplyResult::with_output(URL_OUTPUT, serde_json::Value::String(url)))
    }

    async fn destroy(&self, id: &StackIdentity, sink: &dyn ProgressSink) -> Result<()> {
        let record = self.record(id)?;
        let _guard = record.lock().await;

        let client = Self::client().await?;
        let lp = ListParams::default().labels(&Self::selector(id));
        let dp = DeleteParams::default();
        let deployments: Api<Deployment> = Api::namespaced(client.clone(), &self.namespace);
        let services: Api<Service> = Api::namespaced(client, &self.namespace);

        // delete_collection on an empty selector match is a no-op, which
        // makes destroy of a never-applied stack succeed trivially.
        deployments
            .delete_collection(&dp, &lp)
            .await
            .context("deleting stack deployments")?;
        sink.line(&format!("destroyed deployments of stack {id}"));
        services
            .delete_collection(&dp, &lp)
            .await
            .context("deleting stack services")?;
        sink.line(&format!("destroyed services of stack {id}"));

        // Destroyed is terminal for this identity: drop the record so a
        // later call re-enters a fresh select cycle.
        self.stacks.lock().unwrap().remove(&id.key());
        Ok(())
    }
}
