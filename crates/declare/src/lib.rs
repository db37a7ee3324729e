//! Declaration builder: turns (function name, image reference) into an
//! in-memory workload + exposure graph and renders it as Kubernetes
//! manifests. Pure construction, no I/O.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use plinth_core::ImageReference;

/// Label carrying stack ownership on every declared resource. Apply
/// prunes and destroy deletes by this selector.
pub const STACK_LABEL: &str = "plinth.dev/stack";

/// Port the function runtime listens on inside the container.
pub const FUNCTION_PORT: i32 = 80;

/// Desired running-instance resource for the function image.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkloadSpec {
    pub name: String,
    pub image: String,
    pub replicas: i32,
    pub container_port: i32,
    /// Pod labels; the workload selector and the exposure selector must
    /// both equal this set exactly.
    pub labels: BTreeMap<String, String>,
}

/// How the workload is reached.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ExposureKind {
    /// Public load balancer with an externally allocated hostname/IP.
    Public,
    /// Cluster-internal only, no public address.
    ClusterInternal,
}

/// Network-exposure resource routing traffic to the workload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExposureSpec {
    pub name: String,
    pub kind: ExposureKind,
    pub port: i32,
    pub target_port: i32,
    pub selector: BTreeMap<String, String>,
}

/// The declared resource graph for one provision call: a workload and
/// the exposure bound to it by label selector.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceDeclaration {
    /// Owning stack name; stamped on every rendered manifest.
    pub stack: String,
    pub workload: WorkloadSpec,
    pub exposure: ExposureSpec,
}

/// Build the declaration for one provision call.
///
/// The concrete deployment/service name is `{name}-{uuid}` so repeated
/// provisions of one logical function never collide. `local` selects
/// cluster-internal exposure for dev environments; it is a deployment
/// setting, never user input.
pub fn declare(name: &str, image: &ImageReference, local: bool) -> ResourceDeclaration {
    let concrete = format!("{}-{}", name, Uuid::new_v4());
    let mut labels = BTreeMap::new();
    labels.insert("app".to_string(), concrete.clone());

    let workload = WorkloadSpec {
        name: concrete.clone(),
        image: image.image.clone(),
        replicas: 1,
        container_port: FUNCTION_PORT,
        labels: labels.clone(),
    };
    let exposure = ExposureSpec {
        name: concrete,
        kind: if local { ExposureKind::ClusterInternal } else { ExposureKind::Public },
        port: FUNCTION_PORT,
        target_port: FUNCTION_PORT,
        selector: labels,
    };
    let decl = ResourceDeclaration { stack: name.to_string(), workload, exposure };
    debug_assert!(decl.selectors_aligned());
    decl
}

impl ResourceDeclaration {
    /// The invariant binding traffic to the right pods: workload labels,
    /// pod template labels and exposure selector are one and the same
    /// set. `declare` guarantees this by construction; a mismatch is a
    /// programming error, not runtime input.
    pub fn selectors_aligned(&self) -> bool {
        self.workload.labels == self.exposure.selector
    }

    /// Render to Kubernetes manifests, deployment first.
    pub fn manifests(&self) -> Vec<Value> {
        vec![self.deployment_manifest(), self.service_manifest()]
    }

    pub fn deployment_manifest(&self) -> Value {
        let w = &self.workload;
        json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {
                "name": w.name,
                "labels": self.owned_labels(&w.labels),
            },
            "spec": {
                "replicas": w.replicas,
                "selector": { "matchLabels": w.labels },
                "template": {
                    "metadata": { "labels": w.labels },
                    "spec": {
                        "containers": [{
                            "name": w.name,
                            "image": w.image,
                            "ports": [{ "containerPort": w.container_port }],
                        }],
                    },
                },
            },
        })
    }

    pub fn service_manifest(&self) -> Value {
        let e = &self.exposure;
        let service_type = match e.kind {
            ExposureKind::Public => "LoadBalancer",
            ExposureKind::ClusterInternal => "ClusterIP",
        };
        json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": {
                "name": e.name,
                "labels": self.owned_labels(&e.selector),
            },
            "spec": {
                "type": service_type,
                "selector": e.selector,
                "ports": [{
                    "port": e.port,
                    "targetPort": e.target_port,
                    "protocol": "TCP",
                }],
            },
        })
    }

    fn owned_labels(&self, base: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        let mut labels = base.clone();
        labels.insert(STACK_LABEL.to_string(), self.stack.clone());
        labels
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image() -> ImageReference {
        ImageReference { image: "registry.example.com/hello:latest".into(), server: "registry.example.com".into() }
    }

    #[test]
    fn selectors_are_identical_across_workload_and_exposure() {
        let d = declare("hello", &image(), false);
        assert!(d.selectors_aligned());
        assert_eq!(d.workload.labels.get("app"), Some(&d.workload.name));
        assert_eq!(d.exposure.selector, d.workload.labels);
    }

    #[test]
    fn repeated_declarations_get_distinct_concrete_names() {
        let a = declare("hello", &image(), false);
        let b = declare("hello", &image(), false);
        assert_ne!(a.workload.name, b.workload.name);
        assert_ne!(a.exposure.name, b.exposure.name);
        assert!(a.workload.name.starts_with("hello-"));
        // Both still belong to the same logical stack.
        assert_eq!(a.stack, b.stack);
    }

    #[test]
    fn local_flag_selects_cluster_internal_exposure() {
        let public = declare("fn", &image(), false);
        let internal = declare("fn", &image(), true);
        assert_eq!(public.exposure.kind, ExposureKind::Public);
        assert_eq!(internal.exposure.kind, ExposureKind::ClusterInternal);
        assert_eq!(public.service_manifest()["spec"]["type"], "LoadBalancer");
        assert_eq!(internal.service_manifest()["spec"]["type"], "ClusterIP");
    }

    #[test]
    fn replicas_fixed_at_one_and_port_80() {
        let d = declare("fn", &image(), false);
        assert_eq!(d.workload.replicas, 1);
        let m = d.deployment_manifest();
        assert_eq!(m["spec"]["replicas"], 1);
        assert_eq!(m["spec"]["template"]["spec"]["containers"][0]["ports"][0]["containerPort"], 80);
        assert_eq!(m["spec"]["template"]["spec"]["containers"][0]["image"], "registry.example.com/hello:latest");
    }

    #[test]
    fn manifests_carry_the_stack_ownership_label() {
        let d = declare("hello", &image(), false);
        for m in d.manifests() {
            assert_eq!(m["metadata"]["labels"][STACK_LABEL], "hello", "manifest {}", m["kind"]);
        }
        // The pod selector stays free of the ownership label.
        let dep = d.deployment_manifest();
        assert!(dep["spec"]["selector"]["matchLabels"].get(STACK_LABEL).is_none());
    }
}
