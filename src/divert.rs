//! Namespace divert
//!
//! A divert overlays a personal namespace on top of a shared one: workloads
//! deployed in the personal namespace resolve bare service names against the
//! shared namespace first, and Istio routes carry a header identifying the
//! personal namespace. The proxy applies these rewrites through a
//! [`DivertDriver`] while bodies pass through it.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{EnvVar, PodSpec};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Environment variable carrying the shared namespace.
pub const SHARED_ENVIRONMENT_ENV: &str = "OKTETO_SHARED_ENVIRONMENT";

/// Environment variable carrying the namespace traffic is diverted for.
pub const DIVERTED_ENVIRONMENT_ENV: &str = "OKTETO_DIVERTED_ENVIRONMENT";

/// Request header Istio routes set to select the diverted namespace.
pub const DIVERT_HEADER: &str = "x-okteto-divert";

/// Rewrites applied to resources when a divert is active.
pub trait DivertDriver: Send + Sync {
    /// Returns the pod spec to deploy in place of `pod`.
    fn update_pod(&self, pod: PodSpec) -> PodSpec;

    /// Rewrites an Istio VirtualService spec in place.
    fn update_virtual_service(&self, spec: &mut VirtualServiceSpec);

    /// Drivers that never rewrite anything let callers skip decoding.
    fn is_noop(&self) -> bool {
        false
    }
}

/// Driver used when no divert is configured.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopDivert;

impl DivertDriver for NoopDivert {
    fn update_pod(&self, pod: PodSpec) -> PodSpec {
        pod
    }

    fn update_virtual_service(&self, _spec: &mut VirtualServiceSpec) {}

    fn is_noop(&self) -> bool {
        true
    }
}

/// Divert through DNS search paths.
#[derive(Clone, Debug)]
pub struct DnsSearchDivert {
    /// Namespace whose services are resolved first
    pub shared: String,
    /// Namespace being deployed
    pub diverted: String,
}

impl DnsSearchDivert {
    /// Creates a driver diverting `diverted` onto `shared`.
    pub fn new(shared: impl Into<String>, diverted: impl Into<String>) -> Self {
        Self {
            shared: shared.into(),
            diverted: diverted.into(),
        }
    }
}

impl DivertDriver for DnsSearchDivert {
    fn update_pod(&self, pod: PodSpec) -> PodSpec {
        let pod = apply_divert_to_pod_spec(pod, &self.shared);
        set_divert_env(pod, &self.shared, &self.diverted)
    }

    fn update_virtual_service(&self, _spec: &mut VirtualServiceSpec) {}
}

/// Divert through Istio routing.
#[derive(Clone, Debug)]
pub struct IstioDivert {
    /// Namespace owning the routed services
    pub shared: String,
    /// Namespace being deployed
    pub diverted: String,
}

impl IstioDivert {
    /// Creates a driver diverting `diverted` onto `shared`.
    pub fn new(shared: impl Into<String>, diverted: impl Into<String>) -> Self {
        Self {
            shared: shared.into(),
            diverted: diverted.into(),
        }
    }
}

impl DivertDriver for IstioDivert {
    fn update_pod(&self, pod: PodSpec) -> PodSpec {
        set_divert_env(pod, &self.shared, &self.diverted)
    }

    fn update_virtual_service(&self, spec: &mut VirtualServiceSpec) {
        for route in &mut spec.http {
            route
                .headers
                .get_or_insert_with(Default::default)
                .request
                .get_or_insert_with(Default::default)
                .set
                .insert(DIVERT_HEADER.to_string(), self.diverted.clone());

            for destination in route.route.iter_mut().filter_map(|r| r.destination.as_mut()) {
                destination.host = qualify_host(&destination.host, &self.shared);
            }
        }
    }
}

/// Prepends `<namespace>.svc.cluster.local` to the pod DNS search list.
///
/// An empty `namespace` means no divert and returns the spec unchanged.
/// Existing search domains keep their order; a previous copy of the divert
/// domain is not duplicated.
pub fn apply_divert_to_pod_spec(mut pod: PodSpec, namespace: &str) -> PodSpec {
    if namespace.is_empty() {
        return pod;
    }

    let domain = format!("{namespace}.svc.cluster.local");
    let dns_config = pod.dns_config.get_or_insert_with(Default::default);
    let existing = dns_config.searches.take().unwrap_or_default();

    let mut searches = Vec::with_capacity(existing.len() + 1);
    searches.push(domain.clone());
    searches.extend(existing.into_iter().filter(|search| *search != domain));
    dns_config.searches = Some(searches);

    pod
}

fn set_divert_env(mut pod: PodSpec, shared: &str, diverted: &str) -> PodSpec {
    let init_containers = pod.init_containers.iter_mut().flatten();
    for container in init_containers.chain(pod.containers.iter_mut()) {
        let env = container.env.get_or_insert_with(Vec::new);
        upsert_env(env, SHARED_ENVIRONMENT_ENV, shared);
        upsert_env(env, DIVERTED_ENVIRONMENT_ENV, diverted);
    }
    pod
}

fn upsert_env(env: &mut Vec<EnvVar>, name: &str, value: &str) {
    match env.iter_mut().find(|var| var.name == name) {
        Some(var) => {
            var.value = Some(value.to_string());
            var.value_from = None;
        }
        None => env.push(EnvVar {
            name: name.to_string(),
            value: Some(value.to_string()),
            ..Default::default()
        }),
    }
}

fn qualify_host(host: &str, namespace: &str) -> String {
    if host.is_empty() || host.contains('.') || host == "*" {
        host.to_string()
    } else {
        format!("{host}.{namespace}.svc.cluster.local")
    }
}

/// Subset of an Istio `VirtualService` spec touched by diverts.
///
/// Every field not modelled here is kept verbatim in `extra`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct VirtualServiceSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hosts: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gateways: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub http: Vec<HttpRoute>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpRoute {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<Headers>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub route: Vec<HttpRouteDestination>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpRouteDestination {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<Destination>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Destination {
    #[serde(default)]
    pub host: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Headers {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<HeaderOperations>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HeaderOperations {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub set: BTreeMap<String, String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}
