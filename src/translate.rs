//! Body translation
//!
//! Resources flowing through the proxy are rewritten as loosely typed JSON
//! (protobuf bodies are handled by [`crate::protobuf`]):
//! only `metadata` and the pod template of known workload kinds are decoded
//! into structured types, everything else is carried over untouched. Any
//! failure leaves the body as it was, a deploy must never break because a
//! label could not be added.

use std::sync::Arc;

use axum::body::Bytes;
use k8s_openapi::api::core::v1::PodSpec;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::divert::{DivertDriver, NoopDivert, VirtualServiceSpec};
use crate::error::{Error, Result};
use crate::labels::{DEPLOYED_BY_LABEL, SAMPLE_ANNOTATION, set_annotation, set_in_metadata};
use crate::protobuf;

/// Resource kinds whose specs are rewritten beyond the top-level metadata.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceKind {
    Deployment,
    StatefulSet,
    Job,
    CronJob,
    DaemonSet,
    ReplicationController,
    ReplicaSet,
    VirtualService,
}

impl ResourceKind {
    /// Maps the `kind` of a resource; unknown kinds are `None`.
    pub fn from_kind(kind: &str) -> Option<Self> {
        let kind = match kind {
            "Deployment" => ResourceKind::Deployment,
            "StatefulSet" => ResourceKind::StatefulSet,
            "Job" => ResourceKind::Job,
            "CronJob" => ResourceKind::CronJob,
            "DaemonSet" => ResourceKind::DaemonSet,
            "ReplicationController" => ResourceKind::ReplicationController,
            "ReplicaSet" => ResourceKind::ReplicaSet,
            "VirtualService" => ResourceKind::VirtualService,
            _ => return None,
        };
        Some(kind)
    }

    /// JSON pointer to the pod template, relative to `spec`.
    pub fn pod_template_pointer(self) -> Option<&'static str> {
        match self {
            ResourceKind::Deployment
            | ResourceKind::StatefulSet
            | ResourceKind::Job
            | ResourceKind::DaemonSet
            | ResourceKind::ReplicationController
            | ResourceKind::ReplicaSet => Some("/template"),
            ResourceKind::CronJob => Some("/jobTemplate/spec/template"),
            ResourceKind::VirtualService => None,
        }
    }
}

/// Pod template with only the parts we rewrite decoded.
#[derive(Debug, Default, Serialize, Deserialize)]
struct PodTemplate {
    #[serde(default)]
    metadata: Option<ObjectMeta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    spec: Option<Value>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

/// Stamps ownership labels and applies divert rewrites to resource bodies.
#[derive(Clone)]
pub struct Translator {
    name: String,
    divert: Arc<dyn DivertDriver>,
    sample_repository: bool,
}

impl Translator {
    /// Creates a translator labelling resources as deployed by `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            divert: Arc::new(NoopDivert),
            sample_repository: false,
        }
    }

    /// Replaces the owner name stamped on resources.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Replaces the divert driver.
    pub fn with_divert(mut self, divert: Arc<dyn DivertDriver>) -> Self {
        self.divert = divert;
        self
    }

    /// Marks resources as coming from a sample repository.
    pub fn with_sample_repository(mut self, sample_repository: bool) -> Self {
        self.sample_repository = sample_repository;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Rewrites a JSON (or YAML) resource body, returning JSON.
    ///
    /// # Errors
    /// Returns [`Error::Translation`] when the body is not an object or has no
    /// `metadata`. Failures inside a kind-specific spec are logged and skipped.
    pub fn translate(&self, body: &[u8]) -> Result<Vec<u8>> {
        let mut object = parse_object(body)?;

        let metadata = object
            .get("metadata")
            .ok_or_else(|| Error::Translation("resource has no metadata".to_string()))?;
        // `null` decodes to empty metadata
        let mut metadata: ObjectMeta =
            serde_json::from_value::<Option<ObjectMeta>>(metadata.clone())?.unwrap_or_default();
        set_in_metadata(&mut metadata, DEPLOYED_BY_LABEL, &self.name);
        if self.sample_repository {
            set_annotation(&mut metadata, SAMPLE_ANNOTATION, "true");
        }
        object.insert("metadata".to_string(), serde_json::to_value(&metadata)?);

        let kind = object
            .get("kind")
            .and_then(Value::as_str)
            .and_then(ResourceKind::from_kind);

        match kind {
            Some(ResourceKind::VirtualService) => self.translate_virtual_service(&mut object),
            Some(kind) => self.translate_workload(kind, &mut object),
            None => {}
        }

        Ok(serde_json::to_vec(&object)?)
    }

    /// Like [`Translator::translate`], but hands back the original body on failure.
    pub fn translate_or_passthrough(&self, body: Bytes) -> Bytes {
        match self.translate(&body) {
            Ok(translated) => Bytes::from(translated),
            Err(e) => {
                debug!(error = %e, "forwarding body untouched");
                body
            }
        }
    }

    /// Rewrites a protobuf resource body (`k8s\0` prefix and `runtime.Unknown`
    /// envelope), returning protobuf.
    ///
    /// # Errors
    /// Returns [`Error::Translation`] when the body is not a well-formed
    /// protobuf object.
    pub fn translate_protobuf(&self, body: &[u8]) -> Result<Vec<u8>> {
        protobuf::translate(body, &self.name, self.sample_repository, self.divert.as_ref())
    }

    /// Like [`Translator::translate_protobuf`], but hands back the original body on failure.
    pub fn translate_protobuf_or_passthrough(&self, body: Bytes) -> Bytes {
        match self.translate_protobuf(&body) {
            Ok(translated) => Bytes::from(translated),
            Err(e) => {
                debug!(error = %e, "forwarding protobuf body untouched");
                body
            }
        }
    }

    fn translate_workload(&self, kind: ResourceKind, object: &mut Map<String, Value>) {
        let Some(pointer) = kind.pod_template_pointer() else {
            return;
        };
        let Some(template) = object
            .get_mut("spec")
            .and_then(|spec| spec.pointer_mut(pointer))
        else {
            return;
        };

        match self.translate_pod_template(template) {
            Ok(translated) => *template = translated,
            Err(e) => debug!(?kind, error = %e, "skipping pod template"),
        }
    }

    fn translate_pod_template(&self, template: &Value) -> Result<Value> {
        let mut template: PodTemplate = serde_json::from_value(template.clone())?;
        let metadata = template.metadata.get_or_insert_with(ObjectMeta::default);
        set_in_metadata(metadata, DEPLOYED_BY_LABEL, &self.name);

        if !self.divert.is_noop() {
            if let Some(spec) = template.spec.take() {
                let pod: PodSpec = serde_json::from_value(spec)?;
                template.spec = Some(serde_json::to_value(self.divert.update_pod(pod))?);
            }
        }

        Ok(serde_json::to_value(template)?)
    }

    fn translate_virtual_service(&self, object: &mut Map<String, Value>) {
        if self.divert.is_noop() {
            return;
        }
        let Some(spec) = object.get_mut("spec") else {
            return;
        };

        let translated = serde_json::from_value::<VirtualServiceSpec>(spec.clone())
            .and_then(|mut vs| {
                self.divert.update_virtual_service(&mut vs);
                serde_json::to_value(vs)
            });
        match translated {
            Ok(translated) => *spec = translated,
            Err(e) => debug!(error = %e, "skipping virtual service"),
        }
    }
}

impl std::fmt::Debug for Translator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Translator")
            .field("name", &self.name)
            .field("divert", &!self.divert.is_noop())
            .field("sample_repository", &self.sample_repository)
            .finish()
    }
}

fn parse_object(body: &[u8]) -> Result<Map<String, Value>> {
    match serde_json::from_slice::<Map<String, Value>>(body) {
        Ok(object) => Ok(object),
        // server-side apply bodies may be YAML
        Err(json_error) => serde_yaml::from_slice::<Map<String, Value>>(body)
            .map_err(|_| Error::Translation(json_error.to_string())),
    }
}
