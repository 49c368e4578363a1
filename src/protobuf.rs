//! Protobuf body translation
//!
//! Protobuf clients send objects as a `k8s\0` prefix followed by a
//! `runtime.Unknown` envelope whose `raw` field holds the encoded object. The
//! envelope is decoded in full. The object is not: it is kept as a list of
//! undecoded wire fields and only the fields that get stamped are opened up,
//! so fields this crate knows nothing about are written back byte for byte.

use k8s_openapi::api::core::v1::{Container, EnvVar, EnvVarSource, PodDNSConfig, PodSpec};
use prost::Message;
use prost::encoding::{WireType, decode_key, decode_varint, encode_key, encode_varint};
use tracing::debug;

use crate::divert::DivertDriver;
use crate::error::{Error, Result};
use crate::labels::{DEPLOYED_BY_LABEL, SAMPLE_ANNOTATION};
use crate::translate::ResourceKind;

/// Prefix of every protobuf encoded Kubernetes object.
pub const MAGIC: &[u8] = b"k8s\0";

// Field numbers, as in the `generated.proto` files of k8s.io/api.
const OBJECT_METADATA: u32 = 1;
const OBJECT_SPEC: u32 = 2;
const META_LABELS: u32 = 11;
const META_ANNOTATIONS: u32 = 12;
const TEMPLATE_METADATA: u32 = 1;
const TEMPLATE_SPEC: u32 = 2;
const POD_CONTAINERS: u32 = 2;
const POD_INIT_CONTAINERS: u32 = 20;
const POD_DNS_CONFIG: u32 = 26;
const DNS_SEARCHES: u32 = 2;
const CONTAINER_NAME: u32 = 1;
const CONTAINER_ENV: u32 = 7;
const ENV_NAME: u32 = 1;
const ENV_VALUE: u32 = 2;
const ENV_VALUE_FROM: u32 = 3;
const MAP_KEY: u32 = 1;
const MAP_VALUE: u32 = 2;

/// `k8s.io.apimachinery.pkg.runtime.Unknown`
#[derive(Clone, PartialEq, prost::Message)]
struct Unknown {
    #[prost(message, optional, tag = "1")]
    type_meta: Option<TypeMeta>,
    #[prost(bytes = "vec", optional, tag = "2")]
    raw: Option<Vec<u8>>,
    #[prost(string, optional, tag = "3")]
    content_encoding: Option<String>,
    #[prost(string, optional, tag = "4")]
    content_type: Option<String>,
}

/// `k8s.io.apimachinery.pkg.runtime.TypeMeta`
#[derive(Clone, PartialEq, prost::Message)]
struct TypeMeta {
    #[prost(string, optional, tag = "1")]
    api_version: Option<String>,
    #[prost(string, optional, tag = "2")]
    kind: Option<String>,
}

/// Field path from `spec` to the pod template.
fn pod_template_path(kind: ResourceKind) -> Option<&'static [u32]> {
    match kind {
        ResourceKind::Deployment
        | ResourceKind::StatefulSet
        | ResourceKind::ReplicaSet
        | ResourceKind::ReplicationController => Some(&[3]),
        ResourceKind::DaemonSet => Some(&[2]),
        ResourceKind::Job => Some(&[6]),
        // jobTemplate.spec.template
        ResourceKind::CronJob => Some(&[5, 2, 6]),
        // a custom resource, never served as protobuf
        ResourceKind::VirtualService => None,
    }
}

#[derive(Clone, Debug, PartialEq)]
struct Field {
    tag: u32,
    wire_type: WireType,
    /// Payload after the key, without the length prefix of length-delimited fields.
    value: Vec<u8>,
}

/// A message as the ordered list of its fields, none of them decoded.
#[derive(Clone, Debug, Default, PartialEq)]
struct RawMessage {
    fields: Vec<Field>,
}

impl RawMessage {
    fn decode(mut buf: &[u8]) -> Result<Self> {
        let mut fields = Vec::new();
        while !buf.is_empty() {
            let (tag, wire_type) = decode_key(&mut buf).map_err(malformed)?;
            let len = match wire_type {
                WireType::Varint => {
                    let mut rest = buf;
                    decode_varint(&mut rest).map_err(malformed)?;
                    buf.len() - rest.len()
                }
                WireType::SixtyFourBit => 8,
                WireType::ThirtyTwoBit => 4,
                WireType::LengthDelimited => {
                    let len = decode_varint(&mut buf).map_err(malformed)?;
                    usize::try_from(len)
                        .map_err(|_| Error::Translation("protobuf field too large".to_string()))?
                }
                WireType::StartGroup | WireType::EndGroup => {
                    return Err(Error::Translation(
                        "protobuf groups are not supported".to_string(),
                    ));
                }
            };
            if buf.len() < len {
                return Err(Error::Translation("truncated protobuf field".to_string()));
            }
            let (value, rest) = buf.split_at(len);
            fields.push(Field {
                tag,
                wire_type,
                value: value.to_vec(),
            });
            buf = rest;
        }
        Ok(Self { fields })
    }

    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        for field in &self.fields {
            encode_key(field.tag, field.wire_type, &mut buf);
            if field.wire_type == WireType::LengthDelimited {
                encode_varint(field.value.len() as u64, &mut buf);
            }
            buf.extend_from_slice(&field.value);
        }
        buf
    }

    fn has(&self, tag: u32) -> bool {
        self.fields.iter().any(|field| field.tag == tag)
    }

    fn remove(&mut self, tag: u32) {
        self.fields.retain(|field| field.tag != tag);
    }

    fn push_bytes(&mut self, tag: u32, value: impl Into<Vec<u8>>) {
        self.fields.push(Field {
            tag,
            wire_type: WireType::LengthDelimited,
            value: value.into(),
        });
    }

    /// Length-delimited payloads of `tag`, in wire order.
    fn bytes(&self, tag: u32) -> impl Iterator<Item = &[u8]> {
        self.fields
            .iter()
            .filter(move |field| field.tag == tag && field.wire_type == WireType::LengthDelimited)
            .map(|field| field.value.as_slice())
    }

    /// Last value of a string field, the one a decoder keeps.
    fn string(&self, tag: u32) -> Option<String> {
        self.bytes(tag)
            .last()
            .map(|value| String::from_utf8_lossy(value).into_owned())
    }

    fn strings(&self, tag: u32) -> Vec<String> {
        self.bytes(tag)
            .map(|value| String::from_utf8_lossy(value).into_owned())
            .collect()
    }

    fn messages(&self, tag: u32) -> Result<Vec<RawMessage>> {
        self.bytes(tag).map(RawMessage::decode).collect()
    }

    /// Opens the embedded message `tag` (adding an empty one when missing),
    /// hands it to `f` and writes it back. Nothing changes if `f` fails.
    fn update_message(
        &mut self,
        tag: u32,
        f: impl FnOnce(&mut RawMessage) -> Result<()>,
    ) -> Result<()> {
        let index = self.fields.iter().rposition(|field| field.tag == tag);
        let mut message = match index {
            Some(index) if self.fields[index].wire_type != WireType::LengthDelimited => {
                return Err(Error::Translation(format!(
                    "protobuf field {tag} is not a message"
                )));
            }
            Some(index) => RawMessage::decode(&self.fields[index].value)?,
            None => RawMessage::default(),
        };

        f(&mut message)?;

        let value = message.encode();
        match index {
            Some(index) => self.fields[index].value = value,
            None => self.push_bytes(tag, value),
        }
        Ok(())
    }

    /// Applies `f` to the message at `path`, if every step of it is present.
    fn update_path(
        &mut self,
        path: &[u32],
        f: &mut dyn FnMut(&mut RawMessage) -> Result<()>,
    ) -> Result<()> {
        match path.split_first() {
            None => f(self),
            Some((&tag, rest)) if self.has(tag) => {
                self.update_message(tag, |inner| inner.update_path(rest, f))
            }
            Some(_) => Ok(()),
        }
    }

    /// Sets `key` in the map field `tag`, replacing the entry in place when
    /// it already exists.
    fn set_map_entry(&mut self, tag: u32, key: &str, value: &str) -> Result<()> {
        let mut entry = RawMessage::default();
        entry.push_bytes(MAP_KEY, key);
        entry.push_bytes(MAP_VALUE, value);
        let entry = entry.encode();

        let mut matches = Vec::new();
        for (index, field) in self.fields.iter().enumerate() {
            if field.tag == tag
                && RawMessage::decode(&field.value)?.string(MAP_KEY).as_deref() == Some(key)
            {
                matches.push(index);
            }
        }

        match matches.split_first() {
            Some((&first, duplicates)) => {
                self.fields[first].value = entry;
                for &index in duplicates.iter().rev() {
                    self.fields.remove(index);
                }
            }
            None => self.push_bytes(tag, entry),
        }
        Ok(())
    }
}

fn malformed(e: prost::DecodeError) -> Error {
    Error::Translation(format!("malformed protobuf: {e}"))
}

/// Stamps a protobuf encoded object and re-encodes it.
///
/// Workload kinds also get their pod template labelled and, unless `divert`
/// is a no-op, diverted. A broken pod template is skipped, the object
/// metadata is still stamped.
pub(crate) fn translate(
    body: &[u8],
    name: &str,
    sample_repository: bool,
    divert: &dyn DivertDriver,
) -> Result<Vec<u8>> {
    let envelope = body
        .strip_prefix(MAGIC)
        .ok_or_else(|| Error::Translation("missing protobuf magic prefix".to_string()))?;
    let mut unknown = Unknown::decode(envelope).map_err(malformed)?;
    if unknown
        .content_encoding
        .as_deref()
        .is_some_and(|encoding| !encoding.is_empty())
    {
        return Err(Error::Translation(
            "content-encoded protobuf objects are not supported".to_string(),
        ));
    }
    let raw = unknown
        .raw
        .as_deref()
        .ok_or_else(|| Error::Translation("protobuf object has no data".to_string()))?;
    let mut object = RawMessage::decode(raw)?;

    object.update_message(OBJECT_METADATA, |metadata| {
        metadata.set_map_entry(META_LABELS, DEPLOYED_BY_LABEL, name)?;
        if sample_repository {
            metadata.set_map_entry(META_ANNOTATIONS, SAMPLE_ANNOTATION, "true")?;
        }
        Ok(())
    })?;

    let kind = unknown
        .type_meta
        .as_ref()
        .and_then(|type_meta| type_meta.kind.as_deref())
        .and_then(ResourceKind::from_kind);
    if let Some(template) = kind.and_then(pod_template_path) {
        let path: Vec<u32> = std::iter::once(OBJECT_SPEC)
            .chain(template.iter().copied())
            .collect();
        let mut stamp = |template: &mut RawMessage| translate_pod_template(template, name, divert);
        if let Err(e) = object.update_path(&path, &mut stamp) {
            debug!(?kind, error = %e, "skipping pod template");
        }
    }

    unknown.raw = Some(object.encode());
    let mut out = MAGIC.to_vec();
    out.extend(unknown.encode_to_vec());
    Ok(out)
}

fn translate_pod_template(
    template: &mut RawMessage,
    name: &str,
    divert: &dyn DivertDriver,
) -> Result<()> {
    template.update_message(TEMPLATE_METADATA, |metadata| {
        metadata.set_map_entry(META_LABELS, DEPLOYED_BY_LABEL, name)
    })?;
    if !divert.is_noop() && template.has(TEMPLATE_SPEC) {
        template.update_message(TEMPLATE_SPEC, |pod| divert_pod(pod, divert))?;
    }
    Ok(())
}

/// Runs `divert` over the parts of a pod spec a driver may change: DNS
/// searches and container environments. Environment variables the driver
/// leaves alone keep their original encoding, `valueFrom` included.
fn divert_pod(pod: &mut RawMessage, divert: &dyn DivertDriver) -> Result<()> {
    let containers = pod
        .messages(POD_CONTAINERS)?
        .iter()
        .map(project_container)
        .collect::<Result<Vec<_>>>()?;
    let init_containers = pod
        .messages(POD_INIT_CONTAINERS)?
        .iter()
        .map(project_container)
        .collect::<Result<Vec<_>>>()?;
    let searches = match pod.bytes(POD_DNS_CONFIG).last() {
        Some(dns) => RawMessage::decode(dns)?.strings(DNS_SEARCHES),
        None => Vec::new(),
    };

    let projected = PodSpec {
        containers,
        init_containers: (!init_containers.is_empty()).then_some(init_containers),
        dns_config: (!searches.is_empty()).then(|| PodDNSConfig {
            searches: Some(searches.clone()),
            ..Default::default()
        }),
        ..Default::default()
    };
    let updated = divert.update_pod(projected);

    write_env(pod, POD_CONTAINERS, &updated.containers)?;
    write_env(
        pod,
        POD_INIT_CONTAINERS,
        updated.init_containers.as_deref().unwrap_or_default(),
    )?;

    let updated_searches = updated
        .dns_config
        .and_then(|dns| dns.searches)
        .unwrap_or_default();
    if updated_searches != searches {
        pod.update_message(POD_DNS_CONFIG, |dns| {
            dns.remove(DNS_SEARCHES);
            for search in &updated_searches {
                dns.push_bytes(DNS_SEARCHES, search.as_str());
            }
            Ok(())
        })?;
    }
    Ok(())
}

fn project_container(container: &RawMessage) -> Result<Container> {
    let env = container
        .messages(CONTAINER_ENV)?
        .iter()
        .map(project_env)
        .collect::<Vec<_>>();
    Ok(Container {
        name: container.string(CONTAINER_NAME).unwrap_or_default(),
        env: (!env.is_empty()).then_some(env),
        ..Default::default()
    })
}

fn project_env(var: &RawMessage) -> EnvVar {
    EnvVar {
        name: var.string(ENV_NAME).unwrap_or_default(),
        value: var.string(ENV_VALUE),
        value_from: var.has(ENV_VALUE_FROM).then(EnvVarSource::default),
    }
}

fn encode_env(var: &EnvVar) -> Vec<u8> {
    let mut message = RawMessage::default();
    message.push_bytes(ENV_NAME, var.name.as_str());
    if let Some(value) = &var.value {
        message.push_bytes(ENV_VALUE, value.as_str());
    }
    message.encode()
}

/// Writes the environments of `updated` back into the containers of field
/// `tag`, matched by position.
fn write_env(pod: &mut RawMessage, tag: u32, updated: &[Container]) -> Result<()> {
    let fields = pod.fields.iter_mut().filter(|field| field.tag == tag);
    for (field, container) in fields.zip(updated) {
        let mut raw = RawMessage::decode(&field.value)?;
        let current = raw
            .bytes(CONTAINER_ENV)
            .map(|value| Ok((project_env(&RawMessage::decode(value)?), value.to_vec())))
            .collect::<Result<Vec<_>>>()?;
        let env = container.env.as_deref().unwrap_or_default();
        if current.iter().map(|(var, _)| var).eq(env.iter()) {
            continue;
        }

        let encoded: Vec<Vec<u8>> = env
            .iter()
            .map(|var| {
                current
                    .iter()
                    .find(|(existing, _)| existing == var)
                    .map(|(_, value)| value.clone())
                    .unwrap_or_else(|| encode_env(var))
            })
            .collect();
        raw.remove(CONTAINER_ENV);
        for value in encoded {
            raw.push_bytes(CONTAINER_ENV, value);
        }
        field.value = raw.encode();
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod fixtures {
    //! Hand-built protobuf objects for tests.

    use std::collections::BTreeMap;

    use super::*;

    pub(crate) fn message(fields: Vec<(u32, Vec<u8>)>) -> Vec<u8> {
        let mut message = RawMessage::default();
        for (tag, value) in fields {
            message.push_bytes(tag, value);
        }
        message.encode()
    }

    pub(crate) fn text(value: &str) -> Vec<u8> {
        value.as_bytes().to_vec()
    }

    pub(crate) fn map_entry(key: &str, value: &str) -> Vec<u8> {
        message(vec![(MAP_KEY, text(key)), (MAP_VALUE, text(value))])
    }

    /// Wraps an encoded object in the magic prefix and `Unknown` envelope.
    pub(crate) fn wrap(api_version: &str, kind: &str, raw: Vec<u8>) -> Vec<u8> {
        let unknown = Unknown {
            type_meta: Some(TypeMeta {
                api_version: Some(api_version.to_string()),
                kind: Some(kind.to_string()),
            }),
            raw: Some(raw),
            content_encoding: Some(String::new()),
            content_type: Some(String::new()),
        };
        let mut out = MAGIC.to_vec();
        out.extend(unknown.encode_to_vec());
        out
    }

    /// An `apps/v1` Deployment named `web` with one container.
    pub(crate) fn deployment() -> Vec<u8> {
        let container = message(vec![(1, text("web")), (2, text("nginx"))]);
        let template = message(vec![
            (TEMPLATE_METADATA, message(vec![])),
            (TEMPLATE_SPEC, message(vec![(POD_CONTAINERS, container)])),
        ]);
        let spec = message(vec![(3, template)]);
        let metadata = message(vec![(1, text("web")), (META_LABELS, map_entry("app", "web"))]);
        wrap(
            "apps/v1",
            "Deployment",
            message(vec![(OBJECT_METADATA, metadata), (OBJECT_SPEC, spec)]),
        )
    }

    /// Unwraps a protobuf body into its `Unknown` envelope and object.
    fn open(body: &[u8]) -> (Unknown, RawMessage) {
        let unknown = Unknown::decode(body.strip_prefix(MAGIC).unwrap()).unwrap();
        let object = RawMessage::decode(unknown.raw.as_deref().unwrap()).unwrap();
        (unknown, object)
    }

    fn map(message: &RawMessage, tag: u32) -> BTreeMap<String, String> {
        message
            .messages(tag)
            .unwrap()
            .into_iter()
            .map(|entry| {
                (
                    entry.string(MAP_KEY).unwrap_or_default(),
                    entry.string(MAP_VALUE).unwrap_or_default(),
                )
            })
            .collect()
    }

    /// Follows length-delimited fields from the object root.
    pub(crate) fn at(body: &[u8], path: &[u32]) -> RawMessage {
        let (_, mut message) = open(body);
        for &tag in path {
            message = message.messages(tag).unwrap().pop().unwrap();
        }
        message
    }

    /// Labels of the metadata message at `path`.
    pub(crate) fn labels(body: &[u8], path: &[u32]) -> BTreeMap<String, String> {
        map(&at(body, path), META_LABELS)
    }

    pub(crate) fn annotations(body: &[u8], path: &[u32]) -> BTreeMap<String, String> {
        map(&at(body, path), META_ANNOTATIONS)
    }

    pub(crate) fn kind(body: &[u8]) -> Option<String> {
        open(body).0.type_meta.and_then(|type_meta| type_meta.kind)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::fixtures::*;
    use super::*;
    use crate::divert::{
        DIVERTED_ENVIRONMENT_ENV, DnsSearchDivert, IstioDivert, NoopDivert, SHARED_ENVIRONMENT_ENV,
    };

    fn stamp(body: &[u8]) -> Vec<u8> {
        translate(body, "myapp", false, &NoopDivert).unwrap()
    }

    #[test]
    fn deployment_is_stamped() {
        let out = stamp(&deployment());

        assert!(out.starts_with(MAGIC));
        assert_eq!(kind(&out).as_deref(), Some("Deployment"));

        let object_labels = labels(&out, &[OBJECT_METADATA]);
        assert_eq!(object_labels[DEPLOYED_BY_LABEL], "myapp");
        assert_eq!(object_labels["app"], "web");
        assert_eq!(at(&out, &[OBJECT_METADATA]).string(1).as_deref(), Some("web"));

        let template = [OBJECT_SPEC, 3, TEMPLATE_METADATA];
        assert_eq!(labels(&out, &template)[DEPLOYED_BY_LABEL], "myapp");
        let container = at(&out, &[OBJECT_SPEC, 3, TEMPLATE_SPEC, POD_CONTAINERS]);
        assert_eq!(container.string(2).as_deref(), Some("nginx"));
        assert!(annotations(&out, &[OBJECT_METADATA]).is_empty());
    }

    #[test]
    fn unknown_fields_survive() {
        let mut spec = RawMessage::default();
        spec.fields.push(Field {
            tag: 1,
            wire_type: WireType::Varint,
            value: vec![0x03],
        });
        spec.push_bytes(42, "from a newer api");
        let status = message(vec![(7, text("opaque"))]);
        let body = wrap(
            "apps/v1",
            "StatefulSet",
            message(vec![
                (OBJECT_METADATA, message(vec![(99, text("x"))])),
                (OBJECT_SPEC, spec.encode()),
                (3, status.clone()),
            ]),
        );

        let out = stamp(&body);

        assert_eq!(at(&out, &[OBJECT_SPEC]), spec);
        assert_eq!(at(&out, &[3]).encode(), status);
        assert_eq!(at(&out, &[OBJECT_METADATA]).string(99).as_deref(), Some("x"));
        assert_eq!(labels(&out, &[OBJECT_METADATA])[DEPLOYED_BY_LABEL], "myapp");
    }

    #[test]
    fn cronjob_template_is_labelled() {
        let template = message(vec![(TEMPLATE_SPEC, message(vec![]))]);
        let job_spec = message(vec![(6, template)]);
        let job_template = message(vec![(2, job_spec)]);
        let spec = message(vec![(1, text("* * * * *")), (5, job_template)]);
        let body = wrap(
            "batch/v1",
            "CronJob",
            message(vec![(OBJECT_METADATA, message(vec![])), (OBJECT_SPEC, spec)]),
        );

        let out = stamp(&body);

        let template = [OBJECT_SPEC, 5, 2, 6, TEMPLATE_METADATA];
        assert_eq!(labels(&out, &template)[DEPLOYED_BY_LABEL], "myapp");
        assert_eq!(at(&out, &[OBJECT_SPEC]).string(1).as_deref(), Some("* * * * *"));
    }

    #[test]
    fn other_kinds_get_metadata_label_only() {
        let spec = message(vec![(3, message(vec![]))]);
        let body = wrap(
            "v1",
            "Service",
            message(vec![(OBJECT_METADATA, message(vec![])), (OBJECT_SPEC, spec.clone())]),
        );

        let out = stamp(&body);

        assert_eq!(labels(&out, &[OBJECT_METADATA])[DEPLOYED_BY_LABEL], "myapp");
        assert_eq!(at(&out, &[OBJECT_SPEC]).encode(), spec);
    }

    #[test]
    fn existing_label_is_replaced_in_place() {
        let metadata = message(vec![
            (META_LABELS, map_entry(DEPLOYED_BY_LABEL, "someone-else")),
            (META_LABELS, map_entry("app", "web")),
        ]);
        let body = wrap("v1", "ConfigMap", message(vec![(OBJECT_METADATA, metadata)]));

        let out = stamp(&body);

        let entries = at(&out, &[OBJECT_METADATA]).messages(META_LABELS).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].string(MAP_VALUE).as_deref(), Some("myapp"));
    }

    #[test]
    fn translation_is_idempotent() {
        let divert = DnsSearchDivert::new("staging", "cindy");
        let once = translate(&deployment(), "myapp", true, &divert).unwrap();
        let twice = translate(&once, "myapp", true, &divert).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn sample_annotation() {
        let out = translate(&deployment(), "myapp", true, &NoopDivert).unwrap();
        assert_eq!(annotations(&out, &[OBJECT_METADATA])[SAMPLE_ANNOTATION], "true");
    }

    #[test]
    fn divert_rewrites_dns_and_env() {
        let value_from = message(vec![(1, message(vec![(1, text("metadata.name"))]))]);
        let pod_name = message(vec![(ENV_NAME, text("POD")), (ENV_VALUE_FROM, value_from)]);
        let container = message(vec![
            (CONTAINER_NAME, text("api")),
            (2, text("api:1")),
            (CONTAINER_ENV, pod_name.clone()),
        ]);
        let dns = message(vec![(1, text("10.0.0.10")), (DNS_SEARCHES, text("example.com"))]);
        let pod = message(vec![(POD_CONTAINERS, container), (POD_DNS_CONFIG, dns)]);
        let template = message(vec![(TEMPLATE_SPEC, pod)]);
        let body = wrap(
            "apps/v1",
            "DaemonSet",
            message(vec![
                (OBJECT_METADATA, message(vec![])),
                (OBJECT_SPEC, message(vec![(2, template)])),
            ]),
        );

        let divert = DnsSearchDivert::new("staging", "cindy");
        let out = translate(&body, "myapp", false, &divert).unwrap();

        let dns = at(&out, &[OBJECT_SPEC, 2, TEMPLATE_SPEC, POD_DNS_CONFIG]);
        assert_eq!(
            dns.strings(DNS_SEARCHES),
            ["staging.svc.cluster.local", "example.com"]
        );
        assert_eq!(dns.string(1).as_deref(), Some("10.0.0.10"));

        let container = at(&out, &[OBJECT_SPEC, 2, TEMPLATE_SPEC, POD_CONTAINERS]);
        assert_eq!(container.string(2).as_deref(), Some("api:1"));
        let env: Vec<_> = container.bytes(CONTAINER_ENV).map(<[u8]>::to_vec).collect();
        assert_eq!(env[0], pod_name);
        let vars: Vec<_> = env
            .iter()
            .map(|var| project_env(&RawMessage::decode(var).unwrap()))
            .collect();
        assert_eq!(vars[1].name, SHARED_ENVIRONMENT_ENV);
        assert_eq!(vars[1].value.as_deref(), Some("staging"));
        assert_eq!(vars[2].name, DIVERTED_ENVIRONMENT_ENV);
        assert_eq!(vars[2].value.as_deref(), Some("cindy"));
    }

    #[test]
    fn istio_divert_leaves_dns_alone() {
        let pod = message(vec![(POD_CONTAINERS, message(vec![(CONTAINER_NAME, text("c"))]))]);
        let template = message(vec![(TEMPLATE_SPEC, pod)]);
        let body = wrap(
            "batch/v1",
            "Job",
            message(vec![
                (OBJECT_METADATA, message(vec![])),
                (OBJECT_SPEC, message(vec![(6, template)])),
            ]),
        );

        let divert = IstioDivert::new("staging", "cindy");
        let out = translate(&body, "myapp", false, &divert).unwrap();

        let pod = at(&out, &[OBJECT_SPEC, 6, TEMPLATE_SPEC]);
        assert!(!pod.has(POD_DNS_CONFIG));
        let container = pod.messages(POD_CONTAINERS).unwrap().remove(0);
        assert_eq!(container.messages(CONTAINER_ENV).unwrap().len(), 2);
    }

    #[test]
    fn broken_template_still_labels_object() {
        // the template field holds a varint instead of a message
        let mut spec = RawMessage::default();
        spec.fields.push(Field {
            tag: 3,
            wire_type: WireType::Varint,
            value: vec![0x01],
        });
        let body = wrap(
            "apps/v1",
            "ReplicaSet",
            message(vec![(OBJECT_METADATA, message(vec![])), (OBJECT_SPEC, spec.encode())]),
        );

        let out = stamp(&body);

        assert_eq!(labels(&out, &[OBJECT_METADATA])[DEPLOYED_BY_LABEL], "myapp");
        assert_eq!(at(&out, &[OBJECT_SPEC]), spec);
    }

    #[test]
    fn malformed_bodies_fail() {
        let mut truncated = deployment();
        truncated.truncate(truncated.len() - 3);
        let encoded = {
            let unknown = Unknown {
                raw: Some(message(vec![(OBJECT_METADATA, message(vec![]))])),
                content_encoding: Some("gzip".to_string()),
                ..Default::default()
            };
            [MAGIC, unknown.encode_to_vec().as_slice()].concat()
        };

        for body in [
            b"{\"kind\":\"Pod\"}".to_vec(),
            b"k8s\0\xff\xff\xff".to_vec(),
            truncated,
            encoded,
            MAGIC.to_vec(),
        ] {
            let err = translate(&body, "myapp", false, &NoopDivert).unwrap_err();
            assert!(matches!(err, Error::Translation(_)), "{body:?}");
        }
    }
}
