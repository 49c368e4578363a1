#![cfg_attr(not(doctest), doc = include_str!("../README.md"))]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub use k8s_openapi;
pub use kube;

pub mod divert;
pub mod error;
pub mod handler;
pub mod kubeconfig;
pub mod labels;
pub mod port;
pub mod protobuf;
pub mod server;
pub mod translate;
pub mod transport;

pub use divert::{
    DivertDriver, DnsSearchDivert, IstioDivert, NoopDivert, apply_divert_to_pod_spec,
};
pub use error::{Error, Result};
pub use kubeconfig::{
    KubeconfigHandler, KubeconfigRewriter, determine_context, determine_namespace,
    temp_kubeconfig_path,
};
pub use port::{allocate_port, generate_token};
pub use server::{Phase, Proxy, ProxyConfig};
pub use translate::{ResourceKind, Translator};
pub use transport::{ClusterConfig, KubeTransportFactory, RoundTrip, TransportFactory};
