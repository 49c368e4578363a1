//! Kubeconfig handling
//!
//! Reads the user's kubeconfig to find the real cluster and writes the
//! temporary kubeconfig handed to deploy commands, which points them at the
//! local proxy instead.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use kube::config::{KubeConfigOptions, Kubeconfig};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::labels::sanitize_name;
use crate::server::CERTIFICATE_PEM;
use crate::transport::ClusterConfig;

/// Access to the user's cluster configuration.
#[async_trait]
pub trait KubeconfigHandler: Send + Sync {
    /// Resolves the configuration of the real cluster.
    async fn read(&self) -> Result<ClusterConfig>;

    /// Writes a kubeconfig at `destination` pointing at the proxy on `port`.
    fn modify(&self, port: u16, token: &str, destination: &Path) -> Result<()>;
}

/// [`KubeconfigHandler`] backed by a kubeconfig file.
#[derive(Clone, Debug, Default)]
pub struct KubeconfigRewriter {
    context: Option<String>,
    kubeconfig: Option<Kubeconfig>,
    insecure_skip_tls_verify: bool,
}

impl KubeconfigRewriter {
    /// Uses the default kubeconfig (`KUBECONFIG` or `~/.kube/config`).
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses an already loaded kubeconfig.
    pub fn from_kubeconfig(kubeconfig: Kubeconfig) -> Self {
        Self {
            kubeconfig: Some(kubeconfig),
            ..Self::default()
        }
    }

    /// Selects a context other than the current one.
    pub fn with_context(mut self, context: Option<String>) -> Self {
        self.context = context;
        self
    }

    /// Skips certificate verification in the written kubeconfig instead of
    /// trusting the proxy certificate.
    pub fn with_insecure_skip_tls_verify(mut self, insecure: bool) -> Self {
        self.insecure_skip_tls_verify = insecure;
        self
    }

    fn load(&self) -> Result<Kubeconfig> {
        match &self.kubeconfig {
            Some(kubeconfig) => Ok(kubeconfig.clone()),
            None => Ok(Kubeconfig::read()?),
        }
    }
}

#[async_trait]
impl KubeconfigHandler for KubeconfigRewriter {
    async fn read(&self) -> Result<ClusterConfig> {
        let kubeconfig = self.load()?;
        let context = determine_context(&kubeconfig, self.context.as_deref())?;

        let options = KubeConfigOptions {
            context: Some(context.clone()),
            ..Default::default()
        };
        let config = kube::Config::from_custom_kubeconfig(kubeconfig, &options).await?;
        debug!(context, host = %config.cluster_url, "resolved upstream cluster");

        Ok(ClusterConfig::new(config))
    }

    fn modify(&self, port: u16, token: &str, destination: &Path) -> Result<()> {
        let kubeconfig = self.load()?;
        let context = determine_context(&kubeconfig, self.context.as_deref())?;
        let namespace = determine_namespace(&kubeconfig, None, &context);

        let proxy_kubeconfig = ProxyKubeconfig::new(
            &context,
            &namespace,
            port,
            token,
            self.insecure_skip_tls_verify,
        );
        let contents = serde_yaml::to_string(&proxy_kubeconfig)
            .map_err(|e| Error::KubeconfigWrite(e.to_string()))?;

        write_private(destination, contents.as_bytes())
            .map_err(|e| Error::KubeconfigWrite(format!("{}: {e}", destination.display())))?;

        debug!(path = %destination.display(), context, port, "wrote proxy kubeconfig");
        Ok(())
    }
}

/// Detects the Kubernetes context based on the provided `context` argument.
///
/// Context determination follows this priority:
/// 1. Uses the context if explicitly specified.
/// 2. Retrieves the current context from the kubeconfig.
///
/// # Errors
/// Returns an error if no context is given and the kubeconfig has no current context.
pub fn determine_context(kubeconfig: &Kubeconfig, context: Option<&str>) -> Result<String> {
    match context {
        Some(context) => Ok(context.to_string()),
        None => kubeconfig
            .current_context
            .clone()
            .ok_or_else(|| Error::KubeconfigRead("current context is not set".to_string())),
    }
}

/// Determines the Kubernetes namespace based on the provided `namespace` and `context`.
///
/// Namespace determination follows this priority:
/// 1. Uses the namespace if explicitly specified.
/// 2. Retrieves the namespace associated with the context in the kubeconfig.
/// 3. Uses "default".
pub fn determine_namespace(
    kubeconfig: &Kubeconfig,
    namespace: Option<String>,
    context: &str,
) -> String {
    if let Some(ns) = namespace {
        return ns;
    }

    kubeconfig
        .contexts
        .iter()
        .find(|c| c.name == context)
        .and_then(|c| c.context.as_ref())
        .and_then(|ctx| ctx.namespace.clone())
        .unwrap_or_else(|| String::from("default"))
}

/// Location for the temporary kubeconfig of a deploy named `name`.
///
/// The name is sanitized like a label value, so it can never leave the cache
/// directory.
pub fn temp_kubeconfig_path(name: &str) -> PathBuf {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();

    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("kubestamp")
        .join(format!("kubeconfig-{}-{millis}", sanitize_name(name)))
}

fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path)?;
    file.write_all(contents)
}

// ============================================================================
// Written kubeconfig
// ============================================================================

/// Single-context kubeconfig pointing at the proxy.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct ProxyKubeconfig {
    api_version: String,
    kind: String,
    clusters: Vec<NamedCluster>,
    users: Vec<NamedUser>,
    contexts: Vec<NamedContext>,
    current_context: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct NamedCluster {
    name: String,
    cluster: ClusterEntry,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct ClusterEntry {
    server: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    certificate_authority_data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    insecure_skip_tls_verify: Option<bool>,
}

#[derive(Debug, Serialize, Deserialize)]
struct NamedUser {
    name: String,
    user: UserEntry,
}

#[derive(Debug, Serialize, Deserialize)]
struct UserEntry {
    token: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct NamedContext {
    name: String,
    context: ContextEntry,
}

#[derive(Debug, Serialize, Deserialize)]
struct ContextEntry {
    cluster: String,
    user: String,
    namespace: String,
}

impl ProxyKubeconfig {
    fn new(context: &str, namespace: &str, port: u16, token: &str, insecure: bool) -> Self {
        let cluster = if insecure {
            ClusterEntry {
                server: format!("https://localhost:{port}"),
                certificate_authority_data: None,
                insecure_skip_tls_verify: Some(true),
            }
        } else {
            ClusterEntry {
                server: format!("https://localhost:{port}"),
                certificate_authority_data: Some(STANDARD.encode(CERTIFICATE_PEM)),
                insecure_skip_tls_verify: None,
            }
        };

        Self {
            api_version: "v1".to_string(),
            kind: "Config".to_string(),
            clusters: vec![NamedCluster {
                name: context.to_string(),
                cluster,
            }],
            users: vec![NamedUser {
                name: context.to_string(),
                user: UserEntry {
                    token: token.to_string(),
                },
            }],
            contexts: vec![NamedContext {
                name: context.to_string(),
                context: ContextEntry {
                    cluster: context.to_string(),
                    user: context.to_string(),
                    namespace: namespace.to_string(),
                },
            }],
            current_context: context.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KUBECONFIG: &str = r#"
apiVersion: v1
kind: Config
current-context: dev
clusters:
- name: dev-cluster
  cluster:
    server: https://10.0.0.1:6443
    insecure-skip-tls-verify: true
- name: prod-cluster
  cluster:
    server: https://10.0.0.2:6443
    insecure-skip-tls-verify: true
users:
- name: dev-user
  user:
    token: dev-token
- name: prod-user
  user:
    token: prod-token
contexts:
- name: dev
  context:
    cluster: dev-cluster
    user: dev-user
    namespace: cindy
- name: prod
  context:
    cluster: prod-cluster
    user: prod-user
"#;

    fn kubeconfig() -> Kubeconfig {
        Kubeconfig::from_yaml(KUBECONFIG).unwrap()
    }

    #[test]
    fn context_priority() {
        let kubeconfig = kubeconfig();
        assert_eq!(determine_context(&kubeconfig, Some("prod")).unwrap(), "prod");
        assert_eq!(determine_context(&kubeconfig, None).unwrap(), "dev");

        let empty = Kubeconfig::default();
        assert!(matches!(
            determine_context(&empty, None),
            Err(Error::KubeconfigRead(_))
        ));
    }

    #[test]
    fn namespace_priority() {
        let kubeconfig = kubeconfig();
        assert_eq!(
            determine_namespace(&kubeconfig, Some("explicit".into()), "dev"),
            "explicit"
        );
        assert_eq!(determine_namespace(&kubeconfig, None, "dev"), "cindy");
        assert_eq!(determine_namespace(&kubeconfig, None, "prod"), "default");
        assert_eq!(determine_namespace(&kubeconfig, None, "missing"), "default");
    }

    #[tokio::test]
    async fn read_resolves_current_context() {
        let cluster = KubeconfigRewriter::from_kubeconfig(kubeconfig())
            .read()
            .await
            .unwrap();
        assert_eq!(cluster.host().host(), Some("10.0.0.1"));
        assert_eq!(cluster.bearer_token(), Some("dev-token"));
    }

    #[tokio::test]
    async fn read_uses_selected_context() {
        let cluster = KubeconfigRewriter::from_kubeconfig(kubeconfig())
            .with_context(Some("prod".into()))
            .read()
            .await
            .unwrap();
        assert_eq!(cluster.host().host(), Some("10.0.0.2"));
        assert_eq!(cluster.bearer_token(), Some("prod-token"));
    }

    #[tokio::test]
    async fn read_fails_for_unknown_context() {
        let err = KubeconfigRewriter::from_kubeconfig(kubeconfig())
            .with_context(Some("nope".into()))
            .read()
            .await
            .unwrap_err();
        assert!(matches!(err, Error::KubeconfigRead(_)));
    }

    #[test]
    fn modify_points_at_proxy() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("kubeconfig");

        KubeconfigRewriter::from_kubeconfig(kubeconfig())
            .modify(40123, "session-token", &path)
            .unwrap();

        let written = Kubeconfig::read_from(&path).unwrap();
        assert_eq!(written.current_context.as_deref(), Some("dev"));

        let cluster = written.clusters[0].cluster.as_ref().unwrap();
        assert_eq!(cluster.server.as_deref(), Some("https://localhost:40123"));
        let ca = cluster.certificate_authority_data.as_deref().unwrap();
        assert_eq!(STANDARD.decode(ca).unwrap(), CERTIFICATE_PEM.as_bytes());

        let raw: serde_yaml::Value =
            serde_yaml::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["users"][0]["user"]["token"], "session-token");
        assert_eq!(raw["contexts"][0]["context"]["namespace"], "cindy");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn modify_insecure_skips_ca() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kubeconfig");

        KubeconfigRewriter::from_kubeconfig(kubeconfig())
            .with_insecure_skip_tls_verify(true)
            .modify(40123, "session-token", &path)
            .unwrap();

        let raw: serde_yaml::Value =
            serde_yaml::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        let cluster = &raw["clusters"][0]["cluster"];
        assert_eq!(cluster["insecure-skip-tls-verify"], true);
        assert!(cluster.get("certificate-authority-data").is_none());
    }

    #[test]
    fn temp_paths_are_named_after_deploy() {
        let path = temp_kubeconfig_path("movies");
        let file_name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(file_name.starts_with("kubeconfig-movies-"));
        assert!(path.parent().unwrap().ends_with("kubestamp"));
    }

    #[test]
    fn temp_paths_stay_in_cache_dir() {
        for name in ["../x", "/etc/passwd", "a/../../b"] {
            let path = temp_kubeconfig_path(name);
            assert_eq!(path.parent(), temp_kubeconfig_path("x").parent(), "{path:?}");
            let file_name = path.file_name().unwrap().to_string_lossy().into_owned();
            assert!(file_name.starts_with("kubeconfig-"), "{file_name}");
        }
    }
}
