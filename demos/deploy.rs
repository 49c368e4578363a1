use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use kube::config::Kubeconfig;
use kubestamp::{
    DnsSearchDivert, IstioDivert, KubeconfigHandler, KubeconfigRewriter, Proxy, determine_context,
    determine_namespace, labels::is_sample_repository, temp_kubeconfig_path,
};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Debug, Parser)]
#[command(
    name = "kubestamp-deploy",
    about = "Run deploy commands through the labelling proxy"
)]
struct Cli {
    #[arg(long)]
    /// Kubernetes context to deploy to, defaults to the current one.
    context: Option<String>,

    #[arg(long)]
    /// Name stamped on every deployed resource.
    name: String,

    #[arg(long)]
    /// Shared namespace the deployed namespace is diverted onto.
    divert_namespace: Option<String>,

    #[arg(long, requires = "divert_namespace")]
    /// Divert through Istio routing instead of DNS search paths.
    istio: bool,

    #[arg(long)]
    /// Git remote of the repository being deployed.
    repository: Option<String>,

    #[arg(trailing_var_arg = true, required = true)]
    /// Command to run with KUBECONFIG pointing at the proxy.
    command: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let rewriter = KubeconfigRewriter::new().with_context(cli.context.clone());
    let mut proxy = Proxy::from_kubeconfig(&rewriter)
        .await
        .map_err(|e| match e.hint() {
            Some(hint) => anyhow::anyhow!("{e}\n    {hint}"),
            None => e.into(),
        })?;

    proxy.set_name(&cli.name);
    if let Some(repository) = &cli.repository {
        proxy.set_sample_repository(is_sample_repository(repository));
    }
    if let Some(shared) = &cli.divert_namespace {
        let kubeconfig = Kubeconfig::read()?;
        let context = determine_context(&kubeconfig, cli.context.as_deref())?;
        let namespace = determine_namespace(&kubeconfig, None, &context);
        if cli.istio {
            proxy.set_divert(Arc::new(IstioDivert::new(shared, namespace)));
        } else {
            proxy.set_divert(Arc::new(DnsSearchDivert::new(shared, namespace)));
        }
    }

    proxy.start();
    let addr = proxy
        .listening()
        .await
        .ok_or_else(|| anyhow::anyhow!("proxy failed to start"))?;
    println!("proxy listening on {addr}");

    let path = temp_kubeconfig_path(&cli.name);
    rewriter.modify(proxy.port(), proxy.token(), &path)?;

    let status = tokio::process::Command::new(&cli.command[0])
        .args(&cli.command[1..])
        .env("KUBECONFIG", &path)
        .status()
        .await;

    proxy.shutdown(Duration::from_secs(5)).await?;
    if let Err(e) = std::fs::remove_file(&path) {
        eprintln!("could not remove {}: {e}", path.display());
    }

    let status = status?;
    if !status.success() {
        anyhow::bail!("command exited with {status}");
    }
    Ok(())
}
