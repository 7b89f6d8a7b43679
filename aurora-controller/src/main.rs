//! The `aurora-controller` binary
use anyhow::Context;
use aurora_controller::{
    client::{ClusterApi, KubeApi},
    config::Credential,
    namespaces::{secret_to_namespace, NamespaceSync},
    serviceaccounts::ServiceAccountSync,
};
use aurora_runtime::{backoff::MAX_DELAY, controller, Controller, EventTranslator, Informer, Triggers};
use clap::{Args, Parser, Subcommand};
use futures::future;
use k8s_openapi::api::core::v1::{Namespace, Secret, ServiceAccount};
use kube::{
    config::{KubeConfigOptions, Kubeconfig},
    runtime::watcher,
    Api, Client,
};
use std::{path::PathBuf, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// A set of controllers that help to further configure the Aurora platform.
#[derive(Parser)]
#[command(name = "aurora-controller", version)]
struct Cli {
    /// URL to the Kubernetes API server
    #[arg(long, global = true)]
    apiserver: Option<String>,
    /// Path to the Kubeconfig file
    #[arg(long, global = true)]
    kubeconfig: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Configure image pull secrets for Aurora resources
    ImagePullSecrets(ImagePullSecrets),
}

#[derive(Args)]
struct ImagePullSecrets {
    /// Name of the registry secret, and of the reference added to service accounts
    #[arg(long, env = "AURORA_SECRET_NAME")]
    secret_name: Option<String>,
    /// Registry auth document stored in the secret
    #[arg(long, env = "AURORA_SECRET_DOCKERCONFIGJSON", hide_env_values = true)]
    docker_config_json: Option<String>,
    /// Workers per controller
    #[arg(long, default_value_t = 2, value_parser = clap::value_parser!(u16).range(1..))]
    workers: u16,
    /// Retries of a failing key before it is dropped
    #[arg(long, default_value_t = 15)]
    max_retries: u32,
    /// Seconds before the first retry of a failing key
    #[arg(long, default_value_t = 5, value_parser = clap::value_parser!(u64).range(1..=MAX_DELAY.as_secs()))]
    base_delay: u64,
    /// Upper bound in seconds of the delay between retries
    #[arg(long, default_value_t = 1000, value_parser = clap::value_parser!(u64).range(1..=MAX_DELAY.as_secs()))]
    max_delay: u64,
    /// Seconds between full resyncs of the caches, 0 disables them
    #[arg(long, default_value_t = 300, value_parser = clap::value_parser!(u64).range(..=MAX_DELAY.as_secs()))]
    resync_period: u64,
    /// Give up if the caches have not synced after this many seconds
    #[arg(long)]
    cache_sync_timeout: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = client_config(cli.apiserver.as_deref(), cli.kubeconfig).await?;
    let client = Client::try_from(config).context("error building kubernetes client")?;
    match cli.command {
        Command::ImagePullSecrets(args) => image_pull_secrets(client, args).await,
    }
}

/// Resolves the client configuration the way `--kubeconfig` and `--apiserver` ask for
async fn client_config(apiserver: Option<&str>, kubeconfig: Option<PathBuf>) -> anyhow::Result<kube::Config> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(&path)
                .with_context(|| format!("error reading kubeconfig {}", path.display()))?;
            kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .context("error building kubeconfig")?
        }
        None => match (kube::Config::infer().await, apiserver) {
            (Ok(config), _) => config,
            (Err(err), Some(apiserver)) => {
                warn!(error = %err, "no usable kubeconfig, talking to --apiserver without credentials");
                kube::Config::new(apiserver.parse().context("invalid --apiserver")?)
            }
            (Err(err), None) => return Err(err).context("error building kubeconfig"),
        },
    };
    if let Some(apiserver) = apiserver {
        config.cluster_url = apiserver.parse().context("invalid --apiserver")?;
    }
    Ok(config)
}

async fn image_pull_secrets(client: Client, args: ImagePullSecrets) -> anyhow::Result<()> {
    let credential = Arc::new(Credential::new(
        args.secret_name.as_deref().unwrap_or_default(),
        args.docker_config_json.as_deref().unwrap_or_default(),
    )?);
    let api: Arc<dyn ClusterApi> = Arc::new(KubeApi::new(client.clone()));
    let resync = Some(Duration::from_secs(args.resync_period));

    let mut namespaces = Informer::new(Api::<Namespace>::all(client.clone()), watcher::Config::default())
        .with_resync_period(resync);
    let mut accounts = Informer::new(Api::<ServiceAccount>::all(client.clone()), watcher::Config::default())
        .with_resync_period(resync);
    // Only the managed secret matters, don't cache every secret in the cluster
    let mut secrets = Informer::new(
        Api::<Secret>::all(client),
        watcher::Config::default().fields(&format!("metadata.name={}", credential.name())),
    )
    .with_resync_period(resync);

    let engine = controller::Config::default()
        .workers(usize::from(args.workers))
        .max_retries(args.max_retries)
        .backoff(
            Duration::from_secs(args.base_delay),
            Duration::from_secs(args.max_delay),
        )
        .cache_sync_timeout(args.cache_sync_timeout.map(Duration::from_secs));

    let mut account_controller = Controller::new(
        "serviceaccounts",
        ServiceAccountSync::new(accounts.store(), api.clone(), credential.clone()),
        engine.clone(),
    );
    account_controller.watches(&mut accounts, EventTranslator::for_self(Triggers::APPLIED));

    let mut namespace_controller = Controller::new(
        "namespaces",
        NamespaceSync::new(namespaces.store(), secrets.store(), api, credential.clone()),
        engine,
    );
    namespace_controller.watches(&mut namespaces, EventTranslator::for_self(Triggers::APPLIED));
    namespace_controller.watches(
        &mut secrets,
        EventTranslator::with_mapper(Triggers::CHANGED, secret_to_namespace(credential.name())),
    );

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_on_signal(shutdown.clone()));
    let informers = tokio::spawn(future::join3(
        namespaces.run(shutdown.clone().cancelled_owned()),
        accounts.run(shutdown.clone().cancelled_owned()),
        secrets.run(shutdown.clone().cancelled_owned()),
    ));

    info!(secret = credential.name(), "starting controllers");
    let res = future::try_join(
        account_controller.run(shutdown.clone().cancelled_owned()),
        namespace_controller.run(shutdown.clone().cancelled_owned()),
    )
    .await;
    shutdown.cancel();
    informers.await.context("informers crashed")?;
    res.context("error running controller")?;
    info!("controllers stopped");
    Ok(())
}

/// Cancels `shutdown` on SIGTERM or ctrl-c, a second signal exits immediately
async fn shutdown_on_signal(shutdown: CancellationToken) {
    termination_signal().await;
    info!("shutting down, signal again to exit immediately");
    shutdown.cancel();
    termination_signal().await;
    std::process::exit(1);
}

async fn termination_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "cannot listen for ctrl-c");
            future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "cannot listen for SIGTERM");
                future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = future::pending::<()>();
    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
