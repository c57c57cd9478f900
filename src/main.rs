//! certpilot - automatic TLS certificates for Kubernetes ingresses

use std::sync::Arc;

use clap::{Parser, Subcommand};
use kube::{Client, CustomResourceExt};
use tokio_util::sync::CancellationToken;

use certpilot::certificate::{KubeSecretClient, SecretClient};
use certpilot::config::{Config, ControllerArgs};
use certpilot::controller::{self, ApiSurface};
use certpilot::crd::PlatformIngressClass;
use certpilot::manager::Manager;
use certpilot::platform::PlatformClient;
use certpilot::quota::{run_reporter, Quota};
use certpilot::retry::{retry_with_backoff, RetryConfig};
use certpilot::telemetry::{init_telemetry, TelemetryConfig};

/// certpilot - provisions and renews TLS certificates for opted-in ingresses
#[derive(Parser, Debug)]
#[command(name = "certpilot", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    controller: ControllerArgs,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controller (default mode)
    ///
    /// Watches Ingresses, IngressRoutes, IngressClasses and Secrets, requests
    /// certificates for opted-in resources and renews them before expiry.
    Controller,

    /// Print the platform IngressClass CRD manifest and exit
    Crd,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Crd) => {
            let crd = serde_yaml::to_string(&PlatformIngressClass::crd())
                .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
            println!("{crd}");
            Ok(())
        }
        Some(Commands::Controller) | None => run_controller(cli.controller).await,
    }
}

/// Cancel `token` on SIGINT or SIGTERM
fn cancel_on_signal(token: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };
        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = tokio::signal::ctrl_c() => tracing::info!("Received SIGINT"),
            _ = terminate => tracing::info!("Received SIGTERM"),
        }
        token.cancel();
    });
}

/// Run in controller mode
///
/// Startup order: discovery, then the manager (which restores quota from
/// existing managed secrets), the quota reporter once that restore is done,
/// then the watches. A cache sync timeout aborts the whole process.
async fn run_controller(args: ControllerArgs) -> anyhow::Result<()> {
    init_telemetry(TelemetryConfig::default())
        .map_err(|e| anyhow::anyhow!("Failed to initialize telemetry: {}", e))?;

    let config = Config::from_args(args).map_err(|e| anyhow::anyhow!("{}", e))?;
    tracing::info!(
        controller_name = %config.controller_name,
        quota = config.secured_routes_quota,
        workers = config.workers,
        "certpilot controller starting..."
    );

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    let surface = retry_with_backoff(&RetryConfig::with_max_attempts(5), "api_discovery", || {
        ApiSurface::discover(&client)
    })
    .await
    .map_err(|e| anyhow::anyhow!("API discovery failed: {}", e))?;

    let platform = Arc::new(
        PlatformClient::new(
            &config.platform_url,
            &config.platform_token,
            config.platform_timeout,
        )
        .map_err(|e| anyhow::anyhow!("{}", e))?,
    );
    let quota = Arc::new(Quota::new(config.secured_routes_quota));
    let secrets: Arc<dyn SecretClient> = Arc::new(KubeSecretClient::new(
        client.clone(),
        &config.controller_name,
    ));
    let manager = Arc::new(Manager::new(
        config.manager_config(),
        quota.clone(),
        platform.clone(),
        secrets.clone(),
    ));

    let token = CancellationToken::new();
    cancel_on_signal(token.clone());

    let manager_task = tokio::spawn(manager.clone().run(token.clone()));
    // The first report must already include the restored usage.
    let reporter_task = {
        let manager = manager.clone();
        let token = token.clone();
        let interval = config.report_interval;
        let timeout = config.platform_timeout;
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = manager.quota_restored() => {}
            }
            run_reporter(quota, platform, interval, timeout, token).await;
        })
    };

    let result = controller::run(
        client,
        &surface,
        config.controller_settings(),
        manager,
        secrets,
        token.clone(),
    )
    .await;

    // Whatever ended the controller ends the background tasks too.
    token.cancel();
    if let Err(e) = manager_task.await {
        tracing::warn!(error = %e, "Manager task ended abnormally");
    }
    if let Err(e) = reporter_task.await {
        tracing::warn!(error = %e, "Quota reporter task ended abnormally");
    }

    match result {
        Ok(()) => {
            tracing::info!("certpilot controller shutting down");
            Ok(())
        }
        Err(e) => Err(anyhow::anyhow!("Controller failed: {}", e)),
    }
}
