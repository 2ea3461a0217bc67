use anyhow::Result;
use ingress_monitor::cli::RunArgs;
use ingress_monitor::config::{Settings, CONFIG};
use ingress_monitor::informer::kubernetes::{connect, scoped_api, watch_stream};
use ingress_monitor::reconcile::ChangePrinter;
use ingress_monitor::Controller;
use k8s_openapi::api::networking::v1::Ingress;
use kube::Api;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub async fn execute(args: RunArgs) -> Result<()> {
    let base = match &args.config {
        Some(path) => Settings::from_yaml_file(path)?,
        None => Settings::clone(&CONFIG),
    };
    let settings = args.apply(base);
    settings.validate()?;

    let scope = settings.watch_scope();
    info!(
        "[Ingress Monitor] Watching ingresses in {} with {} workers",
        scope.namespace.as_deref().unwrap_or("all namespaces"),
        settings.workers
    );

    let client = connect(settings.kubeconfig_path.as_deref(), settings.context.as_deref()).await?;
    let api: Api<Ingress> = scoped_api(client, &scope);
    let controller = Controller::new(watch_stream(api, &scope), &settings);
    let reconciler = Arc::new(ChangePrinter::stdout(controller.indexer()));

    let stop = CancellationToken::new();
    tokio::spawn(cancel_on_signal(stop.clone()));

    controller.run(reconciler, settings.workers, stop).await?;
    Ok(())
}

/// Cancels `stop` on Ctrl-C, or SIGTERM on unix.
async fn cancel_on_signal(stop: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("[Ingress Monitor] Received Ctrl-C"),
        _ = terminate => info!("[Ingress Monitor] Received SIGTERM"),
    }
    stop.cancel();
}
