use std::sync::Arc;

use convoy_client::{KubeClient, ResourceClient};
use convoy_operator::{config::ConvoyConfig, init_tracing, runtime};
use envconfig::Envconfig;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    init_tracing("info");

    let cfg = ConvoyConfig::init_from_env()?.apply_profile_defaults();
    info!(?cfg, "Starting convoy operator");

    let client: Arc<dyn ResourceClient> = Arc::new(KubeClient::try_default().await?);

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for shutdown signal");
                return;
            }
            info!("shutdown signal received");
            shutdown.cancel();
        });
    }

    runtime::run_all(client, cfg, shutdown).await
}
