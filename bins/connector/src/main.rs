use std::sync::Arc;

use faas_controller::{Controller, GatewayCredentials};
use nsq_connector::{
    BrokerReadinessGate, ConnectorConfig, ConnectorError, ConsumerGroupSupervisor,
    NsqConsumerFactory,
};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    if let Err(e) = run().await {
        tracing::error!(error = %e, "connector failed");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), ConnectorError> {
    let config = ConnectorConfig::from_env()?;
    tracing::info!(
        topics = ?config.topics,
        mode = config.brokers.mode(),
        brokers = ?config.brokers.addresses(),
        channel = %config.channel,
        max_in_flight = config.max_in_flight,
        gateway = %config.controller.gateway_url,
        "starting connector"
    );

    let credentials = GatewayCredentials::from_env()?;
    let controller = Arc::new(Controller::new(credentials, config.controller.clone())?);

    let token = CancellationToken::new();
    let map_builder = controller.begin_map_builder(token.clone());

    let passes = BrokerReadinessGate::from_config(&config).wait().await;
    tracing::debug!(passes, "readiness gate open");

    let supervisor = ConsumerGroupSupervisor::new(
        NsqConsumerFactory::new(config.nsq_config()),
        controller,
        &config,
    );
    let result = supervisor.run(shutdown_signal()).await;

    token.cancel();
    if let Err(e) = map_builder.await {
        tracing::warn!(error = %e, "map builder task failed");
    }
    result
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to register SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("SIGINT received, shutting down"),
        _ = terminate => tracing::info!("SIGTERM received, shutting down"),
    }
}
