use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures_util::StreamExt;
use lapin::options::{BasicAckOptions, BasicConsumeOptions};
use lapin::types::FieldTable;
use slipway::configuration::get_configuration;
use slipway::helpers::mq_manager::channels;
use slipway::startup::{build_engine, Engine, EngineCommand};
use slipway::telemetry::{get_subscriber, init_subscriber};

const REQUEST_QUEUE: &str = "slipway_requests";
const SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let subscriber = get_subscriber("slipway".into(), "info".into());
    init_subscriber(subscriber);

    let settings = get_configuration().expect("Failed to read configuration.");
    tracing::info!(
        work_root = %settings.work_root.display(),
        queue_capacity = settings.queue_capacity,
        base_port = settings.base_port,
        "Starting pipeline engine"
    );

    let engine = build_engine(settings)?;

    // Periodic status-retention sweep.
    let sweeper = engine.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            ticker.tick().await;
            let removed = sweeper.sweep_statuses().await;
            tracing::debug!(removed = removed, "status retention sweep finished");
        }
    });

    consume_requests(engine).await
}

/// Consume deploy/cancel commands from the bus and dispatch them into the
/// pipeline queue. Each deployment runs in its own task; the queue decides
/// when it actually executes.
async fn consume_requests(engine: Arc<Engine>) -> anyhow::Result<()> {
    let channel = engine
        .mq
        .consume(channels::DEPLOYMENTS, REQUEST_QUEUE, "request.*")
        .await
        .map_err(anyhow::Error::msg)
        .context("binding request queue")?;

    let consumer_tag = format!("slipway_engine_{}", uuid::Uuid::new_v4());
    let mut consumer = channel
        .basic_consume(
            REQUEST_QUEUE,
            &consumer_tag,
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await
        .context("starting request consumer")?;

    tracing::info!(queue = REQUEST_QUEUE, "consuming deployment requests");

    while let Some(delivery) = consumer.next().await {
        let delivery = match delivery {
            Ok(delivery) => delivery,
            Err(err) => {
                tracing::error!(error = %err, "request consumer error");
                continue;
            }
        };

        if let Err(err) = delivery.ack(BasicAckOptions::default()).await {
            tracing::warn!(error = %err, "failed to ack request");
        }

        match serde_json::from_slice::<EngineCommand>(&delivery.data) {
            Ok(EngineCommand::Deploy(request)) => {
                tracing::info!(
                    project = %request.project,
                    deployment_id = %request.deployment_id,
                    "deployment request accepted"
                );
                let engine = engine.clone();
                tokio::spawn(async move {
                    let deployment = engine.run_deployment(request).await;
                    tracing::info!(
                        deployment_id = %deployment.id,
                        status = %deployment.status,
                        "deployment finished"
                    );
                });
            }
            Ok(EngineCommand::Cancel { deployment_id }) => {
                if !engine.cancel_deployment(&deployment_id).await {
                    tracing::warn!(
                        deployment_id = %deployment_id,
                        "cancel requested for unknown deployment"
                    );
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "dropping malformed request payload");
            }
        }
    }

    Ok(())
}
