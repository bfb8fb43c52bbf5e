use chrono::{DateTime, Utc};
use deadpool_lapin::{Config, CreatePoolError, Object, Pool, Runtime};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{
    options::*,
    publisher_confirm::{Confirmation, PublisherConfirm},
    BasicProperties, Channel, ExchangeKind,
};
use serde::ser::Serialize;
use serde::Deserialize;

/// Logical bus channels the engine publishes to. Subscribers (dashboards,
/// audit trails, log viewers) consume these independently of the broker.
pub mod channels {
    pub const DEPLOYMENTS: &str = "deployments";
    pub const BUILD_LOGS: &str = "build_logs";
    pub const METRICS: &str = "metrics";
    pub const NOTIFICATIONS: &str = "notifications";
    pub const AUDIT: &str = "audit";
}

/// Deployment lifecycle event, keyed by deployment id.
#[derive(Debug, Clone, serde::Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentEvent {
    pub event_type: String,
    pub deployment_id: String,
    pub timestamp: DateTime<Utc>,
    pub data: serde_json::Value,
}

impl DeploymentEvent {
    pub fn new(event_type: &str, deployment_id: &str, data: serde_json::Value) -> Self {
        Self {
            event_type: event_type.to_string(),
            deployment_id: deployment_id.to_string(),
            timestamp: Utc::now(),
            data,
        }
    }
}

/// One live build-output line for streaming log viewers.
#[derive(Debug, Clone, serde::Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildLogLine {
    pub deployment_id: String,
    pub line: String,
    pub stream: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug)]
pub struct MqManager {
    pool: Pool,
}

impl MqManager {
    pub fn try_new(url: String) -> Result<Self, std::io::Error> {
        let mut cfg = Config::default();
        cfg.url = Some(url);
        let pool = cfg.create_pool(Some(Runtime::Tokio1)).map_err(|err| {
            tracing::error!("{:?}", err);

            match err {
                CreatePoolError::Config(_) => {
                    std::io::Error::new(std::io::ErrorKind::Other, "config error")
                }
                CreatePoolError::Build(_) => {
                    std::io::Error::new(std::io::ErrorKind::Other, "build error")
                }
            }
        })?;

        Ok(Self { pool })
    }

    async fn get_connection(&self) -> Result<Object, String> {
        self.pool.get().await.map_err(|err| {
            let msg = format!("getting connection from pool {:?}", err);
            tracing::error!(msg);
            msg
        })
    }

    async fn create_channel(&self) -> Result<Channel, String> {
        self.get_connection()
            .await?
            .create_channel()
            .await
            .map_err(|err| {
                let msg = format!("creating RabbitMQ channel {:?}", err);
                tracing::error!(msg);
                msg
            })
    }

    pub async fn publish<T: ?Sized + Serialize>(
        &self,
        exchange: String,
        routing_key: String,
        msg: &T,
    ) -> Result<PublisherConfirm, String> {
        let payload = serde_json::to_string::<T>(msg).map_err(|err| format!("{:?}", err))?;

        self.create_channel()
            .await?
            .basic_publish(
                exchange.as_str(),
                routing_key.as_str(),
                BasicPublishOptions::default(),
                payload.as_bytes(),
                BasicProperties::default(),
            )
            .await
            .map_err(|err| {
                tracing::error!("publishing message {:?}", err);
                format!("publishing message {:?}", err)
            })
    }

    pub async fn publish_and_confirm<T: ?Sized + Serialize>(
        &self,
        exchange: String,
        routing_key: String,
        msg: &T,
    ) -> Result<(), String> {
        self.publish(exchange, routing_key, msg)
            .await?
            .await
            .map_err(|err| {
                let msg = format!("confirming the publication {:?}", err);
                tracing::error!(msg);
                msg
            })
            .and_then(|confirm| match confirm {
                Confirmation::Nack(_) => {
                    let msg = "broker nacked the publication".to_string();
                    tracing::error!(msg);
                    Err(msg)
                }
                _ => Ok(()),
            })
    }

    /// Publish a lifecycle event to one of the logical channels, routed by
    /// deployment id so subscribers can filter per deployment.
    pub async fn publish_event(&self, channel: &str, event: &DeploymentEvent) -> Result<(), String> {
        self.publish(
            channel.to_string(),
            format!("deployment.{}", event.deployment_id),
            event,
        )
        .await
        .map(|_| ())
    }

    /// Publish one build-log line to the build-log channel. Best-effort:
    /// callers stream these and must not fail a build over a lost line.
    pub async fn publish_build_log(&self, line: &BuildLogLine) -> Result<(), String> {
        self.publish(
            channels::BUILD_LOGS.to_string(),
            format!("deployment.{}", line.deployment_id),
            line,
        )
        .await
        .map(|_| ())
    }

    /// Declare and bind a consumer queue on a topic exchange, returning the
    /// channel to consume from.
    pub async fn consume(
        &self,
        exchange_name: &str,
        queue_name: &str,
        routing_key: &str,
    ) -> Result<Channel, String> {
        let channel = self.create_channel().await?;

        channel
            .exchange_declare(
                exchange_name,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    passive: false,
                    durable: true,
                    auto_delete: false,
                    internal: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| format!("declaring exchange {:?}", err))?;

        let mut args = FieldTable::default();
        args.insert("x-expires".into(), AMQPValue::LongUInt(3600000));

        channel
            .queue_declare(
                queue_name,
                QueueDeclareOptions {
                    passive: false,
                    durable: false,
                    exclusive: false,
                    auto_delete: true,
                    nowait: false,
                },
                args,
            )
            .await
            .map_err(|err| format!("declaring queue {:?}", err))?;

        channel
            .queue_bind(
                queue_name,
                exchange_name,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|err| format!("binding queue {:?}", err))?;

        Ok(channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deployment_event_wire_format_is_camel_case() {
        let event = DeploymentEvent::new(
            "pipeline.started",
            "dep-1",
            serde_json::json!({"branch": "main"}),
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["eventType"], "pipeline.started");
        assert_eq!(json["deploymentId"], "dep-1");
        assert!(json["timestamp"].is_string());
        assert_eq!(json["data"]["branch"], "main");
    }

    #[test]
    fn test_build_log_line_wire_format() {
        let line = BuildLogLine {
            deployment_id: "dep-1".to_string(),
            line: "Step 1/4 : FROM node:20-alpine".to_string(),
            stream: "stdout".to_string(),
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&line).unwrap();
        assert_eq!(json["deploymentId"], "dep-1");
        assert_eq!(json["stream"], "stdout");
        assert!(json["line"].as_str().unwrap().contains("FROM"));
    }
}
