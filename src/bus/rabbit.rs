//! AMQP bus backend.
//!
//! Sender and receiver traffic use separate connections; both are dialed
//! lazily and re-dialed after a close notification. A publish that hits a
//! dead channel re-initializes the sender once and retries.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind,
};
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::{BusBackend, BusDelivery, BusError, BusSource, QueueSettings, RouterSettings};

const SOURCE: &str = "bus::rabbit";

pub struct RabbitBackend {
    address: String,
    sender: Mutex<Option<(Connection, Channel)>>,
    receiver: Mutex<Option<Connection>>,
}

impl RabbitBackend {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            sender: Mutex::new(None),
            receiver: Mutex::new(None),
        }
    }

    async fn dial(&self) -> Result<Connection, BusError> {
        let connection = Connection::connect(&self.address, ConnectionProperties::default())
            .await
            .map_err(|err| BusError::Connect {
                message: err.to_string(),
            })?;
        info!(target: SOURCE, address = %self.address, "connection opened");
        connection.on_error(|err| {
            warn!(target: SOURCE, reason = %err, "connection closed, will redial on next use");
        });
        Ok(connection)
    }

    async fn sender_channel(
        &self,
        queue: &QueueSettings,
        router: Option<&RouterSettings>,
        force: bool,
    ) -> Result<Channel, BusError> {
        let mut sender = self.sender.lock().await;
        let stale = match sender.as_ref() {
            Some((connection, channel)) => {
                force || !connection.status().connected() || !channel.status().connected()
            }
            None => true,
        };
        if stale {
            let connection = self.dial().await?;
            let channel = connection
                .create_channel()
                .await
                .map_err(|err| BusError::Connect {
                    message: err.to_string(),
                })?;
            declare_topology(&channel, queue, router, true).await?;
            *sender = Some((connection, channel));
        }
        Ok(sender.as_ref().expect("sender was just initialized").1.clone())
    }

}

async fn declare_topology(
    channel: &Channel,
    queue: &QueueSettings,
    router: Option<&RouterSettings>,
    sender: bool,
) -> Result<(), BusError> {
    if let Some(router) = router {
        let mut args = FieldTable::default();
        let kind = if router.delayed {
            args.insert(
                "x-delayed-type".into(),
                AMQPValue::LongString(router.kind.clone().into()),
            );
            ExchangeKind::Custom("x-delayed-message".to_string())
        } else {
            match router.kind.as_str() {
                "fanout" => ExchangeKind::Fanout,
                "topic" => ExchangeKind::Topic,
                _ => ExchangeKind::Direct,
            }
        };
        channel
            .exchange_declare(
                router.name.as_str(),
                kind,
                ExchangeDeclareOptions {
                    durable: router.durable,
                    auto_delete: true,
                    ..Default::default()
                },
                args,
            )
            .await
            .map_err(|err| BusError::Connect {
                message: err.to_string(),
            })?;
        // Senders publish into the exchange; only consumers own a queue.
        if sender {
            return Ok(());
        }
    }
    channel
        .queue_declare(
            queue.name.as_str(),
            QueueDeclareOptions {
                durable: queue.durable,
                auto_delete: queue.autodelete,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|err| BusError::Consume {
            queue: queue.name.clone(),
            message: err.to_string(),
        })?;
    channel
        .basic_qos(queue.prefetch_count, BasicQosOptions::default())
        .await
        .map_err(|err| BusError::Consume {
            queue: queue.name.clone(),
            message: err.to_string(),
        })?;
    if let Some(router) = router {
        let keys: Vec<&str> = if queue.router_keys.is_empty() {
            vec![""]
        } else {
            queue.router_keys.iter().map(String::as_str).collect()
        };
        for key in keys {
            channel
                .queue_bind(
                    queue.name.as_str(),
                    router.name.as_str(),
                    key,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|err| BusError::Consume {
                    queue: queue.name.clone(),
                    message: err.to_string(),
                })?;
        }
    }
    Ok(())
}

#[async_trait]
impl BusBackend for RabbitBackend {
    async fn publish(
        &self,
        queue: &QueueSettings,
        router: Option<&RouterSettings>,
        routing_key: &str,
        body: &[u8],
        delay: Option<Duration>,
    ) -> Result<(), BusError> {
        let exchange = router.map(|r| r.name.as_str()).unwrap_or("");
        let mut properties = BasicProperties::default().with_content_type("text/plain".into());
        if let Some(delay) = delay {
            let mut headers = FieldTable::default();
            headers.insert(
                "x-delay".into(),
                AMQPValue::LongLongInt(delay.as_millis() as i64),
            );
            properties = properties
                .with_delivery_mode(2)
                .with_headers(headers);
        }
        let channel = self.sender_channel(queue, router, false).await?;
        let outcome = channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                body,
                properties.clone(),
            )
            .await;
        let outcome = match outcome {
            Ok(confirm) => confirm.await.map(|_| ()),
            Err(err) => Err(err),
        };
        if let Err(first_failure) = outcome {
            // One forced re-dial, matching broker channel-error recovery.
            warn!(
                target: SOURCE,
                queue = %queue.name,
                reason = %first_failure,
                "publish failed, reconnecting"
            );
            let channel = self.sender_channel(queue, router, true).await?;
            channel
                .basic_publish(
                    exchange,
                    routing_key,
                    BasicPublishOptions::default(),
                    body,
                    properties,
                )
                .await
                .map_err(|err| BusError::Publish {
                    queue: queue.name.clone(),
                    message: err.to_string(),
                })?
                .await
                .map_err(|err| BusError::Publish {
                    queue: queue.name.clone(),
                    message: err.to_string(),
                })?;
        }
        Ok(())
    }

    async fn open_source(
        &self,
        queue: &QueueSettings,
        router: Option<&RouterSettings>,
        consumer_name: &str,
    ) -> Result<Box<dyn BusSource>, BusError> {
        let mut receiver = self.receiver.lock().await;
        let stale = match receiver.as_ref() {
            Some(connection) => !connection.status().connected(),
            None => true,
        };
        if stale {
            *receiver = Some(self.dial().await?);
        }
        let connection = receiver.as_ref().expect("receiver was just initialized");
        let channel = connection
            .create_channel()
            .await
            .map_err(|err| BusError::Connect {
                message: err.to_string(),
            })?;
        drop(receiver);
        declare_topology(&channel, queue, router, false).await?;
        let consumer = channel
            .basic_consume(
                queue.name.as_str(),
                consumer_name,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|err| BusError::Consume {
                queue: queue.name.clone(),
                message: err.to_string(),
            })?;
        Ok(Box::new(RabbitSource {
            queue: queue.name.clone(),
            channel,
            consumer,
        }))
    }
}

struct RabbitSource {
    queue: String,
    channel: Channel,
    consumer: Consumer,
}

#[async_trait]
impl BusSource for RabbitSource {
    async fn next(&mut self, wait: Duration) -> Result<Option<BusDelivery>, BusError> {
        match tokio::time::timeout(wait, self.consumer.next()).await {
            Err(_elapsed) => Ok(None),
            Ok(None) => Err(BusError::Consume {
                queue: self.queue.clone(),
                message: "delivery stream closed".to_string(),
            }),
            Ok(Some(Err(err))) => Err(BusError::Consume {
                queue: self.queue.clone(),
                message: err.to_string(),
            }),
            Ok(Some(Ok(delivery))) => Ok(Some(BusDelivery {
                tag: delivery.delivery_tag,
                body: delivery.data,
            })),
        }
    }

    async fn ack_batch(&mut self, up_to_tag: u64) -> Result<(), BusError> {
        self.channel
            .basic_ack(up_to_tag, BasicAckOptions { multiple: true })
            .await
            .map_err(|err| BusError::Consume {
                queue: self.queue.clone(),
                message: err.to_string(),
            })
    }
}
