//! AMQP broker backed by `lapin`
//!
//! Queues are durable and support priorities up to 9. Messages are persistent
//! JSON. Connection errors are forwarded to the watcher as `Closed` events;
//! lapin does not surface blocked/unblocked notifications.

use crate::transport::{
    Acker, Broker, BrokerChannel, BrokerConnection, ConnectionEvent, Delivery, DeliveryStream,
    TransportError, TransportResult,
};
use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::{BasicProperties, ConnectionProperties};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use url::Url;

/// Highest message priority a queue accepts
pub const MAX_PRIORITY: u8 = 9;

const PERSISTENT: u8 = 2;

/// Broker reachable at an `amqp://` or `amqps://` URL
pub struct AmqpBroker {
    url: String,
}

impl AmqpBroker {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn dial(&self) -> TransportResult<Arc<dyn BrokerConnection>> {
        let connection = lapin::Connection::connect(&self.url, ConnectionProperties::default())
            .await
            .map_err(|e| TransportError::Dial(format!("{}: {}", self.describe(), e)))?;

        let (tx, rx) = mpsc::unbounded_channel();
        connection.on_error(move |err| {
            let _ = tx.send(ConnectionEvent::Closed {
                reason: err.to_string(),
            });
        });

        Ok(Arc::new(AmqpConnection {
            connection,
            events: Mutex::new(Some(rx)),
        }))
    }

    fn describe(&self) -> String {
        match Url::parse(&self.url) {
            Ok(mut url) => {
                let _ = url.set_password(None);
                url.to_string()
            }
            Err(_) => "<invalid amqp url>".to_string(),
        }
    }
}

struct AmqpConnection {
    connection: lapin::Connection,
    events: Mutex<Option<UnboundedReceiver<ConnectionEvent>>>,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn open_channel(&self) -> TransportResult<Arc<dyn BrokerChannel>> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| TransportError::Channel(e.to_string()))?;
        Ok(Arc::new(AmqpChannel { channel }))
    }

    fn take_events(&self) -> Option<UnboundedReceiver<ConnectionEvent>> {
        self.events.lock().ok().and_then(|mut events| events.take())
    }

    async fn close(&self) -> TransportResult<()> {
        self.connection
            .close(200, "closing")
            .await
            .map_err(|e| TransportError::Closed(e.to_string()))
    }
}

struct AmqpChannel {
    channel: lapin::Channel,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn set_prefetch(&self, count: u16) -> TransportResult<()> {
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(|e| TransportError::Channel(e.to_string()))
    }

    async fn declare_queue(&self, name: &str) -> TransportResult<()> {
        let mut arguments = FieldTable::default();
        arguments.insert(
            ShortString::from("x-max-priority"),
            AMQPValue::ShortShortUInt(MAX_PRIORITY),
        );

        let options = QueueDeclareOptions {
            durable: true,
            ..QueueDeclareOptions::default()
        };

        self.channel
            .queue_declare(name, options, arguments)
            .await
            .map(|_| ())
            .map_err(|e| TransportError::Channel(format!("declaring {}: {}", name, e)))
    }

    async fn publish(&self, queue: &str, payload: Vec<u8>, priority: u8) -> TransportResult<()> {
        let properties = BasicProperties::default()
            .with_content_type(ShortString::from("application/json"))
            .with_delivery_mode(PERSISTENT)
            .with_priority(priority.min(MAX_PRIORITY));

        self.channel
            .basic_publish("", queue, BasicPublishOptions::default(), &payload, properties)
            .await
            .map_err(|e| TransportError::Publish(e.to_string()))?
            .await
            .map_err(|e| TransportError::Publish(e.to_string()))?;

        Ok(())
    }

    async fn consume(&self, queue: &str) -> TransportResult<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                "",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| TransportError::Consume(e.to_string()))?;

        Ok(consumer
            .map(|delivery| match delivery {
                Ok(delivery) => Ok(Delivery::new(
                    delivery.data,
                    delivery.redelivered,
                    Box::new(AmqpAcker {
                        acker: delivery.acker,
                    }),
                )),
                Err(e) => Err(TransportError::Consume(e.to_string())),
            })
            .boxed())
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }
}

struct AmqpAcker {
    acker: lapin::acker::Acker,
}

#[async_trait]
impl Acker for AmqpAcker {
    async fn ack(&self) -> TransportResult<()> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| TransportError::Ack(e.to_string()))
    }

    async fn nack(&self, requeue: bool) -> TransportResult<()> {
        let options = BasicNackOptions {
            requeue,
            ..BasicNackOptions::default()
        };
        self.acker
            .nack(options)
            .await
            .map_err(|e| TransportError::Ack(e.to_string()))
    }
}
