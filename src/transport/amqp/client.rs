//! RabbitMQ implementation of the broker traits on top of `lapin`

use super::options::{configure_amqp_target, AmqpTarget};
use crate::config::{BrokerSection, ConfigError};
use crate::transport::{
    Broker, BrokerChannel, BrokerConnection, BrokerError, CloseCallback, DeliveryStream,
    ExchangeKind, ExchangeSpec, OutboundMessage, QueueInfo, QueueSpec, RawDelivery,
};
use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    BasicRejectOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions, QueueDeleteOptions,
};
use lapin::protocol::{AMQPErrorKind, AMQPSoftError};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, warn};

/// Delivery mode 2: the broker writes the message to disk
const PERSISTENT_DELIVERY_MODE: u8 = 2;

pub struct AmqpBroker {
    target: AmqpTarget,
}

impl AmqpBroker {
    pub fn from_config(config: &BrokerSection) -> Result<Self, ConfigError> {
        Ok(Self {
            target: configure_amqp_target(config)?,
        })
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    fn describe(&self) -> String {
        self.target.display().to_string()
    }

    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        debug!("Opening AMQP connection to {}", self.target.display());
        let connection = Connection::connect(self.target.uri(), ConnectionProperties::default())
            .await
            .map_err(BrokerError::connection_failed)?;

        let callbacks: Arc<Mutex<Vec<CloseCallback>>> = Arc::new(Mutex::new(Vec::new()));
        let on_error = callbacks.clone();
        connection.on_error(move |error| {
            let reason = error.to_string();
            let callbacks = on_error.lock().unwrap_or_else(PoisonError::into_inner);
            for callback in callbacks.iter() {
                callback(reason.clone());
            }
        });

        Ok(Arc::new(AmqpConnection {
            connection,
            callbacks,
        }))
    }
}

pub struct AmqpConnection {
    connection: Connection,
    callbacks: Arc<Mutex<Vec<CloseCallback>>>,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    fn is_open(&self) -> bool {
        self.connection.status().connected()
    }

    fn on_close(&self, callback: CloseCallback) {
        self.callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(callback);
    }

    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let channel = self.connection.create_channel().await.map_err(map_error)?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(map_error)?;
        Ok(Arc::new(AmqpChannel { channel }))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.connection
            .close(200, "client shutdown")
            .await
            .map_err(map_error)
    }
}

pub struct AmqpChannel {
    channel: Channel,
}

fn queue_arguments(spec: &QueueSpec) -> FieldTable {
    let mut arguments = FieldTable::default();
    if let Some(exchange) = &spec.dead_letter_exchange {
        arguments.insert(
            ShortString::from("x-dead-letter-exchange"),
            AMQPValue::LongString(LongString::from(exchange.clone())),
        );
    }
    arguments
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<(), BrokerError> {
        let kind = match spec.kind {
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        };
        self.channel
            .exchange_declare(
                &spec.name,
                kind,
                ExchangeDeclareOptions {
                    durable: spec.durable,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(map_error)
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<QueueInfo, BrokerError> {
        let queue = self
            .channel
            .queue_declare(
                &spec.name,
                QueueDeclareOptions {
                    durable: spec.durable,
                    auto_delete: spec.auto_delete,
                    ..QueueDeclareOptions::default()
                },
                queue_arguments(spec),
            )
            .await
            .map_err(map_error)?;

        Ok(QueueInfo {
            name: spec.name.clone(),
            message_count: queue.message_count(),
            consumer_count: queue.consumer_count(),
        })
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(map_error)
    }

    async fn inspect_queue(&self, queue: &str) -> Result<QueueInfo, BrokerError> {
        let info = self
            .channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    passive: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(map_error)?;

        Ok(QueueInfo {
            name: queue.to_string(),
            message_count: info.message_count(),
            consumer_count: info.consumer_count(),
        })
    }

    async fn delete_queue(&self, queue: &str, if_empty: bool) -> Result<u32, BrokerError> {
        self.channel
            .queue_delete(
                queue,
                QueueDeleteOptions {
                    if_empty,
                    ..QueueDeleteOptions::default()
                },
            )
            .await
            .map_err(map_error)
    }

    async fn publish(&self, message: OutboundMessage) -> Result<(), BrokerError> {
        let mut properties = BasicProperties::default();
        if message.persistent {
            properties = properties.with_delivery_mode(PERSISTENT_DELIVERY_MODE);
        }
        if let Some(content_type) = message.content_type {
            properties = properties.with_content_type(ShortString::from(content_type));
        }
        if let Some(message_id) = message.message_id {
            properties = properties.with_message_id(ShortString::from(message_id));
        }

        let confirm = self
            .channel
            .basic_publish(
                &message.exchange,
                &message.routing_key,
                BasicPublishOptions {
                    mandatory: message.mandatory,
                    ..BasicPublishOptions::default()
                },
                &message.payload,
                properties,
            )
            .await
            .map_err(map_error)?;

        match confirm.await.map_err(map_error)? {
            Confirmation::Ack(None) | Confirmation::NotRequested => Ok(()),
            Confirmation::Ack(Some(_returned)) => Err(BrokerError::Unroutable {
                exchange: message.exchange,
                routing_key: message.routing_key,
            }),
            Confirmation::Nack(_) => Err(BrokerError::Nacked),
        }
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError> {
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(map_error)
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, BrokerError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(map_error)?;

        Ok(consumer
            .map(|delivery| {
                delivery
                    .map(|d| RawDelivery {
                        delivery_tag: d.delivery_tag,
                        routing_key: d.routing_key.as_str().to_string(),
                        redelivered: d.redelivered,
                        payload: d.data,
                    })
                    .map_err(map_error)
            })
            .boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(map_error)
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        self.channel
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await
            .map_err(map_error)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if !self.is_open() {
            return Ok(());
        }
        if let Err(e) = self.channel.close(200, "channel closed by client").await {
            warn!("Error closing AMQP channel: {}", e);
        }
        Ok(())
    }
}

fn map_error(error: lapin::Error) -> BrokerError {
    match &error {
        lapin::Error::ProtocolError(amqp) => match amqp.kind() {
            AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND) => {
                BrokerError::NotFound(amqp.get_message().as_str().to_string())
            }
            AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED) => {
                BrokerError::PreconditionFailed(amqp.get_message().as_str().to_string())
            }
            _ => BrokerError::Protocol(error.to_string()),
        },
        lapin::Error::InvalidChannelState(_) | lapin::Error::InvalidConnectionState(_) => {
            BrokerError::ChannelClosed(error.to_string())
        }
        lapin::Error::IOError(_) => BrokerError::connection_failed(error),
        _ => BrokerError::Protocol(error.to_string()),
    }
}
