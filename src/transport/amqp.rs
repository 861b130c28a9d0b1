//! AMQP (RabbitMQ) transport.
//!
//! Each endpoint maps to one durable queue, named by the `queue_name`
//! property and addressed through the default exchange. Payloads travel as
//! JSON bodies; the message header travels as AMQP headers.
//!
//! Properties:
//! - `server_uri`: AMQP connection URL (e.g. `amqp://localhost:5672`)
//! - `queue_name`: queue carrying the endpoint's messages

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::{BackoffBuilder, ExponentialBuilder};
use deadpool_lapin::{Manager, Pool, PoolError};
use futures::StreamExt;
use lapin::{
    options::{
        BasicConsumeOptions, BasicPublishOptions, BasicQosOptions, BasicRejectOptions,
        QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties, Channel,
};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, error, info, warn, Instrument};

use super::{
    EndpointHandlerResult, MessageHandler, MessageReceiverFactory, MessageSender,
    MessageSenderFactory, ReceiverHandle, Result, TransportConfig, TransportError,
};
use crate::endpoint::EndpointDescriptor;
use crate::message::{MessageHeader, RawMessage};

/// Transport type name of the RabbitMQ transport.
pub const AMQP_TRANSPORT_NAME: &str = "rabbitMQ";

pub const SERVER_URI_KEY: &str = "server_uri";
pub const QUEUE_NAME_KEY: &str = "queue_name";

const TOKEN_HEADER: &str = "token";
const TRACE_ID_HEADER: &str = "trace_id";
const RUN_ID_HEADER: &str = "run_id";

const MAX_PUBLISH_RETRIES: usize = 5;
const POOL_SIZE: usize = 10;

// ============================================================================
// Wire format
// ============================================================================

/// Encode a message header as AMQP headers.
fn encode_headers(header: &MessageHeader) -> FieldTable {
    let mut headers = FieldTable::default();
    headers.insert(
        ShortString::from(TOKEN_HEADER),
        AMQPValue::LongString(header.token.clone().into()),
    );
    headers.insert(
        ShortString::from(TRACE_ID_HEADER),
        AMQPValue::LongString(header.trace_id.clone().into()),
    );
    if let Some(run_id) = header.run_id {
        headers.insert(
            ShortString::from(RUN_ID_HEADER),
            AMQPValue::LongLongInt(run_id),
        );
    }
    headers
}

fn header_string(headers: &FieldTable, key: &str) -> Option<String> {
    match headers.inner().get(key)? {
        AMQPValue::LongString(s) => std::str::from_utf8(s.as_bytes()).ok().map(str::to_string),
        AMQPValue::ShortString(s) => Some(s.as_str().to_string()),
        _ => None,
    }
}

fn header_i64(headers: &FieldTable, key: &str) -> Option<i64> {
    match headers.inner().get(key)? {
        AMQPValue::LongLongInt(n) => Some(*n),
        AMQPValue::LongInt(n) => Some(i64::from(*n)),
        AMQPValue::LongString(s) => std::str::from_utf8(s.as_bytes()).ok()?.parse().ok(),
        _ => None,
    }
}

/// Rebuild a message from delivery headers and a JSON body.
fn decode_delivery(headers: Option<&FieldTable>, body: &[u8]) -> Result<RawMessage> {
    let headers = headers
        .ok_or_else(|| TransportError::Receive("delivery carries no headers".to_string()))?;
    let trace_id = header_string(headers, TRACE_ID_HEADER).ok_or_else(|| {
        TransportError::Receive(format!("delivery lacks the '{}' header", TRACE_ID_HEADER))
    })?;

    let header = MessageHeader {
        token: header_string(headers, TOKEN_HEADER).unwrap_or_default(),
        trace_id,
        run_id: header_i64(headers, RUN_ID_HEADER),
    };
    Ok(RawMessage::new(header, serde_json::from_slice(body)?))
}

// ============================================================================
// Connection pools
// ============================================================================

/// Connection pools shared by all endpoints talking to the same server.
#[derive(Clone, Default)]
struct Pools {
    pools: Arc<Mutex<HashMap<String, Pool>>>,
}

impl Pools {
    async fn get(&self, server_uri: &str) -> Result<Pool> {
        let mut pools = self.pools.lock().await;
        if let Some(pool) = pools.get(server_uri) {
            return Ok(pool.clone());
        }

        let manager = Manager::new(server_uri.to_string(), Default::default());
        let pool = Pool::builder(manager)
            .max_size(POOL_SIZE)
            .build()
            .map_err(|e| TransportError::Connection(format!("Failed to create pool: {}", e)))?;
        pools.insert(server_uri.to_string(), pool.clone());
        Ok(pool)
    }
}

async fn open_channel(pool: &Pool) -> Result<Channel> {
    let conn = pool.get().await.map_err(|e: PoolError| {
        TransportError::Connection(format!("Failed to get connection from pool: {}", e))
    })?;

    conn.create_channel()
        .await
        .map_err(|e| TransportError::Connection(format!("Failed to create channel: {}", e)))
}

async fn declare_queue(channel: &Channel, queue: &str) -> Result<()> {
    channel
        .queue_declare(
            queue,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map(|_| ())
        .map_err(|e| TransportError::Connection(format!("Failed to declare queue: {}", e)))
}

// ============================================================================
// Sender
// ============================================================================

/// Builds senders publishing to an endpoint's queue.
#[derive(Default)]
pub struct AmqpSenderFactory {
    pools: Pools,
}

impl AmqpSenderFactory {
    pub fn new() -> Self {
        Self::default()
    }
}

struct AmqpSender {
    endpoint: &'static str,
    pool: Pool,
    queue: String,
}

#[async_trait]
impl MessageSender for AmqpSender {
    #[tracing::instrument(name = "amqp.send", skip_all, fields(endpoint = %self.endpoint, queue = %self.queue))]
    async fn send(&self, message: RawMessage) -> Result<()> {
        let payload = serde_json::to_vec(&message.payload)?;
        let headers = encode_headers(&message.header);

        // Exponential backoff with jitter
        let backoff = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(5))
            .with_max_times(MAX_PUBLISH_RETRIES)
            .with_jitter()
            .build();

        let mut last_error = None;

        for (attempt, delay) in std::iter::once(Duration::ZERO).chain(backoff).enumerate() {
            if attempt > 0 {
                tokio::time::sleep(delay).await;
            }

            // Fresh channel per attempt
            let channel = match open_channel(&self.pool).await {
                Ok(channel) => channel,
                Err(e) => {
                    warn!(attempt = attempt + 1, error = %e, "Failed to get channel, retrying");
                    last_error = Some(e);
                    continue;
                }
            };

            if let Err(e) = declare_queue(&channel, &self.queue).await {
                warn!(attempt = attempt + 1, error = %e, "Failed to declare queue, retrying");
                last_error = Some(e);
                continue;
            }

            let properties = BasicProperties::default()
                .with_content_type("application/json".into())
                .with_delivery_mode(2) // persistent
                .with_headers(headers.clone());

            match channel
                .basic_publish(
                    "",
                    &self.queue,
                    BasicPublishOptions::default(),
                    &payload,
                    properties,
                )
                .await
            {
                Ok(confirm) => match confirm.await {
                    Ok(_) => {
                        debug!(trace_id = %message.header.trace_id, "Published message");
                        return Ok(());
                    }
                    Err(e) => {
                        warn!(
                            attempt = attempt + 1,
                            error = %e,
                            "Publish confirmation failed, retrying"
                        );
                        last_error = Some(TransportError::Send(format!(
                            "Publish confirmation failed: {}",
                            e
                        )));
                    }
                },
                Err(e) => {
                    warn!(attempt = attempt + 1, error = %e, "Publish failed, retrying");
                    last_error = Some(TransportError::Send(format!("Failed to publish: {}", e)));
                }
            }
        }

        let err =
            last_error.unwrap_or_else(|| TransportError::Send("Max retries exceeded".to_string()));
        error!(error = %err, "Giving up publishing message");
        Err(err)
    }
}

#[async_trait]
impl MessageSenderFactory for AmqpSenderFactory {
    fn name(&self) -> &str {
        AMQP_TRANSPORT_NAME
    }

    async fn create_sender(
        &self,
        endpoint: &'static EndpointDescriptor,
        config: &TransportConfig,
    ) -> Result<Arc<dyn MessageSender>> {
        let server_uri = config.require(SERVER_URI_KEY)?;
        let queue = config.require(QUEUE_NAME_KEY)?.to_string();
        let pool = self.pools.get(server_uri).await?;

        info!(endpoint = %endpoint, queue = %queue, "AMQP sender created");

        Ok(Arc::new(AmqpSender {
            endpoint: endpoint.name(),
            pool,
            queue,
        }))
    }
}

// ============================================================================
// Receiver
// ============================================================================

/// Installs consumers on an endpoint's queue.
#[derive(Default)]
pub struct AmqpReceiverFactory {
    pools: Pools,
}

impl AmqpReceiverFactory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageReceiverFactory for AmqpReceiverFactory {
    fn name(&self) -> &str {
        AMQP_TRANSPORT_NAME
    }

    async fn create_receiver(
        &self,
        endpoint: &'static EndpointDescriptor,
        config: &TransportConfig,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<ReceiverHandle> {
        let server_uri = config.require(SERVER_URI_KEY)?;
        let queue = config.require(QUEUE_NAME_KEY)?.to_string();
        let pool = self.pools.get(server_uri).await?;

        Ok(ReceiverHandle::spawn(endpoint, move |shutdown| {
            consume_with_reconnect(endpoint, pool, queue, handler, shutdown)
        }))
    }
}

/// Consumer loop with automatic reconnection and exponential backoff with jitter.
async fn consume_with_reconnect(
    endpoint: &'static EndpointDescriptor,
    pool: Pool,
    queue: String,
    handler: Arc<dyn MessageHandler>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let backoff_builder = ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(30))
        .with_jitter();

    let mut backoff_iter = backoff_builder.build();

    loop {
        let setup = tokio::select! {
            _ = &mut shutdown => return,
            setup = setup_consumer(&pool, &queue, endpoint) => setup,
        };

        match setup {
            Ok(mut consumer) => {
                info!(
                    endpoint = %endpoint,
                    queue = %queue,
                    "Consumer connected, processing messages"
                );
                backoff_iter = backoff_builder.build();

                loop {
                    let delivery = tokio::select! {
                        _ = &mut shutdown => return,
                        delivery = consumer.next() => delivery,
                    };

                    match delivery {
                        Some(Ok(delivery)) => {
                            if process_delivery(endpoint, delivery, &handler).await
                                == EndpointHandlerResult::Stop
                            {
                                info!(
                                    endpoint = %endpoint,
                                    "Handler requested stop, ending consumer"
                                );
                                return;
                            }
                        }
                        Some(Err(e)) => {
                            error!(error = %e, "Consumer delivery error, will reconnect");
                            break;
                        }
                        None => {
                            info!(queue = %queue, "Consumer stream ended, reconnecting");
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                error!(
                    error = %e,
                    queue = %queue,
                    "Failed to set up consumer, retrying after backoff"
                );
            }
        }

        let delay = backoff_iter.next().unwrap_or(Duration::from_secs(30));
        tokio::select! {
            _ = &mut shutdown => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

async fn setup_consumer(
    pool: &Pool,
    queue: &str,
    endpoint: &EndpointDescriptor,
) -> Result<lapin::Consumer> {
    let channel = open_channel(pool).await?;

    channel
        .basic_qos(1, BasicQosOptions::default())
        .await
        .map_err(|e| TransportError::Connection(format!("Failed to set prefetch: {}", e)))?;

    declare_queue(&channel, queue).await?;

    channel
        .basic_consume(
            queue,
            &format!("scanbus-{}", endpoint),
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(|e| TransportError::Connection(format!("Failed to start consumer: {}", e)))
}

/// Handle one delivery. Undecodable deliveries are rejected without requeue
/// so they cannot block the queue.
async fn process_delivery(
    endpoint: &EndpointDescriptor,
    delivery: lapin::message::Delivery,
    handler: &Arc<dyn MessageHandler>,
) -> EndpointHandlerResult {
    let message = match decode_delivery(delivery.properties.headers().as_ref(), &delivery.data) {
        Ok(message) => message,
        Err(e) => {
            error!(endpoint = %endpoint, error = %e, "Failed to decode delivery, rejecting");
            if let Err(e) = delivery
                .reject(BasicRejectOptions { requeue: false })
                .await
            {
                error!(error = %e, "Failed to reject delivery");
            }
            return EndpointHandlerResult::Continue;
        }
    };

    let span = tracing::info_span!(
        "amqp.receive",
        endpoint = %endpoint,
        trace_id = %message.header.trace_id
    );
    let result = handler.handle(message).instrument(span).await;

    if let Err(e) = delivery.ack(Default::default()).await {
        error!(error = %e, "Failed to ack delivery");
    }
    result
}
