// Stream client: construction, publish, subscribe handshake, close.
use bytes::Bytes;
use rill_envelope::Envelope;
use rill_gateway::{GatewayConnector, LogGateway, OffsetReset};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::ClientConfig;
use crate::handler::{CancelHandle, ErrorHandler, EventHandler};
use crate::subscription::{Subscription, SubscriptionLoop};
use crate::{Error, Result};

// Breaks timestamp ties so ids stay unique under concurrent publishes.
static PUBLISH_SEQ: AtomicU64 = AtomicU64::new(0);

/// Client bound to one gateway address and one topic.
///
/// The acceptable content type is fixed at construction; every publish must
/// match it (parameters after `;` ignored). The gateway handle is shared by
/// publishes and all subscription loops; apart from the closed flag, fields
/// are read-only after construction.
pub struct StreamClient {
    gateway_addr: String,
    topic: String,
    acceptable_content_type: String,
    id_prefix: String,
    gateway: Arc<dyn LogGateway>,
    // Parent of every subscription's cancellation token.
    root: CancellationToken,
    closed: AtomicBool,
}

/// Position assigned to a published record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishResult {
    pub partition: u32,
    pub offset: u64,
}

impl StreamClient {
    /// Connects to the gateway, blocking until ready or until the default
    /// timeout (one minute) elapses.
    pub async fn connect(
        connector: &dyn GatewayConnector,
        gateway_addr: &str,
        topic: &str,
        acceptable_content_type: &str,
    ) -> Result<Self> {
        Self::connect_with_config(
            connector,
            gateway_addr,
            topic,
            acceptable_content_type,
            ClientConfig::default(),
        )
        .await
    }

    pub async fn connect_with_config(
        connector: &dyn GatewayConnector,
        gateway_addr: &str,
        topic: &str,
        acceptable_content_type: &str,
        config: ClientConfig,
    ) -> Result<Self> {
        let gateway = timeout(config.connect_timeout, connector.connect(gateway_addr))
            .await
            .map_err(|_| Error::ConnectTimeout {
                addr: gateway_addr.to_string(),
                timeout: config.connect_timeout,
            })?
            .map_err(Error::Connect)?;
        debug!(addr = gateway_addr, topic, "connected to gateway");
        Ok(Self {
            gateway_addr: gateway_addr.to_string(),
            topic: topic.to_string(),
            acceptable_content_type: acceptable_content_type.to_string(),
            id_prefix: config.id_prefix,
            gateway,
            root: CancellationToken::new(),
            closed: AtomicBool::new(false),
        })
    }

    pub fn gateway_addr(&self) -> &str {
        &self.gateway_addr
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn acceptable_content_type(&self) -> &str {
        &self.acceptable_content_type
    }

    /// Publishes one event and returns its assigned position.
    ///
    /// The payload stream is read fully into memory, wrapped in an envelope
    /// together with the headers (carried as envelope extension attributes),
    /// and the envelope's serialized form is written as the record value.
    /// The first failing step aborts the call; nothing is retried.
    pub async fn publish<P, K>(
        &self,
        payload: P,
        key: Option<K>,
        content_type: &str,
        headers: Option<&HashMap<String, String>>,
    ) -> Result<PublishResult>
    where
        P: AsyncRead + Unpin + Send,
        K: AsyncRead + Unpin + Send,
    {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        if chop_content_type(content_type) != chop_content_type(&self.acceptable_content_type) {
            return Err(Error::IncompatibleContentType {
                offered: content_type.to_string(),
                required: self.acceptable_content_type.clone(),
            });
        }

        let mut envelope = Envelope::new(self.next_event_id());
        // The envelope carries the full content type, parameters included.
        envelope.set_content_type(content_type);
        if let Some(headers) = headers {
            for (name, value) in headers {
                envelope.set_extension(name, value);
            }
        }
        let mut payload = payload;
        let mut data = Vec::new();
        payload
            .read_to_end(&mut data)
            .await
            .map_err(Error::PayloadRead)?;
        envelope.set_data(Bytes::from(data));
        // Validates before serializing; either failure aborts the publish
        // with no remote call made.
        let value = envelope.to_bytes()?;

        let key_bytes = match key {
            Some(mut reader) => {
                let mut buf = Vec::new();
                reader.read_to_end(&mut buf).await.map_err(Error::KeyRead)?;
                Bytes::from(buf)
            }
            None => Bytes::new(),
        };

        let reply = self.gateway.publish(&self.topic, value, key_bytes).await?;
        debug!(
            topic = %self.topic,
            partition = reply.partition,
            offset = reply.offset,
            "published event"
        );
        Ok(PublishResult {
            partition: reply.partition,
            offset: reply.offset,
        })
    }

    /// Subscribes to the client's topic after the given offset (zero reads
    /// from the beginning) and starts the background consume loop.
    ///
    /// The handshake runs before this returns: join the group, read the
    /// partition assignment, open the positioned record stream. A handshake
    /// failure is returned directly and no loop is started. On success the
    /// returned [`Subscription`] is the only foreground artifact; records
    /// and failures flow through the two handlers.
    pub async fn subscribe(
        &self,
        group: &str,
        offset: u64,
        handler: Arc<dyn EventHandler>,
        error_handler: Arc<dyn ErrorHandler>,
    ) -> Result<Subscription> {
        // The child token is the subscription's lifetime boundary,
        // independent of anything else the caller does with the client.
        let cancel = CancelHandle::new(self.root.child_token());

        let mut assignments = self
            .gateway
            .subscribe(&self.topic, group, OffsetReset::Earliest)
            .await?;
        let assignment = assignments.recv().await?;
        debug!(
            topic = %self.topic,
            group,
            partition = assignment.partition(),
            "received partition assignment"
        );
        let records = self.gateway.receive(assignment, offset).await?;

        Ok(Subscription::spawn(SubscriptionLoop {
            gateway: Arc::clone(&self.gateway),
            topic: self.topic.clone(),
            group: group.to_string(),
            records,
            cancel,
            handler,
            error_handler,
        }))
    }

    /// Releases the gateway connection. Idempotent. Publishing afterwards
    /// fails with [`Error::Closed`]; live subscriptions are not torn down
    /// here, the severed connection surfaces through their error handlers
    /// on the next pull.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.gateway.close().await?;
        debug!(addr = %self.gateway_addr, "gateway connection released");
        Ok(())
    }

    fn next_event_id(&self) -> String {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let seq = PUBLISH_SEQ.fetch_add(1, Ordering::Relaxed);
        format!("{}-{nanos}-{seq}", self.id_prefix)
    }
}

// The gateway handle and cancellation token are not Debug; show the
// client's identity instead.
impl std::fmt::Debug for StreamClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamClient")
            .field("gateway_addr", &self.gateway_addr)
            .field("topic", &self.topic)
            .field("acceptable_content_type", &self.acceptable_content_type)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

// Parameters after ';' do not affect compatibility.
fn chop_content_type(content_type: &str) -> &str {
    content_type.split(';').next().unwrap_or(content_type)
}
