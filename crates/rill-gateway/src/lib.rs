// Interface to the remote gateway brokering access to the partitioned log.
//
// The stream client consumes exactly four gateway operations: publish,
// subscribe (yielding a partition assignment), receive (a positioned record
// stream), and ack. Everything transport-specific lives behind these traits;
// implementations must be safe for concurrent use by publishes and multiple
// subscription loops sharing one connection.
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

pub mod memory;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to connect to gateway at {0}")]
    Connect(String),
    #[error("gateway call failed: {0}")]
    Remote(String),
    #[error("gateway connection is closed")]
    ConnectionClosed,
    #[error("record stream ended")]
    StreamClosed,
    #[error("unknown topic {0:?}")]
    UnknownTopic(String),
}

/// Opaque token identifying the partition a subscription has been granted.
///
/// Whatever the gateway hands back from [`LogGateway::subscribe`] must be
/// threaded unchanged into [`LogGateway::receive`]; clients never construct
/// or inspect one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    topic: String,
    group: String,
    partition: u32,
    session: Uuid,
}

impl Assignment {
    /// Gateway implementations mint assignments; clients only carry them.
    pub fn new(topic: impl Into<String>, group: impl Into<String>, partition: u32) -> Self {
        Self {
            topic: topic.into(),
            group: group.into(),
            partition,
            session: Uuid::new_v4(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn partition(&self) -> u32 {
        self.partition
    }
}

/// Where a consumer group with no stored progress starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetReset {
    Earliest,
    Latest,
}

/// Result of a successful publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishReply {
    pub partition: u32,
    pub offset: u64,
}

/// One record pulled from a receive stream: its position and the serialized
/// envelope bytes stored as the record value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub offset: u64,
    pub value: Bytes,
}

/// Reply stream opened by [`LogGateway::subscribe`]; read exactly once for
/// the partition assignment.
#[async_trait]
pub trait SubscribeStream: Send {
    async fn recv(&mut self) -> Result<Assignment>;
}

/// Record stream opened by [`LogGateway::receive`]; pulled one record at a
/// time. A stream that ends cleanly reports [`Error::StreamClosed`].
#[async_trait]
pub trait RecordStream: Send {
    async fn recv(&mut self) -> Result<Record>;
}

/// The gateway's procedural interface.
#[async_trait]
pub trait LogGateway: Send + Sync {
    /// Appends `value` (keyed by `key`, which may be empty) to `topic`.
    async fn publish(&self, topic: &str, value: Bytes, key: Bytes) -> Result<PublishReply>;

    /// Joins `group` on `topic` and opens the assignment stream.
    async fn subscribe(
        &self,
        topic: &str,
        group: &str,
        reset: OffsetReset,
    ) -> Result<Box<dyn SubscribeStream>>;

    /// Opens a record stream positioned by `last_known_offset`: zero means
    /// read from the beginning, any other value resumes after it.
    async fn receive(
        &self,
        assignment: Assignment,
        last_known_offset: u64,
    ) -> Result<Box<dyn RecordStream>>;

    /// Records read progress for `group` on `topic` up to `offset`.
    async fn ack(&self, topic: &str, group: &str, offset: u64) -> Result<()>;

    /// Severs the connection. Subsequent calls fail and open record streams
    /// report [`Error::ConnectionClosed`] on their next pull.
    async fn close(&self) -> Result<()>;
}

/// Establishes gateway connections for a given address.
#[async_trait]
pub trait GatewayConnector: Send + Sync {
    async fn connect(&self, addr: &str) -> Result<Arc<dyn LogGateway>>;
}
