// In-process gateway used by tests and demos.
//
// Single partition per topic, offsets assigned from zero, read progress
// tracked per (topic, group). Topics are created on first use, matching the
// auto-create behavior of the remote gateway.
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tracing::debug;

use crate::{
    Assignment, Error, GatewayConnector, LogGateway, OffsetReset, PublishReply, Record,
    RecordStream, Result, SubscribeStream,
};
use async_trait::async_trait;

struct TopicLog {
    records: Mutex<Vec<Bytes>>,
    // Wakes receivers blocked waiting for an append (or for close).
    appended: Notify,
}

impl TopicLog {
    fn new() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            appended: Notify::new(),
        }
    }

    fn record_at(&self, offset: u64) -> Option<Record> {
        let records = self.records.lock().expect("topic log poisoned");
        records.get(offset as usize).map(|value| Record {
            offset,
            value: value.clone(),
        })
    }
}

/// A [`LogGateway`] that lives entirely in this process.
pub struct MemoryGateway {
    topics: Mutex<HashMap<String, Arc<TopicLog>>>,
    // Last acked offset per (topic, group).
    acked: Mutex<HashMap<(String, String), u64>>,
    closed: Arc<AtomicBool>,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            acked: Mutex::new(HashMap::new()),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    fn topic(&self, name: &str) -> Arc<TopicLog> {
        let mut topics = self.topics.lock().expect("topics poisoned");
        Arc::clone(
            topics
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(TopicLog::new())),
        )
    }

    fn existing_topic(&self, name: &str) -> Option<Arc<TopicLog>> {
        let topics = self.topics.lock().expect("topics poisoned");
        topics.get(name).cloned()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ConnectionClosed);
        }
        Ok(())
    }

    /// Records currently stored for `topic`. Test and diagnostic visibility.
    pub fn records(&self, topic: &str) -> Vec<Record> {
        match self.existing_topic(topic) {
            Some(log) => {
                let records = log.records.lock().expect("topic log poisoned");
                records
                    .iter()
                    .enumerate()
                    .map(|(index, value)| Record {
                        offset: index as u64,
                        value: value.clone(),
                    })
                    .collect()
            }
            None => Vec::new(),
        }
    }

    /// Last offset acknowledged by `group` on `topic`, if any.
    pub fn acked_offset(&self, topic: &str, group: &str) -> Option<u64> {
        let acked = self.acked.lock().expect("acked poisoned");
        acked.get(&(topic.to_string(), group.to_string())).copied()
    }
}

impl Default for MemoryGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LogGateway for MemoryGateway {
    // The key picks a partition on the remote gateway; with a single
    // partition it is accepted and unused.
    async fn publish(&self, topic: &str, value: Bytes, _key: Bytes) -> Result<PublishReply> {
        self.ensure_open()?;
        let log = self.topic(topic);
        let offset = {
            let mut records = log.records.lock().expect("topic log poisoned");
            records.push(value);
            (records.len() - 1) as u64
        };
        log.appended.notify_waiters();
        debug!(topic, offset, "memory gateway stored record");
        Ok(PublishReply {
            partition: 0,
            offset,
        })
    }

    async fn subscribe(
        &self,
        topic: &str,
        group: &str,
        _reset: OffsetReset,
    ) -> Result<Box<dyn SubscribeStream>> {
        self.ensure_open()?;
        // Topics come into being on first subscribe as well as first publish.
        self.topic(topic);
        Ok(Box::new(MemorySubscribeStream {
            assignment: Some(Assignment::new(topic, group, 0)),
        }))
    }

    async fn receive(
        &self,
        assignment: Assignment,
        last_known_offset: u64,
    ) -> Result<Box<dyn RecordStream>> {
        self.ensure_open()?;
        let log = self
            .existing_topic(assignment.topic())
            .ok_or_else(|| Error::UnknownTopic(assignment.topic().to_string()))?;
        // Zero means read from the beginning; anything else resumes after
        // the last known offset.
        let next = if last_known_offset == 0 {
            0
        } else {
            last_known_offset + 1
        };
        Ok(Box::new(MemoryRecordStream {
            log,
            next,
            closed: Arc::clone(&self.closed),
        }))
    }

    async fn ack(&self, topic: &str, group: &str, offset: u64) -> Result<()> {
        self.ensure_open()?;
        let mut acked = self.acked.lock().expect("acked poisoned");
        acked.insert((topic.to_string(), group.to_string()), offset);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        // Wake every blocked receiver so it can observe the severed
        // connection.
        let topics = self.topics.lock().expect("topics poisoned");
        for log in topics.values() {
            log.appended.notify_waiters();
        }
        Ok(())
    }
}

struct MemorySubscribeStream {
    assignment: Option<Assignment>,
}

#[async_trait]
impl SubscribeStream for MemorySubscribeStream {
    async fn recv(&mut self) -> Result<Assignment> {
        // Exactly one reply; the stream is exhausted afterwards.
        self.assignment.take().ok_or(Error::StreamClosed)
    }
}

struct MemoryRecordStream {
    log: Arc<TopicLog>,
    next: u64,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl RecordStream for MemoryRecordStream {
    async fn recv(&mut self) -> Result<Record> {
        loop {
            // Register for the wakeup before checking state, otherwise an
            // append landing between the check and the await is lost.
            let notified = self.log.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(record) = self.log.record_at(self.next) {
                self.next += 1;
                return Ok(record);
            }
            if self.closed.load(Ordering::Acquire) {
                return Err(Error::ConnectionClosed);
            }
            notified.await;
        }
    }
}

/// Hands out in-process gateways keyed by address, so two addresses are two
/// fully isolated logs while clients of one address share state.
#[derive(Default)]
pub struct MemoryHub {
    gateways: Mutex<HashMap<String, Arc<MemoryGateway>>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// The gateway behind `addr`, created on first use. Tests use this to
    /// inspect stored records and acked offsets directly.
    pub fn gateway(&self, addr: &str) -> Arc<MemoryGateway> {
        let mut gateways = self.gateways.lock().expect("gateways poisoned");
        Arc::clone(
            gateways
                .entry(addr.to_string())
                .or_insert_with(|| Arc::new(MemoryGateway::new())),
        )
    }
}

#[async_trait]
impl GatewayConnector for MemoryHub {
    async fn connect(&self, addr: &str) -> Result<Arc<dyn LogGateway>> {
        Ok(self.gateway(addr))
    }
}
