//! In-process partitioned message bus.
//!
//! Each topic has a fixed number of partitions, each a bounded channel.
//! Messages with the same key always land on the same partition, so their
//! relative order is preserved; nothing is ordered across partitions.

use crate::config::DispatchConfig;
use crate::dispatch::error::{DispatchError, DispatchResult};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tracing::{trace, warn};

/// One delivered message.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub topic: String,
    pub partition: usize,
    pub offset: u64,
    pub key: String,
    pub payload: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishReceipt {
    pub topic: String,
    pub partition: usize,
    pub offset: u64,
}

/// Publishing side of a message queue.
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    /// Publish `payload` under `key`, waiting at most the configured timeout
    /// for partition capacity.
    async fn publish(&self, topic: &str, key: &str, payload: Bytes)
        -> DispatchResult<PublishReceipt>;
}

struct Partition {
    sender: mpsc::Sender<Envelope>,
    receiver: Mutex<Option<mpsc::Receiver<Envelope>>>,
    /// Serializes producers so offsets follow channel order
    next_offset: tokio::sync::Mutex<u64>,
}

struct Topic {
    partitions: Vec<Partition>,
}

pub struct MessageBus {
    partitions: usize,
    capacity: usize,
    publish_timeout: Duration,
    topics: DashMap<String, Arc<Topic>>,
}

impl MessageBus {
    pub fn new(partitions: usize, capacity: usize, publish_timeout: Duration) -> Self {
        Self {
            partitions: partitions.max(1),
            capacity: capacity.max(1),
            publish_timeout,
            topics: DashMap::new(),
        }
    }

    pub fn from_config(config: &DispatchConfig) -> Self {
        Self::new(
            config.partitions,
            config.channel_capacity,
            config.publish_timeout(),
        )
    }

    /// Stable partition for `key`.
    pub fn partition_for(&self, key: &str) -> usize {
        let hash = blake3::hash(key.as_bytes());
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&hash.as_bytes()[..8]);
        (u64::from_le_bytes(prefix) % self.partitions as u64) as usize
    }

    /// Take the receiver of one partition (can only be called once per
    /// partition).
    pub fn subscribe(&self, topic: &str, partition: usize) -> DispatchResult<mpsc::Receiver<Envelope>> {
        let handle = self.topic(topic);
        let slot = handle
            .partitions
            .get(partition)
            .ok_or_else(|| DispatchError::InvalidPartition {
                topic: topic.to_string(),
                partition,
            })?;

        let receiver = slot.receiver
            .lock()
            .take()
            .ok_or_else(|| DispatchError::AlreadySubscribed {
                topic: topic.to_string(),
                partition,
            });
        receiver
    }

    /// Take the receivers of every partition of `topic`, in partition order.
    pub fn subscribe_all(&self, topic: &str) -> DispatchResult<Vec<mpsc::Receiver<Envelope>>> {
        (0..self.partitions)
            .map(|partition| self.subscribe(topic, partition))
            .collect()
    }

    /// Messages waiting in `topic` across all partitions.
    pub fn pending(&self, topic: &str) -> usize {
        self.topics
            .get(topic)
            .map(|t| {
                t.partitions
                    .iter()
                    .map(|p| p.sender.max_capacity() - p.sender.capacity())
                    .sum()
            })
            .unwrap_or(0)
    }

    fn topic(&self, name: &str) -> Arc<Topic> {
        self.topics
            .entry(name.to_string())
            .or_insert_with(|| {
                let partitions = (0..self.partitions)
                    .map(|_| {
                        let (sender, receiver) = mpsc::channel(self.capacity);
                        Partition {
                            sender,
                            receiver: Mutex::new(Some(receiver)),
                            next_offset: tokio::sync::Mutex::new(0),
                        }
                    })
                    .collect();
                Arc::new(Topic { partitions })
            })
            .clone()
    }
}

#[async_trait]
impl MessagePublisher for MessageBus {
    async fn publish(
        &self,
        topic: &str,
        key: &str,
        payload: Bytes,
    ) -> DispatchResult<PublishReceipt> {
        let partition = self.partition_for(key);
        let handle = self.topic(topic);
        let slot = &handle.partitions[partition];

        let mut next_offset = slot.next_offset.lock().await;
        let offset = *next_offset;
        let envelope = Envelope {
            topic: topic.to_string(),
            partition,
            offset,
            key: key.to_string(),
            payload,
        };

        match slot.sender.send_timeout(envelope, self.publish_timeout).await {
            Ok(()) => {
                *next_offset += 1;
                trace!(topic, partition, offset, key, "Message published");
                Ok(PublishReceipt {
                    topic: topic.to_string(),
                    partition,
                    offset,
                })
            }
            Err(SendTimeoutError::Timeout(_)) => {
                warn!(topic, partition, "Publish timed out, partition full");
                Err(DispatchError::Timeout {
                    topic: topic.to_string(),
                    partition,
                })
            }
            Err(SendTimeoutError::Closed(_)) => Err(DispatchError::Closed(topic.to_string())),
        }
    }
}
