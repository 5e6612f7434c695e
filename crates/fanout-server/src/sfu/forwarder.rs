//! RTP forwarder
//!
//! One actor task per stream owns the subscriber set. Every subscribe,
//! unsubscribe, publish and close goes through a single ordered command
//! queue, so the subscriber map needs no lock. Each subscriber gets its own
//! bounded queue and consumer task; a full queue only affects that subscriber.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;

use crate::error::Result;

const COMMAND_QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Video,
}

impl From<RTPCodecType> for MediaKind {
    fn from(kind: RTPCodecType) -> Self {
        match kind {
            RTPCodecType::Audio => MediaKind::Audio,
            _ => MediaKind::Video,
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => f.write_str("audio"),
            MediaKind::Video => f.write_str("video"),
        }
    }
}

/// An RTP packet tagged with the kind of track it came from
#[derive(Debug, Clone)]
pub struct MediaPacket {
    pub kind: MediaKind,
    pub packet: Packet,
}

impl MediaPacket {
    pub fn new(kind: MediaKind, packet: Packet) -> Self {
        Self { kind, packet }
    }
}

/// Receives packets fanned out by a forwarder
#[async_trait]
pub trait PacketSink: Send + Sync {
    async fn deliver(&self, packet: MediaPacket) -> Result<()>;
}

/// What to do when a subscriber's queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Discard the packet for that subscriber only
    #[default]
    DropNewest,
    /// Remove the subscriber
    Disconnect,
}

impl FromStr for OverflowPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "drop-newest" | "drop" => Ok(OverflowPolicy::DropNewest),
            "disconnect" => Ok(OverflowPolicy::Disconnect),
            other => Err(anyhow::anyhow!("unknown overflow policy: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ForwarderConfig {
    pub queue_capacity: usize,
    pub overflow_policy: OverflowPolicy,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1000,
            overflow_policy: OverflowPolicy::DropNewest,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ForwarderStats {
    pub stream_id: String,
    pub subscribers: usize,
    pub published: u64,
    pub dropped: u64,
    pub created_at: DateTime<Utc>,
}

type SinkSnapshot = Vec<(String, Arc<dyn PacketSink>)>;

enum Command {
    Subscribe {
        subscriber_id: String,
        sink: Arc<dyn PacketSink>,
    },
    Unsubscribe {
        subscriber_id: String,
    },
    Publish(MediaPacket),
    Snapshot {
        reply: oneshot::Sender<SinkSnapshot>,
    },
    Stats {
        reply: oneshot::Sender<ForwarderStats>,
    },
    Close {
        done: oneshot::Sender<()>,
    },
}

struct Subscriber {
    queue: mpsc::Sender<MediaPacket>,
    sink: Arc<dyn PacketSink>,
    task: JoinHandle<()>,
}

/// Publish/subscribe actor for one stream
pub struct RtpForwarder {
    id: String,
    commands: mpsc::Sender<Command>,
    closed: AtomicBool,
}

impl RtpForwarder {
    /// Create the forwarder and start its actor task
    pub fn spawn(id: impl Into<String>, config: ForwarderConfig) -> Arc<Self> {
        let id = id.into();
        let (commands, rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);

        let actor = ForwarderActor {
            stream_id: id.clone(),
            config,
            subscribers: HashMap::new(),
            published: 0,
            dropped: 0,
            created_at: Utc::now(),
        };
        tokio::spawn(actor.run(rx));

        tracing::info!(stream_id = %id, "Forwarder started");

        Arc::new(Self {
            id,
            commands,
            closed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub async fn publish(&self, packet: MediaPacket) {
        if self.is_closed() {
            tracing::debug!(stream_id = %self.id, "Publish on closed forwarder ignored");
            return;
        }
        self.send(Command::Publish(packet)).await;
    }

    /// Install `sink` under `subscriber_id`, replacing any previous one
    pub async fn subscribe(&self, subscriber_id: impl Into<String>, sink: Arc<dyn PacketSink>) {
        let subscriber_id = subscriber_id.into();
        if self.is_closed() {
            tracing::warn!(
                stream_id = %self.id,
                subscriber_id = %subscriber_id,
                "Subscribe on closed forwarder ignored"
            );
            return;
        }
        self.send(Command::Subscribe {
            subscriber_id,
            sink,
        })
        .await;
    }

    pub async fn unsubscribe(&self, subscriber_id: &str) {
        if self.is_closed() {
            return;
        }
        self.send(Command::Unsubscribe {
            subscriber_id: subscriber_id.to_string(),
        })
        .await;
    }

    /// Re-create every live subscription on `other`. Returns how many moved.
    pub async fn transfer_subscriptions_to(&self, other: &RtpForwarder) -> usize {
        let (reply, rx) = oneshot::channel();
        if !self.send(Command::Snapshot { reply }).await {
            return 0;
        }
        let snapshot = rx.await.unwrap_or_default();
        let moved = snapshot.len();
        for (subscriber_id, sink) in snapshot {
            other.subscribe(subscriber_id, sink).await;
        }
        tracing::info!(
            stream_id = %self.id,
            moved,
            "Transferred subscriptions to replacement forwarder"
        );
        moved
    }

    pub async fn stats(&self) -> Option<ForwarderStats> {
        let (reply, rx) = oneshot::channel();
        if !self.send(Command::Stats { reply }).await {
            return None;
        }
        rx.await.ok()
    }

    /// Stop accepting work and let subscriber queues drain. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let (done, rx) = oneshot::channel();
        if self.send(Command::Close { done }).await {
            let _ = rx.await;
        }
        tracing::info!(stream_id = %self.id, "Forwarder closed");
    }

    async fn send(&self, command: Command) -> bool {
        if self.commands.send(command).await.is_err() {
            tracing::warn!(stream_id = %self.id, "Forwarder actor is gone");
            return false;
        }
        true
    }
}

struct ForwarderActor {
    stream_id: String,
    config: ForwarderConfig,
    subscribers: HashMap<String, Subscriber>,
    published: u64,
    dropped: u64,
    created_at: DateTime<Utc>,
}

impl ForwarderActor {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        while let Some(command) = rx.recv().await {
            match command {
                Command::Subscribe {
                    subscriber_id,
                    sink,
                } => self.add_subscriber(subscriber_id, sink),
                Command::Unsubscribe { subscriber_id } => {
                    if let Some(subscriber) = self.subscribers.remove(&subscriber_id) {
                        subscriber.task.abort();
                        tracing::info!(
                            stream_id = %self.stream_id,
                            subscriber_id = %subscriber_id,
                            "Subscriber removed"
                        );
                    }
                }
                Command::Publish(packet) => self.fan_out(packet),
                Command::Snapshot { reply } => {
                    let snapshot = self
                        .subscribers
                        .iter()
                        .map(|(id, subscriber)| (id.clone(), subscriber.sink.clone()))
                        .collect();
                    let _ = reply.send(snapshot);
                }
                Command::Stats { reply } => {
                    let _ = reply.send(ForwarderStats {
                        stream_id: self.stream_id.clone(),
                        subscribers: self.subscribers.len(),
                        published: self.published,
                        dropped: self.dropped,
                        created_at: self.created_at,
                    });
                }
                Command::Close { done } => {
                    // Dropping the queue senders lets each consumer finish
                    // what is already queued and exit.
                    self.subscribers.clear();
                    let _ = done.send(());
                    break;
                }
            }
        }
    }

    fn add_subscriber(&mut self, subscriber_id: String, sink: Arc<dyn PacketSink>) {
        if let Some(previous) = self.subscribers.remove(&subscriber_id) {
            previous.task.abort();
        }

        let (queue, mut rx) = mpsc::channel::<MediaPacket>(self.config.queue_capacity);
        let consumer_sink = sink.clone();
        let stream_id = self.stream_id.clone();
        let consumer_id = subscriber_id.clone();
        let task = tokio::spawn(async move {
            while let Some(packet) = rx.recv().await {
                if let Err(e) = consumer_sink.deliver(packet).await {
                    tracing::warn!(
                        stream_id = %stream_id,
                        subscriber_id = %consumer_id,
                        "Failed to deliver packet: {}",
                        e
                    );
                }
            }
        });

        tracing::info!(
            stream_id = %self.stream_id,
            subscriber_id = %subscriber_id,
            subscribers = self.subscribers.len() + 1,
            "Subscriber added"
        );

        self.subscribers
            .insert(subscriber_id, Subscriber { queue, sink, task });
    }

    fn fan_out(&mut self, packet: MediaPacket) {
        self.published += 1;
        let mut evicted = Vec::new();

        for (subscriber_id, subscriber) in &self.subscribers {
            match subscriber.queue.try_send(packet.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    self.dropped += 1;
                    match self.config.overflow_policy {
                        OverflowPolicy::DropNewest => {
                            if self.dropped % 100 == 1 {
                                tracing::warn!(
                                    stream_id = %self.stream_id,
                                    subscriber_id = %subscriber_id,
                                    dropped = self.dropped,
                                    "Subscriber queue full, dropping packets"
                                );
                            }
                        }
                        OverflowPolicy::Disconnect => evicted.push(subscriber_id.clone()),
                    }
                }
                Err(TrySendError::Closed(_)) => evicted.push(subscriber_id.clone()),
            }
        }

        for subscriber_id in evicted {
            if let Some(subscriber) = self.subscribers.remove(&subscriber_id) {
                subscriber.task.abort();
                tracing::warn!(
                    stream_id = %self.stream_id,
                    subscriber_id = %subscriber_id,
                    "Subscriber disconnected from forwarder"
                );
            }
        }
    }
}
