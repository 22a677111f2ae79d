//! Cross-process cache invalidation: a batched, deduplicated pub/sub
//! disseminator sitting on top of the [`crate::connection::Broker`]
//! contract.
//!
//! Grounded on the teacher's `invalidation.rs`: a background flush loop
//! coalesces bursts of changes into one publish, a broadcast channel
//! drives shutdown, and a sender identifier lets a process ignore its own
//! echoes coming back off the wire.

use crate::connection::Broker;
use crate::error::CacheError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// How a changed item was produced, packed as the 3-bit action subfield
/// of a `Changed` frame's tag byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeAction {
    Add,
    Put,
    Update,
}

impl ChangeAction {
    const fn to_bits(self) -> u8 {
        match self {
            Self::Add => 0,
            Self::Put => 1,
            Self::Update => 2,
        }
    }

    fn from_bits(bits: u8) -> Result<Self, CacheError> {
        match bits {
            0 => Ok(Self::Add),
            1 => Ok(Self::Put),
            2 => Ok(Self::Update),
            other => Err(CacheError::SerializationError(format!(
                "unrecognized change action subfield {other}"
            ))),
        }
    }
}

/// One cross-process invalidation message.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BackplaneMessage {
    /// A key was added, overwritten, or updated on the publishing
    /// process's backplane-source tier.
    Changed {
        sender: Uuid,
        key: String,
        region: Option<String>,
        action: ChangeAction,
    },
    /// A key was removed on the publishing process.
    Removed {
        sender: Uuid,
        key: String,
        region: Option<String>,
    },
    /// The entire cache was cleared on the publishing process.
    Clear { sender: Uuid },
    /// One region was cleared on the publishing process.
    ClearRegion { sender: Uuid, region: String },
}

impl BackplaneMessage {
    #[must_use]
    pub fn sender(&self) -> Uuid {
        match self {
            Self::Changed { sender, .. }
            | Self::Removed { sender, .. }
            | Self::Clear { sender }
            | Self::ClearRegion { sender, .. } => *sender,
        }
    }

    /// Whether this message subsumes every other pending message, per the
    /// outbound-batching rule: a `Clear` makes any previously-queued
    /// message for the same sender redundant.
    #[must_use]
    const fn is_clear(&self) -> bool {
        matches!(self, Self::Clear { .. })
    }
}

const TAG_CHANGED: u8 = 0;
const TAG_CLEAR: u8 = 1;
const TAG_CLEAR_REGION: u8 = 2;
const TAG_REMOVED: u8 = 3;

fn write_varint(buf: &mut BytesMut, mut value: u64) {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if value == 0 {
            break;
        }
    }
}

fn read_varint(buf: &mut impl Buf) -> Result<u64, CacheError> {
    let mut result = 0u64;
    let mut shift = 0u32;
    loop {
        if !buf.has_remaining() {
            return Err(CacheError::SerializationError(
                "truncated varint".to_string(),
            ));
        }
        let byte = buf.get_u8();
        result |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
        if shift >= 64 {
            return Err(CacheError::SerializationError(
                "varint too large".to_string(),
            ));
        }
    }
    Ok(result)
}

fn write_string(buf: &mut BytesMut, s: &str) {
    write_varint(buf, s.len() as u64);
    buf.put_slice(s.as_bytes());
}

fn read_string(buf: &mut impl Buf) -> Result<String, CacheError> {
    let len = read_varint(buf)? as usize;
    if buf.remaining() < len {
        return Err(CacheError::SerializationError(
            "truncated string field".to_string(),
        ));
    }
    let mut bytes = vec![0u8; len];
    buf.copy_to_slice(&mut bytes);
    String::from_utf8(bytes)
        .map_err(|e| CacheError::SerializationError(format!("invalid utf-8: {e}")))
}

fn encode_region(buf: &mut BytesMut, region: Option<&str>) {
    write_string(buf, region.unwrap_or(""));
}

fn decode_region(buf: &mut impl Buf) -> Result<Option<String>, CacheError> {
    let region = read_string(buf)?;
    Ok(if region.is_empty() { None } else { Some(region) })
}

/// Serialize one message's body (tag byte, sender, and variant fields).
/// Callers wrap this with a length prefix when assembling a frame; see
/// [`encode_frame`].
fn encode_message(msg: &BackplaneMessage) -> BytesMut {
    let mut buf = BytesMut::new();
    match msg {
        BackplaneMessage::Changed {
            sender,
            key,
            region,
            action,
        } => {
            buf.put_u8(TAG_CHANGED | (action.to_bits() << 2));
            buf.put_slice(sender.as_bytes());
            write_string(&mut buf, key);
            encode_region(&mut buf, region.as_deref());
        }
        BackplaneMessage::Removed {
            sender,
            key,
            region,
        } => {
            buf.put_u8(TAG_REMOVED);
            buf.put_slice(sender.as_bytes());
            write_string(&mut buf, key);
            encode_region(&mut buf, region.as_deref());
        }
        BackplaneMessage::Clear { sender } => {
            buf.put_u8(TAG_CLEAR);
            buf.put_slice(sender.as_bytes());
        }
        BackplaneMessage::ClearRegion { sender, region } => {
            buf.put_u8(TAG_CLEAR_REGION);
            buf.put_slice(sender.as_bytes());
            write_string(&mut buf, region);
        }
    }
    buf
}

fn decode_message(mut body: &[u8]) -> Result<BackplaneMessage, CacheError> {
    if body.is_empty() {
        return Err(CacheError::SerializationError("empty message body".to_string()));
    }
    let tag_byte = body.get_u8();
    let tag = tag_byte & 0b11;
    let subfield = (tag_byte >> 2) & 0b111;

    if body.remaining() < 16 {
        return Err(CacheError::SerializationError(
            "truncated sender id".to_string(),
        ));
    }
    let mut sender_bytes = [0u8; 16];
    body.copy_to_slice(&mut sender_bytes);
    let sender = Uuid::from_bytes(sender_bytes);

    match tag {
        TAG_CHANGED => {
            let key = read_string(&mut body)?;
            let region = decode_region(&mut body)?;
            let action = ChangeAction::from_bits(subfield)?;
            Ok(BackplaneMessage::Changed {
                sender,
                key,
                region,
                action,
            })
        }
        TAG_REMOVED => {
            let key = read_string(&mut body)?;
            let region = decode_region(&mut body)?;
            Ok(BackplaneMessage::Removed { sender, key, region })
        }
        TAG_CLEAR => Ok(BackplaneMessage::Clear { sender }),
        TAG_CLEAR_REGION => {
            let region = read_string(&mut body)?;
            Ok(BackplaneMessage::ClearRegion { sender, region })
        }
        _ => Err(CacheError::SerializationError(format!(
            "unrecognized message tag {tag}"
        ))),
    }
}

/// Encode a batch of messages as one frame: each message is prefixed with
/// a varint length so a subscriber can resynchronize after a malformed
/// message instead of losing the rest of the frame.
#[must_use]
pub fn encode_frame(messages: &[BackplaneMessage]) -> Bytes {
    let mut frame = BytesMut::new();
    for msg in messages {
        let body = encode_message(msg);
        write_varint(&mut frame, body.len() as u64);
        frame.put_slice(&body);
    }
    frame.freeze()
}

/// Decode a frame into its constituent messages. A malformed message
/// aborts decoding of the *rest* of the frame (length-prefixing does not
/// help recover a corrupt frame, only resynchronize across a *stream* of
/// frames); the caller should log and discard, not propagate, per the
/// subscriber's dropped-frame contract.
///
/// # Errors
/// Returns [`CacheError::SerializationError`] on truncated or malformed
/// input.
pub fn decode_frame(frame: &[u8]) -> Result<Vec<BackplaneMessage>, CacheError> {
    let mut cursor = frame;
    let mut messages = Vec::new();
    while cursor.has_remaining() {
        let len = read_varint(&mut cursor)? as usize;
        if cursor.remaining() < len {
            return Err(CacheError::SerializationError(
                "truncated message in frame".to_string(),
            ));
        }
        let body = &cursor[..len];
        messages.push(decode_message(body)?);
        cursor.advance(len);
    }
    Ok(messages)
}

/// Configuration for the outbound batching policy.
#[derive(Debug, Clone)]
pub struct BackplaneConfig {
    pub channel: String,
    /// Maximum number of distinct pending messages held before further
    /// enqueues are dropped and counted in `skipped_count`.
    pub hard_limit: usize,
    /// Delay after the first enqueue in a batch before serializing and
    /// publishing, to let a burst of changes coalesce into one frame.
    pub coalescing_delay: Duration,
    /// Safety-net periodic flush in case the coalescing timer is starved.
    pub flush_interval: Duration,
}

impl Default for BackplaneConfig {
    fn default() -> Self {
        Self {
            channel: "cache-invalidation".to_string(),
            hard_limit: 10_000,
            coalescing_delay: Duration::from_millis(10),
            flush_interval: Duration::from_millis(100),
        }
    }
}

/// Manages the outbound pending set and publishes batched, deduplicated
/// frames to the broker.
pub struct BackplanePublisher {
    sender_id: Uuid,
    config: BackplaneConfig,
    broker: Arc<dyn Broker>,
    outbound: AsyncMutex<HashSet<BackplaneMessage>>,
    skipped_count: AtomicU64,
    sending: AtomicBool,
}

impl BackplanePublisher {
    #[must_use]
    pub fn new(sender_id: Uuid, config: BackplaneConfig, broker: Arc<dyn Broker>) -> Self {
        Self {
            sender_id,
            config,
            broker,
            outbound: AsyncMutex::new(HashSet::new()),
            skipped_count: AtomicU64::new(0),
            sending: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn sender_id(&self) -> Uuid {
        self.sender_id
    }

    #[must_use]
    pub fn skipped_count(&self) -> u64 {
        self.skipped_count.load(Ordering::Relaxed)
    }

    /// Enqueue a message for the next flush. A `Clear` subsumes any other
    /// pending message from this sender, since a clear makes every prior
    /// pending change moot.
    pub async fn enqueue(&self, message: BackplaneMessage) {
        let mut outbound = self.outbound.lock().await;
        if message.is_clear() {
            let discarded = outbound.len() as u64;
            self.skipped_count.fetch_add(discarded, Ordering::Relaxed);
            outbound.clear();
            outbound.insert(message);
            return;
        }
        if outbound.len() >= self.config.hard_limit && !outbound.contains(&message) {
            self.skipped_count.fetch_add(1, Ordering::Relaxed);
            warn!(
                skipped = self.skipped_count.load(Ordering::Relaxed),
                "backplane outbound queue at hard limit, dropping message"
            );
            return;
        }
        if !outbound.insert(message) {
            self.skipped_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Serialize and publish everything currently pending, unless another
    /// flush is already in flight. On publish failure the pending set is
    /// left intact so the next flush retries the same batch.
    pub async fn flush(&self) {
        if self
            .sending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let batch: Vec<BackplaneMessage> = {
            let outbound = self.outbound.lock().await;
            outbound.iter().cloned().collect()
        };

        if batch.is_empty() {
            self.sending.store(false, Ordering::Release);
            return;
        }

        let frame = encode_frame(&batch);
        match self.broker.publish(&self.config.channel, frame).await {
            Ok(()) => {
                let mut outbound = self.outbound.lock().await;
                for msg in &batch {
                    outbound.remove(msg);
                }
                debug!(count = batch.len(), "flushed backplane batch");
            }
            Err(err) => {
                error!(error = %err, count = batch.len(), "backplane publish failed, batch retained");
            }
        }

        self.sending.store(false, Ordering::Release);
    }

    /// Run the coalescing + periodic-safety-net flush loop until
    /// `shutdown` fires. Intended to be driven by a single
    /// `tokio::spawn`ed task per publisher.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.config.flush_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.flush().await;
                }
                _ = shutdown.recv() => {
                    self.flush().await;
                    break;
                }
            }
        }
    }

    /// Enqueue `message` and schedule a coalesced flush shortly after,
    /// rather than publishing immediately. Concurrent callers racing on
    /// the same coalescing window all land in the one flush it triggers.
    pub async fn enqueue_and_schedule_flush(self: &Arc<Self>, message: BackplaneMessage) {
        self.enqueue(message).await;
        let this = Arc::clone(self);
        let delay = self.config.coalescing_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.flush().await;
        });
    }
}

/// Handlers invoked for each non-self-originated message a subscriber
/// decodes. Dispatch is sequential and in wire order.
pub trait BackplaneHandler: Send + Sync {
    fn on_changed(&self, key: &str, region: Option<&str>, action: ChangeAction);
    fn on_removed(&self, key: &str, region: Option<&str>);
    fn on_cleared(&self);
    fn on_cleared_region(&self, region: &str);
}

/// Drives a broker subscription, suppressing self-echoes by sender
/// identifier and dropping malformed frames without tearing down the
/// subscription.
pub struct BackplaneSubscriber {
    sender_id: Uuid,
}

impl BackplaneSubscriber {
    #[must_use]
    pub fn new(sender_id: Uuid) -> Self {
        Self { sender_id }
    }

    /// Process one received frame, dispatching to `handler` for every
    /// message not originated by this process. Malformed frames are
    /// logged and swallowed: the caller's receive loop continues.
    pub fn handle_frame(&self, frame: &[u8], handler: &dyn BackplaneHandler) {
        let messages = match decode_frame(frame) {
            Ok(messages) => messages,
            Err(err) => {
                warn!(error = %err, "dropping malformed backplane frame");
                return;
            }
        };

        for message in messages {
            if message.sender() == self.sender_id {
                continue;
            }
            match message {
                BackplaneMessage::Changed { key, region, action, .. } => {
                    handler.on_changed(&key, region.as_deref(), action);
                }
                BackplaneMessage::Removed { key, region, .. } => {
                    handler.on_removed(&key, region.as_deref());
                }
                BackplaneMessage::Clear { .. } => handler.on_cleared(),
                BackplaneMessage::ClearRegion { region, .. } => handler.on_cleared_region(&region),
            }
        }
    }
}
