use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::timeout;
use tokio_util::codec::FramedRead;
use tracing::{debug, trace};

use crate::cache::ClientCache;
use crate::command::Command;
use crate::config::ClientOption;
use crate::error::{Error, Result};
use crate::metrics;
use crate::protocol::{encode_command, RespCodec, RespValue};

/// The writer flushes whenever its staging buffer crosses this watermark,
/// otherwise it keeps draining queued submissions into one syscall.
const FLUSH_WATERMARK: usize = 1024 * 1024;

/// Grace period for the optional QUIT exchange during close.
const QUIT_GRACE: Duration = Duration::from_secs(1);

pub(crate) type Completion = oneshot::Sender<Result<RespValue>>;

/// A message observed on a subscribed channel or pattern.
#[derive(Debug, Clone)]
pub struct PubSubMessage {
    pub channel: Bytes,
    /// Set when the message was delivered through a pattern subscription.
    pub pattern: Option<Bytes>,
    pub payload: Bytes,
}

struct Submission {
    command: Command,
    done: Completion,
}

struct InFlight {
    expected_acks: usize,
    done: Completion,
}

/// One pipeline per TCP connection: a single writer task owns the socket's
/// write half and is the sole producer of in-flight entries, a single
/// reader task owns the read half and is their sole consumer. Submission
/// order therefore equals wire order equals completion order.
pub(crate) struct Pipeline {
    submit_tx: Mutex<Option<mpsc::Sender<Submission>>>,
    shared: Arc<Shared>,
}

struct Shared {
    endpoint: Arc<str>,
    closing: AtomicBool,
    error: RwLock<Option<Error>>,
    /// Submissions accepted but not yet completed; close waits for zero.
    outstanding: AtomicUsize,
    idle: Notify,
    /// Wakes the reader when the writer side declares the wire broken.
    broken_signal: Notify,
}

impl Shared {
    fn is_broken(&self) -> bool {
        self.error.read().is_some()
    }

    fn break_with(&self, err: Error) {
        let mut guard = self.error.write();
        if guard.is_none() {
            debug!(endpoint = %self.endpoint, error = %err, "pipeline transitioned to broken");
            metrics::wire_failure();
            *guard = Some(err);
        }
        drop(guard);
        self.broken_signal.notify_waiters();
    }

    /// The error completions should observe right now.
    fn current_error(&self) -> Error {
        if let Some(err) = self.error.read().clone() {
            return err;
        }
        if self.closing.load(Ordering::Acquire) {
            return Error::Closing;
        }
        Error::broken("wire shut down")
    }

    fn complete(&self, done: Completion, result: Result<RespValue>) {
        // the receiver may have stopped waiting; the FIFO stayed intact
        // regardless, so a dead sink is not an error
        let _ = done.send(result);
        if self.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }
}

pub(crate) struct PipelineOptions {
    pub ring_size: usize,
    pub write_timeout: Option<Duration>,
    pub read_buffer_size: usize,
    pub write_buffer_size: usize,
    pub max_nesting_depth: usize,
}

impl PipelineOptions {
    pub fn from_option(opt: &ClientOption) -> Self {
        Self {
            ring_size: opt.ring_size(),
            write_timeout: opt.write_timeout(),
            read_buffer_size: opt.read_buffer_size,
            write_buffer_size: opt.write_buffer_size,
            max_nesting_depth: opt.max_nesting_depth,
        }
    }
}

impl Pipeline {
    pub fn spawn(
        endpoint: Arc<str>,
        stream: TcpStream,
        options: PipelineOptions,
        cache: Option<Arc<ClientCache>>,
        subscriptions: Arc<Subscriptions>,
    ) -> Pipeline {
        let (read_half, write_half) = stream.into_split();
        let (submit_tx, submit_rx) = mpsc::channel(options.ring_size);
        let (inflight_tx, inflight_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            endpoint: endpoint.clone(),
            closing: AtomicBool::new(false),
            error: RwLock::new(None),
            outstanding: AtomicUsize::new(0),
            idle: Notify::new(),
            broken_signal: Notify::new(),
        });

        let frames = FramedRead::with_capacity(
            read_half,
            RespCodec::new(options.max_nesting_depth),
            options.read_buffer_size,
        );

        tokio::spawn(write_loop(
            submit_rx,
            write_half,
            inflight_tx,
            shared.clone(),
            options.write_timeout,
            options.write_buffer_size,
        ));
        tokio::spawn(read_loop(
            frames,
            inflight_rx,
            cache,
            subscriptions,
            shared.clone(),
        ));

        Pipeline {
            submit_tx: Mutex::new(Some(submit_tx)),
            shared,
        }
    }

    pub fn is_broken(&self) -> bool {
        self.shared.is_broken()
    }

    /// Submit one command and wait for its reply. Server error frames are
    /// returned as values; `Err` means the reply never arrived.
    pub async fn call(&self, command: &Command) -> Result<RespValue> {
        let rx = self.enqueue(command.clone()).await?;
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(self.shared.current_error()),
        }
    }

    /// Submit a batch back-to-back, then wait for every reply in order.
    pub async fn call_multi(&self, commands: &[Command]) -> Result<Vec<RespValue>> {
        let mut receivers = Vec::with_capacity(commands.len());
        for command in commands {
            receivers.push(self.enqueue(command.clone()).await?);
        }
        let mut replies = Vec::with_capacity(receivers.len());
        for rx in receivers {
            match rx.await {
                Ok(result) => replies.push(result?),
                Err(_) => return Err(self.shared.current_error()),
            }
        }
        Ok(replies)
    }

    async fn enqueue(&self, command: Command) -> Result<oneshot::Receiver<Result<RespValue>>> {
        if self.shared.closing.load(Ordering::Acquire) {
            return Err(Error::Closing);
        }
        if let Some(err) = self.shared.error.read().clone() {
            return Err(err);
        }
        let tx = match self.submit_tx.lock().as_ref() {
            Some(tx) => tx.clone(),
            None => return Err(Error::Closing),
        };
        let (done, rx) = oneshot::channel();
        self.shared.outstanding.fetch_add(1, Ordering::AcqRel);
        // the bounded channel is the in-flight ring: when it is full this
        // send parks the submitter until slots free up
        if tx.send(Submission { command, done }).await.is_err() {
            let err = self.shared.current_error();
            if self.shared.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
                self.shared.idle.notify_waiters();
            }
            return Err(err);
        }
        Ok(rx)
    }

    /// Stop accepting submits, wait for outstanding replies, optionally
    /// exchange QUIT, then let the socket wind down.
    pub async fn close(&self, send_quit: bool) {
        if self.shared.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        let tx = self.submit_tx.lock().take();
        loop {
            if self.shared.outstanding.load(Ordering::Acquire) == 0 {
                break;
            }
            let notified = self.shared.idle.notified();
            tokio::pin!(notified);
            // register before the re-check so a completion that lands in
            // between cannot be missed
            notified.as_mut().enable();
            if self.shared.outstanding.load(Ordering::Acquire) == 0 {
                break;
            }
            notified.await;
        }
        if let (Some(tx), false) = (tx.as_ref(), self.shared.is_broken()) {
            if send_quit {
                if let Ok(quit) = Command::new(["QUIT"]) {
                    let (done, rx) = oneshot::channel();
                    self.shared.outstanding.fetch_add(1, Ordering::AcqRel);
                    if tx.send(Submission { command: quit, done }).await.is_ok() {
                        let _ = timeout(QUIT_GRACE, rx).await;
                    } else if self.shared.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
                        self.shared.idle.notify_waiters();
                    }
                }
            }
        }
        drop(tx);
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.shared.closing.store(true, Ordering::Release);
        self.submit_tx.lock().take();
    }
}

async fn write_loop(
    mut submit_rx: mpsc::Receiver<Submission>,
    mut write_half: OwnedWriteHalf,
    inflight_tx: mpsc::UnboundedSender<InFlight>,
    shared: Arc<Shared>,
    write_timeout: Option<Duration>,
    write_buffer_size: usize,
) {
    let mut buf = BytesMut::with_capacity(write_buffer_size);
    while let Some(first) = submit_rx.recv().await {
        if shared.is_broken() {
            fail_submission(&shared, first);
            continue;
        }
        buf.clear();
        stage(&shared, &inflight_tx, &mut buf, first);
        // coalesce whatever else is already queued into the same syscall
        while buf.len() < FLUSH_WATERMARK {
            match submit_rx.try_recv() {
                Ok(next) => stage(&shared, &inflight_tx, &mut buf, next),
                Err(_) => break,
            }
        }
        if buf.is_empty() {
            continue;
        }
        let result = match write_timeout {
            Some(limit) => match timeout(limit, write_half.write_all(&buf)).await {
                Ok(io) => io.map_err(Error::from),
                Err(_) => Err(Error::Timeout),
            },
            None => write_half.write_all(&buf).await.map_err(Error::from),
        };
        if let Err(err) = result {
            shared.break_with(err);
            break;
        }
        trace!(endpoint = %shared.endpoint, bytes = buf.len(), "flushed command batch");
    }

    // fail everything still queued, then keep rejecting until the last
    // sender goes away so no submission is silently dropped
    while let Some(submission) = submit_rx.recv().await {
        fail_submission(&shared, submission);
    }
    let _ = write_half.shutdown().await;
}

/// Append one submission to the wire batch. The in-flight entry is pushed
/// before its bytes can reach the socket, so the reader's FIFO always leads
/// the server's replies.
fn stage(
    shared: &Arc<Shared>,
    inflight_tx: &mpsc::UnboundedSender<InFlight>,
    buf: &mut BytesMut,
    submission: Submission,
) {
    let Submission { command, done } = submission;
    let entry = InFlight {
        expected_acks: command.expected_acks(),
        done,
    };
    if let Err(rejected) = inflight_tx.send(entry) {
        // reader already tore down; its fan-out no longer covers us
        let entry = rejected.0;
        shared.complete(entry.done, Err(shared.current_error()));
        return;
    }
    encode_command(command.tokens(), buf);
}

fn fail_submission(shared: &Arc<Shared>, submission: Submission) {
    let err = shared.current_error();
    shared.complete(submission.done, Err(err));
}

async fn read_loop(
    mut frames: FramedRead<OwnedReadHalf, RespCodec>,
    mut inflight_rx: mpsc::UnboundedReceiver<InFlight>,
    cache: Option<Arc<ClientCache>>,
    subscriptions: Arc<Subscriptions>,
    shared: Arc<Shared>,
) {
    // subscribe/unsubscribe commands retire one confirmation per channel
    // argument; the head entry stays put until its count drains
    let mut head: Option<InFlight> = None;

    loop {
        // arm the broken wakeup before re-checking, so a writer-side fault
        // between the check and the await cannot strand us on the socket
        let broken = shared.broken_signal.notified();
        tokio::pin!(broken);
        broken.as_mut().enable();
        if shared.is_broken() {
            break;
        }
        let received = tokio::select! {
            biased;
            frame = frames.next() => frame,
            _ = &mut broken => break,
        };
        let frame = match received {
            Some(Ok(frame)) => frame,
            Some(Err(err)) => {
                shared.break_with(err);
                break;
            }
            None => {
                let graceful = shared.closing.load(Ordering::Acquire)
                    && shared.outstanding.load(Ordering::Acquire) == 0;
                if !graceful {
                    shared.break_with(Error::broken("connection closed by peer"));
                }
                break;
            }
        };

        // out-of-band frames never consume an in-flight entry
        if let Some(items) = frame.push_items() {
            match classify_push(items) {
                PushFrame::Invalidate(keys) => {
                    if let Some(cache) = &cache {
                        match keys {
                            Some(keys) => cache.invalidate_keys(&keys),
                            None => cache.flush(),
                        }
                    }
                    continue;
                }
                PushFrame::Message(message) => {
                    subscriptions.dispatch(message);
                    continue;
                }
                PushFrame::SubscriptionAck => {}
                PushFrame::Other => continue,
            }
        }

        if is_subscription_ack(&frame) {
            if head.is_none() {
                head = inflight_rx.try_recv().ok();
            }
            match head.take() {
                Some(mut entry) if entry.expected_acks > 0 => {
                    entry.expected_acks -= 1;
                    if entry.expected_acks == 0 {
                        shared.complete(entry.done, Ok(frame));
                    } else {
                        head = Some(entry);
                    }
                }
                // an ack nobody asked for, e.g. the tail of an implicit
                // unsubscribe; the head entry is not touched
                other => head = other,
            }
            continue;
        }

        let entry = match head.take() {
            Some(entry) => entry,
            None => match inflight_rx.try_recv() {
                Ok(entry) => entry,
                Err(_) => {
                    shared.break_with(Error::protocol("reply without a pending request"));
                    break;
                }
            },
        };
        // a subscribe that drew an error reply instead of confirmations
        // still completes here, keeping the FIFO aligned
        shared.complete(entry.done, Ok(frame));
    }

    let err = shared.current_error();
    if let Some(entry) = head.take() {
        shared.complete(entry.done, Err(err.clone()));
    }
    inflight_rx.close();
    while let Ok(entry) = inflight_rx.try_recv() {
        shared.complete(entry.done, Err(err.clone()));
    }
    subscriptions.close();
    metrics::wire_close();
}

enum PushFrame {
    /// `invalidate` with a key list, or `None` for a full flush.
    Invalidate(Option<Vec<Bytes>>),
    Message(PubSubMessage),
    SubscriptionAck,
    Other,
}

fn classify_push(items: &[RespValue]) -> PushFrame {
    let kind = match items.first().and_then(|item| item.as_bytes()) {
        Some(kind) => kind,
        None => return PushFrame::Other,
    };
    if kind.eq_ignore_ascii_case(b"invalidate") {
        return match items.get(1) {
            Some(payload) if payload.is_null() => PushFrame::Invalidate(None),
            Some(payload) => match payload.as_array() {
                Some(keys) => PushFrame::Invalidate(Some(
                    keys.iter()
                        .filter_map(|key| key.as_bytes().cloned())
                        .collect(),
                )),
                None => PushFrame::Other,
            },
            None => PushFrame::Other,
        };
    }
    if kind.eq_ignore_ascii_case(b"message") || kind.eq_ignore_ascii_case(b"smessage") {
        if let (Some(channel), Some(payload)) = (
            items.get(1).and_then(|item| item.as_bytes()),
            items.get(2).and_then(|item| item.as_bytes()),
        ) {
            return PushFrame::Message(PubSubMessage {
                channel: channel.clone(),
                pattern: None,
                payload: payload.clone(),
            });
        }
        return PushFrame::Other;
    }
    if kind.eq_ignore_ascii_case(b"pmessage") {
        if let (Some(pattern), Some(channel), Some(payload)) = (
            items.get(1).and_then(|item| item.as_bytes()),
            items.get(2).and_then(|item| item.as_bytes()),
            items.get(3).and_then(|item| item.as_bytes()),
        ) {
            return PushFrame::Message(PubSubMessage {
                channel: channel.clone(),
                pattern: Some(pattern.clone()),
                payload: payload.clone(),
            });
        }
        return PushFrame::Other;
    }
    if is_subscribe_kind(kind) {
        return PushFrame::SubscriptionAck;
    }
    PushFrame::Other
}

/// Subscription confirmations arrive as push frames on RESP3 servers and as
/// plain arrays on RESP2-framed ones; both shapes are `[kind, name, count]`.
fn is_subscription_ack(frame: &RespValue) -> bool {
    let items = match frame.payload() {
        RespValue::Push(items) | RespValue::Array(items) => items,
        _ => return false,
    };
    if items.len() < 3 {
        return false;
    }
    match items[0].as_bytes() {
        Some(kind) if is_subscribe_kind(kind) => items[2].as_int().is_some(),
        _ => false,
    }
}

fn is_subscribe_kind(kind: &[u8]) -> bool {
    kind.eq_ignore_ascii_case(b"subscribe")
        || kind.eq_ignore_ascii_case(b"unsubscribe")
        || kind.eq_ignore_ascii_case(b"psubscribe")
        || kind.eq_ignore_ascii_case(b"punsubscribe")
        || kind.eq_ignore_ascii_case(b"ssubscribe")
        || kind.eq_ignore_ascii_case(b"sunsubscribe")
}

/// Per-wire registry routing pub/sub pushes to `receive` loops.
pub(crate) struct Subscriptions {
    channels: Mutex<HashMap<Bytes, mpsc::UnboundedSender<PubSubMessage>>>,
    patterns: Mutex<HashMap<Bytes, mpsc::UnboundedSender<PubSubMessage>>>,
}

impl Subscriptions {
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            patterns: Mutex::new(HashMap::new()),
        }
    }

    pub fn register_channel(&self, name: Bytes, tx: mpsc::UnboundedSender<PubSubMessage>) {
        self.channels.lock().insert(name, tx);
    }

    pub fn register_pattern(&self, name: Bytes, tx: mpsc::UnboundedSender<PubSubMessage>) {
        self.patterns.lock().insert(name, tx);
    }

    fn dispatch(&self, message: PubSubMessage) {
        let target = match &message.pattern {
            Some(pattern) => self.patterns.lock().get(pattern.as_ref()).cloned(),
            None => self.channels.lock().get(message.channel.as_ref()).cloned(),
        };
        match target {
            Some(tx) => {
                let _ = tx.send(message);
            }
            None => {
                trace!(channel = ?message.channel, "pub/sub message without a subscriber");
            }
        }
    }

    fn close(&self) {
        self.channels.lock().clear();
        self.patterns.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_invalidation_pushes() {
        let items = vec![
            RespValue::bulk("invalidate"),
            RespValue::Array(vec![RespValue::bulk("k1"), RespValue::bulk("k2")]),
        ];
        match classify_push(&items) {
            PushFrame::Invalidate(Some(keys)) => {
                assert_eq!(keys, vec![Bytes::from_static(b"k1"), Bytes::from_static(b"k2")]);
            }
            _ => panic!("expected key invalidation"),
        }

        let flush = vec![RespValue::bulk("invalidate"), RespValue::Null];
        assert!(matches!(classify_push(&flush), PushFrame::Invalidate(None)));
    }

    #[test]
    fn classifies_pattern_messages() {
        let items = vec![
            RespValue::bulk("pmessage"),
            RespValue::bulk("pat*"),
            RespValue::bulk("pat1"),
            RespValue::bulk("body"),
        ];
        match classify_push(&items) {
            PushFrame::Message(msg) => {
                assert_eq!(msg.pattern.as_deref(), Some(&b"pat*"[..]));
                assert_eq!(msg.channel, Bytes::from_static(b"pat1"));
            }
            _ => panic!("expected pattern message"),
        }
    }

    #[test]
    fn subscription_acks_match_both_frame_shapes() {
        let push = RespValue::Push(vec![
            RespValue::bulk("subscribe"),
            RespValue::bulk("ch"),
            RespValue::Integer(1),
        ]);
        let array = RespValue::Array(vec![
            RespValue::bulk("unsubscribe"),
            RespValue::bulk("ch"),
            RespValue::Integer(0),
        ]);
        assert!(is_subscription_ack(&push));
        assert!(is_subscription_ack(&array));
        assert!(!is_subscription_ack(&RespValue::simple("OK")));
    }
}
