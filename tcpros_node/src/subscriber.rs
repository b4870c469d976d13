//! Subscriber transport: per-peer TCP client connections that negotiate
//! a connection header, then decode messages into the subscription's
//! bounded input buffer.

use crate::codec::decode_stream;
use crate::header::{self, ConnectionHeader, HeaderError};
use crate::stats::{PeerStats, TopicSnapshot};
use abort_on_drop::ChildTask;
use async_trait::async_trait;
use futures::StreamExt;
use log::{debug, error, trace, warn};
use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tcpros_common::RosMessage;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};

#[derive(thiserror::Error, Debug)]
enum ConnectError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Header(#[from] HeaderError),
}

/// Connects to `uri`, negotiates the TCPROS connection header, and
/// returns the now-negotiated socket positioned at the first message
/// frame.
async fn connect_to_publisher<T: RosMessage>(
    caller_id: &str,
    topic: &str,
    uri: &str,
) -> Result<TcpStream, ConnectError> {
    let mut stream = TcpStream::connect(uri).await?;

    let outgoing = ConnectionHeader {
        caller_id: caller_id.to_owned(),
        topic: Some(topic.to_owned()),
        topic_type: T::ROS_TYPE_NAME.to_owned(),
        md5sum: T::MD5SUM.to_owned(),
    };
    header::write_header(&mut stream, &outgoing).await?;

    let peer_header = header::read_header(&mut stream).await?;
    header::validate_peer(&peer_header, T::ROS_TYPE_NAME, T::MD5SUM)?;

    Ok(stream)
}

/// Wraps an `AsyncRead` to tally bytes read into a shared counter,
/// independent of message boundaries: decoded payload sizes alone would
/// undercount the length-prefix and header bytes also moving over the
/// same socket.
struct CountingReader<R> {
    inner: R,
    counter: Arc<AtomicU64>,
}

impl<R: AsyncRead + Unpin> AsyncRead for CountingReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let before = buf.filled().len();
        let poll = Pin::new(&mut self.inner).poll_read(cx, buf);
        if poll.is_ready() {
            let read = buf.filled().len() - before;
            self.counter.fetch_add(read as u64, Ordering::Relaxed);
        }
        poll
    }
}

/// Runs one reader task end to end: connect, negotiate, then forward
/// every decoded message into the subscription's bounded input buffer.
///
/// This loop *is* the backpressure surface described in spec.md §4.D: a
/// full `sender` blocks this task, which stalls further reads from this
/// one publisher's socket. The task exits (without removing its URI from
/// the known set) on connect failure, negotiation failure, decode error,
/// or clean EOF.
async fn run_reader<T: RosMessage>(
    caller_id: Arc<str>,
    topic: Arc<str>,
    uri: String,
    sender: mpsc::Sender<T>,
    stats: Arc<Mutex<PeerStats>>,
) {
    let stream = match connect_to_publisher::<T>(&caller_id, &topic, &uri).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("subscriber reader for {topic} could not connect to {uri}: {e}");
            return;
        }
    };
    debug!("subscriber reader for {topic} connected to {uri}");

    let bytes_read = Arc::new(AtomicU64::new(0));
    let counted = CountingReader {
        inner: stream,
        counter: bytes_read.clone(),
    };
    let mut messages = decode_stream::<T, _>(counted);

    while let Some(msg) = messages.next().await {
        trace!("subscriber reader for {topic} decoded a message from {uri}");
        {
            let mut stats = stats.lock().await;
            stats.record(bytes_read.swap(0, Ordering::Relaxed));
        }
        if sender.send(msg).await.is_err() {
            debug!("subscription input buffer for {topic} closed, reader for {uri} exiting");
            break;
        }
    }
    debug!("subscriber reader for {topic} from {uri} exited");
}

/// Per-topic subscriber-side state: a bounded input buffer and one
/// reader task per known publisher URI.
pub(crate) struct Subscription<T: RosMessage> {
    caller_id: Arc<str>,
    topic: Arc<str>,
    sender: mpsc::Sender<T>,
    known: Mutex<HashSet<String>>,
    readers: Mutex<HashMap<String, ChildTask<()>>>,
    stats: Mutex<HashMap<String, Arc<Mutex<PeerStats>>>>,
}

impl<T: RosMessage> Subscription<T> {
    pub(crate) fn new(caller_id: &str, topic: &str, sender: mpsc::Sender<T>) -> Self {
        Self {
            caller_id: Arc::from(caller_id),
            topic: Arc::from(topic),
            sender,
            known: Mutex::new(HashSet::new()),
            readers: Mutex::new(HashMap::new()),
            stats: Mutex::new(HashMap::new()),
        }
    }

    /// The peer reconciliation algorithm from spec.md §4.F: lock the
    /// known-URI set once for the whole compute-then-write step, then
    /// spawn readers for newly-seen URIs only after releasing the lock.
    /// Idempotent: a URI already in `known` is left untouched.
    async fn reconcile(&self, uris: Vec<String>) {
        let new_uris: Vec<String> = {
            let mut known = self.known.lock().await;
            let mut fresh = Vec::new();
            for uri in uris {
                if known.insert(uri.clone()) {
                    fresh.push(uri);
                }
            }
            fresh
        };

        if new_uris.is_empty() {
            return;
        }

        let mut readers = self.readers.lock().await;
        let mut stats = self.stats.lock().await;
        for uri in new_uris {
            let peer_stats = Arc::new(Mutex::new(PeerStats::new(uri.clone())));
            stats.insert(uri.clone(), peer_stats.clone());

            let caller_id = self.caller_id.clone();
            let topic = self.topic.clone();
            let sender = self.sender.clone();
            let uri_for_task = uri.clone();
            let handle = tokio::spawn(async move {
                run_reader(caller_id, topic, uri_for_task, sender, peer_stats).await
            });
            readers.insert(uri, handle.into());
        }
    }
}

#[async_trait]
pub(crate) trait SubscriptionEntry: Send + Sync {
    fn topic_type(&self) -> &'static str;
    async fn snapshot(&self) -> TopicSnapshot;
    async fn publisher_update(&self, uris: Vec<String>);
    async fn shutdown(&self);
}

#[async_trait]
impl<T: RosMessage> SubscriptionEntry for Subscription<T> {
    fn topic_type(&self) -> &'static str {
        T::ROS_TYPE_NAME
    }

    async fn snapshot(&self) -> TopicSnapshot {
        let stats = self.stats.lock().await;
        let mut peers = Vec::with_capacity(stats.len());
        for peer in stats.values() {
            peers.push(peer.lock().await.clone());
        }
        TopicSnapshot {
            topic: self.topic.to_string(),
            topic_type: T::ROS_TYPE_NAME.to_owned(),
            peers,
        }
    }

    async fn publisher_update(&self, uris: Vec<String>) {
        self.reconcile(uris).await
    }

    async fn shutdown(&self) {
        self.readers.lock().await.clear();
    }
}

/// Constructs a new subscription record, wired to `sender`, and returns
/// it as the object-safe handle the registry stores.
pub(crate) fn new_subscription<T: RosMessage>(
    caller_id: &str,
    topic: &str,
    sender: mpsc::Sender<T>,
) -> Arc<Subscription<T>> {
    Arc::new(Subscription::new(caller_id, topic, sender))
}
