//! Publisher transport: accept/fan-out TCP server. One accept task
//! negotiates each freshly accepted client and spins up a writer task
//! for it; one pump task drains the user's stream and fans encoded
//! messages out to every connected client's bounded output buffer.

use crate::codec::encode_message;
use crate::header::{self, ConnectionHeader, HeaderError};
use crate::stats::{PeerStats, TopicSnapshot};
use crate::stream::MessageStream;
use abort_on_drop::ChildTask;
use async_trait::async_trait;
use byteorder::{ByteOrder, LittleEndian};
use futures::StreamExt;
use log::{debug, error, trace, warn};
use std::marker::PhantomData;
use std::net::IpAddr;
use std::sync::Arc;
use tcpros_common::RosMessage;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};

#[derive(thiserror::Error, Debug)]
enum NegotiateError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Header(#[from] HeaderError),
}

/// Default channel size for per-client output buffers; spec.md fixes
/// this bound at 10 and requires it never be substituted with an
/// unbounded queue.
pub const DEFAULT_QUEUE_SIZE: usize = 10;

struct ClientSlot {
    stats: Arc<Mutex<PeerStats>>,
    sender: mpsc::Sender<Vec<u8>>,
    _writer: ChildTask<()>,
}

/// Per-topic publisher-side state: the listening socket, the live
/// client roster, and the two long-lived tasks (accept, pump) that
/// drive it.
pub(crate) struct Publication<T: RosMessage> {
    topic: Arc<str>,
    port: u16,
    roster: Arc<Mutex<Vec<ClientSlot>>>,
    accept_task: Mutex<Option<ChildTask<()>>>,
    pump_task: Mutex<Option<ChildTask<()>>>,
    _phantom: PhantomData<T>,
}

impl<T: RosMessage> Publication<T> {
    /// Binds a listener on an OS-assigned port, then spawns the accept
    /// and pump tasks described in spec.md §4.E.
    pub(crate) async fn start(
        caller_id: &str,
        topic: &str,
        stream: MessageStream<T>,
        bind_addr: IpAddr,
        queue_size: usize,
    ) -> std::io::Result<Arc<Self>> {
        let listener = TcpListener::bind((bind_addr, 0)).await?;
        let port = listener.local_addr()?.port();

        let roster: Arc<Mutex<Vec<ClientSlot>>> = Arc::new(Mutex::new(Vec::new()));
        let topic: Arc<str> = Arc::from(topic);
        let caller_id: Arc<str> = Arc::from(caller_id);

        let accept_handle = tokio::spawn(accept_task::<T>(
            listener,
            topic.clone(),
            caller_id,
            roster.clone(),
            queue_size,
        ));

        let pump_handle = tokio::spawn(run_pump::<T>(stream, roster.clone(), topic.clone()));

        Ok(Arc::new(Self {
            topic,
            port,
            roster,
            accept_task: Mutex::new(Some(accept_handle.into())),
            pump_task: Mutex::new(Some(pump_handle.into())),
            _phantom: PhantomData,
        }))
    }

    pub(crate) fn port(&self) -> u16 {
        self.port
    }
}

/// Accepts clients forever. Negotiates on the freshly **accepted**
/// socket, never the listening socket — see SPEC_FULL's Redesign Flags.
async fn accept_task<T: RosMessage>(
    listener: TcpListener,
    topic: Arc<str>,
    caller_id: Arc<str>,
    roster: Arc<Mutex<Vec<ClientSlot>>>,
    queue_size: usize,
) {
    debug!("accept task started for publication {topic} on port {}", listener.local_addr().map(|a| a.port()).unwrap_or(0));
    loop {
        let (mut socket, peer_addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!("accept failed on publication {topic}: {e}");
                continue;
            }
        };

        match negotiate::<T>(&mut socket, &caller_id).await {
            Ok(()) => {
                let uri = peer_addr.to_string();
                let stats = Arc::new(Mutex::new(PeerStats::new(uri.clone())));
                let (sender, receiver) = mpsc::channel::<Vec<u8>>(queue_size);
                let writer_stats = stats.clone();
                let writer_topic = topic.clone();
                let writer = tokio::spawn(async move {
                    run_writer(socket, receiver, writer_stats, writer_topic).await
                });
                roster.lock().await.push(ClientSlot {
                    stats,
                    sender,
                    _writer: writer.into(),
                });
                debug!("publication {topic} accepted subscriber {peer_addr}");
            }
            Err(e) => {
                warn!("publication {topic} rejecting subscriber {peer_addr}: {e}");
                let _ = socket.shutdown().await;
            }
        }
    }
}

/// Reads the client's header, validates it, and sends this publication's
/// own header back — all on the per-client socket.
async fn negotiate<T: RosMessage>(
    socket: &mut TcpStream,
    caller_id: &str,
) -> Result<(), NegotiateError> {
    let client_header = header::read_header(socket).await?;
    header::validate_peer(&client_header, T::ROS_TYPE_NAME, T::MD5SUM)?;

    let response = ConnectionHeader {
        caller_id: caller_id.to_owned(),
        topic: None,
        topic_type: T::ROS_TYPE_NAME.to_owned(),
        md5sum: T::MD5SUM.to_owned(),
    };
    header::write_header(socket, &response).await?;
    Ok(())
}

/// Drains one client's bounded output buffer into its socket. Exits
/// (dropping the socket and, via the caller's `ChildTask`, this task)
/// on the first write error — the roster is pruned lazily by the pump
/// the next time it observes the sender side closed.
async fn run_writer(
    mut socket: TcpStream,
    mut rx: mpsc::Receiver<Vec<u8>>,
    stats: Arc<Mutex<PeerStats>>,
    topic: Arc<str>,
) {
    while let Some(payload) = rx.recv().await {
        let mut framed = Vec::with_capacity(payload.len() + 4);
        let mut len_bytes = [0u8; 4];
        LittleEndian::write_u32(&mut len_bytes, payload.len() as u32);
        framed.extend_from_slice(&len_bytes);
        framed.extend_from_slice(&payload);

        if let Err(e) = socket.write_all(&framed).await {
            debug!("writer for {topic} exiting on write error: {e}");
            break;
        }
        stats.lock().await.record(framed.len() as u64);
    }
    trace!("writer for {topic} drained and exited");
}

/// Pulls each message from the user's stream, encodes it once, then
/// offers it to every connected client. Policy (spec.md Open Question,
/// resolved here): per-client backpressure isolation. A full client
/// buffer drops that message for that client only; the pump never
/// blocks waiting on a slow client or on any client existing at all.
async fn run_pump<T: RosMessage>(
    mut stream: MessageStream<T>,
    roster: Arc<Mutex<Vec<ClientSlot>>>,
    topic: Arc<str>,
) {
    debug!("pump task started for publication {topic}");
    while let Some(msg) = stream.next().await {
        let payload = match encode_message(&msg) {
            Ok(payload) => payload,
            Err(e) => {
                error!("failed to encode message for publication {topic}: {e}");
                continue;
            }
        };

        let mut roster = roster.lock().await;
        roster.retain_mut(|slot| match slot.sender.try_send(payload.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                if let Ok(mut stats) = slot.stats.try_lock() {
                    stats.record_dropped();
                }
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }
    debug!("pump task for publication {topic} exited: upstream stream ended");
}

#[async_trait]
pub(crate) trait PublicationEntry: Send + Sync {
    fn topic_type(&self) -> &'static str;
    fn port(&self) -> u16;
    async fn snapshot(&self) -> TopicSnapshot;
    async fn shutdown(&self);
}

#[async_trait]
impl<T: RosMessage> PublicationEntry for Publication<T> {
    fn topic_type(&self) -> &'static str {
        T::ROS_TYPE_NAME
    }

    fn port(&self) -> u16 {
        self.port
    }

    async fn snapshot(&self) -> TopicSnapshot {
        let roster = self.roster.lock().await;
        let mut peers = Vec::with_capacity(roster.len());
        for slot in roster.iter() {
            peers.push(slot.stats.lock().await.clone());
        }
        TopicSnapshot {
            topic: self.topic.to_string(),
            topic_type: T::ROS_TYPE_NAME.to_owned(),
            peers,
        }
    }

    /// Cancels the accept task and the pump task, then clears the
    /// roster — dropping each `ChildTask` writer, which aborts it and
    /// closes its socket. Per SPEC_FULL's Redesign Flags, the pump must
    /// be cancelled too, not only the writers and the accept task.
    async fn shutdown(&self) {
        self.accept_task.lock().await.take();
        self.pump_task.lock().await.take();
        self.roster.lock().await.clear();
    }
}
