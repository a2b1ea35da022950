//! CPG client IPC server: a Unix domain socket, one spawned task per
//! connection, dispatching by a fixed 16-byte header. CPG's join/leave/
//! mcast calls need to interleave unsolicited confchg/deliver pushes with
//! request/response traffic, which a binary framing with an explicit
//! message-id can carry but a strictly request-response protocol cannot.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot, Mutex};

use totem_cpg::{ClientId, Pid, ProcessRecord};
use totem_types::{ApiError, GroupName};

const HEADER_LEN: usize = 16;
/// Largest single IPC frame body this server accepts; well above any
/// realistic join/mcast payload, guards against a misbehaving client
/// claiming an enormous `size` and exhausting memory.
const MAX_BODY_LEN: u32 = 1024 * 1024;

/// Message ids, request and push alike, sharing one namespace per
/// connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum MessageId {
    Join = 1,
    Leave = 2,
    Mcast = 3,
    MembershipGet = 4,
    LocalGet = 5,
    Reply = 50,
    Confchg = 100,
    Deliver = 101,
    TotemMembership = 102,
}

impl MessageId {
    fn from_wire(v: u16) -> Option<Self> {
        Some(match v {
            1 => Self::Join,
            2 => Self::Leave,
            3 => Self::Mcast,
            4 => Self::MembershipGet,
            5 => Self::LocalGet,
            50 => Self::Reply,
            100 => Self::Confchg,
            101 => Self::Deliver,
            102 => Self::TotemMembership,
            _ => return None,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    #[error("connection closed")]
    Closed,
    #[error("frame body of {0} bytes exceeds the {MAX_BODY_LEN} byte ceiling")]
    BodyTooLarge(u32),
    #[error("unrecognized message id {0}")]
    UnknownMessage(u16),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame decode failed: {0}")]
    Decode(String),
}

type IoResult<T> = std::result::Result<T, IpcError>;

fn encode_frame(message_id: MessageId, status: Status, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    out.extend_from_slice(&0u16.to_be_bytes()); // service_id: CPG is the only service
    out.extend_from_slice(&(message_id as u16).to_be_bytes());
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(&status.to_wire().to_be_bytes());
    out.extend_from_slice(&0u32.to_be_bytes()); // reserved
    out.extend_from_slice(body);
    out
}

/// Either success or one of `totem_types::ApiError`'s codes, carried in the
/// frame header's `error` word (0 = success).
#[derive(Clone, Copy, Debug)]
pub enum Status {
    Ok,
    Err(ApiError),
}

impl Status {
    fn to_wire(self) -> u32 {
        match self {
            Self::Ok => 0,
            Self::Err(e) => 1 + e as u32,
        }
    }
}

async fn read_frame(stream: &mut (impl tokio::io::AsyncRead + Unpin)) -> IoResult<(MessageId, Vec<u8>)> {
    let mut header = [0u8; HEADER_LEN];
    stream.read_exact(&mut header).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            IpcError::Closed
        } else {
            IpcError::Io(e)
        }
    })?;
    let message_id = u16::from_be_bytes([header[2], header[3]]);
    let size = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
    if size > MAX_BODY_LEN {
        return Err(IpcError::BodyTooLarge(size));
    }
    let mut body = vec![0u8; size as usize];
    stream.read_exact(&mut body).await?;
    let message_id = MessageId::from_wire(message_id).ok_or(IpcError::UnknownMessage(message_id))?;
    Ok((message_id, body))
}

fn ciborium_encode<T: serde::Serialize>(value: &T) -> Vec<u8> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).expect("in-memory cbor encode cannot fail");
    buf
}

fn ciborium_decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> IoResult<T> {
    ciborium::from_reader(bytes).map_err(|e| IpcError::Decode(e.to_string()))
}

#[derive(serde::Serialize, serde::Deserialize)]
struct JoinBody {
    pid: u32,
    group: Vec<u8>,
    want_totem_membership: bool,
}

#[derive(serde::Serialize, serde::Deserialize)]
struct McastBody {
    payload: Vec<u8>,
}

#[derive(serde::Serialize, serde::Deserialize)]
struct MembershipGetBody {
    group: Vec<u8>,
}

#[derive(serde::Serialize, serde::Deserialize)]
struct ProcessRecordWire {
    node: u32,
    pid: u32,
}

impl From<ProcessRecord> for ProcessRecordWire {
    fn from(r: ProcessRecord) -> Self {
        Self { node: r.node.get(), pid: r.pid.0 }
    }
}

/// What a connection's reader task asks the event loop to do; `reply`
/// completes synchronous calls (membership_get, local_get) and acks
/// asynchronous ones (join/leave/mcast accepted or backpressured).
pub struct ClientRequest {
    pub client: ClientId,
    pub op: ClientOp,
    pub reply: oneshot::Sender<ClientReply>,
}

pub enum ClientOp {
    Join { pid: Pid, group: GroupName, want_totem_membership: bool },
    Leave,
    Mcast { payload: Vec<u8> },
    MembershipGet { group: GroupName },
    LocalGet,
    /// Sent once the connection's reader loop exits, so the event loop can
    /// run `CpgService::finalize` even if the client never called `Leave`.
    Disconnect,
}

pub enum ClientReply {
    Ack,
    Error(ApiError),
    Membership(Vec<ProcessRecord>),
    Local(Option<(GroupName, totem_cpg::ClientState)>),
}

impl ClientReply {
    fn into_frame(self, message_id: MessageId) -> Vec<u8> {
        match self {
            ClientReply::Ack => encode_frame(message_id, Status::Ok, &[]),
            ClientReply::Error(e) => encode_frame(message_id, Status::Err(e), &[]),
            ClientReply::Membership(records) => {
                let wire: Vec<ProcessRecordWire> = records.into_iter().map(Into::into).collect();
                encode_frame(message_id, Status::Ok, &ciborium_encode(&wire))
            }
            ClientReply::Local(entry) => {
                let wire = entry.map(|(group, state)| (group.as_bytes().to_vec(), format!("{state:?}")));
                encode_frame(message_id, Status::Ok, &ciborium_encode(&wire))
            }
        }
    }
}

/// Registry of live connections' push channels, shared between the IPC
/// server's reader tasks and the event loop so the loop can deliver
/// `CpgEvent`s to a specific client without holding a connection handle
/// itself.
#[derive(Clone, Default)]
pub struct IpcHandle {
    outboxes: Arc<Mutex<HashMap<ClientId, mpsc::UnboundedSender<Vec<u8>>>>>,
}

impl IpcHandle {
    pub async fn push_confchg(&self, client: ClientId, group: &GroupName, joined: &[ProcessRecord], left: &[ProcessRecord]) {
        #[derive(serde::Serialize)]
        struct Wire {
            group: Vec<u8>,
            joined: Vec<ProcessRecordWire>,
            left: Vec<ProcessRecordWire>,
        }
        let wire = Wire {
            group: group.as_bytes().to_vec(),
            joined: joined.iter().copied().map(Into::into).collect(),
            left: left.iter().copied().map(Into::into).collect(),
        };
        self.send(client, encode_frame(MessageId::Confchg, Status::Ok, &ciborium_encode(&wire))).await;
    }

    pub async fn push_deliver(&self, client: ClientId, group: &GroupName, source: ProcessRecord, payload: &[u8]) {
        #[derive(serde::Serialize)]
        struct Wire {
            group: Vec<u8>,
            source: ProcessRecordWire,
            payload: Vec<u8>,
        }
        let wire = Wire { group: group.as_bytes().to_vec(), source: source.into(), payload: payload.to_vec() };
        self.send(client, encode_frame(MessageId::Deliver, Status::Ok, &ciborium_encode(&wire))).await;
    }

    pub async fn push_totem_membership(&self, client: ClientId, group: &GroupName) {
        #[derive(serde::Serialize)]
        struct Wire {
            group: Vec<u8>,
        }
        let wire = Wire { group: group.as_bytes().to_vec() };
        self.send(client, encode_frame(MessageId::TotemMembership, Status::Ok, &ciborium_encode(&wire))).await;
    }

    async fn send(&self, client: ClientId, frame: Vec<u8>) {
        let outboxes = self.outboxes.lock().await;
        if let Some(tx) = outboxes.get(&client) {
            // A closed receiver just means the connection already dropped;
            // the reader task's disconnect handling will finalize it.
            let _ = tx.send(frame);
        }
    }

    async fn register(&self, client: ClientId, tx: mpsc::UnboundedSender<Vec<u8>>) {
        self.outboxes.lock().await.insert(client, tx);
    }

    async fn unregister(&self, client: ClientId) {
        self.outboxes.lock().await.remove(&client);
    }
}

/// Binds the Unix socket and accepts connections, spawning one reader/
/// writer task pair per client.
pub struct IpcServer {
    socket_path: PathBuf,
    requests_tx: mpsc::Sender<ClientRequest>,
    handle: IpcHandle,
    next_client: AtomicU64,
}

impl IpcServer {
    pub fn new(socket_path: impl Into<PathBuf>, requests_tx: mpsc::Sender<ClientRequest>) -> Self {
        Self { socket_path: socket_path.into(), requests_tx, handle: IpcHandle::default(), next_client: AtomicU64::new(1) }
    }

    pub fn handle(&self) -> IpcHandle {
        self.handle.clone()
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        if let Some(parent) = self.socket_path.parent() {
            tokio::fs::create_dir_all(parent).await.ok();
        }
        remove_stale_socket(&self.socket_path);

        let listener = UnixListener::bind(&self.socket_path)?;
        tracing::info!(path = %self.socket_path.display(), "cpg ipc server listening");

        loop {
            let (stream, _addr) = listener.accept().await?;
            let client = ClientId(self.next_client.fetch_add(1, Ordering::Relaxed));
            let requests_tx = self.requests_tx.clone();
            let handle = self.handle.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(client, stream, requests_tx, handle.clone()).await {
                    tracing::debug!(client = client.0, error = %e, "cpg client connection ended");
                }
                handle.unregister(client).await;
            });
        }
    }
}

fn remove_stale_socket(path: &Path) {
    if path.exists() {
        let _ = std::fs::remove_file(path);
    }
}

async fn handle_connection(
    client: ClientId,
    stream: UnixStream,
    requests_tx: mpsc::Sender<ClientRequest>,
    handle: IpcHandle,
) -> IoResult<()> {
    let (mut read_half, mut write_half) = stream.into_split();
    let (outbox_tx, mut outbox_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    handle.register(client, outbox_tx).await;

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbox_rx.recv().await {
            if write_half.write_all(&frame).await.is_err() {
                break;
            }
        }
    });

    let result = async {
        loop {
            let (message_id, body) = read_frame(&mut read_half).await?;
            let op = match message_id {
                MessageId::Join => {
                    let req: JoinBody = ciborium_decode(&body)?;
                    let Ok(group) = GroupName::new(req.group) else {
                        send_error(client, &handle, MessageId::Reply, ApiError::InvalidParam).await;
                        continue;
                    };
                    ClientOp::Join { pid: Pid::new(req.pid), group, want_totem_membership: req.want_totem_membership }
                }
                MessageId::Leave => ClientOp::Leave,
                MessageId::Mcast => {
                    let req: McastBody = ciborium_decode(&body)?;
                    ClientOp::Mcast { payload: req.payload }
                }
                MessageId::MembershipGet => {
                    let req: MembershipGetBody = ciborium_decode(&body)?;
                    let Ok(group) = GroupName::new(req.group) else {
                        send_error(client, &handle, MessageId::Reply, ApiError::InvalidParam).await;
                        continue;
                    };
                    ClientOp::MembershipGet { group }
                }
                MessageId::LocalGet => ClientOp::LocalGet,
                other => {
                    tracing::debug!(client = client.0, ?other, "ignoring unexpected push-only message id from client");
                    continue;
                }
            };

            let (reply_tx, reply_rx) = oneshot::channel();
            if requests_tx.send(ClientRequest { client, op, reply: reply_tx }).await.is_err() {
                return Err(IpcError::Closed);
            }
            let Ok(reply) = reply_rx.await else {
                return Err(IpcError::Closed);
            };
            // Route the reply through the same outbox the pushed events
            // use, so replies and pushes never interleave out of order.
            handle.send(client, reply.into_frame(MessageId::Reply)).await;
        }
    }
    .await;

    // Best-effort: let the event loop finalize this client's CPG state even
    // when the reader loop exited without an explicit `Leave`. The reply
    // half is dropped unawaited; nothing is listening for it.
    let (reply_tx, _reply_rx) = oneshot::channel();
    let _ = requests_tx.send(ClientRequest { client, op: ClientOp::Disconnect, reply: reply_tx }).await;

    writer.abort();
    result
}

async fn send_error(client: ClientId, handle: &IpcHandle, message_id: MessageId, err: ApiError) {
    handle.send(client, encode_frame(message_id, Status::Err(err), &[])).await;
}
