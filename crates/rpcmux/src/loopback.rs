//! In-process connection
//!
//! `Connection` implements the transport traits without a socket so calls
//! can run end to end inside one process. The client opens streams with
//! odd ids (1, 3, 5, ...); each stream is registered in the connection's
//! `StreamMap` under the connection lock.
//!
//! Every outbound frame is routed by stream id through that map:
//!
//! ```text
//! endpoint --frame--> lookup(id) --Some--> stream.deliver() --> parked recv batches
//!                          `--None--> dropped, send op fails
//! ```
//!
//! A stream is announced to the `Listener` when its first client frame
//! arrives. Trailers or cancellation retire it from the map. Receive ops
//! park on the stream until data, end of stream, status or cancellation
//! satisfies them; completions are posted after the stream lock is
//! released.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Instant;

use bytes::Bytes;
use rpcmux_core::{
    BatchDone, CompletionQueue, Deadline, MetadataMap, OpData, RecvCell, Side, Status,
    StatusCode, StreamMap, Transport, TransportError, TransportStream, WireOp, WireStatus,
};
use rpcmux_runtime::{ConfigError, MuxConfig};

use crate::call::Call;

/// Stream ids are 31-bit.
const MAX_STREAM_ID: u32 = (1 << 31) - 1;

enum Frame {
    Headers(MetadataMap),
    Data(Bytes),
    EndStream,
    Trailers(WireStatus),
}

impl Frame {
    fn name(&self) -> &'static str {
        match self {
            Frame::Headers(_) => "HEADERS",
            Frame::Data(_) => "DATA",
            Frame::EndStream => "END_STREAM",
            Frame::Trailers(_) => "TRAILERS",
        }
    }
}

enum RecvOp {
    InitialMetadata(RecvCell<MetadataMap>),
    Message(RecvCell<Bytes>),
    Status(RecvCell<WireStatus>),
    Close(RecvCell<bool>),
}

struct PendingBatch {
    ops: VecDeque<RecvOp>,
    ok: bool,
    done: BatchDone,
}

/// Frames received by one endpoint and not yet handed to a batch.
#[derive(Default)]
struct Inbound {
    headers: Option<MetadataMap>,
    headers_seen: bool,
    messages: VecDeque<Bytes>,
    end_of_stream: bool,
    /// Trailers; client endpoint only.
    status: Option<WireStatus>,
    pending: Vec<PendingBatch>,
}

#[derive(Default)]
struct StreamState {
    to_client: Inbound,
    to_server: Inbound,
    announced: bool,
    status_sent: bool,
    cancelled: Option<Status>,
}

type Ready = Vec<(BatchDone, bool)>;

struct LoopStream {
    id: u32,
    method: String,
    deadline: Deadline,
    conn: Weak<ConnShared>,
    state: Mutex<StreamState>,
}

impl LoopStream {
    fn lock(&self) -> MutexGuard<'_, StreamState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply a frame sent by `from`. `false` if the stream no longer
    /// accepts frames.
    fn deliver(self: &Arc<Self>, from: Side, frame: Frame) -> bool {
        let mut announce = None;
        let mut retire = false;
        let name = frame.name();

        let (accepted, ready) = {
            let mut st = self.lock();
            if st.cancelled.is_some() || st.status_sent {
                (false, Vec::new())
            } else {
                let accepted = match from {
                    Side::Client => {
                        let first = !st.announced;
                        st.announced = true;
                        match frame {
                            Frame::Headers(md) => {
                                if first {
                                    announce = Some(md);
                                }
                                true
                            }
                            Frame::Data(payload) => {
                                if first {
                                    announce = Some(MetadataMap::new());
                                }
                                st.to_server.messages.push_back(payload);
                                true
                            }
                            Frame::EndStream => {
                                if first {
                                    announce = Some(MetadataMap::new());
                                }
                                st.to_server.end_of_stream = true;
                                true
                            }
                            Frame::Trailers(_) => false,
                        }
                    }
                    Side::Server => {
                        let inbound = &mut st.to_client;
                        match frame {
                            Frame::Headers(md) => {
                                if !inbound.headers_seen {
                                    inbound.headers_seen = true;
                                    inbound.headers = Some(md);
                                }
                                true
                            }
                            Frame::Data(payload) => {
                                if !inbound.headers_seen {
                                    inbound.headers_seen = true;
                                    inbound.headers = Some(MetadataMap::new());
                                }
                                inbound.messages.push_back(payload);
                                true
                            }
                            Frame::Trailers(mut status) => {
                                if status.code != StatusCode::Ok && status.error_string.is_none() {
                                    status.error_string = Some(format!(
                                        "stream {} finished with {}: {}",
                                        self.id, status.code, status.details
                                    ));
                                }
                                inbound.status = Some(status);
                                inbound.end_of_stream = true;
                                st.status_sent = true;
                                retire = true;
                                true
                            }
                            Frame::EndStream => false,
                        }
                    }
                };
                (accepted, self.progress(&mut st))
            }
        };

        if !accepted {
            log::debug!("stream {}: {from} {name} frame rejected", self.id);
        }
        complete_all(ready);

        if let Some(conn) = self.conn.upgrade() {
            if let Some(metadata) = announce {
                conn.announce(IncomingCall {
                    stream: Arc::clone(self),
                    metadata,
                    max_pluckers: conn.max_pluckers,
                });
            }
            if retire {
                conn.retire(self.id);
            }
        }
        accepted
    }

    /// Queue a receive batch for the `side` endpoint.
    fn park(&self, side: Side, batch: PendingBatch) {
        let ready = {
            let mut st = self.lock();
            match side {
                Side::Client => st.to_client.pending.push(batch),
                Side::Server => st.to_server.pending.push(batch),
            }
            self.progress(&mut st)
        };
        complete_all(ready);
    }

    fn cancel(&self, status: Status) {
        let ready = {
            let mut st = self.lock();
            if st.cancelled.is_some() || st.status_sent {
                return;
            }
            log::debug!("stream {} cancelled: {status}", self.id);
            st.cancelled = Some(status);
            self.progress(&mut st)
        };
        complete_all(ready);
        if let Some(conn) = self.conn.upgrade() {
            conn.retire(self.id);
        }
    }

    /// Satisfy whatever parked receive ops can be satisfied now.
    fn progress(&self, st: &mut StreamState) -> Ready {
        let cancelled = st.cancelled.clone();
        let status_sent = st.status_sent;
        let mut ready = Vec::new();

        for inbound in [&mut st.to_client, &mut st.to_server] {
            for mut batch in std::mem::take(&mut inbound.pending) {
                while let Some(op) = batch.ops.front() {
                    match satisfy(op, inbound, cancelled.as_ref(), status_sent, self.id) {
                        Some(ok) => {
                            batch.ok &= ok;
                            batch.ops.pop_front();
                        }
                        None => break,
                    }
                }
                if batch.ops.is_empty() {
                    ready.push((batch.done, batch.ok));
                } else {
                    inbound.pending.push(batch);
                }
            }
        }
        ready
    }
}

/// `Some(ok)` once `op` is settled, `None` while it must keep waiting.
fn satisfy(
    op: &RecvOp,
    inbound: &mut Inbound,
    cancelled: Option<&Status>,
    status_sent: bool,
    id: u32,
) -> Option<bool> {
    match op {
        RecvOp::InitialMetadata(cell) => {
            if let Some(md) = inbound.headers.take() {
                cell.fill(md);
                Some(true)
            } else if inbound.headers_seen || inbound.status.is_some() {
                // Already delivered, or trailers-only response.
                inbound.headers_seen = true;
                cell.fill(MetadataMap::new());
                Some(true)
            } else if cancelled.is_some() {
                Some(false)
            } else {
                None
            }
        }
        RecvOp::Message(cell) => {
            if let Some(payload) = inbound.messages.pop_front() {
                cell.fill(payload);
                Some(true)
            } else if inbound.end_of_stream {
                Some(true)
            } else if cancelled.is_some() {
                Some(false)
            } else {
                None
            }
        }
        RecvOp::Status(cell) => {
            if let Some(status) = &inbound.status {
                cell.fill(status.clone());
                Some(true)
            } else if let Some(status) = cancelled {
                let mut wire = WireStatus::new(status.code(), status.message());
                wire.error_string = Some(format!("stream {id} cancelled: {status}"));
                cell.fill(wire);
                Some(true)
            } else {
                None
            }
        }
        RecvOp::Close(cell) => {
            if status_sent {
                cell.fill(false);
                Some(true)
            } else if cancelled.is_some() {
                cell.fill(true);
                Some(true)
            } else {
                None
            }
        }
    }
}

fn complete_all(ready: Ready) {
    for (done, ok) in ready {
        done.complete(ok);
    }
}

// ============================================================================
// Endpoints
// ============================================================================

/// One side's view of a stream.
struct Endpoint {
    side: Side,
    stream: Arc<LoopStream>,
}

impl Endpoint {
    fn route(&self, frame: Frame) -> bool {
        let target = self
            .stream
            .conn
            .upgrade()
            .and_then(|conn| conn.lookup(self.stream.id));
        match target {
            Some(stream) => stream.deliver(self.side, frame),
            None => {
                log::debug!(
                    "stream {}: dropping {} frame, stream retired",
                    self.stream.id,
                    frame.name()
                );
                false
            }
        }
    }
}

impl TransportStream for Endpoint {
    fn id(&self) -> u32 {
        self.stream.id
    }

    fn start_batch(&self, ops: Vec<WireOp>, done: BatchDone) {
        let mut send_ok = true;
        let mut recv = VecDeque::new();

        for op in ops {
            let frame = match op.data {
                OpData::SendInitialMetadata { metadata } => Frame::Headers(metadata),
                OpData::SendMessage { payload } => Frame::Data(payload),
                OpData::SendCloseFromClient => Frame::EndStream,
                OpData::SendStatusFromServer { status } => Frame::Trailers(status),
                OpData::RecvInitialMetadata { metadata } => {
                    recv.push_back(RecvOp::InitialMetadata(metadata));
                    continue;
                }
                OpData::RecvMessage { message } => {
                    recv.push_back(RecvOp::Message(message));
                    continue;
                }
                OpData::RecvStatusOnClient { status } => {
                    recv.push_back(RecvOp::Status(status));
                    continue;
                }
                OpData::RecvCloseOnServer { cancelled } => {
                    recv.push_back(RecvOp::Close(cancelled));
                    continue;
                }
            };
            // After a failed send the rest of the batch's sends are skipped.
            if send_ok && !self.route(frame) {
                send_ok = false;
            }
        }

        if recv.is_empty() {
            done.complete(send_ok);
        } else {
            self.stream.park(
                self.side,
                PendingBatch {
                    ops: recv,
                    ok: send_ok,
                    done,
                },
            );
        }
    }

    fn cancel(&self, status: Status) {
        self.stream.cancel(status);
    }
}

// ============================================================================
// Connection
// ============================================================================

struct ConnState {
    streams: StreamMap<Arc<LoopStream>>,
    next_id: u32,
    incoming: VecDeque<IncomingCall>,
    closed: bool,
}

struct ConnShared {
    state: Mutex<ConnState>,
    incoming_ready: Condvar,
    max_pluckers: usize,
}

impl ConnShared {
    fn lock(&self) -> MutexGuard<'_, ConnState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lookup(&self, id: u32) -> Option<Arc<LoopStream>> {
        let st = self.lock();
        if st.closed {
            return None;
        }
        st.streams.find(id).cloned()
    }

    fn announce(&self, call: IncomingCall) {
        let mut st = self.lock();
        if st.closed {
            return;
        }
        log::debug!("stream {}: announcing {}", call.stream.id, call.stream.method);
        st.incoming.push_back(call);
        drop(st);
        self.incoming_ready.notify_one();
    }

    fn retire(&self, id: u32) {
        if self.lock().streams.delete(id).is_some() {
            log::debug!("stream {id} retired");
        }
    }
}

/// In-process connection. Clones share the connection.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<ConnShared>,
}

impl Connection {
    /// Connection configured from the environment.
    pub fn new() -> Result<Self, ConfigError> {
        Self::with_config(&MuxConfig::from_env())
    }

    /// Server calls on this connection get queues capped at
    /// `config.max_pluckers`.
    pub fn with_config(config: &MuxConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(ConnShared {
                state: Mutex::new(ConnState {
                    streams: StreamMap::with_capacity(config.stream_map_capacity),
                    next_id: 1,
                    incoming: VecDeque::new(),
                    closed: false,
                }),
                incoming_ready: Condvar::new(),
                max_pluckers: config.max_pluckers,
            }),
        })
    }

    /// Server side: receives calls opened on this connection.
    pub fn listener(&self) -> Listener {
        Listener {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Cancel every live stream with UNAVAILABLE and refuse new ones.
    pub fn close(&self) {
        let streams: Vec<Arc<LoopStream>> = {
            let mut st = self.shared.lock();
            if st.closed {
                return;
            }
            st.closed = true;
            st.incoming.clear();
            st.streams.iter().map(|(_, s)| Arc::clone(s)).collect()
        };
        self.shared.incoming_ready.notify_all();

        log::debug!("connection closing, cancelling {} streams", streams.len());
        for stream in streams {
            stream.cancel(Status::new(StatusCode::Unavailable, "connection closed"));
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Streams still registered (not yet retired).
    pub fn active_streams(&self) -> usize {
        self.shared.lock().streams.len()
    }
}

impl Transport for Connection {
    fn open_stream(
        &self,
        method: &str,
        deadline: Deadline,
    ) -> Result<Arc<dyn TransportStream>, TransportError> {
        let mut st = self.shared.lock();
        if st.closed {
            return Err(TransportError::Closed);
        }
        if st.next_id > MAX_STREAM_ID {
            return Err(TransportError::StreamIdsExhausted);
        }
        let id = st.next_id;
        st.next_id += 2;

        let stream = Arc::new(LoopStream {
            id,
            method: method.to_owned(),
            deadline,
            conn: Arc::downgrade(&self.shared),
            state: Mutex::new(StreamState::default()),
        });
        st.streams.add(id, Arc::clone(&stream));
        Ok(Arc::new(Endpoint {
            side: Side::Client,
            stream,
        }))
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.shared.lock();
        f.debug_struct("Connection")
            .field("streams", &st.streams.keys())
            .field("incoming", &st.incoming.len())
            .field("closed", &st.closed)
            .finish()
    }
}

/// Accepts calls opened on a `Connection`.
pub struct Listener {
    shared: Arc<ConnShared>,
}

impl Listener {
    /// Next announced call; `None` on deadline or connection close.
    pub fn accept(&self, deadline: Deadline) -> Option<IncomingCall> {
        let mut st = self.shared.lock();
        loop {
            if let Some(call) = st.incoming.pop_front() {
                return Some(call);
            }
            if st.closed {
                return None;
            }
            st = match deadline {
                None => self
                    .shared
                    .incoming_ready
                    .wait(st)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(at) => {
                    let now = Instant::now();
                    if now >= at {
                        return None;
                    }
                    self.shared
                        .incoming_ready
                        .wait_timeout(st, at - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }
}

/// A call announced to the server side.
pub struct IncomingCall {
    stream: Arc<LoopStream>,
    metadata: MetadataMap,
    max_pluckers: usize,
}

impl IncomingCall {
    pub fn method(&self) -> &str {
        &self.stream.method
    }

    /// Client request metadata.
    pub fn metadata(&self) -> &MetadataMap {
        &self.metadata
    }

    pub fn deadline(&self) -> Deadline {
        self.stream.deadline
    }

    pub fn stream_id(&self) -> u32 {
        self.stream.id
    }

    /// Completion queue sized by the connection's configuration.
    pub fn new_completion_queue(&self) -> CompletionQueue {
        CompletionQueue::with_max_pluckers(self.max_pluckers)
    }

    /// Server-side call bound to `cq`.
    pub fn into_call(self, cq: &CompletionQueue) -> Call {
        let method = self.stream.method.clone();
        let endpoint = Endpoint {
            side: Side::Server,
            stream: self.stream,
        };
        Call::new(Arc::new(endpoint), Side::Server, cq.clone(), method)
    }
}

impl fmt::Debug for IncomingCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IncomingCall")
            .field("stream", &self.stream.id)
            .field("method", &self.stream.method)
            .finish()
    }
}
