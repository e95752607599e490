//! Blocking call helpers.
//!
//! Every helper owns a private completion queue. Each step builds an
//! `OpSet`, submits it under a fresh tag and plucks that tag. If the pluck
//! runs into the call deadline the call is cancelled with DEADLINE_EXCEEDED
//! and the tag is plucked again without a deadline; cancellation guarantees
//! it completes.
//!
//! | helper                  | shape                    |
//! |-------------------------|--------------------------|
//! | `blocking_unary_call`   | one request, one reply   |
//! | `ClientReader`          | one request, reply stream|
//! | `ClientWriter`          | request stream, one reply|
//! | `ClientReaderWriter`    | both directions streamed |
//! | `ServerCall`            | server side of any shape |
//!
//! Client helpers that are dropped before `finish` cancel their call. A
//! `ServerCall` dropped before `finish` reports UNKNOWN to the client.

use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use rpcmux_core::{
    CallError, CodecError, CompletionQueue, Deadline, Event, Message, MetadataMap, OpSet,
    Received, Status, StatusCode, Tag, TransportError, WriteOptions,
};

use crate::call::{Call, ClientContext, ContextSlots};
use crate::channel::Channel;
use crate::loopback::IncomingCall;

// ============================================================================
// Private queue
// ============================================================================

/// Completion queue owned by one helper. Shut down and drained on drop.
struct PrivateQueue {
    cq: CompletionQueue,
    next_tag: AtomicU64,
}

impl PrivateQueue {
    fn new(cq: CompletionQueue) -> Self {
        Self {
            cq,
            next_tag: AtomicU64::new(1),
        }
    }

    fn cq(&self) -> &CompletionQueue {
        &self.cq
    }

    fn next_tag(&self) -> Tag {
        Tag(self.next_tag.fetch_add(1, Ordering::Relaxed))
    }

    /// Submit `ops` on `call` and wait for them.
    fn run(&self, call: &Call, ops: OpSet, deadline: Deadline) -> Result<bool, CallError> {
        let tag = self.next_tag();
        call.perform_ops(ops, tag)?;
        Ok(match self.cq.pluck(tag, deadline) {
            Event::Op { ok, .. } => ok,
            Event::Timeout => {
                call.cancel_with_status(Status::new(
                    StatusCode::DeadlineExceeded,
                    "Deadline Exceeded",
                ));
                self.cq.pluck(tag, None).is_ok()
            }
            Event::Shutdown => false,
        })
    }

    /// `run` for steps that only report success.
    fn run_logged(&self, call: &Call, ops: OpSet, deadline: Deadline) -> bool {
        self.run(call, ops, deadline).unwrap_or_else(|e| {
            log::warn!("{} call {}: batch not submitted: {e}", call.side(), call.method());
            false
        })
    }
}

impl Drop for PrivateQueue {
    fn drop(&mut self) {
        self.cq.shutdown();
        loop {
            match self.cq.next(None) {
                Event::Shutdown => break,
                Event::Op { tag, ok } => log::trace!("drained {tag} ok={ok} on drop"),
                Event::Timeout => {}
            }
        }
    }
}

fn call_error_status(e: CallError) -> Status {
    match e {
        CallError::Transport(TransportError::Closed) => {
            Status::new(StatusCode::Unavailable, e.to_string())
        }
        other => Status::new(StatusCode::Internal, other.to_string()),
    }
}

fn codec_error_status(e: CodecError) -> Status {
    Status::new(StatusCode::Internal, e.to_string())
}

fn missing_status() -> Status {
    Status::new(StatusCode::Unknown, "call completed without a status")
}

/// Combine a finished single-response batch into the caller's result.
fn response_result<Resp>(
    ok: bool,
    status: &Received<Status>,
    resp: &Received<Resp>,
) -> Result<Resp, Status> {
    let status = status.take().unwrap_or_else(missing_status);
    if !status.is_ok() {
        return Err(status);
    }
    match resp.take() {
        Some(resp) => Ok(resp),
        None if ok => Err(Status::new(
            StatusCode::Unimplemented,
            "No message returned for unary request",
        )),
        None => Err(Status::new(StatusCode::Internal, "Failed to parse response")),
    }
}

/// Receive the final status (and initial metadata if still pending) into
/// the context slots.
fn recv_status_ops(ops: &mut OpSet, slots: &ContextSlots) -> Received<Status> {
    if !slots.initial_metadata.is_set() {
        ops.recv_initial_metadata_into(slots.initial_metadata.clone());
    }
    let status = Received::new();
    ops.client_recv_status_into(
        status.clone(),
        slots.trailing_metadata.clone(),
        slots.debug_error_string.clone(),
    );
    status
}

/// Open a call on a fresh private queue.
fn open(
    channel: &Channel,
    method: &str,
    ctx: &ClientContext,
) -> Result<(Call, PrivateQueue), Status> {
    let queue = PrivateQueue::new(channel.new_completion_queue());
    let call = channel
        .create_call(method, ctx, queue.cq())
        .map_err(call_error_status)?;
    Ok((call, queue))
}

// ============================================================================
// Unary
// ============================================================================

/// Send `req` and wait for the single response.
///
/// All six client ops go out as one batch.
pub fn blocking_unary_call<Req, Resp>(
    channel: &Channel,
    method: &str,
    ctx: &ClientContext,
    req: &Req,
) -> Result<Resp, Status>
where
    Req: Message,
    Resp: Message,
{
    let (call, queue) = open(channel, method, ctx)?;
    let slots = ctx.slots();

    let mut ops = OpSet::new();
    ops.send_initial_metadata(ctx.send_metadata().clone(), 0);
    ops.send_message(req, WriteOptions::new())
        .map_err(codec_error_status)?;
    ops.client_send_close();
    let resp = ops.recv_message::<Resp>();
    ops.allow_no_message();
    let status = recv_status_ops(&mut ops, &slots);

    let ok = queue
        .run(&call, ops, ctx.deadline())
        .map_err(call_error_status)?;
    response_result(ok, &status, &resp)
}

// ============================================================================
// Server streaming
// ============================================================================

/// Client side of a server-streaming call.
pub struct ClientReader<R> {
    call: Call,
    queue: PrivateQueue,
    deadline: Deadline,
    slots: ContextSlots,
    finished: bool,
    _marker: PhantomData<fn() -> R>,
}

impl<R: Message> ClientReader<R> {
    /// Start the call: metadata, the request and the half-close go out
    /// together.
    pub fn new<Req: Message>(
        channel: &Channel,
        method: &str,
        ctx: &ClientContext,
        req: &Req,
    ) -> Result<Self, Status> {
        let (call, queue) = open(channel, method, ctx)?;

        let mut ops = OpSet::new();
        ops.send_initial_metadata(ctx.send_metadata().clone(), 0);
        ops.send_message(req, WriteOptions::new())
            .map_err(codec_error_status)?;
        ops.client_send_close();
        // A failed send shows up in the final status.
        queue.run_logged(&call, ops, ctx.deadline());

        Ok(Self {
            call,
            queue,
            deadline: ctx.deadline(),
            slots: ctx.slots(),
            finished: false,
            _marker: PhantomData,
        })
    }

    /// Block until the server's initial metadata is in the context.
    pub fn wait_for_initial_metadata(&mut self) -> bool {
        if self.slots.initial_metadata.is_set() {
            return true;
        }
        let mut ops = OpSet::new();
        ops.recv_initial_metadata_into(self.slots.initial_metadata.clone());
        self.queue.run_logged(&self.call, ops, self.deadline)
    }

    /// Next message; `None` once the stream is exhausted or failed.
    pub fn read(&mut self) -> Option<R> {
        let mut ops = OpSet::new();
        if !self.slots.initial_metadata.is_set() {
            ops.recv_initial_metadata_into(self.slots.initial_metadata.clone());
        }
        let msg = ops.recv_message::<R>();
        if self.queue.run_logged(&self.call, ops, self.deadline) {
            msg.take()
        } else {
            None
        }
    }

    /// Wait for the final status.
    pub fn finish(&mut self) -> Status {
        let mut ops = OpSet::new();
        let status = recv_status_ops(&mut ops, &self.slots);
        let result = self.queue.run(&self.call, ops, self.deadline);
        self.finished = true;
        match result {
            Ok(_) => status.take().unwrap_or_else(missing_status),
            Err(e) => call_error_status(e),
        }
    }
}

impl<R> Drop for ClientReader<R> {
    fn drop(&mut self) {
        if !self.finished {
            self.call.cancel();
        }
    }
}

impl<R> fmt::Debug for ClientReader<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientReader")
            .field("call", &self.call)
            .field("finished", &self.finished)
            .finish()
    }
}

// ============================================================================
// Client streaming
// ============================================================================

/// Client side of a client-streaming call.
pub struct ClientWriter<W> {
    call: Call,
    queue: PrivateQueue,
    deadline: Deadline,
    slots: ContextSlots,
    writes_done: bool,
    finished: bool,
    _marker: PhantomData<fn(W)>,
}

impl<W: Message> ClientWriter<W> {
    /// Start the call and send the request metadata.
    pub fn new(channel: &Channel, method: &str, ctx: &ClientContext) -> Result<Self, Status> {
        let (call, queue) = open(channel, method, ctx)?;

        let mut ops = OpSet::new();
        ops.send_initial_metadata(ctx.send_metadata().clone(), 0);
        queue.run_logged(&call, ops, ctx.deadline());

        Ok(Self {
            call,
            queue,
            deadline: ctx.deadline(),
            slots: ctx.slots(),
            writes_done: false,
            finished: false,
            _marker: PhantomData,
        })
    }

    pub fn write(&mut self, msg: &W) -> bool {
        self.write_with_options(msg, WriteOptions::new())
    }

    /// With `set_last_message` the half-close rides in the same batch.
    pub fn write_with_options(&mut self, msg: &W, options: WriteOptions) -> bool {
        if self.writes_done {
            log::debug!("write on {} after writes_done", self.call.method());
            return false;
        }
        let mut ops = OpSet::new();
        if let Err(e) = ops.send_message(msg, options) {
            log::warn!("{}: {e}", self.call.method());
            return false;
        }
        if options.is_last_message() {
            ops.client_send_close();
            self.writes_done = true;
        }
        self.queue.run_logged(&self.call, ops, self.deadline)
    }

    /// Half-close the request stream.
    pub fn writes_done(&mut self) -> bool {
        if self.writes_done {
            return true;
        }
        self.writes_done = true;
        let mut ops = OpSet::new();
        ops.client_send_close();
        self.queue.run_logged(&self.call, ops, self.deadline)
    }

    /// Half-close if needed, then wait for the response and status.
    pub fn finish<Resp: Message>(&mut self) -> Result<Resp, Status> {
        let mut ops = OpSet::new();
        if !self.writes_done {
            ops.client_send_close();
            self.writes_done = true;
        }
        let resp = ops.recv_message::<Resp>();
        ops.allow_no_message();
        let status = recv_status_ops(&mut ops, &self.slots);

        let result = self.queue.run(&self.call, ops, self.deadline);
        self.finished = true;
        let ok = result.map_err(call_error_status)?;
        response_result(ok, &status, &resp)
    }
}

impl<W> Drop for ClientWriter<W> {
    fn drop(&mut self) {
        if !self.finished {
            self.call.cancel();
        }
    }
}

impl<W> fmt::Debug for ClientWriter<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientWriter")
            .field("call", &self.call)
            .field("writes_done", &self.writes_done)
            .field("finished", &self.finished)
            .finish()
    }
}

// ============================================================================
// Bidirectional streaming
// ============================================================================

/// Client side of a bidirectional call.
///
/// `read` and `write` take `&self` and may run on different threads; each
/// step uses its own tag on the shared private queue.
pub struct ClientReaderWriter<W, R> {
    call: Call,
    queue: PrivateQueue,
    deadline: Deadline,
    slots: ContextSlots,
    writes_done: AtomicBool,
    finished: AtomicBool,
    _marker: PhantomData<fn(W) -> R>,
}

impl<W: Message, R: Message> ClientReaderWriter<W, R> {
    pub fn new(channel: &Channel, method: &str, ctx: &ClientContext) -> Result<Self, Status> {
        let (call, queue) = open(channel, method, ctx)?;

        let mut ops = OpSet::new();
        ops.send_initial_metadata(ctx.send_metadata().clone(), 0);
        queue.run_logged(&call, ops, ctx.deadline());

        Ok(Self {
            call,
            queue,
            deadline: ctx.deadline(),
            slots: ctx.slots(),
            writes_done: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            _marker: PhantomData,
        })
    }

    pub fn wait_for_initial_metadata(&self) -> bool {
        if self.slots.initial_metadata.is_set() {
            return true;
        }
        let mut ops = OpSet::new();
        ops.recv_initial_metadata_into(self.slots.initial_metadata.clone());
        self.queue.run_logged(&self.call, ops, self.deadline)
    }

    pub fn read(&self) -> Option<R> {
        let mut ops = OpSet::new();
        if !self.slots.initial_metadata.is_set() {
            ops.recv_initial_metadata_into(self.slots.initial_metadata.clone());
        }
        let msg = ops.recv_message::<R>();
        if self.queue.run_logged(&self.call, ops, self.deadline) {
            msg.take()
        } else {
            None
        }
    }

    pub fn write(&self, msg: &W) -> bool {
        self.write_with_options(msg, WriteOptions::new())
    }

    pub fn write_with_options(&self, msg: &W, options: WriteOptions) -> bool {
        if self.writes_done.load(Ordering::Acquire) {
            return false;
        }
        let mut ops = OpSet::new();
        if let Err(e) = ops.send_message(msg, options) {
            log::warn!("{}: {e}", self.call.method());
            return false;
        }
        if options.is_last_message() {
            ops.client_send_close();
            self.writes_done.store(true, Ordering::Release);
        }
        self.queue.run_logged(&self.call, ops, self.deadline)
    }

    pub fn writes_done(&self) -> bool {
        if self.writes_done.swap(true, Ordering::AcqRel) {
            return true;
        }
        let mut ops = OpSet::new();
        ops.client_send_close();
        self.queue.run_logged(&self.call, ops, self.deadline)
    }

    /// Wait for the final status. Does not half-close.
    pub fn finish(&self) -> Status {
        let mut ops = OpSet::new();
        let status = recv_status_ops(&mut ops, &self.slots);
        let result = self.queue.run(&self.call, ops, self.deadline);
        self.finished.store(true, Ordering::Release);
        match result {
            Ok(_) => status.take().unwrap_or_else(missing_status),
            Err(e) => call_error_status(e),
        }
    }
}

impl<W, R> Drop for ClientReaderWriter<W, R> {
    fn drop(&mut self) {
        if !self.finished.load(Ordering::Acquire) {
            self.call.cancel();
        }
    }
}

impl<W, R> fmt::Debug for ClientReaderWriter<W, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientReaderWriter")
            .field("call", &self.call)
            .field("writes_done", &self.writes_done.load(Ordering::Relaxed))
            .field("finished", &self.finished.load(Ordering::Relaxed))
            .finish()
    }
}

// ============================================================================
// Server side
// ============================================================================

/// Server side of one call, built from an accepted `IncomingCall`.
pub struct ServerCall {
    call: Call,
    queue: PrivateQueue,
    client_metadata: MetadataMap,
    deadline: Deadline,
    sent_initial_metadata: bool,
    finished: bool,
    /// Known once `finish` has run.
    cancelled: Option<bool>,
}

impl ServerCall {
    pub fn new(incoming: IncomingCall) -> Self {
        let client_metadata = incoming.metadata().clone();
        let deadline = incoming.deadline();
        let queue = PrivateQueue::new(incoming.new_completion_queue());
        let call = incoming.into_call(queue.cq());
        Self {
            call,
            queue,
            client_metadata,
            deadline,
            sent_initial_metadata: false,
            finished: false,
            cancelled: None,
        }
    }

    pub fn method(&self) -> &str {
        self.call.method()
    }

    pub fn client_metadata(&self) -> &MetadataMap {
        &self.client_metadata
    }

    pub fn deadline(&self) -> Deadline {
        self.deadline
    }

    /// Send response headers now. Only the first call sends anything.
    pub fn send_initial_metadata(&mut self, metadata: MetadataMap) -> bool {
        if self.sent_initial_metadata {
            return false;
        }
        self.sent_initial_metadata = true;
        let mut ops = OpSet::new();
        ops.send_initial_metadata(metadata, 0);
        self.queue.run_logged(&self.call, ops, self.deadline)
    }

    /// Next request message; `None` after the client half-closed.
    pub fn read<R: Message>(&mut self) -> Option<R> {
        let mut ops = OpSet::new();
        let msg = ops.recv_message::<R>();
        if self.queue.run_logged(&self.call, ops, self.deadline) {
            msg.take()
        } else {
            None
        }
    }

    /// Write a response message, sending empty headers first if needed.
    pub fn write<W: Message>(&mut self, msg: &W) -> bool {
        self.write_with_options(msg, WriteOptions::new())
    }

    pub fn write_with_options<W: Message>(&mut self, msg: &W, options: WriteOptions) -> bool {
        let mut ops = OpSet::new();
        if let Err(e) = ops.send_message(msg, options) {
            log::warn!("{}: {e}", self.call.method());
            return false;
        }
        self.with_initial_metadata(&mut ops);
        self.queue.run_logged(&self.call, ops, self.deadline)
    }

    /// Send the final status and learn whether the call was cancelled.
    pub fn finish(&mut self, status: &Status, trailing: MetadataMap) -> bool {
        let mut ops = OpSet::new();
        self.with_initial_metadata(&mut ops);
        ops.server_send_status(trailing, status);
        let cancelled = ops.recv_close_on_server();

        let ok = self.queue.run_logged(&self.call, ops, self.deadline);
        self.finished = true;
        self.cancelled = Some(cancelled.take().unwrap_or(true));
        ok
    }

    /// Whether the client saw the call cancelled. `false` until `finish`.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.unwrap_or(false)
    }

    fn with_initial_metadata(&mut self, ops: &mut OpSet) {
        if !self.sent_initial_metadata {
            ops.send_initial_metadata(MetadataMap::new(), 0);
            self.sent_initial_metadata = true;
        }
    }
}

impl Drop for ServerCall {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        // Hidden batch: completes into the private queue, drained below.
        let mut ops = OpSet::sneaky();
        ops.server_send_status(
            MetadataMap::new(),
            &Status::new(StatusCode::Unknown, "server call dropped without a status"),
        );
        let _ = ops.recv_close_on_server();
        if let Err(e) = self.call.perform_ops(ops, self.queue.next_tag()) {
            log::warn!("{}: final status not sent: {e}", self.call.method());
        }
    }
}

impl fmt::Debug for ServerCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerCall")
            .field("call", &self.call)
            .field("finished", &self.finished)
            .field("cancelled", &self.cancelled)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_result_rules() {
        let ok_status = || {
            let s = Received::new();
            s.set(Status::ok());
            s
        };

        let resp = Received::new();
        resp.set(String::from("hi"));
        assert_eq!(response_result(true, &ok_status(), &resp), Ok(String::from("hi")));

        let none: Received<String> = Received::new();
        let err = response_result(true, &ok_status(), &none).unwrap_err();
        assert_eq!(err.code(), StatusCode::Unimplemented);
        assert_eq!(err.message(), "No message returned for unary request");

        let err = response_result(false, &ok_status(), &none).unwrap_err();
        assert_eq!(err.code(), StatusCode::Internal);

        let failed = Received::new();
        failed.set(Status::new(StatusCode::NotFound, "nope"));
        let resp = Received::new();
        resp.set(String::from("ignored"));
        assert_eq!(
            response_result(true, &failed, &resp).unwrap_err().code(),
            StatusCode::NotFound
        );

        let missing: Received<Status> = Received::new();
        assert_eq!(
            response_result(true, &missing, &none).unwrap_err().code(),
            StatusCode::Unknown
        );
    }

    #[test]
    fn test_error_status_mapping() {
        let s = call_error_status(CallError::Transport(TransportError::Closed));
        assert_eq!(s.code(), StatusCode::Unavailable);
        let s = call_error_status(CallError::TooManyOperations("send"));
        assert_eq!(s.code(), StatusCode::Internal);
        let s = codec_error_status(CodecError::Decode("bad".into()));
        assert_eq!(s.code(), StatusCode::Internal);
    }

    #[test]
    fn test_private_queue_tags_are_distinct() {
        let queue = PrivateQueue::new(CompletionQueue::create());
        let a = queue.next_tag();
        let b = queue.next_tag();
        assert_ne!(a, b);
    }

    #[test]
    fn test_private_queue_drains_on_drop() {
        let cq = CompletionQueue::create();
        let queue = PrivateQueue::new(cq.clone());
        cq.begin_op(Tag(7)).unwrap();
        cq.end_op(Tag(7), true, None);
        drop(queue);
        assert_eq!(cq.state(), rpcmux_core::QueueState::Shutdown);
        assert_eq!(cq.unclaimed(), 0);
    }

    #[test]
    fn test_server_call_queue_follows_connection_config() {
        use crate::loopback::Connection;
        use rpcmux_core::{deadline_after, OpSet, Side, Transport};
        use rpcmux_runtime::MuxConfig;
        use std::time::Duration;

        let conn = Connection::with_config(&MuxConfig::new().max_pluckers(2)).unwrap();
        let listener = conn.listener();
        let cq = CompletionQueue::create();
        let stream = conn.open_stream("/svc/Sized", None).unwrap();
        let client = Call::new(stream, Side::Client, cq.clone(), "/svc/Sized");
        let mut ops = OpSet::new();
        ops.send_initial_metadata(MetadataMap::new(), 0);
        client.perform_ops(ops, Tag(1)).unwrap();
        assert!(cq.pluck(Tag(1), None).is_ok());

        let incoming = listener
            .accept(deadline_after(Duration::from_secs(5)))
            .unwrap();
        let server = ServerCall::new(incoming);
        assert_eq!(server.call.completion_queue().max_pluckers(), 2);
    }
}
