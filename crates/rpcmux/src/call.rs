//! Calls and client call context.
//!
//! A `Call` is one stream on a connection bound to a completion queue.
//! `perform_ops` validates a batch, marks its directions busy, registers the
//! tag with the queue and hands the wire ops to the transport. At most one
//! send-direction and one receive-direction batch may be in flight at a
//! time; the guards are released when the transport completes the batch.

use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rpcmux_core::{
    deadline_after, BatchDone, CallError, CompletionQueue, Deadline, InFlightGuard,
    MetadataMap, OpSet, Received, Side, Status, Tag, TransportStream,
};

struct CallInner {
    stream: Arc<dyn TransportStream>,
    side: Side,
    cq: CompletionQueue,
    method: String,
    sending: Arc<AtomicBool>,
    receiving: Arc<AtomicBool>,
}

/// Handle to one call. Clones refer to the same call.
#[derive(Clone)]
pub struct Call {
    inner: Arc<CallInner>,
}

impl Call {
    pub fn new(
        stream: Arc<dyn TransportStream>,
        side: Side,
        cq: CompletionQueue,
        method: impl Into<String>,
    ) -> Self {
        Self {
            inner: Arc::new(CallInner {
                stream,
                side,
                cq,
                method: method.into(),
                sending: Arc::new(AtomicBool::new(false)),
                receiving: Arc::new(AtomicBool::new(false)),
            }),
        }
    }

    /// Submit `ops`; its completion is posted to this call's queue under
    /// `tag`.
    ///
    /// On error nothing was submitted and no completion will be posted.
    pub fn perform_ops(&self, mut ops: OpSet, tag: Tag) -> Result<(), CallError> {
        ops.check(self.inner.side)?;

        let send_guard = if ops.has_send_ops() {
            Some(
                InFlightGuard::try_acquire(&self.inner.sending)
                    .ok_or(CallError::TooManyOperations("send"))?,
            )
        } else {
            None
        };
        let recv_guard = if ops.has_recv_ops() {
            Some(
                InFlightGuard::try_acquire(&self.inner.receiving)
                    .ok_or(CallError::TooManyOperations("receive"))?,
            )
        } else {
            None
        };

        self.inner.cq.begin_op(tag)?;

        let wire = ops.fill_ops();
        log::debug!(
            "{} call {} stream {}: submitting {:?} as {tag}",
            self.inner.side,
            self.inner.method,
            self.inner.stream.id(),
            ops.op_codes()
        );

        let mut done = BatchDone::new(self.inner.cq.clone(), tag, Some(Box::new(ops)));
        for guard in [send_guard, recv_guard].into_iter().flatten() {
            done = done.with_guard(guard);
        }
        self.inner.stream.start_batch(wire, done);
        Ok(())
    }

    /// Cancel with CANCELLED.
    pub fn cancel(&self) {
        self.cancel_with_status(Status::cancelled());
    }

    /// Abort the call with `status`. Every outstanding batch still
    /// completes.
    pub fn cancel_with_status(&self, status: Status) {
        log::debug!(
            "{} call {} stream {}: cancel with {status}",
            self.inner.side,
            self.inner.method,
            self.inner.stream.id()
        );
        self.inner.stream.cancel(status);
    }

    #[inline]
    pub fn side(&self) -> Side {
        self.inner.side
    }

    pub fn method(&self) -> &str {
        &self.inner.method
    }

    pub fn stream_id(&self) -> u32 {
        self.inner.stream.id()
    }

    pub fn completion_queue(&self) -> &CompletionQueue {
        &self.inner.cq
    }
}

impl fmt::Debug for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Call")
            .field("side", &self.inner.side)
            .field("method", &self.inner.method)
            .field("stream", &self.inner.stream.id())
            .finish()
    }
}

// ============================================================================
// Client context
// ============================================================================

/// Per-call client settings and the metadata the server sent back.
#[derive(Debug, Default)]
pub struct ClientContext {
    deadline: Deadline,
    metadata: MetadataMap,
    initial_metadata: Received<MetadataMap>,
    trailing_metadata: Received<MetadataMap>,
    debug_error_string: Received<String>,
}

/// Destinations a blocking helper fills for its context.
#[derive(Clone)]
pub(crate) struct ContextSlots {
    pub(crate) initial_metadata: Received<MetadataMap>,
    pub(crate) trailing_metadata: Received<MetadataMap>,
    pub(crate) debug_error_string: Received<String>,
}

impl ClientContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_deadline(&mut self, deadline: Deadline) -> &mut Self {
        self.deadline = deadline;
        self
    }

    /// Deadline `timeout` from now.
    pub fn set_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.deadline = deadline_after(timeout);
        self
    }

    /// Metadata sent with the request headers.
    pub fn add_metadata(&mut self, key: &str, value: impl Into<Bytes>) -> &mut Self {
        self.metadata.insert(key, value);
        self
    }

    #[inline]
    pub fn deadline(&self) -> Deadline {
        self.deadline
    }

    pub fn send_metadata(&self) -> &MetadataMap {
        &self.metadata
    }

    /// Server initial metadata, once received.
    pub fn server_initial_metadata(&self) -> Option<MetadataMap> {
        self.initial_metadata.get()
    }

    /// Server trailing metadata, once the call finished.
    pub fn server_trailing_metadata(&self) -> Option<MetadataMap> {
        self.trailing_metadata.get()
    }

    /// Transport diagnostic for a failed call.
    pub fn debug_error_string(&self) -> Option<String> {
        self.debug_error_string.get()
    }

    pub fn initial_metadata_received(&self) -> bool {
        self.initial_metadata.is_set()
    }

    pub(crate) fn slots(&self) -> ContextSlots {
        ContextSlots {
            initial_metadata: self.initial_metadata.clone(),
            trailing_metadata: self.trailing_metadata.clone(),
            debug_error_string: self.debug_error_string.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rpcmux_core::{Event, OpCode, OpData, WireOp, WriteOptions};
    use std::sync::Mutex;

    /// Records submitted batches; completes them on demand.
    #[derive(Default)]
    struct Recorder {
        batches: Mutex<Vec<(Vec<WireOp>, BatchDone)>>,
        cancelled: Mutex<Option<Status>>,
    }

    impl TransportStream for Recorder {
        fn id(&self) -> u32 {
            1
        }

        fn start_batch(&self, ops: Vec<WireOp>, done: BatchDone) {
            self.batches.lock().unwrap().push((ops, done));
        }

        fn cancel(&self, status: Status) {
            *self.cancelled.lock().unwrap() = Some(status);
        }
    }

    fn client_call(cq: &CompletionQueue) -> (Arc<Recorder>, Call) {
        let rec = Arc::new(Recorder::default());
        let call = Call::new(rec.clone(), Side::Client, cq.clone(), "/test.Svc/Do");
        (rec, call)
    }

    #[test]
    fn test_second_send_batch_rejected_until_first_completes() {
        let cq = CompletionQueue::create();
        let (rec, call) = client_call(&cq);

        let mut first = OpSet::new();
        first.send_message(&String::from("a"), WriteOptions::new()).unwrap();
        call.perform_ops(first, Tag(1)).unwrap();

        let mut second = OpSet::new();
        second.client_send_close();
        assert_eq!(
            call.perform_ops(second, Tag(2)),
            Err(CallError::TooManyOperations("send"))
        );

        // A receive batch is independent of the send direction.
        let mut recv = OpSet::new();
        let _ = recv.recv_message::<String>();
        call.perform_ops(recv, Tag(3)).unwrap();

        let (_, done) = rec.batches.lock().unwrap().remove(0);
        done.complete(true);
        assert_eq!(cq.pluck(Tag(1), None), Event::Op { tag: Tag(1), ok: true });

        let mut third = OpSet::new();
        third.client_send_close();
        call.perform_ops(third, Tag(4)).unwrap();
        assert_eq!(rec.batches.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_wrong_side_and_flags_rejected_before_submission() {
        let cq = CompletionQueue::create();
        let (rec, call) = client_call(&cq);

        let mut ops = OpSet::new();
        ops.server_send_status(MetadataMap::new(), &Status::ok());
        assert!(matches!(
            call.perform_ops(ops, Tag(1)),
            Err(CallError::WrongSide { .. })
        ));

        let mut ops = OpSet::new();
        ops.send_message(&Bytes::new(), WriteOptions::new().with_flags(0x100))
            .unwrap();
        assert_eq!(call.perform_ops(ops, Tag(2)), Err(CallError::InvalidFlags(0x100)));

        assert!(rec.batches.lock().unwrap().is_empty());
        assert_eq!(cq.outstanding(), 0);
    }

    #[test]
    fn test_rejected_after_queue_shutdown() {
        let cq = CompletionQueue::create();
        let (_rec, call) = client_call(&cq);
        cq.shutdown();

        let mut ops = OpSet::new();
        ops.client_send_close();
        assert_eq!(call.perform_ops(ops, Tag(1)), Err(CallError::QueueShutdown));

        // The send guard was released with the failed submission.
        let mut ops = OpSet::new();
        ops.client_send_close();
        assert_eq!(call.perform_ops(ops, Tag(2)), Err(CallError::QueueShutdown));
    }

    #[test]
    fn test_wire_ops_reach_transport_in_order() {
        let cq = CompletionQueue::create();
        let (rec, call) = client_call(&cq);

        let mut ops = OpSet::new();
        ops.client_send_close();
        ops.send_initial_metadata(MetadataMap::new(), 0);
        call.perform_ops(ops, Tag(9)).unwrap();

        let batches = rec.batches.lock().unwrap();
        let kinds: Vec<_> = batches[0].0.iter().map(WireOp::code).collect();
        assert_eq!(kinds, vec![OpCode::SendInitialMetadata, OpCode::SendCloseFromClient]);
        assert!(matches!(batches[0].0[1].data, OpData::SendCloseFromClient));
    }

    #[test]
    fn test_cancel_reaches_transport() {
        let cq = CompletionQueue::create();
        let (rec, call) = client_call(&cq);
        call.cancel();
        let status = rec.cancelled.lock().unwrap().clone().unwrap();
        assert_eq!(status.code(), rpcmux_core::StatusCode::Cancelled);
    }

    #[test]
    fn test_context_metadata() {
        let mut ctx = ClientContext::new();
        ctx.add_metadata("X-User", "alice")
            .set_timeout(Duration::from_secs(1));
        assert_eq!(ctx.send_metadata().get_str("x-user"), Some("alice"));
        assert!(ctx.deadline().is_some());
        assert!(!ctx.initial_metadata_received());

        let slots = ctx.slots();
        slots.initial_metadata.set(MetadataMap::new());
        assert!(ctx.initial_metadata_received());
        assert_eq!(ctx.server_initial_metadata(), Some(MetadataMap::new()));
        // Reading leaves the value in place.
        assert!(ctx.initial_metadata_received());
    }
}
