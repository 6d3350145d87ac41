//! Request/response transport over a generic netlink socket
//!
//! The transport owns the socket seam, stamps each outbound request with a
//! fresh sequence number, and correlates responses back to requests by that
//! number. Synchronous callers block with a deadline; asynchronous callers
//! leave a pending entry that a later receive pass resolves on the entry's
//! execution context. One live pending entry exists per sequence number at
//! a time.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::netlink::message::{parse_stream, GenericNetlinkMsg, MessageError, ParsedFrame};
use crate::netlink::socket::{NetlinkIo, SocketError};
use crate::netlink::structures::{DEFAULT_RECV_BUFSIZE, NLM_F_MULTI};
use crate::runner::EventRunner;

/// Deadline for a synchronous exchange, and the lifetime of an async
/// pending entry before it is failed out.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Failures of one request/response exchange. None of these poison the
/// transport; the next request starts clean.
#[derive(Debug)]
pub enum TransportError {
    /// No terminal response arrived before the deadline.
    Timeout,
    /// The kernel answered with an errno (reported positive).
    Kernel(i32),
    Socket(SocketError),
    Message(MessageError),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => write!(f, "timed out waiting for response"),
            Self::Kernel(errno) => write!(f, "kernel replied with errno {errno}"),
            Self::Socket(e) => write!(f, "socket error: {e}"),
            Self::Message(e) => write!(f, "decode error: {e}"),
        }
    }
}

impl std::error::Error for TransportError {}

/// Receiver for an asynchronous exchange. Invoked on the execution context
/// supplied at send time, never on the receiving thread.
pub trait ResponseListener: Send + Sync {
    fn on_responses(&self, responses: Vec<GenericNetlinkMsg>);
    fn on_error(&self, error: TransportError);
}

struct PendingRequest {
    listener: Arc<dyn ResponseListener>,
    runner: Arc<EventRunner>,
    deadline: Instant,
    responses: Vec<GenericNetlinkMsg>,
}

impl PendingRequest {
    fn complete(self) {
        let Self {
            listener, runner, responses, ..
        } = self;
        runner.post(move || listener.on_responses(responses));
    }

    fn fail(self, error: TransportError) {
        let Self { listener, runner, .. } = self;
        runner.post(move || listener.on_error(error));
    }
}

/// Correlating transport over one netlink socket.
pub struct NetlinkTransport {
    io: Box<dyn NetlinkIo>,
    next_seq: AtomicU32,
    pending: Mutex<HashMap<u32, PendingRequest>>,
    response_timeout: Duration,
}

impl NetlinkTransport {
    pub fn new(io: Box<dyn NetlinkIo>) -> Self {
        Self {
            io,
            next_seq: AtomicU32::new(1),
            pending: Mutex::new(HashMap::new()),
            response_timeout: RESPONSE_TIMEOUT,
        }
    }

    fn next_sequence_number(&self) -> u32 {
        self.next_seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Send `msg` and block until its terminal response.
    ///
    /// Multi-part dumps are accumulated until the matching `NLMSG_DONE`; an
    /// ACK resolves as empty success; frames carrying unrelated sequence
    /// numbers are skipped. The deadline covers the whole exchange.
    pub fn send_and_receive(
        &self,
        msg: &mut GenericNetlinkMsg,
    ) -> Result<Vec<GenericNetlinkMsg>, TransportError> {
        let seq = self.next_sequence_number();
        msg.header.nlmsg_seq = seq;
        self.io.send(&msg.pack()).map_err(TransportError::Socket)?;

        let deadline = Instant::now() + self.response_timeout;
        let mut responses = Vec::new();
        let mut buf = vec![0u8; DEFAULT_RECV_BUFSIZE];

        loop {
            if Instant::now() >= deadline {
                return Err(TransportError::Timeout);
            }
            let received = match self.io.recv(&mut buf) {
                Ok(n) => n,
                Err(e) if e.is_timeout() => return Err(TransportError::Timeout),
                Err(e) => return Err(TransportError::Socket(e)),
            };
            for frame in parse_stream(&buf[..received]).map_err(TransportError::Message)? {
                if frame.seq() != seq {
                    debug!(got = frame.seq(), want = seq, "skipping unrelated frame");
                    continue;
                }
                match frame {
                    ParsedFrame::Done { .. } | ParsedFrame::Ack { .. } => return Ok(responses),
                    ParsedFrame::Error { errno, .. } => {
                        return Err(TransportError::Kernel(errno))
                    }
                    ParsedFrame::Message(response) => {
                        let multipart = response.header.nlmsg_flags & NLM_F_MULTI != 0;
                        responses.push(response);
                        if !multipart {
                            return Ok(responses);
                        }
                    }
                }
            }
        }
    }

    /// Send `msg` and return immediately, leaving a pending entry that
    /// [`NetlinkTransport::drain_responses`] resolves later. The listener is
    /// dispatched on `runner`.
    pub fn send_async(
        &self,
        msg: &mut GenericNetlinkMsg,
        runner: Arc<EventRunner>,
        listener: Arc<dyn ResponseListener>,
    ) -> bool {
        let seq = self.next_sequence_number();
        msg.header.nlmsg_seq = seq;
        let packed = msg.pack();

        self.pending.lock().insert(
            seq,
            PendingRequest {
                listener,
                runner,
                deadline: Instant::now() + self.response_timeout,
                responses: Vec::new(),
            },
        );

        if let Err(e) = self.io.send(&packed) {
            warn!(seq, "async send failed: {e}");
            if let Some(entry) = self.pending.lock().remove(&seq) {
                entry.fail(TransportError::Socket(e));
            }
            return false;
        }
        true
    }

    /// True while any async exchange is unresolved.
    pub fn has_pending(&self) -> bool {
        !self.pending.lock().is_empty()
    }

    /// One bounded receive pass: resolve whatever pending entries the
    /// received frames complete, then fail out entries past their deadline.
    /// A failed read logs and ends this pass only; the transport stays
    /// usable.
    pub fn drain_responses(&self) {
        let mut buf = vec![0u8; DEFAULT_RECV_BUFSIZE];
        match self.io.recv(&mut buf) {
            Ok(received) => match parse_stream(&buf[..received]) {
                Ok(frames) => self.dispatch_frames(frames),
                Err(e) => warn!("discarding undecodable receive buffer: {e}"),
            },
            Err(e) if e.is_timeout() => {}
            Err(e) => warn!("receive pass failed: {e}"),
        }
        self.expire_pending();
    }

    fn dispatch_frames(&self, frames: Vec<ParsedFrame>) {
        let mut pending = self.pending.lock();
        for frame in frames {
            let seq = frame.seq();
            let Some(mut entry) = pending.remove(&seq) else {
                debug!(seq, "no pending request for received frame");
                continue;
            };
            match frame {
                ParsedFrame::Message(response) => {
                    let multipart = response.header.nlmsg_flags & NLM_F_MULTI != 0;
                    entry.responses.push(response);
                    if multipart {
                        // Dump still in flight; wait for its DONE.
                        pending.insert(seq, entry);
                    } else {
                        entry.complete();
                    }
                }
                ParsedFrame::Done { .. } | ParsedFrame::Ack { .. } => entry.complete(),
                ParsedFrame::Error { errno, .. } => entry.fail(TransportError::Kernel(errno)),
            }
        }
    }

    fn expire_pending(&self) {
        let now = Instant::now();
        let mut pending = self.pending.lock();
        let expired: Vec<u32> = pending
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(seq, _)| *seq)
            .collect();
        for seq in expired {
            if let Some(entry) = pending.remove(&seq) {
                warn!(seq, "pending request expired");
                entry.fail(TransportError::Timeout);
            }
        }
    }
}
