//! Broadcast monitor for nl80211 multicast events
//!
//! Owns a dedicated netlink socket subscribed to a fixed set of multicast
//! groups and a blocking read loop on a background worker. Received packets
//! pass a validation gate before anything decodes them: malformed or
//! truncated kernel buffers must never be interpreted as protocol
//! structure. Validated packets are posted to the control runner, where the
//! message is decoded and routed to the callbacks registered for its
//! command.
//!
//! State machine: `Uninitialized -> FdCreated -> Monitoring -> Stopped`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use threadpool::ThreadPool;
use tracing::{debug, error, info, warn};

use crate::netlink::message::GenericNetlinkMsg;
use crate::netlink::socket::{NetlinkIo, NetlinkIoFactory};
use crate::netlink::structures::DEFAULT_RECV_BUFSIZE;
use crate::runner::EventRunner;

/// Pause after a hard read error so a persistently failing socket cannot
/// spin the worker.
const READ_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Receiver for broadcast events, dispatched on the control runner.
pub trait BroadcastCallback: Send + Sync {
    fn on_event(&self, command: u8, message: &GenericNetlinkMsg);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Uninitialized,
    FdCreated,
    Monitoring,
    Stopped,
}

type CallbackRegistry = Mutex<HashMap<u8, Vec<Arc<dyn BroadcastCallback>>>>;

/// Multicast broadcast monitor. See the module docs for the threading model.
pub struct BroadcastMonitor {
    control_runner: Arc<EventRunner>,
    factory: Arc<dyn NetlinkIoFactory>,
    group_ids: Vec<u32>,
    state: Mutex<MonitorState>,
    io: Mutex<Option<Arc<dyn NetlinkIo>>>,
    // Shared with posted dispatch jobs, hence its own Arc.
    callbacks: Arc<CallbackRegistry>,
    running: AtomicBool,
}

impl BroadcastMonitor {
    pub fn new(
        control_runner: Arc<EventRunner>,
        factory: Arc<dyn NetlinkIoFactory>,
        group_ids: Vec<u32>,
    ) -> Arc<Self> {
        Arc::new(Self {
            control_runner,
            factory,
            group_ids,
            state: Mutex::new(MonitorState::Uninitialized),
            io: Mutex::new(None),
            callbacks: Arc::new(Mutex::new(HashMap::new())),
            running: AtomicBool::new(false),
        })
    }

    pub fn state(&self) -> MonitorState {
        *self.state.lock()
    }

    /// Create the broadcast socket and join the configured multicast groups.
    /// On failure the monitor stays `Uninitialized` and may be retried.
    pub fn create_fd(&self) -> bool {
        let mut state = self.state.lock();
        if *state != MonitorState::Uninitialized {
            return *state == MonitorState::FdCreated || *state == MonitorState::Monitoring;
        }
        info!(groups = ?self.group_ids, "subscribing to multicast groups");
        match self.factory.create_bound_to_groups(&self.group_ids) {
            Some(io) => {
                *self.io.lock() = Some(io);
                *state = MonitorState::FdCreated;
                true
            }
            None => {
                info!("unable to create broadcast file descriptor");
                false
            }
        }
    }

    /// Start the read loop on the background pool. Requires `create_fd` to
    /// have succeeded.
    pub fn start(self: Arc<Self>, pool: &ThreadPool) -> bool {
        {
            let mut state = self.state.lock();
            if *state != MonitorState::FdCreated {
                warn!(state = ?*state, "monitor not ready to start");
                return false;
            }
            *state = MonitorState::Monitoring;
        }
        self.running.store(true, Ordering::SeqCst);
        pool.execute(move || self.read_loop());
        true
    }

    /// Stop the read loop and release the socket.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        *self.io.lock() = None;
        *self.state.lock() = MonitorState::Stopped;
    }

    fn read_loop(self: Arc<Self>) {
        let Some(io) = self.io.lock().clone() else {
            return;
        };
        let mut buf = vec![0u8; DEFAULT_RECV_BUFSIZE];
        while self.running.load(Ordering::SeqCst) {
            match io.recv(&mut buf) {
                Ok(received) => self.handle_packet(Some(&buf), received),
                Err(e) if e.is_timeout() => {}
                Err(e) => {
                    // One failed read ends this attempt only; ENOBUFS in
                    // particular just means the kernel dropped broadcasts.
                    warn!("broadcast read error: {e}");
                    std::thread::sleep(READ_ERROR_BACKOFF);
                }
            }
        }
    }

    /// Validation gate for one received packet. The read buffer is reused
    /// across reads, so `length` is the only trustworthy extent; everything
    /// is checked before a copy is posted for decoding.
    pub fn handle_packet(&self, recvbuf: Option<&[u8]>, length: usize) {
        let Some(buf) = recvbuf else {
            error!("received an absent buffer");
            return;
        };
        if length == 0 || length > DEFAULT_RECV_BUFSIZE || length > buf.len() {
            error!(
                length,
                buffer_len = buf.len(),
                "received an invalid buffer"
            );
            return;
        }
        let copied = buf[..length].to_vec();
        let callbacks = Arc::clone(&self.callbacks);
        self.control_runner
            .post(move || dispatch_on_control(&callbacks, &copied));
    }

    /// Register a callback for one broadcast command. Safe to call while the
    /// monitor is dispatching.
    pub fn register_callback(&self, command: u8, callback: Arc<dyn BroadcastCallback>) {
        let mut callbacks = self.callbacks.lock();
        let entry = callbacks.entry(command).or_default();
        if !entry.iter().any(|c| Arc::ptr_eq(c, &callback)) {
            entry.push(callback);
        }
    }

    /// Unregister a previously registered callback.
    pub fn unregister_callback(&self, command: u8, callback: &Arc<dyn BroadcastCallback>) {
        let mut callbacks = self.callbacks.lock();
        if let Some(entry) = callbacks.get_mut(&command) {
            entry.retain(|c| !Arc::ptr_eq(c, callback));
            if entry.is_empty() {
                callbacks.remove(&command);
            }
        }
    }
}

/// Decode and route one validated packet. Runs only on the control runner.
fn dispatch_on_control(callbacks: &CallbackRegistry, buffer: &[u8]) {
    // A broadcast datagram carries a single message.
    let message = match GenericNetlinkMsg::unpack(buffer) {
        Ok(message) => message,
        Err(e) => {
            debug!("dropping undecodable broadcast: {e}");
            return;
        }
    };
    let command = message.command();
    let registered: Vec<Arc<dyn BroadcastCallback>> = callbacks
        .lock()
        .get(&command)
        .cloned()
        .unwrap_or_default();
    for callback in registered {
        callback.on_event(command, &message);
    }
}
