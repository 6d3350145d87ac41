//! Netlink socket management
//!
//! Safe RAII wrapper around an `AF_NETLINK` socket bound for the generic
//! netlink protocol. The descriptor is owned exclusively by the wrapper and
//! closed on drop. Receives are bounded by `SO_RCVTIMEO` so a silent kernel
//! can never park a caller forever.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Duration;

use tracing::error;

use crate::netlink::structures::{
    DEFAULT_RECV_BUFSIZE, NETLINK_ADD_MEMBERSHIP, NETLINK_GENERIC, SOL_NETLINK,
};

/// Receive timeout applied to every socket this module creates.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(1);

/// Errors from netlink socket syscalls.
#[derive(Debug)]
pub struct SocketError {
    message: String,
    kind: io::ErrorKind,
}

impl SocketError {
    fn new(message: String, kind: io::ErrorKind) -> Self {
        Self { message, kind }
    }

    fn from_io_error(context: &str, err: io::Error) -> Self {
        Self {
            message: format!("{context}: {err}"),
            kind: err.kind(),
        }
    }

    pub fn kind(&self) -> io::ErrorKind {
        self.kind
    }

    /// True when the error is the bounded-receive deadline, not an I/O fault.
    pub fn is_timeout(&self) -> bool {
        matches!(self.kind, io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
    }
}

impl std::fmt::Display for SocketError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for SocketError {}

#[cfg(test)]
impl SocketError {
    /// Timeout-kind error for scripted socket fakes.
    pub(crate) fn timed_out() -> Self {
        Self::new("no data available".to_string(), io::ErrorKind::WouldBlock)
    }
}

/// Byte-level send/receive seam between the transport and the kernel.
///
/// The production implementation is [`NetlinkSocket`]; tests substitute a
/// scripted fake so protocol behavior is exercised without a live kernel.
pub trait NetlinkIo: Send + Sync {
    fn send(&self, data: &[u8]) -> Result<(), SocketError>;
    fn recv(&self, buffer: &mut [u8]) -> Result<usize, SocketError>;
}

/// Creates the sockets used by the request path and the broadcast monitor.
///
/// Failure is reported as absence, not as an error value, so callers can
/// distinguish "could not even open a socket" from a later I/O fault.
pub trait NetlinkIoFactory: Send + Sync {
    /// Exclusive request/response socket.
    fn create(&self) -> Option<Box<dyn NetlinkIo>>;

    /// Broadcast socket subscribed to the given multicast groups. The handle
    /// is shared between the monitor and its read loop.
    fn create_bound_to_groups(&self, group_ids: &[u32]) -> Option<Arc<dyn NetlinkIo>>;
}

/// Factory backed by real kernel sockets.
pub struct SystemNetlinkFactory;

impl NetlinkIoFactory for SystemNetlinkFactory {
    fn create(&self) -> Option<Box<dyn NetlinkIo>> {
        match NetlinkSocket::connect() {
            Ok(socket) => Some(Box::new(socket)),
            Err(e) => {
                error!("unable to create netlink socket: {e}");
                None
            }
        }
    }

    fn create_bound_to_groups(&self, group_ids: &[u32]) -> Option<Arc<dyn NetlinkIo>> {
        let socket = match NetlinkSocket::connect() {
            Ok(socket) => socket,
            Err(e) => {
                error!("unable to create broadcast socket: {e}");
                return None;
            }
        };
        for &group_id in group_ids {
            if let Err(e) = socket.join_multicast_group(group_id) {
                error!(group_id, "unable to subscribe to multicast group: {e}");
                return None;
            }
        }
        Some(Arc::new(socket))
    }
}

/// Generic netlink socket with automatic cleanup.
pub struct NetlinkSocket {
    fd: RawFd,
}

impl NetlinkSocket {
    /// Create and bind a generic netlink socket.
    ///
    /// The kernel assigns the port id; the receive buffer and a bounded
    /// receive timeout are configured before the socket is returned.
    pub fn connect() -> Result<Self, SocketError> {
        // SAFETY: plain libc syscalls on values we own; every return code is
        // checked and the fd is closed on each failure path.
        unsafe {
            let fd = libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                NETLINK_GENERIC,
            );
            if fd < 0 {
                return Err(SocketError::from_io_error(
                    "socket() failed",
                    io::Error::last_os_error(),
                ));
            }

            let mut addr: libc::sockaddr_nl = std::mem::zeroed();
            addr.nl_family = libc::AF_NETLINK as u16;
            addr.nl_pid = 0; // kernel assigns
            addr.nl_groups = 0;
            let ret = libc::bind(
                fd,
                &addr as *const _ as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_nl>() as u32,
            );
            if ret < 0 {
                let err = io::Error::last_os_error();
                libc::close(fd);
                return Err(SocketError::from_io_error("bind() failed", err));
            }

            let rcvbuf: libc::c_int = DEFAULT_RECV_BUFSIZE as libc::c_int;
            let ret = libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_RCVBUF,
                &rcvbuf as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as u32,
            );
            if ret < 0 {
                let err = io::Error::last_os_error();
                libc::close(fd);
                return Err(SocketError::from_io_error(
                    "setsockopt(SO_RCVBUF) failed",
                    err,
                ));
            }

            let timeout = libc::timeval {
                tv_sec: RECV_TIMEOUT.as_secs() as libc::time_t,
                tv_usec: RECV_TIMEOUT.subsec_micros() as libc::suseconds_t,
            };
            let ret = libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_RCVTIMEO,
                &timeout as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::timeval>() as u32,
            );
            if ret < 0 {
                let err = io::Error::last_os_error();
                libc::close(fd);
                return Err(SocketError::from_io_error(
                    "setsockopt(SO_RCVTIMEO) failed",
                    err,
                ));
            }

            Ok(Self { fd })
        }
    }

    /// Subscribe this socket to a netlink multicast group.
    pub fn join_multicast_group(&self, group_id: u32) -> Result<(), SocketError> {
        let group: libc::c_int = group_id as libc::c_int;
        // SAFETY: setsockopt on an fd we own, with a properly sized c_int.
        let ret = unsafe {
            libc::setsockopt(
                self.fd,
                SOL_NETLINK,
                NETLINK_ADD_MEMBERSHIP,
                &group as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as u32,
            )
        };
        if ret < 0 {
            return Err(SocketError::from_io_error(
                "setsockopt(NETLINK_ADD_MEMBERSHIP) failed",
                io::Error::last_os_error(),
            ));
        }
        Ok(())
    }
}

impl NetlinkIo for NetlinkSocket {
    fn send(&self, data: &[u8]) -> Result<(), SocketError> {
        // SAFETY: the slice pointer/length pair is valid for the duration of
        // the call; sockaddr_nl is zero-initialized POD addressed to the
        // kernel (pid 0).
        unsafe {
            let mut addr: libc::sockaddr_nl = std::mem::zeroed();
            addr.nl_family = libc::AF_NETLINK as u16;
            addr.nl_pid = 0;
            addr.nl_groups = 0;

            let ret = libc::sendto(
                self.fd,
                data.as_ptr() as *const libc::c_void,
                data.len(),
                0,
                &addr as *const _ as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_nl>() as u32,
            );
            if ret < 0 {
                return Err(SocketError::from_io_error(
                    "sendto() failed",
                    io::Error::last_os_error(),
                ));
            }
            if ret as usize != data.len() {
                return Err(SocketError::new(
                    format!("short send: sent {} of {} bytes", ret, data.len()),
                    io::ErrorKind::WriteZero,
                ));
            }
            Ok(())
        }
    }

    fn recv(&self, buffer: &mut [u8]) -> Result<usize, SocketError> {
        // SAFETY: the mutable slice pointer/length pair is valid for the call.
        let ret = unsafe {
            libc::recv(
                self.fd,
                buffer.as_mut_ptr() as *mut libc::c_void,
                buffer.len(),
                0,
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            return Err(SocketError::from_io_error("recv() failed", err));
        }
        Ok(ret as usize)
    }
}

impl Drop for NetlinkSocket {
    fn drop(&mut self) {
        // Errors are unreportable in a destructor; close is idempotent
        // enough for an fd we exclusively own.
        // SAFETY: fd was returned by socket() and is owned by self.
        unsafe {
            libc::close(self.fd);
        }
    }
}
