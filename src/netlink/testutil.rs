//! Shared fixtures for netlink tests: a scripted socket fake and canned
//! kernel frames. Test-only; never compiled into the library proper.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::netlink::attr::NlAttr;
use crate::netlink::message::GenericNetlinkMsg;
use crate::netlink::socket::{NetlinkIo, NetlinkIoFactory, SocketError};
use crate::netlink::structures::{
    NlMsgHdr, CTRL_ATTR_FAMILY_ID, CTRL_ATTR_MCAST_GROUPS, CTRL_ATTR_MCAST_GRP_ID,
    CTRL_ATTR_MCAST_GRP_NAME, CTRL_CMD_NEWFAMILY, GENL_CTRL_VERSION, GENL_ID_CTRL,
    NLMSG_DONE, NLMSG_ERROR, NLM_F_MULTI, NLM_F_REQUEST, NL80211_MULTICAST_GROUP_MLME,
    NL80211_MULTICAST_GROUP_REG, NL80211_MULTICAST_GROUP_SCAN,
};

pub const TEST_FAMILY_ID: u16 = 25;
pub const TEST_GROUP_IDS: [(&str, u32); 3] = [
    (NL80211_MULTICAST_GROUP_SCAN, 11),
    (NL80211_MULTICAST_GROUP_REG, 12),
    (NL80211_MULTICAST_GROUP_MLME, 13),
];

#[derive(Default)]
struct FakeIoState {
    sent: Vec<Vec<u8>>,
    responses: VecDeque<Vec<u8>>,
}

/// Scripted stand-in for [`crate::netlink::socket::NetlinkSocket`]: sends are
/// recorded, receives pop pre-queued buffers and time out when none remain.
#[derive(Clone, Default)]
pub struct FakeNetlinkIo {
    state: Arc<Mutex<FakeIoState>>,
}

impl FakeNetlinkIo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue_response(&self, buffer: Vec<u8>) {
        self.state.lock().responses.push_back(buffer);
    }

    pub fn sent_requests(&self) -> Vec<Vec<u8>> {
        self.state.lock().sent.clone()
    }
}

impl NetlinkIo for FakeNetlinkIo {
    fn send(&self, data: &[u8]) -> Result<(), SocketError> {
        self.state.lock().sent.push(data.to_vec());
        Ok(())
    }

    fn recv(&self, buffer: &mut [u8]) -> Result<usize, SocketError> {
        match self.state.lock().responses.pop_front() {
            Some(response) => {
                let len = response.len().min(buffer.len());
                buffer[..len].copy_from_slice(&response[..len]);
                Ok(len)
            }
            None => {
                // A real socket blocks up to SO_RCVTIMEO; yield briefly so
                // read loops over the fake cannot spin a core.
                std::thread::sleep(std::time::Duration::from_millis(2));
                Err(SocketError::timed_out())
            }
        }
    }
}

/// Factory handing out clones of one scripted request socket. Broadcast
/// sockets are separate, empty fakes so the monitor's read loop never
/// consumes request-path responses.
pub struct FakeNetlinkFactory {
    pub request_io: FakeNetlinkIo,
    pub fail_creation: AtomicBool,
    pub sockets_created: AtomicUsize,
    pub broadcast_sockets_created: AtomicUsize,
    pub joined_groups: Mutex<Vec<u32>>,
}

impl FakeNetlinkFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            request_io: FakeNetlinkIo::new(),
            fail_creation: AtomicBool::new(false),
            sockets_created: AtomicUsize::new(0),
            broadcast_sockets_created: AtomicUsize::new(0),
            joined_groups: Mutex::new(Vec::new()),
        })
    }
}

impl NetlinkIoFactory for FakeNetlinkFactory {
    fn create(&self) -> Option<Box<dyn NetlinkIo>> {
        if self.fail_creation.load(Ordering::SeqCst) {
            return None;
        }
        self.sockets_created.fetch_add(1, Ordering::SeqCst);
        Some(Box::new(self.request_io.clone()))
    }

    fn create_bound_to_groups(&self, group_ids: &[u32]) -> Option<Arc<dyn NetlinkIo>> {
        if self.fail_creation.load(Ordering::SeqCst) {
            return None;
        }
        self.broadcast_sockets_created.fetch_add(1, Ordering::SeqCst);
        self.joined_groups.lock().extend_from_slice(group_ids);
        Some(Arc::new(FakeNetlinkIo::new()))
    }
}

/// A plain request-style message with one attribute, addressed to the test
/// family.
pub fn test_message(cmd: u8) -> GenericNetlinkMsg {
    let mut msg = GenericNetlinkMsg::new(cmd, 0, TEST_FAMILY_ID, NLM_F_REQUEST);
    msg.add_attribute(NlAttr::new_u32(3, 2));
    msg
}

/// The controller's answer to a GETFAMILY request: family id plus the
/// multicast group table.
pub fn family_response(family_id: u16, seq: u32) -> GenericNetlinkMsg {
    let mut msg = GenericNetlinkMsg::new(CTRL_CMD_NEWFAMILY, GENL_CTRL_VERSION, GENL_ID_CTRL, 0);
    msg.header.nlmsg_seq = seq;
    msg.add_attribute(NlAttr::new_u16(CTRL_ATTR_FAMILY_ID, family_id));
    msg.add_attribute(multicast_groups_attribute());
    msg
}

/// Nested multicast group table as the kernel encodes it: an outer container
/// of per-group containers, each holding a name and numeric id.
pub fn multicast_groups_attribute() -> NlAttr {
    let entries: Vec<NlAttr> = TEST_GROUP_IDS
        .iter()
        .enumerate()
        .map(|(idx, (name, id))| {
            NlAttr::new_nested(
                (idx + 1) as u16,
                &[
                    NlAttr::new_string(CTRL_ATTR_MCAST_GRP_NAME, name),
                    NlAttr::new_u32(CTRL_ATTR_MCAST_GRP_ID, *id),
                ],
            )
        })
        .collect();
    NlAttr::new_nested(CTRL_ATTR_MCAST_GROUPS, &entries)
}

fn header_bytes(header: &NlMsgHdr) -> Vec<u8> {
    // SAFETY: repr(C) plain-integer struct viewed as bytes.
    unsafe {
        std::slice::from_raw_parts(
            header as *const _ as *const u8,
            std::mem::size_of::<NlMsgHdr>(),
        )
    }
    .to_vec()
}

/// An `NLMSG_DONE` frame closing a multi-part dump.
pub fn done_buffer(seq: u32) -> Vec<u8> {
    header_bytes(&NlMsgHdr {
        nlmsg_len: std::mem::size_of::<NlMsgHdr>() as u32,
        nlmsg_type: NLMSG_DONE,
        nlmsg_flags: NLM_F_MULTI,
        nlmsg_seq: seq,
        nlmsg_pid: 0,
    })
}

/// An `NLMSG_ERROR` frame with the kernel's (negated) errno convention.
pub fn error_buffer(seq: u32, raw_errno: i32) -> Vec<u8> {
    let mut buf = header_bytes(&NlMsgHdr {
        nlmsg_len: (std::mem::size_of::<NlMsgHdr>() + 4) as u32,
        nlmsg_type: NLMSG_ERROR,
        nlmsg_flags: 0,
        nlmsg_seq: seq,
        nlmsg_pid: 0,
    });
    buf.extend_from_slice(&raw_errno.to_ne_bytes());
    buf
}
