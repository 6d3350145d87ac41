//! Generic netlink message construction and parsing
//!
//! A message is `{netlink header, generic netlink header, attribute stream}`.
//! The kernel answers dump requests with several messages concatenated in one
//! datagram, terminated by `NLMSG_DONE`; [`parse_stream`] splits such a
//! buffer into frames without interpreting unrelated bytes.

use tracing::debug;

use crate::netlink::attr::{decode_all, NlAttr};
use crate::netlink::structures::{
    GenlMsgHdr, NlMsgHdr, NLA_TYPE_MASK, NLMSG_DONE, NLMSG_ERROR, NLMSG_MIN_TYPE, NLMSG_NOOP,
    NLMSG_OVERRUN, nlmsg_align,
};

const NL_HDR_SIZE: usize = std::mem::size_of::<NlMsgHdr>();
const GENL_HDR_SIZE: usize = std::mem::size_of::<GenlMsgHdr>();
const FIXED_HDR_SIZE: usize = NL_HDR_SIZE + GENL_HDR_SIZE;

/// Wire decode failures. Both variants reject a single message; neither is
/// fatal to the transport that encountered them.
#[derive(Debug)]
pub enum MessageError {
    /// An attribute record with an impossible declared length.
    MalformedAttribute(String),
    /// A buffer shorter than its own headers or declared length.
    TruncatedMessage(String),
}

impl std::fmt::Display for MessageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MalformedAttribute(msg) => write!(f, "malformed attribute: {msg}"),
            Self::TruncatedMessage(msg) => write!(f, "truncated message: {msg}"),
        }
    }
}

impl std::error::Error for MessageError {}

/// One generic netlink message: headers plus an ordered attribute list.
///
/// `header.nlmsg_len` is kept consistent as attributes are added, so a
/// constructed message compares equal to its own unpacked serialization.
#[derive(Debug, Clone, PartialEq)]
pub struct GenericNetlinkMsg {
    pub header: NlMsgHdr,
    pub genl: GenlMsgHdr,
    pub attributes: Vec<NlAttr>,
}

impl GenericNetlinkMsg {
    pub fn new(cmd: u8, version: u8, nlmsg_type: u16, flags: u16) -> Self {
        Self {
            header: NlMsgHdr {
                nlmsg_len: FIXED_HDR_SIZE as u32,
                nlmsg_type,
                nlmsg_flags: flags,
                nlmsg_seq: 0,
                nlmsg_pid: 0,
            },
            genl: GenlMsgHdr {
                cmd,
                version,
                reserved: 0,
            },
            attributes: Vec::new(),
        }
    }

    pub fn command(&self) -> u8 {
        self.genl.cmd
    }

    pub fn add_attribute(&mut self, attr: NlAttr) {
        self.header.nlmsg_len += attr.encoded_space() as u32;
        self.attributes.push(attr);
    }

    /// First attribute whose masked type matches `attr_type`.
    pub fn get_attribute(&self, attr_type: u16) -> Option<&NlAttr> {
        self.attributes
            .iter()
            .find(|a| a.nla_type() == attr_type & NLA_TYPE_MASK)
    }

    /// Serialize to wire format: netlink header, generic header, then the
    /// attributes in insertion order, each padded to 4 bytes.
    pub fn pack(&self) -> Vec<u8> {
        let total: usize = FIXED_HDR_SIZE
            + self
                .attributes
                .iter()
                .map(NlAttr::encoded_space)
                .sum::<usize>();

        let mut buf = Vec::with_capacity(total);

        let header = NlMsgHdr {
            nlmsg_len: total as u32,
            ..self.header
        };
        // SAFETY: NlMsgHdr and GenlMsgHdr are repr(C) structs of plain
        // integers; viewing them as bytes reads only initialized memory for
        // exactly size_of bytes.
        let header_bytes = unsafe {
            std::slice::from_raw_parts(&header as *const _ as *const u8, NL_HDR_SIZE)
        };
        buf.extend_from_slice(header_bytes);
        let genl_bytes = unsafe {
            std::slice::from_raw_parts(&self.genl as *const _ as *const u8, GENL_HDR_SIZE)
        };
        buf.extend_from_slice(genl_bytes);

        for attr in &self.attributes {
            attr.encode_into(&mut buf);
        }
        buf
    }

    /// Parse one message from the start of `data`.
    pub fn unpack(data: &[u8]) -> Result<Self, MessageError> {
        if data.len() < FIXED_HDR_SIZE {
            return Err(MessageError::TruncatedMessage(format!(
                "buffer of {} bytes below fixed header size {FIXED_HDR_SIZE}",
                data.len()
            )));
        }
        // SAFETY: bounds checked above; repr(C) plain-integer structs with no
        // invalid bit patterns. read_unaligned tolerates arbitrary buffer
        // alignment.
        let header: NlMsgHdr =
            unsafe { std::ptr::read_unaligned(data.as_ptr() as *const NlMsgHdr) };
        let declared = header.nlmsg_len as usize;
        if declared < FIXED_HDR_SIZE {
            return Err(MessageError::TruncatedMessage(format!(
                "declared length {declared} below fixed header size"
            )));
        }
        if declared > data.len() {
            return Err(MessageError::TruncatedMessage(format!(
                "declared length {} exceeds buffer of {} bytes",
                declared,
                data.len()
            )));
        }
        let genl: GenlMsgHdr = unsafe {
            std::ptr::read_unaligned(data[NL_HDR_SIZE..].as_ptr() as *const GenlMsgHdr)
        };
        let attributes = decode_all(&data[FIXED_HDR_SIZE..declared])?;
        Ok(Self {
            header,
            genl,
            attributes,
        })
    }
}

/// One frame of a (possibly multi-part) kernel response.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedFrame {
    /// A generic netlink payload message.
    Message(GenericNetlinkMsg),
    /// End of a multi-part dump.
    Done { seq: u32 },
    /// `NLMSG_ERROR` with errno 0: a plain acknowledgment.
    Ack { seq: u32 },
    /// `NLMSG_ERROR` with a real errno (reported positive).
    Error { seq: u32, errno: i32 },
}

impl ParsedFrame {
    pub fn seq(&self) -> u32 {
        match self {
            Self::Message(msg) => msg.header.nlmsg_seq,
            Self::Done { seq } | Self::Ack { seq } | Self::Error { seq, .. } => *seq,
        }
    }
}

/// Split a receive buffer into frames. Control frames (`NLMSG_NOOP`,
/// `NLMSG_OVERRUN`, unknown types) are skipped with a log line; a malformed
/// length aborts the walk so garbage is never interpreted as structure.
pub fn parse_stream(data: &[u8]) -> Result<Vec<ParsedFrame>, MessageError> {
    let mut frames = Vec::new();
    let mut offset = 0;

    while offset + NL_HDR_SIZE <= data.len() {
        // SAFETY: at least one full header remains past `offset`; repr(C)
        // plain-integer struct read without alignment assumptions.
        let header: NlMsgHdr =
            unsafe { std::ptr::read_unaligned(data[offset..].as_ptr() as *const NlMsgHdr) };
        let msg_len = header.nlmsg_len as usize;

        if msg_len < NL_HDR_SIZE {
            return Err(MessageError::TruncatedMessage(format!(
                "declared length {msg_len} below netlink header size"
            )));
        }
        if offset + msg_len > data.len() {
            return Err(MessageError::TruncatedMessage(format!(
                "declared length {} exceeds remaining {} bytes",
                msg_len,
                data.len() - offset
            )));
        }

        match header.nlmsg_type {
            NLMSG_DONE => frames.push(ParsedFrame::Done {
                seq: header.nlmsg_seq,
            }),
            NLMSG_ERROR => {
                if msg_len < NL_HDR_SIZE + 4 {
                    return Err(MessageError::TruncatedMessage(
                        "error frame too short for errno".to_string(),
                    ));
                }
                let errno_start = offset + NL_HDR_SIZE;
                let errno = i32::from_ne_bytes([
                    data[errno_start],
                    data[errno_start + 1],
                    data[errno_start + 2],
                    data[errno_start + 3],
                ]);
                // The kernel reports errno negated; 0 is an ACK.
                if errno == 0 {
                    frames.push(ParsedFrame::Ack {
                        seq: header.nlmsg_seq,
                    });
                } else {
                    frames.push(ParsedFrame::Error {
                        seq: header.nlmsg_seq,
                        errno: -errno,
                    });
                }
            }
            NLMSG_NOOP | NLMSG_OVERRUN => {
                debug!(nlmsg_type = header.nlmsg_type, "skipping control frame");
            }
            t if t >= NLMSG_MIN_TYPE => {
                frames.push(ParsedFrame::Message(GenericNetlinkMsg::unpack(
                    &data[offset..offset + msg_len],
                )?));
            }
            t => {
                debug!(nlmsg_type = t, "skipping frame of unknown type");
            }
        }

        offset += nlmsg_align(msg_len);
    }

    Ok(frames)
}
