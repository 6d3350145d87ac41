//! Typed netlink attribute (TLV) codec
//!
//! Every attribute on the wire is `{nla_len: u16, nla_type: u16, payload,
//! padding}` with the total record padded to a 4-byte boundary. Nested
//! attributes recurse with the same rule: a container's payload is the
//! concatenation of its children's padded encodings, and the container's
//! declared length covers all of them.

use crate::netlink::message::MessageError;
use crate::netlink::structures::{
    nla_length, nla_space, nlmsg_align, NlAttrHdr, NLA_F_NESTED, NLA_TYPE_MASK,
};

const ATTR_HDR_SIZE: usize = std::mem::size_of::<NlAttrHdr>();

/// One netlink attribute: type tag plus raw payload bytes.
///
/// The payload is owned by the attribute; nested children are materialized
/// on demand via [`NlAttr::as_nested`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NlAttr {
    pub attr_type: u16,
    pub payload: Vec<u8>,
}

impl NlAttr {
    pub fn new(attr_type: u16, payload: Vec<u8>) -> Self {
        Self { attr_type, payload }
    }

    /// Attribute carrying no payload (presence flag).
    pub fn new_flag(attr_type: u16) -> Self {
        Self::new(attr_type, Vec::new())
    }

    pub fn new_u8(attr_type: u16, value: u8) -> Self {
        Self::new(attr_type, vec![value])
    }

    pub fn new_u16(attr_type: u16, value: u16) -> Self {
        Self::new(attr_type, value.to_ne_bytes().to_vec())
    }

    pub fn new_u32(attr_type: u16, value: u32) -> Self {
        Self::new(attr_type, value.to_ne_bytes().to_vec())
    }

    pub fn new_u64(attr_type: u16, value: u64) -> Self {
        Self::new(attr_type, value.to_ne_bytes().to_vec())
    }

    pub fn new_i32(attr_type: u16, value: i32) -> Self {
        Self::new(attr_type, value.to_ne_bytes().to_vec())
    }

    /// String attribute, NUL-terminated on the wire.
    pub fn new_string(attr_type: u16, value: &str) -> Self {
        let mut payload = value.as_bytes().to_vec();
        payload.push(0);
        Self::new(attr_type, payload)
    }

    /// Container attribute whose payload is the encoded children.
    pub fn new_nested(attr_type: u16, children: &[NlAttr]) -> Self {
        let mut payload = Vec::new();
        for child in children {
            child.encode_into(&mut payload);
        }
        Self::new(attr_type | NLA_F_NESTED, payload)
    }

    /// Attribute type with the nested/byte-order bits masked off.
    pub fn nla_type(&self) -> u16 {
        self.attr_type & NLA_TYPE_MASK
    }

    pub fn as_u8(&self) -> Option<u8> {
        match self.payload.as_slice() {
            [b] => Some(*b),
            _ => None,
        }
    }

    pub fn as_u16(&self) -> Option<u16> {
        Some(u16::from_ne_bytes(self.payload.as_slice().try_into().ok()?))
    }

    pub fn as_u32(&self) -> Option<u32> {
        Some(u32::from_ne_bytes(self.payload.as_slice().try_into().ok()?))
    }

    pub fn as_u64(&self) -> Option<u64> {
        Some(u64::from_ne_bytes(self.payload.as_slice().try_into().ok()?))
    }

    pub fn as_i32(&self) -> Option<i32> {
        Some(i32::from_ne_bytes(self.payload.as_slice().try_into().ok()?))
    }

    /// Payload interpreted as a NUL-terminated UTF-8 string.
    pub fn as_string(&self) -> Option<String> {
        let end = self
            .payload
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.payload.len());
        std::str::from_utf8(&self.payload[..end])
            .ok()
            .map(str::to_owned)
    }

    /// Decode the payload as a sequence of child attributes.
    pub fn as_nested(&self) -> Result<Vec<NlAttr>, MessageError> {
        decode_all(&self.payload)
    }

    /// Wire size of this attribute including trailing padding.
    pub fn encoded_space(&self) -> usize {
        nla_space(self.payload.len())
    }

    /// Append the encoded attribute (header, payload, padding) to `buf`.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        let declared = nla_length(self.payload.len());
        buf.extend_from_slice(&declared.to_ne_bytes());
        buf.extend_from_slice(&self.attr_type.to_ne_bytes());
        buf.extend_from_slice(&self.payload);
        // Padding is written but never part of the declared length.
        for _ in self.payload.len()..nlmsg_align(self.payload.len()) {
            buf.push(0);
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_space());
        self.encode_into(&mut buf);
        buf
    }

    /// Decode one attribute starting at `offset`, returning it together with
    /// the offset of the next attribute (alignment already applied).
    pub fn decode(data: &[u8], offset: usize) -> Result<(NlAttr, usize), MessageError> {
        let remaining = data.len().saturating_sub(offset);
        if remaining < ATTR_HDR_SIZE {
            return Err(MessageError::MalformedAttribute(format!(
                "attribute header needs {ATTR_HDR_SIZE} bytes, {remaining} remain"
            )));
        }
        let nla_len =
            u16::from_ne_bytes([data[offset], data[offset + 1]]) as usize;
        let nla_type = u16::from_ne_bytes([data[offset + 2], data[offset + 3]]);

        if nla_len < ATTR_HDR_SIZE {
            return Err(MessageError::MalformedAttribute(format!(
                "declared attribute length {nla_len} below header size"
            )));
        }
        if offset + nla_len > data.len() {
            return Err(MessageError::MalformedAttribute(format!(
                "declared attribute length {} overruns buffer ({} bytes past offset {})",
                nla_len,
                data.len() - offset,
                offset
            )));
        }

        let payload = data[offset + ATTR_HDR_SIZE..offset + nla_len].to_vec();
        Ok((
            NlAttr::new(nla_type, payload),
            offset + nlmsg_align(nla_len),
        ))
    }
}

/// Decode a full attribute stream. Every byte of a well-formed stream is
/// consumed by exactly one attribute; inter-attribute padding is skipped by
/// the aligned offset advance.
pub fn decode_all(data: &[u8]) -> Result<Vec<NlAttr>, MessageError> {
    let mut attrs = Vec::new();
    let mut offset = 0;
    while offset + ATTR_HDR_SIZE <= data.len() {
        let (attr, next) = NlAttr::decode(data, offset)?;
        attrs.push(attr);
        offset = next;
    }
    Ok(attrs)
}
