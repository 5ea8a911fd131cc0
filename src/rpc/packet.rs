//! RPC wire packet
//!
//! `{ msg_id: u16, cmd_id: u16, status: u16, msg_len: u16, payload: [u8; msg_len] }`,
//! little-endian, carried as one RPMsg payload.

/// Size of the packet header
pub const RPC_HEADER_SIZE: usize = 8;

/// Header of a request or response packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub msg_id: u16,
    pub cmd_id: u16,
    pub status: u16,
    pub msg_len: u16,
}

impl PacketHeader {
    /// Write the header into the first [`RPC_HEADER_SIZE`] bytes of `buf`
    pub fn encode(&self, buf: &mut [u8]) {
        buf[0..2].copy_from_slice(&self.msg_id.to_le_bytes());
        buf[2..4].copy_from_slice(&self.cmd_id.to_le_bytes());
        buf[4..6].copy_from_slice(&self.status.to_le_bytes());
        buf[6..8].copy_from_slice(&self.msg_len.to_le_bytes());
    }

    /// Split `buf` into a header and its payload
    ///
    /// The payload is cut to whatever the buffer actually holds, so a header
    /// announcing more than arrived never reads past the message.
    pub fn decode(buf: &[u8]) -> Option<(PacketHeader, &[u8])> {
        if buf.len() < RPC_HEADER_SIZE {
            return None;
        }
        let field = |at: usize| u16::from_le_bytes([buf[at], buf[at + 1]]);
        let header = PacketHeader {
            msg_id: field(0),
            cmd_id: field(2),
            status: field(4),
            msg_len: field(6),
        };
        let body = &buf[RPC_HEADER_SIZE..];
        let len = (header.msg_len as usize).min(body.len());
        Some((header, &body[..len]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let header = PacketHeader {
            msg_id: 0x0102,
            cmd_id: 5,
            status: 0xfffc,
            msg_len: 3,
        };
        let mut buf = [0u8; 11];
        header.encode(&mut buf);
        buf[8..].copy_from_slice(b"abc");
        assert_eq!(&buf[..8], &[0x02, 0x01, 5, 0, 0xfc, 0xff, 3, 0]);

        let (decoded, payload) = PacketHeader::decode(&buf).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(payload, b"abc");
    }

    #[test]
    fn test_short_and_truncated() {
        assert!(PacketHeader::decode(&[0u8; 7]).is_none());

        let mut buf = [0u8; 10];
        PacketHeader {
            msg_id: 1,
            cmd_id: 1,
            status: 0,
            msg_len: 100,
        }
        .encode(&mut buf);
        let (_, payload) = PacketHeader::decode(&buf).unwrap();
        assert_eq!(payload.len(), 2);
    }
}
