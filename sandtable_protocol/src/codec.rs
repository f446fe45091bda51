// Packet codec: header, optional zstd compression, CRC32 trailer.
//
// Every message that crosses a transport is wrapped in a packet:
//
//   offset  size  field
//   0       1     version (PACKET_VERSION)
//   1       1     kind (0 = data, 1 = nack)
//   2       1     flags (bit 0: body is zstd-compressed)
//   3       8     link sequence, big-endian
//   11      4     body length on the wire, big-endian
//   15      n     body
//   15+n    4     CRC32 of bytes [0, 15+n), big-endian
//
// The body is the JSON-encoded message. Bodies at or above
// `COMPRESSION_THRESHOLD` bytes are compressed with zstd, and the compressed
// form is only kept when it is actually smaller. Compression is lossless, so
// the decoded body is byte-identical to what was encoded.
//
// The CRC covers the header as well as the body, so a flipped sequence number
// is caught just like a flipped payload byte. Decoding never trusts a length
// field before the CRC has been verified.
//
// See also: `link.rs` for how sequence numbers and nacks are used, and
// `framing.rs` for the stream framing that carries packets over TCP.

use crate::error::CodecError;
use crate::types::LinkSequence;

pub const PACKET_VERSION: u8 = 1;
pub const HEADER_LEN: usize = 15;
pub const TRAILER_LEN: usize = 4;

/// Bodies smaller than this are sent uncompressed.
pub const COMPRESSION_THRESHOLD: usize = 96;

/// zstd level. Low levels are plenty for small, repetitive JSON.
pub const COMPRESSION_LEVEL: i32 = 3;

/// Upper bound on a decompressed body.
pub const MAX_BODY_SIZE: usize = 1024 * 1024;

const FLAG_COMPRESSED: u8 = 0b0000_0001;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PacketKind {
    /// Carries one sequenced message body.
    Data,
    /// Asks the other side to resend everything from `link_seq` onward.
    /// Never sequenced itself.
    Nack,
}

impl PacketKind {
    fn to_byte(self) -> u8 {
        match self {
            PacketKind::Data => 0,
            PacketKind::Nack => 1,
        }
    }

    fn from_byte(byte: u8) -> Result<Self, CodecError> {
        match byte {
            0 => Ok(PacketKind::Data),
            1 => Ok(PacketKind::Nack),
            other => Err(CodecError::UnknownKind(other)),
        }
    }
}

/// A decoded packet. `body` is always the uncompressed message bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    pub kind: PacketKind,
    pub link_seq: LinkSequence,
    pub body: Vec<u8>,
}

impl Packet {
    pub fn data(link_seq: LinkSequence, body: Vec<u8>) -> Self {
        Self {
            kind: PacketKind::Data,
            link_seq,
            body,
        }
    }

    pub fn nack(from: LinkSequence) -> Self {
        Self {
            kind: PacketKind::Nack,
            link_seq: from,
            body: Vec::new(),
        }
    }
}

/// Encode a packet to wire bytes.
pub fn encode_packet(packet: &Packet) -> Result<Vec<u8>, CodecError> {
    if packet.body.len() > MAX_BODY_SIZE {
        return Err(CodecError::BodyTooLarge(packet.body.len()));
    }

    let mut flags = 0u8;
    let mut wire_body = None;
    if packet.body.len() >= COMPRESSION_THRESHOLD {
        let compressed = zstd::bulk::compress(&packet.body, COMPRESSION_LEVEL)
            .map_err(|e| CodecError::Compress(e.to_string()))?;
        if compressed.len() < packet.body.len() {
            flags |= FLAG_COMPRESSED;
            wire_body = Some(compressed);
        }
    }
    let body = wire_body.as_deref().unwrap_or(&packet.body);
    let body_len =
        u32::try_from(body.len()).map_err(|_| CodecError::BodyTooLarge(body.len()))?;

    let mut out = Vec::with_capacity(HEADER_LEN + body.len() + TRAILER_LEN);
    out.push(PACKET_VERSION);
    out.push(packet.kind.to_byte());
    out.push(flags);
    out.extend_from_slice(&packet.link_seq.0.to_be_bytes());
    out.extend_from_slice(&body_len.to_be_bytes());
    out.extend_from_slice(body);
    let crc = crc32fast::hash(&out);
    out.extend_from_slice(&crc.to_be_bytes());
    Ok(out)
}

/// Decode and verify wire bytes.
pub fn decode_packet(bytes: &[u8]) -> Result<Packet, CodecError> {
    if bytes.len() < HEADER_LEN + TRAILER_LEN {
        return Err(CodecError::Truncated { len: bytes.len() });
    }
    let (covered, trailer) = bytes.split_at(bytes.len() - TRAILER_LEN);
    let expected = u32::from_be_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
    let computed = crc32fast::hash(covered);
    if expected != computed {
        return Err(CodecError::IntegrityMismatch { expected, computed });
    }

    let version = covered[0];
    if version != PACKET_VERSION {
        return Err(CodecError::UnsupportedVersion(version));
    }
    let kind = PacketKind::from_byte(covered[1])?;
    let flags = covered[2];
    let mut seq_bytes = [0u8; 8];
    seq_bytes.copy_from_slice(&covered[3..11]);
    let link_seq = LinkSequence(u64::from_be_bytes(seq_bytes));
    let declared = u32::from_be_bytes([covered[11], covered[12], covered[13], covered[14]]) as usize;
    let body = &covered[HEADER_LEN..];
    if declared != body.len() {
        return Err(CodecError::LengthMismatch {
            declared,
            actual: body.len(),
        });
    }

    let body = if flags & FLAG_COMPRESSED != 0 {
        zstd::bulk::decompress(body, MAX_BODY_SIZE)
            .map_err(|e| CodecError::Decompress(e.to_string()))?
    } else {
        body.to_vec()
    };

    Ok(Packet {
        kind,
        link_seq,
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn big_json_body() -> Vec<u8> {
        let commands: Vec<String> = (0..40)
            .map(|i| format!("{{\"Move\":{{\"unit\":{i},\"destination\":{{\"x\":5,\"y\":5}}}}}}"))
            .collect();
        format!("[{}]", commands.join(",")).into_bytes()
    }

    #[test]
    fn small_body_is_sent_plain() {
        let packet = Packet::data(LinkSequence(3), b"{\"Goodbye\":null}".to_vec());
        let wire = encode_packet(&packet).unwrap();
        assert_eq!(wire[2] & FLAG_COMPRESSED, 0);
        assert_eq!(wire.len(), HEADER_LEN + packet.body.len() + TRAILER_LEN);
        assert_eq!(decode_packet(&wire).unwrap(), packet);
    }

    #[test]
    fn repetitive_body_is_compressed_losslessly() {
        let body = big_json_body();
        let packet = Packet::data(LinkSequence(9), body.clone());
        let wire = encode_packet(&packet).unwrap();
        assert_ne!(wire[2] & FLAG_COMPRESSED, 0, "repetitive JSON should compress");
        assert!(wire.len() < body.len());
        assert_eq!(decode_packet(&wire).unwrap().body, body);
    }

    #[test]
    fn nack_carries_only_a_sequence() {
        let wire = encode_packet(&Packet::nack(LinkSequence(41))).unwrap();
        let decoded = decode_packet(&wire).unwrap();
        assert_eq!(decoded.kind, PacketKind::Nack);
        assert_eq!(decoded.link_seq, LinkSequence(41));
        assert!(decoded.body.is_empty());
    }

    #[test]
    fn any_flipped_byte_fails_integrity() {
        let wire = encode_packet(&Packet::data(LinkSequence(1), big_json_body())).unwrap();
        for i in [0, 1, 5, HEADER_LEN, wire.len() / 2, wire.len() - 1] {
            let mut bad = wire.clone();
            bad[i] ^= 0x40;
            let err = decode_packet(&bad).unwrap_err();
            assert!(
                matches!(err, CodecError::IntegrityMismatch { .. }),
                "flip at {i} should fail the CRC, got {err:?}"
            );
        }
    }

    #[test]
    fn truncated_packet_is_rejected() {
        let wire = encode_packet(&Packet::data(LinkSequence(1), b"x".to_vec())).unwrap();
        let err = decode_packet(&wire[..10]).unwrap_err();
        assert_eq!(err, CodecError::Truncated { len: 10 });
    }

    #[test]
    fn oversized_body_is_refused() {
        let packet = Packet::data(LinkSequence(0), vec![0u8; MAX_BODY_SIZE + 1]);
        assert_eq!(
            encode_packet(&packet).unwrap_err(),
            CodecError::BodyTooLarge(MAX_BODY_SIZE + 1)
        );
    }
}
