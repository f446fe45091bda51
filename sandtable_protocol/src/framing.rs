// Stream framing for packets over TCP.
//
// A stream transport has no message boundaries, so each encoded packet (see
// `codec.rs`) is written as a 4-byte big-endian length followed by the packet
// bytes. Framing is deliberately dumb: it does not look inside the packet.
// Integrity checking, decompression and sequencing all happen one layer up,
// which is what lets the in-memory transport skip framing entirely.
//
// A valid packet is never empty (the header alone is 15 bytes), so a zero
// length prefix is treated as stream corruption rather than as an empty frame.

use std::io::{self, Read, Write};

/// Upper bound on one frame. Frame inputs and checksums are tiny; this only
/// exists so a garbage length prefix cannot trigger a huge allocation.
pub const MAX_FRAME_SIZE: u32 = 4 * 1024 * 1024;

/// Write one length-prefixed frame and flush.
pub fn write_frame<W: Write>(writer: &mut W, packet: &[u8]) -> io::Result<()> {
    let len = u32::try_from(packet.len())
        .ok()
        .filter(|&len| len <= MAX_FRAME_SIZE)
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("frame too large: {} bytes (max {MAX_FRAME_SIZE})", packet.len()),
            )
        })?;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(packet)?;
    writer.flush()
}

/// Read one length-prefixed frame.
///
/// `UnexpectedEof` means the peer closed the stream (cleanly or mid-frame);
/// `InvalidData` means the length prefix itself is nonsense.
pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<Vec<u8>> {
    let mut prefix = [0u8; 4];
    reader.read_exact(&mut prefix)?;
    let len = u32::from_be_bytes(prefix);
    if len == 0 || len > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("bad frame length {len}"),
        ));
    }
    let mut frame = vec![0u8; len as usize];
    reader.read_exact(&mut frame)?;
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn frames_keep_their_boundaries() {
        let packets: [&[u8]; 3] = [b"alpha", b"b", b"gamma-delta"];
        let mut wire = Vec::new();
        for p in packets {
            write_frame(&mut wire, p).unwrap();
        }
        let mut cursor = Cursor::new(wire);
        for expected in packets {
            assert_eq!(read_frame(&mut cursor).unwrap(), expected);
        }
        let eof = read_frame(&mut cursor).unwrap_err();
        assert_eq!(eof.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn zero_length_prefix_is_invalid() {
        let mut cursor = Cursor::new(vec![0u8; 4]);
        let err = read_frame(&mut cursor).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn oversized_prefix_is_rejected_before_allocating() {
        let mut cursor = Cursor::new((MAX_FRAME_SIZE + 1).to_be_bytes().to_vec());
        let err = read_frame(&mut cursor).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn oversized_write_is_refused() {
        let big = vec![1u8; MAX_FRAME_SIZE as usize + 1];
        let err = write_frame(&mut Vec::new(), &big).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn truncated_body_is_eof() {
        let mut wire = 10u32.to_be_bytes().to_vec();
        wire.extend_from_slice(b"short");
        let err = read_frame(&mut Cursor::new(wire)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
