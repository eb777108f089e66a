use std::mem::size_of;

use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc::Crc;

use crate::message::MessageKindId;

/// Both channels of the duplex transport (and the platform transport's payloads)
///  carry the same length-prefixed framing: a fixed-length, self-describing
///  header followed by the message body. TCP has no message boundaries, so the
///  header is the only way to find them - which is why a header failing
///  validation is fatal for a stream: byte alignment cannot be recovered.
pub const FRAME_MAGIC: u16 = 0xC4FE;

pub const FRAME_HEADER_LEN: usize =
    size_of::<u16>() + size_of::<u64>() + size_of::<u32>() + size_of::<u32>();

fn body_checksum(body: &[u8]) -> u32 {
    let hasher = Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);
    let mut digest = hasher.digest();
    digest.update(body);
    digest.finalize()
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct FrameHeader {
    pub kind: MessageKindId,
    pub body_len: u32,
    pub body_crc: u32,
}

impl FrameHeader {
    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u16(FRAME_MAGIC);
        buf.put_u64(self.kind.0);
        buf.put_u32(self.body_len);
        buf.put_u32(self.body_crc);
    }

    /// Reads and validates a header. No body byte is trusted before this
    ///  succeeded.
    pub fn try_read(buf: &mut impl Buf, max_body_len: u32) -> anyhow::Result<FrameHeader> {
        let magic = buf.try_get_u16()?;
        if magic != FRAME_MAGIC {
            bail!("wrong magic bytes {:#06x}", magic);
        }
        let kind = MessageKindId(buf.try_get_u64()?);
        let body_len = buf.try_get_u32()?;
        if body_len > max_body_len {
            bail!("declared body length {} exceeds maximum {}", body_len, max_body_len);
        }
        let body_crc = buf.try_get_u32()?;
        Ok(FrameHeader { kind, body_len, body_crc })
    }
}

/// Serializes one complete frame (header + body) into `buf`.
pub fn write_frame(buf: &mut BytesMut, kind: MessageKindId, body: &[u8]) {
    FrameHeader {
        kind,
        body_len: body.len() as u32,
        body_crc: body_checksum(body),
    }.ser(buf);
    buf.put_slice(body);
}

/// Parses a datagram that must contain exactly one frame. Unlike stream
///  framing, a malformed datagram does not poison anything: datagram boundaries
///  cannot lose alignment, so the caller just drops it.
pub fn parse_datagram(mut buf: &[u8], max_body_len: u32) -> anyhow::Result<(MessageKindId, Bytes)> {
    let header = FrameHeader::try_read(&mut buf, max_body_len)?;
    if buf.len() != header.body_len as usize {
        bail!("datagram has {} body bytes, header declares {}", buf.len(), header.body_len);
    }
    if body_checksum(buf) != header.body_crc {
        bail!("body checksum mismatch in datagram of kind {:?}", header.kind);
    }
    Ok((header.kind, Bytes::copy_from_slice(buf)))
}

/// Accumulates stream bytes and extracts complete frames. Partial frames wait
///  for more bytes; a validation failure is sticky because the stream's byte
///  alignment is lost for good.
pub struct FrameAssembler {
    buf: BytesMut,
    max_body_len: u32,
    pending: Option<FrameHeader>,
    poisoned: bool,
}

impl FrameAssembler {
    pub fn new(max_body_len: u32) -> FrameAssembler {
        FrameAssembler {
            buf: BytesMut::new(),
            max_body_len,
            pending: None,
            poisoned: false,
        }
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// The next complete frame, or `None` if more bytes are needed.
    pub fn next_frame(&mut self) -> anyhow::Result<Option<(MessageKindId, Bytes)>> {
        if self.poisoned {
            bail!("frame stream is poisoned after an earlier framing error");
        }

        let header = match self.pending.take() {
            Some(header) => header,
            None => {
                if self.buf.len() < FRAME_HEADER_LEN {
                    return Ok(None);
                }
                match FrameHeader::try_read(&mut self.buf, self.max_body_len) {
                    Ok(header) => header,
                    Err(e) => {
                        self.poisoned = true;
                        return Err(e);
                    }
                }
            }
        };

        if self.buf.len() < header.body_len as usize {
            self.pending = Some(header);
            return Ok(None);
        }

        let body = self.buf.split_to(header.body_len as usize).freeze();
        if body_checksum(&body) != header.body_crc {
            self.poisoned = true;
            bail!("body checksum mismatch for frame of kind {:?}", header.kind);
        }
        Ok(Some((header.kind, body)))
    }
}

/// Body of the handshake control frame: the sender's UDP port. The IP is taken
///  from the TCP connection, so only the port needs exchanging.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct HandshakeData {
    pub udp_port: u16,
}

impl HandshakeData {
    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u16(self.udp_port);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<HandshakeData> {
        Ok(HandshakeData { udp_port: buf.try_get_u16()? })
    }
}

/// Body of the ping / pong control frames: a timestamp relative to the sending
///  connection's reference instant, echoed verbatim by the pong.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ProbeData {
    pub timestamp_nanos: u64,
}

impl ProbeData {
    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u64(self.timestamp_nanos);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<ProbeData> {
        Ok(ProbeData { timestamp_nanos: buf.try_get_u64()? })
    }
}
