//! MLLP编解码器
//!
//! 解码器是跨读取保持状态的扫描器：起始字节之前的数据视为噪声丢弃；
//! 帧失步时丢弃已缓冲的部分帧，并在下一个起始字节处重新同步，
//! 连接不会因此终止。

use bytes::{Buf, BufMut, Bytes, BytesMut};
use hl7_core::{EngineError, Result};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, warn};

/// 起始块 (VT)
pub const START_BLOCK: u8 = 0x0B;
/// 结束块 (FS)
pub const END_BLOCK: u8 = 0x1C;
/// 结束块之后的回车
pub const CARRIAGE_RETURN: u8 = 0x0D;
/// 默认最大帧长度
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// 帧失步原因
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FramingError {
    #[error("start block inside an open frame, {discarded} bytes discarded")]
    NestedStartBlock { discarded: usize },
    #[error("end block not followed by carriage return, {discarded} bytes discarded")]
    MissingCarriageReturn { discarded: usize },
    #[error("frame exceeds {limit} bytes, {discarded} bytes discarded")]
    FrameTooLarge { discarded: usize, limit: usize },
}

impl From<FramingError> for EngineError {
    fn from(error: FramingError) -> Self {
        EngineError::Framing(error.to_string())
    }
}

/// 单次扫描结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scan {
    /// 完整的消息负载(不含帧字节)
    Frame(Bytes),
    /// 需要更多数据
    NeedMore,
    /// 帧失步，已重新同步
    Desync(FramingError),
}

/// 解码器输出
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MllpFrame {
    Message(Bytes),
    Desync(FramingError),
}

/// MLLP编解码器
#[derive(Debug, Clone)]
pub struct MllpCodec {
    in_frame: bool,
    scanned: usize,
    max_frame_length: usize,
}

impl Default for MllpCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl MllpCodec {
    pub fn new() -> Self {
        Self::with_max_frame_length(DEFAULT_MAX_FRAME_LENGTH)
    }

    pub fn with_max_frame_length(max_frame_length: usize) -> Self {
        Self {
            in_frame: false,
            scanned: 0,
            max_frame_length,
        }
    }

    /// 为负载加上MLLP帧
    pub fn frame(payload: &[u8]) -> Bytes {
        let mut framed = BytesMut::with_capacity(payload.len() + 3);
        framed.put_u8(START_BLOCK);
        framed.extend_from_slice(payload);
        framed.put_u8(END_BLOCK);
        framed.put_u8(CARRIAGE_RETURN);
        framed.freeze()
    }

    fn reset(&mut self) {
        self.in_frame = false;
        self.scanned = 0;
    }

    /// 扫描缓冲区，最多取出一帧
    pub fn scan(&mut self, buf: &mut BytesMut) -> Scan {
        if !self.in_frame {
            match buf.iter().position(|&b| b == START_BLOCK) {
                Some(position) => {
                    if position > 0 {
                        debug!(discarded = position, "Discarding bytes before MLLP start block");
                    }
                    buf.advance(position + 1);
                    self.in_frame = true;
                    self.scanned = 0;
                }
                None => {
                    if !buf.is_empty() {
                        debug!(discarded = buf.len(), "Discarding bytes outside of MLLP frame");
                        buf.clear();
                    }
                    return Scan::NeedMore;
                }
            }
        }

        let mut i = self.scanned;
        while i < buf.len() {
            match buf[i] {
                START_BLOCK => {
                    buf.advance(i + 1);
                    self.scanned = 0;
                    return Scan::Desync(FramingError::NestedStartBlock { discarded: i });
                }
                END_BLOCK => {
                    if i + 1 >= buf.len() {
                        self.scanned = i;
                        return Scan::NeedMore;
                    }
                    if buf[i + 1] == CARRIAGE_RETURN {
                        if i > self.max_frame_length {
                            buf.advance(i + 2);
                            self.reset();
                            return Scan::Desync(FramingError::FrameTooLarge {
                                discarded: i,
                                limit: self.max_frame_length,
                            });
                        }
                        let payload = buf.split_to(i).freeze();
                        buf.advance(2);
                        self.reset();
                        return Scan::Frame(payload);
                    }
                    buf.advance(i + 1);
                    self.reset();
                    return Scan::Desync(FramingError::MissingCarriageReturn { discarded: i + 1 });
                }
                _ => i += 1,
            }
        }

        if buf.len() > self.max_frame_length {
            let discarded = buf.len();
            buf.clear();
            self.reset();
            return Scan::Desync(FramingError::FrameTooLarge {
                discarded,
                limit: self.max_frame_length,
            });
        }

        self.scanned = buf.len();
        Scan::NeedMore
    }
}

impl Decoder for MllpCodec {
    type Item = MllpFrame;
    type Error = EngineError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<MllpFrame>> {
        Ok(match self.scan(src) {
            Scan::Frame(payload) => Some(MllpFrame::Message(payload)),
            Scan::Desync(error) => {
                warn!(error = %error, "MLLP stream desynchronized");
                Some(MllpFrame::Desync(error))
            }
            Scan::NeedMore => None,
        })
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<MllpFrame>> {
        match self.decode(buf)? {
            Some(frame) => Ok(Some(frame)),
            None => {
                if self.in_frame || !buf.is_empty() {
                    debug!(pending = buf.len(), "Connection closed inside an MLLP frame");
                    buf.clear();
                    self.reset();
                }
                Ok(None)
            }
        }
    }
}

impl<T: AsRef<[u8]>> Encoder<T> for MllpCodec {
    type Error = EngineError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<()> {
        let payload = item.as_ref();
        if payload.iter().any(|&b| b == START_BLOCK || b == END_BLOCK) {
            return Err(EngineError::Framing(
                "payload contains MLLP block characters".to_string(),
            ));
        }
        dst.reserve(payload.len() + 3);
        dst.put_u8(START_BLOCK);
        dst.extend_from_slice(payload);
        dst.put_u8(END_BLOCK);
        dst.put_u8(CARRIAGE_RETURN);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{SinkExt, StreamExt};
    use tokio_util::codec::{FramedRead, FramedWrite};

    const MSG_A: &[u8] = b"MSH|^~\\&|A|B|C|D|20230101||ADT^A01|1|P|2.3\rPID|1||12345\r";
    const MSG_B: &[u8] = b"MSH|^~\\&|A|B|C|D|20230101||ORU^R01|2|P|2.5\rOBX|1|NM|X||5\r";

    fn stream_of(messages: &[&[u8]]) -> Vec<u8> {
        messages
            .iter()
            .flat_map(|m| MllpCodec::frame(m).to_vec())
            .collect()
    }

    fn decode_all(codec: &mut MllpCodec, buf: &mut BytesMut) -> Vec<MllpFrame> {
        let mut frames = Vec::new();
        while let Some(frame) = codec.decode(buf).unwrap() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn test_frame() {
        let framed = MllpCodec::frame(b"MSH|x");
        assert_eq!(&framed[..], b"\x0bMSH|x\x1c\x0d");
    }

    #[test]
    fn test_single_frame() {
        let mut codec = MllpCodec::new();
        let mut buf = BytesMut::from(&MllpCodec::frame(MSG_A)[..]);
        assert_eq!(codec.scan(&mut buf), Scan::Frame(Bytes::from_static(MSG_A)));
        assert!(buf.is_empty());
        assert_eq!(codec.scan(&mut buf), Scan::NeedMore);
    }

    #[test]
    fn test_any_chunking_reconstructs_messages() {
        let stream = stream_of(&[MSG_A, MSG_B, MSG_A]);
        for chunk_size in 1..=stream.len() {
            let mut codec = MllpCodec::new();
            let mut buf = BytesMut::new();
            let mut frames = Vec::new();
            for chunk in stream.chunks(chunk_size) {
                buf.extend_from_slice(chunk);
                frames.extend(decode_all(&mut codec, &mut buf));
            }
            assert_eq!(
                frames,
                vec![
                    MllpFrame::Message(Bytes::from_static(MSG_A)),
                    MllpFrame::Message(Bytes::from_static(MSG_B)),
                    MllpFrame::Message(Bytes::from_static(MSG_A)),
                ],
                "chunk size {chunk_size}"
            );
        }
    }

    #[test]
    fn test_noise_before_start_is_discarded() {
        let mut codec = MllpCodec::new();
        let mut bytes = b"\r\nGARBAGE\x1c\x0d".to_vec();
        bytes.extend(stream_of(&[MSG_A]));
        let mut buf = BytesMut::from(&bytes[..]);
        assert_eq!(
            decode_all(&mut codec, &mut buf),
            vec![MllpFrame::Message(Bytes::from_static(MSG_A))]
        );
    }

    #[test]
    fn test_nested_start_block_resynchronizes() {
        let mut codec = MllpCodec::new();
        let mut bytes = b"\x0bPARTIAL".to_vec();
        bytes.extend(stream_of(&[MSG_B]));
        let mut buf = BytesMut::from(&bytes[..]);
        assert_eq!(
            decode_all(&mut codec, &mut buf),
            vec![
                MllpFrame::Desync(FramingError::NestedStartBlock { discarded: 7 }),
                MllpFrame::Message(Bytes::from_static(MSG_B)),
            ]
        );
    }

    #[test]
    fn test_missing_carriage_return_resynchronizes() {
        let mut codec = MllpCodec::new();
        let mut bytes = b"\x0bBROKEN\x1cX".to_vec();
        bytes.extend(stream_of(&[MSG_A]));
        let mut buf = BytesMut::from(&bytes[..]);
        assert_eq!(
            decode_all(&mut codec, &mut buf),
            vec![
                MllpFrame::Desync(FramingError::MissingCarriageReturn { discarded: 7 }),
                MllpFrame::Message(Bytes::from_static(MSG_A)),
            ]
        );
    }

    #[test]
    fn test_end_block_split_across_reads() {
        let mut codec = MllpCodec::new();
        let mut buf = BytesMut::from(&b"\x0bMSH|x\x1c"[..]);
        assert_eq!(codec.scan(&mut buf), Scan::NeedMore);
        buf.extend_from_slice(b"\x0d");
        assert_eq!(codec.scan(&mut buf), Scan::Frame(Bytes::from_static(b"MSH|x")));
    }

    #[test]
    fn test_oversized_frame_is_dropped() {
        let mut codec = MllpCodec::with_max_frame_length(8);
        let mut buf = BytesMut::from(&b"\x0b0123456789"[..]);
        assert_eq!(
            codec.scan(&mut buf),
            Scan::Desync(FramingError::FrameTooLarge {
                discarded: 10,
                limit: 8
            })
        );
        buf.extend_from_slice(&MllpCodec::frame(b"ok"));
        assert_eq!(codec.scan(&mut buf), Scan::Frame(Bytes::from_static(b"ok")));
    }

    #[test]
    fn test_oversized_frame_in_single_read() {
        let mut codec = MllpCodec::with_max_frame_length(8);
        let mut buf = BytesMut::from(&b"\x0b0123456789ABCDEF\x1c\x0d"[..]);
        buf.extend_from_slice(&MllpCodec::frame(b"ok"));
        assert_eq!(
            codec.scan(&mut buf),
            Scan::Desync(FramingError::FrameTooLarge {
                discarded: 16,
                limit: 8
            })
        );
        assert_eq!(codec.scan(&mut buf), Scan::Frame(Bytes::from_static(b"ok")));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_frame_at_limit_is_accepted() {
        let mut codec = MllpCodec::with_max_frame_length(8);
        let mut buf = BytesMut::from(&MllpCodec::frame(b"01234567")[..]);
        assert_eq!(
            codec.scan(&mut buf),
            Scan::Frame(Bytes::from_static(b"01234567"))
        );
    }

    #[test]
    fn test_decode_eof_with_partial_frame() {
        let mut codec = MllpCodec::new();
        let mut buf = BytesMut::from(&b"\x0bMSH|partial"[..]);
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_encoder_rejects_block_characters() {
        let mut codec = MllpCodec::new();
        let mut dst = BytesMut::new();
        assert!(codec.encode(&b"bad\x1cpayload"[..], &mut dst).is_err());
        codec.encode("MSH|ok", &mut dst).unwrap();
        assert_eq!(&dst[..], b"\x0bMSH|ok\x1c\x0d");
    }

    #[tokio::test]
    async fn test_framed_over_duplex() {
        let (client, server) = tokio::io::duplex(7);
        let mut writer = FramedWrite::new(client, MllpCodec::new());
        let mut reader = FramedRead::new(server, MllpCodec::new());

        let send = tokio::spawn(async move {
            writer.send(MSG_A).await.unwrap();
            writer.send(MSG_B).await.unwrap();
        });

        let first = reader.next().await.unwrap().unwrap();
        let second = reader.next().await.unwrap().unwrap();
        send.await.unwrap();

        assert_eq!(first, MllpFrame::Message(Bytes::from_static(MSG_A)));
        assert_eq!(second, MllpFrame::Message(Bytes::from_static(MSG_B)));
        assert!(reader.next().await.is_none());
    }
}
