//! 远程发布编码
//!
//! 远程发布不使用行协议，每条连接只传输一条消息，发送完即关闭:
//! ```text
//! ┌──────────────────────────┬──────────────┬──────────────────────┐
//! │  Tag length (N bytes)    │  Tag bytes   │  Payload (至连接结束) │
//! │  255 × ⌊len/255⌋, len%255│              │                      │
//! └──────────────────────────┴──────────────┴──────────────────────┘
//! ```
//!
//! 解码时累加长度字节，直到读到一个小于 255 的字节为止。
//! 标签本身不做转义，长度歧义由调用方负责避免。

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{ProtocolError, Result};

/// 长度续位字节
const CONTINUATION: u8 = 255;

/// 编码标签头（长度前缀 + 标签字节）
pub fn encode_header(tag: &str) -> Bytes {
    let tag = tag.as_bytes();
    let mut header = BytesMut::with_capacity(tag.len() / 255 + 1 + tag.len());
    for _ in 0..tag.len() / 255 {
        header.put_u8(CONTINUATION);
    }
    header.put_u8((tag.len() % 255) as u8);
    header.put_slice(tag);
    header.freeze()
}

/// 解码一次完整的传输，返回标签和正文
pub fn decode(mut data: Bytes) -> Result<(String, Bytes)> {
    let mut tag_len = 0usize;
    loop {
        if !data.has_remaining() {
            return Err(ProtocolError::EnvelopeTruncated {
                needed: tag_len + 1,
                available: 0,
            });
        }
        let byte = data.get_u8();
        tag_len += usize::from(byte);
        if byte < CONTINUATION {
            break;
        }
    }

    if data.len() < tag_len {
        return Err(ProtocolError::EnvelopeTruncated {
            needed: tag_len,
            available: data.len(),
        });
    }
    let tag = data.split_to(tag_len);
    let tag = String::from_utf8(tag.to_vec())?;
    Ok((tag, data))
}
