//! 消息类型定义

use std::io;

use bytes::{Buf, Bytes, BytesMut};

/// 带标签的字节消息
///
/// 生命周期为"先写后封"：封存（[`seal`](Message::seal)）之后的写入被静默丢弃，
/// 读取则始终允许，并且会从头到尾消耗正文。
/// 发送或发布时会强制封存。
#[derive(Debug, Clone, Default)]
pub struct Message {
    tag: String,
    payload: BytesMut,
    sealed: bool,
    /// 消息来源地址，本地产生的消息为 None
    origin: Option<String>,
}

impl Message {
    /// 创建一条空消息
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            ..Default::default()
        }
    }

    /// 创建带初始正文的消息（复制 `payload`）
    pub fn with_payload(tag: impl Into<String>, payload: &[u8]) -> Self {
        Self {
            tag: tag.into(),
            payload: BytesMut::from(payload),
            ..Default::default()
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn set_tag(&mut self, tag: impl Into<String>) {
        self.tag = tag.into();
    }

    pub fn origin(&self) -> Option<&str> {
        self.origin.as_deref()
    }

    pub fn set_origin(&mut self, origin: impl Into<String>) {
        self.origin = Some(origin.into());
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// 封存消息，之后的写入都会被丢弃
    pub fn seal(&mut self) {
        self.sealed = true;
    }

    /// 追加正文，返回实际写入的字节数（封存后为 0）
    pub fn append(&mut self, data: &[u8]) -> usize {
        if self.sealed {
            return 0;
        }
        self.payload.extend_from_slice(data);
        data.len()
    }

    /// 尚未读取的正文
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// 一次性取走所有未读正文
    pub fn take_payload(&mut self) -> Bytes {
        self.payload.split().freeze()
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

impl io::Read for Message {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = buf.len().min(self.payload.len());
        buf[..n].copy_from_slice(&self.payload[..n]);
        self.payload.advance(n);
        Ok(n)
    }
}

impl io::Write for Message {
    /// 封存后的写入不是错误：数据被丢弃，但报告为已全部消耗
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.append(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    #[test]
    fn test_write_then_read() {
        let mut message = Message::new("tag");
        message.write_all(b"payload").unwrap();
        assert_eq!(message.tag(), "tag");

        let mut out = Vec::new();
        message.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"payload");
        assert!(message.is_empty());
    }

    #[test]
    fn test_writes_after_seal_are_discarded() {
        let mut message = Message::new("tag");
        message.write_all(b"abc").unwrap();
        message.seal();
        message.write_all(b"def").unwrap();
        assert_eq!(message.append(b"ghi"), 0);
        assert_eq!(message.payload(), b"abc");
    }

    #[test]
    fn test_read_after_seal() {
        let mut message = Message::with_payload("tag", b"abcdef");
        message.seal();

        let mut buf = [0u8; 4];
        assert_eq!(message.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"abcd");
        assert_eq!(message.take_payload(), Bytes::from_static(b"ef"));
        assert_eq!(message.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_origin_and_tag() {
        let mut message = Message::new("a");
        assert_eq!(message.origin(), None);
        message.set_origin("127.0.0.1:9000");
        message.set_tag("b");
        assert_eq!(message.origin(), Some("127.0.0.1:9000"));
        assert_eq!(message.tag(), "b");
    }

    #[test]
    fn test_clone_is_independent() {
        let mut first = Message::with_payload("tag", b"shared");
        let mut second = first.clone();
        second.append(b" and more");
        first.take_payload();
        assert!(first.is_empty());
        assert_eq!(second.payload(), b"shared and more");
    }
}
