//! 行编解码
//!
//! 行格式:
//! ```text
//! ┌──────────────┬────────┬───────────────────────┬────────┐
//! │  Code (3B)   │ ' '(1B)│        Text           │  CRLF  │
//! │ ASCII digits │        │  任意字节（不含 LF）  │        │
//! └──────────────┴────────┴───────────────────────┴────────┘
//! ```
//!
//! 读取时同时接受 `\r\n` 与单独的 `\n` 作为行尾。
//! 期望码小于 100 时按前缀匹配（如 `20` 匹配 201/202/203），否则精确匹配。

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};

use crate::error::{ProtocolError, Result};

/// 行尾
const DELIMITER: &[u8] = b"\r\n";

/// 一行协议数据
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    pub code: u16,
    pub text: Vec<u8>,
}

impl Line {
    /// 解析去掉行尾后的一行
    pub fn parse(raw: &[u8]) -> Result<Self> {
        let malformed = || ProtocolError::MalformedLine(String::from_utf8_lossy(raw).into_owned());

        if raw.len() < 4 || raw[3] != b' ' || !raw[..3].iter().all(u8::is_ascii_digit) {
            return Err(malformed());
        }
        let code = raw[..3]
            .iter()
            .fold(0u16, |acc, digit| acc * 10 + u16::from(digit - b'0'));
        if code < 100 {
            return Err(malformed());
        }

        Ok(Self {
            code,
            text: raw[4..].to_vec(),
        })
    }

    /// 是否满足期望码（前缀或精确）
    pub fn matches(&self, expected: u16) -> bool {
        code_matches(self.code, expected)
    }

    /// 按 UTF-8 取出文本
    pub fn into_string(self) -> Result<String> {
        Ok(String::from_utf8(self.text)?)
    }
}

/// 期望码匹配规则
pub fn code_matches(code: u16, expected: u16) -> bool {
    if expected < 10 {
        code / 100 == expected
    } else if expected < 100 {
        code / 10 == expected
    } else {
        code == expected
    }
}

/// 按 `\n` 拆分正文，末尾的换行不产生空行
pub fn split_lines(payload: &[u8]) -> impl Iterator<Item = &[u8]> {
    let body = payload.strip_suffix(b"\n").unwrap_or(payload);
    let empty = payload.is_empty();
    body.split(|byte| *byte == b'\n').filter(move |_| !empty)
}

/// 流帧转义：每个换行字节变为 `\` `n` 两个字节
pub fn escape_frame(data: &[u8]) -> Vec<u8> {
    let mut escaped = Vec::with_capacity(data.len());
    for &byte in data {
        if byte == b'\n' {
            escaped.extend_from_slice(b"\\n");
        } else {
            escaped.push(byte);
        }
    }
    escaped
}

/// 流帧反转义：只把 `\` `n` 还原为换行，其他字节原样保留
pub fn unescape_frame(text: &[u8]) -> Vec<u8> {
    let mut decoded = Vec::with_capacity(text.len());
    let mut i = 0;
    while i < text.len() {
        if text[i] == b'\\' && text.get(i + 1) == Some(&b'n') {
            decoded.push(b'\n');
            i += 2;
        } else {
            decoded.push(text[i]);
            i += 1;
        }
    }
    decoded
}

/// 行读取器
pub struct LineReader<R> {
    reader: BufReader<R>,
    buffer: Vec<u8>,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    /// 创建新的行读取器
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            buffer: Vec::new(),
        }
    }

    /// 读取并解析一行
    pub async fn read_line(&mut self) -> Result<Line> {
        self.buffer.clear();
        let n = self.reader.read_until(b'\n', &mut self.buffer).await?;

        // 对端在行中途关闭，视为连接关闭
        if n == 0 || self.buffer.last() != Some(&b'\n') {
            return Err(ProtocolError::ConnectionClosed);
        }
        self.buffer.pop();
        if self.buffer.last() == Some(&b'\r') {
            self.buffer.pop();
        }

        Line::parse(&self.buffer)
    }

    /// 读取一行并检查状态码，不匹配时该行已被消耗
    pub async fn read_code_line(&mut self, expected: u16) -> Result<Line> {
        let line = self.read_line().await?;
        if !line.matches(expected) {
            return Err(ProtocolError::UnexpectedCode {
                expected,
                actual: line.code,
                text: String::from_utf8_lossy(&line.text).into_owned(),
            });
        }
        Ok(line)
    }
}

/// 行写入器
///
/// 写入会被缓冲，调用方在一个完整操作结束后调用 [`flush`](LineWriter::flush)。
pub struct LineWriter<W> {
    writer: BufWriter<W>,
}

impl<W: AsyncWrite + Unpin> LineWriter<W> {
    /// 创建新的行写入器
    pub fn new(writer: W) -> Self {
        Self {
            writer: BufWriter::new(writer),
        }
    }

    /// 写入一行
    pub async fn write_line(&mut self, code: u16, text: &[u8]) -> Result<()> {
        self.writer.write_all(code.to_string().as_bytes()).await?;
        self.writer.write_all(b" ").await?;
        self.writer.write_all(text).await?;
        self.writer.write_all(DELIMITER).await?;
        Ok(())
    }

    /// 写入一行并立即发送
    pub async fn send_line(&mut self, code: u16, text: &[u8]) -> Result<()> {
        self.write_line(code, text).await?;
        self.flush().await
    }

    pub async fn flush(&mut self) -> Result<()> {
        self.writer.flush().await?;
        Ok(())
    }

    /// 发送缓冲数据并关闭写入端
    pub async fn shutdown(&mut self) -> Result<()> {
        self.writer.shutdown().await?;
        Ok(())
    }
}
