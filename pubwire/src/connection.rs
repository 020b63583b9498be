//! 连接封装
//!
//! 在一条双向字节传输之上提供四种传输原语：消息、字符串、文件和字节流。
//! 所有原语共用同一种"状态码 + 空格 + 文本"的行格式（见 [`crate::codec`]）。
//!
//! 离散传输（消息、字符串、文件）与流模式互斥。进入流模式需要双方各自调用
//! [`Connection::start_stream`] 完成对称握手。

use std::io::SeekFrom;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::{Buf, BytesMut};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncSeekExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::{debug, trace};

use crate::codec::{escape_frame, split_lines, unescape_frame, LineReader, LineWriter};
use crate::error::{Incomplete, ProtocolError, ReceiveResult, Result};
use crate::message::Message;
use crate::transport::Transport;
use crate::{
    FILE_CLASS, FILE_END, FILE_END_TEXT, FILE_LINE, FILE_START, FILE_START_TEXT, MESSAGE_CLASS,
    MESSAGE_END, MESSAGE_END_TEXT, MESSAGE_LINE, MESSAGE_TAG, STREAM_END, STREAM_END_TEXT,
    STREAM_LINE, STREAM_START, STREAM_START_TEXT, STRING,
};

/// TCP 之上的连接
pub type TcpConnection = Connection<OwnedReadHalf, OwnedWriteHalf>;

/// 连接封装
///
/// `&mut self` 保证同一时刻只有一个调用方在使用连接。需要一边读一边写时，
/// 用 [`Connection::split`] 拆成两端交给不同任务。
///
/// # Type Parameters
/// * `R` - 读取端类型
/// * `W` - 写入端类型
pub struct Connection<R, W> {
    reader: StreamReader<R>,
    writer: StreamWriter<W>,
}

impl<R: AsyncRead + Unpin, W: AsyncWrite + Unpin> Connection<R, W> {
    /// 从传输层创建连接
    pub fn new<T: Transport<Reader = R, Writer = W>>(transport: T) -> Self {
        let (reader, writer) = transport.split();
        Self::from_parts(reader, writer)
    }

    /// 从读写端直接创建连接
    pub fn from_parts(reader: R, writer: W) -> Self {
        let streaming = Arc::new(AtomicBool::new(false));
        Self {
            reader: StreamReader {
                lines: LineReader::new(reader),
                streaming: Arc::clone(&streaming),
                leftover: BytesMut::new(),
            },
            writer: StreamWriter {
                lines: LineWriter::new(writer),
                streaming,
            },
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.reader.is_streaming()
    }

    /// 分离为流读取端和流写入端
    ///
    /// 用于流模式下并发读写的场景。两端共享流状态：任一端结束流后，
    /// 另一端也回到非流模式。
    pub fn split(self) -> (StreamReader<R>, StreamWriter<W>) {
        (self.reader, self.writer)
    }

    fn ensure_discrete(&self, operation: &'static str) -> Result<()> {
        if self.is_streaming() {
            return Err(ProtocolError::Streaming { operation });
        }
        Ok(())
    }

    /// 发送消息
    ///
    /// 先封存消息，然后按行发送正文。正文末尾的换行不会产生额外的空行，
    /// 接收方会在每一行后补上换行。
    pub async fn send_message(&mut self, mut message: Message) -> Result<()> {
        self.ensure_discrete("send message")?;
        message.seal();

        self.writer
            .lines
            .write_line(MESSAGE_TAG, message.tag().as_bytes())
            .await?;
        let payload = message.take_payload();
        for line in split_lines(&payload) {
            self.writer.lines.write_line(MESSAGE_LINE, line).await?;
        }
        self.writer
            .lines
            .write_line(MESSAGE_END, MESSAGE_END_TEXT.as_bytes())
            .await?;
        self.writer.lines.flush().await?;

        debug!(tag = message.tag(), bytes = payload.len(), "Message sent");
        Ok(())
    }

    /// 接收任意标签的消息
    pub async fn receive_message(&mut self) -> ReceiveResult<Message> {
        self.receive_tagged(None).await
    }

    /// 接收指定标签的消息
    ///
    /// 标签不符时返回 [`ProtocolError::TagMismatch`]，消息正文留在连接中未被读取。
    pub async fn receive_message_with_tag(&mut self, tag: &str) -> ReceiveResult<Message> {
        self.receive_tagged(Some(tag)).await
    }

    async fn receive_tagged(&mut self, expected: Option<&str>) -> ReceiveResult<Message> {
        self.ensure_discrete("receive message")?;

        let tag = self
            .reader
            .lines
            .read_code_line(MESSAGE_TAG)
            .await?
            .into_string()?;
        if let Some(expected) = expected {
            if tag != expected {
                return Err(ProtocolError::TagMismatch {
                    expected: expected.to_string(),
                    actual: tag,
                }
                .into());
            }
        }

        let mut message = Message::new(tag);
        loop {
            let line = match self.reader.lines.read_code_line(MESSAGE_CLASS).await {
                Ok(line) => line,
                Err(e) => return Err(Incomplete::with_partial(message, e)),
            };
            match line.code {
                MESSAGE_LINE => {
                    message.append(&line.text);
                    message.append(b"\n");
                }
                MESSAGE_END => {
                    debug!(tag = message.tag(), bytes = message.len(), "Message received");
                    return Ok(message);
                }
                code => {
                    return Err(Incomplete::with_partial(
                        message,
                        ProtocolError::UnexpectedLine {
                            code,
                            block: "message",
                        },
                    ))
                }
            }
        }
    }

    /// 发送单行字符串
    ///
    /// 不做任何转义，调用方不得传入包含换行的字符串。
    pub async fn send_string(&mut self, text: &str) -> Result<()> {
        self.ensure_discrete("send string")?;
        self.writer.lines.send_line(STRING, text.as_bytes()).await
    }

    /// 接收单行字符串
    pub async fn receive_string(&mut self) -> Result<String> {
        self.ensure_discrete("receive string")?;
        self.reader.lines.read_code_line(STRING).await?.into_string()
    }

    /// 逐行发送文件，发送后关闭文件
    pub async fn send_and_close_file(&mut self, file: File) -> Result<()> {
        self.ensure_discrete("send file")?;

        self.writer
            .lines
            .write_line(FILE_START, FILE_START_TEXT.as_bytes())
            .await?;
        let mut lines = BufReader::new(file).split(b'\n');
        let mut count = 0usize;
        while let Some(line) = lines.next_segment().await.map_err(ProtocolError::File)? {
            self.writer.lines.write_line(FILE_LINE, &line).await?;
            count += 1;
        }
        drop(lines);
        self.writer
            .lines
            .write_line(FILE_END, FILE_END_TEXT.as_bytes())
            .await?;
        self.writer.lines.flush().await?;

        debug!(lines = count, "File sent");
        Ok(())
    }

    /// 接收文件并写入 `path`
    ///
    /// 目标文件会先被创建。成功时文件已刷新并回到开头；
    /// 失败时（包括缺少开始标记）仍返回已创建、可能只写了一部分的文件。
    pub async fn receive_file(&mut self, path: impl AsRef<Path>) -> ReceiveResult<File> {
        self.ensure_discrete("receive file")?;

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())
            .await
            .map_err(ProtocolError::File)?;

        match self.reader.lines.read_code_line(FILE_START).await {
            Ok(_) => {}
            Err(ProtocolError::UnexpectedCode { actual, .. }) => {
                debug!(code = actual, "File transfer without start marker");
                return Err(Incomplete::with_partial(file, ProtocolError::MissingFileStart));
            }
            Err(e) => return Err(Incomplete::with_partial(file, e)),
        }

        loop {
            let line = match self.reader.lines.read_code_line(FILE_CLASS).await {
                Ok(line) => line,
                Err(e) => return Err(Incomplete::with_partial(file, e)),
            };
            match line.code {
                FILE_LINE => {
                    let written = async {
                        file.write_all(&line.text).await?;
                        file.write_all(b"\n").await
                    }
                    .await;
                    if let Err(e) = written {
                        return Err(Incomplete::with_partial(file, ProtocolError::File(e)));
                    }
                }
                FILE_END => {
                    let rewound = async {
                        file.flush().await?;
                        file.sync_all().await?;
                        file.seek(SeekFrom::Start(0)).await
                    }
                    .await;
                    return match rewound {
                        Ok(_) => {
                            debug!(path = %path.as_ref().display(), "File received");
                            Ok(file)
                        }
                        Err(e) => Err(Incomplete::with_partial(file, ProtocolError::File(e))),
                    };
                }
                code => {
                    return Err(Incomplete::with_partial(
                        file,
                        ProtocolError::InvalidFileLine { code },
                    ))
                }
            }
        }
    }

    /// 进入流模式
    ///
    /// 幂等。发送开始标记后阻塞，直到读到对端的开始标记为止；
    /// 对端必须同样调用 `start_stream`。
    pub async fn start_stream(&mut self) -> Result<()> {
        if self.writer.streaming.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.writer
            .lines
            .send_line(STREAM_START, STREAM_START_TEXT.as_bytes())
            .await?;
        self.reader.lines.read_code_line(STREAM_START).await?;
        debug!("Stream started");
        Ok(())
    }

    /// 退出流模式
    ///
    /// 幂等。发送结束标记后立即返回，不等待确认；对端已发出的帧仍可能到达。
    pub async fn stop_stream(&mut self) -> Result<()> {
        self.writer.stop_stream().await
    }

    /// 流模式下写入字节，见 [`StreamWriter::write`]
    pub async fn write(&mut self, data: &[u8]) -> Result<usize> {
        self.writer.write(data).await
    }

    /// 流模式下读取字节，见 [`StreamReader::read`]
    pub async fn read(&mut self, buf: &mut [u8]) -> ReceiveResult<usize> {
        self.reader.read(buf).await
    }

    /// 关闭连接（发送缓冲数据并关闭写入端）
    pub async fn close(self) -> Result<()> {
        self.writer.close().await
    }
}

/// 流读取端
pub struct StreamReader<R> {
    lines: LineReader<R>,
    streaming: Arc<AtomicBool>,
    /// 上一个流帧中放不进调用方缓冲区的剩余字节
    leftover: BytesMut,
}

impl<R: AsyncRead + Unpin> StreamReader<R> {
    pub fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::Acquire)
    }

    /// 流模式下读取字节
    ///
    /// 先取出上次剩余的字节，缓冲区未满时继续读取流帧，多出的部分留给下次读取。
    /// 读到对端的结束标记时退出流模式，并以 [`ProtocolError::StreamEnded`]
    /// 返回本次已读入的字节数。非流模式下什么也不做并返回 0。
    pub async fn read(&mut self, buf: &mut [u8]) -> ReceiveResult<usize> {
        if !self.is_streaming() {
            return Ok(0);
        }

        let mut n = self.leftover.len().min(buf.len());
        buf[..n].copy_from_slice(&self.leftover[..n]);
        self.leftover.advance(n);

        while n < buf.len() {
            let line = match self.lines.read_code_line(STREAM_LINE).await {
                Ok(line) => line,
                Err(ProtocolError::UnexpectedCode {
                    actual: STREAM_END, ..
                }) => {
                    self.streaming.store(false, Ordering::Release);
                    debug!("Stream ended by peer");
                    return Err(Incomplete::with_partial(n, ProtocolError::StreamEnded));
                }
                Err(e) => return Err(Incomplete::with_partial(n, e)),
            };

            let frame = unescape_frame(&line.text);
            let take = frame.len().min(buf.len() - n);
            buf[n..n + take].copy_from_slice(&frame[..take]);
            n += take;
            self.leftover.extend_from_slice(&frame[take..]);
        }

        Ok(n)
    }
}

/// 流写入端
pub struct StreamWriter<W> {
    lines: LineWriter<W>,
    streaming: Arc<AtomicBool>,
}

impl<W: AsyncWrite + Unpin> StreamWriter<W> {
    pub fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::Acquire)
    }

    /// 流模式下写入字节
    ///
    /// 整个缓冲区转义后作为一个流帧发送，返回值总是输入长度。
    /// 非流模式下什么也不做并返回 0。
    pub async fn write(&mut self, data: &[u8]) -> Result<usize> {
        if !self.is_streaming() || data.is_empty() {
            return Ok(0);
        }
        self.lines
            .send_line(STREAM_LINE, &escape_frame(data))
            .await?;
        trace!(bytes = data.len(), "Stream frame written");
        Ok(data.len())
    }

    /// 退出流模式，幂等
    pub async fn stop_stream(&mut self) -> Result<()> {
        if !self.streaming.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        self.lines
            .send_line(STREAM_END, STREAM_END_TEXT.as_bytes())
            .await?;
        debug!("Stream stopped");
        Ok(())
    }

    /// 发送缓冲数据并关闭写入端
    pub async fn close(mut self) -> Result<()> {
        self.lines.shutdown().await
    }
}
