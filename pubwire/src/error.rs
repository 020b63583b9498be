//! 错误类型定义

use std::fmt;

use thiserror::Error;

/// 协议错误类型
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// IO 错误
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// 连接已关闭
    #[error("Connection closed")]
    ConnectionClosed,

    /// 连接超时
    #[error("Connection timeout")]
    ConnectionTimeout,

    /// 流模式下不允许离散传输
    #[error("Can't {operation} while streaming")]
    Streaming { operation: &'static str },

    /// 收到的状态码与期望不符
    #[error("Expected code {expected}, got {actual} {text:?}")]
    UnexpectedCode {
        expected: u16,
        actual: u16,
        text: String,
    },

    /// 多行块内部出现了不该出现的行
    #[error("Unexpected line {code} inside {block}")]
    UnexpectedLine { code: u16, block: &'static str },

    /// 无法解析的协议行
    #[error("Malformed line: {0:?}")]
    MalformedLine(String),

    /// 消息标签不匹配
    #[error("Tag mismatch: expected {expected:?}, got {actual:?}")]
    TagMismatch { expected: String, actual: String },

    /// 缺少文件开始标记
    #[error("No START FILE found")]
    MissingFileStart,

    /// 文件块中的非法行
    #[error("No valid file line received (code {code})")]
    InvalidFileLine { code: u16 },

    /// 对端结束了流
    #[error("Stream ended by peer")]
    StreamEnded,

    /// 本地文件错误
    #[error("File error: {0}")]
    File(#[source] std::io::Error),

    /// 文本不是合法的 UTF-8
    #[error("Invalid UTF-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    /// 远程发布的标签头被截断
    #[error("Envelope truncated: tag needs {needed} bytes, {available} available")]
    EnvelopeTruncated { needed: usize, available: usize },

    /// 远程发布超出大小限制
    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// 后台任务异常退出
    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// 协议操作结果类型
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// 带部分结果的错误
///
/// 接收操作失败时不会丢弃已经完成的工作：已构建的消息、已创建的文件、
/// 已读入缓冲区的字节数都随错误一起返回，由调用方决定是否可用。
/// 不关心部分结果时可直接用 `?` 转换为 [`ProtocolError`]。
pub struct Incomplete<T> {
    /// 出错前已完成的部分结果
    pub partial: Option<T>,
    /// 导致失败的错误
    pub error: ProtocolError,
}

impl<T> Incomplete<T> {
    pub fn new(partial: Option<T>, error: ProtocolError) -> Self {
        Self { partial, error }
    }

    /// 附带部分结果
    pub fn with_partial(partial: T, error: ProtocolError) -> Self {
        Self::new(Some(partial), error)
    }

    pub fn into_parts(self) -> (Option<T>, ProtocolError) {
        (self.partial, self.error)
    }
}

impl<T> From<ProtocolError> for Incomplete<T> {
    fn from(error: ProtocolError) -> Self {
        Self::new(None, error)
    }
}

impl<T> From<Incomplete<T>> for ProtocolError {
    fn from(incomplete: Incomplete<T>) -> Self {
        incomplete.error
    }
}

impl<T: fmt::Debug> fmt::Debug for Incomplete<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Incomplete")
            .field("partial", &self.partial)
            .field("error", &self.error)
            .finish()
    }
}

impl<T> fmt::Display for Incomplete<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.error, f)
    }
}

impl<T: fmt::Debug> std::error::Error for Incomplete<T> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// 接收操作的结果类型
pub type ReceiveResult<T> = std::result::Result<T, Incomplete<T>>;
