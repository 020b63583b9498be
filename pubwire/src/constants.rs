//! 协议常量定义

use std::time::Duration;

/// 消息行类别前缀（201/202/203）
pub const MESSAGE_CLASS: u16 = 20;

/// 消息标签声明
pub const MESSAGE_TAG: u16 = 201;

/// 消息正文的一行
pub const MESSAGE_LINE: u16 = 202;

/// 消息结束标记
pub const MESSAGE_END: u16 = 203;

/// 单个字符串
pub const STRING: u16 = 301;

/// 文件行类别前缀（401/402/403）
pub const FILE_CLASS: u16 = 40;

/// 文件开始标记
pub const FILE_START: u16 = 401;

/// 文件内容的一行
pub const FILE_LINE: u16 = 402;

/// 文件结束标记
pub const FILE_END: u16 = 403;

/// 流开始标记（双方握手）
pub const STREAM_START: u16 = 501;

/// 一个流帧
pub const STREAM_LINE: u16 = 502;

/// 流结束标记
pub const STREAM_END: u16 = 503;

pub const MESSAGE_END_TEXT: &str = "END MESSAGE";
pub const FILE_START_TEXT: &str = "START FILE";
pub const FILE_END_TEXT: &str = "END FILE";
pub const STREAM_START_TEXT: &str = "START STREAM";
pub const STREAM_END_TEXT: &str = "END STREAM";

/// 会合成功后以标识符为标签发布的通知内容
pub const READY_TEXT: &str = "READY";

/// 订阅者邮箱容量
pub const MAILBOX_CAPACITY: usize = 4;

/// 远程发布单次传输的最大字节数
pub const MAX_ENVELOPE_SIZE: usize = 16 * 1024 * 1024;

/// 连接超时（秒）
pub const CONNECT_TIMEOUT_SECS: u64 = 10;

/// 连接超时 Duration
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(CONNECT_TIMEOUT_SECS);
