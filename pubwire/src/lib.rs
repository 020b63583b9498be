//! 点对点消息工具库
//!
//! 包含:
//! - 消息类型定义 (Message)
//! - 行协议编解码 (LineReader, LineWriter)
//! - 连接封装：消息、字符串、文件、字节流 (Connection)
//! - 传输层抽象 (Transport trait)
//! - 发布引擎：本地扇出与远程洪泛 (Publisher)
//! - 订阅者与邮箱 (Subscriber, Mailbox)
//! - 会合层 (Messenger)

mod codec;
mod connection;
mod constants;
mod envelope;
mod error;
mod message;
mod messenger;
mod publisher;
mod subscriber;
mod transport;

pub use codec::{Line, LineReader, LineWriter};
pub use connection::{Connection, StreamReader, StreamWriter, TcpConnection};
pub use constants::*;
pub use envelope::{decode as decode_envelope, encode_header as encode_envelope_header};
pub use error::{Incomplete, ProtocolError, ReceiveResult, Result};
pub use message::Message;
pub use messenger::Messenger;
pub use publisher::{Gathering, Publisher, PublisherConfig};
pub use subscriber::{Mailbox, Subscriber};
pub use transport::{TcpListener, TcpTransport, Transport, TransportConfig, TransportListener};
