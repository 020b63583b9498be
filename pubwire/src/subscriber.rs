//! 订阅者
//!
//! 发布引擎只依赖 [`Subscriber::receive`]。[`Mailbox`] 是一个有界、保序的
//! 默认实现，应用通过 [`Mailbox::wait_for_next`] 取出消息。

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use crate::message::Message;
use crate::MAILBOX_CAPACITY;

/// 订阅者 trait
///
/// `receive` 在该订阅者自己的投递任务中执行，可以挂起，
/// 但不会阻塞发布者或其他订阅者。
#[async_trait]
pub trait Subscriber: Send + Sync + 'static {
    /// 接收一条投递给本订阅者的消息
    async fn receive(&self, message: Message);
}

/// 有界邮箱订阅者
///
/// 邮箱满时 `receive` 会挂起，直到应用取走消息。
pub struct Mailbox {
    sender: mpsc::Sender<Message>,
    receiver: Mutex<mpsc::Receiver<Message>>,
}

impl Mailbox {
    pub fn new() -> Self {
        Self::with_capacity(MAILBOX_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity);
        Self {
            sender,
            receiver: Mutex::new(receiver),
        }
    }

    /// 按投递顺序等待下一条消息
    pub async fn wait_for_next(&self) -> Option<Message> {
        self.receiver.lock().await.recv().await
    }

    /// 不等待，立即取出一条消息（若有）
    pub fn try_next(&self) -> Option<Message> {
        self.receiver.try_lock().ok()?.try_recv().ok()
    }
}

impl Default for Mailbox {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Subscriber for Mailbox {
    async fn receive(&self, message: Message) {
        // 自己持有接收端，发送不会因通道关闭而失败
        let _ = self.sender.send(message).await;
    }
}
