//! 发布引擎
//!
//! 负责两件事:
//! - 本地扇出：按标签把消息复制给每个本地订阅者
//! - 远程洪泛：把消息转发给所有已登记的对端，消息来源对端除外
//!
//! 订阅表、对端列表和收集端口表由同一把锁保护，订阅变更与整次发布扇出
//! 各自原子执行，并发的订阅/退订不会与正在计算订阅者列表的发布交错。

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::envelope;
use crate::error::{ProtocolError, Result};
use crate::message::Message;
use crate::subscriber::Subscriber;
use crate::transport::{
    TcpListener, TcpTransport, Transport, TransportConfig, TransportListener,
};
use crate::MAX_ENVELOPE_SIZE;

/// 发布者配置
#[derive(Clone, Debug)]
pub struct PublisherConfig {
    /// 向对端转发时使用的传输配置
    pub transport: TransportConfig,
    /// 收集时单次传输允许的最大字节数
    pub max_envelope_size: usize,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            max_envelope_size: MAX_ENVELOPE_SIZE,
        }
    }
}

/// 一个订阅条目：订阅者句柄和它专属的投递队列
///
/// 每个条目有一个投递任务，按顺序调用 `receive`，
/// 慢订阅者只会拖慢自己的队列。队列不设上限：发布者从不等待订阅者，
/// 一个永不取走消息的订阅者会让它的队列一直增长，直到被退订。
struct Subscription {
    handle: Arc<dyn Subscriber>,
    queue: mpsc::UnboundedSender<Message>,
}

impl Subscription {
    fn spawn(tag: &str, handle: Arc<dyn Subscriber>) -> Self {
        let (queue, mut pending) = mpsc::unbounded_channel::<Message>();
        let subscriber = Arc::clone(&handle);
        let tag = tag.to_string();
        tokio::spawn(async move {
            while let Some(message) = pending.recv().await {
                subscriber.receive(message).await;
            }
            debug!(tag = %tag, "Delivery task finished");
        });
        Self { handle, queue }
    }

    fn is(&self, handle: *const ()) -> bool {
        Arc::as_ptr(&self.handle) as *const () == handle
    }

    fn deliver(&self, message: Message) {
        if self.queue.send(message).is_err() {
            warn!("Delivery task is gone, message dropped");
        }
    }
}

/// 共享状态
#[derive(Default)]
struct State {
    /// 标签 -> 订阅者列表（插入顺序即投递顺序，允许重复）
    subscriptions: HashMap<String, Vec<Subscription>>,
    /// 洪泛转发的对端地址
    peers: Vec<String>,
    /// 收集端口 -> 取消信号
    gathering: HashMap<u16, watch::Sender<bool>>,
}

struct Shared {
    state: Mutex<State>,
    config: PublisherConfig,
}

/// 发布者
///
/// 克隆得到的是同一个发布者的另一个句柄。不同的 `Publisher::new` 实例互不相干。
/// 所有操作都需要在 Tokio 运行时中调用。
#[derive(Clone)]
pub struct Publisher {
    shared: Arc<Shared>,
}

impl Publisher {
    pub fn new() -> Self {
        Self::with_config(PublisherConfig::default())
    }

    pub fn with_config(config: PublisherConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                config,
            }),
        }
    }

    /// 用 `factory` 创建订阅者并登记到 `tag` 下
    pub async fn subscribe<S, F>(&self, tag: &str, factory: F) -> Arc<S>
    where
        S: Subscriber,
        F: FnOnce() -> S,
    {
        let mut state = self.shared.state.lock().await;
        let handle = Arc::new(factory());
        Self::register(&mut state, tag, handle.clone());
        handle
    }

    /// 把已有的订阅者句柄登记到 `tag` 下
    ///
    /// 同一句柄可以登记到多个标签，也可以在同一标签下重复登记。
    pub async fn attach<S: Subscriber>(&self, tag: &str, handle: &Arc<S>) {
        let mut state = self.shared.state.lock().await;
        Self::register(&mut state, tag, handle.clone());
    }

    fn register(state: &mut State, tag: &str, handle: Arc<dyn Subscriber>) {
        state
            .subscriptions
            .entry(tag.to_string())
            .or_default()
            .push(Subscription::spawn(tag, handle));
        debug!(tag = %tag, "Subscribed");
    }

    /// 移除 `tag` 下第一个与 `handle` 相同的订阅；不存在时什么也不做
    pub async fn unsubscribe<S: Subscriber>(&self, tag: &str, handle: &Arc<S>) {
        let target = Arc::as_ptr(handle) as *const ();
        let mut state = self.shared.state.lock().await;

        let Some(subscriptions) = state.subscriptions.get_mut(tag) else {
            return;
        };
        if let Some(position) = subscriptions.iter().position(|s| s.is(target)) {
            subscriptions.remove(position);
            debug!(tag = %tag, "Unsubscribed");
        }
        if subscriptions.is_empty() {
            state.subscriptions.remove(tag);
        }
    }

    /// `tag` 下当前登记的订阅数
    pub async fn subscriber_count(&self, tag: &str) -> usize {
        let state = self.shared.state.lock().await;
        state.subscriptions.get(tag).map_or(0, Vec::len)
    }

    /// 登记一个洪泛转发的对端，重复登记无效
    pub async fn add_remote(&self, address: impl Into<String>) {
        let address = address.into();
        let mut state = self.shared.state.lock().await;
        if !state.peers.contains(&address) {
            info!(peer = %address, "Remote added");
            state.peers.push(address);
        }
    }

    /// 当前登记的对端
    pub async fn remotes(&self) -> Vec<String> {
        self.shared.state.lock().await.peers.clone()
    }

    /// 发布消息
    ///
    /// 在锁内封存消息并只读取一次正文，复制给每个本地订阅者，
    /// 同一份字节再转发给除来源外的所有对端。本地投递和远程转发都是异步的，
    /// 调用方不等待它们完成。
    ///
    /// 来源按字符串与对端地址比较。收集到的消息以连接的对端地址为来源，
    /// 通常是临时端口，与登记的监听地址对不上，见 [`Publisher::start_gathering`]。
    pub async fn publish(&self, mut message: Message) {
        let state = self.shared.state.lock().await;
        message.seal();

        let tag = message.tag().to_string();
        let payload = message.take_payload();

        let local = state.subscriptions.get(&tag).map_or(&[][..], Vec::as_slice);
        for subscription in local {
            let mut copy = Message::with_payload(tag.as_str(), &payload);
            if let Some(origin) = message.origin() {
                copy.set_origin(origin);
            }
            subscription.deliver(copy);
        }

        let peers: Vec<&String> = state
            .peers
            .iter()
            .filter(|peer| Some(peer.as_str()) != message.origin())
            .collect();
        debug!(
            tag = %tag,
            bytes = payload.len(),
            local = local.len(),
            remote = peers.len(),
            "Publishing"
        );
        if peers.is_empty() {
            return;
        }

        let header = envelope::encode_header(&tag);
        for peer in peers {
            let peer = peer.clone();
            let header = header.clone();
            let payload = payload.clone();
            let config = self.shared.config.transport.clone();
            tokio::spawn(async move {
                if let Err(e) = send_remote(&peer, &config, header, payload).await {
                    warn!(peer = %peer, "Failed to forward message: {}", e);
                }
            });
        }
    }

    /// 在 `port` 上收集远程发布，直到 [`cancel_gathering`](Publisher::cancel_gathering)
    pub async fn gather(&self, port: u16) -> Result<()> {
        let listener = TcpListener::bind_port(port, &self.shared.config.transport).await?;
        self.gather_on(listener).await
    }

    /// 在已绑定的监听器上收集远程发布，直到收集被取消
    ///
    /// 需要从其他任务取消时请用 [`start_gathering`](Publisher::start_gathering)，
    /// 它返回时取消信号已经登记。
    pub async fn gather_on(&self, listener: TcpListener) -> Result<()> {
        self.start_gathering(listener).await?.wait().await
    }

    /// 登记取消信号并在后台启动收集循环
    ///
    /// 每个入站连接由独立任务处理：读到连接结束，解码标签和正文，
    /// 以对端地址为来源重新发布。丢弃返回的句柄不会停止收集。
    ///
    /// 对端地址是对方连接时使用的临时端口，而不是它监听的地址，
    /// 所以两个互相登记为对端的节点会把同一条消息来回转发。
    pub async fn start_gathering(&self, listener: TcpListener) -> Result<Gathering> {
        let port = listener.local_addr()?.port();
        let (cancel, cancelled) = watch::channel(false);
        self.shared.state.lock().await.gathering.insert(port, cancel);
        info!(port, "Gathering remote publications");

        let publisher = self.clone();
        let task = tokio::spawn(async move {
            publisher.accept_loop(listener, port, cancelled).await;
        });
        Ok(Gathering { port, task })
    }

    async fn accept_loop(
        &self,
        listener: TcpListener,
        port: u16,
        mut cancelled: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((transport, peer)) => {
                            let publisher = self.clone();
                            tokio::spawn(async move {
                                if let Err(e) = publisher.relay(transport, peer).await {
                                    warn!(peer = %peer, "Failed to relay remote publication: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            warn!(port, "Failed to accept connection: {}", e);
                        }
                    }
                }

                _ = cancelled.changed() => {
                    break;
                }
            }
        }

        // 先摘掉登记再释放监听器，同一端口的下一次收集不会被误删
        self.shared.state.lock().await.gathering.remove(&port);
        drop(listener);
        info!(port, "Gathering stopped");
    }

    /// 取消 `port` 上的收集，监听器随即关闭
    pub async fn cancel_gathering(&self, port: u16) {
        let state = self.shared.state.lock().await;
        match state.gathering.get(&port) {
            Some(cancel) => {
                let _ = cancel.send(true);
            }
            None => debug!(port, "No gathering to cancel"),
        }
    }

    /// 处理一个入站的远程发布，来源记为 `peer`
    async fn relay(&self, transport: TcpTransport, peer: SocketAddr) -> Result<()> {
        let (reader, _writer) = transport.split();

        let max = self.shared.config.max_envelope_size;
        let mut data = Vec::new();
        reader.take(max as u64 + 1).read_to_end(&mut data).await?;
        if data.len() > max {
            return Err(ProtocolError::FrameTooLarge {
                size: data.len(),
                max,
            });
        }
        if data.is_empty() {
            // 探测连接，没有内容
            return Ok(());
        }

        let (tag, payload) = envelope::decode(Bytes::from(data))?;
        debug!(tag = %tag, origin = %peer, bytes = payload.len(), "Remote publication received");

        let mut message = Message::with_payload(tag, &payload);
        message.set_origin(peer.to_string());
        self.publish(message).await;
        Ok(())
    }
}

/// 后台运行的收集循环
///
/// 由 [`Publisher::start_gathering`] 返回，此时取消信号已登记，
/// 之后任何时刻的 [`Publisher::cancel_gathering`] 都会生效。
#[derive(Debug)]
pub struct Gathering {
    port: u16,
    task: JoinHandle<()>,
}

impl Gathering {
    /// 收集所用的端口，即取消时要传入的端口
    pub fn port(&self) -> u16 {
        self.port
    }

    /// 等待收集循环退出
    pub async fn wait(self) -> Result<()> {
        self.task.await?;
        Ok(())
    }
}

impl Default for Publisher {
    fn default() -> Self {
        Self::new()
    }
}

/// 打开一条新连接，写入标签头和正文后关闭
async fn send_remote(
    peer: &str,
    config: &TransportConfig,
    header: Bytes,
    payload: Bytes,
) -> Result<()> {
    let transport = TcpTransport::connect(peer, config).await?;
    let (_reader, mut writer) = transport.split();
    writer.write_all(&header).await?;
    writer.write_all(&payload).await?;
    writer.shutdown().await?;
    debug!(peer = %peer, "Message forwarded");
    Ok(())
}
