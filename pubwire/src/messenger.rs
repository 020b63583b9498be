//! 会合层
//!
//! 把一条原始连接变成"已识别的会话"：主动方连接后先用 `send_string` 发送一个
//! 标识符，监听方读取标识符后把连接暂存起来，等待本地应用用同一个标识符
//! 通过 [`Messenger::start_conversation`] 取走。若提供了发布者，还会以标识符为
//! 标签发布一条 `READY` 通知。

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::connection::{Connection, TcpConnection};
use crate::error::Result;
use crate::message::Message;
use crate::publisher::Publisher;
use crate::transport::{TcpListener, TcpTransport, Transport, TransportConfig, TransportListener};
use crate::READY_TEXT;

/// 会合器
pub struct Messenger {
    config: TransportConfig,
    /// 标识符 -> 等待取走的连接
    connections: Arc<Mutex<HashMap<String, TcpConnection>>>,
    /// 停止监听信号
    shutdown_tx: watch::Sender<bool>,
}

impl Messenger {
    pub fn new() -> Self {
        Self::with_config(TransportConfig::default())
    }

    pub fn with_config(config: TransportConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            connections: Arc::new(Mutex::new(HashMap::new())),
            shutdown_tx,
        }
    }

    /// 连接远端，返回尚未识别的连接
    pub async fn talk_to(&self, remote: &str) -> Result<TcpConnection> {
        let transport = TcpTransport::connect(remote, &self.config).await?;
        debug!(remote = %remote, "Connected");
        Ok(Connection::new(transport))
    }

    /// 连接远端并发送标识符
    pub async fn talk_to_as(&self, remote: &str, id: &str) -> Result<TcpConnection> {
        let mut conn = self.talk_to(remote).await?;
        conn.send_string(id).await?;
        Ok(conn)
    }

    /// 在 `port` 上监听入站连接，返回实际绑定的地址
    ///
    /// 接受循环在后台运行，直到 [`stop_listening`](Messenger::stop_listening)。
    pub async fn listen_at(&self, port: u16, publisher: Option<Publisher>) -> Result<SocketAddr> {
        let listener = TcpListener::bind_port(port, &self.config).await?;
        self.listen_on(listener, publisher)
    }

    /// 在已绑定的监听器上运行接受循环
    pub fn listen_on(&self, listener: TcpListener, publisher: Option<Publisher>) -> Result<SocketAddr> {
        let addr = listener.local_addr()?;
        let connections = Arc::clone(&self.connections);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        info!("Messenger listening on {}", addr);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((transport, peer)) => {
                                let connections = Arc::clone(&connections);
                                let publisher = publisher.clone();
                                tokio::spawn(async move {
                                    handle_new_connection(transport, peer, connections, publisher).await;
                                });
                            }
                            Err(e) => {
                                warn!("Failed to accept connection: {}", e);
                            }
                        }
                    }

                    changed = shutdown_rx.changed() => {
                        // 会合器已被丢弃，或收到停止信号
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Messenger on {} stopped listening", addr);
        });

        Ok(addr)
    }

    /// 取走以 `key` 标识的连接
    pub async fn start_conversation(&self, key: &str) -> Option<TcpConnection> {
        self.connections.lock().await.remove(key)
    }

    /// 停止所有接受循环，已暂存的连接保持不变
    pub fn stop_listening(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl Default for Messenger {
    fn default() -> Self {
        Self::new()
    }
}

/// 读取标识符并暂存连接
async fn handle_new_connection(
    transport: TcpTransport,
    peer: SocketAddr,
    connections: Arc<Mutex<HashMap<String, TcpConnection>>>,
    publisher: Option<Publisher>,
) {
    let mut conn = Connection::new(transport);

    let id = match conn.receive_string().await {
        Ok(id) => id,
        Err(e) => {
            debug!(peer = %peer, "Connection without identifier: {}", e);
            return;
        }
    };

    // 先暂存再通知，收到 READY 的一方一定能取到连接
    if connections.lock().await.insert(id.clone(), conn).is_some() {
        warn!(id = %id, "Replaced an unclaimed connection");
    }
    info!(id = %id, peer = %peer, "Conversation ready");

    if let Some(publisher) = publisher {
        let mut notification = Message::new(id);
        notification.append(READY_TEXT.as_bytes());
        publisher.publish(notification).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscriber::Mailbox;
    use crate::ProtocolError;
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    async fn rendezvous(id: &str) -> (Messenger, TcpConnection, TcpConnection) {
        let publisher = Publisher::new();
        let ready = publisher.subscribe(id, Mailbox::new).await;

        let server = Messenger::new();
        let listener = TcpListener::bind("127.0.0.1:0", &TransportConfig::default())
            .await
            .unwrap();
        let addr = server.listen_on(listener, Some(publisher)).unwrap();

        let client = Messenger::new();
        let client_conn = client.talk_to_as(&addr.to_string(), id).await.unwrap();

        let notification = timeout(WAIT, ready.wait_for_next()).await.unwrap().unwrap();
        assert_eq!(notification.tag(), id);
        assert_eq!(notification.payload(), READY_TEXT.as_bytes());

        let server_conn = server.start_conversation(id).await.unwrap();
        (server, client_conn, server_conn)
    }

    #[tokio::test]
    async fn test_conversation() {
        let (server, mut client_conn, mut server_conn) = rendezvous("abcdefg").await;
        assert!(server.start_conversation("abcdefg").await.is_none());

        client_conn
            .send_message(Message::with_payload("tag", b"payload"))
            .await
            .unwrap();
        let message = server_conn.receive_message().await.unwrap();
        assert_eq!(message.tag(), "tag");
        assert_eq!(message.payload(), b"payload\n");

        server_conn.send_string("pong").await.unwrap();
        assert_eq!(client_conn.receive_string().await.unwrap(), "pong");

        client_conn.close().await.unwrap();
        assert!(matches!(
            server_conn.receive_string().await,
            Err(ProtocolError::ConnectionClosed)
        ));
        server.stop_listening();
    }

    #[tokio::test]
    async fn test_stream_over_conversation() {
        let (server, mut client_conn, mut server_conn) = rendezvous("streamer").await;

        let (client_result, server_result) = timeout(WAIT, async {
            tokio::join!(client_conn.start_stream(), server_conn.start_stream())
        })
        .await
        .unwrap();
        client_result.unwrap();
        server_result.unwrap();

        let input = b"hallo, Welt!\nhallo, Wald!";
        client_conn.write(input).await.unwrap();

        let mut output = Vec::new();
        for size in [10, 10, 5] {
            let mut buf = vec![0u8; size];
            assert_eq!(server_conn.read(&mut buf).await.unwrap(), size);
            output.extend_from_slice(&buf);
        }
        assert_eq!(output, input);

        client_conn.stop_stream().await.unwrap();
        let mut buf = [0u8; 5];
        assert!(server_conn.read(&mut buf).await.is_err());
        server.stop_listening();
    }

    #[tokio::test]
    async fn test_unknown_conversation() {
        let messenger = Messenger::new();
        assert!(messenger.start_conversation("nobody").await.is_none());
    }

    #[tokio::test]
    async fn test_stop_listening() {
        let server = Messenger::new();
        let listener = TcpListener::bind("127.0.0.1:0", &TransportConfig::default())
            .await
            .unwrap();
        let addr = server.listen_on(listener, None).unwrap();
        server.stop_listening();

        // 接受循环退出后监听器被释放
        timeout(WAIT, async {
            while tokio::net::TcpStream::connect(addr).await.is_ok() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }
}
