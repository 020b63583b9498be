//! 传输层
//!
//! 行协议连接、远程发布的收发和会合层都只依赖这里的两个 trait。
//! 主动连接与被动接受的连接使用同一份 [`TransportConfig`]，
//! 接受连接时同时给出对端地址，发布引擎用它作为消息来源。

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::error::{ProtocolError, Result};
use crate::CONNECT_TIMEOUT;

/// 连接参数
#[derive(Clone, Debug)]
pub struct TransportConfig {
    /// 主动连接的超时时间
    pub connect_timeout: Duration,
    /// 是否关闭 Nagle 算法；协议行大多很短
    pub nodelay: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: CONNECT_TIMEOUT,
            nodelay: true,
        }
    }
}

/// 一条双向字节传输
pub trait Transport: Send + Sync + Sized {
    type Reader: AsyncRead + Unpin + Send;
    type Writer: AsyncWrite + Unpin + Send;

    /// 连接 `addr`（"host:port"），超过 `config.connect_timeout` 视为失败
    fn connect(
        addr: &str,
        config: &TransportConfig,
    ) -> impl std::future::Future<Output = Result<Self>> + Send;

    /// 拆成读写两端，分别交给行读取器和行写入器
    fn split(self) -> (Self::Reader, Self::Writer);
}

/// 接受入站传输的监听器
pub trait TransportListener: Send + Sync + Sized {
    type Transport: Transport;

    /// 绑定 `addr`，之后接受的每条连接都按 `config` 设置
    fn bind(
        addr: &str,
        config: &TransportConfig,
    ) -> impl std::future::Future<Output = Result<Self>> + Send;

    /// 接受一条连接，连同对端地址一起返回
    fn accept(
        &self,
    ) -> impl std::future::Future<Output = Result<(Self::Transport, SocketAddr)>> + Send;
}

/// TCP 传输
#[derive(Debug)]
pub struct TcpTransport {
    stream: TcpStream,
}

impl TcpTransport {
    fn configure(stream: TcpStream, config: &TransportConfig) -> Result<Self> {
        stream.set_nodelay(config.nodelay)?;
        Ok(Self { stream })
    }
}

impl Transport for TcpTransport {
    type Reader = OwnedReadHalf;
    type Writer = OwnedWriteHalf;

    async fn connect(addr: &str, config: &TransportConfig) -> Result<Self> {
        let stream = timeout(config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ProtocolError::ConnectionTimeout)??;
        Self::configure(stream, config)
    }

    fn split(self) -> (Self::Reader, Self::Writer) {
        self.stream.into_split()
    }
}

/// TCP 监听器
#[derive(Debug)]
pub struct TcpListener {
    listener: tokio::net::TcpListener,
    config: TransportConfig,
}

impl TransportListener for TcpListener {
    type Transport = TcpTransport;

    async fn bind(addr: &str, config: &TransportConfig) -> Result<Self> {
        Ok(Self {
            listener: tokio::net::TcpListener::bind(addr).await?,
            config: config.clone(),
        })
    }

    async fn accept(&self) -> Result<(TcpTransport, SocketAddr)> {
        let (stream, peer) = self.listener.accept().await?;
        Ok((TcpTransport::configure(stream, &self.config)?, peer))
    }
}

impl TcpListener {
    /// 在所有网卡上监听 `port`，0 表示由系统分配
    pub async fn bind_port(port: u16, config: &TransportConfig) -> Result<Self> {
        Self::bind(&format!("0.0.0.0:{}", port), config).await
    }

    /// 实际绑定的地址
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn loopback(config: &TransportConfig) -> TcpListener {
        TcpListener::bind("127.0.0.1:0", config).await.unwrap()
    }

    #[tokio::test]
    async fn test_accept_reports_peer_address() {
        let listener = loopback(&TransportConfig::default()).await;
        let addr = listener.local_addr().unwrap();

        let dialing = tokio::spawn(async move {
            TcpTransport::connect(&addr.to_string(), &TransportConfig::default()).await
        });
        let (_accepted, peer) = listener.accept().await.unwrap();
        let client = dialing.await.unwrap().unwrap();

        assert_eq!(peer, client.stream.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_accepted_connection_follows_config() {
        for nodelay in [false, true] {
            let config = TransportConfig {
                nodelay,
                ..Default::default()
            };
            let listener = loopback(&config).await;
            let addr = listener.local_addr().unwrap().to_string();

            let dialing = tokio::spawn(async move {
                TcpTransport::connect(&addr, &TransportConfig::default()).await
            });
            let (accepted, _) = listener.accept().await.unwrap();
            let client = dialing.await.unwrap().unwrap();

            assert_eq!(accepted.stream.nodelay().unwrap(), nodelay);
            assert!(client.stream.nodelay().unwrap());
        }
    }

    #[tokio::test]
    async fn test_bind_port_zero_picks_a_port() {
        let listener = TcpListener::bind_port(0, &TransportConfig::default())
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        assert!(addr.ip().is_unspecified());
        assert_ne!(addr.port(), 0);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = loopback(&TransportConfig::default()).await;
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = TcpTransport::connect(&addr.to_string(), &TransportConfig::default()).await;
        assert!(matches!(result, Err(ProtocolError::Io(_))));
    }
}
