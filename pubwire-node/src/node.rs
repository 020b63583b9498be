//! 中继节点核心实现

use anyhow::Context;
use async_trait::async_trait;
use pubwire::{Message, Publisher, Subscriber, TcpListener, TransportConfig};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

/// 默认收集端口
pub const DEFAULT_PORT: u16 = 7700;

/// 要记录的标签列表（逗号分隔）
pub const TAGS_ENV: &str = "PUBWIRE_TAGS";

/// 节点配置
#[derive(Debug, Clone, PartialEq)]
pub struct NodeConfig {
    /// 收集端口
    pub port: u16,
    /// 洪泛转发的对端
    pub peers: Vec<String>,
    /// 记录到日志的标签
    pub tags: Vec<String>,
}

impl NodeConfig {
    /// 从命令行参数和环境变量读取配置
    pub fn from_env() -> anyhow::Result<Self> {
        Self::parse(std::env::args().skip(1), std::env::var(TAGS_ENV).ok())
    }

    /// `pubwire-node [port] [peer ...]`
    pub fn parse(
        args: impl IntoIterator<Item = String>,
        tags: Option<String>,
    ) -> anyhow::Result<Self> {
        let mut args = args.into_iter();
        let port = match args.next() {
            Some(port) => port
                .parse()
                .with_context(|| format!("invalid port: {}", port))?,
            None => DEFAULT_PORT,
        };
        let tags = tags
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|tag| !tag.is_empty())
            .map(String::from)
            .collect();

        Ok(Self {
            port,
            peers: args.collect(),
            tags,
        })
    }
}

/// 把收到的消息写进日志的订阅者
struct LogSubscriber;

#[async_trait]
impl Subscriber for LogSubscriber {
    async fn receive(&self, message: Message) {
        info!(
            tag = message.tag(),
            origin = message.origin().unwrap_or("local"),
            "{}",
            String::from_utf8_lossy(message.payload()).trim_end()
        );
    }
}

/// 标准输入的一行 `<tag> <payload>` 转为消息
fn parse_line(line: &str) -> Option<Message> {
    let line = line.trim_end();
    if line.is_empty() {
        return None;
    }
    let (tag, payload) = line.split_once(' ').unwrap_or((line, ""));
    Some(Message::with_payload(tag, payload.as_bytes()))
}

/// 中继节点
pub struct RelayNode {
    config: NodeConfig,
    publisher: Publisher,
}

impl RelayNode {
    pub fn new(config: NodeConfig) -> Self {
        Self {
            config,
            publisher: Publisher::new(),
        }
    }

    /// 运行节点（支持 Ctrl+C 退出）
    pub async fn run(&self) -> anyhow::Result<()> {
        for peer in &self.config.peers {
            self.publisher.add_remote(peer.clone()).await;
        }
        for tag in &self.config.tags {
            self.publisher.subscribe(tag, || LogSubscriber).await;
        }

        let listener =
            TcpListener::bind_port(self.config.port, &TransportConfig::default()).await?;
        info!("Node gathering on {}", listener.local_addr()?);
        let gathering = self.publisher.start_gathering(listener).await?;

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut stdin_open = true;

        loop {
            tokio::select! {
                // 标准输入的每一行作为一条本地发布
                line = lines.next_line(), if stdin_open => {
                    match line {
                        Ok(Some(line)) => {
                            if let Some(message) = parse_line(&line) {
                                self.publisher.publish(message).await;
                            }
                        }
                        Ok(None) => {
                            info!("Stdin closed, still relaying");
                            stdin_open = false;
                        }
                        Err(e) => {
                            warn!("Failed to read stdin: {}", e);
                            stdin_open = false;
                        }
                    }
                }

                _ = tokio::signal::ctrl_c() => {
                    info!("Received shutdown signal, stopping...");
                    break;
                }
            }
        }

        self.publisher.cancel_gathering(gathering.port()).await;
        gathering.wait().await?;
        info!("Node shutdown complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::{Arc, Mutex};

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn test_parse_defaults() {
        let config = NodeConfig::parse(Vec::new(), None).unwrap();
        assert_eq!(config.port, DEFAULT_PORT);
        assert!(config.peers.is_empty());
        assert!(config.tags.is_empty());
    }

    #[test]
    fn test_parse_port_peers_and_tags() {
        let config = NodeConfig::parse(
            args(&["9000", "10.0.0.1:9000", "10.0.0.2:9000"]),
            Some("news, chat,,".to_string()),
        )
        .unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.peers, args(&["10.0.0.1:9000", "10.0.0.2:9000"]));
        assert_eq!(config.tags, args(&["news", "chat"]));
    }

    #[test]
    fn test_parse_invalid_port() {
        assert!(NodeConfig::parse(args(&["nine"]), None).is_err());
    }

    #[test]
    fn test_parse_line() {
        let message = parse_line("news hello world\n").unwrap();
        assert_eq!(message.tag(), "news");
        assert_eq!(message.payload(), b"hello world");

        let message = parse_line("ping").unwrap();
        assert_eq!(message.tag(), "ping");
        assert!(message.is_empty());

        assert!(parse_line("   ").is_none());
        assert!(parse_line("").is_none());
    }

    /// 收集日志输出的写入器
    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Captured {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    #[tokio::test]
    async fn test_log_subscriber_logs_message() {
        let captured = Captured::default();
        let sink = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || sink.clone())
            .with_ansi(false)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let mut message = Message::with_payload("news", b"headline\n");
        message.set_origin("10.0.0.7:40000");
        LogSubscriber.receive(message).await;
        LogSubscriber
            .receive(Message::with_payload("chat", b"hi"))
            .await;

        let output = captured.text();
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("news"));
        assert!(lines[0].contains("10.0.0.7:40000"));
        assert!(lines[0].contains("headline"));
        assert!(lines[1].contains("chat"));
        assert!(lines[1].contains("local"));
    }
}
