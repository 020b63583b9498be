//! 发布中继节点
//!
//! 基于 Tokio 的洪泛中继：收集远程发布、转发给对端、记录订阅的标签，
//! 并把标准输入的每一行 `<tag> <payload>` 作为本地发布。

mod node;

use anyhow::Result;
use node::{NodeConfig, RelayNode};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("pubwire_node=debug".parse()?)
                .add_directive("pubwire=debug".parse()?),
        )
        .init();

    let config = NodeConfig::from_env()?;
    info!(
        "Relay node starting on port {} with {} peer(s)",
        config.port,
        config.peers.len()
    );

    let node = RelayNode::new(config);
    node.run().await?;

    Ok(())
}
