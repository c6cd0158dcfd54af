//! Redis 连接管理模块
//!
//! 提供 Redis 客户端封装，事件总线和健康检查从这里获取多路复用异步连接。

use crate::config::RedisConfig;
use crate::error::{AutomationError, Result};
use redis::Client;
use redis::aio::MultiplexedConnection;
use tracing::info;

/// Redis 客户端包装
///
/// `Client` 内部是廉价可克隆的，每次操作按需获取多路复用连接。
/// 事件总线主循环因为要执行阻塞读（XREADGROUP BLOCK），
/// 会单独持有一条专用连接，避免阻塞其他操作。
#[derive(Clone)]
pub struct RedisConn {
    client: Client,
}

impl RedisConn {
    /// 创建 Redis 客户端
    pub fn new(config: &RedisConfig) -> Result<Self> {
        let client = Client::open(config.url.as_str())?;
        info!("Redis 客户端已创建");
        Ok(Self { client })
    }

    /// 获取一条多路复用异步连接
    pub async fn connection(&self) -> Result<MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(AutomationError::from)
    }

    /// 健康检查
    pub async fn health_check(&self) -> Result<()> {
        let mut conn = self.connection().await?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map(|_| ())
            .map_err(AutomationError::from)
    }
}
