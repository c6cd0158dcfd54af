//! 总线门面与传输选择
//!
//! 进程启动时按部署模式选定唯一一种传输实现，此后调用方通过同一套
//! `on/emit/off/stop/initialize` 接口使用总线，对底层是持久化流还是
//! 进程内分发无感知。

use std::sync::Arc;

use async_trait::async_trait;
use automation_shared::config::BusConfig;
use automation_shared::error::{AutomationError, Result};
use automation_shared::events::EventType;
use automation_shared::redis::RedisConn;
use serde_json::Value;
use tracing::info;

use crate::handler::EventHandler;
use crate::local::InProcessTransport;
use crate::stream::{RedisStreamTransport, StreamTransportOptions};

/// 事件传输统一接口
///
/// 两种实现：[`RedisStreamTransport`]（持久化、至少一次、崩溃恢复）
/// 与 [`InProcessTransport`]（直接分发、无持久化）。
#[async_trait]
pub trait EventTransport: Send + Sync {
    /// 注册处理器；同一事件类型可叠加多个，投递时全部调用
    async fn on(&self, event_type: EventType, handler: Arc<dyn EventHandler>);

    /// 发布事件。入队失败（broker 不可达）同步返回错误；
    /// 下游处理结果不回传，生产者视角为 fire-and-forget
    async fn emit(&self, event_type: EventType, payload: Value) -> Result<()>;

    /// 幂等初始化并启动消费
    async fn initialize(&self) -> Result<()>;

    /// 移除本地处理器注册（不触碰 broker 侧消费组）
    async fn off(&self, event_type: EventType);

    /// 协作式停止：完成当前迭代后退出
    async fn stop(&self);
}

// ---------------------------------------------------------------------------
// TransportMode
// ---------------------------------------------------------------------------

/// 部署模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    /// 长驻 worker 进程，使用持久化流传输
    Worker,
    /// 无状态按请求部署，使用进程内传输
    Inline,
}

impl std::str::FromStr for TransportMode {
    type Err = AutomationError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "worker" => Ok(Self::Worker),
            "inline" => Ok(Self::Inline),
            other => Err(AutomationError::Bus(format!("未知的总线模式: {other}"))),
        }
    }
}

impl std::fmt::Display for TransportMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Worker => write!(f, "worker"),
            Self::Inline => write!(f, "inline"),
        }
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// 事件总线门面
///
/// 每个进程构造一次并按引用传递（总线实例自有处理器注册表，
/// 不同实例互不影响）。
pub struct EventBus {
    mode: TransportMode,
    inner: Arc<dyn EventTransport>,
}

impl EventBus {
    /// 按配置选择传输实现
    pub fn from_config(config: &BusConfig, redis: RedisConn) -> Result<Self> {
        let mode: TransportMode = config.mode.parse()?;

        let inner: Arc<dyn EventTransport> = match mode {
            TransportMode::Worker => Arc::new(RedisStreamTransport::new(
                redis,
                StreamTransportOptions::from_config(config),
            )),
            TransportMode::Inline => Arc::new(InProcessTransport::new()),
        };

        info!(mode = %mode, "事件总线已选定传输实现");
        Ok(Self { mode, inner })
    }

    /// 使用外部构造的传输（测试或特殊部署）
    pub fn with_transport(mode: TransportMode, transport: Arc<dyn EventTransport>) -> Self {
        Self {
            mode,
            inner: transport,
        }
    }

    pub fn mode(&self) -> TransportMode {
        self.mode
    }

    pub async fn on(&self, event_type: EventType, handler: Arc<dyn EventHandler>) {
        self.inner.on(event_type, handler).await
    }

    pub async fn emit(&self, event_type: EventType, payload: Value) -> Result<()> {
        self.inner.emit(event_type, payload).await
    }

    pub async fn initialize(&self) -> Result<()> {
        self.inner.initialize().await
    }

    pub async fn off(&self, event_type: EventType) {
        self.inner.off(event_type).await
    }

    pub async fn stop(&self) {
        self.inner.stop().await
    }
}
