//! 进程内直接分发传输
//!
//! 面向无法长驻消费进程的部署形态（按请求拉起的无状态函数等）。
//! 没有持久化、没有消费组、没有崩溃恢复：emit 直接在当前任务内
//! 调用全部已注册处理器，处理器失败仅记录日志，不会重投。
//! 选择此传输即放弃至少一次投递保证。

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use automation_shared::codec;
use automation_shared::error::Result;
use automation_shared::events::EventType;
use chrono::Utc;
use futures::future::join_all;
use serde_json::Value;
use tracing::{debug, error, info};

use crate::bus::EventTransport;
use crate::envelope::BusEvent;
use crate::handler::{EventHandler, HandlerRegistry};

/// 进程内传输
pub struct InProcessTransport {
    registry: HandlerRegistry,
    /// 合成条目 ID 的单调序号
    seq: AtomicU64,
}

impl InProcessTransport {
    pub fn new() -> Self {
        Self {
            registry: HandlerRegistry::new(),
            seq: AtomicU64::new(0),
        }
    }
}

impl Default for InProcessTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventTransport for InProcessTransport {
    async fn on(&self, event_type: EventType, handler: Arc<dyn EventHandler>) {
        self.registry.register(event_type, handler);
    }

    /// 直接在当前任务内分发给全部处理器
    ///
    /// 负载仍然走一遍编解码往返，保证与持久化传输的线上语义一致
    /// （大整数标识的还原行为相同）。处理器失败不回传给生产者。
    async fn emit(&self, event_type: EventType, payload: Value) -> Result<()> {
        let entry_id = format!("local-{}", self.seq.fetch_add(1, Ordering::Relaxed));

        let event = BusEvent {
            event_type,
            entry_id: entry_id.clone(),
            payload: codec::decode(&codec::encode(&payload)),
            timestamp_ms: Utc::now().timestamp_millis(),
        };

        let handlers = self.registry.handlers_for(event_type);
        if handlers.is_empty() {
            debug!(event_type = %event_type, "无已注册处理器，事件被丢弃");
            return Ok(());
        }

        let results = join_all(handlers.iter().map(|h| h.handle(&event))).await;
        for (handler, result) in handlers.iter().zip(&results) {
            if let Err(e) = result {
                // 无持久化，失败即丢失；与生产者的 fire-and-forget 契约一致
                error!(
                    event_type = %event_type,
                    entry_id = %entry_id,
                    handler = handler.name(),
                    error = %e,
                    "进程内处理器执行失败，事件不会重投"
                );
            }
        }

        Ok(())
    }

    /// 无需建组或恢复，仅记录启动日志
    async fn initialize(&self) -> Result<()> {
        info!("进程内事件传输已就绪（无持久化，无崩溃恢复）");
        Ok(())
    }

    async fn off(&self, event_type: EventType) {
        self.registry.unregister(event_type);
    }

    async fn stop(&self) {}
}
