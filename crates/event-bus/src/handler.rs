//! 事件处理器抽象与注册表
//!
//! 处理器以 trait 对象形式注册到总线实例自有的注册表中（每个总线
//! 一份，注册表不做全局共享，多个独立总线可以共存）。同一事件类型
//! 可注册多个处理器，投递时全部调用。

use std::sync::Arc;

use async_trait::async_trait;
use automation_shared::error::Result;
use automation_shared::events::EventType;
use dashmap::DashMap;

use crate::envelope::BusEvent;

/// 事件处理器
///
/// 实现方必须容忍重复投递：总线只保证至少一次，同一事件可能被
/// 处理多次（崩溃恢复、确认丢失等场景）。
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// 处理器名称，用于日志定位
    fn name(&self) -> &str;

    /// 处理一条事件；返回错误时条目不会被确认，留待回收重投
    async fn handle(&self, event: &BusEvent) -> Result<()>;
}

/// 总线实例自有的处理器注册表
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: DashMap<EventType, Vec<Arc<dyn EventHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册处理器，同一事件类型可叠加多个
    pub fn register(&self, event_type: EventType, handler: Arc<dyn EventHandler>) {
        self.handlers.entry(event_type).or_default().push(handler);
    }

    /// 移除该事件类型的全部本地注册
    pub fn unregister(&self, event_type: EventType) {
        self.handlers.remove(&event_type);
    }

    /// 该事件类型当前注册的处理器快照
    pub fn handlers_for(&self, event_type: EventType) -> Vec<Arc<dyn EventHandler>> {
        self.handlers
            .get(&event_type)
            .map(|entry| entry.clone())
            .unwrap_or_default()
    }

    /// 至少注册了一个处理器的事件类型集合（即需要消费组的流）
    pub fn event_types(&self) -> Vec<EventType> {
        self.handlers.iter().map(|entry| *entry.key()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
