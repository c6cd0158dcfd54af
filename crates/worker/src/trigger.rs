//! 事件到规则引擎的触发适配
//!
//! 为每个业务事件类型注册一个 [`RuleTriggerHandler`]：收到事件后以
//! 对应的触发类型驱动规则引擎。引擎内部已经隔离了单条规则的异常并
//! 写入执行日志，这里只需透传引擎级别的错误（存储不可用等），让总
//! 线把条目留在待确认列表等待重投。

use std::sync::Arc;

use async_trait::async_trait;
use automation_bus::{BusEvent, EventHandler};
use automation_shared::error::Result;
use rule_engine::{RuleEngine, TriggerType};
use tracing::debug;

/// 驱动规则引擎的事件处理器
pub struct RuleTriggerHandler {
    engine: Arc<RuleEngine>,
}

impl RuleTriggerHandler {
    pub fn new(engine: Arc<RuleEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl EventHandler for RuleTriggerHandler {
    fn name(&self) -> &str {
        "rule-engine"
    }

    async fn handle(&self, event: &BusEvent) -> Result<()> {
        let trigger: TriggerType = event.event_type.into();
        debug!(
            event_type = %event.event_type,
            entry_id = %event.entry_id,
            trigger = %trigger,
            "事件进入规则引擎"
        );

        self.engine
            .execute_for_trigger(trigger, &event.payload)
            .await
    }
}
