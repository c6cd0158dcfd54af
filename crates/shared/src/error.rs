//! 统一错误处理模块
//!
//! 定义系统中所有共享的错误类型，使用 thiserror 提供良好的错误信息。

use thiserror::Error;

/// 系统错误类型
#[derive(Debug, Error)]
pub enum AutomationError {
    // ==================== 数据库错误 ====================
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("记录未找到: {entity} id={id}")]
    NotFound { entity: String, id: String },

    // ==================== Redis / 事件总线错误 ====================
    #[error("Redis 错误: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("事件总线错误: {0}")]
    Bus(String),

    #[error("负载解码失败: {0}")]
    Decode(String),

    // ==================== 规则引擎错误 ====================
    #[error("规则配置无效: rule_id={rule_id} - {reason}")]
    InvalidRule { rule_id: i64, reason: String },

    #[error("规则执行失败: {0}")]
    RuleExecutionFailed(String),

    #[error("动作执行失败: {action} - {message}")]
    ActionFailed { action: String, message: String },

    // ==================== 调度错误 ====================
    #[error("无效的 cron 表达式: {expression} - {reason}")]
    InvalidCronExpression { expression: String, reason: String },

    // ==================== 配置错误 ====================
    #[error("配置错误: {0}")]
    Config(#[from] config::ConfigError),

    // ==================== 通用错误 ====================
    #[error("内部错误: {0}")]
    Internal(String),
}

/// 错误结果类型别名
pub type Result<T> = std::result::Result<T, AutomationError>;

impl AutomationError {
    /// 获取错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::Database(_) => "DATABASE_ERROR",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Redis(_) => "REDIS_ERROR",
            Self::Bus(_) => "BUS_ERROR",
            Self::Decode(_) => "DECODE_ERROR",
            Self::InvalidRule { .. } => "INVALID_RULE",
            Self::RuleExecutionFailed(_) => "RULE_EXECUTION_FAILED",
            Self::ActionFailed { .. } => "ACTION_FAILED",
            Self::InvalidCronExpression { .. } => "INVALID_CRON_EXPRESSION",
            Self::Config(_) => "CONFIG_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// 是否为可重试错误
    ///
    /// 仅基础设施层的瞬时故障（数据库、Redis 连接）可重试，
    /// 规则配置、cron 表达式等业务错误重试没有意义。
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Database(_) | Self::Redis(_) | Self::Bus(_))
    }

    /// 是否为连接级错误（broker 不可达、超时等）
    ///
    /// 事件总线主循环据此判断是否应退出并进入受限自动重启流程。
    pub fn is_connection_error(&self) -> bool {
        match self {
            Self::Redis(e) => {
                e.is_io_error()
                    || e.is_timeout()
                    || e.is_connection_refusal()
                    || e.is_connection_dropped()
            }
            _ => false,
        }
    }
}
