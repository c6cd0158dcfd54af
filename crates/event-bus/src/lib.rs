//! 事件总线
//!
//! 为业务生产者与规则引擎之间提供异步、至少一次投递的事件通道。
//! 持久化传输基于 Redis Stream 的消费组实现：每个事件类型一条流，
//! 多个 worker 进程在同一消费组内竞争消费，崩溃进程遗留的未确认
//! 条目由回收流程接管，保证最终被处理。
//!
//! 无法长驻消费进程的部署形态可选用进程内传输（无持久化、无恢复），
//! 两种传输通过 [`bus::EventBus`] 门面暴露同一套接口。

pub mod bus;
pub mod envelope;
pub mod handler;
pub mod local;
pub mod stream;

pub use bus::{EventBus, EventTransport, TransportMode};
pub use envelope::BusEvent;
pub use handler::EventHandler;
