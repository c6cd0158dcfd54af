//! 自动化 worker
//!
//! 长驻消费进程：订阅全部业务事件流并将其接入规则引擎，
//! 同时承载定时规则的调度器。

pub mod trigger;
