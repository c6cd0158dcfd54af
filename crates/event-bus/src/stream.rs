//! 基于 Redis Stream 的持久化事件传输
//!
//! 每个事件类型一条流，所有 worker 进程加入同一消费组竞争消费。
//! 消费者身份使用进程级随机名：崩溃进程遗留的待确认条目不会卡在
//! 死亡消费者名下，任何存活 worker 的回收流程都能按闲置时长接管。
//!
//! 投递语义为至少一次：条目在全部处理器成功后才被确认，失败或解码
//! 异常的条目留在待确认列表，等待本进程或其他 worker 的回收流程
//! 重投。处理器必须自行保证幂等。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use automation_shared::config::BusConfig;
use automation_shared::error::{AutomationError, Result};
use automation_shared::events::EventType;
use automation_shared::redis::RedisConn;
use chrono::Utc;
use futures::future::join_all;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use redis::streams::{
    StreamAutoClaimOptions, StreamAutoClaimReply, StreamMaxlen, StreamReadOptions,
    StreamReadReply,
};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bus::EventTransport;
use crate::envelope::{BusEvent, envelope_fields, event_type_of_key, stream_key};
use crate::handler::{EventHandler, HandlerRegistry};

// ---------------------------------------------------------------------------
// StreamTransportOptions
// ---------------------------------------------------------------------------

/// 流传输参数
#[derive(Debug, Clone)]
pub struct StreamTransportOptions {
    /// 消费组名称
    pub consumer_group: String,
    /// 每条流的近似保留上限（XADD MAXLEN ~）
    pub stream_maxlen: usize,
    /// 主循环阻塞读取的等待上限（毫秒）
    pub block_ms: u64,
    /// 单次读取/回收的最大条目数
    pub batch_size: usize,
    /// 待确认条目闲置多久后可被回收接管
    pub claim_idle: Duration,
    /// 滚动窗口内允许的最大自动重启次数
    pub max_restarts: u32,
    /// 重启计数的滚动窗口长度
    pub restart_window: Duration,
}

impl StreamTransportOptions {
    pub fn from_config(config: &BusConfig) -> Self {
        Self {
            consumer_group: config.consumer_group.clone(),
            stream_maxlen: config.stream_maxlen,
            block_ms: config.block_ms,
            batch_size: config.batch_size,
            claim_idle: Duration::from_secs(config.claim_idle_seconds),
            max_restarts: config.max_restarts,
            restart_window: Duration::from_secs(config.restart_window_seconds),
        }
    }
}

impl Default for StreamTransportOptions {
    fn default() -> Self {
        Self::from_config(&BusConfig::default())
    }
}

// ---------------------------------------------------------------------------
// RestartTracker — 受限自动重启的滚动窗口计数
// ---------------------------------------------------------------------------

/// 主循环自动重启的滚动窗口计数器
///
/// 距上次重启超过窗口长度后计数归零；窗口内超出上限则不再重启，
/// 交由运维介入。
struct RestartTracker {
    max_restarts: u32,
    window: Duration,
    count: u32,
    last_restart: Option<Instant>,
}

impl RestartTracker {
    fn new(max_restarts: u32, window: Duration) -> Self {
        Self {
            max_restarts,
            window,
            count: 0,
            last_restart: None,
        }
    }

    /// 登记一次失败；返回 true 表示允许重启
    fn on_failure(&mut self, now: Instant) -> bool {
        if let Some(last) = self.last_restart
            && now.duration_since(last) > self.window
        {
            self.count = 0;
        }
        self.count += 1;
        self.last_restart = Some(now);
        self.count <= self.max_restarts
    }

    fn count(&self) -> u32 {
        self.count
    }
}

// ---------------------------------------------------------------------------
// RedisStreamTransport
// ---------------------------------------------------------------------------

/// 主循环与回收流程共享的核心状态
struct LoopCore {
    redis: RedisConn,
    opts: StreamTransportOptions,
    /// 进程级随机消费者名
    consumer_name: String,
    registry: HandlerRegistry,
    shutdown_rx: watch::Receiver<bool>,
}

/// 持久化事件传输
pub struct RedisStreamTransport {
    core: Arc<LoopCore>,
    shutdown_tx: watch::Sender<bool>,
    loop_handle: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl RedisStreamTransport {
    pub fn new(redis: RedisConn, opts: StreamTransportOptions) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let consumer_name = format!("worker-{}", Uuid::new_v4().simple());

        Self {
            core: Arc::new(LoopCore {
                redis,
                opts,
                consumer_name,
                registry: HandlerRegistry::new(),
                shutdown_rx,
            }),
            shutdown_tx,
            loop_handle: tokio::sync::Mutex::new(None),
        }
    }

    /// 本进程的消费者名（随机生成，崩溃后不会复用）
    pub fn consumer_name(&self) -> &str {
        &self.core.consumer_name
    }
}

impl LoopCore {
    /// 为每个已注册的事件类型幂等地创建消费组
    ///
    /// 消费组从流起点（0）建立，MKSTREAM 同时创建尚不存在的流；
    /// 组已存在（BUSYGROUP）视为成功。
    async fn ensure_groups(&self) -> Result<()> {
        let mut conn = self.redis.connection().await?;

        for event_type in self.registry.event_types() {
            let key = stream_key(event_type);
            let created: redis::RedisResult<String> = conn
                .xgroup_create_mkstream(&key, &self.opts.consumer_group, "0")
                .await;

            match created {
                Ok(_) => {
                    info!(stream = %event_type, group = %self.opts.consumer_group, "消费组已创建");
                }
                Err(e) if e.code() == Some("BUSYGROUP") => {
                    debug!(stream = %event_type, "消费组已存在");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(())
    }

    /// 恢复扫描：接管闲置超时的待确认条目
    ///
    /// 按闲置时长回收，不关心条目原先投递给了哪个消费者，因此死亡
    /// 进程的遗留条目也能被接管。回收到的条目走与主循环相同的处理
    /// 路径；每条流反复回收直到无新结果。
    async fn recovery_pass(&self) -> Result<()> {
        let mut conn = self.redis.connection().await?;
        let min_idle_ms = self.opts.claim_idle.as_millis() as u64;

        for event_type in self.registry.event_types() {
            let key = stream_key(event_type);
            let mut start = "0-0".to_string();

            loop {
                let reply: StreamAutoClaimReply = conn
                    .xautoclaim_options(
                        &key,
                        &self.opts.consumer_group,
                        &self.consumer_name,
                        min_idle_ms,
                        &start,
                        StreamAutoClaimOptions::default().count(self.opts.batch_size),
                    )
                    .await?;

                if reply.claimed.is_empty() {
                    break;
                }

                info!(
                    stream = %event_type,
                    count = reply.claimed.len(),
                    "回收接管闲置超时的待确认条目"
                );

                for entry in &reply.claimed {
                    self.handle_entry(&mut conn, event_type, &entry.id, &entry.map)
                        .await;
                }

                // 游标回到起点说明本轮扫描已覆盖整个待确认列表
                if reply.next_stream_id == "0-0" {
                    break;
                }
                start = reply.next_stream_id;
            }
        }

        Ok(())
    }

    /// 处理一条流条目：解码 -> 并发调用全部处理器 -> 全部成功才确认
    ///
    /// 解码失败或任一处理器失败时条目留在待确认列表，由回收流程重投，
    /// 而非悄悄丢弃。
    async fn handle_entry(
        &self,
        conn: &mut MultiplexedConnection,
        event_type: EventType,
        entry_id: &str,
        map: &HashMap<String, redis::Value>,
    ) {
        let event = match BusEvent::from_entry(event_type, entry_id, map) {
            Ok(ev) => ev,
            Err(e) => {
                error!(
                    stream = %event_type,
                    entry_id,
                    error = %e,
                    "事件负载解码失败，条目保留在待确认列表"
                );
                return;
            }
        };

        let handlers = self.registry.handlers_for(event_type);
        if handlers.is_empty() {
            // off() 之后消费组仍在读取该流，条目保留待确认，
            // 直到某个仍持有处理器的 worker 回收
            warn!(stream = %event_type, entry_id, "本进程已无该事件类型的处理器");
            return;
        }

        let results = join_all(handlers.iter().map(|h| h.handle(&event))).await;

        let mut all_ok = true;
        for (handler, result) in handlers.iter().zip(&results) {
            if let Err(e) = result {
                all_ok = false;
                error!(
                    stream = %event_type,
                    entry_id,
                    handler = handler.name(),
                    error = %e,
                    "处理器执行失败，条目不确认，等待重投"
                );
            }
        }

        if all_ok {
            let acked: redis::RedisResult<i64> = conn
                .xack(
                    stream_key(event_type),
                    &self.opts.consumer_group,
                    &[entry_id],
                )
                .await;
            if let Err(e) = acked {
                // 确认失败意味着条目之后会被重投一次
                warn!(stream = %event_type, entry_id, error = %e, "确认条目失败");
            }
        }
    }

    /// 主循环：跨全部已注册流的批量阻塞读取
    ///
    /// 正常退出（收到停止信号）返回 Ok；broker 连接故障返回 Err，
    /// 由外层的受限重启策略接管。消费组缺失时就地重建后继续。
    async fn run_loop(&self) -> Result<()> {
        let mut conn = self.redis.connection().await?;
        let mut shutdown = self.shutdown_rx.clone();

        info!(
            consumer = %self.consumer_name,
            group = %self.opts.consumer_group,
            "事件总线主循环已启动"
        );

        loop {
            if *shutdown.borrow_and_update() {
                info!("收到停止信号，主循环退出");
                return Ok(());
            }

            let types = self.registry.event_types();
            if types.is_empty() {
                tokio::time::sleep(Duration::from_millis(self.opts.block_ms)).await;
                continue;
            }

            let keys: Vec<String> = types.iter().map(|t| stream_key(*t)).collect();
            let ids: Vec<&str> = vec![">"; keys.len()];
            let options = StreamReadOptions::default()
                .group(&self.opts.consumer_group, &self.consumer_name)
                .block(self.opts.block_ms as usize)
                .count(self.opts.batch_size);

            let read = conn.xread_options::<_, _, StreamReadReply>(&keys, &ids, &options);

            let reply = tokio::select! {
                // 偏向停止信号，阻塞读被放弃时未确认条目由回收流程接管
                biased;

                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("收到停止信号，主循环退出");
                        return Ok(());
                    }
                    continue;
                }

                result = read => match result {
                    Ok(reply) => reply,
                    Err(e) => {
                        if e.code() == Some("NOGROUP") {
                            // 消费组被外部删除属于可自愈故障
                            warn!("消费组缺失，尝试重建后继续");
                            if let Err(ce) = self.ensure_groups().await {
                                warn!(error = %ce, "重建消费组失败");
                            }
                            continue;
                        }

                        let err = AutomationError::Redis(e);
                        if err.is_connection_error() {
                            error!(error = %err, "broker 连接故障，主循环退出");
                            return Err(err);
                        }

                        warn!(error = %err, "读取事件流出错，继续下一轮");
                        continue;
                    }
                },
            };

            for stream in reply.keys {
                let Some(event_type) = event_type_of_key(&stream.key) else {
                    warn!(key = %stream.key, "无法识别的流键，跳过");
                    continue;
                };

                for entry in &stream.ids {
                    self.handle_entry(&mut conn, event_type, &entry.id, &entry.map)
                        .await;
                }
            }
        }
    }
}

#[async_trait]
impl EventTransport for RedisStreamTransport {
    /// 注册处理器并将该事件类型标记为需要消费组
    async fn on(&self, event_type: EventType, handler: Arc<dyn EventHandler>) {
        self.core.registry.register(event_type, handler);
    }

    /// 编码负载并追加到事件流，按近似上限裁剪
    ///
    /// broker 不可达时错误同步抛给调用方（入队失败可见）；
    /// 下游处理器的成败不会回传，只能通过执行日志观察。
    async fn emit(&self, event_type: EventType, payload: Value) -> Result<()> {
        let fields = envelope_fields(&payload, Utc::now().timestamp_millis())?;
        let mut conn = self.core.redis.connection().await?;

        let entry_id: String = conn
            .xadd_maxlen(
                stream_key(event_type),
                StreamMaxlen::Approx(self.core.opts.stream_maxlen),
                "*",
                &fields,
            )
            .await?;

        debug!(stream = %event_type, entry_id = %entry_id, "事件已追加到流");
        Ok(())
    }

    /// 幂等初始化：建消费组 -> 恢复扫描 -> 启动主循环
    ///
    /// 主循环在后台任务中运行；异常退出时按滚动窗口受限自动重启
    /// （重启 = 重新执行本初始化序列），超限后停止并等待人工介入。
    async fn initialize(&self) -> Result<()> {
        self.core.ensure_groups().await?;
        self.core.recovery_pass().await?;

        let core = self.core.clone();
        let handle = tokio::spawn(async move {
            let mut restarts =
                RestartTracker::new(core.opts.max_restarts, core.opts.restart_window);

            loop {
                match core.run_loop().await {
                    Ok(()) => break,
                    Err(e) => {
                        if !restarts.on_failure(Instant::now()) {
                            error!(
                                error = %e,
                                max_restarts = core.opts.max_restarts,
                                "重启次数超出滚动窗口上限，事件总线停止，需要人工介入"
                            );
                            break;
                        }

                        warn!(
                            error = %e,
                            restart = restarts.count(),
                            "主循环异常退出，准备自动重启"
                        );
                        tokio::time::sleep(Duration::from_secs(1)).await;

                        if let Err(ie) = core.ensure_groups().await {
                            warn!(error = %ie, "重启时重建消费组失败");
                        }
                        if let Err(ie) = core.recovery_pass().await {
                            warn!(error = %ie, "重启时恢复扫描失败");
                        }
                    }
                }
            }
        });

        *self.loop_handle.lock().await = Some(handle);
        Ok(())
    }

    /// 移除本地处理器注册
    ///
    /// 仅本地反注册：broker 侧消费组保留，流上后续条目会继续堆积
    /// 待确认，直到有持处理器的消费者接管。
    async fn off(&self, event_type: EventType) {
        self.core.registry.unregister(event_type);
    }

    /// 通知主循环在完成当前迭代后退出，并等待其结束
    async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.loop_handle.lock().await.take() {
            let _ = handle.await;
        }
    }
}
