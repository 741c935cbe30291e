//! 准入服务守护进程
//!
//! 装配共享存储、履约 Worker 与关闭信号，常驻运行。
//! 准入闸口与状态查询由上层 API 网关经由库接口调用，
//! 本进程只负责后台履约循环。

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{error, info};

use coupon_admission::ports::{
    LoggingAlertHook, LoggingHistoryWriter, LoggingIssuanceWriter, LoggingNotificationSender,
};
use coupon_admission::store::RedisAdmissionStore;
use coupon_admission::FulfillmentWorker;
use flashdrop_shared::config::AppConfig;
use flashdrop_shared::observability;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load("coupon-admission-service").context("加载配置失败")?;
    observability::init(&config.observability).context("初始化日志失败")?;
    observability::describe_metrics();

    info!(
        service = %config.service_name,
        environment = %config.environment,
        "准入服务启动中"
    );

    let store = Arc::new(
        RedisAdmissionStore::new(&config.redis, config.worker.retention())
            .context("初始化 Redis 存储失败")?,
    );

    // 默认装配：审计与通知走结构化日志，告警同样落日志，
    // 生产部署通过库接口替换为真实的外部实现
    let worker = Arc::new(FulfillmentWorker::new(
        store,
        Arc::new(LoggingIssuanceWriter::default()),
        Arc::new(LoggingHistoryWriter::default()),
        Arc::new(LoggingAlertHook::default()),
        Arc::new(LoggingNotificationSender::default()),
        config.worker.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker_handle = tokio::spawn({
        let worker = worker.clone();
        async move { worker.run(shutdown_rx).await }
    });

    tokio::signal::ctrl_c().await.context("监听关闭信号失败")?;
    info!("收到 Ctrl-C，开始优雅关闭");
    if shutdown_tx.send(true).is_err() {
        error!("关闭信号发送失败，Worker 可能已退出");
    }
    worker_handle.await.context("等待 Worker 退出失败")?;

    info!("准入服务已退出");
    Ok(())
}
