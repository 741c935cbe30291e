//! 统一可观测性模块
//!
//! 提供日志初始化与指标命名的统一入口，确保各组件输出一致的
//! 结构化日志和指标名称。指标基于 metrics crate 记录，
//! 具体的导出后端由部署环境决定，不在引擎范围内。

use anyhow::Result;
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use crate::config::ObservabilityConfig;

/// 初始化 tracing 日志
///
/// 优先使用 RUST_LOG 环境变量，其次使用配置中的 log_level。
/// log_format 为 "json" 时输出结构化日志（生产环境），
/// 否则输出带颜色的人类可读格式（开发环境）。
pub fn init(config: &ObservabilityConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = if config.log_format == "json" {
        fmt::layer()
            .json()
            .with_span_events(FmtSpan::CLOSE)
            .with_target(true)
            .with_thread_ids(true)
            .boxed()
    } else {
        fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_ansi(true)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()?;

    Ok(())
}

/// 预定义的业务指标名称
///
/// 统一在此声明，避免各处手写字符串导致指标名漂移。
pub mod metric {
    pub const ADMISSION_TOTAL: &str = "admission_total";
    pub const FULFILLMENT_COMPLETED_TOTAL: &str = "fulfillment_completed_total";
    pub const FULFILLMENT_RETRY_TOTAL: &str = "fulfillment_retry_total";
    pub const FULFILLMENT_DEAD_LETTER_TOTAL: &str = "fulfillment_dead_letter_total";
    pub const ADMISSION_QUEUE_DEPTH: &str = "admission_queue_depth";
    pub const PROCESSING_RECOVERED_TOTAL: &str = "processing_recovered_total";
}

/// 注册指标描述
///
/// 描述文本会出现在导出端点的 HELP 注释中。重复调用无副作用。
pub fn describe_metrics() {
    metrics::describe_counter!(
        metric::ADMISSION_TOTAL,
        "Total admission decisions, labeled by outcome"
    );
    metrics::describe_counter!(
        metric::FULFILLMENT_COMPLETED_TOTAL,
        "Total admission requests fulfilled durably"
    );
    metrics::describe_counter!(
        metric::FULFILLMENT_RETRY_TOTAL,
        "Total fulfillment retries after transient failures"
    );
    metrics::describe_counter!(
        metric::FULFILLMENT_DEAD_LETTER_TOTAL,
        "Total admission requests moved to the dead letter state"
    );
    metrics::describe_gauge!(
        metric::ADMISSION_QUEUE_DEPTH,
        "Current queued entries per campaign"
    );
    metrics::describe_counter!(
        metric::PROCESSING_RECOVERED_TOTAL,
        "Stale PROCESSING entries recovered back into the queue"
    );
}
