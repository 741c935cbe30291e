//! 配置管理模块
//!
//! 支持多格式配置文件加载，环境变量覆盖，以及类型安全的配置访问。

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Redis 配置
///
/// 连接走单条多路复用连接，没有连接池参数。
#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    pub url: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
        }
    }
}

/// 履约 Worker 配置
///
/// 轮询间隔默认几百毫秒：既保证发放延迟足够低，
/// 又避免空转时对共享存储产生过多查询压力。
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// 轮询间隔（毫秒）
    pub tick_interval_ms: u64,
    /// 每批从队列中取出的最大条数
    pub batch_size: usize,
    /// 单条请求的重试上限，超过后进入死信
    pub max_retries: u32,
    /// PROCESSING 条目的处理超时（秒），超时视为 Worker 崩溃并回收
    pub processing_timeout_secs: u64,
    /// 终态记录保留窗口（秒），过期后清理
    pub retention_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 500,
            batch_size: 50,
            max_retries: 3,
            processing_timeout_secs: 30,
            retention_secs: 86_400,
        }
    }
}

impl WorkerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn processing_timeout(&self) -> Duration {
        Duration::from_secs(self.processing_timeout_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

/// 可观测性配置
#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    pub log_level: String,
    /// 日志输出格式：json（结构化）或 pretty（人类可读）
    pub log_format: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

/// 应用配置
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub service_name: String,
    pub environment: String,
    pub redis: RedisConfig,
    pub worker: WorkerConfig,
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// 从配置文件和环境变量加载配置
    ///
    /// 加载顺序（后加载的会覆盖先加载的同名配置项）：
    /// 1. config/default.toml（默认配置）
    /// 2. config/{environment}.toml（环境特定配置）
    /// 3. 环境变量（FLASHDROP_ 前缀，如 FLASHDROP_REDIS_URL -> redis.url）
    pub fn load(service_name: &str) -> Result<Self, ConfigError> {
        let env = std::env::var("FLASHDROP_ENV").unwrap_or_else(|_| "development".to_string());
        let config_dir = std::env::var("CONFIG_DIR").unwrap_or_else(|_| "config".to_string());

        let builder = Config::builder()
            .set_default("service_name", service_name)?
            .set_default("environment", env.clone())?
            .add_source(File::from(Path::new(&config_dir).join("default.toml")).required(false))
            .add_source(
                File::from(Path::new(&config_dir).join(format!("{}.toml", env))).required(false),
            )
            .add_source(
                Environment::with_prefix("FLASHDROP")
                    .separator("_")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// 是否为生产环境
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.worker.batch_size, 50);
        assert_eq!(config.worker.max_retries, 3);
        assert_eq!(config.worker.tick_interval(), Duration::from_millis(500));
        assert_eq!(config.redis.url, "redis://localhost:6379");
    }

    #[test]
    fn test_worker_duration_helpers() {
        let worker = WorkerConfig {
            tick_interval_ms: 200,
            batch_size: 10,
            max_retries: 5,
            processing_timeout_secs: 60,
            retention_secs: 3600,
        };
        assert_eq!(worker.tick_interval(), Duration::from_millis(200));
        assert_eq!(worker.processing_timeout(), Duration::from_secs(60));
        assert_eq!(worker.retention(), Duration::from_secs(3600));
    }
}
