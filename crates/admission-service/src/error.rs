//! 准入引擎专用错误类型
//!
//! 在共享库 FlashdropError 基础上定义本引擎特有的错误变体。
//! 注意 DUPLICATE 和 SOLD_OUT 不是错误而是正常的准入结果，
//! 由 `AdmissionOutcome` 表达；这里只定义真正的失败路径。

use flashdrop_shared::error::FlashdropError;

/// 准入/履约错误
#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    /// 活动不存在，同步返回给准入调用方
    #[error("活动不存在: {campaign_id}")]
    CampaignNotFound { campaign_id: String },

    /// 活动不在有效时间窗口内，同步返回给准入调用方
    #[error("活动未开始或已结束: {campaign_id}")]
    CampaignNotActive { campaign_id: String },

    /// 状态查询的请求不存在（或已超出保留窗口被清理）
    #[error("请求不存在: {request_id}")]
    RequestNotFound { request_id: String },

    /// 请求参数无效（如空的 requester_id）
    #[error("参数验证失败: {0}")]
    Validation(String),

    /// 持久化存储瞬时故障，由履约 Worker 在重试上限内自行恢复，
    /// 不会回传给已经拿到 ADMITTED 的原始调用方
    #[error("持久化写入失败: {0}")]
    Persistence(String),

    /// 结构性无效的记录，重试不可能成功，立即死信
    #[error("记录格式无效: {reason}")]
    MalformedRecord { reason: String },

    /// 透传共享库错误（Redis、配置等基础设施故障）
    #[error(transparent)]
    Shared(#[from] FlashdropError),
}

/// 错误结果类型别名
pub type Result<T> = std::result::Result<T, AdmissionError>;

impl AdmissionError {
    /// 获取错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::CampaignNotFound { .. } => "CAMPAIGN_NOT_FOUND",
            Self::CampaignNotActive { .. } => "CAMPAIGN_NOT_ACTIVE",
            Self::RequestNotFound { .. } => "REQUEST_NOT_FOUND",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Persistence(_) => "TRANSIENT_PERSISTENCE_FAILURE",
            Self::MalformedRecord { .. } => "MALFORMED_RECORD",
            Self::Shared(e) => e.code(),
        }
    }

    /// 是否为可重试错误
    ///
    /// 只有瞬时持久化故障和基础设施瞬时故障可重试；
    /// 活动校验类错误和格式无效重试也不会成功。
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Persistence(_) => true,
            Self::Shared(e) => e.is_retryable(),
            _ => false,
        }
    }
}

impl From<redis::RedisError> for AdmissionError {
    fn from(err: redis::RedisError) -> Self {
        Self::Shared(FlashdropError::Redis(err))
    }
}
