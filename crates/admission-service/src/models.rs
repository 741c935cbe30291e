//! 领域模型
//!
//! 定义活动、准入请求及其状态机、发放凭证以及对外通知事件。
//! 所有跨进程传输的结构统一使用 camelCase 序列化，
//! 与系统其他服务的事件信封保持一致。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Campaign — 限量活动
// ---------------------------------------------------------------------------

/// 限量活动配置
///
/// 由外部管理端创建；除 `max_quantity` 可事后上调外其余字段不可变。
/// 容量计数器只在首次使用时从这里播种一次，之后不再回读，
/// 避免并发回滚的扣减被覆盖。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Campaign {
    pub campaign_id: String,
    /// 配置容量，可在创建后上调
    pub max_quantity: u64,
    pub active_from: DateTime<Utc>,
    pub active_until: DateTime<Utc>,
}

impl Campaign {
    /// 指定时刻是否在活动有效窗口内
    pub fn is_active_at(&self, at: DateTime<Utc>) -> bool {
        at >= self.active_from && at < self.active_until
    }
}

// ---------------------------------------------------------------------------
// RequestState — 准入请求状态机
// ---------------------------------------------------------------------------

/// 准入请求状态
///
/// QUEUED -> PROCESSING -> COMPLETED（终态）
/// QUEUED -> PROCESSING -> QUEUED（有界重试）
/// -> DEAD_LETTER（终态：重试耗尽或不可重试错误）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestState {
    Queued,
    Processing,
    Completed,
    Failed,
    DeadLetter,
}

impl RequestState {
    /// 终态不再流转，记录在保留窗口过后即可清理
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::DeadLetter)
    }
}

impl std::fmt::Display for RequestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Queued => "QUEUED",
            Self::Processing => "PROCESSING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::DeadLetter => "DEAD_LETTER",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// AdmissionRequest — 已准入的请求
// ---------------------------------------------------------------------------

/// 已准入的请求
///
/// 由准入闸门在判定成功时创建，携带单调递增的 position 进入等待队列，
/// 最终由履约 Worker 转化为持久化发放凭证。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionRequest {
    /// 请求唯一标识（UUID v7），时间有序便于排查
    pub request_id: String,
    pub campaign_id: String,
    pub requester_id: String,
    /// 活动内单调递增、不复用的准入序号
    pub position: u64,
    pub admitted_at: DateTime<Utc>,
    pub state: RequestState,
    /// 已消耗的重试次数；结构性无效的条目直接死信不计入
    pub attempts: u32,
}

impl AdmissionRequest {
    /// 创建一条新的 QUEUED 请求
    pub fn new(campaign_id: &str, requester_id: &str, position: u64) -> Self {
        Self {
            request_id: Uuid::now_v7().to_string(),
            campaign_id: campaign_id.to_string(),
            requester_id: requester_id.to_string(),
            position,
            admitted_at: Utc::now(),
            state: RequestState::Queued,
            attempts: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// IssuanceRecord — 持久化发放凭证
// ---------------------------------------------------------------------------

/// 持久化发放凭证
///
/// 成功抢占的对外可见证明。只由履约 Worker 创建，
/// 准入闸门永远不直接写入——闸门只负责占住名额。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuanceRecord {
    pub campaign_id: String,
    pub requester_id: String,
    pub position: u64,
    pub issued_at: DateTime<Utc>,
}

impl From<&AdmissionRequest> for IssuanceRecord {
    fn from(req: &AdmissionRequest) -> Self {
        Self {
            campaign_id: req.campaign_id.clone(),
            requester_id: req.requester_id.clone(),
            position: req.position,
            issued_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// AdmissionOutcome — 准入判定结果
// ---------------------------------------------------------------------------

/// 准入判定结果
///
/// DUPLICATE 与 SOLD_OUT 是明确定义的结果而非错误。
/// 判定由共享存储在一个原子操作内完成：去重检查、容量占用、
/// 请求入队三步之间不存在可观察的中间窗口。
#[derive(Debug, Clone)]
pub enum AdmissionOutcome {
    Admitted { request: AdmissionRequest },
    Duplicate,
    SoldOut,
}

impl AdmissionOutcome {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Admitted { .. })
    }
}

// ---------------------------------------------------------------------------
// PositionStatus — 状态查询视图
// ---------------------------------------------------------------------------

/// 请求的当前位置与状态
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionStatus {
    pub request_id: String,
    pub position: u64,
    pub state: RequestState,
    /// 排在该请求之前、尚未出队的条目数；终态后为 None
    pub ahead: Option<u64>,
}

// ---------------------------------------------------------------------------
// NotificationEvent — 对外通知事件
// ---------------------------------------------------------------------------

/// 终态通知的结果类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationOutcome {
    Completed,
    DeadLetter,
}

/// 终态通知事件
///
/// 每次 COMPLETED / DEAD_LETTER 流转时至少发出一次，
/// 投递由外部推送通道负责，引擎不保证送达。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationEvent {
    pub request_id: String,
    pub requester_id: String,
    pub campaign_id: String,
    pub outcome: NotificationOutcome,
}

impl NotificationEvent {
    pub fn from_request(req: &AdmissionRequest, outcome: NotificationOutcome) -> Self {
        Self {
            request_id: req.request_id.clone(),
            requester_id: req.requester_id.clone(),
            campaign_id: req.campaign_id.clone(),
            outcome,
        }
    }
}

// ---------------------------------------------------------------------------
// 单元测试
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_campaign_active_window() {
        let now = Utc::now();
        let campaign = Campaign {
            campaign_id: "cmp-001".to_string(),
            max_quantity: 100,
            active_from: now - Duration::hours(1),
            active_until: now + Duration::hours(1),
        };

        assert!(campaign.is_active_at(now));
        assert!(!campaign.is_active_at(now - Duration::hours(2)));
        assert!(!campaign.is_active_at(now + Duration::hours(2)));
        // 窗口右端为开区间
        assert!(!campaign.is_active_at(campaign.active_until));
        // 左端为闭区间
        assert!(campaign.is_active_at(campaign.active_from));
    }

    #[test]
    fn test_request_state_terminal() {
        assert!(RequestState::Completed.is_terminal());
        assert!(RequestState::DeadLetter.is_terminal());
        assert!(!RequestState::Queued.is_terminal());
        assert!(!RequestState::Processing.is_terminal());
        assert!(!RequestState::Failed.is_terminal());
    }

    #[test]
    fn test_admission_request_new() {
        let req = AdmissionRequest::new("cmp-001", "user-1", 7);
        assert_eq!(req.campaign_id, "cmp-001");
        assert_eq!(req.requester_id, "user-1");
        assert_eq!(req.position, 7);
        assert_eq!(req.state, RequestState::Queued);
        assert_eq!(req.attempts, 0);
        assert!(Uuid::parse_str(&req.request_id).is_ok());
    }

    #[test]
    fn test_issuance_record_from_request() {
        let req = AdmissionRequest::new("cmp-001", "user-1", 3);
        let record = IssuanceRecord::from(&req);
        assert_eq!(record.campaign_id, "cmp-001");
        assert_eq!(record.requester_id, "user-1");
        assert_eq!(record.position, 3);
    }

    #[test]
    fn test_request_serialization_camel_case() {
        let req = AdmissionRequest::new("cmp-001", "user-1", 1);
        let json = serde_json::to_string(&req).unwrap();

        assert!(json.contains("requestId"));
        assert!(json.contains("campaignId"));
        assert!(json.contains("requesterId"));
        assert!(json.contains("admittedAt"));
        assert!(json.contains("\"QUEUED\""));

        let back: AdmissionRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.request_id, req.request_id);
        assert_eq!(back.state, RequestState::Queued);
    }

    #[test]
    fn test_notification_event_from_request() {
        let req = AdmissionRequest::new("cmp-001", "user-1", 1);
        let event = NotificationEvent::from_request(&req, NotificationOutcome::DeadLetter);
        assert_eq!(event.request_id, req.request_id);
        assert_eq!(event.outcome, NotificationOutcome::DeadLetter);

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("DEAD_LETTER"));
    }
}
