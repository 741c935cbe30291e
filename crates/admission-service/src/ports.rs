//! 外部协作方接口定义
//!
//! 引擎边界上的持久化、审计、告警与通知都通过 trait 注入，
//! 便于服务层依赖抽象而非具体实现，支持 mock 测试。
//! HTTP/API 层、持久化 schema、推送通道本身均不在引擎范围内。

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::Result;
use crate::models::{AdmissionRequest, Campaign, IssuanceRecord, NotificationEvent};

// ---------------------------------------------------------------------------
// CampaignProvider — 活动配置查询
// ---------------------------------------------------------------------------

/// 活动配置提供方（外部管理端的持久化配置）
///
/// 只在每个活动首次使用和管理端显式更新容量时被调用，
/// 准入热路径不回读这里。
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CampaignProvider: Send + Sync {
    async fn get_campaign(&self, campaign_id: &str) -> Result<Option<Campaign>>;
}

/// 内存活动目录
///
/// 测试与单进程部署用的 CampaignProvider 实现。
#[derive(Default)]
pub struct InMemoryCampaignProvider {
    campaigns: DashMap<String, Campaign>,
}

impl InMemoryCampaignProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, campaign: Campaign) {
        self.campaigns.insert(campaign.campaign_id.clone(), campaign);
    }

    pub fn remove(&self, campaign_id: &str) {
        self.campaigns.remove(campaign_id);
    }
}

#[async_trait]
impl CampaignProvider for InMemoryCampaignProvider {
    async fn get_campaign(&self, campaign_id: &str) -> Result<Option<Campaign>> {
        Ok(self.campaigns.get(campaign_id).map(|c| c.clone()))
    }
}

// ---------------------------------------------------------------------------
// IssuanceWriter — 持久化发放凭证批量写入
// ---------------------------------------------------------------------------

/// 批量写入的单条结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    /// 已落库（或此前已存在，幂等跳过）
    Saved,
    /// 结构性无效，重试不可能成功
    Invalid { reason: String },
}

/// 批量写入结果
#[derive(Debug, Clone)]
pub enum BulkWriteOutcome {
    /// 整批成功
    AllSaved,
    /// 逐条结果，与入参顺序一一对应
    PerItem(Vec<ItemOutcome>),
}

/// 持久化发放凭证写入方
///
/// ## 幂等契约
///
/// `save_all` 必须对 `(campaign_id, requester_id)` 幂等：重复写入同一对
/// 不会产生第二条凭证，并按 `Saved` 上报。履约 Worker 依赖这一契约
/// 在崩溃恢复后安全地重放整批。
///
/// 整批瞬时不可用（连接失败、超时）通过 `Err` 返回，由 Worker 有界重试；
/// 单条结构性无效通过 `PerItem` 中的 `Invalid` 返回，立即死信。
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait IssuanceWriter: Send + Sync {
    async fn save_all(&self, records: &[IssuanceRecord]) -> Result<BulkWriteOutcome>;
}

// ---------------------------------------------------------------------------
// HistoryWriter — 审计流水
// ---------------------------------------------------------------------------

/// 审计流水写入方，每条成功履约的请求追加一条历史记录
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HistoryWriter: Send + Sync {
    async fn append(&self, record: &IssuanceRecord) -> Result<()>;
}

// ---------------------------------------------------------------------------
// AlertHook — 运维告警
// ---------------------------------------------------------------------------

/// 运维告警钩子
///
/// 每次 DEAD_LETTER 流转必须触发一次，死信绝不允许被静默丢弃。
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AlertHook: Send + Sync {
    async fn dead_letter(&self, request: &AdmissionRequest, reason: &str);
}

// ---------------------------------------------------------------------------
// NotificationSender — 终态通知
// ---------------------------------------------------------------------------

/// 终态通知发送方（外部异步推送通道）
///
/// 引擎保证事件至少发出一次，不保证送达。
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NotificationSender: Send + Sync {
    async fn send(&self, event: NotificationEvent) -> Result<()>;
}

// ---------------------------------------------------------------------------
// 日志适配器 — 守护进程的默认装配
// ---------------------------------------------------------------------------

/// 只记日志的发放写入方
///
/// 开发与演练环境的默认装配，把每条凭证落到结构化日志。
/// 生产部署替换为真实的持久化实现。
#[derive(Default)]
pub struct LoggingIssuanceWriter;

#[async_trait]
impl IssuanceWriter for LoggingIssuanceWriter {
    async fn save_all(&self, records: &[IssuanceRecord]) -> Result<BulkWriteOutcome> {
        for record in records {
            tracing::info!(
                campaign_id = %record.campaign_id,
                requester_id = %record.requester_id,
                position = record.position,
                "发放凭证已写入"
            );
        }
        Ok(BulkWriteOutcome::AllSaved)
    }
}

/// 只记日志的审计流水写入方
#[derive(Default)]
pub struct LoggingHistoryWriter;

#[async_trait]
impl HistoryWriter for LoggingHistoryWriter {
    async fn append(&self, record: &IssuanceRecord) -> Result<()> {
        tracing::info!(
            campaign_id = %record.campaign_id,
            requester_id = %record.requester_id,
            position = record.position,
            issued_at = %record.issued_at,
            "审计流水"
        );
        Ok(())
    }
}

/// 只记日志的告警钩子
#[derive(Default)]
pub struct LoggingAlertHook;

#[async_trait]
impl AlertHook for LoggingAlertHook {
    async fn dead_letter(&self, request: &AdmissionRequest, reason: &str) {
        tracing::error!(
            campaign_id = %request.campaign_id,
            request_id = %request.request_id,
            requester_id = %request.requester_id,
            position = request.position,
            reason,
            "死信告警"
        );
    }
}

/// 只记日志的通知发送方
#[derive(Default)]
pub struct LoggingNotificationSender;

#[async_trait]
impl NotificationSender for LoggingNotificationSender {
    async fn send(&self, event: NotificationEvent) -> Result<()> {
        tracing::info!(
            request_id = %event.request_id,
            requester_id = %event.requester_id,
            campaign_id = %event.campaign_id,
            outcome = ?event.outcome,
            "终态通知"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn sample_campaign(id: &str) -> Campaign {
        Campaign {
            campaign_id: id.to_string(),
            max_quantity: 10,
            active_from: Utc::now() - Duration::hours(1),
            active_until: Utc::now() + Duration::hours(1),
        }
    }

    #[tokio::test]
    async fn test_in_memory_campaign_provider() {
        let provider = InMemoryCampaignProvider::new();
        provider.upsert(sample_campaign("cmp-001"));

        let found = provider.get_campaign("cmp-001").await.unwrap();
        assert!(found.is_some());
        assert_eq!(found.unwrap().max_quantity, 10);

        assert!(provider.get_campaign("missing").await.unwrap().is_none());

        provider.remove("cmp-001");
        assert!(provider.get_campaign("cmp-001").await.unwrap().is_none());
    }

    #[test]
    fn test_item_outcome_equality() {
        assert_eq!(ItemOutcome::Saved, ItemOutcome::Saved);
        assert_ne!(
            ItemOutcome::Saved,
            ItemOutcome::Invalid {
                reason: "字段缺失".to_string()
            }
        );
    }
}
