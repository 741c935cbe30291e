//! 准入闸口
//!
//! 对外的唯一准入入口。负责校验请求、检查活动有效期、
//! 懒播种容量计数器，然后把去重与占位判定整体交给存储层的
//! 原子操作完成。闸口自身不持有任何计数状态，多实例部署安全。

use std::sync::Arc;

use dashmap::DashMap;
use metrics::counter;
use tracing::{info, instrument, warn};

use flashdrop_shared::observability::metric;

use crate::error::{AdmissionError, Result};
use crate::models::{AdmissionOutcome, Campaign};
use crate::ports::CampaignProvider;
use crate::store::AdmissionStore;

/// 准入闸口服务
pub struct AdmissionGate {
    store: Arc<dyn AdmissionStore>,
    campaigns: Arc<dyn CampaignProvider>,
    /// 活动定义缓存，省掉热点路径上的重复查询
    cache: DashMap<String, Campaign>,
}

impl AdmissionGate {
    pub fn new(store: Arc<dyn AdmissionStore>, campaigns: Arc<dyn CampaignProvider>) -> Self {
        Self {
            store,
            campaigns,
            cache: DashMap::new(),
        }
    }

    /// 尝试准入
    ///
    /// 三种互斥结果之一：
    /// - `Admitted`:  占到名额，返回带唯一序号的排队请求
    /// - `Duplicate`: 该请求者此前已被准入
    /// - `SoldOut`:   容量耗尽
    #[instrument(skip(self))]
    pub async fn try_admit(
        &self,
        campaign_id: &str,
        requester_id: &str,
    ) -> Result<AdmissionOutcome> {
        if campaign_id.trim().is_empty() {
            return Err(AdmissionError::Validation("活动 ID 不能为空".to_string()));
        }
        if requester_id.trim().is_empty() {
            return Err(AdmissionError::Validation("请求者 ID 不能为空".to_string()));
        }

        let campaign = self.resolve_campaign(campaign_id).await?;
        if !campaign.is_active_at(chrono::Utc::now()) {
            warn!(campaign_id, "活动不在有效期内，拒绝准入");
            return Err(AdmissionError::CampaignNotActive {
                campaign_id: campaign_id.to_string(),
            });
        }

        // 懒播种：首个请求到达时初始化计数器，幂等且并发安全
        self.store
            .seed_capacity(campaign_id, campaign.max_quantity)
            .await?;

        let outcome = self.store.try_admit(campaign_id, requester_id).await?;
        match &outcome {
            AdmissionOutcome::Admitted { request } => {
                counter!(metric::ADMISSION_TOTAL, "result" => "admitted").increment(1);
                info!(
                    campaign_id,
                    requester_id,
                    request_id = %request.request_id,
                    position = request.position,
                    "准入成功"
                );
            }
            AdmissionOutcome::Duplicate => {
                counter!(metric::ADMISSION_TOTAL, "result" => "duplicate").increment(1);
            }
            AdmissionOutcome::SoldOut => {
                counter!(metric::ADMISSION_TOTAL, "result" => "sold_out").increment(1);
            }
        }
        Ok(outcome)
    }

    /// 管理端调整活动容量
    ///
    /// 新容量大于已发放数时清除售罄标记，之后的新请求可继续抢占；
    /// 此前已收到 SOLD_OUT 的请求者不会被追溯补进队列。
    pub async fn update_capacity(&self, campaign_id: &str, new_max: u64) -> Result<()> {
        let campaign = self.campaigns.get_campaign(campaign_id).await?.ok_or_else(|| {
            AdmissionError::CampaignNotFound {
                campaign_id: campaign_id.to_string(),
            }
        })?;

        self.store.update_capacity(campaign_id, new_max).await?;
        self.cache.insert(
            campaign_id.to_string(),
            Campaign {
                max_quantity: new_max,
                ..campaign
            },
        );
        info!(campaign_id, new_max, "活动容量已调整");
        Ok(())
    }

    /// 关闭活动并销毁其存储状态
    pub async fn close_campaign(&self, campaign_id: &str) -> Result<()> {
        self.store.close_campaign(campaign_id).await?;
        self.cache.remove(campaign_id);
        info!(campaign_id, "活动已关闭");
        Ok(())
    }

    async fn resolve_campaign(&self, campaign_id: &str) -> Result<Campaign> {
        if let Some(cached) = self.cache.get(campaign_id) {
            return Ok(cached.clone());
        }

        let campaign = self.campaigns.get_campaign(campaign_id).await?.ok_or_else(|| {
            AdmissionError::CampaignNotFound {
                campaign_id: campaign_id.to_string(),
            }
        })?;
        self.cache
            .insert(campaign_id.to_string(), campaign.clone());
        Ok(campaign)
    }
}
