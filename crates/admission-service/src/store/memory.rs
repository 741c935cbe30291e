//! 进程内准入存储
//!
//! 每个活动一把互斥锁，锁内完成去重检查、容量占用与入队，
//! 这把锁就是准入原语的原子性来源。适用于单实例部署和测试；
//! 多实例部署请使用 Redis 后端。

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use flashdrop_shared::error::FlashdropError;

use crate::error::Result;
use crate::models::{AdmissionOutcome, AdmissionRequest, RequestState};
use crate::store::AdmissionStore;

/// 单个活动的全部可变状态
///
/// 所有字段只在持有外层互斥锁时访问。
struct CampaignSlot {
    max_quantity: u64,
    issued: u64,
    sold_out: bool,
    /// 已准入的 requester_id，活动生命周期内永不删除
    dedup: HashSet<String>,
    /// 等待队列：position -> request_id，BTreeMap 天然按序号有序
    queue: BTreeMap<u64, String>,
    /// 处理中条目：request_id -> 领取时刻
    processing: HashMap<String, DateTime<Utc>>,
    /// 全部已知请求（含终态，直到保留窗口过期）
    requests: HashMap<String, AdmissionRequest>,
    /// 终态时间，用于保留窗口清理
    terminal_at: HashMap<String, DateTime<Utc>>,
}

impl CampaignSlot {
    fn new(max_quantity: u64) -> Self {
        Self {
            max_quantity,
            issued: 0,
            sold_out: false,
            dedup: HashSet::new(),
            queue: BTreeMap::new(),
            processing: HashMap::new(),
            requests: HashMap::new(),
            terminal_at: HashMap::new(),
        }
    }
}

/// 进程内原子准入存储
#[derive(Default)]
pub struct MemoryAdmissionStore {
    slots: DashMap<String, Mutex<CampaignSlot>>,
    /// request_id -> campaign_id 反向索引，状态查询用
    index: DashMap<String, String>,
}

impl MemoryAdmissionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 对指定活动的槽执行闭包；活动未播种时报内部错误
    fn with_slot<T>(
        &self,
        campaign_id: &str,
        f: impl FnOnce(&mut CampaignSlot) -> T,
    ) -> Result<T> {
        let slot = self.slots.get(campaign_id).ok_or_else(|| {
            FlashdropError::Internal(format!("活动容量未播种: {campaign_id}"))
        })?;
        let mut guard = slot.lock();
        Ok(f(&mut guard))
    }
}

#[async_trait]
impl AdmissionStore for MemoryAdmissionStore {
    async fn seed_capacity(&self, campaign_id: &str, max_quantity: u64) -> Result<bool> {
        match self.slots.entry(campaign_id.to_string()) {
            dashmap::Entry::Occupied(_) => Ok(false),
            dashmap::Entry::Vacant(v) => {
                v.insert(Mutex::new(CampaignSlot::new(max_quantity)));
                debug!(campaign_id, max_quantity, "容量计数器已播种");
                Ok(true)
            }
        }
    }

    async fn is_seeded(&self, campaign_id: &str) -> Result<bool> {
        Ok(self.slots.contains_key(campaign_id))
    }

    async fn update_capacity(&self, campaign_id: &str, new_max: u64) -> Result<()> {
        match self.slots.entry(campaign_id.to_string()) {
            dashmap::Entry::Occupied(entry) => {
                let mut slot = entry.get().lock();
                slot.max_quantity = new_max;
                if new_max > slot.issued {
                    slot.sold_out = false;
                }
            }
            dashmap::Entry::Vacant(v) => {
                v.insert(Mutex::new(CampaignSlot::new(new_max)));
            }
        }
        Ok(())
    }

    async fn try_admit(&self, campaign_id: &str, requester_id: &str) -> Result<AdmissionOutcome> {
        let outcome = self.with_slot(campaign_id, |slot| {
            if slot.dedup.contains(requester_id) {
                return AdmissionOutcome::Duplicate;
            }

            slot.issued += 1;
            if slot.issued > slot.max_quantity {
                // 超额：回滚递增并落下售罄标记
                slot.issued -= 1;
                slot.sold_out = true;
                return AdmissionOutcome::SoldOut;
            }

            let position = slot.issued;
            let request = AdmissionRequest::new(campaign_id, requester_id, position);
            slot.dedup.insert(requester_id.to_string());
            slot.queue.insert(position, request.request_id.clone());
            slot.requests
                .insert(request.request_id.clone(), request.clone());
            AdmissionOutcome::Admitted { request }
        })?;

        if let AdmissionOutcome::Admitted { request } = &outcome {
            self.index
                .insert(request.request_id.clone(), campaign_id.to_string());
        }
        Ok(outcome)
    }

    async fn pop_oldest(
        &self,
        campaign_id: &str,
        max_count: usize,
    ) -> Result<Vec<AdmissionRequest>> {
        let now = Utc::now();
        self.with_slot(campaign_id, |slot| {
            let mut batch = Vec::new();
            while batch.len() < max_count {
                let Some((_, request_id)) = slot.queue.pop_first() else {
                    break;
                };
                slot.processing.insert(request_id.clone(), now);
                if let Some(req) = slot.requests.get_mut(&request_id) {
                    req.state = RequestState::Processing;
                    batch.push(req.clone());
                }
            }
            batch
        })
    }

    async fn requeue_front(&self, campaign_id: &str, requests: &[AdmissionRequest]) -> Result<()> {
        self.with_slot(campaign_id, |slot| {
            for req in requests {
                slot.processing.remove(&req.request_id);
                // 按原始 position 归位，先到先得的顺序不受重试影响
                slot.queue.insert(req.position, req.request_id.clone());
                let mut stored = req.clone();
                stored.state = RequestState::Failed;
                slot.requests.insert(req.request_id.clone(), stored);
            }
        })
    }

    async fn recover_stale(
        &self,
        campaign_id: &str,
        processing_timeout: Duration,
    ) -> Result<usize> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(processing_timeout)
                .map_err(|e| FlashdropError::Internal(e.to_string()))?;

        self.with_slot(campaign_id, |slot| {
            let stale: Vec<String> = slot
                .processing
                .iter()
                .filter(|(_, claimed_at)| **claimed_at < cutoff)
                .map(|(id, _)| id.clone())
                .collect();

            for request_id in &stale {
                slot.processing.remove(request_id);
                if let Some(req) = slot.requests.get_mut(request_id) {
                    req.state = RequestState::Queued;
                    slot.queue.insert(req.position, request_id.clone());
                }
            }
            stale.len()
        })
    }

    async fn mark_completed(&self, campaign_id: &str, request_ids: &[String]) -> Result<()> {
        let now = Utc::now();
        self.with_slot(campaign_id, |slot| {
            for request_id in request_ids {
                slot.processing.remove(request_id);
                if let Some(req) = slot.requests.get_mut(request_id) {
                    req.state = RequestState::Completed;
                }
                slot.terminal_at.insert(request_id.clone(), now);
            }
        })
    }

    async fn mark_dead_letter(&self, campaign_id: &str, request_ids: &[String]) -> Result<()> {
        let now = Utc::now();
        self.with_slot(campaign_id, |slot| {
            for request_id in request_ids {
                slot.processing.remove(request_id);
                if let Some(req) = slot.requests.get_mut(request_id) {
                    req.state = RequestState::DeadLetter;
                }
                slot.terminal_at.insert(request_id.clone(), now);
            }
        })
    }

    async fn purge_terminal(&self, retention: Duration) -> Result<usize> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(retention)
                .map_err(|e| FlashdropError::Internal(e.to_string()))?;

        let mut purged = 0;
        for entry in self.slots.iter() {
            let mut slot = entry.value().lock();
            let expired: Vec<String> = slot
                .terminal_at
                .iter()
                .filter(|(_, at)| **at < cutoff)
                .map(|(id, _)| id.clone())
                .collect();

            for request_id in expired {
                // 去重集合保留：同一 requester 在活动存续期内不得二次准入
                slot.requests.remove(&request_id);
                slot.terminal_at.remove(&request_id);
                self.index.remove(&request_id);
                purged += 1;
            }
        }
        Ok(purged)
    }

    async fn issued_count(&self, campaign_id: &str) -> Result<u64> {
        self.with_slot(campaign_id, |slot| slot.issued)
    }

    async fn queue_depth(&self, campaign_id: &str) -> Result<u64> {
        self.with_slot(campaign_id, |slot| slot.queue.len() as u64)
    }

    async fn get_request(&self, request_id: &str) -> Result<Option<AdmissionRequest>> {
        let Some(campaign_id) = self.index.get(request_id).map(|c| c.clone()) else {
            return Ok(None);
        };
        self.with_slot(&campaign_id, |slot| slot.requests.get(request_id).cloned())
    }

    async fn position_ahead(&self, request_id: &str) -> Result<Option<u64>> {
        let Some(campaign_id) = self.index.get(request_id).map(|c| c.clone()) else {
            return Ok(None);
        };
        self.with_slot(&campaign_id, |slot| {
            let req = slot.requests.get(request_id)?;
            if req.state.is_terminal() {
                return None;
            }
            let position = req.position;
            let queued_ahead = slot.queue.range(..position).count() as u64;
            let processing_ahead = slot
                .processing
                .keys()
                .filter_map(|id| slot.requests.get(id))
                .filter(|r| r.position < position)
                .count() as u64;
            Some(queued_ahead + processing_ahead)
        })
    }

    async fn pending_campaigns(&self) -> Result<Vec<String>> {
        let mut pending = Vec::new();
        for entry in self.slots.iter() {
            let slot = entry.value().lock();
            if !slot.queue.is_empty() || !slot.processing.is_empty() {
                pending.push(entry.key().clone());
            }
        }
        Ok(pending)
    }

    async fn close_campaign(&self, campaign_id: &str) -> Result<()> {
        self.slots.remove(campaign_id);
        self.index.retain(|_, c| c != campaign_id);
        debug!(campaign_id, "活动存储状态已销毁");
        Ok(())
    }
}
