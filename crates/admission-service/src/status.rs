//! 状态查询服务
//!
//! 面向请求者与运维的只读视图：查排队位置、已发放数、待处理深度。
//! 全部直接读共享存储，不持有本地状态。

use std::sync::Arc;

use crate::error::{AdmissionError, Result};
use crate::models::PositionStatus;
use crate::store::AdmissionStore;

/// 只读状态查询服务
pub struct StatusService {
    store: Arc<dyn AdmissionStore>,
}

impl StatusService {
    pub fn new(store: Arc<dyn AdmissionStore>) -> Self {
        Self { store }
    }

    /// 查询单条请求的当前位置与状态
    ///
    /// `ahead` 为排在该请求之前、尚未流转到终态的条目数；
    /// 请求本身已到终态时为 None。
    pub async fn get_position(&self, request_id: &str) -> Result<PositionStatus> {
        let request = self
            .store
            .get_request(request_id)
            .await?
            .ok_or_else(|| AdmissionError::RequestNotFound {
                request_id: request_id.to_string(),
            })?;

        let ahead = self.store.position_ahead(request_id).await?;
        Ok(PositionStatus {
            request_id: request.request_id,
            position: request.position,
            state: request.state,
            ahead,
        })
    }

    /// 活动已占用的名额数（含排队中、处理中与终态）
    pub async fn get_issued_count(&self, campaign_id: &str) -> Result<u64> {
        self.store.issued_count(campaign_id).await
    }

    /// 活动当前待履约的队列深度
    pub async fn get_pending_count(&self, campaign_id: &str) -> Result<u64> {
        self.store.queue_depth(campaign_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AdmissionOutcome, RequestState};
    use crate::store::MemoryAdmissionStore;

    async fn admit(store: &MemoryAdmissionStore, campaign: &str, requester: &str) -> String {
        match store.try_admit(campaign, requester).await.unwrap() {
            AdmissionOutcome::Admitted { request } => request.request_id,
            other => panic!("期望准入成功，实际 {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_position_reflects_queue_order() {
        let store = Arc::new(MemoryAdmissionStore::new());
        store.seed_capacity("c1", 10).await.unwrap();
        let first = admit(&store, "c1", "u1").await;
        let third = {
            admit(&store, "c1", "u2").await;
            admit(&store, "c1", "u3").await
        };

        let service = StatusService::new(store.clone());

        let status = service.get_position(&first).await.unwrap();
        assert_eq!(status.position, 1);
        assert_eq!(status.state, RequestState::Queued);
        assert_eq!(status.ahead, Some(0));

        let status = service.get_position(&third).await.unwrap();
        assert_eq!(status.position, 3);
        assert_eq!(status.ahead, Some(2));
    }

    #[tokio::test]
    async fn test_ahead_none_after_terminal() {
        let store = Arc::new(MemoryAdmissionStore::new());
        store.seed_capacity("c1", 10).await.unwrap();
        let id = admit(&store, "c1", "u1").await;

        store.pop_oldest("c1", 10).await.unwrap();
        store.mark_completed("c1", &[id.clone()]).await.unwrap();

        let service = StatusService::new(store);
        let status = service.get_position(&id).await.unwrap();
        assert_eq!(status.state, RequestState::Completed);
        assert_eq!(status.ahead, None);
    }

    #[tokio::test]
    async fn test_unknown_request_not_found() {
        let service = StatusService::new(Arc::new(MemoryAdmissionStore::new()));
        let err = service.get_position("missing").await.unwrap_err();
        assert!(matches!(err, AdmissionError::RequestNotFound { .. }));
    }

    #[tokio::test]
    async fn test_counts() {
        let store = Arc::new(MemoryAdmissionStore::new());
        store.seed_capacity("c1", 10).await.unwrap();
        admit(&store, "c1", "u1").await;
        admit(&store, "c1", "u2").await;

        let service = StatusService::new(store);
        assert_eq!(service.get_issued_count("c1").await.unwrap(), 2);
        assert_eq!(service.get_pending_count("c1").await.unwrap(), 2);
    }
}
