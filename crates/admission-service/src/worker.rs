//! 履约 Worker
//!
//! 后台批量排空准入队列：固定间隔轮询，每批按序号从小到大取出
//! 一批排队请求，批量写入持久化发放凭证，然后标记终态并发出通知。
//!
//! 容错分三路：整批瞬时失败走有界重试（回队保持原序号），
//! 超过上限进死信；单条结构性无效不消耗重试次数，直接死信并告警。
//! 每轮开始前先做一次恢复清扫，把崩溃 Worker 遗留的 PROCESSING
//! 条目收回队列，配合写入方的幂等契约实现安全重放。

use std::sync::Arc;

use metrics::{counter, gauge};
use tokio::sync::watch;
use tokio::time::{self, MissedTickBehavior};
use tracing::{error, info, warn};

use flashdrop_shared::config::WorkerConfig;
use flashdrop_shared::observability::metric;

use crate::error::{AdmissionError, Result};
use crate::models::{AdmissionRequest, IssuanceRecord, NotificationEvent, NotificationOutcome};
use crate::ports::{AlertHook, BulkWriteOutcome, HistoryWriter, IssuanceWriter, ItemOutcome,
    NotificationSender};
use crate::store::AdmissionStore;

/// 履约 Worker
pub struct FulfillmentWorker {
    store: Arc<dyn AdmissionStore>,
    issuance: Arc<dyn IssuanceWriter>,
    history: Arc<dyn HistoryWriter>,
    alerts: Arc<dyn AlertHook>,
    notifier: Arc<dyn NotificationSender>,
    config: WorkerConfig,
}

impl FulfillmentWorker {
    pub fn new(
        store: Arc<dyn AdmissionStore>,
        issuance: Arc<dyn IssuanceWriter>,
        history: Arc<dyn HistoryWriter>,
        alerts: Arc<dyn AlertHook>,
        notifier: Arc<dyn NotificationSender>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            store,
            issuance,
            history,
            alerts,
            notifier,
            config,
        }
    }

    /// 启动轮询循环，收到关闭信号后在当前批次边界退出
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = time::interval(self.config.tick_interval());
        // 某一轮耗时超过间隔时顺延下一轮，不追赶积压的 tick
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            tick_interval_ms = self.config.tick_interval_ms,
            batch_size = self.config.batch_size,
            max_retries = self.config.max_retries,
            "履约 Worker 已启动"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once().await {
                        // 单轮失败不终止循环，下一轮重新尝试
                        error!(error = %e, "履约轮次执行失败");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("收到关闭信号，履约 Worker 退出");
                        return;
                    }
                }
            }
        }
    }

    /// 执行一轮完整的履约处理
    ///
    /// 拆出来便于测试按轮推进，不依赖真实时钟。
    pub async fn run_once(&self) -> Result<()> {
        for campaign_id in self.store.pending_campaigns().await? {
            self.drain_campaign(&campaign_id).await?;
        }
        self.store.purge_terminal(self.config.retention()).await?;
        Ok(())
    }

    async fn drain_campaign(&self, campaign_id: &str) -> Result<()> {
        let recovered = self
            .store
            .recover_stale(campaign_id, self.config.processing_timeout())
            .await?;
        if recovered > 0 {
            counter!(metric::PROCESSING_RECOVERED_TOTAL).increment(recovered as u64);
            warn!(campaign_id, recovered, "回收超时的处理中条目");
        }

        let batch = self
            .store
            .pop_oldest(campaign_id, self.config.batch_size)
            .await?;
        if !batch.is_empty() {
            self.fulfill_batch(campaign_id, batch).await?;
        }

        let depth = self.store.queue_depth(campaign_id).await?;
        gauge!(metric::ADMISSION_QUEUE_DEPTH, "campaign_id" => campaign_id.to_string())
            .set(depth as f64);
        Ok(())
    }

    async fn fulfill_batch(
        &self,
        campaign_id: &str,
        batch: Vec<AdmissionRequest>,
    ) -> Result<()> {
        let records: Vec<IssuanceRecord> = batch.iter().map(IssuanceRecord::from).collect();

        match self.issuance.save_all(&records).await {
            Ok(BulkWriteOutcome::AllSaved) => {
                self.complete_all(campaign_id, &batch).await?;
            }
            Ok(BulkWriteOutcome::PerItem(items)) => {
                self.settle_per_item(campaign_id, &batch, &items).await?;
            }
            Err(e) => {
                warn!(
                    campaign_id,
                    batch = batch.len(),
                    error = %e,
                    "批量落库瞬时失败，按重试策略回队"
                );
                self.retry_or_dead_letter(campaign_id, batch, &e.to_string())
                    .await?;
            }
        }
        Ok(())
    }

    async fn complete_all(&self, campaign_id: &str, batch: &[AdmissionRequest]) -> Result<()> {
        // 先发事件再落终态：两步之间崩溃时条目仍在处理中，
        // 恢复清扫会连同幂等的落库一起重放，事件至少发出一次（可能重复）
        for request in batch {
            self.emit_completed(request).await;
        }

        let ids: Vec<String> = batch.iter().map(|r| r.request_id.clone()).collect();
        self.store.mark_completed(campaign_id, &ids).await?;
        counter!(metric::FULFILLMENT_COMPLETED_TOTAL).increment(batch.len() as u64);
        Ok(())
    }

    /// 逐条结算：Saved 完成，Invalid 立即死信（不消耗重试次数）
    async fn settle_per_item(
        &self,
        campaign_id: &str,
        batch: &[AdmissionRequest],
        items: &[ItemOutcome],
    ) -> Result<()> {
        let mut completed_ids = Vec::new();
        let mut dead = Vec::new();

        for (request, item) in batch.iter().zip(items) {
            match item {
                ItemOutcome::Saved => completed_ids.push(request.request_id.clone()),
                ItemOutcome::Invalid { reason } => {
                    let err = AdmissionError::MalformedRecord {
                        reason: reason.clone(),
                    };
                    dead.push((request, err));
                }
            }
        }

        for request in batch {
            if completed_ids.contains(&request.request_id) {
                self.emit_completed(request).await;
            }
        }
        if !completed_ids.is_empty() {
            let count = completed_ids.len() as u64;
            self.store.mark_completed(campaign_id, &completed_ids).await?;
            counter!(metric::FULFILLMENT_COMPLETED_TOTAL).increment(count);
        }

        for (request, err) in dead {
            self.dead_letter(campaign_id, request, &err.to_string()).await?;
        }
        Ok(())
    }

    async fn retry_or_dead_letter(
        &self,
        campaign_id: &str,
        batch: Vec<AdmissionRequest>,
        reason: &str,
    ) -> Result<()> {
        let mut to_requeue = Vec::new();

        for mut request in batch {
            request.attempts += 1;
            if request.attempts <= self.config.max_retries {
                counter!(metric::FULFILLMENT_RETRY_TOTAL).increment(1);
                to_requeue.push(request);
            } else {
                self.dead_letter(campaign_id, &request, reason).await?;
            }
        }

        if !to_requeue.is_empty() {
            // 按原始序号归位，重试不破坏 FCFS 顺序；FAILED 状态由存储落盘
            self.store.requeue_front(campaign_id, &to_requeue).await?;
        }
        Ok(())
    }

    async fn dead_letter(
        &self,
        campaign_id: &str,
        request: &AdmissionRequest,
        reason: &str,
    ) -> Result<()> {
        error!(
            campaign_id,
            request_id = %request.request_id,
            requester_id = %request.requester_id,
            position = request.position,
            reason,
            "请求进入死信，占用的名额需运维介入处置"
        );
        self.alerts.dead_letter(request, reason).await;
        let event = NotificationEvent::from_request(request, NotificationOutcome::DeadLetter);
        if let Err(e) = self.notifier.send(event).await {
            warn!(request_id = %request.request_id, error = %e, "死信通知发送失败");
        }

        self.store
            .mark_dead_letter(campaign_id, std::slice::from_ref(&request.request_id))
            .await?;
        counter!(metric::FULFILLMENT_DEAD_LETTER_TOTAL).increment(1);
        Ok(())
    }

    async fn emit_completed(&self, request: &AdmissionRequest) {
        let record = IssuanceRecord::from(request);
        if let Err(e) = self.history.append(&record).await {
            // 审计流水不阻塞履约主流程
            warn!(request_id = %request.request_id, error = %e, "审计流水写入失败");
        }

        let event = NotificationEvent::from_request(request, NotificationOutcome::Completed);
        if let Err(e) = self.notifier.send(event).await {
            warn!(request_id = %request.request_id, error = %e, "完成通知发送失败");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AdmissionOutcome, RequestState};
    use crate::ports::{
        MockAlertHook, MockHistoryWriter, MockIssuanceWriter, MockNotificationSender,
    };
    use crate::store::MemoryAdmissionStore;
    use mockall::predicate;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn worker_config() -> WorkerConfig {
        WorkerConfig {
            tick_interval_ms: 10,
            batch_size: 50,
            max_retries: 3,
            processing_timeout_secs: 30,
            retention_secs: 3600,
        }
    }

    /// 准备一个已播种并入队 n 条请求的内存存储
    async fn seeded_store(campaign: &str, max: u64, requesters: &[&str]) -> Arc<MemoryAdmissionStore> {
        let store = Arc::new(MemoryAdmissionStore::new());
        store.seed_capacity(campaign, max).await.unwrap();
        for requester in requesters {
            let outcome = store.try_admit(campaign, requester).await.unwrap();
            assert!(outcome.is_admitted());
        }
        store
    }

    fn quiet_history() -> Arc<MockHistoryWriter> {
        let mut history = MockHistoryWriter::new();
        history.expect_append().returning(|_| Ok(()));
        Arc::new(history)
    }

    fn quiet_notifier() -> Arc<MockNotificationSender> {
        let mut notifier = MockNotificationSender::new();
        notifier.expect_send().returning(|_| Ok(()));
        Arc::new(notifier)
    }

    #[tokio::test]
    async fn test_happy_path_drains_queue() {
        let store = seeded_store("c1", 10, &["u1", "u2", "u3"]).await;

        let mut issuance = MockIssuanceWriter::new();
        issuance
            .expect_save_all()
            .times(1)
            .returning(|_| Ok(BulkWriteOutcome::AllSaved));
        let mut alerts = MockAlertHook::new();
        alerts.expect_dead_letter().times(0);

        let worker = FulfillmentWorker::new(
            store.clone(),
            Arc::new(issuance),
            quiet_history(),
            Arc::new(alerts),
            quiet_notifier(),
            worker_config(),
        );
        worker.run_once().await.unwrap();

        assert_eq!(store.queue_depth("c1").await.unwrap(), 0);
        // 所有请求流转到 COMPLETED
        for requester in ["u1", "u2", "u3"] {
            let outcome = store.try_admit("c1", requester).await.unwrap();
            assert!(matches!(outcome, AdmissionOutcome::Duplicate));
        }
    }

    #[tokio::test]
    async fn test_transient_failure_retries_then_completes() {
        // 前两轮落库失败，第三轮恢复；重试上限 3，请求应最终完成
        let store = seeded_store("c1", 10, &["u1", "u2"]).await;

        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let mut issuance = MockIssuanceWriter::new();
        issuance.expect_save_all().returning(move |_| {
            if calls_clone.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(AdmissionError::Persistence("连接超时".to_string()))
            } else {
                Ok(BulkWriteOutcome::AllSaved)
            }
        });
        let mut alerts = MockAlertHook::new();
        alerts.expect_dead_letter().times(0);

        let worker = FulfillmentWorker::new(
            store.clone(),
            Arc::new(issuance),
            quiet_history(),
            Arc::new(alerts),
            quiet_notifier(),
            worker_config(),
        );

        for _ in 0..3 {
            worker.run_once().await.unwrap();
        }

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(store.queue_depth("c1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_dead_letters() {
        let store = seeded_store("c1", 10, &["u1"]).await;

        let mut issuance = MockIssuanceWriter::new();
        issuance
            .expect_save_all()
            .returning(|_| Err(AdmissionError::Persistence("落库持续失败".to_string())));
        let mut alerts = MockAlertHook::new();
        alerts.expect_dead_letter().times(1).return_const(());

        let config = worker_config();
        let worker = FulfillmentWorker::new(
            store.clone(),
            Arc::new(issuance),
            quiet_history(),
            Arc::new(alerts),
            quiet_notifier(),
            config.clone(),
        );

        // max_retries=3：第 1 次 + 3 次重试后第 4 轮进入死信
        for _ in 0..=config.max_retries {
            worker.run_once().await.unwrap();
        }

        assert_eq!(store.queue_depth("c1").await.unwrap(), 0);
        // 死信后去重条目仍然存在，重复请求不会二次占位
        assert!(matches!(
            store.try_admit("c1", "u1").await.unwrap(),
            AdmissionOutcome::Duplicate
        ));
    }

    #[tokio::test]
    async fn test_failed_state_persisted_between_retries() {
        let store = Arc::new(MemoryAdmissionStore::new());
        store.seed_capacity("c1", 10).await.unwrap();
        let request_id = match store.try_admit("c1", "u1").await.unwrap() {
            AdmissionOutcome::Admitted { request } => request.request_id,
            other => panic!("期望准入成功，实际 {other:?}"),
        };

        let mut issuance = MockIssuanceWriter::new();
        issuance
            .expect_save_all()
            .returning(|_| Err(AdmissionError::Persistence("连接超时".to_string())));
        let mut alerts = MockAlertHook::new();
        alerts.expect_dead_letter().times(0);

        let worker = FulfillmentWorker::new(
            store.clone(),
            Arc::new(issuance),
            quiet_history(),
            Arc::new(alerts),
            quiet_notifier(),
            worker_config(),
        );
        worker.run_once().await.unwrap();

        // 两轮之间可以观察到 FAILED 状态与已消耗的重试次数
        let parked = store.get_request(&request_id).await.unwrap().unwrap();
        assert_eq!(parked.state, RequestState::Failed);
        assert_eq!(parked.attempts, 1);
        assert_eq!(store.queue_depth("c1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_malformed_record_dead_letters_immediately() {
        // 结构性无效的条目第一轮就死信，不消耗重试；同批其余条目正常完成
        let store = seeded_store("c1", 10, &["good", "bad"]).await;

        let mut issuance = MockIssuanceWriter::new();
        issuance.expect_save_all().times(1).returning(|records| {
            let items = records
                .iter()
                .map(|r| {
                    if r.requester_id == "bad" {
                        ItemOutcome::Invalid {
                            reason: "必填字段缺失".to_string(),
                        }
                    } else {
                        ItemOutcome::Saved
                    }
                })
                .collect();
            Ok(BulkWriteOutcome::PerItem(items))
        });
        let mut alerts = MockAlertHook::new();
        alerts
            .expect_dead_letter()
            .times(1)
            .withf(|req, reason| {
                req.requester_id == "bad"
                    && reason.contains("记录格式无效")
                    && reason.contains("必填字段缺失")
            })
            .return_const(());

        let worker = FulfillmentWorker::new(
            store.clone(),
            Arc::new(issuance),
            quiet_history(),
            Arc::new(alerts),
            quiet_notifier(),
            worker_config(),
        );
        worker.run_once().await.unwrap();

        assert_eq!(store.queue_depth("c1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_dead_letter_sends_notification() {
        let store = seeded_store("c1", 10, &["u1"]).await;

        let mut issuance = MockIssuanceWriter::new();
        issuance.expect_save_all().times(1).returning(|_| {
            Ok(BulkWriteOutcome::PerItem(vec![ItemOutcome::Invalid {
                reason: "字段非法".to_string(),
            }]))
        });
        let mut alerts = MockAlertHook::new();
        alerts.expect_dead_letter().times(1).return_const(());
        let mut notifier = MockNotificationSender::new();
        notifier
            .expect_send()
            .times(1)
            .with(predicate::function(|event: &NotificationEvent| {
                event.outcome == NotificationOutcome::DeadLetter
            }))
            .returning(|_| Ok(()));

        let worker = FulfillmentWorker::new(
            store.clone(),
            Arc::new(issuance),
            quiet_history(),
            Arc::new(alerts),
            Arc::new(notifier),
            worker_config(),
        );
        worker.run_once().await.unwrap();
    }

    #[tokio::test]
    async fn test_notification_failure_does_not_block_completion() {
        let store = seeded_store("c1", 10, &["u1"]).await;

        let mut issuance = MockIssuanceWriter::new();
        issuance
            .expect_save_all()
            .times(1)
            .returning(|_| Ok(BulkWriteOutcome::AllSaved));
        let mut notifier = MockNotificationSender::new();
        notifier.expect_send().returning(|_| {
            Err(AdmissionError::Shared(
                flashdrop_shared::error::FlashdropError::ExternalService {
                    service: "push".to_string(),
                    message: "通道不可用".to_string(),
                },
            ))
        });
        let mut alerts = MockAlertHook::new();
        alerts.expect_dead_letter().times(0);

        let worker = FulfillmentWorker::new(
            store.clone(),
            Arc::new(issuance),
            quiet_history(),
            Arc::new(alerts),
            Arc::new(notifier),
            worker_config(),
        );
        worker.run_once().await.unwrap();

        // 通知失败不影响终态流转
        assert_eq!(store.queue_depth("c1").await.unwrap(), 0);
        assert!(matches!(
            store.try_admit("c1", "u1").await.unwrap(),
            AdmissionOutcome::Duplicate
        ));
    }

    #[tokio::test]
    async fn test_batch_respects_fcfs_order() {
        let store = seeded_store("c1", 10, &["u1", "u2", "u3", "u4"]).await;

        let mut issuance = MockIssuanceWriter::new();
        issuance.expect_save_all().times(1).returning(|records| {
            // 批内条目按准入序号升序到达
            let positions: Vec<u64> = records.iter().map(|r| r.position).collect();
            let mut sorted = positions.clone();
            sorted.sort_unstable();
            assert_eq!(positions, sorted);
            Ok(BulkWriteOutcome::AllSaved)
        });
        let mut alerts = MockAlertHook::new();
        alerts.expect_dead_letter().times(0);

        let worker = FulfillmentWorker::new(
            store.clone(),
            Arc::new(issuance),
            quiet_history(),
            Arc::new(alerts),
            quiet_notifier(),
            worker_config(),
        );
        worker.run_once().await.unwrap();
    }

    #[tokio::test]
    async fn test_run_exits_on_shutdown_signal() {
        let store = Arc::new(MemoryAdmissionStore::new());
        let issuance = MockIssuanceWriter::new();
        let alerts = MockAlertHook::new();

        let worker = Arc::new(FulfillmentWorker::new(
            store,
            Arc::new(issuance),
            quiet_history(),
            Arc::new(alerts),
            quiet_notifier(),
            worker_config(),
        ));

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn({
            let worker = worker.clone();
            async move { worker.run(rx).await }
        });

        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .expect("Worker 应在关闭信号后及时退出")
            .unwrap();
    }
}
