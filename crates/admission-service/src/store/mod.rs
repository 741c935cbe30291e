//! 原子准入存储抽象
//!
//! 容量计数器、去重集合与有序等待队列统一收敛在一个接口后面，
//! 对外只暴露单一的原子准入原语：去重检查、容量占用（含超额回滚）、
//! 入队三步必须作为一个原子单元执行，否则两个并发调用方可能
//! 同时认为自己拿到了最后一个名额。
//!
//! 引擎内所有对这三类状态的写入都必须经过本接口——
//! 这是防止丢失更新竞态的关键纪律，任何其他代码路径不得直接改写。
//!
//! 每种后端一个实现：
//! - [`memory::MemoryAdmissionStore`]：进程内存储，用于测试与单实例部署
//! - [`redis::RedisAdmissionStore`]：多实例共享的 Redis 存储，
//!   每个复合操作编译为一段 Lua 脚本、一次原子往返

pub mod memory;
pub mod redis;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{AdmissionOutcome, AdmissionRequest};

pub use memory::MemoryAdmissionStore;
pub use redis::RedisAdmissionStore;

/// 原子准入存储
///
/// 写操作按归属划分：`try_admit` / `seed_capacity` / `update_capacity` /
/// `close_campaign` 只由准入闸门调用；`pop_oldest` / `requeue_front` /
/// `recover_stale` / `mark_*` / `purge_terminal` 只由履约 Worker 调用。
/// 同一类变更永远只有一个写入方。
#[async_trait]
pub trait AdmissionStore: Send + Sync {
    /// 一次性播种容量计数器
    ///
    /// 幂等：只有首次调用真正写入并返回 true，之后的调用不覆盖
    /// 已有计数（否则并发回滚的扣减会丢失）。
    async fn seed_capacity(&self, campaign_id: &str, max_quantity: u64) -> Result<bool>;

    /// 该活动的计数器是否已播种
    async fn is_seeded(&self, campaign_id: &str) -> Result<bool>;

    /// 管理端显式更新容量
    ///
    /// 这是唯一允许的重新播种路径；当新容量大于已发放数时
    /// 同时清除 sold_out 标记。对尚未播种的活动等价于播种。
    async fn update_capacity(&self, campaign_id: &str, new_max: u64) -> Result<()>;

    /// 原子准入判定
    ///
    /// 算法（单原子单元）：
    /// 1. requester 已在去重集合 -> Duplicate，无任何状态变更；
    /// 2. 递增 issued；若超过 max 则回滚递增、置位 sold_out -> SoldOut；
    /// 3. 否则写入去重集合，position = 递增后的 issued，
    ///    构造 QUEUED 请求入队 -> Admitted。
    async fn try_admit(&self, campaign_id: &str, requester_id: &str) -> Result<AdmissionOutcome>;

    /// 原子取出 position 最小的至多 max_count 条请求
    ///
    /// 取出的条目同时被标记为 PROCESSING 并记录领取时刻；
    /// 两个并发 Worker 不会取到重叠的条目。返回按 position 升序。
    async fn pop_oldest(
        &self,
        campaign_id: &str,
        max_count: usize,
    ) -> Result<Vec<AdmissionRequest>>;

    /// 重试路径：把 PROCESSING 条目放回队列
    ///
    /// 条目按原始 position 归位，保持先到先得的顺序；状态落为
    /// FAILED（区别于未经历失败的 QUEUED，下次出队时再转 PROCESSING），
    /// 同时持久化调用方更新过的 attempts 计数。
    async fn requeue_front(&self, campaign_id: &str, requests: &[AdmissionRequest]) -> Result<()>;

    /// 恢复清扫：超过处理超时的 PROCESSING 条目视为 Worker 崩溃，
    /// 按原始 position 放回队列。返回恢复的条数。
    async fn recover_stale(
        &self,
        campaign_id: &str,
        processing_timeout: Duration,
    ) -> Result<usize>;

    /// 标记一批请求为 COMPLETED（终态）
    async fn mark_completed(&self, campaign_id: &str, request_ids: &[String]) -> Result<()>;

    /// 标记一批请求为 DEAD_LETTER（终态）
    async fn mark_dead_letter(&self, campaign_id: &str, request_ids: &[String]) -> Result<()>;

    /// 清理超过保留窗口的终态记录，返回清理条数
    ///
    /// Redis 后端在标记终态时即设置了 TTL，此调用为 no-op。
    async fn purge_terminal(&self, retention: Duration) -> Result<usize>;

    /// 已发放（含排队中）的名额数
    async fn issued_count(&self, campaign_id: &str) -> Result<u64>;

    /// 等待队列当前深度
    async fn queue_depth(&self, campaign_id: &str) -> Result<u64>;

    /// 按 request_id 查询请求
    async fn get_request(&self, request_id: &str) -> Result<Option<AdmissionRequest>>;

    /// 排在该请求之前、尚未完成履约的条目数
    ///
    /// 请求处于终态或不存在时返回 None。
    async fn position_ahead(&self, request_id: &str) -> Result<Option<u64>>;

    /// 当前有待处理条目（排队中或处理中）的活动列表
    async fn pending_campaigns(&self) -> Result<Vec<String>>;

    /// 活动生命周期终点：销毁该活动的全部存储状态
    async fn close_campaign(&self, campaign_id: &str) -> Result<()>;
}
