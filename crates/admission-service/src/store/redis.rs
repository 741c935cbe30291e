//! Redis 准入存储
//!
//! 多实例部署的共享存储后端。每个"检查-变更"复合操作都编译为一段
//! Lua 脚本，由 Redis 单线程执行模型保证原子性——准入判定的
//! 去重检查、容量占用与入队在一次往返内完成，不存在可观察的中间窗口。
//!
//! 请求详情每条独立成键（JSON string），终态时直接设置保留窗口 TTL，
//! 由 Redis 负责过期清理。处理中 zset 以 position 作为 score，
//! 领取时刻记在请求详情的 claimedAtMs 字段里供恢复清扫使用。

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, Script};
use tracing::debug;

use flashdrop_shared::config::RedisConfig;
use flashdrop_shared::error::FlashdropError;
use flashdrop_shared::keys::StoreKey;

use crate::error::Result;
use crate::models::{AdmissionOutcome, AdmissionRequest};
use crate::store::AdmissionStore;

/// 播种脚本：只在 max 字段不存在时写入初始计数
const SEED_SCRIPT: &str = r#"
if redis.call('HEXISTS', KEYS[1], 'max') == 1 then
    return 0
end
redis.call('HSET', KEYS[1], 'max', ARGV[1], 'issued', 0, 'sold_out', 0)
return 1
"#;

/// 管理端扩容脚本：更新 max，新容量大于已发放数时清除售罄标记
const UPDATE_CAPACITY_SCRIPT: &str = r#"
redis.call('HSET', KEYS[1], 'max', ARGV[1])
if redis.call('HEXISTS', KEYS[1], 'issued') == 0 then
    redis.call('HSET', KEYS[1], 'issued', 0, 'sold_out', 0)
end
local issued = tonumber(redis.call('HGET', KEYS[1], 'issued'))
if tonumber(ARGV[1]) > issued then
    redis.call('HSET', KEYS[1], 'sold_out', 0)
end
return 1
"#;

/// 准入判定脚本，即 §去重 -> 占用 -> 入队 的原子单元
///
/// KEYS: capacity, dedup, queue, pending, request, index
/// ARGV: requester_id, request_id, admitted_at, campaign_id
const TRY_ADMIT_SCRIPT: &str = r#"
if redis.call('SISMEMBER', KEYS[2], ARGV[1]) == 1 then
    return {'DUP', 0}
end
local max = tonumber(redis.call('HGET', KEYS[1], 'max'))
if not max then
    return redis.error_reply('capacity not seeded')
end
local issued = redis.call('HINCRBY', KEYS[1], 'issued', 1)
if issued > max then
    redis.call('HINCRBY', KEYS[1], 'issued', -1)
    redis.call('HSET', KEYS[1], 'sold_out', 1)
    return {'SOLD_OUT', 0}
end
redis.call('SADD', KEYS[2], ARGV[1])
local record = cjson.encode({
    requestId = ARGV[2],
    campaignId = ARGV[4],
    requesterId = ARGV[1],
    position = issued,
    admittedAt = ARGV[3],
    state = 'QUEUED',
    attempts = 0,
})
redis.call('SET', KEYS[5], record)
redis.call('ZADD', KEYS[3], issued, ARGV[2])
redis.call('SET', KEYS[6], ARGV[4])
redis.call('SADD', KEYS[4], ARGV[4])
return {'OK', issued}
"#;

/// 批量出队脚本：取出 position 最小的条目并原子标记 PROCESSING
///
/// KEYS: queue, processing
/// ARGV: count, now_ms, request_key_prefix
const POP_OLDEST_SCRIPT: &str = r#"
local popped = redis.call('ZPOPMIN', KEYS[1], tonumber(ARGV[1]))
local result = {}
for i = 1, #popped, 2 do
    local id = popped[i]
    local key = ARGV[3] .. id
    local raw = redis.call('GET', key)
    if raw then
        local rec = cjson.decode(raw)
        rec['state'] = 'PROCESSING'
        rec['claimedAtMs'] = tonumber(ARGV[2])
        raw = cjson.encode(rec)
        redis.call('SET', key, raw)
        redis.call('ZADD', KEYS[2], rec['position'], id)
        table.insert(result, raw)
    end
end
return result
"#;

/// 重试回队脚本：按原始 position 归位，落 FAILED 状态并持久化
/// 更新后的 attempts
///
/// KEYS: queue, processing
/// ARGV: request_key_prefix, 之后每项为一条请求的 JSON
const REQUEUE_SCRIPT: &str = r#"
local n = 0
for i = 2, #ARGV do
    local rec = cjson.decode(ARGV[i])
    rec['state'] = 'FAILED'
    rec['claimedAtMs'] = nil
    redis.call('ZREM', KEYS[2], rec['requestId'])
    redis.call('ZADD', KEYS[1], rec['position'], rec['requestId'])
    redis.call('SET', ARGV[1] .. rec['requestId'], cjson.encode(rec))
    n = n + 1
end
return n
"#;

/// 恢复清扫脚本：领取时刻早于 cutoff 的 PROCESSING 条目回队
///
/// KEYS: processing, queue
/// ARGV: cutoff_ms, request_key_prefix
const RECOVER_STALE_SCRIPT: &str = r#"
local ids = redis.call('ZRANGE', KEYS[1], 0, -1)
local n = 0
for _, id in ipairs(ids) do
    local key = ARGV[2] .. id
    local raw = redis.call('GET', key)
    if raw then
        local rec = cjson.decode(raw)
        if rec['claimedAtMs'] and tonumber(rec['claimedAtMs']) < tonumber(ARGV[1]) then
            rec['state'] = 'QUEUED'
            rec['claimedAtMs'] = nil
            redis.call('SET', key, cjson.encode(rec))
            redis.call('ZREM', KEYS[1], id)
            redis.call('ZADD', KEYS[2], rec['position'], id)
            n = n + 1
        end
    else
        redis.call('ZREM', KEYS[1], id)
    end
end
return n
"#;

/// 待处理集合修剪脚本：队列与处理中集合同时为空才允许摘除
///
/// 空检查与 SREM 必须在同一脚本内完成：分两次往返时，并发的准入
/// 可能恰好在检查之后、摘除之前入队，被摘除的活动将不再被任何
/// 轮次读到，队列里的请求就此滞留。同一脚本内则两种交错都安全：
/// 准入排在前面时 ZCARD 非零不摘除，排在后面时 SADD 会重新登记。
///
/// KEYS: queue, processing, pending
/// ARGV: campaign_id
const PRUNE_PENDING_SCRIPT: &str = r#"
if redis.call('ZCARD', KEYS[1]) == 0 and redis.call('ZCARD', KEYS[2]) == 0 then
    redis.call('SREM', KEYS[3], ARGV[1])
    return 0
end
return 1
"#;

/// 终态标记脚本：移出处理中集合，写入终态并设置保留窗口 TTL
///
/// KEYS: processing, request, index
/// ARGV: request_id, state, retention_secs
const MARK_TERMINAL_SCRIPT: &str = r#"
redis.call('ZREM', KEYS[1], ARGV[1])
local raw = redis.call('GET', KEYS[2])
if raw then
    local rec = cjson.decode(raw)
    rec['state'] = ARGV[2]
    rec['claimedAtMs'] = nil
    redis.call('SET', KEYS[2], cjson.encode(rec), 'EX', tonumber(ARGV[3]))
end
redis.call('EXPIRE', KEYS[3], tonumber(ARGV[3]))
return 1
"#;

/// Redis 原子准入存储
#[derive(Clone)]
pub struct RedisAdmissionStore {
    client: Client,
    /// 终态记录保留窗口，标记终态时作为 TTL 写入
    retention: Duration,
}

impl RedisAdmissionStore {
    /// 创建 Redis 存储
    pub fn new(config: &RedisConfig, retention: Duration) -> Result<Self> {
        let client = Client::open(config.url.as_str()).map_err(FlashdropError::from)?;
        Ok(Self { client, retention })
    }

    async fn get_conn(&self) -> Result<MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| FlashdropError::from(e).into())
    }

    fn decode_request(raw: &str) -> Result<AdmissionRequest> {
        serde_json::from_str(raw)
            .map_err(|e| FlashdropError::Serialization(format!("请求详情解析失败: {e}")).into())
    }

    fn encode_request(request: &AdmissionRequest) -> Result<String> {
        serde_json::to_string(request)
            .map_err(|e| FlashdropError::Serialization(format!("请求详情序列化失败: {e}")).into())
    }

    async fn mark_terminal(
        &self,
        campaign_id: &str,
        request_ids: &[String],
        state: &str,
    ) -> Result<()> {
        let mut conn = self.get_conn().await?;
        let retention_secs = self.retention.as_secs().max(1);

        // 终态标记条目之间无需互相原子，逐条执行即可；
        // 单条内部的移除 + 状态写入 + TTL 仍是一个原子单元
        for request_id in request_ids {
            let _: i64 = Script::new(MARK_TERMINAL_SCRIPT)
                .key(StoreKey::processing(campaign_id))
                .key(StoreKey::request(campaign_id, request_id))
                .key(StoreKey::request_index(request_id))
                .arg(request_id)
                .arg(state)
                .arg(retention_secs)
                .invoke_async(&mut conn)
                .await
                .map_err(FlashdropError::from)?;
        }
        Ok(())
    }
}

#[async_trait]
impl AdmissionStore for RedisAdmissionStore {
    async fn seed_capacity(&self, campaign_id: &str, max_quantity: u64) -> Result<bool> {
        let mut conn = self.get_conn().await?;
        let seeded: i64 = Script::new(SEED_SCRIPT)
            .key(StoreKey::capacity(campaign_id))
            .arg(max_quantity)
            .invoke_async(&mut conn)
            .await
            .map_err(FlashdropError::from)?;

        if seeded == 1 {
            debug!(campaign_id, max_quantity, "容量计数器已播种");
        }
        Ok(seeded == 1)
    }

    async fn is_seeded(&self, campaign_id: &str) -> Result<bool> {
        let mut conn = self.get_conn().await?;
        let exists: bool = conn
            .hexists(StoreKey::capacity(campaign_id), "max")
            .await
            .map_err(FlashdropError::from)?;
        Ok(exists)
    }

    async fn update_capacity(&self, campaign_id: &str, new_max: u64) -> Result<()> {
        let mut conn = self.get_conn().await?;
        let _: i64 = Script::new(UPDATE_CAPACITY_SCRIPT)
            .key(StoreKey::capacity(campaign_id))
            .arg(new_max)
            .invoke_async(&mut conn)
            .await
            .map_err(FlashdropError::from)?;
        Ok(())
    }

    async fn try_admit(&self, campaign_id: &str, requester_id: &str) -> Result<AdmissionOutcome> {
        // position 在脚本内分配，其余字段客户端先行生成
        let request = AdmissionRequest::new(campaign_id, requester_id, 0);
        let admitted_at = request.admitted_at.to_rfc3339();

        let mut conn = self.get_conn().await?;
        let (tag, position): (String, u64) = Script::new(TRY_ADMIT_SCRIPT)
            .key(StoreKey::capacity(campaign_id))
            .key(StoreKey::dedup(campaign_id))
            .key(StoreKey::queue(campaign_id))
            .key(StoreKey::pending_campaigns())
            .key(StoreKey::request(campaign_id, &request.request_id))
            .key(StoreKey::request_index(&request.request_id))
            .arg(requester_id)
            .arg(&request.request_id)
            .arg(&admitted_at)
            .arg(campaign_id)
            .invoke_async(&mut conn)
            .await
            .map_err(FlashdropError::from)?;

        match tag.as_str() {
            "OK" => Ok(AdmissionOutcome::Admitted {
                request: AdmissionRequest { position, ..request },
            }),
            "DUP" => Ok(AdmissionOutcome::Duplicate),
            "SOLD_OUT" => Ok(AdmissionOutcome::SoldOut),
            other => {
                Err(FlashdropError::StoreCorrupted(format!("未知的准入脚本返回: {other}")).into())
            }
        }
    }

    async fn pop_oldest(
        &self,
        campaign_id: &str,
        max_count: usize,
    ) -> Result<Vec<AdmissionRequest>> {
        let mut conn = self.get_conn().await?;
        let raws: Vec<String> = Script::new(POP_OLDEST_SCRIPT)
            .key(StoreKey::queue(campaign_id))
            .key(StoreKey::processing(campaign_id))
            .arg(max_count)
            .arg(Utc::now().timestamp_millis())
            .arg(StoreKey::request_prefix(campaign_id))
            .invoke_async(&mut conn)
            .await
            .map_err(FlashdropError::from)?;

        raws.iter().map(|raw| Self::decode_request(raw)).collect()
    }

    async fn requeue_front(&self, campaign_id: &str, requests: &[AdmissionRequest]) -> Result<()> {
        if requests.is_empty() {
            return Ok(());
        }

        let script = Script::new(REQUEUE_SCRIPT);
        let mut invocation = script.key(StoreKey::queue(campaign_id));
        invocation
            .key(StoreKey::processing(campaign_id))
            .arg(StoreKey::request_prefix(campaign_id));
        let payloads: Vec<String> = requests
            .iter()
            .map(Self::encode_request)
            .collect::<Result<_>>()?;
        for payload in &payloads {
            invocation.arg(payload);
        }

        let mut conn = self.get_conn().await?;
        let _: i64 = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(FlashdropError::from)?;
        Ok(())
    }

    async fn recover_stale(
        &self,
        campaign_id: &str,
        processing_timeout: Duration,
    ) -> Result<usize> {
        let cutoff = Utc::now().timestamp_millis() - processing_timeout.as_millis() as i64;

        let mut conn = self.get_conn().await?;
        let recovered: i64 = Script::new(RECOVER_STALE_SCRIPT)
            .key(StoreKey::processing(campaign_id))
            .key(StoreKey::queue(campaign_id))
            .arg(cutoff)
            .arg(StoreKey::request_prefix(campaign_id))
            .invoke_async(&mut conn)
            .await
            .map_err(FlashdropError::from)?;
        Ok(recovered as usize)
    }

    async fn mark_completed(&self, campaign_id: &str, request_ids: &[String]) -> Result<()> {
        self.mark_terminal(campaign_id, request_ids, "COMPLETED").await
    }

    async fn mark_dead_letter(&self, campaign_id: &str, request_ids: &[String]) -> Result<()> {
        self.mark_terminal(campaign_id, request_ids, "DEAD_LETTER").await
    }

    async fn purge_terminal(&self, _retention: Duration) -> Result<usize> {
        // 终态记录在标记时已设置 TTL，过期清理由 Redis 完成
        Ok(0)
    }

    async fn issued_count(&self, campaign_id: &str) -> Result<u64> {
        let mut conn = self.get_conn().await?;
        let issued: Option<u64> = conn
            .hget(StoreKey::capacity(campaign_id), "issued")
            .await
            .map_err(FlashdropError::from)?;
        Ok(issued.unwrap_or(0))
    }

    async fn queue_depth(&self, campaign_id: &str) -> Result<u64> {
        let mut conn = self.get_conn().await?;
        let depth: u64 = conn
            .zcard(StoreKey::queue(campaign_id))
            .await
            .map_err(FlashdropError::from)?;
        Ok(depth)
    }

    async fn get_request(&self, request_id: &str) -> Result<Option<AdmissionRequest>> {
        let mut conn = self.get_conn().await?;
        let campaign_id: Option<String> = conn
            .get(StoreKey::request_index(request_id))
            .await
            .map_err(FlashdropError::from)?;
        let Some(campaign_id) = campaign_id else {
            return Ok(None);
        };

        let raw: Option<String> = conn
            .get(StoreKey::request(&campaign_id, request_id))
            .await
            .map_err(FlashdropError::from)?;
        raw.map(|r| Self::decode_request(&r)).transpose()
    }

    async fn position_ahead(&self, request_id: &str) -> Result<Option<u64>> {
        let Some(request) = self.get_request(request_id).await? else {
            return Ok(None);
        };
        if request.state.is_terminal() {
            return Ok(None);
        }

        let mut conn = self.get_conn().await?;
        let max_exclusive = format!("({}", request.position);
        let queued_ahead: u64 = conn
            .zcount(StoreKey::queue(&request.campaign_id), "-inf", &max_exclusive)
            .await
            .map_err(FlashdropError::from)?;
        let processing_ahead: u64 = conn
            .zcount(
                StoreKey::processing(&request.campaign_id),
                "-inf",
                &max_exclusive,
            )
            .await
            .map_err(FlashdropError::from)?;
        Ok(Some(queued_ahead + processing_ahead))
    }

    async fn pending_campaigns(&self) -> Result<Vec<String>> {
        let mut conn = self.get_conn().await?;
        let campaigns: Vec<String> = conn
            .smembers(StoreKey::pending_campaigns())
            .await
            .map_err(FlashdropError::from)?;

        let mut pending = Vec::new();
        for campaign_id in campaigns {
            // 已排空的活动顺手摘除，避免集合无限膨胀
            let busy: i64 = Script::new(PRUNE_PENDING_SCRIPT)
                .key(StoreKey::queue(&campaign_id))
                .key(StoreKey::processing(&campaign_id))
                .key(StoreKey::pending_campaigns())
                .arg(&campaign_id)
                .invoke_async(&mut conn)
                .await
                .map_err(FlashdropError::from)?;
            if busy == 1 {
                pending.push(campaign_id);
            }
        }
        Ok(pending)
    }

    async fn close_campaign(&self, campaign_id: &str) -> Result<()> {
        let mut conn = self.get_conn().await?;

        // 先清掉请求详情与反向索引。用 SCAN 游标分批枚举，
        // 大活动的关闭不能用 KEYS 阻塞整个共享实例
        let prefix = StoreKey::request_prefix(campaign_id);
        let pattern = format!("{prefix}*");
        let mut request_keys: Vec<String> = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await
                .map_err(FlashdropError::from)?;
            request_keys.extend(keys);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        for key in &request_keys {
            if let Some(request_id) = key.strip_prefix(&prefix) {
                let _: i64 = conn
                    .del(StoreKey::request_index(request_id))
                    .await
                    .map_err(FlashdropError::from)?;
            }
        }
        if !request_keys.is_empty() {
            let _: i64 = conn.del(request_keys).await.map_err(FlashdropError::from)?;
        }

        let _: i64 = conn
            .del(vec![
                StoreKey::capacity(campaign_id),
                StoreKey::dedup(campaign_id),
                StoreKey::queue(campaign_id),
                StoreKey::processing(campaign_id),
            ])
            .await
            .map_err(FlashdropError::from)?;
        let _: i64 = conn
            .srem(StoreKey::pending_campaigns(), campaign_id)
            .await
            .map_err(FlashdropError::from)?;

        debug!(campaign_id, "活动存储状态已销毁");
        Ok(())
    }
}
