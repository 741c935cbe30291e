//! Redis 键名约定
//!
//! 所有共享存储使用的键在此统一生成，避免各处手写字符串导致键名漂移。
//! 每个活动（campaign）的状态分散在以下几类键中：
//!
//! - 容量计数 hash：max / issued / sold_out 三个字段
//! - 去重集合 set：已准入的 requester_id
//! - 等待队列 zset：score = position
//! - 处理中 zset：score = position（领取时刻记在请求详情里）
//! - 请求详情 string：每条请求独立成键，终态时直接设置 TTL 实现保留窗口

/// 共享存储键生成器
pub struct StoreKey;

impl StoreKey {
    /// 容量计数器（hash: max / issued / sold_out）
    pub fn capacity(campaign_id: &str) -> String {
        format!("adm:cap:{}", campaign_id)
    }

    /// 去重集合（set of requester_id）
    pub fn dedup(campaign_id: &str) -> String {
        format!("adm:dedup:{}", campaign_id)
    }

    /// 等待队列（zset, score = position）
    pub fn queue(campaign_id: &str) -> String {
        format!("adm:queue:{}", campaign_id)
    }

    /// 处理中集合（zset, score = position）
    pub fn processing(campaign_id: &str) -> String {
        format!("adm:processing:{}", campaign_id)
    }

    /// 单条请求详情（string，JSON 序列化）
    pub fn request(campaign_id: &str, request_id: &str) -> String {
        format!("{}{}", Self::request_prefix(campaign_id), request_id)
    }

    /// 请求详情键前缀，Lua 脚本内拼接 request_id 使用
    pub fn request_prefix(campaign_id: &str) -> String {
        format!("adm:req:{}:", campaign_id)
    }

    /// request_id -> campaign_id 反向索引（状态查询用）
    pub fn request_index(request_id: &str) -> String {
        format!("adm:idx:{}", request_id)
    }

    /// 有待处理条目的活动集合
    pub fn pending_campaigns() -> String {
        "adm:pending".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_key_generation() {
        assert_eq!(StoreKey::capacity("cmp-1"), "adm:cap:cmp-1");
        assert_eq!(StoreKey::dedup("cmp-1"), "adm:dedup:cmp-1");
        assert_eq!(StoreKey::queue("cmp-1"), "adm:queue:cmp-1");
        assert_eq!(StoreKey::processing("cmp-1"), "adm:processing:cmp-1");
        assert_eq!(StoreKey::request("cmp-1", "req-9"), "adm:req:cmp-1:req-9");
        assert_eq!(StoreKey::request_index("req-9"), "adm:idx:req-9");
        assert_eq!(StoreKey::pending_campaigns(), "adm:pending");
    }

    #[test]
    fn test_request_prefix_concatenation() {
        // Lua 脚本内用前缀 + request_id 还原完整键名
        let full = format!("{}{}", StoreKey::request_prefix("cmp-1"), "req-9");
        assert_eq!(full, StoreKey::request("cmp-1", "req-9"));
    }
}
