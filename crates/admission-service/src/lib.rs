//! 限量准入与履约引擎
//!
//! 处理限量优惠券发放、先到先得排队等稀缺资源抢占场景：
//! 大量并发请求竞争少量配额时，保证每个请求者最多占用一个名额、
//! 总发放量不超过配置容量、准入顺序公平可查，并将昂贵的持久化写入
//! 从准入热路径上解耦到异步批量履约 Worker。

pub mod error;
pub mod gate;
pub mod models;
pub mod ports;
pub mod status;
pub mod store;
pub mod worker;

pub use error::{AdmissionError, Result};
pub use gate::AdmissionGate;
pub use models::{AdmissionOutcome, AdmissionRequest, Campaign, RequestState};
pub use status::StatusService;
pub use worker::FulfillmentWorker;
