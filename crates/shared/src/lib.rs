//! 共享库
//!
//! 包含发放引擎与上层服务共用的配置、错误处理、
//! 可观测性初始化以及 Redis 键名约定等基础设施代码。

pub mod config;
pub mod error;
pub mod keys;
pub mod observability;
