//! Hive - 多 Agent 舰队协调核心
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 状态存储、单槽邮箱、Worker 监管状态机、Dispatcher、恢复与关闭
//! - **executor**: Task Executor 抽象与实现（HTTP / Mock）
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / DeepSeek / Mock）
//! - **observability**: 日志初始化
//! - **planner**: Planner Brain（提示词、计划解析、LLM 规划）

pub mod config;
pub mod core;
pub mod executor;
pub mod llm;
pub mod observability;
pub mod planner;

pub use crate::core::{Fleet, FleetReport};
