//! Hive - Agent 执行编排核心
//!
//! 把用户提交转换为受管理的 Agent 执行：准入去重、策略分发、队列交付、进度日志、断线重连与取消。
//! 真实的 LLM / 工具执行在核心之外，通过队列与 worker 接口接入。
//!
//! 模块划分：
//! - **core**: 执行上下文、状态格、错误类型、重连标记
//! - **registry**: Execution / Interaction 注册表与状态机（内存 / SQLite 存储）
//! - **status**: 每个交互的追加式进度日志 + 广播
//! - **admission**: 准入控制（新建 / 复用 / 阻塞）
//! - **dispatch**: 三种执行策略的分发与 Agent 解析
//! - **queue**: 作业队列接口与进程内实现、worker
//! - **reconnect**: 断线重连
//! - **cancel**: 取消执行与批次
//! - **orchestrator**: 组装与对外门面
//! - **config** / **observability**: 配置加载与日志

pub mod admission;
pub mod cancel;
pub mod config;
pub mod core;
pub mod dispatch;
pub mod observability;
pub mod orchestrator;
pub mod queue;
pub mod reconnect;
pub mod registry;
pub mod status;

pub use crate::core::{ExecutionContext, ExecutionState, OrchestratorError, Strategy};
pub use crate::dispatch::DispatchOutcome;
pub use crate::orchestrator::{ExecutionSnapshot, Orchestrator, OrchestratorBuilder};
