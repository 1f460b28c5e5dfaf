//! 执行上下文：每次策略调用显式传入，取代进程级的会话 / 工具覆盖全局状态

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// 执行策略（封闭枚举，新增策略由编译器检查穷尽匹配）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// 多 Agent 研究：规划 → 执行 → 综合，经 research-coordinator 队列
    Holistic,
    /// 单 Agent 流式对话，不经队列
    Direct,
    /// 单 Agent 后台任务，独立队列
    SingleAgent,
}

impl Strategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Holistic => "holistic",
            Self::Direct => "direct",
            Self::SingleAgent => "single_agent",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "holistic" => Ok(Self::Holistic),
            "direct" => Ok(Self::Direct),
            "single_agent" => Ok(Self::SingleAgent),
            other => Err(format!("unknown strategy: {}", other)),
        }
    }
}

/// 工具覆盖：限制本次执行可用的工具 / MCP 服务器
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolOverride {
    pub enabled: bool,
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    #[serde(default)]
    pub allowed_servers: Vec<String>,
}

/// 准入锁与活跃索引的键
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub session_id: String,
    pub user_id: String,
}

impl SessionKey {
    pub fn new(session_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            user_id: user_id.into(),
        }
    }
}

/// 一次提交的完整上下文
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionContext {
    pub session_id: String,
    pub user_id: String,
    pub strategy: Strategy,
    /// 指定 Agent；为空时按策略解析
    pub agent_id: Option<String>,
    pub tool_override: Option<ToolOverride>,
    /// 工作流组合中的父执行
    pub parent_execution_id: Option<String>,
}

impl ExecutionContext {
    pub fn new(session_id: impl Into<String>, user_id: impl Into<String>, strategy: Strategy) -> Self {
        Self {
            session_id: session_id.into(),
            user_id: user_id.into(),
            strategy,
            agent_id: None,
            tool_override: None,
            parent_execution_id: None,
        }
    }

    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn with_tool_override(mut self, tool_override: ToolOverride) -> Self {
        self.tool_override = Some(tool_override);
        self
    }

    pub fn with_parent(mut self, parent_execution_id: impl Into<String>) -> Self {
        self.parent_execution_id = Some(parent_execution_id.into());
        self
    }

    pub fn key(&self) -> SessionKey {
        SessionKey::new(self.session_id.clone(), self.user_id.clone())
    }
}
