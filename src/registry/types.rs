//! 注册表记录：Execution、Interaction、StatusEvent

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{ExecutionState, Strategy, ToolOverride};

pub type ExecutionId = String;
pub type InteractionId = String;

/// 一次被追踪的 Agent 工作单元
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: ExecutionId,
    pub session_id: String,
    pub user_id: String,
    pub strategy: Strategy,
    pub state: ExecutionState,
    pub input: String,
    pub output: Option<String>,
    pub error: Option<String>,
    pub max_steps: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// 分发时写入的元数据快照（agent、队列、工具覆盖等）
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub tool_override: Option<ToolOverride>,
    pub parent_execution_id: Option<ExecutionId>,
    /// 作业队列中的批次
    pub batch_id: Option<String>,
}

impl Execution {
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// 非终态且在窗口内有更新
    pub fn is_fresh(&self, stale_after: chrono::Duration, now: DateTime<Utc>) -> bool {
        self.state.is_active() && now - self.updated_at <= stale_after
    }
}

/// 创建执行的参数
#[derive(Debug, Clone)]
pub struct NewExecution {
    pub session_id: String,
    pub user_id: String,
    pub strategy: Strategy,
    pub input: String,
    pub max_steps: u32,
    pub tool_override: Option<ToolOverride>,
    pub parent_execution_id: Option<ExecutionId>,
}

impl NewExecution {
    pub(crate) fn into_execution(self) -> Execution {
        let now = Utc::now();
        Execution {
            id: format!("exec_{}", uuid::Uuid::new_v4()),
            session_id: self.session_id,
            user_id: self.user_id,
            strategy: self.strategy,
            state: ExecutionState::Pending,
            input: self.input,
            output: None,
            error: None,
            max_steps: self.max_steps,
            created_at: now,
            updated_at: now,
            completed_at: None,
            metadata: serde_json::Map::new(),
            tool_override: self.tool_override,
            parent_execution_id: self.parent_execution_id,
            batch_id: None,
        }
    }
}

/// 用户可见的问答对
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interaction {
    pub id: InteractionId,
    pub session_id: String,
    pub user_id: String,
    pub question: String,
    pub answer: Option<String>,
    pub execution_id: Option<ExecutionId>,
    pub is_streaming: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Interaction {
    pub fn new(session_id: impl Into<String>, user_id: impl Into<String>, question: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: format!("int_{}", uuid::Uuid::new_v4()),
            session_id: session_id.into(),
            user_id: user_id.into(),
            question: question.into(),
            answer: None,
            execution_id: None,
            is_streaming: false,
            created_at: now,
            updated_at: now,
        }
    }
}

/// 进度事件来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    Orchestrator,
    Planner,
    Agent,
    Tool,
    Synthesizer,
    System,
}

impl EventSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Orchestrator => "orchestrator",
            Self::Planner => "planner",
            Self::Agent => "agent",
            Self::Tool => "tool",
            Self::Synthesizer => "synthesizer",
            Self::System => "system",
        }
    }
}

impl fmt::Display for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "orchestrator" => Ok(Self::Orchestrator),
            "planner" => Ok(Self::Planner),
            "agent" => Ok(Self::Agent),
            "tool" => Ok(Self::Tool),
            "synthesizer" => Ok(Self::Synthesizer),
            "system" => Ok(Self::System),
            other => Err(format!("unknown event source: {}", other)),
        }
    }
}

/// 追加写的进度记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEvent {
    /// 同一交互内的序号，从 1 开始
    pub seq: u64,
    pub interaction_id: InteractionId,
    pub source: EventSource,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: Option<u64>,
    pub significant: bool,
}

/// 追加前的事件（序号与时间戳由存储分配）
#[derive(Debug, Clone)]
pub struct NewStatusEvent {
    pub interaction_id: InteractionId,
    pub source: EventSource,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: Option<u64>,
    pub significant: bool,
}

impl NewStatusEvent {
    /// 时间戳保证严格递增：不晚于上一条时顺延 1 微秒
    pub(crate) fn into_event(self, seq: u64, last: Option<DateTime<Utc>>) -> StatusEvent {
        let timestamp = match last {
            Some(prev) if self.timestamp <= prev => prev + chrono::Duration::microseconds(1),
            _ => self.timestamp,
        };
        StatusEvent {
            seq,
            interaction_id: self.interaction_id,
            source: self.source,
            message: self.message,
            timestamp,
            duration_ms: self.duration_ms,
            significant: self.significant,
        }
    }
}
