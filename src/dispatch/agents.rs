//! Agent 解析：按 ID、类型或输入内容找到要执行的 Agent

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Agent 类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    /// 多 Agent 研究的统筹者
    Workflow,
    /// 通用对话
    Chat,
    /// 领域专家
    Specialist,
}

/// 解析出的 Agent 引用
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRef {
    pub id: String,
    pub name: String,
    pub kind: AgentKind,
    /// 该 Agent 配置的最大步数（SingleAgent 策略使用）
    pub max_steps: u32,
    /// 动态选择时匹配的标签
    #[serde(default)]
    pub tags: Vec<String>,
}

impl AgentRef {
    pub fn new(id: impl Into<String>, kind: AgentKind, max_steps: u32) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            kind,
            max_steps,
            tags: Vec::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_tags(mut self, tags: &[&str]) -> Self {
        self.tags = tags.iter().map(|t| t.to_string()).collect();
        self
    }
}

/// 解析请求
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentQuery<'a> {
    /// 指定 ID
    Id(&'a str),
    /// 指定类型
    Kind(AgentKind),
    /// 根据输入动态选择
    ForInput(&'a str),
    /// 任意可用 Agent
    Any,
}

/// Agent 解析接口（外部协作者）
#[async_trait]
pub trait AgentResolver: Send + Sync {
    async fn resolve(&self, query: AgentQuery<'_>) -> Option<AgentRef>;
}

/// 静态 Agent 目录
#[derive(Debug, Clone, Default)]
pub struct StaticAgentResolver {
    agents: Vec<AgentRef>,
}

impl StaticAgentResolver {
    pub fn new(agents: Vec<AgentRef>) -> Self {
        Self { agents }
    }

    pub fn with_agent(mut self, agent: AgentRef) -> Self {
        self.agents.push(agent);
        self
    }

    /// 标签命中数最多的 Agent；无命中时回退到第一个专家，再回退到第一个
    fn select_for_input(&self, input: &str) -> Option<AgentRef> {
        let input = input.to_lowercase();
        let best = self
            .agents
            .iter()
            .map(|a| {
                let hits = a.tags.iter().filter(|t| input.contains(&t.to_lowercase())).count();
                (hits, a)
            })
            .filter(|(hits, _)| *hits > 0)
            .max_by_key(|(hits, _)| *hits)
            .map(|(_, a)| a);

        best.or_else(|| self.agents.iter().find(|a| a.kind == AgentKind::Specialist))
            .or_else(|| self.agents.first())
            .cloned()
    }
}

#[async_trait]
impl AgentResolver for StaticAgentResolver {
    async fn resolve(&self, query: AgentQuery<'_>) -> Option<AgentRef> {
        match query {
            AgentQuery::Id(id) => self.agents.iter().find(|a| a.id == id).cloned(),
            AgentQuery::Kind(kind) => self.agents.iter().find(|a| a.kind == kind).cloned(),
            AgentQuery::ForInput(input) => self.select_for_input(input),
            AgentQuery::Any => self.agents.first().cloned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> StaticAgentResolver {
        StaticAgentResolver::default()
            .with_agent(AgentRef::new("chat", AgentKind::Chat, 5))
            .with_agent(AgentRef::new("coder", AgentKind::Specialist, 20).with_tags(&["rust", "code"]))
            .with_agent(AgentRef::new("writer", AgentKind::Specialist, 8).with_tags(&["essay"]))
    }

    #[tokio::test]
    async fn test_dynamic_selection_prefers_tag_hits() {
        let resolver = catalog();
        let agent = resolver.resolve(AgentQuery::ForInput("Review this Rust code")).await.unwrap();
        assert_eq!(agent.id, "coder");

        let fallback = resolver.resolve(AgentQuery::ForInput("hello")).await.unwrap();
        assert_eq!(fallback.id, "coder");
    }

    #[tokio::test]
    async fn test_lookup_by_id_and_kind() {
        let resolver = catalog();
        assert_eq!(resolver.resolve(AgentQuery::Id("writer")).await.unwrap().max_steps, 8);
        assert!(resolver.resolve(AgentQuery::Id("ghost")).await.is_none());
        assert!(resolver.resolve(AgentQuery::Kind(AgentKind::Workflow)).await.is_none());
        assert!(StaticAgentResolver::default().resolve(AgentQuery::Any).await.is_none());
    }
}
