//! 准入控制：一次提交是新建、复用还是被阻塞
//!
//! 判定顺序（在 (session, user) 互斥锁内完成，检查与创建之间无竞态）：
//! 1. 同会话存在相同输入、且其关联执行仍活跃的交互 → Reused（合并双击 / 重试）
//! 2. 该 (session, user) 带有未消费的重连标记，且标记指向当前活跃执行 → Reused（恢复的客户端不会误判为重复提交）
//! 3. 该 (session, user) 存在活跃执行（含工作流子执行）→ Blocked
//! 4. 否则创建执行与交互 → Accepted
//!
//! 「活跃」指非终态且 `updated_at` 在过期窗口内；过期执行被忽略，但不会被自动取消。
//! 工作流子执行同样占用会话：父执行已结束而子执行仍在运行时，新提交被子执行阻塞。

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use chrono::Utc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::info;

use crate::core::{ExecutionContext, Result, SessionKey, SessionMarkers};
use crate::registry::{Execution, ExecutionRegistry, Interaction, NewExecution};

/// 准入结果
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// 新建了执行与交互
    Accepted { execution: Execution, interaction: Interaction },
    /// 复用已有的在途工作
    Reused { execution: Execution, interaction: Interaction },
    /// 被活跃执行阻塞
    Blocked { execution: Execution },
}

impl Admission {
    pub fn execution(&self) -> &Execution {
        match self {
            Self::Accepted { execution, .. } | Self::Reused { execution, .. } | Self::Blocked { execution } => execution,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Accepted { .. } => "accepted",
            Self::Reused { .. } => "reused",
            Self::Blocked { .. } => "blocked",
        }
    }
}

/// 准入控制器
pub struct AdmissionController {
    registry: ExecutionRegistry,
    markers: Arc<SessionMarkers>,
    locks: StdMutex<HashMap<SessionKey, Arc<Mutex<()>>>>,
    stale_after: chrono::Duration,
}

impl AdmissionController {
    pub fn new(registry: ExecutionRegistry, markers: Arc<SessionMarkers>, stale_after_secs: u64) -> Self {
        Self {
            registry,
            markers,
            locks: StdMutex::new(HashMap::new()),
            stale_after: stale_window(stale_after_secs),
        }
    }

    /// 获取 (session, user) 互斥锁；顺带回收无人持有的锁
    async fn lock(&self, key: &SessionKey) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            locks.retain(|k, l| k == key || Arc::strong_count(l) > 1);
            Arc::clone(locks.entry(key.clone()).or_default())
        };
        lock.lock_owned().await
    }

    /// 准入判定并在需要时创建执行（初始 pending）与关联交互
    pub async fn submit(&self, ctx: &ExecutionContext, input: &str, max_steps: u32) -> Result<Admission> {
        let _guard = self.lock(&ctx.key()).await;

        if let Some(existing) = self.decide(ctx, input, true).await? {
            info!(
                session_id = %ctx.session_id,
                execution_id = %existing.execution().id,
                decision = existing.kind(),
                "submission not admitted as new work"
            );
            return Ok(existing);
        }

        let execution = self
            .registry
            .create(NewExecution {
                session_id: ctx.session_id.clone(),
                user_id: ctx.user_id.clone(),
                strategy: ctx.strategy,
                input: input.to_string(),
                max_steps,
                tool_override: ctx.tool_override.clone(),
                parent_execution_id: ctx.parent_execution_id.clone(),
            })
            .await?;

        let mut interaction = Interaction::new(&ctx.session_id, &ctx.user_id, input);
        self.registry.create_interaction(&interaction).await?;
        self.registry.link_interaction(&interaction.id, &execution.id).await?;
        interaction.execution_id = Some(execution.id.clone());

        info!(
            session_id = %ctx.session_id,
            execution_id = %execution.id,
            strategy = %ctx.strategy,
            "submission accepted"
        );
        Ok(Admission::Accepted { execution, interaction })
    }

    /// 只读预判：返回 None 表示会被接受；不消费重连标记
    pub async fn evaluate(&self, ctx: &ExecutionContext, input: &str) -> Result<Option<Admission>> {
        self.decide(ctx, input, false).await
    }

    async fn decide(&self, ctx: &ExecutionContext, input: &str, consume_marker: bool) -> Result<Option<Admission>> {
        let now = Utc::now();

        // 1. 相同输入的在途交互
        for interaction in self.registry.find_interactions_by_question(&ctx.session_id, input).await? {
            if interaction.user_id != ctx.user_id {
                continue;
            }
            let Some(exec_id) = interaction.execution_id.as_deref() else {
                continue;
            };
            if let Some(execution) = self.registry.get(exec_id).await? {
                if execution.is_fresh(self.stale_after, now) {
                    return Ok(Some(Admission::Reused { execution, interaction }));
                }
            }
        }

        let active = self.fresh_active(ctx, now).await?;

        // 2. 重连标记（一次性）
        let marker = if consume_marker {
            self.markers.take(&ctx.key()).await
        } else {
            None
        };
        if let (Some(marker), Some(execution)) = (marker, active.as_ref()) {
            if marker.execution_id == execution.id {
                if let Some(interaction) = self.registry.interaction(&marker.interaction_id).await? {
                    return Ok(Some(Admission::Reused {
                        execution: execution.clone(),
                        interaction,
                    }));
                }
            }
        }

        // 3. 其他活跃执行
        Ok(active.map(|execution| Admission::Blocked { execution }))
    }

    async fn fresh_active(&self, ctx: &ExecutionContext, now: chrono::DateTime<Utc>) -> Result<Option<Execution>> {
        Ok(self
            .registry
            .list_active_for_session(&ctx.session_id, &ctx.user_id)
            .await?
            .into_iter()
            .find(|e| e.is_fresh(self.stale_after, now)))
    }
}

/// 过期窗口；超出范围的配置值视为永不过期
fn stale_window(secs: u64) -> chrono::Duration {
    i64::try_from(secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .unwrap_or(chrono::Duration::MAX)
}
