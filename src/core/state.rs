//! 执行状态机
//!
//! pending → planning → planned → executing → synthesizing → {completed | failed | cancelled}
//!
//! 只允许严格前进（可跳过中间阶段）；终态不可离开。

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// 执行状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Pending,
    Planning,
    Planned,
    Executing,
    Synthesizing,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionState {
    pub const ACTIVE: [ExecutionState; 5] = [
        ExecutionState::Pending,
        ExecutionState::Planning,
        ExecutionState::Planned,
        ExecutionState::Executing,
        ExecutionState::Synthesizing,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }

    /// 在格中的位置；三个终态同级
    fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Planning => 1,
            Self::Planned => 2,
            Self::Executing => 3,
            Self::Synthesizing => 4,
            Self::Completed | Self::Failed | Self::Cancelled => 5,
        }
    }

    /// 是否为合法的前进一步
    pub fn can_transition_to(self, next: ExecutionState) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Planning => "planning",
            Self::Planned => "planned",
            Self::Executing => "executing",
            Self::Synthesizing => "synthesizing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "planning" => Ok(Self::Planning),
            "planned" => Ok(Self::Planned),
            "executing" => Ok(Self::Executing),
            "synthesizing" => Ok(Self::Synthesizing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown execution state: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [ExecutionState; 8] = [
        ExecutionState::Pending,
        ExecutionState::Planning,
        ExecutionState::Planned,
        ExecutionState::Executing,
        ExecutionState::Synthesizing,
        ExecutionState::Completed,
        ExecutionState::Failed,
        ExecutionState::Cancelled,
    ];

    #[test]
    fn test_terminal_states_never_transition() {
        for from in ALL.iter().filter(|s| s.is_terminal()) {
            for to in ALL {
                assert!(!from.can_transition_to(to), "{} -> {}", from, to);
            }
        }
    }

    #[test]
    fn test_forward_moves_and_skips() {
        assert!(ExecutionState::Pending.can_transition_to(ExecutionState::Planning));
        assert!(ExecutionState::Pending.can_transition_to(ExecutionState::Executing));
        assert!(ExecutionState::Planning.can_transition_to(ExecutionState::Cancelled));
        assert!(!ExecutionState::Executing.can_transition_to(ExecutionState::Planning));
        assert!(!ExecutionState::Executing.can_transition_to(ExecutionState::Executing));
    }

    #[test]
    fn test_parse_roundtrip_of_names() {
        for s in ALL {
            assert_eq!(s.as_str().parse::<ExecutionState>().unwrap(), s);
        }
        assert!("running".parse::<ExecutionState>().is_err());
    }
}
