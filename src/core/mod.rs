//! 核心类型：错误、执行状态机、执行上下文、会话标记

pub mod context;
pub mod error;
pub mod session;
pub mod state;

pub use context::{ExecutionContext, SessionKey, Strategy, ToolOverride};
pub use error::{OrchestratorError, Result};
pub use session::{ReconnectMarker, SessionMarkers};
pub use state::ExecutionState;
