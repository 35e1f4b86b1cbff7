//! 核心层：错误与失败分类、会话状态、会话监管

pub mod error;
pub mod recovery;
pub mod session_supervisor;
pub mod state;

pub use error::{CopilotError, Failure};
pub use recovery::{
    Backoff, ClassifiedFailure, ErrorClassifier, FailureCategory, RecoveryStrategy,
};
pub use session_supervisor::SessionSupervisor;
pub use state::SessionState;
