//! 上下文同步：实体事件 → 作用域快照
//!
//! - event：后端推送的实体变更事件
//! - snapshot：按作用域维护的服务 / 表单 / 工作流 / 报名集合
//! - synchronizer：幂等应用事件的单写者同步器
//! - feed：事件源接入与断线重连
//! - hub：多作用域订阅管理

pub mod event;
pub mod feed;
pub mod hub;
pub mod snapshot;
pub mod synchronizer;

pub use event::{EntityAction, EntityEvent, EntityKind};
pub use feed::{EventSource, FeedStatus, FeedSupervisor, ReconnectPolicy};
pub use hub::SyncHub;
pub use snapshot::{ContextSnapshot, SnapshotSummary};
pub use synchronizer::{run_worker, ApplyOutcome, ContextSynchronizer, SyncCommand};
