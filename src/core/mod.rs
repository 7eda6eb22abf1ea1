//! 核心协调层：状态存储、单槽邮箱、Worker 监管状态机、Dispatcher、恢复与关闭

pub mod dispatcher;
pub mod error;
pub mod mailbox;
pub mod orchestrator;
pub mod recovery;
pub mod shutdown;
pub mod state;
pub mod store;
pub mod supervisor;

pub use dispatcher::{CycleReport, Dispatcher};
pub use error::{FleetError, RecoveryAction, StateError};
pub use mailbox::{mailbox, Command, MailboxError, MailboxReceiver, MailboxSender, SendError};
pub use orchestrator::{
    create_executor, create_llm_from_config, Fleet, FleetMember, FleetReport, FleetSettings,
};
pub use recovery::RecoveryEngine;
pub use shutdown::{
    run_with_graceful_shutdown, FleetStateReport, ShutdownCleanup, ShutdownCoordinator,
    ShutdownManager, ShutdownReason,
};
pub use state::{
    AgentState, AgentStatePatch, AgentStatus, Inventory, Position, Snapshot, StatusChange,
    Telemetry,
};
pub use store::{InMemoryStateStore, StateStore};
pub use supervisor::{WorkerExit, WorkerSupervisor};
