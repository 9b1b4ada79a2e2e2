// Process module - Instance lifecycle, restart policy and supervision

pub mod event;
pub mod monitor;
pub mod restart;
pub mod signal;
pub mod spawner;
pub mod supervisor;
pub mod types;

pub use event::{Event, EventReceiver, EventSender};
pub use monitor::{MemorySampler, ResourceMonitor, SystemSampler};
pub use restart::{
    ExitDecision, MemoryVerdict, RestartPolicy, RestartTracker, RetireReason, RESTART_WINDOW,
};
pub use spawner::{spawn_instance, SpawnedProcess};
pub use supervisor::{StopTarget, Supervisor, SupervisorHandle, SHUTDOWN_SLACK};
pub use types::{
    ExitRecord, InstanceId, InstanceSnapshot, InstanceState, ProcessInstance, StopReason,
    StopRequest,
};
