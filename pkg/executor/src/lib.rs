pub mod channel;
mod executor;
mod join_handle;
pub mod oneshot;
mod poller;
mod supervisor;
mod task;
mod thread_local;
mod timer;

pub use executor::{run, spawn, TaskId};
pub use join_handle::JoinHandle;
pub use poller::{close_io, wait_io, Interest, IoEvent, IoEventFuture};
pub use supervisor::{
    current_supervisor, spawn_supervised, spawn_with_supervisor, supervisor_channel, TaskOutcome,
};
pub use timer::{sleep, timeout, Sleep, Timeout};
