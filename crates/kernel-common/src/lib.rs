//! Types shared between the kernel-event acquisition layer and the
//! correlation engine: monotonic kernel timestamps, process identity
//! keys, the raw message shapes with structural validation and the
//! procfs scanning used to seed the process table on startup.

pub mod msg;
pub mod procfs;
pub mod time;

pub use msg::{Credentials, ExecveMsg, ExitMsg, KernelMsg, MsgError, Namespaces, ProcessKey};
pub use time::Timestamp;

pub use nix::unistd::Pid;
