//! Child-process supervision for tools: bounded ring-buffered output
//! capture (pipe or PTY), auto-restart with a retry budget, a janitor for
//! exited processes, and the workdir jail used by path-taking tools.

pub mod error;
pub mod jail;
pub mod manager;
pub mod process;
pub mod ring;
pub mod types;

pub use error::{Result, SupervisorError};
pub use jail::Jail;
pub use manager::Supervisor;
pub use ring::RingBuffer;
pub use types::{LogSlice, ProcessInfo, ProcessSpec, ProcessStatus};
