//! Interpreter processes: spawning, stream I/O, liveness and the registry of
//! live handles.

mod handle;
mod registry;
mod status;

pub use handle::{ProcessHandle, StreamEvent, StreamKind};
pub use registry::{ProcessRegistry, RegistryEntry, SharedHandle};
pub use status::ProcessState;
