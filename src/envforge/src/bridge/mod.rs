/// Command bridge implementations and backend control plane operations.
pub mod backend;
pub mod process;

pub use backend::{BackendControl, BackendError};
pub use process::{decode_output, ProcessBridge};
