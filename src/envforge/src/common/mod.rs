/// Shared types and traits
///
/// Stage identifiers, command targets and the command bridge contract used by
/// every other module.
pub mod types;

pub use types::{BridgeError, CommandBridge, ExecResult, Stage, Target};
