//! Shape-specific node handlers beyond the built-in start/exit/conditional
//! (those live directly in `handler.rs` — they need no external
//! collaborators).

pub mod codegen;
pub mod manager;
pub mod parallel;
pub mod tool_handler;
pub mod wait_human;

pub use codegen::CodegenHandler;
pub use manager::ManagerLoopHandler;
pub use parallel::{FanInHandler, ParallelHandler};
pub use tool_handler::ToolHandler;
pub use wait_human::HumanWaitHandler;
