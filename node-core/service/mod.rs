//! The per-service execution tree: module arena, timer dispatcher, event
//! bus, handler table, and the single-threaded loop that drains them.

pub mod context;
pub mod events;
pub mod handler;
pub mod module;
pub mod timer;
pub mod tree;
pub mod worker;

pub use context::ServiceContext;
pub use handler::Handler;
pub use module::ModuleId;
pub use tree::{CallCallback, LoopHandle, Service, ServiceState};
