//! HTTP handlers
//!
//! One module per route group. Public tunnel traffic goes through
//! [`forwarding`]; the rest are broker control endpoints.

pub mod cleanup;
pub mod connect;
pub mod forwarding;
pub mod logs;
pub mod replay;
pub mod tunnels;


pub use cleanup::spawn_cleanup_task;
pub use connect::handle_connect;
pub use forwarding::handle_forwarding;
pub use logs::list_logs;
pub use replay::handle_replay;
pub use tunnels::{health, list_tunnels};
