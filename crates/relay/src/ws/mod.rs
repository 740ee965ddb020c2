// WebSocket transport for the playground coordinator.

pub mod handler;
pub mod protocol;


pub use handler::{router, CoordinatorState};
