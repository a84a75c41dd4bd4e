//! Session control: one work loop on its own task, steered through a handle

mod controller;
mod timeout;

pub use controller::{SessionConfig, SessionController, SessionHandle, SessionSpec};
pub use timeout::TimeoutPolicy;
