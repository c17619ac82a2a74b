//! Actor front-end for the dispatcher
//!
//! Collectors submit records through a cloneable [`DispatchHandle`]; the
//! actor buffers them and dispatches on a size or time trigger.

pub mod dispatch;
pub mod messages;

pub use dispatch::{DispatchActor, DispatchHandle};
pub use messages::{DispatchCommand, DispatchStats};
