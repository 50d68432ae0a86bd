//! # Session Module
//!
//! The state machine that binds the channel, the render path and the capture path into
//! one conversation, plus the task and handle that run it.
//!
//! ## Key Components:
//! - **State**: lifecycle states and which transitions are legal
//! - **Stream**: the synchronous session logic
//! - **Handle**: tokio task with a biased command loop and a cloneable handle
//! - **Events**: broadcast observability events

pub mod event;  // Broadcast events
pub mod handle; // Task and handle
pub mod state;  // Lifecycle states
pub mod stream; // Session logic

pub use event::StreamEvent;
pub use handle::SessionHandle;
pub use state::SessionState;
pub use stream::{SessionInfo, StreamSession};
