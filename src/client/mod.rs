//! The client half of the bridge: a dispatch loop that owns the engine.
//!
//! - `registry` - id -> live engine object table
//! - `codec` - resolves handles in arguments, registers objects in results
//! - `dispatch` - the request state machine and `serve` loop

pub mod codec;
pub mod dispatch;
pub mod registry;

pub use dispatch::{serve, DispatchState, Dispatcher};
pub use registry::Registry;
