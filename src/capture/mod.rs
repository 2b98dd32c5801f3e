//! The capture engine.
//!
//! The engine is split along the two execution contexts:
//!
//! ```text
//! control context                      mixing context
//! ───────────────                      ──────────────
//! Capturer (client calls)      wake    engine::run (decision loop)
//!   └── Shared state  ◄──── Notify ───►  └── mix pass → payload
//!         │                                    │
//!         └──── delivery channel ◄─────────────┘  (fire-and-forget)
//!                   │
//!            bridge::run_delivery → client callbacks
//! ```
//!
//! - **state**: the session lifecycle state machine
//! - **queue**: the pending/finished buffer lists and the bounded pool
//! - **engine**: the mixing loop, scheduling decisions, and teardown

pub(crate) mod engine;
pub(crate) mod queue;
mod state;

pub use state::CaptureState;
