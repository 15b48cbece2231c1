//! Director mode: per-frame human review running beside (not inside) the
//! orchestrator FSM. The session store owns its own persistence contract;
//! the HTTP surface is loopback-only.

pub mod http;
pub mod server;
pub mod session;

pub use server::{DirectorEvent, DirectorServer};
pub use session::{
    DirectorFrame, DirectorFrameStatus, DirectorSession, Nudge, PatchRecord, SessionStatus,
    SessionStore,
};
