//! Sprite pipeline crate: generation-audit-retry orchestration for pixel-art
//! sprite-sheet animation against a fixed anchor sprite.
//!
//! Architecture
//! - Binary glue (src/main.rs) parses the CLI and dispatches run / status /
//!   pack / director / doctor into the library.
//! - The orchestrator FSM (orchestrator.rs) drives one frame at a time
//!   through generate -> post-process -> audit -> retry/approve, persisting
//!   run state atomically after every transition.
//! - Generator (remote image model), Auditor and Packer are capabilities
//!   injected into the orchestrator; alternate backends implement the same
//!   traits.
//!
//! Key modules
//! - manifest.rs: immutable job description + canonical 16-hex manifest hash.
//! - anchor.rs / postprocess.rs / audit::*: the imaging core (geometry,
//!   downsampling, transparency, alignment, hard gates, soft metrics).
//! - retry.rs / stop.rs: the corrective-action ladder and run-level halting.
//! - store.rs / resume.rs: run folder layout, advisory writer lock, atomic
//!   persistence, crash resumption.
//! - director::*: per-frame human review (session store + loopback HTTP).
//! - report.rs: live status, completion summary and post-mortem diagnostic.
//!
//! Environment invariants (documented for contributors)
//! - GEMINI_API_KEY (or SPRITE_PIPELINE_API_KEY): required by the HTTP
//!   generator adapter; a .env file is honored at binary startup.
//! - SPRITE_PIPELINE_API_BASE: endpoint override for test servers.
//! - SPRITE_PIPELINE_COLOR / NO_COLOR: crate-wide color control.
//! - RUST_LOG: filters the JSONL pipeline log (default "info").

pub mod anchor;
pub mod atlas;
pub mod audit;
pub mod codes;
pub mod color;
pub mod director;
pub mod errors;
pub mod generator;
pub mod logging;
pub mod manifest;
pub mod orchestrator;
pub mod pose;
pub mod postprocess;
pub mod prompt;
pub mod report;
pub mod resume;
pub mod retry;
pub mod state;
pub mod stop;
pub mod store;
pub mod util;

pub use anchor::{analyze_anchor, analyze_geometry, AnchorAnalysis, SpriteGeometry};
pub use atlas::{validate_atlas, AtlasDocument, GridPacker, Packer, TexturePackerCli};
pub use audit::{AuditReport, Auditor};
pub use codes::ReasonCode;
pub use color::{
    color_enabled_stderr, color_enabled_stdout, colorize, set_color_mode, stderr_line,
    stdout_line, ColorMode, Tone,
};
pub use errors::{exit_code_for_io_error, exit_code_for_run};
pub use generator::{
    gemini::GeminiGenerator, generate_with_backoff, scripted::ScriptedGenerator, BackoffPolicy,
    GeneratedImage, GenerateRequest, Generator, GeneratorError,
};
pub use manifest::Manifest;
pub use orchestrator::{transition_allowed, FsmState, Orchestrator, RunOutcome};
pub use report::{diagnose, live_status, status_line, summarize};
pub use resume::{detect, detect_by_id, ResumeDecision, ResumeOutcome};
pub use retry::{LadderState, RetryAction, RetryDecision};
pub use state::{AttemptRecord, FrameStatus, RunState, RunStatus};
pub use stop::StopEvaluator;
pub use store::{acquire_run_lock, ManifestLock, RunStore};
