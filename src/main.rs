use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use clap::Parser;

use sprite_pipeline::director::{DirectorEvent, DirectorServer, DirectorSession, SessionStore};
use sprite_pipeline::{
    detect, detect_by_id, exit_code_for_run, stderr_line, stdout_line, BackoffPolicy,
    GeminiGenerator, Generator, GridPacker, Manifest, Orchestrator, Packer, ReasonCode,
    ResumeOutcome, RunStore, ScriptedGenerator, TexturePackerCli, Tone,
};

mod cli;

use crate::cli::{Cli, CommandKind};

fn main() -> ExitCode {
    // A .env file is honored for GEMINI_API_KEY and friends.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    if let Some(mode) = cli.color {
        sprite_pipeline::set_color_mode(mode);
    }

    match cli.command {
        CommandKind::Run {
            manifest,
            resume,
            force,
            runs_root,
            fresh,
            offline,
            no_pack,
        } => cmd_run(&manifest, resume.as_deref(), force, &runs_root, fresh, offline, no_pack),
        CommandKind::Status {
            run,
            runs_root,
            json,
        } => cmd_status(run.as_deref(), &runs_root, json),
        CommandKind::Pack {
            run,
            manifest,
            runs_root,
            grid,
        } => cmd_pack(&run, &manifest, &runs_root, grid),
        CommandKind::Director {
            run,
            manifest,
            runs_root,
            port,
        } => cmd_director(&run, &manifest, &runs_root, port),
        CommandKind::Doctor { runs_root } => cmd_doctor(&runs_root),
    }
}

fn load_manifest(path: &Path) -> Result<Manifest, ExitCode> {
    let manifest = match Manifest::load(path) {
        Ok(m) => m,
        Err(e) => {
            stderr_line(Tone::Error, &format!("pipeline: error: {e}"));
            return Err(ExitCode::from(sprite_pipeline::exit_code_for_io_error(&e)));
        }
    };
    if let Err(errors) = manifest.validate() {
        for e in &errors {
            stderr_line(Tone::Error, &format!("pipeline: manifest: {e}"));
        }
        return Err(ExitCode::from(1));
    }
    Ok(manifest)
}

#[allow(clippy::too_many_arguments)]
fn cmd_run(
    manifest_path: &Path,
    resume: Option<&str>,
    force: bool,
    runs_root: &Path,
    fresh: bool,
    offline: bool,
    no_pack: bool,
) -> ExitCode {
    let manifest = match load_manifest(manifest_path) {
        Ok(m) => m,
        Err(code) => return code,
    };

    let outcome = if let Some(run_id) = resume {
        detect_by_id(runs_root, run_id, &manifest, force)
    } else if fresh {
        Ok(ResumeOutcome::Fresh)
    } else {
        detect(runs_root, &manifest, force)
    };
    let outcome = match outcome {
        Ok(o) => o,
        Err(e) => {
            stderr_line(Tone::Error, &format!("pipeline: error: {e}"));
            return ExitCode::from(sprite_pipeline::exit_code_for_io_error(&e));
        }
    };

    let (store, resumed_state) = match outcome {
        ResumeOutcome::AlreadyCompleted { run_id } => {
            stderr_line(
                Tone::Info,
                &format!("pipeline: run {run_id} already completed; nothing to do"),
            );
            return ExitCode::SUCCESS;
        }
        ResumeOutcome::HashMismatch {
            run_id,
            stored,
            current,
        } => {
            stderr_line(
                Tone::Error,
                &format!(
                    "pipeline: {}: run {run_id} was created from manifest {stored}, current is {current} (use --force to override)",
                    ReasonCode::SysManifestInvalid.as_str()
                ),
            );
            return ExitCode::from(1);
        }
        ResumeOutcome::Resume(decision) => {
            for frame in &decision.demoted {
                stderr_line(
                    Tone::Warn,
                    &format!(
                        "pipeline: approved frame {frame} missing on disk; it will be regenerated"
                    ),
                );
            }
            stderr_line(
                Tone::Info,
                &format!(
                    "pipeline: resuming run {} at frame {}",
                    decision.run_id, decision.first_pending_frame
                ),
            );
            match RunStore::open(&decision.run_dir) {
                Ok(store) => (store, Some(decision.state)),
                Err(e) => {
                    stderr_line(Tone::Error, &format!("pipeline: error: {e}"));
                    return ExitCode::from(1);
                }
            }
        }
        ResumeOutcome::Fresh => {
            let run_id =
                sprite_pipeline::util::id::create_run_id(&manifest.character, &manifest.move_id);
            match RunStore::create(runs_root, &run_id) {
                Ok(store) => (store, None),
                Err(e) => {
                    stderr_line(Tone::Error, &format!("pipeline: error: {e}"));
                    return ExitCode::from(1);
                }
            }
        }
    };

    let _log_guard = sprite_pipeline::logging::init_run_logging(&store.logs_dir());

    let mut generator: Box<dyn Generator> = if offline {
        match offline_generator(&manifest) {
            Ok(g) => Box::new(g),
            Err(e) => {
                stderr_line(Tone::Error, &format!("pipeline: error: {e}"));
                return ExitCode::from(1);
            }
        }
    } else {
        match GeminiGenerator::from_env(&manifest.generation.model_id) {
            Ok(g) => Box::new(g),
            Err(e) => {
                stderr_line(
                    Tone::Error,
                    &format!(
                        "pipeline: {}: {e}",
                        ReasonCode::DepApiUnavailable.as_str()
                    ),
                );
                return ExitCode::from(1);
            }
        }
    };

    let abort = Arc::new(AtomicBool::new(false));
    let export_dir = store.export_dir();
    let orchestrator = Orchestrator::new(
        &manifest,
        generator.as_mut(),
        store,
        resumed_state,
        Arc::clone(&abort),
        BackoffPolicy::default(),
    );
    let mut orchestrator = match orchestrator {
        Ok(o) => o,
        Err(e) => {
            stderr_line(Tone::Error, &format!("pipeline: error: {e}"));
            return ExitCode::from(sprite_pipeline::exit_code_for_io_error(&e));
        }
    };

    let outcome = match orchestrator.run() {
        Ok(o) => o,
        Err(e) => {
            stderr_line(Tone::Error, &format!("pipeline: error: {e}"));
            return ExitCode::from(1);
        }
    };

    let status = sprite_pipeline::live_status(&outcome.state, None);
    let line = sprite_pipeline::status_line(&status);
    let tone = match outcome.status {
        sprite_pipeline::RunStatus::Completed => Tone::Info,
        _ => Tone::Warn,
    };
    stderr_line(tone, &format!("pipeline: {line}"));

    if outcome.status == sprite_pipeline::RunStatus::Completed && !no_pack {
        let approved: Vec<PathBuf> = (0..outcome.state.total_frames)
            .filter_map(|i| {
                let f = outcome.state.frame(i);
                (f.status == sprite_pipeline::FrameStatus::Approved)
                    .then(|| runs_root.join(&outcome.run_id).join(format!("approved/frame_{i:04}.png")))
            })
            .collect();
        if let Err(e) = pack_frames(&manifest, &approved, &export_dir, false) {
            stderr_line(
                Tone::Warn,
                &format!(
                    "pipeline: {}: {e}",
                    ReasonCode::DepTexturepackerFail.as_str()
                ),
            );
        } else {
            stderr_line(
                Tone::Info,
                &format!("pipeline: atlas written to {}", export_dir.display()),
            );
        }
    }

    ExitCode::from(exit_code_for_run(&outcome.status))
}

/// Offline generator: replays the anchor upscaled to generation size, so the
/// whole pipeline can be exercised without an API key.
fn offline_generator(manifest: &Manifest) -> std::io::Result<ScriptedGenerator> {
    let bytes = std::fs::read(&manifest.anchor)?;
    let img = image::load_from_memory(&bytes)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?
        .to_rgba8();
    let up = image::imageops::resize(
        &img,
        manifest.generation_size,
        manifest.generation_size,
        image::imageops::FilterType::Nearest,
    );
    let png = sprite_pipeline::orchestrator::encode_png(&up)?;
    Ok(ScriptedGenerator::repeating(png))
}

fn pack_frames(
    manifest: &Manifest,
    approved: &[PathBuf],
    export_dir: &Path,
    force_grid: bool,
) -> Result<(), String> {
    let result = if force_grid {
        GridPacker {
            frame_size: manifest.target_size,
        }
        .pack(approved, export_dir, &manifest.character, &manifest.move_id)
    } else {
        match TexturePackerCli::discover() {
            Ok(tp) => tp.pack(approved, export_dir, &manifest.character, &manifest.move_id),
            Err(_) => GridPacker {
                frame_size: manifest.target_size,
            }
            .pack(approved, export_dir, &manifest.character, &manifest.move_id),
        }
    };
    result.map(|_| ()).map_err(|e| e.to_string())
}

fn resolve_run_dir(run: Option<&str>, runs_root: &Path) -> std::io::Result<PathBuf> {
    match run {
        Some(id) => {
            let dir = runs_root.join(id);
            if dir.is_dir() {
                Ok(dir)
            } else {
                Err(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("run {id} not found under {}", runs_root.display()),
                ))
            }
        }
        None => {
            let mut newest: Option<(std::time::SystemTime, PathBuf)> = None;
            for entry in std::fs::read_dir(runs_root)? {
                let entry = entry?;
                let path = entry.path();
                if !path.join("state.json").is_file() {
                    continue;
                }
                let mtime = entry
                    .metadata()
                    .and_then(|m| m.modified())
                    .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
                if newest.as_ref().map(|(t, _)| mtime > *t).unwrap_or(true) {
                    newest = Some((mtime, path));
                }
            }
            newest.map(|(_, p)| p).ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("no runs under {}", runs_root.display()),
                )
            })
        }
    }
}

fn cmd_status(run: Option<&str>, runs_root: &Path, json: bool) -> ExitCode {
    let dir = match resolve_run_dir(run, runs_root) {
        Ok(d) => d,
        Err(e) => {
            stderr_line(Tone::Error, &format!("pipeline: error: {e}"));
            return ExitCode::from(sprite_pipeline::exit_code_for_io_error(&e));
        }
    };
    let state: sprite_pipeline::RunState =
        match sprite_pipeline::util::fs::read_json(&dir.join("state.json")) {
            Ok(s) => s,
            Err(e) => {
                stderr_line(Tone::Error, &format!("pipeline: error: {e}"));
                return ExitCode::from(1);
            }
        };
    let status = sprite_pipeline::live_status(&state, None);
    if json {
        match serde_json::to_string_pretty(&status) {
            Ok(s) => println!("{s}"),
            Err(e) => {
                stderr_line(Tone::Error, &format!("pipeline: error: {e}"));
                return ExitCode::from(1);
            }
        }
    } else {
        let tone = match status.status.as_str() {
            "completed" => Tone::Info,
            "in-progress" => Tone::Info,
            "stopped" => Tone::Warn,
            _ => Tone::Error,
        };
        stdout_line(tone, &sprite_pipeline::status_line(&status));
    }
    ExitCode::SUCCESS
}

fn cmd_pack(run: &str, manifest_path: &Path, runs_root: &Path, grid: bool) -> ExitCode {
    let manifest = match load_manifest(manifest_path) {
        Ok(m) => m,
        Err(code) => return code,
    };
    let run_dir = runs_root.join(run);
    let state: sprite_pipeline::RunState =
        match sprite_pipeline::util::fs::read_json(&run_dir.join("state.json")) {
            Ok(s) => s,
            Err(e) => {
                stderr_line(Tone::Error, &format!("pipeline: error: {e}"));
                return ExitCode::from(sprite_pipeline::exit_code_for_io_error(&e));
            }
        };
    let approved: Vec<PathBuf> = state
        .frame_states
        .iter()
        .filter(|f| f.status == sprite_pipeline::FrameStatus::Approved)
        .filter_map(|f| f.approved_path.as_ref().map(|p| run_dir.join(p)))
        .collect();
    if approved.is_empty() {
        stderr_line(Tone::Error, "pipeline: no approved frames to pack");
        return ExitCode::from(1);
    }
    match pack_frames(&manifest, &approved, &run_dir.join("export"), grid) {
        Ok(()) => {
            stderr_line(
                Tone::Info,
                &format!("pipeline: atlas written to {}", run_dir.join("export").display()),
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            stderr_line(
                Tone::Error,
                &format!(
                    "pipeline: {}: {e}",
                    ReasonCode::DepTexturepackerFail.as_str()
                ),
            );
            ExitCode::from(1)
        }
    }
}

fn cmd_director(run: &str, manifest_path: &Path, runs_root: &Path, port: u16) -> ExitCode {
    let manifest = match load_manifest(manifest_path) {
        Ok(m) => m,
        Err(code) => return code,
    };
    let run_dir = runs_root.join(run);
    if !run_dir.is_dir() {
        stderr_line(
            Tone::Error,
            &format!("pipeline: error: run {run} not found under {}", runs_root.display()),
        );
        return ExitCode::from(127);
    }
    let session_path = run_dir.join("director_session.json");
    let store = if session_path.is_file() {
        match SessionStore::load(&session_path) {
            Ok(s) => s,
            Err(e) => {
                stderr_line(
                    Tone::Error,
                    &format!(
                        "pipeline: {}",
                        sprite_pipeline::errors::display_for_session_error(&e)
                    ),
                );
                return ExitCode::from(1);
            }
        }
    } else {
        let session = DirectorSession::new(run, &manifest.move_id, manifest.total_frames);
        match SessionStore::create(&session_path, session) {
            Ok(s) => s,
            Err(e) => {
                stderr_line(
                    Tone::Error,
                    &format!(
                        "pipeline: {}",
                        sprite_pipeline::errors::display_for_session_error(&e)
                    ),
                );
                return ExitCode::from(1);
            }
        }
    };

    let mask_dir = run_dir.join("director_masks");
    let server = match DirectorServer::start(Arc::new(Mutex::new(store)), mask_dir, port) {
        Ok(s) => s,
        Err(e) => {
            stderr_line(Tone::Error, &format!("pipeline: error: {e}"));
            return ExitCode::from(1);
        }
    };
    stderr_line(
        Tone::Info,
        &format!("pipeline: director listening on http://{}", server.addr()),
    );
    stderr_line(
        Tone::Info,
        "pipeline: waiting for review (POST /api/commit or /api/discard)",
    );

    // Block until the reviewer commits or discards the session.
    match server.events.recv() {
        Ok(DirectorEvent::Commit { session_id }) => {
            stderr_line(Tone::Info, &format!("pipeline: session {session_id} committed"));
            server.shutdown();
            ExitCode::SUCCESS
        }
        Ok(DirectorEvent::Discard { session_id }) => {
            stderr_line(Tone::Warn, &format!("pipeline: session {session_id} discarded"));
            server.shutdown();
            ExitCode::SUCCESS
        }
        Err(_) => {
            stderr_line(Tone::Error, "pipeline: director server terminated unexpectedly");
            ExitCode::from(1)
        }
    }
}

fn cmd_doctor(runs_root: &Path) -> ExitCode {
    eprintln!("pipeline doctor");
    eprintln!();
    eprintln!("  version: v{}", env!("CARGO_PKG_VERSION"));
    eprintln!(
        "  host:    {} / {}",
        std::env::consts::OS,
        std::env::consts::ARCH
    );
    eprintln!();

    let key = std::env::var("GEMINI_API_KEY")
        .or_else(|_| std::env::var("SPRITE_PIPELINE_API_KEY"))
        .is_ok();
    eprintln!(
        "  generator api key: {}",
        if key { "present" } else { "MISSING (set GEMINI_API_KEY or use --offline)" }
    );

    match which::which("TexturePacker").or_else(|_| which::which("texturepacker")) {
        Ok(p) => eprintln!("  texture packer:    {}", p.display()),
        Err(_) => eprintln!("  texture packer:    not found (built-in grid packer will be used)"),
    }

    let writable = std::fs::create_dir_all(runs_root)
        .and_then(|_| {
            let probe = runs_root.join(".doctor-probe");
            std::fs::write(&probe, b"ok")?;
            std::fs::remove_file(&probe)
        })
        .is_ok();
    eprintln!(
        "  runs root:         {} ({})",
        runs_root.display(),
        if writable { "writable" } else { "NOT WRITABLE" }
    );
    eprintln!();
    if writable {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    }
}
