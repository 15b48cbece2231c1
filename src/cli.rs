use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "pipeline",
    version,
    about = "Sprite-sheet animation pipeline: generate, audit, retry, align, pack"
)]
pub(crate) struct Cli {
    #[command(subcommand)]
    pub command: CommandKind,

    /// Colorize output: auto|always|never
    #[arg(long = "color", value_enum, global = true)]
    pub color: Option<sprite_pipeline::ColorMode>,
}

#[derive(Subcommand, Debug)]
pub(crate) enum CommandKind {
    /// Generate all frames of a move, resuming a prior run when one matches
    Run {
        /// Manifest YAML describing the (character, move) job
        #[arg(long)]
        manifest: PathBuf,
        /// Resume a specific run id instead of scanning runs/
        #[arg(long)]
        resume: Option<String>,
        /// Override the manifest-hash check when resuming
        #[arg(long)]
        force: bool,
        /// Root directory holding run folders
        #[arg(long = "runs-root", default_value = "runs")]
        runs_root: PathBuf,
        /// Never start a run automatically from a prior one; always fresh
        #[arg(long)]
        fresh: bool,
        /// Use the offline scripted generator (no API key required)
        #[arg(long)]
        offline: bool,
        /// Skip atlas packing after a successful run
        #[arg(long = "no-pack")]
        no_pack: bool,
    },

    /// Report the status of a run (latest by default)
    Status {
        /// Run id; defaults to the most recently modified run
        #[arg(long)]
        run: Option<String>,
        #[arg(long = "runs-root", default_value = "runs")]
        runs_root: PathBuf,
        /// Emit machine-readable JSON
        #[arg(long)]
        json: bool,
    },

    /// Pack approved frames of a finished run into a texture atlas
    Pack {
        /// Run id to pack
        #[arg(long)]
        run: String,
        /// Manifest YAML the run was produced from
        #[arg(long)]
        manifest: PathBuf,
        #[arg(long = "runs-root", default_value = "runs")]
        runs_root: PathBuf,
        /// Force the built-in grid packer even when TexturePacker is installed
        #[arg(long)]
        grid: bool,
    },

    /// Serve the Director review surface for a run (localhost only)
    Director {
        /// Run id to review
        #[arg(long)]
        run: String,
        /// Manifest YAML the run was produced from
        #[arg(long)]
        manifest: PathBuf,
        #[arg(long = "runs-root", default_value = "runs")]
        runs_root: PathBuf,
        /// Port to bind on 127.0.0.1 (0 = ephemeral)
        #[arg(long, default_value_t = 0)]
        port: u16,
    },

    /// Run diagnostics: API key, packer availability, runs root
    Doctor {
        #[arg(long = "runs-root", default_value = "runs")]
        runs_root: PathBuf,
    },
}
