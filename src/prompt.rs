//! Prompt composer: turns a frame descriptor, the current retry action and
//! the pose library into the ordered multi-part request for the Generator
//! ("Reference Sandwich": anchor truth first, previous frame second, command
//! last).

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::manifest::Manifest;
use crate::pose::FramePose;
use crate::retry::RetryAction;

/// Ordered request payload element. Ordering and labels are significant to
/// the oracle.
#[derive(Clone, PartialEq, Debug)]
pub enum Part {
    Text(String),
    InlineImage { mime: String, bytes: Vec<u8> },
}

#[derive(Copy, Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateKind {
    Master,
    Lock,
    Variation,
}

#[derive(Clone, PartialEq, Debug)]
pub struct ComposedPrompt {
    pub parts: Vec<Part>,
    pub seed: u32,
    pub template: TemplateKind,
    /// First 8 hex chars of SHA-256 over the concatenated text parts.
    pub prompt_hash: String,
}

pub const ANCHOR_LABEL: &str = "[IMAGE 1]: MASTER ANCHOR (IDENTITY TRUTH)";
pub const PREVIOUS_LABEL: &str = "[IMAGE 2]: PREVIOUS FRAME";
pub const HIERARCHY_CLAUSE: &str =
    "If IMAGE 2 conflicts with IMAGE 1 on identity, IMAGE 1 wins.";
pub const LOOP_CLOSURE_CLAUSE: &str =
    "This is the final frame; transition 85% toward IMAGE 1.";

/// Extra constraints appended when the ladder tightens the negative prompt.
const TIGHTENED_NEGATIVE: &str =
    "Use ONLY the exact colors present in IMAGE 1; introduce no new hues, \
     no shading variants, no highlights absent from IMAGE 1.";

/// Template selection. Attempt 1 establishes (master) or advances
/// (variation); retries either re-assert identity (lock) or re-shuffle
/// entropy (variation).
pub fn select_template(
    frame_index: u32,
    attempt_index: u32,
    retry_action: Option<RetryAction>,
) -> TemplateKind {
    if attempt_index <= 1 {
        return if frame_index == 0 {
            TemplateKind::Master
        } else {
            TemplateKind::Variation
        };
    }
    if frame_index == 0 {
        return TemplateKind::Lock;
    }
    match retry_action {
        Some(RetryAction::IdentityRescue)
        | Some(RetryAction::TightenNegative)
        | Some(RetryAction::ReAnchor) => TemplateKind::Lock,
        _ => TemplateKind::Variation,
    }
}

/// Deterministic attempt-1 seed: crc32 over `run_id || frame_index`, so two
/// runs of the same manifest replay identically when attempt 1 succeeds.
pub fn seed_for_attempt(run_id: &str, frame_index: u32, attempt_index: u32) -> u32 {
    if attempt_index <= 1 {
        let mut h = crc32fast::Hasher::new();
        h.update(run_id.as_bytes());
        h.update(&frame_index.to_le_bytes());
        h.finalize()
    } else {
        crate::util::id::random_seed()
    }
}

pub struct ComposeInput<'a> {
    pub manifest: &'a Manifest,
    pub run_id: &'a str,
    pub frame_index: u32,
    pub attempt_index: u32,
    pub anchor_png: &'a [u8],
    pub previous_png: Option<&'a [u8]>,
    pub retry_action: Option<RetryAction>,
    pub pose: Option<&'a FramePose>,
}

pub fn compose(input: &ComposeInput<'_>) -> ComposedPrompt {
    let template = select_template(input.frame_index, input.attempt_index, input.retry_action);
    let mut parts: Vec<Part> = Vec::with_capacity(6);

    parts.push(Part::Text(ANCHOR_LABEL.to_string()));
    parts.push(Part::InlineImage {
        mime: "image/png".to_string(),
        bytes: input.anchor_png.to_vec(),
    });

    // The previous frame is withheld when the retry re-asserts the anchor:
    // a drifting IMAGE 2 would keep pulling the oracle away from the truth.
    let suppress_previous = matches!(
        input.retry_action,
        Some(RetryAction::ReAnchor) | Some(RetryAction::IdentityRescue)
    );
    if let Some(prev) = input.previous_png {
        if !suppress_previous {
            parts.push(Part::Text(PREVIOUS_LABEL.to_string()));
            parts.push(Part::InlineImage {
                mime: "image/png".to_string(),
                bytes: prev.to_vec(),
            });
            parts.push(Part::Text(HIERARCHY_CLAUSE.to_string()));
        }
    }

    parts.push(Part::Text(resolved_command(input, template)));

    let seed = seed_for_attempt(input.run_id, input.frame_index, input.attempt_index);
    let prompt_hash = hash_text_parts(&parts);

    ComposedPrompt {
        parts,
        seed,
        template,
        prompt_hash,
    }
}

fn resolved_command(input: &ComposeInput<'_>, template: TemplateKind) -> String {
    let m = input.manifest;
    let tmpl = match template {
        TemplateKind::Master => &m.prompts.master,
        TemplateKind::Lock => &m.prompts.lock,
        TemplateKind::Variation => &m.prompts.variation,
    };
    let pose_text = input
        .pose
        .map(|p| p.description.clone())
        .unwrap_or_else(|| "the canonical rest pose of IMAGE 1".to_string());
    let mut command = tmpl
        .replace("{character}", &m.character)
        .replace("{move}", &m.move_id)
        .replace("{frame}", &input.frame_index.to_string())
        .replace("{total}", &m.total_frames.to_string())
        .replace("{pose}", &pose_text);

    if let Some(p) = input.pose {
        let tension = match p.tension {
            crate::pose::Tension::Relaxed => "The body is relaxed.",
            crate::pose::Tension::Tense => "The body is tense, muscles braced.",
            crate::pose::Tension::Explosive => "The motion is explosive, at full power.",
        };
        command.push(' ');
        command.push_str(tension);
    }

    let is_loop_closure = m.is_loop
        && input.frame_index > 0
        && input.frame_index == m.total_frames.saturating_sub(1);
    if is_loop_closure {
        command.push(' ');
        command.push_str(LOOP_CLOSURE_CLAUSE);
    }

    command.push(' ');
    command.push_str(&m.prompts.negative);
    if input.retry_action == Some(RetryAction::TightenNegative) {
        command.push(' ');
        command.push_str(TIGHTENED_NEGATIVE);
    }
    command
}

fn hash_text_parts(parts: &[Part]) -> String {
    let mut hasher = Sha256::new();
    for p in parts {
        if let Part::Text(t) = p {
            hasher.update(t.as_bytes());
            hasher.update([0u8]);
        }
    }
    let digest = hasher.finalize();
    digest
        .iter()
        .take(4)
        .map(|b| format!("{b:02x}"))
        .collect()
}
