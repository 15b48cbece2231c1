//! Atlas export: the Packer capability, a built-in row-major grid packer, an
//! adapter for an external TexturePacker binary, and validation of the
//! multi-atlas JSON contract every packer must satisfy.

use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use image::{Rgba, RgbaImage};
use serde::{Deserialize, Serialize};
use wait_timeout::ChildExt;

use crate::codes::ReasonCode;

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct FrameRect {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct AtlasFrameRef {
    /// `{move}/{frame:04}`, no extension.
    pub filename: String,
    pub frame: FrameRect,
}

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct AtlasTexture {
    /// PNG file name, relative to the atlas JSON.
    pub image: String,
    pub frames: Vec<AtlasFrameRef>,
}

/// Root of the multi-atlas document: a `textures` array, each element owning
/// one sheet image and the frames placed on it.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct AtlasDocument {
    pub textures: Vec<AtlasTexture>,
}

#[derive(Clone, Debug)]
pub struct AtlasOutput {
    pub atlas_json: PathBuf,
    pub pages: Vec<PathBuf>,
}

#[derive(Debug)]
pub enum PackError {
    Io(io::Error),
    Unavailable(String),
    Failed(String),
    Invalid(String),
}

impl From<io::Error> for PackError {
    fn from(e: io::Error) -> Self {
        PackError::Io(e)
    }
}

impl PackError {
    pub fn reason_code(&self) -> ReasonCode {
        ReasonCode::DepTexturepackerFail
    }
}

impl std::fmt::Display for PackError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PackError::Io(e) => write!(f, "atlas I/O error: {e}"),
            PackError::Unavailable(s) => write!(f, "packer unavailable: {s}"),
            PackError::Failed(s) => write!(f, "packer failed: {s}"),
            PackError::Invalid(s) => write!(f, "atlas contract violated: {s}"),
        }
    }
}

pub trait Packer {
    /// Pack `approved` (ascending frame order) into
    /// `export/{character}_{move}.png` + `.json`.
    fn pack(
        &self,
        approved: &[PathBuf],
        export_dir: &Path,
        character: &str,
        move_id: &str,
    ) -> Result<AtlasOutput, PackError>;
}

/// Validate the §contract: every referenced PNG exists, every frame name is
/// `{move}/\d{4}`, and the union across textures equals
/// `{move}/0000 .. {move}/{N-1:04}` exactly.
pub fn validate_atlas(
    doc: &AtlasDocument,
    base_dir: &Path,
    move_id: &str,
    total_frames: u32,
) -> Result<(), String> {
    let mut seen: std::collections::BTreeSet<String> = std::collections::BTreeSet::new();
    for texture in &doc.textures {
        let img_path = base_dir.join(&texture.image);
        if !img_path.is_file() {
            return Err(format!("texture image {} does not exist", texture.image));
        }
        for frame in &texture.frames {
            let Some(rest) = frame.filename.strip_prefix(move_id) else {
                return Err(format!("frame name {} lacks move prefix", frame.filename));
            };
            let ok = rest.len() == 5
                && rest.starts_with('/')
                && rest[1..].chars().all(|c| c.is_ascii_digit());
            if !ok {
                return Err(format!(
                    "frame name {} does not match {{move}}/NNNN",
                    frame.filename
                ));
            }
            if !seen.insert(frame.filename.clone()) {
                return Err(format!("duplicate frame name {}", frame.filename));
            }
        }
    }
    let expected: std::collections::BTreeSet<String> = (0..total_frames)
        .map(|i| format!("{move_id}/{i:04}"))
        .collect();
    if seen != expected {
        let missing: Vec<&String> = expected.difference(&seen).collect();
        let extra: Vec<&String> = seen.difference(&expected).collect();
        return Err(format!(
            "frame set mismatch (missing {missing:?}, extra {extra:?})"
        ));
    }
    Ok(())
}

/// Built-in packer: row-major grid, at most 64 frames (8x8) per texture page,
/// spilling to `{char}_{move}_{page}.png` when a move is longer.
pub struct GridPacker {
    pub frame_size: u32,
}

const GRID_COLUMNS: u32 = 8;
const FRAMES_PER_PAGE: u32 = 64;

impl Packer for GridPacker {
    fn pack(
        &self,
        approved: &[PathBuf],
        export_dir: &Path,
        character: &str,
        move_id: &str,
    ) -> Result<AtlasOutput, PackError> {
        if approved.is_empty() {
            return Err(PackError::Failed("no approved frames to pack".into()));
        }
        std::fs::create_dir_all(export_dir)?;
        let size = self.frame_size;
        let page_count = (approved.len() as u32).div_ceil(FRAMES_PER_PAGE);

        let mut textures = Vec::new();
        let mut pages = Vec::new();
        for page in 0..page_count {
            let start = (page * FRAMES_PER_PAGE) as usize;
            let end = (start + FRAMES_PER_PAGE as usize).min(approved.len());
            let slots = (end - start) as u32;
            let cols = slots.min(GRID_COLUMNS);
            let rows = slots.div_ceil(GRID_COLUMNS);
            let mut sheet =
                RgbaImage::from_pixel(cols * size, rows * size, Rgba([0, 0, 0, 0]));

            let mut frames = Vec::with_capacity(slots as usize);
            for (slot, path) in approved[start..end].iter().enumerate() {
                let frame_index = (start + slot) as u32;
                let img = image::open(path)
                    .map_err(|e| {
                        PackError::Failed(format!("decode {}: {e}", path.display()))
                    })?
                    .to_rgba8();
                if img.dimensions() != (size, size) {
                    return Err(PackError::Failed(format!(
                        "{} is {}x{}, expected {size}x{size}",
                        path.display(),
                        img.width(),
                        img.height()
                    )));
                }
                let col = slot as u32 % GRID_COLUMNS;
                let row = slot as u32 / GRID_COLUMNS;
                image::imageops::replace(
                    &mut sheet,
                    &img,
                    (col * size) as i64,
                    (row * size) as i64,
                );
                frames.push(AtlasFrameRef {
                    filename: format!("{move_id}/{frame_index:04}"),
                    frame: FrameRect {
                        x: col * size,
                        y: row * size,
                        w: size,
                        h: size,
                    },
                });
            }

            let image_name = if page_count == 1 {
                format!("{character}_{move_id}.png")
            } else {
                format!("{character}_{move_id}_{page}.png")
            };
            let page_path = export_dir.join(&image_name);
            crate::orchestrator::encode_png(&sheet)
                .and_then(|png| crate::util::fs::atomic_write(&page_path, &png))?;
            pages.push(page_path);
            textures.push(AtlasTexture {
                image: image_name,
                frames,
            });
        }

        let doc = AtlasDocument { textures };
        validate_atlas(&doc, export_dir, move_id, approved.len() as u32)
            .map_err(PackError::Invalid)?;
        let json_path = export_dir.join(format!("{character}_{move_id}.json"));
        crate::util::fs::atomic_write_json(&json_path, &doc)?;
        Ok(AtlasOutput {
            atlas_json: json_path,
            pages,
        })
    }
}

/// Adapter for an external TexturePacker binary discovered on PATH. The
/// binary is expected to emit the same multi-atlas JSON; its output is
/// validated before being accepted.
pub struct TexturePackerCli {
    pub binary: PathBuf,
    pub timeout: Duration,
}

impl TexturePackerCli {
    pub fn discover() -> Result<TexturePackerCli, PackError> {
        let binary = which::which("TexturePacker")
            .or_else(|_| which::which("texturepacker"))
            .map_err(|e| PackError::Unavailable(e.to_string()))?;
        Ok(TexturePackerCli {
            binary,
            timeout: Duration::from_secs(120),
        })
    }
}

impl Packer for TexturePackerCli {
    fn pack(
        &self,
        approved: &[PathBuf],
        export_dir: &Path,
        character: &str,
        move_id: &str,
    ) -> Result<AtlasOutput, PackError> {
        std::fs::create_dir_all(export_dir)?;
        let sheet = export_dir.join(format!("{character}_{move_id}.png"));
        let data = export_dir.join(format!("{character}_{move_id}.json"));
        let mut cmd = Command::new(&self.binary);
        cmd.arg("--sheet")
            .arg(&sheet)
            .arg("--data")
            .arg(&data)
            .arg("--format")
            .arg("json-multiatlas")
            .arg("--trim-mode")
            .arg("None")
            .args(approved)
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                PackError::Unavailable(e.to_string())
            } else {
                PackError::Io(e)
            }
        })?;
        let status = match child.wait_timeout(self.timeout)? {
            Some(status) => status,
            None => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(PackError::Failed(format!(
                    "TexturePacker exceeded {}s",
                    self.timeout.as_secs()
                )));
            }
        };
        if !status.success() {
            return Err(PackError::Failed(format!(
                "TexturePacker exited with {status}"
            )));
        }
        let doc: AtlasDocument = crate::util::fs::read_json(&data)
            .map_err(|e| PackError::Failed(format!("atlas JSON unreadable: {e}")))?;
        validate_atlas(&doc, export_dir, move_id, approved.len() as u32)
            .map_err(PackError::Invalid)?;
        Ok(AtlasOutput {
            atlas_json: data,
            pages: doc
                .textures
                .iter()
                .map(|t| export_dir.join(&t.image))
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_frames(dir: &Path, n: u32, size: u32) -> Vec<PathBuf> {
        (0..n)
            .map(|i| {
                let img = RgbaImage::from_pixel(size, size, Rgba([i as u8, 0, 0, 255]));
                let path = dir.join(format!("frame_{i:04}.png"));
                let png = crate::orchestrator::encode_png(&img).unwrap();
                std::fs::write(&path, png).unwrap();
                path
            })
            .collect()
    }

    #[test]
    fn test_grid_packer_single_page() {
        let td = tempfile::tempdir().unwrap();
        let frames = write_frames(td.path(), 4, 16);
        let out = GridPacker { frame_size: 16 }
            .pack(&frames, &td.path().join("export"), "testchar", "idle")
            .expect("pack");
        assert_eq!(out.pages.len(), 1);
        assert!(out.pages[0].ends_with("testchar_idle.png"));
        let doc: AtlasDocument = crate::util::fs::read_json(&out.atlas_json).unwrap();
        assert_eq!(doc.textures.len(), 1);
        let names: Vec<&str> = doc.textures[0]
            .frames
            .iter()
            .map(|f| f.filename.as_str())
            .collect();
        assert_eq!(names, vec!["idle/0000", "idle/0001", "idle/0002", "idle/0003"]);
    }

    #[test]
    fn test_grid_packer_spills_pages() {
        let td = tempfile::tempdir().unwrap();
        let frames = write_frames(td.path(), 70, 8);
        let out = GridPacker { frame_size: 8 }
            .pack(&frames, &td.path().join("export"), "hero", "special")
            .expect("pack");
        assert_eq!(out.pages.len(), 2);
        let doc: AtlasDocument = crate::util::fs::read_json(&out.atlas_json).unwrap();
        let total: usize = doc.textures.iter().map(|t| t.frames.len()).sum();
        assert_eq!(total, 70);
        validate_atlas(&doc, &td.path().join("export"), "special", 70).expect("valid");
    }

    #[test]
    fn test_validate_atlas_rejects_gaps_and_dupes() {
        let td = tempfile::tempdir().unwrap();
        std::fs::write(td.path().join("a.png"), b"png").unwrap();
        let mut doc = AtlasDocument {
            textures: vec![AtlasTexture {
                image: "a.png".into(),
                frames: vec![
                    AtlasFrameRef {
                        filename: "idle/0000".into(),
                        frame: FrameRect { x: 0, y: 0, w: 8, h: 8 },
                    },
                    AtlasFrameRef {
                        filename: "idle/0002".into(),
                        frame: FrameRect { x: 8, y: 0, w: 8, h: 8 },
                    },
                ],
            }],
        };
        let err = validate_atlas(&doc, td.path(), "idle", 3).unwrap_err();
        assert!(err.contains("mismatch"), "{err}");

        doc.textures[0].frames[1].filename = "idle/0000".into();
        let err = validate_atlas(&doc, td.path(), "idle", 2).unwrap_err();
        assert!(err.contains("duplicate"), "{err}");
    }

    #[test]
    fn test_validate_atlas_rejects_bad_names() {
        let td = tempfile::tempdir().unwrap();
        std::fs::write(td.path().join("a.png"), b"png").unwrap();
        let doc = AtlasDocument {
            textures: vec![AtlasTexture {
                image: "a.png".into(),
                frames: vec![AtlasFrameRef {
                    filename: "idle/0000.png".into(),
                    frame: FrameRect { x: 0, y: 0, w: 8, h: 8 },
                }],
            }],
        };
        let err = validate_atlas(&doc, td.path(), "idle", 1).unwrap_err();
        assert!(err.contains("does not match"), "{err}");
    }

    #[test]
    fn test_validate_atlas_requires_existing_image() {
        let td = tempfile::tempdir().unwrap();
        let doc = AtlasDocument {
            textures: vec![AtlasTexture {
                image: "missing.png".into(),
                frames: vec![],
            }],
        };
        let err = validate_atlas(&doc, td.path(), "idle", 0).unwrap_err();
        assert!(err.contains("does not exist"), "{err}");
    }
}
