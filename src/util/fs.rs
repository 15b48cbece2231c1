//! Atomic persistence helpers. Every state-bearing file in a run folder goes
//! through a temp sibling + rename so readers never observe a torn write.

use std::fs;
use std::io;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Write bytes atomically: temp sibling in the same directory, then rename.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| io::Error::other("path has no parent directory"))?;
    fs::create_dir_all(parent)?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    io::Write::write_all(&mut tmp, bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)
        .map_err(|e| io::Error::new(e.error.kind(), format!("persist {}: {}", path.display(), e.error)))?;
    Ok(())
}

/// Serialize to pretty JSON and write atomically.
pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    let json = serde_json::to_vec_pretty(value)
        .map_err(|e| io::Error::other(format!("serialize {}: {e}", path.display())))?;
    atomic_write(path, &json)
}

/// Read and deserialize a JSON file. A reader racing the writer's rename can
/// observe ENOENT; tolerate it by retrying once.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> io::Result<T> {
    let bytes = match fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            std::thread::sleep(std::time::Duration::from_millis(20));
            fs::read(path)?
        }
        Err(e) => return Err(e),
    };
    serde_json::from_slice(&bytes)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("{}: {e}", path.display())))
}

/// Forward-slash-normalized absolute path string for lock files.
pub fn normalized_abs_path(p: &Path) -> String {
    let abs = fs::canonicalize(p).unwrap_or_else(|_| p.to_path_buf());
    abs.to_string_lossy().replace('\\', "/")
}
