use std::time::SystemTime;

use time::format_description::FormatItem;
use time::macros::format_description;
use time::OffsetDateTime;

const RUN_STAMP: &[FormatItem<'_>] =
    format_description!("[year][month][day]_[hour][minute][second]");

/// Compose a run id: `{YYYYMMDD}_{HHMMSS}_{4-hex}_{character}_{move}`.
/// The 4-hex suffix disambiguates runs created within the same second.
pub fn create_run_id(character: &str, move_id: &str) -> String {
    let now = OffsetDateTime::now_utc();
    let stamp = now
        .format(RUN_STAMP)
        .unwrap_or_else(|_| "00000000_000000".to_string());
    format!(
        "{}_{}_{}_{}",
        stamp,
        random_hex4(),
        sanitize_component(character),
        sanitize_component(move_id)
    )
}

/// RFC 3339 timestamp for state records and lock files.
pub fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

/// Milliseconds since the Unix epoch; used for durations in records.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Four lowercase hex chars from the OS entropy source.
pub fn random_hex4() -> String {
    let mut buf = [0u8; 2];
    if getrandom::getrandom(&mut buf).is_err() {
        // Entropy failure is not worth aborting a run over; fall back to pid.
        let pid = std::process::id();
        buf = [(pid & 0xff) as u8, ((pid >> 8) & 0xff) as u8];
    }
    format!("{:02x}{:02x}", buf[0], buf[1])
}

/// Random u32 seed for retry attempts that need to escape a failure mode.
pub fn random_seed() -> u32 {
    let mut buf = [0u8; 4];
    if getrandom::getrandom(&mut buf).is_err() {
        return crate::util::id::now_millis() as u32;
    }
    u32::from_le_bytes(buf)
}

/// Keep run-folder components filesystem-safe and predictable.
pub fn sanitize_component(s: &str) -> String {
    let cleaned: String = s
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "unnamed".to_string()
    } else {
        cleaned
    }
}
