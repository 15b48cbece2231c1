//! Generator capability: the single seam between the deterministic
//! orchestrator and the stochastic remote image model. Alternate backends
//! implement [`Generator`]; the orchestrator never sees HTTP.

use std::time::Duration;

use crate::prompt::Part;

pub mod gemini;
pub mod scripted;

/// One generation request. `parts` ordering and labels are significant.
pub struct GenerateRequest {
    pub parts: Vec<Part>,
    pub seed: u32,
    /// None = model default. The manifest validator rejects overrides, so in
    /// practice this is always None; the field exists because the capability
    /// contract carries it.
    pub temperature: Option<f32>,
}

#[derive(Clone, PartialEq, Debug)]
pub struct GeneratedImage {
    pub image_bytes: Vec<u8>,
    pub mime: String,
    pub model_id: String,
    /// Opaque reasoning token, logged for audit but never fed back.
    pub reasoning_token: Option<String>,
}

#[derive(Clone, PartialEq, Debug)]
pub enum GeneratorError {
    RateLimited(String),
    Overloaded(String),
    InvalidRequest(String),
    SafetyRefused(String),
    Transport(String),
}

impl GeneratorError {
    /// Transient errors are retried with backoff inside the adapter layer and
    /// never count as ladder attempts.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GeneratorError::RateLimited(_)
                | GeneratorError::Overloaded(_)
                | GeneratorError::Transport(_)
        )
    }

    pub fn message(&self) -> &str {
        match self {
            GeneratorError::RateLimited(m)
            | GeneratorError::Overloaded(m)
            | GeneratorError::InvalidRequest(m)
            | GeneratorError::SafetyRefused(m)
            | GeneratorError::Transport(m) => m,
        }
    }

    pub fn kind_str(&self) -> &'static str {
        match self {
            GeneratorError::RateLimited(_) => "rate_limited",
            GeneratorError::Overloaded(_) => "overloaded",
            GeneratorError::InvalidRequest(_) => "invalid_request",
            GeneratorError::SafetyRefused(_) => "safety_refused",
            GeneratorError::Transport(_) => "transport",
        }
    }
}

impl std::fmt::Display for GeneratorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind_str(), self.message())
    }
}

pub trait Generator {
    fn generate(&mut self, req: &GenerateRequest) -> Result<GeneratedImage, GeneratorError>;

    fn model_id(&self) -> &str;

    /// Version tag recorded in the lock file.
    fn adapter_version(&self) -> &str {
        "unversioned"
    }
}

/// Exponential backoff for transient errors: 1s, 2s, 4s ... up to
/// `max_retries` extra calls within the same attempt.
#[derive(Clone, Debug)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max_retries: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy {
            base: Duration::from_secs(1),
            max_retries: 5,
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for(&self, retry: u32) -> Duration {
        // Saturate the shift; five doublings is the practical ceiling anyway.
        self.base
            .checked_mul(1u32 << retry.min(16))
            .unwrap_or(Duration::from_secs(64))
    }
}

/// Drive a generator call with transient-error retry. Permanent errors are
/// returned immediately for the ladder to handle.
pub fn generate_with_backoff(
    generator: &mut dyn Generator,
    req: &GenerateRequest,
    policy: &BackoffPolicy,
) -> Result<GeneratedImage, GeneratorError> {
    let mut last_err: Option<GeneratorError> = None;
    for retry in 0..=policy.max_retries {
        if retry > 0 {
            let delay = policy.delay_for(retry - 1);
            tracing::warn!(
                target: "generator",
                retry,
                delay_ms = delay.as_millis() as u64,
                "transient generator error, backing off"
            );
            std::thread::sleep(delay);
        }
        match generator.generate(req) {
            Ok(img) => return Ok(img),
            Err(e) if e.is_transient() => {
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err.unwrap_or_else(|| GeneratorError::Transport("no response".to_string())))
}

#[cfg(test)]
mod tests {
    use super::scripted::ScriptedGenerator;
    use super::*;

    fn ok_image() -> GeneratedImage {
        GeneratedImage {
            image_bytes: vec![1, 2, 3],
            mime: "image/png".into(),
            model_id: "scripted".into(),
            reasoning_token: None,
        }
    }

    fn req() -> GenerateRequest {
        GenerateRequest {
            parts: vec![],
            seed: 7,
            temperature: None,
        }
    }

    #[test]
    fn test_backoff_retries_transient_then_succeeds() {
        let mut g = ScriptedGenerator::new(vec![
            Err(GeneratorError::RateLimited("429".into())),
            Err(GeneratorError::Overloaded("503".into())),
            Ok(ok_image()),
        ]);
        let policy = BackoffPolicy {
            base: Duration::from_millis(1),
            max_retries: 5,
        };
        let out = generate_with_backoff(&mut g, &req(), &policy).expect("should recover");
        assert_eq!(out.image_bytes, vec![1, 2, 3]);
        assert_eq!(g.calls(), 3);
    }

    #[test]
    fn test_backoff_gives_up_after_max_retries() {
        let responses = (0..10)
            .map(|_| Err(GeneratorError::Transport("down".into())))
            .collect();
        let mut g = ScriptedGenerator::new(responses);
        let policy = BackoffPolicy {
            base: Duration::from_millis(1),
            max_retries: 2,
        };
        let err = generate_with_backoff(&mut g, &req(), &policy).unwrap_err();
        assert!(err.is_transient());
        assert_eq!(g.calls(), 3, "initial call plus two retries");
    }

    #[test]
    fn test_permanent_error_not_retried() {
        let mut g = ScriptedGenerator::new(vec![
            Err(GeneratorError::SafetyRefused("blocked".into())),
            Ok(ok_image()),
        ]);
        let policy = BackoffPolicy {
            base: Duration::from_millis(1),
            max_retries: 5,
        };
        let err = generate_with_backoff(&mut g, &req(), &policy).unwrap_err();
        assert!(!err.is_transient());
        assert_eq!(g.calls(), 1);
    }
}
