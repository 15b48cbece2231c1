//! Closed reason-code vocabulary shared by the auditor, retry ladder, stop
//! evaluator and reporters. Adding a variant is a deliberate schema change;
//! every code serializes to the stable SCREAMING_SNAKE string below.

use serde::{Deserialize, Serialize};

/// Every observable failure / stop / status cause in the pipeline.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub enum ReasonCode {
    // Hard gates (candidate rejected unconditionally)
    #[serde(rename = "HF01_DIMENSION_MISMATCH")]
    Hf01DimensionMismatch,
    #[serde(rename = "HF02_FULLY_TRANSPARENT")]
    Hf02FullyTransparent,
    #[serde(rename = "HF03_IMAGE_CORRUPTED")]
    Hf03ImageCorrupted,
    #[serde(rename = "HF04_WRONG_COLOR_DEPTH")]
    Hf04WrongColorDepth,
    #[serde(rename = "HF05_FILE_SIZE_INVALID")]
    Hf05FileSizeInvalid,
    #[serde(rename = "HF_INVALID_ANCHOR")]
    HfInvalidAnchor,
    #[serde(rename = "HF_RESOLUTION_RATIO")]
    HfResolutionRatio,
    #[serde(rename = "HF_NO_ALPHA")]
    HfNoAlpha,
    #[serde(rename = "HF_GENERATOR_ERROR")]
    HfGeneratorError,

    // Soft metrics (score reduction; feeds the retry ladder)
    #[serde(rename = "SF01_IDENTITY_DRIFT")]
    Sf01IdentityDrift,
    #[serde(rename = "SF02_PALETTE_DRIFT")]
    Sf02PaletteDrift,
    #[serde(rename = "SF03_BASELINE_DRIFT")]
    Sf03BaselineDrift,
    #[serde(rename = "SF04_TEMPORAL_INCOHERENCE")]
    Sf04TemporalIncoherence,
    #[serde(rename = "SF_PIXEL_NOISE")]
    SfPixelNoise,
    #[serde(rename = "SF_ALPHA_HALO")]
    SfAlphaHalo,

    // Terminal frame codes (frame gives up; run continues)
    #[serde(rename = "HF_IDENTITY_COLLAPSE")]
    HfIdentityCollapse,
    #[serde(rename = "OSCILLATION_DETECTED")]
    OscillationDetected,
    #[serde(rename = "HF_MAX_ATTEMPTS")]
    HfMaxAttempts,
    #[serde(rename = "LADDER_EXHAUSTED")]
    LadderExhausted,

    // Run-level status / stop reasons
    #[serde(rename = "GENERATING")]
    Generating,
    #[serde(rename = "AUDITING")]
    Auditing,
    #[serde(rename = "RETRYING")]
    Retrying,
    #[serde(rename = "ALL_FRAMES_APPROVED")]
    AllFramesApproved,
    #[serde(rename = "PARTIAL_SUCCESS")]
    PartialSuccess,
    #[serde(rename = "RETRY_RATE_EXCEEDED")]
    RetryRateExceeded,
    #[serde(rename = "REJECT_RATE_EXCEEDED")]
    RejectRateExceeded,
    #[serde(rename = "CONSECUTIVE_FAILS")]
    ConsecutiveFails,
    #[serde(rename = "CIRCUIT_BREAKER")]
    CircuitBreaker,
    #[serde(rename = "USER_INTERRUPT")]
    UserInterrupt,

    // System / dependency errors
    #[serde(rename = "SYS_WRITE_ERROR")]
    SysWriteError,
    #[serde(rename = "SYS_MANIFEST_INVALID")]
    SysManifestInvalid,
    #[serde(rename = "DEP_API_UNAVAILABLE")]
    DepApiUnavailable,
    #[serde(rename = "DEP_TEXTUREPACKER_FAIL")]
    DepTexturepackerFail,
    #[serde(rename = "SYS_UNKNOWN_ERROR")]
    SysUnknownError,

    #[serde(rename = "SESSION_CORRUPTED")]
    SessionCorrupted,
}

impl ReasonCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasonCode::Hf01DimensionMismatch => "HF01_DIMENSION_MISMATCH",
            ReasonCode::Hf02FullyTransparent => "HF02_FULLY_TRANSPARENT",
            ReasonCode::Hf03ImageCorrupted => "HF03_IMAGE_CORRUPTED",
            ReasonCode::Hf04WrongColorDepth => "HF04_WRONG_COLOR_DEPTH",
            ReasonCode::Hf05FileSizeInvalid => "HF05_FILE_SIZE_INVALID",
            ReasonCode::HfInvalidAnchor => "HF_INVALID_ANCHOR",
            ReasonCode::HfResolutionRatio => "HF_RESOLUTION_RATIO",
            ReasonCode::HfNoAlpha => "HF_NO_ALPHA",
            ReasonCode::HfGeneratorError => "HF_GENERATOR_ERROR",
            ReasonCode::Sf01IdentityDrift => "SF01_IDENTITY_DRIFT",
            ReasonCode::Sf02PaletteDrift => "SF02_PALETTE_DRIFT",
            ReasonCode::Sf03BaselineDrift => "SF03_BASELINE_DRIFT",
            ReasonCode::Sf04TemporalIncoherence => "SF04_TEMPORAL_INCOHERENCE",
            ReasonCode::SfPixelNoise => "SF_PIXEL_NOISE",
            ReasonCode::SfAlphaHalo => "SF_ALPHA_HALO",
            ReasonCode::HfIdentityCollapse => "HF_IDENTITY_COLLAPSE",
            ReasonCode::OscillationDetected => "OSCILLATION_DETECTED",
            ReasonCode::HfMaxAttempts => "HF_MAX_ATTEMPTS",
            ReasonCode::LadderExhausted => "LADDER_EXHAUSTED",
            ReasonCode::Generating => "GENERATING",
            ReasonCode::Auditing => "AUDITING",
            ReasonCode::Retrying => "RETRYING",
            ReasonCode::AllFramesApproved => "ALL_FRAMES_APPROVED",
            ReasonCode::PartialSuccess => "PARTIAL_SUCCESS",
            ReasonCode::RetryRateExceeded => "RETRY_RATE_EXCEEDED",
            ReasonCode::RejectRateExceeded => "REJECT_RATE_EXCEEDED",
            ReasonCode::ConsecutiveFails => "CONSECUTIVE_FAILS",
            ReasonCode::CircuitBreaker => "CIRCUIT_BREAKER",
            ReasonCode::UserInterrupt => "USER_INTERRUPT",
            ReasonCode::SysWriteError => "SYS_WRITE_ERROR",
            ReasonCode::SysManifestInvalid => "SYS_MANIFEST_INVALID",
            ReasonCode::DepApiUnavailable => "DEP_API_UNAVAILABLE",
            ReasonCode::DepTexturepackerFail => "DEP_TEXTUREPACKER_FAIL",
            ReasonCode::SysUnknownError => "SYS_UNKNOWN_ERROR",
            ReasonCode::SessionCorrupted => "SESSION_CORRUPTED",
        }
    }

    /// Hard gate / hard-fail candidate codes.
    pub fn is_hard(&self) -> bool {
        matches!(
            self,
            ReasonCode::Hf01DimensionMismatch
                | ReasonCode::Hf02FullyTransparent
                | ReasonCode::Hf03ImageCorrupted
                | ReasonCode::Hf04WrongColorDepth
                | ReasonCode::Hf05FileSizeInvalid
                | ReasonCode::HfInvalidAnchor
                | ReasonCode::HfResolutionRatio
                | ReasonCode::HfNoAlpha
                | ReasonCode::HfGeneratorError
        )
    }

    /// Soft-metric codes that reduce the composite score.
    pub fn is_soft(&self) -> bool {
        matches!(
            self,
            ReasonCode::Sf01IdentityDrift
                | ReasonCode::Sf02PaletteDrift
                | ReasonCode::Sf03BaselineDrift
                | ReasonCode::Sf04TemporalIncoherence
                | ReasonCode::SfPixelNoise
                | ReasonCode::SfAlphaHalo
        )
    }

    /// Codes that terminate the current frame (rejected/failed) without
    /// stopping the run by themselves.
    pub fn is_frame_terminal(&self) -> bool {
        matches!(
            self,
            ReasonCode::HfIdentityCollapse
                | ReasonCode::OscillationDetected
                | ReasonCode::HfMaxAttempts
                | ReasonCode::LadderExhausted
        )
    }

    /// Stop reasons after which a run can be resumed.
    pub fn is_recoverable_stop(&self) -> bool {
        matches!(
            self,
            ReasonCode::RetryRateExceeded
                | ReasonCode::RejectRateExceeded
                | ReasonCode::ConsecutiveFails
                | ReasonCode::CircuitBreaker
                | ReasonCode::UserInterrupt
                | ReasonCode::SysWriteError
                | ReasonCode::DepApiUnavailable
        )
    }
}

impl std::fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
