//! Agent Text Protocol
//!
//! Everything needed to turn the agent's standard streams into events:
//! - `framing`: stdout decoder (completion marker, readiness sentinel, tag table)
//! - `noise`: conservative boilerplate filter for diagnostic lines
//! - `stderr`: noise/error classification of stderr lines
//!
//! All three are pure and synchronous; the supervisor's reader tasks feed
//! them and publish what they return.

pub mod framing;
pub mod noise;
pub mod stderr;

pub use framing::{
    FramingConfig, FramingDecoder, TagRule, DEFAULT_COMPLETION_MARKER, DEFAULT_ERROR_TAG,
    DEFAULT_MAX_LINE_LENGTH, DEFAULT_READINESS_SENTINEL, DEFAULT_SYSTEM_TAG,
};
pub use noise::{is_noise, MatchKind, NoiseFilter, NoiseRule, DEFAULT_NOISE_RULES};
pub use stderr::{StderrClassifier, DEFAULT_ERROR_KEYWORDS};
