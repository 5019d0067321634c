//! Compilation backend boundary.
//!
//! The server core only needs one capability from its environment: turn
//! shader source into an opaque binary artifact, or explain why it could
//! not. Backends are created once at startup and shared as an explicit
//! handle ([`SharedBackend`]) with the reactor, the compile workers and the
//! one-shot file mode.

mod spirv;

pub use self::spirv::NagaBackend;

use crate::protocol::ShaderKind;
use std::sync::Arc;
use thiserror::Error;

/// Process-wide backend handle.
pub type SharedBackend = Arc<dyn ShaderBackend>;

/// A compiled shader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    /// Opaque binary sent back to the client.
    pub bytes: Vec<u8>,
    /// Backend-defined format tag. Logged, never transmitted.
    pub format: &'static str,
}

/// Stage at which a compilation was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompileStage {
    /// Source bytes are not valid UTF-8 text.
    Decode,
    /// Stage compile (parse) failed.
    Parse,
    /// Module failed validation (the link step).
    Validate,
    /// Binary emission failed.
    Emit,
}

impl std::fmt::Display for CompileStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            CompileStage::Decode => "decode",
            CompileStage::Parse => "parse",
            CompileStage::Validate => "validate",
            CompileStage::Emit => "emit",
        })
    }
}

/// Backend rejected the source.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{stage} failed: {log}")]
pub struct CompileError {
    pub stage: CompileStage,
    /// Human-readable diagnostic (compile or link log).
    pub log: String,
}

impl CompileError {
    pub fn new(stage: CompileStage, log: impl Into<String>) -> Self {
        Self {
            stage,
            log: log.into(),
        }
    }
}

/// Synchronous compile capability.
///
/// Every call is independent: the backend receives exactly the bytes the
/// client sent and keeps no per-request state between calls.
pub trait ShaderBackend: Send + Sync {
    /// Short identifier used in logs.
    fn name(&self) -> &'static str;

    /// One-line description of the backend's target, logged at startup.
    fn describe(&self) -> String;

    fn compile(&self, kind: ShaderKind, source: &[u8]) -> Result<Artifact, CompileError>;
}
