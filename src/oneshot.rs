//! One-shot mode: compile a single shader file and exit.

use crate::backend::{Artifact, CompileError, ShaderBackend};
use crate::protocol::ShaderKind;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum OneshotError {
    #[error("Cannot tell shader kind of '{}': expected a .vert or .frag file", .0.display())]
    UnknownExtension(PathBuf),
    #[error("Failed to read '{}': {}", .0.display(), .1)]
    Read(PathBuf, #[source] std::io::Error),
    #[error("Failed to compile '{}': {}", .0.display(), .1)]
    Compile(PathBuf, #[source] CompileError),
    #[error("Failed to write '{}': {}", .0.display(), .1)]
    Write(PathBuf, #[source] std::io::Error),
}

/// Compile `input` with `backend`, writing the artifact to `output` if given.
pub fn compile_file(
    backend: &dyn ShaderBackend,
    input: &Path,
    output: Option<&Path>,
) -> Result<Artifact, OneshotError> {
    let kind = ShaderKind::from_path(input)
        .ok_or_else(|| OneshotError::UnknownExtension(input.to_path_buf()))?;
    let source =
        std::fs::read(input).map_err(|e| OneshotError::Read(input.to_path_buf(), e))?;

    let artifact = backend
        .compile(kind, &source)
        .map_err(|e| OneshotError::Compile(input.to_path_buf(), e))?;

    if let Some(output) = output {
        std::fs::write(output, &artifact.bytes)
            .map_err(|e| OneshotError::Write(output.to_path_buf(), e))?;
    }

    info!(
        input = %input.display(),
        kind = %kind,
        format = artifact.format,
        len = artifact.bytes.len(),
        "Compiled shader"
    );
    Ok(artifact)
}
