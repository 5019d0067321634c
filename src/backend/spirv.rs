//! GLSL to SPIR-V backend built on `naga`.
//!
//! The pipeline mirrors a driver compile: parse the stage source, validate
//! the resulting module (the equivalent of a link check), then emit a SPIR-V
//! binary. Artifacts are the little-endian SPIR-V word stream.
//!
//! Only desktop GLSL (`#version 440` and later) is accepted; GLSL ES 1.00
//! sources fail at the parse stage.

use super::{Artifact, CompileError, CompileStage, ShaderBackend};
use crate::protocol::ShaderKind;
use naga::back::spv;
use naga::front::glsl;
use naga::valid::{Capabilities, ValidationFlags, Validator};
use tracing::trace;

/// Format tag attached to every artifact.
const FORMAT: &str = "spirv";

/// Compile context shared for the lifetime of the process.
pub struct NagaBackend {
    capabilities: Capabilities,
    spv_options: spv::Options<'static>,
}

impl NagaBackend {
    pub fn new() -> Self {
        Self {
            capabilities: Capabilities::all(),
            spv_options: spv::Options::default(),
        }
    }
}

impl Default for NagaBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ShaderBackend for NagaBackend {
    fn name(&self) -> &'static str {
        "naga"
    }

    fn describe(&self) -> String {
        let (major, minor) = self.spv_options.lang_version;
        format!("naga GLSL frontend, SPIR-V {major}.{minor} output")
    }

    fn compile(&self, kind: ShaderKind, source: &[u8]) -> Result<Artifact, CompileError> {
        let source = std::str::from_utf8(source)
            .map_err(|e| CompileError::new(CompileStage::Decode, e.to_string()))?;

        let stage = match kind {
            ShaderKind::Vertex => naga::ShaderStage::Vertex,
            ShaderKind::Fragment => naga::ShaderStage::Fragment,
        };

        let mut frontend = glsl::Frontend::default();
        let module = frontend
            .parse(&glsl::Options::from(stage), source)
            .map_err(|e| CompileError::new(CompileStage::Parse, e.emit_to_string(source)))?;

        let info = Validator::new(ValidationFlags::all(), self.capabilities)
            .validate(&module)
            .map_err(|e| CompileError::new(CompileStage::Validate, e.emit_to_string(source)))?;

        let words = spv::write_vec(&module, &info, &self.spv_options, None)
            .map_err(|e| CompileError::new(CompileStage::Emit, e.to_string()))?;

        trace!(kind = %kind, words = words.len(), "Emitted SPIR-V");

        Ok(Artifact {
            bytes: words.iter().flat_map(|w| w.to_le_bytes()).collect(),
            format: FORMAT,
        })
    }
}
