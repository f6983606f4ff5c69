use naga::back::spv;
use naga::valid::{Capabilities, ModuleInfo, ValidationFlags, Validator};
use naga::{Module, ShaderStage};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ShaderError {
    #[error("Error parsing generated shader '{name}': {message}")]
    Parse { name: String, message: String },
    #[error("Generated shader '{name}' failed validation: {message}")]
    Validation { name: String, message: String },
    #[error("Error writing SPIR-V for shader '{name}': {source}")]
    SpirV {
        name: String,
        #[source]
        source: spv::Error,
    },
    #[error("Cannot export stencil from shader '{name}': {message}")]
    StencilExport { name: String, message: &'static str },
}

/// A generated shader, ready to be validated or translated to SPIR-V.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderSource {
    pub name: String,
    pub stage: ShaderStage,
    pub entry_point: &'static str,
    pub wgsl: String,
    // The only `@location` output is written to FragStencilRefEXT instead of an attachment
    pub stencil_export: bool,
}

impl ShaderSource {
    pub const ENTRY_POINT: &'static str = "main";

    pub fn new(name: impl Into<String>, stage: ShaderStage, wgsl: String) -> Self {
        Self {
            name: name.into(),
            stage,
            entry_point: Self::ENTRY_POINT,
            wgsl,
            stencil_export: false,
        }
    }

    #[must_use]
    pub fn with_stencil_export(self) -> Self {
        Self { stencil_export: true, ..self }
    }

    fn capabilities() -> Capabilities {
        Capabilities::PUSH_CONSTANT | Capabilities::MULTISAMPLED_SHADING
    }

    /// Parses and validates the shader.
    ///
    /// # Errors
    ///
    /// Returns an error if the WGSL fails to parse or the module fails validation.
    pub fn validate(&self) -> Result<(Module, ModuleInfo), ShaderError> {
        let module = naga::front::wgsl::parse_str(&self.wgsl).map_err(|err| ShaderError::Parse {
            name: self.name.clone(),
            message: err.emit_to_string(&self.wgsl),
        })?;

        let info = Validator::new(ValidationFlags::all(), Self::capabilities())
            .validate(&module)
            .map_err(|err| ShaderError::Validation {
                name: self.name.clone(),
                message: err.emit_to_string(&self.wgsl),
            })?;

        Ok((module, info))
    }

    /// Translates the shader to SPIR-V words for `vkCreateShaderModule`.
    ///
    /// # Errors
    ///
    /// Returns an error if validation fails, the SPIR-V backend rejects the module, or a stencil
    /// exporting shader doesn't have exactly one location output.
    pub fn compile(&self) -> Result<Vec<u32>, ShaderError> {
        let (module, info) = self.validate()?;

        let mut options = spv::Options::default();
        // Fragment coordinates and NDC are already in Vulkan conventions
        options.flags.remove(spv::WriterFlags::ADJUST_COORDINATE_SPACE);

        let pipeline_options =
            spv::PipelineOptions { shader_stage: self.stage, entry_point: self.entry_point.into() };

        let mut words = spv::write_vec(&module, &info, &options, Some(&pipeline_options))
            .map_err(|source| ShaderError::SpirV { name: self.name.clone(), source })?;
        if self.stencil_export {
            export_stencil(&mut words).map_err(|message| ShaderError::StencilExport {
                name: self.name.clone(),
                message,
            })?;
        }
        Ok(words)
    }
}

const HEADER_WORDS: usize = 5;
const STENCIL_EXPORT_EXTENSION: &str = "SPV_EXT_shader_stencil_export";

fn instruction(op: spirv::Op, operands: &[u32]) -> Vec<u32> {
    let mut words = Vec::with_capacity(operands.len() + 1);
    words.push(((operands.len() as u32 + 1) << 16) | op as u32);
    words.extend_from_slice(operands);
    words
}

// Nul terminated and padded to whole words
fn string_operand(value: &str) -> Vec<u32> {
    let mut bytes = value.as_bytes().to_vec();
    bytes.resize(value.len() / 4 * 4 + 4, 0);
    bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Redecorates the only `Location` output of a fragment shader as `FragStencilRefEXT`, which
/// WGSL has no builtin for, and declares the capability, extension and execution mode it needs.
fn export_stencil(words: &mut Vec<u32>) -> Result<(), &'static str> {
    if words.len() < HEADER_WORDS || words[0] != spirv::MAGIC_NUMBER {
        return Err("not a SPIR-V module");
    }

    let mut outputs = Vec::new();
    let mut locations = Vec::new();
    let mut capabilities_end = HEADER_WORDS;
    let mut execution_mode = None;
    let mut index = HEADER_WORDS;
    while index < words.len() {
        let word_count = (words[index] >> 16) as usize;
        if word_count == 0 || index + word_count > words.len() {
            return Err("truncated instruction");
        }
        let operands = &words[index + 1..index + word_count];
        match spirv::Op::from_u32(words[index] & 0xFFFF) {
            Some(spirv::Op::Capability) => capabilities_end = index + word_count,
            Some(spirv::Op::ExecutionMode) if execution_mode.is_none() => {
                execution_mode = operands.first().map(|&entry_point| (index, entry_point));
            }
            Some(spirv::Op::Variable)
                if operands.get(2) == Some(&(spirv::StorageClass::Output as u32)) =>
            {
                outputs.push(operands[1]);
            }
            Some(spirv::Op::Decorate)
                if word_count == 4 && operands[1] == spirv::Decoration::Location as u32 =>
            {
                locations.push((index, operands[0]));
            }
            _ => {}
        }
        index += word_count;
    }

    let mut stencil = locations.iter().filter(|(_, id)| outputs.contains(id));
    let (Some(&(decoration, _)), None) = (stencil.next(), stencil.next()) else {
        return Err("expected exactly one location output");
    };
    let (mode_index, entry_point) = execution_mode.ok_or("no execution mode")?;

    // Same word count as the Location decoration
    words[decoration + 2] = spirv::Decoration::BuiltIn as u32;
    words[decoration + 3] = spirv::BuiltIn::FragStencilRefEXT as u32;

    words.splice(
        mode_index..mode_index,
        instruction(
            spirv::Op::ExecutionMode,
            &[entry_point, spirv::ExecutionMode::StencilRefReplacingEXT as u32],
        ),
    );
    let mut declarations =
        instruction(spirv::Op::Capability, &[spirv::Capability::StencilExportEXT as u32]);
    let extension = string_operand(STENCIL_EXPORT_EXTENSION);
    declarations.extend(instruction(spirv::Op::Extension, &extension));
    words.splice(capabilities_end..capabilities_end, declarations);
    Ok(())
}
