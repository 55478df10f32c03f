use std::path::{Path, PathBuf};

use thiserror::Error;
use vulkanalia::prelude::v1_3::*;
use log::*;

#[derive(Error, Debug)]
pub enum ShaderError {
    #[error("failed to read shader {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("shader bytecode of {0} is not a whole number of 32-bit words")]
    Misaligned(PathBuf),
    #[error("failed to create shader module: {0}")]
    Creation(vk::ErrorCode),
}

/// Wraps SPIR-V bytecode into a shader module.
pub fn create_shader_module(device: &Device, bytecode: &[u8]) -> Result<vk::ShaderModule, ShaderError> {
    // Copying into a Vec<u32> guarantees the word alignment the
    // create info expects, whatever the alignment of the source.
    let code = bytecode
        .chunks_exact(4)
        .map(|w| u32::from_ne_bytes([w[0], w[1], w[2], w[3]]))
        .collect::<Vec<_>>();

    let info = vk::ShaderModuleCreateInfo::builder()
        .code_size(code.len() * 4)
        .code(&code);

    unsafe { device.create_shader_module(&info, None) }.map_err(ShaderError::Creation)
}

/// Loads a compiled shader from disk.
pub fn load_shader_module(device: &Device, path: &Path) -> Result<vk::ShaderModule, ShaderError> {
    let bytecode = std::fs::read(path).map_err(|source| ShaderError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    if bytecode.is_empty() || bytecode.len() % 4 != 0 {
        return Err(ShaderError::Misaligned(path.to_path_buf()));
    }

    let module = create_shader_module(device, &bytecode)?;
    debug!("Shader module loaded from {}.", path.display());
    Ok(module)
}

/// Loads a shader, logging failures and returning a null
/// handle instead. Pipelines built from a null module are null
/// themselves and get skipped at record time.
pub fn load_shader_or_null(device: &Device, path: &Path) -> vk::ShaderModule {
    match load_shader_module(device, path) {
        Ok(module) => module,
        Err(e) => {
            error!("{e}");
            vk::ShaderModule::null()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_name_the_file() {
        let error = ShaderError::Io {
            path: PathBuf::from("shaders/missing.spv"),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        };
        assert!(error.to_string().contains("shaders/missing.spv"));
    }
}
