// Shader module loading
//
// Vulkan uses SPIR-V bytecode for shaders. build.rs compiles the GLSL under
// shaders/ with glslc; the application loads the .spv files at startup.

use super::VulkanDevice;
use anyhow::{Context, Result};
use ash::vk;
use std::path::Path;

/// Create a shader module from SPIR-V words
pub fn create_shader_module(device: &VulkanDevice, code: &[u32]) -> Result<vk::ShaderModule> {
    let create_info = vk::ShaderModuleCreateInfo::builder().code(code);

    unsafe {
        device
            .device
            .create_shader_module(&create_info, None)
            .context("Failed to create shader module")
    }
}

/// Read a compiled .spv file and create a shader module from it
pub fn load_shader_module(device: &VulkanDevice, path: &Path) -> Result<vk::ShaderModule> {
    let code = read_spirv(path)?;
    log::debug!("Loaded shader {} ({} words)", path.display(), code.len());
    create_shader_module(device, &code)
}

/// SPIR-V words from disk; rejects files that are not word aligned or lack
/// the magic number.
pub fn read_spirv(path: &Path) -> Result<Vec<u32>> {
    let mut file =
        std::fs::File::open(path).with_context(|| format!("Failed to open shader {}", path.display()))?;
    ash::util::read_spv(&mut file).with_context(|| format!("Invalid SPIR-V in {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_spirv_words() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.spv");
        let words: [u32; 5] = [0x0723_0203, 0x0001_0000, 0, 1, 0];
        std::fs::write(&path, bytemuck::cast_slice(&words)).unwrap();

        assert_eq!(read_spirv(&path).unwrap(), words);
    }

    #[test]
    fn rejects_truncated_spirv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.spv");
        std::fs::write(&path, [0x03, 0x02, 0x23]).unwrap();

        assert!(read_spirv(&path).is_err());
    }

    #[test]
    fn missing_shader_names_the_path() {
        let err = read_spirv(Path::new("does/not/exist.spv")).unwrap_err();
        assert!(format!("{err:#}").contains("does/not/exist.spv"));
    }
}
