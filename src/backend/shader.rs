// Shader module loading
//
// Compiled SPIR-V modules are addressable by filesystem path; build.rs
// produces the .spv files next to their GLSL sources.

use anyhow::{Context, Result};
use ash::vk;
use std::path::Path;

use super::VulkanDevice;

/// Create a shader module from SPIR-V bytes.
pub fn create_shader_module(device: &VulkanDevice, code: &[u8]) -> Result<vk::ShaderModule> {
    anyhow::ensure!(code.len() % 4 == 0, "SPIR-V byte length not word aligned");

    // SPIR-V uses 4-byte words; re-read the bytes as u32 without assuming
    // the source slice is aligned.
    let words: Vec<u32> = code
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();

    let create_info = vk::ShaderModuleCreateInfo::builder().code(&words);

    unsafe {
        device
            .device
            .create_shader_module(&create_info, None)
            .context("Failed to create shader module")
    }
}

/// Load a compiled SPIR-V module from disk.
pub fn load_shader_module<P: AsRef<Path>>(
    device: &VulkanDevice,
    path: P,
) -> Result<vk::ShaderModule> {
    let path = path.as_ref();
    let bytes = std::fs::read(path)
        .with_context(|| format!("Failed to read shader module {:?}", path))?;
    create_shader_module(device, &bytes)
        .with_context(|| format!("Invalid shader module {:?}", path))
}
