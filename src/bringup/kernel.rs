//! Kernel image description.
//!
//! The object-file loader proper lives outside the model; bringup only
//! needs the kernel's segment geometry to build the initial page tables.
//! `from_elf` is a thin adapter that pulls those numbers out of an ELF.

use anyhow::{anyhow, Result};
use goblin::elf::Elf;
use std::path::Path;

/// Segment geometry of the kernel binary running on a PE.
#[derive(Debug, Clone, Copy, Default)]
pub struct KernelImage {
    pub entry: u64,
    pub text_base: u64,
    pub text_size: u64,
    pub data_base: u64,
    pub data_size: u64,
    pub bss_base: u64,
    pub bss_size: u64,
}

impl KernelImage {
    /// Extract segment geometry from an ELF binary.
    pub fn from_elf(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)
            .map_err(|e| anyhow!("failed to read kernel '{}': {}", path.display(), e))?;
        Self::parse(&data)
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        let elf = Elf::parse(data).map_err(|e| anyhow!("failed to parse kernel ELF: {}", e))?;

        let mut image = KernelImage { entry: elf.header.e_entry, ..Default::default() };

        for sh in &elf.section_headers {
            let Some(name) = elf.shdr_strtab.get_at(sh.sh_name) else {
                continue;
            };
            match name {
                ".text" => {
                    image.text_base = sh.sh_addr;
                    image.text_size = sh.sh_size;
                }
                ".data" => {
                    image.data_base = sh.sh_addr;
                    image.data_size = sh.sh_size;
                }
                ".bss" => {
                    image.bss_base = sh.sh_addr;
                    image.bss_size = sh.sh_size;
                }
                _ => {}
            }
        }

        if image.text_size == 0 {
            return Err(anyhow!("kernel ELF has no .text section"));
        }
        Ok(image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_garbage() {
        assert!(KernelImage::parse(&[0u8; 16]).is_err());
    }

    #[test]
    fn test_default_is_empty() {
        let image = KernelImage::default();
        assert_eq!(image.text_size, 0);
    }
}
