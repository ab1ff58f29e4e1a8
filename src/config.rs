//! Simulation configuration.
//!
//! Configuration is loaded from multiple sources in priority order:
//! 1. Environment variables (`DTU_EMU_*`)
//! 2. Project-local config file (`./dtu-emu.toml`)
//! 3. User config file (`~/.config/dtu-emu/config.toml`)
//! 4. Built-in defaults
//!
//! # Config File Format
//!
//! ```toml
//! # dtu-emu.toml
//!
//! # PE descriptors: bit 0 marks a memory PE, the remaining bits give the
//! # internal memory size (0 = the PE uses paging via the memory PE)
//! pes = [1, 0, 0]
//! mem_pe = 0
//!
//! # boot command line (programs split by "--", nested kernels by "++")
//! cmdline = "kernel -- hello daemon"
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::noc::{Addr, Cycles};

/// All knobs of a simulated machine and its DTUs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Endpoints per DTU.
    pub num_endpoints: usize,
    /// Largest packet a single NoC transaction may carry.
    pub max_noc_packet_size: usize,
    /// Cache-block granularity of the transfer engine.
    pub block_size: usize,
    /// Staging buffers per DTU (cache-based PEs).
    pub buf_count: usize,
    /// Bytes per staging buffer (cache-based PEs).
    pub buf_size: usize,
    /// TLB capacity for PEs that use paging.
    pub tlb_entries: usize,
    /// Width of the endpoint-id field in the COMMAND register.
    pub num_cmd_epid_bits: u32,
    /// L1+L2 block count, for INV_CACHE completion timing.
    pub cache_blocks: usize,
    pub cache_blocks_per_cycle: usize,

    pub register_access_latency: Cycles,
    pub command_to_noc_request_latency: Cycles,
    pub start_msg_transfer_delay: Cycles,
    pub transfer_to_mem_request_latency: Cycles,
    pub transfer_to_noc_latency: Cycles,
    pub noc_to_transfer_latency: Cycles,

    /// Base address of the DTU's register MMIO window.
    pub reg_file_base_addr: Addr,
    /// CPU writes at or above this address are rejected.
    pub rw_barrier: Addr,

    /// Back-to-back faults on one page before LAST_PF is set and an
    /// interrupt is raised.
    pub pf_fail_threshold: u32,
    /// Vector injected when the threshold is reached.
    pub pf_fail_irq: u8,

    /// Complete memory and NoC requests in the same call instead of with
    /// simulated latency.
    pub atomic: bool,

    /// Index of the PE that carries the global memory.
    pub mem_pe: usize,
    /// Start of the per-PE memory slices within the memory PE.
    pub mem_offset: Addr,
    /// Size of each PE's slice.
    pub pe_mem_size: Addr,
    /// Where boot modules are placed in the memory PE.
    pub mod_offset: Addr,
    pub mod_size: Addr,

    /// PE descriptors: bit 0 marks a memory PE; the remaining bits give
    /// the internal memory size, 0 meaning the PE uses paging.
    pub pes: Vec<u64>,
    /// Boot command line handed to PE bringup.
    pub cmdline: String,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            num_endpoints: 16,
            max_noc_packet_size: 4096,
            block_size: 64,
            buf_count: 4,
            buf_size: 4096,
            tlb_entries: 128,
            num_cmd_epid_bits: 8,
            cache_blocks: 2048,
            cache_blocks_per_cycle: 8,
            register_access_latency: 1,
            command_to_noc_request_latency: 3,
            start_msg_transfer_delay: 2,
            transfer_to_mem_request_latency: 1,
            transfer_to_noc_latency: 3,
            noc_to_transfer_latency: 3,
            reg_file_base_addr: 0x5_C000_0000,
            rw_barrier: 0x5_B000_0000,
            pf_fail_threshold: 100,
            pf_fail_irq: 0x41,
            atomic: false,
            mem_pe: 0,
            mem_offset: 0,
            pe_mem_size: 16 * 1024 * 1024,
            mod_offset: 0x40_0000,
            mod_size: 0x40_0000,
            pes: vec![1, 0],
            cmdline: String::new(),
        }
    }
}

impl SimConfig {
    /// Load configuration from all sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(user) = Self::load_user_config() {
            config = user;
        }
        if let Some(local) = Self::load_from_file(Path::new("dtu-emu.toml")) {
            config = local;
        }

        config.apply_env_overrides();
        config.validate();
        config
    }

    fn load_user_config() -> Option<Self> {
        let config_dir = dirs::config_dir()?;
        let path = config_dir.join("dtu-emu").join("config.toml");
        Self::load_from_file(&path)
    }

    pub fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match std::fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => {
                    log::info!("Loaded config from {}", path.display());
                    Some(config)
                }
                Err(e) => {
                    log::warn!("Failed to parse {}: {}", path.display(), e);
                    None
                }
            },
            Err(e) => {
                log::warn!("Failed to read {}: {}", path.display(), e);
                None
            }
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("DTU_EMU_ATOMIC") {
            self.atomic = val == "1" || val.eq_ignore_ascii_case("true");
        }
        if let Ok(val) = std::env::var("DTU_EMU_CMDLINE") {
            log::info!("Using DTU_EMU_CMDLINE from environment: {}", val);
            self.cmdline = val;
        }
        if let Ok(val) = std::env::var("DTU_EMU_TLB_ENTRIES") {
            if let Ok(n) = val.parse() {
                self.tlb_entries = n;
            }
        }
    }

    /// Sanity-check the parameter set; violations are configuration bugs.
    pub fn validate(&self) {
        assert!(!self.pes.is_empty(), "no PEs configured");
        assert!(self.mem_pe < self.pes.len(), "mem_pe out of range");
        assert_eq!(self.pes[self.mem_pe] & 1, 1, "mem_pe is not a memory PE");
        assert!(self.buf_size >= self.max_noc_packet_size);
        assert!(self.block_size.is_power_of_two());
        assert!(self.num_endpoints <= 1 << crate::dtu::regfile::EP_BITS);
    }

    /// True if PE `pe` translates through the DTU (no internal memory).
    pub fn pe_uses_paging(&self, pe: usize) -> bool {
        self.pes[pe] & !1 == 0 && self.pes[pe] & 1 == 0
    }

    /// True if PE `pe` is a memory PE.
    pub fn pe_is_mem(&self, pe: usize) -> bool {
        self.pes[pe] & 1 == 1
    }

    /// This PE's slice within the memory PE.
    pub fn pe_mem_offset(&self, pe: usize) -> Addr {
        self.mem_offset + self.pe_mem_size * pe as Addr
    }
}
