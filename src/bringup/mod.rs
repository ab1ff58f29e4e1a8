//! PE bringup.
//!
//! Before a PE starts executing, its initial state has to exist in
//! simulated memory: page tables (for PEs without internal memory), the
//! boot modules, a `KernelEnv` describing modules and the PE topology for
//! the kernel, and a `StartEnv` with argc/argv at a fixed runtime address.
//! The behavior here defines the invariants the DTU later relies on — most
//! importantly the recursive root-PT entry and the identity mapping of the
//! kernel's segments.

pub mod cmdline;
pub mod kernel;

use anyhow::{bail, Context, Result};
use byteorder::{ByteOrder, LittleEndian};

use crate::dtu::tlb::{self, access, PAGE_MASK, PAGE_SIZE};
use crate::noc::{Addr, NocAddr};
use crate::sim::Machine;

pub use kernel::KernelImage;

pub const MAX_MODS: usize = 64;
pub const MAX_PES: usize = 1024;
pub const MAX_MEM_MODS: usize = 4;

/// Runtime-state area: StartEnv, argv, args.
pub const RT_START: Addr = 0x3000;
pub const RT_SIZE: Addr = 0x20000;
pub const STACK_AREA: Addr = RT_START + RT_SIZE;
pub const STACK_SIZE: Addr = 0x1000;
pub const HEAP_SIZE: Addr = 0x1000;

/// Pages below this frame are reserved (root PT plus everything up to the
/// end of the stack); intermediate page tables are allocated above it.
pub const RES_PAGES: u64 = (STACK_AREA + STACK_SIZE) >> tlb::PAGE_BITS;

/// PE types in the kernel environment.
pub const TYPE_IMEM: u64 = 0;
pub const TYPE_EMEM: u64 = 1;
pub const TYPE_MEM: u64 = 2;

const BOOT_MODULE_SIZE: usize = 144;
const KERNEL_ENV_SIZE: usize = 8860;
const START_ENV_SIZE: usize = 140;

/// One boot module record: name[128], addr, size (packed).
#[derive(Debug, Clone)]
struct BootModule {
    name: String,
    addr: u64,
    size: u64,
}

impl BootModule {
    fn write_to(&self, buf: &mut [u8]) {
        assert!(buf.len() >= BOOT_MODULE_SIZE);
        assert!(self.name.len() < 128, "module name too long: {}", self.name);
        buf[..128].fill(0);
        buf[..self.name.len()].copy_from_slice(self.name.as_bytes());
        LittleEndian::write_u64(&mut buf[128..136], self.addr);
        LittleEndian::write_u64(&mut buf[136..144], self.size);
    }
}

/// The kernel environment: module pointers, PE array, memory modules
/// (packed; only the fields bringup fills are modeled explicitly).
#[derive(Debug)]
struct KernelEnv {
    mods: [u64; MAX_MODS],
    pe_count: u64,
    pes: [u64; MAX_PES],
    kernel_id: u32,
    creator_kernel_id: u32,
    /// (pe, offs, size) triples.
    mem_mods: [(u64, u64, u64); MAX_MEM_MODS],
}

impl Default for KernelEnv {
    fn default() -> Self {
        Self {
            mods: [0; MAX_MODS],
            pe_count: 0,
            pes: [0; MAX_PES],
            kernel_id: 0,
            creator_kernel_id: 0,
            mem_mods: [(0, 0, 0); MAX_MEM_MODS],
        }
    }
}

impl KernelEnv {
    fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; KERNEL_ENV_SIZE];
        let mut off = 0;
        for m in &self.mods {
            LittleEndian::write_u64(&mut buf[off..], *m);
            off += 8;
        }
        LittleEndian::write_u64(&mut buf[off..], self.pe_count);
        off += 8;
        for p in &self.pes {
            LittleEndian::write_u64(&mut buf[off..], *p);
            off += 8;
        }
        LittleEndian::write_u32(&mut buf[off..], self.kernel_id);
        LittleEndian::write_u32(&mut buf[off + 4..], self.creator_kernel_id);
        // creatorCore, creatorThread, creatorEp stay zero
        off += 20;
        for &(pe, offs, size) in &self.mem_mods {
            LittleEndian::write_u64(&mut buf[off..], pe);
            LittleEndian::write_u64(&mut buf[off + 8..], offs);
            LittleEndian::write_u64(&mut buf[off + 16..], size);
            off += 24;
        }
        // memOffset, memberTable, ddlPartitions, ddlPartitionsSize stay zero
        buf
    }
}

/// The start environment at RT_START (packed; unset fields stay zero).
#[derive(Debug, Default)]
struct StartEnv {
    coreid: u64,
    argc: u32,
    argv: u64,
    heapsize: u64,
    kenv: u64,
    pe: u64,
}

impl StartEnv {
    fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; START_ENV_SIZE];
        LittleEndian::write_u64(&mut buf[0..], self.coreid);
        LittleEndian::write_u32(&mut buf[8..], self.argc);
        LittleEndian::write_u64(&mut buf[12..], self.argv);
        // sp, entry, lambda, pager/mounts/fds/eps/caps/exit stay zero
        LittleEndian::write_u64(&mut buf[100..], self.heapsize);
        // backend stays zero
        LittleEndian::write_u64(&mut buf[116..], self.kenv);
        LittleEndian::write_u64(&mut buf[124..], self.pe);
        buf
    }
}

/// Bringup driver for one PE.
pub struct Bringup<'a> {
    machine: &'a mut Machine,
    pe: usize,
    kernel: Option<KernelImage>,
    /// Next free frame (within this PE's memory slice) for page tables.
    next_frame: u64,
}

impl<'a> Bringup<'a> {
    pub fn new(machine: &'a mut Machine, pe: usize, kernel: Option<KernelImage>) -> Self {
        // don't reuse the root PT frame
        Self { machine, pe, kernel, next_frame: RES_PAGES }
    }

    fn mem_slice(&self) -> Addr {
        self.machine.cfg.pe_mem_offset(self.pe)
    }

    /// The root page table sits at the start of this PE's memory slice.
    pub fn root_pt(&self) -> NocAddr {
        NocAddr::new(self.machine.cfg.mem_pe as u16, 0, self.mem_slice())
    }

    /// Plant the PE's initial state: page tables, modules, environments.
    pub fn init_state(&mut self) -> Result<()> {
        let cfg = &self.machine.cfg;
        let uses_paging = cfg.pe_uses_paging(self.pe);
        let mod_offset = cfg.mod_offset;
        let cmdline = cfg.cmdline.clone();
        let pes = cfg.pes.clone();

        if pes.len() > MAX_PES {
            bail!("too many PEs ({} vs. {})", pes.len(), MAX_PES);
        }

        // no internal memory? then we use paging
        if uses_paging {
            self.map_memory();
        }

        let args = cmdline::split_args(&cmdline);
        let mut env = StartEnv {
            coreid: self.pe as u64,
            argc: args.len() as u32,
            // with paging the kernel gets an initial heap mapped;
            // otherwise it uses all internal memory
            heapsize: if uses_paging { HEAP_SIZE } else { 0 },
            ..Default::default()
        };

        // the kernel env is placed behind the normal env
        let mut argv = RT_START + START_ENV_SIZE as Addr;
        if mod_offset != 0 {
            argv += KERNEL_ENV_SIZE as Addr;
        }
        let args_addr = argv + 8 * env.argc as Addr;
        env.argv = argv;

        if cmdline.len() as Addr + 1 + args_addr > RT_START + RT_SIZE {
            bail!("command line \"{}\" is too long", cmdline);
        }

        self.write_args(&args, argv, args_addr);

        let (kernel_path, mut mods) =
            cmdline::extract_modules(&cmdline, cmdline::DEFAULT_SEPARATORS);

        if mod_offset != 0 {
            let mut kenv = KernelEnv::default();

            // idle is always needed; one slot stays free as terminator
            mods.push(("idle".to_string(), String::new()));
            if mods.len() >= MAX_MODS {
                bail!("too many modules ({} vs. {})", mods.len(), MAX_MODS);
            }

            let mem_pe = self.machine.cfg.mem_pe as u16;
            let mut addr = NocAddr::new(mem_pe, 0, mod_offset).as_raw();
            for (i, (name, _args)) in mods.iter().enumerate() {
                let size = self.load_module(&kernel_path, name, addr)?;

                let bmod = BootModule { name: name.clone(), addr, size };
                log::info!("loaded '{}' to {:#x} .. {:#x}", name, addr, addr + size);

                // pointer to the module info, then the info itself
                kenv.mods[i] = (addr + size + 7) & !7;
                let mut buf = [0u8; BOOT_MODULE_SIZE];
                bmod.write_to(&mut buf);
                self.machine
                    .noc_write_functional(NocAddr::from_raw(kenv.mods[i]), &buf);

                // the next module starts on a fresh page
                addr = kenv.mods[i] + BOOT_MODULE_SIZE as Addr;
                addr = (addr + PAGE_SIZE - 1) & !PAGE_MASK;
            }

            // build the PE array and the memory modules
            kenv.pe_count = pes.len() as u64;
            let mut j = 0;
            for (i, &desc) in pes.iter().enumerate() {
                // 63..54: core id
                // 53..12: memsize in pages (0 = no internal memory)
                //  3..0 : PE type
                if desc & 1 != 0 {
                    kenv.pes[i] = TYPE_MEM;
                    if j >= MAX_MEM_MODS {
                        bail!("too many memory modules");
                    }
                    kenv.mem_mods[j] = (i as u64, 0, desc & !0x7);
                    log::info!("defined memory module: pe {} size {:#x}", i, kenv.mem_mods[j].2);
                    j += 1;
                } else if desc & !1 != 0 {
                    kenv.pes[i] = TYPE_IMEM;
                } else {
                    kenv.pes[i] = TYPE_EMEM;
                }
                kenv.pes[i] |= (i as u64) << 54;
                kenv.pes[i] |= desc & !1;
            }

            // the kernel needs its own PE descriptor in the env
            env.pe = kenv.pes[self.pe];

            // the initial kernel is identified by being created by itself
            kenv.kernel_id = 0;
            kenv.creator_kernel_id = 0;

            env.kenv = addr;
            self.machine
                .noc_write_functional(NocAddr::from_raw(addr), &kenv.to_bytes());
            addr += KERNEL_ENV_SIZE as Addr;

            let end = NocAddr::new(mem_pe, 0, mod_offset + self.machine.cfg.mod_size).as_raw();
            if addr > end {
                bail!(
                    "modules are too large (have: {:#x}, need: {:#x})",
                    self.machine.cfg.mod_size,
                    addr - NocAddr::new(mem_pe, 0, mod_offset).as_raw()
                );
            }
        }

        let env_bytes = env.to_bytes();
        self.machine.phys_write(self.pe, RT_START, &env_bytes);
        Ok(())
    }

    /// Write argv pointers and argument strings into the RT area.
    fn write_args(&mut self, args: &[&str], argv: Addr, mut args_addr: Addr) {
        for (i, arg) in args.iter().enumerate() {
            self.machine
                .phys_write_u64(self.pe, argv + 8 * i as Addr, args_addr);
            self.machine.phys_write(self.pe, args_addr, arg.as_bytes());
            self.machine
                .phys_write(self.pe, args_addr + arg.len() as Addr, &[0]);
            args_addr += arg.len() as Addr + 1;
        }
    }

    /// Read a module from disk and place it in the module area.
    fn load_module(&mut self, path: &str, name: &str, addr: Addr) -> Result<u64> {
        let filename = std::path::Path::new(path).join(name);
        let data = std::fs::read(&filename)
            .with_context(|| format!("unable to read module '{}'", filename.display()))?;
        self.machine
            .noc_write_functional(NocAddr::from_raw(addr), &data);
        Ok(data.len() as u64)
    }

    /// Build the initial page tables for a paging PE.
    fn map_memory(&mut self) {
        let root = self.root_pt().as_raw();

        // clear the root PT
        self.zero_page(root);

        // let the last entry of the root PT point at the root PT itself
        let entry = (root & !PAGE_MASK) | access::RWX as u64;
        let slot = root + PAGE_SIZE - tlb::PTE_SIZE as Addr;
        log::debug!("creating recursive PTE @ {:#x}: {:#x}", slot, entry);
        self.machine.phys_write_u64(self.pe, slot, entry);

        let kernel = self.kernel.unwrap_or_default();
        self.map_segment(kernel.text_base, kernel.text_size, access::INTERN | access::RX);
        self.map_segment(kernel.data_base, kernel.data_size, access::INTERN | access::RW);
        self.map_segment(kernel.bss_base, kernel.bss_size, access::INTERN | access::RW);

        if self.machine.cfg.mod_offset != 0 {
            // initial heap behind bss
            let bss_end = (kernel.bss_base + kernel.bss_size + PAGE_SIZE - 1) & !PAGE_MASK;
            self.map_segment(bss_end, HEAP_SIZE, access::INTERN | access::RW);

            // runtime state and stack
            self.map_segment(RT_START, RT_SIZE, access::INTERN | access::RW);
            self.map_segment(STACK_AREA, STACK_SIZE, access::INTERN | access::RW);
        } else {
            // idle PEs map a large portion of the address space instead
            let mem_size = self.machine.cfg.pe_mem_size;
            self.map_segment(RT_START, mem_size - RT_START, access::IRWX);
        }
    }

    fn map_segment(&mut self, start: Addr, size: Addr, perm: u8) {
        let mut virt = start;
        let count = (size + PAGE_SIZE - 1) / PAGE_SIZE;
        for _ in 0..count {
            self.map_page(virt, virt, perm);
            virt += PAGE_SIZE;
        }
    }

    /// Walk (and create) the page tables down to the leaf for `virt`.
    pub fn map_page(&mut self, virt: Addr, phys: Addr, perm: u8) {
        let slice = self.mem_slice();
        let mem_pe = self.machine.cfg.mem_pe as u16;

        let mut pt_addr = self.root_pt().as_raw();
        for level in (0..tlb::LEVEL_CNT).rev() {
            let idx = (virt >> (tlb::PAGE_BITS + level as u32 * tlb::LEVEL_BITS)) & tlb::LEVEL_MASK;
            let pte_addr = pt_addr + (idx << tlb::PTE_BITS);

            let mut entry = self.machine.phys_read_u64(self.pe, pte_addr);
            assert!(level > 0 || entry & 0xF == 0, "leaf PTE for {:#x} already present", virt);

            if entry & 0xF == 0 {
                let offset = if level == 0 {
                    slice + phys
                } else {
                    let frame = self.next_frame;
                    self.next_frame += 1;
                    slice + (frame << tlb::PAGE_BITS)
                };
                let frame_addr = NocAddr::new(mem_pe, 0, offset).as_raw();

                // fresh page tables start out zeroed
                if level > 0 {
                    self.zero_page(frame_addr);
                }

                let ixwr = if level == 0 { perm } else { access::RWX };
                entry = (frame_addr & !PAGE_MASK) | ixwr as u64;
                log::debug!(
                    "creating level {} PTE for virt={:#x} @ {:#x}: {:#x}",
                    level, virt, pte_addr, entry
                );
                self.machine.phys_write_u64(self.pe, pte_addr, entry);
            }

            pt_addr = entry & !PAGE_MASK;
        }
    }

    fn zero_page(&mut self, addr: Addr) {
        self.machine.phys_write(self.pe, addr, &[0u8; PAGE_SIZE as usize]);
    }
}
