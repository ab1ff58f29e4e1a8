//! The multi-PE simulation harness.
//!
//! The DTU model proper is host-agnostic; this module is the reference
//! host. It owns one DTU, one memory, and one CPU stub per PE, routes NoC
//! packets between the DTUs, performs their local-memory requests, and
//! drives everything off a single tick-ordered event queue.
//!
//! In timing mode every request pays its configured latency through the
//! queue. In atomic mode requests and responses complete within the call
//! that issued them; the observable state transitions are identical.

use crate::config::SimConfig;
use crate::dtu::regfile::{cmd_reg_mmio_offset, CmdReg};
use crate::dtu::{
    CpuRequest, Dtu, DtuAction, DtuCtx, DtuEvent, DtuParams, FunctionalMem, MemRequest,
    MemResponse,
};
use crate::noc::{Addr, Cycles, NocAddr, NocPacket, NocPacketType};

use super::event::EventQueue;
use super::memory::Memory;

/// Sender id of packets injected from outside any DTU (bringup, tests).
pub const EXTERNAL_SRC: u16 = u16::MAX;

/// Minimal stand-in for the CPU thread context of a PE.
#[derive(Debug, Default)]
pub struct CoreState {
    pub suspended: bool,
    /// Set while unread messages are pending; the core must not suspend.
    pub deny_suspend: bool,
    /// Interrupt vectors delivered to the local APIC.
    pub irqs: Vec<u8>,
    pub wakeups: u64,
}

/// Events the machine schedules for itself.
enum SimEvent {
    Dtu { pe: usize, event: DtuEvent },
    MemAccess { pe: usize, req: MemRequest },
    NocDeliver { pkt: NocPacket },
    NocResponseDeliver { pkt: NocPacket },
}

/// Memory as seen from one PE: NoC-encoded addresses reach other PEs,
/// plain addresses hit the local scratchpad or, on PEs without internal
/// memory, this PE's slice of the global memory.
pub struct MemBus<'a> {
    mems: &'a mut [Memory],
    local: usize,
    local_is_spm: bool,
    mem_pe: usize,
    mem_offset: Addr,
}

impl MemBus<'_> {
    fn resolve(&self, addr: Addr) -> (usize, Addr) {
        let na = NocAddr::from_raw(addr);
        if na.valid {
            (na.core_id as usize, na.offset)
        } else if self.local_is_spm {
            (self.local, addr)
        } else {
            (self.mem_pe, self.mem_offset + addr)
        }
    }
}

impl FunctionalMem for MemBus<'_> {
    fn read(&mut self, addr: Addr, buf: &mut [u8]) {
        let (pe, off) = self.resolve(addr);
        self.mems[pe].read(off, buf);
    }

    fn write(&mut self, addr: Addr, data: &[u8]) {
        let (pe, off) = self.resolve(addr);
        self.mems[pe].write(off, data);
    }
}

/// The simulated machine: all PEs plus the NoC between them.
pub struct Machine {
    pub cfg: SimConfig,
    pub now: Cycles,
    queue: EventQueue<SimEvent>,
    pub dtus: Vec<Dtu>,
    mems: Vec<Memory>,
    pub cores: Vec<CoreState>,
    /// Answered cache-memory requests, kept for the (external) cache model.
    pub cache_mem_responses: Vec<(NocPacket, bool)>,
    /// Answered CPU data accesses, kept for the (external) core model.
    pub cpu_responses: Vec<(CpuRequest, bool)>,
}

impl Machine {
    pub fn new(cfg: SimConfig) -> Self {
        cfg.validate();

        let dtus = (0..cfg.pes.len()).map(|pe| Dtu::new(dtu_params(&cfg, pe))).collect();
        let mems = cfg.pes.iter().map(|_| Memory::new()).collect();
        let cores = cfg.pes.iter().map(|_| CoreState::default()).collect();

        Self {
            cfg,
            now: 0,
            queue: EventQueue::new(),
            dtus,
            mems,
            cores,
            cache_mem_responses: Vec::new(),
            cpu_responses: Vec::new(),
        }
    }

    pub fn num_pes(&self) -> usize {
        self.dtus.len()
    }

    // ------------------------------------------------------------------
    // event loop
    // ------------------------------------------------------------------

    /// Process one event. Returns false when the queue is drained.
    pub fn step(&mut self) -> bool {
        let Some((tick, event)) = self.queue.pop() else {
            return false;
        };
        debug_assert!(tick >= self.now);
        self.now = tick;
        self.dispatch(event);
        true
    }

    /// Run until the event queue drains or `max_steps` events have been
    /// processed. Returns the number of events processed.
    pub fn run(&mut self, max_steps: usize) -> usize {
        let mut steps = 0;
        while steps < max_steps && self.step() {
            steps += 1;
        }
        steps
    }

    fn dispatch(&mut self, event: SimEvent) {
        match event {
            SimEvent::Dtu { pe, event } => {
                self.call_dtu(pe, |dtu, ctx| dtu.process_event(ctx, event));
            }
            SimEvent::MemAccess { pe, req } => self.perform_mem_access(pe, req),
            SimEvent::NocDeliver { pkt } => {
                let dst = NocAddr::from_raw(pkt.addr).core_id as usize;
                assert!(dst < self.dtus.len(), "NoC packet for unknown core {}", dst);
                self.call_dtu(dst, |dtu, ctx| dtu.handle_noc_request(ctx, pkt));
            }
            SimEvent::NocResponseDeliver { pkt } => {
                if pkt.src == EXTERNAL_SRC {
                    return;
                }
                let src = pkt.src as usize;
                self.call_dtu(src, |dtu, ctx| dtu.complete_noc_request(ctx, pkt));
            }
        }
    }

    /// Hand `f` the PE's DTU together with a fresh context, then apply the
    /// actions the call produced.
    fn call_dtu<F>(&mut self, pe: usize, f: F)
    where
        F: FnOnce(&mut Dtu, &mut DtuCtx),
    {
        let mut actions = Vec::new();
        {
            let mut bus = MemBus {
                mems: &mut self.mems,
                local: pe,
                local_is_spm: !self.cfg.pe_uses_paging(pe),
                mem_pe: self.cfg.mem_pe,
                mem_offset: self.cfg.pe_mem_offset(pe),
            };
            let mut ctx = DtuCtx { now: self.now, mem: &mut bus, actions: &mut actions };
            f(&mut self.dtus[pe], &mut ctx);
        }
        self.apply_actions(pe, actions);
    }

    fn apply_actions(&mut self, pe: usize, actions: Vec<DtuAction>) {
        let atomic = self.cfg.atomic;
        for action in actions {
            match action {
                DtuAction::Schedule { delay, event } => {
                    self.queue.push(self.now + delay, SimEvent::Dtu { pe, event });
                }
                DtuAction::MemRequest(req) => {
                    if atomic {
                        self.perform_mem_access(pe, req);
                    } else {
                        let at = self.now + req.delay;
                        self.queue.push(at, SimEvent::MemAccess { pe, req });
                    }
                }
                DtuAction::NocRequest { pkt, delay } => {
                    if atomic {
                        self.dispatch(SimEvent::NocDeliver { pkt });
                    } else {
                        // one extra cycle for the NoC hop
                        self.queue.push(self.now + delay + 1, SimEvent::NocDeliver { pkt });
                    }
                }
                DtuAction::NocResponse { pkt, delay } => {
                    if atomic {
                        self.dispatch(SimEvent::NocResponseDeliver { pkt });
                    } else {
                        self.queue
                            .push(self.now + delay + 1, SimEvent::NocResponseDeliver { pkt });
                    }
                }
                DtuAction::CacheMemResponse { pkt, success } => {
                    self.cache_mem_responses.push((pkt, success));
                }
                DtuAction::CpuResponse { req, success } => {
                    self.cpu_responses.push((req, success));
                }
                DtuAction::WakeupCore => {
                    let core = &mut self.cores[pe];
                    if core.suspended {
                        log::debug!("pe{}: waking up core", pe);
                        core.suspended = false;
                    }
                    core.wakeups += 1;
                }
                DtuAction::DenySuspend(deny) => {
                    let core = &mut self.cores[pe];
                    if core.deny_suspend && !deny {
                        log::debug!("pe{}: core can be suspended", pe);
                    }
                    core.deny_suspend = deny;
                }
                DtuAction::InjectIrq(vector) => {
                    log::debug!("pe{}: IRQ {:#x}", pe, vector);
                    self.cores[pe].irqs.push(vector);
                }
                DtuAction::InvalidateCaches => {
                    // caches live outside the model; nothing to do here
                    log::debug!("pe{}: invalidating caches", pe);
                }
            }
        }
    }

    fn perform_mem_access(&mut self, pe: usize, req: MemRequest) {
        let (tgt, off) = {
            let bus = MemBus {
                mems: &mut self.mems,
                local: pe,
                local_is_spm: !self.cfg.pe_uses_paging(pe),
                mem_pe: self.cfg.mem_pe,
                mem_offset: self.cfg.pe_mem_offset(pe),
            };
            bus.resolve(req.addr)
        };

        let data = match req.data {
            Some(data) => {
                self.mems[tgt].write(off, &data);
                data
            }
            None => {
                let mut buf = vec![0u8; req.size];
                self.mems[tgt].read(off, &mut buf);
                buf
            }
        };

        let resp = MemResponse { addr: req.addr, rtype: req.rtype, tag: req.tag, data };
        self.call_dtu(pe, |dtu, ctx| dtu.complete_mem_request(ctx, resp));
    }

    // ------------------------------------------------------------------
    // external access (CPU stub, bringup, tests)
    // ------------------------------------------------------------------

    /// Read or write physical memory as PE `pe` sees it, without simulated
    /// time.
    pub fn phys_write(&mut self, pe: usize, addr: Addr, data: &[u8]) {
        let mut bus = MemBus {
            mems: &mut self.mems,
            local: pe,
            local_is_spm: !self.cfg.pe_uses_paging(pe),
            mem_pe: self.cfg.mem_pe,
            mem_offset: self.cfg.pe_mem_offset(pe),
        };
        bus.write(addr, data);
    }

    pub fn phys_read(&mut self, pe: usize, addr: Addr, buf: &mut [u8]) {
        let mut bus = MemBus {
            mems: &mut self.mems,
            local: pe,
            local_is_spm: !self.cfg.pe_uses_paging(pe),
            mem_pe: self.cfg.mem_pe,
            mem_offset: self.cfg.pe_mem_offset(pe),
        };
        bus.read(addr, buf);
    }

    pub fn phys_read_u64(&mut self, pe: usize, addr: Addr) -> u64 {
        let mut buf = [0u8; 8];
        self.phys_read(pe, addr, &mut buf);
        u64::from_le_bytes(buf)
    }

    pub fn phys_write_u64(&mut self, pe: usize, addr: Addr, value: u64) {
        self.phys_write(pe, addr, &value.to_le_bytes());
    }

    /// Functional write over the NoC (used by PE bringup to plant state in
    /// remote memory).
    pub fn noc_write_functional(&mut self, addr: NocAddr, data: &[u8]) {
        let pkt = NocPacket::write(
            NocPacketType::CacheMemReqFunc,
            addr.as_raw(),
            data.to_vec(),
            EXTERNAL_SRC,
        );
        let dst = addr.core_id as usize;
        self.call_dtu(dst, |dtu, ctx| dtu.handle_noc_request(ctx, pkt));
    }

    /// Functional read over the NoC.
    pub fn noc_read_functional(&mut self, addr: NocAddr, buf: &mut [u8]) {
        let dst = addr.core_id as usize;
        let size = buf.len();
        let mut actions = Vec::new();
        {
            let mut bus = MemBus {
                mems: &mut self.mems,
                local: dst,
                local_is_spm: !self.cfg.pe_uses_paging(dst),
                mem_pe: self.cfg.mem_pe,
                mem_offset: self.cfg.pe_mem_offset(dst),
            };
            let mut ctx = DtuCtx { now: self.now, mem: &mut bus, actions: &mut actions };
            let pkt =
                NocPacket::read(NocPacketType::CacheMemReqFunc, addr.as_raw(), size, EXTERNAL_SRC);
            self.dtus[dst].handle_noc_request(&mut ctx, pkt);
        }
        // the functional path answers synchronously
        let resp = actions
            .into_iter()
            .find_map(|a| match a {
                DtuAction::NocResponse { pkt, .. } => Some(pkt),
                _ => None,
            })
            .expect("functional read without response");
        buf.copy_from_slice(&resp.data);
    }

    /// A CPU data access on PE `pe` (translated through the DTU). The
    /// result lands in `cpu_responses` once it completes.
    pub fn cpu_access(&mut self, pe: usize, req: CpuRequest) -> bool {
        let mut accepted = true;
        self.call_dtu(pe, |dtu, ctx| {
            accepted = dtu.handle_cpu_request(ctx, req);
        });
        accepted
    }

    /// Issue a command on PE `pe` by writing its COMMAND register through
    /// the MMIO path, exactly as the local core would.
    pub fn issue_command(&mut self, pe: usize, value: u64) {
        let addr = self.cfg.reg_file_base_addr + cmd_reg_mmio_offset(CmdReg::Command);
        let req = CpuRequest {
            addr,
            data: value.to_le_bytes().to_vec(),
            is_write: true,
            is_exec: false,
        };
        self.call_dtu(pe, |dtu, ctx| {
            dtu.handle_cpu_request(ctx, req);
        });
    }

    /// Convenience: issue a command and run the machine until it drains.
    pub fn issue_and_run(&mut self, pe: usize, value: u64) {
        self.issue_command(pe, value);
        self.run(100_000);
    }
}

/// Derive one DTU's construction parameters from the machine config.
///
/// Memory PEs and PEs with internal memory get no TLB and one big buffer
/// per slot (reading a whole packet from SPM costs no simulated time);
/// paging PEs use the cache-style buffer pool.
pub fn dtu_params(cfg: &SimConfig, pe: usize) -> DtuParams {
    let paged = cfg.pe_uses_paging(pe);
    let (block_size, buf_size, tlb_entries) = if paged {
        (cfg.block_size, cfg.buf_size, cfg.tlb_entries)
    } else {
        (cfg.max_noc_packet_size, cfg.max_noc_packet_size, 0)
    };
    let buf_count = if cfg.pe_is_mem(pe) { 8 } else { cfg.buf_count };

    DtuParams {
        core_id: pe as u16,
        num_endpoints: cfg.num_endpoints,
        max_noc_packet_size: cfg.max_noc_packet_size,
        num_cmd_epid_bits: cfg.num_cmd_epid_bits,
        block_size,
        buf_count,
        buf_size,
        tlb_entries,
        cache_blocks: cfg.cache_blocks,
        cache_blocks_per_cycle: cfg.cache_blocks_per_cycle,
        register_access_latency: cfg.register_access_latency,
        command_to_noc_request_latency: cfg.command_to_noc_request_latency,
        start_msg_transfer_delay: cfg.start_msg_transfer_delay,
        transfer_to_mem_request_latency: cfg.transfer_to_mem_request_latency,
        transfer_to_noc_latency: cfg.transfer_to_noc_latency,
        noc_to_transfer_latency: cfg.noc_to_transfer_latency,
        reg_file_base_addr: cfg.reg_file_base_addr,
        rw_barrier: cfg.rw_barrier,
        pf_fail_threshold: cfg.pf_fail_threshold,
        pf_fail_irq: cfg.pf_fail_irq,
        mem_pe: cfg.mem_pe as u16,
        mem_offset: cfg.pe_mem_offset(pe),
    }
}
