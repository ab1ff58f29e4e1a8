//! The DTU model.
//!
//! One `Dtu` per processing element. The local core drives it through the
//! memory-mapped register file; everything off-tile goes through NoC
//! packets. Internally the DTU is a set of tightly coupled engines:
//!
//! ```text
//!             CPU (MMIO)                    NoC
//!                 │                          │
//!                 ▼                          ▼
//!          ┌─────────────┐          ┌──────────────────┐
//!          │  RegFile    │ COMMAND  │ packet classifier │
//!          └──────┬──────┘────┐     └───┬────────┬─────┘
//!                 │           ▼         ▼        ▼
//!                 │      ┌────────┐ ┌───────┐ ┌───────┐
//!                 │      │  MSG   │ │  MEM  │ │  PTU  │
//!                 │      └───┬────┘ └───┬───┘ └───▲───┘
//!                 │          └─────┬────┘         │
//!                 │                ▼              │
//!                 │           ┌────────┐  translate
//!                 └──────────►│  XFER  │──────────┘
//!                             └────────┘
//! ```
//!
//! The host simulator is out of scope; the DTU talks to it through two
//! narrow channels: a [`DtuCtx`] handed into every call (current tick,
//! functional access to local memory) and a list of [`DtuAction`]s the DTU
//! emits (events to schedule, memory and NoC requests, CPU controls). The
//! host performs the actions either with simulated latency (timing mode) or
//! immediately (atomic mode); the DTU never blocks.

pub mod mem_unit;
pub mod msg_unit;
pub mod pt_unit;
pub mod regfile;
pub mod tlb;
pub mod xfer_unit;

use crate::error::Error;
use crate::noc::{Addr, Cycles, NocAddr, NocPacket, NocPacketType};

use self::msg_unit::MessageUnit;
use self::pt_unit::{PtUnit, TransWaiter};
use self::regfile::{CmdReg, DtuReg, RegAccess, RegFile};
use self::tlb::{access, Tlb, TlbResult};
use self::xfer_unit::{PendingTransfer, XferUnit};

/// Endpoint 0 always belongs to the kernel syscall channel.
pub const SYSCALL_EP: usize = 0;

pub const NUM_CMD_OPCODE_BITS: u32 = 3;

/// Construction-time parameters of one DTU instance.
#[derive(Debug, Clone)]
pub struct DtuParams {
    pub core_id: u16,
    pub num_endpoints: usize,
    pub max_noc_packet_size: usize,
    pub num_cmd_epid_bits: u32,
    pub block_size: usize,
    pub buf_count: usize,
    pub buf_size: usize,
    /// 0 disables the TLB (and with it the page-table walker).
    pub tlb_entries: usize,
    pub cache_blocks: usize,
    pub cache_blocks_per_cycle: usize,
    pub register_access_latency: Cycles,
    pub command_to_noc_request_latency: Cycles,
    pub start_msg_transfer_delay: Cycles,
    pub transfer_to_mem_request_latency: Cycles,
    pub transfer_to_noc_latency: Cycles,
    pub noc_to_transfer_latency: Cycles,
    pub reg_file_base_addr: Addr,
    pub rw_barrier: Addr,
    pub pf_fail_threshold: u32,
    pub pf_fail_irq: u8,
    /// PE that carries the global memory, and this PE's slice within it.
    pub mem_pe: u16,
    pub mem_offset: Addr,
}

/// Functional access to the memory visible from this PE. NoC-encoded
/// addresses reach other PEs' memory, plain addresses the local store.
pub trait FunctionalMem {
    fn read(&mut self, addr: Addr, buf: &mut [u8]);
    fn write(&mut self, addr: Addr, data: &[u8]);
}

/// Per-call context the host hands into the DTU.
pub struct DtuCtx<'a> {
    pub now: Cycles,
    pub mem: &'a mut dyn FunctionalMem,
    pub actions: &'a mut Vec<DtuAction>,
}

impl DtuCtx<'_> {
    pub fn push(&mut self, action: DtuAction) {
        self.actions.push(action);
    }

    pub fn schedule(&mut self, delay: Cycles, event: DtuEvent) {
        self.actions.push(DtuAction::Schedule { delay, event });
    }
}

/// Side effects the DTU asks the host to perform.
#[derive(Debug)]
pub enum DtuAction {
    /// Run `event` against this DTU after `delay` cycles.
    Schedule { delay: Cycles, event: DtuEvent },
    /// Issue a local-memory request; completion arrives via
    /// [`Dtu::complete_mem_request`].
    MemRequest(MemRequest),
    /// Put a request packet on the NoC; the response comes back through
    /// [`Dtu::complete_noc_request`].
    NocRequest { pkt: NocPacket, delay: Cycles },
    /// Send a response for an inbound NoC packet.
    NocResponse { pkt: NocPacket, delay: Cycles },
    /// Answer a forwarded last-level-cache request.
    CacheMemResponse { pkt: NocPacket, success: bool },
    /// Answer a CPU data access that went through translation.
    CpuResponse { req: CpuRequest, success: bool },
    /// Activate the local core if it is suspended.
    WakeupCore,
    /// Pin or unpin the core's ability to suspend.
    DenySuspend(bool),
    /// Deliver an interrupt vector to the local interrupt controller.
    InjectIrq(u8),
    /// Invalidate the local cache hierarchy.
    InvalidateCaches,
}

/// Deferred work scheduled by the DTU for itself.
#[derive(Debug)]
pub enum DtuEvent {
    ExecuteCommand,
    FinishCommand(Error),
    ExecExternCmd(Option<NocPacket>),
    /// One step of the per-block transfer loop of the given buffer.
    TransferStep(usize),
    /// Retry of a transfer start that found no free buffer.
    StartTransfer(Box<PendingTransfer>),
    /// Run the translate event with the given id.
    Translate(usize),
    /// Issue the next chunk of a READ/WRITE command.
    MemCmdContinue { read: bool },
}

/// Why a local-memory request was issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemReqType {
    /// Data movement for a transfer buffer; `tag` is the buffer id.
    Transfer,
    /// Header read-back for a reply; `tag` is the endpoint id.
    Header,
    /// Page-table entry load; `tag` is the translate-event id.
    Translation,
}

/// A request toward local memory (timing path).
#[derive(Debug)]
pub struct MemRequest {
    pub addr: Addr,
    pub size: usize,
    /// `Some` for writes, `None` for reads.
    pub data: Option<Vec<u8>>,
    pub rtype: MemReqType,
    pub tag: u64,
    pub delay: Cycles,
}

/// Completion of a [`MemRequest`]; `data` carries read results.
#[derive(Debug)]
pub struct MemResponse {
    pub addr: Addr,
    pub rtype: MemReqType,
    pub tag: u64,
    pub data: Vec<u8>,
}

/// A CPU-side access (anything below the MMIO window): a data read or
/// write, or an instruction fetch.
#[derive(Debug, Clone)]
pub struct CpuRequest {
    pub addr: Addr,
    pub data: Vec<u8>,
    pub is_write: bool,
    pub is_exec: bool,
}

/// Command register opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Idle = 0,
    Send = 1,
    Reply = 2,
    Read = 3,
    Write = 4,
    FetchMsg = 5,
    AckMsg = 6,
    DebugMsg = 7,
}

impl Opcode {
    fn from_bits(bits: u64) -> Self {
        match bits & 0x7 {
            0 => Opcode::Idle,
            1 => Opcode::Send,
            2 => Opcode::Reply,
            3 => Opcode::Read,
            4 => Opcode::Write,
            5 => Opcode::FetchMsg,
            6 => Opcode::AckMsg,
            7 => Opcode::DebugMsg,
            _ => unreachable!(),
        }
    }
}

/// Decoded COMMAND register.
#[derive(Debug, Clone, Copy)]
pub struct Command {
    pub opcode: Opcode,
    pub arg: u64,
    pub epid: usize,
    pub error: Error,
}

/// External (privileged) command opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternOpcode {
    WakeupCore = 0,
    InvPage = 1,
    InvTlb = 2,
    InvCache = 3,
    InjectIrq = 4,
}

#[derive(Debug, Clone, Copy)]
pub struct ExternCommand {
    pub opcode: ExternOpcode,
    pub arg: u64,
}

/// Commands the local cache hierarchy may forward to the DTU. There is no
/// coherence across tiles, so only plain reads and writes travel the NoC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheCmd {
    Read,
    Write,
    CleanEvict,
    InvalidateReq,
    BadAddressError,
}

/// The per-PE data transfer unit.
pub struct Dtu {
    pub params: DtuParams,
    regs: RegFile,
    pub(crate) tlb: Option<Tlb>,
    pub(crate) msg: MessageUnit,
    pub(crate) xfer: XferUnit,
    pub(crate) pt: Option<PtUnit>,
    cmd_in_progress: bool,
}

impl Dtu {
    pub fn new(params: DtuParams) -> Self {
        assert!(params.buf_size >= params.max_noc_packet_size);
        assert!(
            NUM_CMD_OPCODE_BITS + params.num_cmd_epid_bits <= 64,
            "command encoding does not fit a register"
        );

        let mut regs = RegFile::new(format!("dtu{}.regs", params.core_id), params.num_endpoints);
        regs.set(DtuReg::RwBarrier, params.rw_barrier);
        regs.set(
            DtuReg::RootPt,
            NocAddr::new(params.mem_pe, 0, params.mem_offset).as_raw(),
        );
        regs.set(DtuReg::VpeId, crate::noc::INVALID_VPE_ID as u64);

        let xfer = XferUnit::new(params.block_size, params.buf_count, params.buf_size);
        let tlb = (params.tlb_entries > 0).then(|| Tlb::new(params.tlb_entries));
        let pt = (params.tlb_entries > 0).then(PtUnit::default);

        Self {
            params,
            regs,
            tlb,
            msg: MessageUnit::default(),
            xfer,
            pt,
            cmd_in_progress: false,
        }
    }

    pub fn core_id(&self) -> u16 {
        self.params.core_id
    }

    pub fn regs(&self) -> &RegFile {
        &self.regs
    }

    /// Direct register access for privileged setup and tests.
    pub fn regs_mut(&mut self) -> &mut RegFile {
        &mut self.regs
    }

    pub fn tlb_mut(&mut self) -> Option<&mut Tlb> {
        self.tlb.as_mut()
    }

    pub fn command_in_progress(&self) -> bool {
        self.cmd_in_progress
    }

    // ------------------------------------------------------------------
    // command register
    // ------------------------------------------------------------------

    /// Decode the COMMAND register:
    ///
    /// ```text
    /// |  error  |   arg   |  opcode  |
    ///            ^num_cmd_epid_bits ^3
    /// ```
    pub fn get_command(&self) -> Command {
        let reg = self.regs.get_cmd(CmdReg::Command);
        let bits = NUM_CMD_OPCODE_BITS + self.params.num_cmd_epid_bits;
        let arg = reg >> NUM_CMD_OPCODE_BITS;
        Command {
            opcode: Opcode::from_bits(reg),
            arg,
            epid: (arg & ((1 << self.params.num_cmd_epid_bits) - 1)) as usize,
            error: Error::from_u64(reg >> bits),
        }
    }

    /// Entry point of the command dispatcher, scheduled on COMMAND writes.
    pub fn execute_command(&mut self, ctx: &mut DtuCtx) {
        let cmd = self.get_command();
        if cmd.opcode == Opcode::Idle {
            return;
        }

        assert!(!self.cmd_in_progress, "command issued while another is in progress");
        self.cmd_in_progress = true;

        if cmd.opcode != Opcode::DebugMsg {
            assert!(
                (cmd.arg as usize) < self.params.num_endpoints,
                "command EP{} out of range",
                cmd.arg
            );
            log::debug!(
                "dtu{}: starting command {:?} with EP{}",
                self.params.core_id, cmd.opcode, cmd.arg
            );
        }

        match cmd.opcode {
            Opcode::Send | Opcode::Reply => self.start_transmission(ctx, cmd),
            Opcode::Read => self.mem_start_read(ctx, cmd),
            Opcode::Write => self.mem_start_write(ctx, cmd),
            Opcode::FetchMsg => {
                let addr = self.fetch_message(cmd.epid);
                self.regs.set_cmd(CmdReg::Offset, addr);
                self.finish_command(ctx, Error::None);
            }
            Opcode::AckMsg => {
                self.ack_message(cmd.epid);
                self.finish_command(ctx, Error::None);
            }
            Opcode::DebugMsg => {
                log::debug!("dtu{}: DEBUG {:#x}", self.params.core_id, cmd.arg);
                self.finish_command(ctx, Error::None);
            }
            Opcode::Idle => unreachable!(),
        }
    }

    /// Store `error` in the COMMAND register (opcode back to IDLE) so
    /// software sees the command as finished.
    pub fn finish_command(&mut self, ctx: &mut DtuCtx, error: Error) {
        let cmd = self.get_command();
        assert!(self.cmd_in_progress);

        if cmd.opcode == Opcode::Reply {
            self.finish_msg_reply(ctx, error, cmd.epid);
        }

        log::debug!(
            "dtu{}: finished command {:?} with EP{} -> {}",
            self.params.core_id, cmd.opcode, cmd.arg, error as u64
        );

        let bits = NUM_CMD_OPCODE_BITS + self.params.num_cmd_epid_bits;
        self.regs.set_cmd(CmdReg::Command, (error as u64) << bits);
        self.cmd_in_progress = false;
    }

    /// Schedule command completion, unless the command was cancelled by an
    /// earlier failure.
    pub(crate) fn schedule_finish_op(&mut self, ctx: &mut DtuCtx, delay: Cycles, error: Error) {
        if self.cmd_in_progress {
            ctx.schedule(delay, DtuEvent::FinishCommand(error));
        }
    }

    // ------------------------------------------------------------------
    // external commands
    // ------------------------------------------------------------------

    pub fn get_extern_command(&self) -> ExternCommand {
        let reg = self.regs.get(DtuReg::ExtCmd);
        let opcode = match reg & 0x7 {
            0 => ExternOpcode::WakeupCore,
            1 => ExternOpcode::InvPage,
            2 => ExternOpcode::InvTlb,
            3 => ExternOpcode::InvCache,
            4 => ExternOpcode::InjectIrq,
            op => panic!("invalid external command opcode {:#x}", op),
        };
        ExternCommand { opcode, arg: reg >> 3 }
    }

    pub fn execute_extern_command(&mut self, ctx: &mut DtuCtx, pkt: Option<NocPacket>) {
        let cmd = self.get_extern_command();
        log::debug!(
            "dtu{}: executing external command {:?} with arg={:#x}",
            self.params.core_id, cmd.opcode, cmd.arg
        );

        let mut delay: Cycles = 1;
        match cmd.opcode {
            ExternOpcode::WakeupCore => self.wakeup_core(ctx),
            ExternOpcode::InvPage => {
                if let Some(tlb) = self.tlb.as_mut() {
                    tlb.remove(cmd.arg);
                }
            }
            ExternOpcode::InvTlb => {
                if let Some(tlb) = self.tlb.as_mut() {
                    tlb.clear();
                }
            }
            ExternOpcode::InvCache => {
                delay = (self.params.cache_blocks / self.params.cache_blocks_per_cycle) as Cycles;
                ctx.push(DtuAction::InvalidateCaches);
            }
            ExternOpcode::InjectIrq => self.inject_irq(ctx, cmd.arg as u8),
        }

        if let Some(mut pkt) = pkt {
            pkt.make_response();
            ctx.push(DtuAction::NocResponse { pkt, delay });
        }
    }

    pub(crate) fn wakeup_core(&mut self, ctx: &mut DtuCtx) {
        ctx.push(DtuAction::WakeupCore);
    }

    pub(crate) fn update_suspendable_pin(&mut self, ctx: &mut DtuCtx) {
        let pending = self.regs.get(DtuReg::MsgCnt) > 0;
        ctx.push(DtuAction::DenySuspend(pending));
    }

    pub(crate) fn inject_irq(&mut self, ctx: &mut DtuCtx, vector: u8) {
        ctx.push(DtuAction::InjectIrq(vector));
    }

    // ------------------------------------------------------------------
    // host entry points
    // ------------------------------------------------------------------

    /// Run a previously scheduled event.
    pub fn process_event(&mut self, ctx: &mut DtuCtx, event: DtuEvent) {
        match event {
            DtuEvent::ExecuteCommand => self.execute_command(ctx),
            DtuEvent::FinishCommand(error) => self.finish_command(ctx, error),
            DtuEvent::ExecExternCmd(pkt) => self.execute_extern_command(ctx, pkt),
            DtuEvent::TransferStep(buf) => self.xfer_process(ctx, buf),
            DtuEvent::StartTransfer(pending) => self.retry_transfer(ctx, *pending),
            DtuEvent::Translate(ev) => self.pt_process(ctx, ev),
            DtuEvent::MemCmdContinue { read } => self.mem_continue(ctx, read),
        }
    }

    /// Inbound request from the NoC.
    pub fn handle_noc_request(&mut self, ctx: &mut DtuCtx, pkt: NocPacket) {
        match pkt.packet_type {
            NocPacketType::Message | NocPacketType::Pagefault => {
                self.msg_recv_from_noc(ctx, pkt);
            }
            NocPacketType::ReadReq | NocPacketType::WriteReq => {
                let addr = NocAddr::from_raw(pkt.addr);
                if addr.offset >= self.params.reg_file_base_addr {
                    self.forward_noc_to_regfile(ctx, pkt);
                } else {
                    self.mem_recv_from_noc(ctx, pkt);
                }
            }
            NocPacketType::CacheMemReq => self.mem_recv_from_noc(ctx, pkt),
            NocPacketType::CacheMemReqFunc => self.mem_recv_functional(ctx, pkt),
        }
    }

    /// A response to one of our own NoC requests came back.
    pub fn complete_noc_request(&mut self, ctx: &mut DtuCtx, pkt: NocPacket) {
        match pkt.packet_type {
            NocPacketType::CacheMemReq => {
                let mut pkt = pkt;
                let phys = NocAddr::from_raw(pkt.addr);
                log::debug!(
                    "dtu{}: finished LLC {} of {} bytes @ {} -> {}",
                    self.params.core_id,
                    if pkt.is_write { "write" } else { "read" },
                    pkt.size,
                    phys,
                    pkt.result as u64
                );

                if pkt.rewritten {
                    // undo the address change from handle_cache_mem_request
                    pkt.addr = phys.offset - self.params.mem_offset;
                    pkt.rewritten = false;
                }

                if pkt.result != Error::None {
                    // the VPE is gone; resolve the address again so the
                    // kernel can patch things up
                    let virt = pkt.addr;
                    self.start_translate(
                        ctx,
                        virt,
                        access::INTERN | access::GONE,
                        TransWaiter::CacheMem { pkt },
                        true,
                    );
                } else {
                    ctx.push(DtuAction::CacheMemResponse { pkt, success: true });
                }
            }
            NocPacketType::Pagefault => {
                if pkt.result != Error::None {
                    self.pt_sending_pf_failed(ctx, &pkt);
                }
            }
            NocPacketType::CacheMemReqFunc => {}
            NocPacketType::Message | NocPacketType::ReadReq | NocPacketType::WriteReq => {
                if pkt.is_write {
                    self.mem_write_complete(ctx, pkt);
                } else {
                    self.mem_read_complete(ctx, pkt);
                }
            }
        }
    }

    /// A response from local memory came back.
    pub fn complete_mem_request(&mut self, ctx: &mut DtuCtx, resp: MemResponse) {
        match resp.rtype {
            MemReqType::Transfer => self.xfer_recv_mem_response(ctx, resp.tag as usize, &resp.data),
            MemReqType::Header => self.msg_recv_from_mem(ctx, resp),
            MemReqType::Translation => self.pt_recv_from_mem(ctx, resp),
        }
    }

    /// An access from the local CPU: MMIO into the register window, or a
    /// data access that is translated and forwarded to local memory.
    ///
    /// Returns `false` if the access was rejected.
    pub fn handle_cpu_request(&mut self, ctx: &mut DtuCtx, mut req: CpuRequest) -> bool {
        if req.addr >= self.params.reg_file_base_addr {
            self.forward_request_to_regfile(ctx, &mut req, true);
            ctx.push(DtuAction::CpuResponse { req, success: true });
            return true;
        }

        if req.is_write && req.addr >= self.regs.get(DtuReg::RwBarrier) {
            log::warn!("dtu{}: ignoring write access above rwBarrier", self.params.core_id);
            return false;
        }

        let acc = if req.is_exec {
            assert!(!req.is_write);
            access::EXEC
        } else if req.is_write {
            access::WRITE
        } else {
            access::READ
        } | access::INTERN;
        match self.translate_cpu(req.addr, acc) {
            CpuTranslation::Done(phys) => {
                self.cpu_access_mem(ctx, req, phys);
                true
            }
            CpuTranslation::Pending { pf } => {
                let virt = req.addr;
                self.start_translate(ctx, virt, acc, TransWaiter::CpuAccess { req }, pf);
                true
            }
            CpuTranslation::Failed => false,
        }
    }

    pub(crate) fn cpu_access_mem(&mut self, ctx: &mut DtuCtx, mut req: CpuRequest, phys: NocAddr) {
        if req.is_write {
            ctx.mem.write(phys.as_raw(), &req.data);
        } else {
            let mut buf = vec![0u8; req.data.len()];
            ctx.mem.read(phys.as_raw(), &mut buf);
            req.data = buf;
        }
        ctx.push(DtuAction::CpuResponse { req, success: true });
    }

    fn translate_cpu(&mut self, virt: Addr, acc: u8) -> CpuTranslation {
        let Some(tlb) = self.tlb.as_mut() else {
            // no TLB: addresses are physical already
            return CpuTranslation::Done(NocAddr::from_raw(virt));
        };
        let (res, phys) = tlb.lookup(virt, acc);
        match res {
            TlbResult::Hit => CpuTranslation::Done(phys),
            TlbResult::Nomap => CpuTranslation::Failed,
            TlbResult::Miss => CpuTranslation::Pending { pf: false },
            TlbResult::Pagefault => CpuTranslation::Pending { pf: true },
        }
    }

    /// MMIO access to the register window, from the CPU or from the NoC.
    pub fn forward_request_to_regfile(
        &mut self,
        ctx: &mut DtuCtx,
        req: &mut CpuRequest,
        is_cpu: bool,
    ) {
        let offset = req.addr - self.params.reg_file_base_addr;
        let acc = if is_cpu { RegAccess::Cpu } else { RegAccess::Noc };
        let result = self.regs.handle_request(offset, &mut req.data, req.is_write, acc);

        self.update_suspendable_pin(ctx);

        let when = self.params.register_access_latency;
        if result.wrote_ext_cmd {
            ctx.schedule(when, DtuEvent::ExecExternCmd(None));
        } else if result.wrote_cmd {
            ctx.schedule(when, DtuEvent::ExecuteCommand);
        }
    }

    fn forward_noc_to_regfile(&mut self, ctx: &mut DtuCtx, mut pkt: NocPacket) {
        let offset = NocAddr::from_raw(pkt.addr).offset - self.params.reg_file_base_addr;
        if !pkt.is_write {
            pkt.data = vec![0u8; pkt.size];
        }
        let is_write = pkt.is_write;
        let result = self.regs.handle_request(offset, &mut pkt.data, is_write, RegAccess::Noc);

        self.update_suspendable_pin(ctx);

        let when = self.params.register_access_latency;
        if result.wrote_ext_cmd {
            // the response is sent once the external command has executed
            ctx.schedule(when, DtuEvent::ExecExternCmd(Some(pkt)));
        } else {
            pkt.make_response();
            ctx.push(DtuAction::NocResponse { pkt, delay: when });
            if result.wrote_cmd {
                ctx.schedule(when, DtuEvent::ExecuteCommand);
            }
        }
    }

    /// A request from the local last-level cache that missed on-tile.
    ///
    /// Addresses that are not valid NoC addresses occur while loading a
    /// program at startup and on core TLB misses; they are redirected into
    /// this PE's slice of the global memory. CleanEvict is dropped
    /// silently; invalidations and bad-address errors are rejected.
    pub fn handle_cache_mem_request(
        &mut self,
        ctx: &mut DtuCtx,
        mut pkt: NocPacket,
        cmd: CacheCmd,
        functional: bool,
    ) -> bool {
        match cmd {
            CacheCmd::CleanEvict => {
                log::debug!("dtu{}: dropping CleanEvict packet", self.params.core_id);
                return true;
            }
            CacheCmd::InvalidateReq | CacheCmd::BadAddressError => return false,
            CacheCmd::Read | CacheCmd::Write => {}
        }

        let mut phys = NocAddr::from_raw(pkt.addr);
        if !phys.valid {
            phys = NocAddr::new(self.params.mem_pe, 0, self.params.mem_offset + phys.offset);
            pkt.addr = phys.as_raw();
            if !functional {
                pkt.rewritten = true;
            }
        }

        log::debug!(
            "dtu{}: handling LLC {} of {} bytes @ {}",
            self.params.core_id,
            if pkt.is_write { "write" } else { "read" },
            pkt.size,
            phys
        );

        pkt.packet_type = if functional {
            NocPacketType::CacheMemReqFunc
        } else {
            NocPacketType::CacheMemReq
        };
        ctx.push(DtuAction::NocRequest { pkt, delay: 1 });
        true
    }
}

enum CpuTranslation {
    Done(NocAddr),
    Pending { pf: bool },
    Failed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::memory::Memory;

    pub(crate) fn test_params(core_id: u16) -> DtuParams {
        DtuParams {
            core_id,
            num_endpoints: 16,
            max_noc_packet_size: 4096,
            num_cmd_epid_bits: 8,
            block_size: 64,
            buf_count: 4,
            buf_size: 4096,
            tlb_entries: 0,
            cache_blocks: 0,
            cache_blocks_per_cycle: 8,
            register_access_latency: 1,
            command_to_noc_request_latency: 3,
            start_msg_transfer_delay: 2,
            transfer_to_mem_request_latency: 1,
            transfer_to_noc_latency: 3,
            noc_to_transfer_latency: 3,
            reg_file_base_addr: 0x5C00_0000,
            rw_barrier: 0x5B00_0000,
            pf_fail_threshold: 100,
            pf_fail_irq: 0x41,
            mem_pe: 0,
            mem_offset: 0,
        }
    }

    struct LocalMem(Memory);

    impl FunctionalMem for LocalMem {
        fn read(&mut self, addr: Addr, buf: &mut [u8]) {
            self.0.read(NocAddr::from_raw(addr).offset, buf);
        }
        fn write(&mut self, addr: Addr, data: &[u8]) {
            self.0.write(NocAddr::from_raw(addr).offset, data);
        }
    }

    #[test]
    fn test_command_decode() {
        let mut dtu = Dtu::new(test_params(0));
        // opcode SEND (1), arg 3, error field empty
        dtu.regs_mut().set_cmd(CmdReg::Command, (3 << 3) | 1);
        let cmd = dtu.get_command();
        assert_eq!(cmd.opcode, Opcode::Send);
        assert_eq!(cmd.arg, 3);
        assert_eq!(cmd.epid, 3);
        assert_eq!(cmd.error, Error::None);
    }

    #[test]
    fn test_finish_command_writes_error() {
        let mut dtu = Dtu::new(test_params(0));
        let mut mem = LocalMem(Memory::new());
        let mut actions = Vec::new();
        let mut ctx = DtuCtx { now: 0, mem: &mut mem, actions: &mut actions };

        dtu.regs_mut().set_cmd(CmdReg::Command, (5 << 3) | Opcode::DebugMsg as u64);
        dtu.execute_command(&mut ctx);

        let cmd = dtu.get_command();
        assert_eq!(cmd.opcode, Opcode::Idle);
        assert_eq!(cmd.error, Error::None);
        assert!(!dtu.command_in_progress());
    }

    #[test]
    #[should_panic]
    fn test_double_command_is_fatal() {
        let mut dtu = Dtu::new(test_params(0));
        let mut mem = LocalMem(Memory::new());
        let mut actions = Vec::new();
        let mut ctx = DtuCtx { now: 0, mem: &mut mem, actions: &mut actions };

        dtu.cmd_in_progress = true;
        dtu.regs_mut().set_cmd(CmdReg::Command, Opcode::DebugMsg as u64);
        dtu.execute_command(&mut ctx);
    }

    #[test]
    fn test_extern_command_decode() {
        let mut dtu = Dtu::new(test_params(0));
        dtu.regs_mut().set(DtuReg::ExtCmd, (0x41 << 3) | ExternOpcode::InjectIrq as u64);
        let cmd = dtu.get_extern_command();
        assert_eq!(cmd.opcode, ExternOpcode::InjectIrq);
        assert_eq!(cmd.arg, 0x41);
    }

    #[test]
    fn test_extern_inject_irq_action() {
        let mut dtu = Dtu::new(test_params(0));
        let mut mem = LocalMem(Memory::new());
        let mut actions = Vec::new();
        let mut ctx = DtuCtx { now: 0, mem: &mut mem, actions: &mut actions };

        dtu.regs_mut().set(DtuReg::ExtCmd, (0x41 << 3) | ExternOpcode::InjectIrq as u64);
        dtu.execute_extern_command(&mut ctx, None);

        assert!(actions.iter().any(|a| matches!(a, DtuAction::InjectIrq(0x41))));
    }

    #[test]
    fn test_cpu_write_above_barrier_rejected() {
        let mut dtu = Dtu::new(test_params(0));
        let mut mem = LocalMem(Memory::new());
        let mut actions = Vec::new();
        let mut ctx = DtuCtx { now: 0, mem: &mut mem, actions: &mut actions };

        let req = CpuRequest { addr: 0x5B00_0010, data: vec![0u8; 8], is_write: true, is_exec: false };
        assert!(!dtu.handle_cpu_request(&mut ctx, req));
    }

    #[test]
    fn test_cache_requests_without_noc_counterpart() {
        let mut dtu = Dtu::new(test_params(0));
        let mut mem = LocalMem(Memory::new());
        let mut actions = Vec::new();
        let mut ctx = DtuCtx { now: 0, mem: &mut mem, actions: &mut actions };

        let pkt = NocPacket::write(NocPacketType::CacheMemReq, 0x4000, vec![0u8; 64], 0);
        assert!(dtu.handle_cache_mem_request(&mut ctx, pkt.clone(), CacheCmd::CleanEvict, false));
        assert!(!dtu.handle_cache_mem_request(&mut ctx, pkt.clone(), CacheCmd::InvalidateReq, false));
        assert!(!dtu.handle_cache_mem_request(&mut ctx, pkt, CacheCmd::BadAddressError, false));
        // none of them made it onto the NoC
        assert!(actions.is_empty());
    }

    #[test]
    fn test_cache_mem_request_rewrites_invalid_addr() {
        let mut params = test_params(2);
        params.mem_pe = 0;
        params.mem_offset = 0x100000;
        let mut dtu = Dtu::new(params);
        let mut mem = LocalMem(Memory::new());
        let mut actions = Vec::new();
        let mut ctx = DtuCtx { now: 0, mem: &mut mem, actions: &mut actions };

        let pkt = NocPacket::read(NocPacketType::CacheMemReq, 0x4000, 64, 2);
        dtu.handle_cache_mem_request(&mut ctx, pkt, CacheCmd::Read, false);

        match &actions[0] {
            DtuAction::NocRequest { pkt, .. } => {
                let addr = NocAddr::from_raw(pkt.addr);
                assert!(addr.valid);
                assert_eq!(addr.core_id, 0);
                assert_eq!(addr.offset, 0x104000);
                assert!(pkt.rewritten);
            }
            other => panic!("unexpected action {:?}", other),
        }
    }
}
