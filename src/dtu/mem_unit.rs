//! The memory engine.
//!
//! READ and WRITE commands turn a MEMORY endpoint into remote-memory
//! traffic. A command covers `DATA_SIZE` bytes at `remote_addr + OFFSET` on
//! the endpoint's target core; oversized requests are cut into
//! `max_noc_packet_size` chunks, the command registers advancing after each
//! completed chunk so a continue event can issue the next one. Only the
//! last chunk finishes the command.
//!
//! The receive side serves READ_REQ/WRITE_REQ (and forwarded cache-memory
//! requests) against local memory through the transfer engine.

use crate::error::Error;
use crate::noc::{NocAddr, NocPacket, NocPacketType};

use super::regfile::{mem_flags, CmdReg, EpType};
use super::xfer_unit::{xfer_flags, TransferType};
use super::{Command, Dtu, DtuAction, DtuCtx, DtuEvent, Opcode};

// The memory engine carries no state of its own: chunk progress lives in
// the command registers, which software must not touch while a command is
// in flight anyway.
impl Dtu {
    /// READ: fetch remote bytes, then write them to local memory.
    pub(crate) fn mem_start_read(&mut self, ctx: &mut DtuCtx, cmd: Command) {
        let ep = self.regs().get_mem_ep(cmd.epid);
        assert_eq!(self.regs().ep_type(cmd.epid), EpType::Memory, "READ on non-memory EP");

        if ep.flags & mem_flags::READ == 0 {
            self.finish_command(ctx, Error::NoPerm);
            return;
        }

        let offset = self.regs().get_cmd(CmdReg::Offset);
        let total = self.regs().get_cmd(CmdReg::DataSize) as usize;
        if total == 0 {
            self.finish_command(ctx, Error::None);
            return;
        }

        let size = total.min(self.params.max_noc_packet_size);
        assert!(
            offset + size as u64 <= ep.remote_size,
            "EP{}: read outside the endpoint window",
            cmd.epid
        );

        let requested = ep.remote_addr + offset;
        log::debug!(
            "dtu{}: [rd -> {}] with EP{} of {:#x}:{}",
            self.params.core_id, ep.target_core, cmd.epid, requested, size
        );

        let pkt = NocPacket::read(
            NocPacketType::ReadReq,
            NocAddr::new(ep.target_core, ep.vpe_id, requested).as_raw(),
            size,
            self.params.core_id,
        );
        let delay = self.params.command_to_noc_request_latency;
        ctx.push(DtuAction::NocRequest { pkt, delay });
    }

    /// WRITE: read local bytes and push them to the remote PE.
    pub(crate) fn mem_start_write(&mut self, ctx: &mut DtuCtx, cmd: Command) {
        let ep = self.regs().get_mem_ep(cmd.epid);
        assert_eq!(self.regs().ep_type(cmd.epid), EpType::Memory, "WRITE on non-memory EP");

        if ep.flags & mem_flags::WRITE == 0 {
            self.finish_command(ctx, Error::NoPerm);
            return;
        }

        let offset = self.regs().get_cmd(CmdReg::Offset);
        let total = self.regs().get_cmd(CmdReg::DataSize) as usize;
        if total == 0 {
            self.finish_command(ctx, Error::None);
            return;
        }

        let size = total.min(self.params.max_noc_packet_size);
        assert!(
            offset + size as u64 <= ep.remote_size,
            "EP{}: write outside the endpoint window",
            cmd.epid
        );

        let local_addr = self.regs().get_cmd(CmdReg::DataAddr);
        let requested = ep.remote_addr + offset;
        log::debug!(
            "dtu{}: [wr -> {}] with EP{} of {:#x}:{}",
            self.params.core_id, ep.target_core, cmd.epid, requested, size
        );

        let target = NocAddr::new(ep.target_core, ep.vpe_id, requested);
        let delay = self.params.command_to_noc_request_latency;
        self.start_transfer(
            ctx,
            TransferType::LocalRead,
            target,
            local_addr,
            size,
            None,
            None,
            delay,
            0,
        );
    }

    /// Re-issue the command body for the next chunk.
    pub(crate) fn mem_continue(&mut self, ctx: &mut DtuCtx, read: bool) {
        let cmd = self.get_command();
        if read {
            assert_eq!(cmd.opcode, Opcode::Read);
            self.mem_start_read(ctx, cmd);
        } else {
            assert_eq!(cmd.opcode, Opcode::Write);
            self.mem_start_write(ctx, cmd);
        }
    }

    /// Advance the command registers past a completed chunk of `n` bytes.
    /// Returns true if this was the last chunk.
    fn mem_advance_chunk(&mut self, n: usize) -> bool {
        let regs = self.regs_mut();
        let data_addr = regs.get_cmd(CmdReg::DataAddr);
        let offset = regs.get_cmd(CmdReg::Offset);
        let remaining = regs.get_cmd(CmdReg::DataSize);
        assert!(n as u64 <= remaining);

        regs.set_cmd(CmdReg::DataAddr, data_addr + n as u64);
        regs.set_cmd(CmdReg::Offset, offset + n as u64);
        regs.set_cmd(CmdReg::DataSize, remaining - n as u64);
        remaining == n as u64
    }

    /// Response for a READ chunk arrived from the remote DTU.
    pub(crate) fn mem_read_complete(&mut self, ctx: &mut DtuCtx, pkt: NocPacket) {
        let cmd = self.get_command();
        assert_eq!(cmd.opcode, Opcode::Read, "unexpected read response");

        if pkt.result != Error::None {
            self.finish_command(ctx, pkt.result);
            return;
        }

        let local_addr = self.regs().get_cmd(CmdReg::DataAddr);
        let n = pkt.data.len();
        let last = self.mem_advance_chunk(n);

        // received bytes go to local memory; LAST rides on the final chunk
        let delay = self.params.noc_to_transfer_latency;
        let flags = if last { xfer_flags::LAST } else { 0 };
        self.start_transfer(
            ctx,
            TransferType::LocalWrite,
            NocAddr::default(),
            local_addr,
            n,
            Some(pkt),
            None,
            delay,
            flags,
        );

        if !last {
            ctx.schedule(1, DtuEvent::MemCmdContinue { read: true });
        }
    }

    /// Response for an outbound write arrived. This also completes SEND and
    /// REPLY commands, whose message packets are writes on the wire.
    pub(crate) fn mem_write_complete(&mut self, ctx: &mut DtuCtx, pkt: NocPacket) {
        let cmd = self.get_command();
        match cmd.opcode {
            Opcode::Send | Opcode::Reply => {
                // the receiver's verdict (e.g. VPE_GONE, NO_RING_SPACE)
                // becomes the command's result
                self.schedule_finish_op(ctx, 1, pkt.result);
            }
            Opcode::Write => {
                if pkt.result != Error::None {
                    self.finish_command(ctx, pkt.result);
                    return;
                }

                let last = self.mem_advance_chunk(pkt.data.len());
                if last {
                    self.schedule_finish_op(ctx, 1, Error::None);
                } else {
                    ctx.schedule(1, DtuEvent::MemCmdContinue { read: false });
                }
            }
            op => panic!("write response while command {:?} is active", op),
        }
    }

    /// Inbound READ_REQ/WRITE_REQ/CACHE_MEM_REQ: serve it from local memory
    /// through the transfer engine.
    pub(crate) fn mem_recv_from_noc(&mut self, ctx: &mut DtuCtx, pkt: NocPacket) {
        let addr = NocAddr::from_raw(pkt.addr);
        log::debug!(
            "dtu{}: [mem <- {}] {} of {} bytes @ {:#x}",
            self.params.core_id,
            pkt.src,
            if pkt.is_write { "write" } else { "read" },
            if pkt.is_write { pkt.data.len() } else { pkt.size },
            addr.offset
        );

        let delay = self.params.noc_to_transfer_latency;
        if pkt.is_write {
            let size = pkt.data.len();
            self.start_transfer(
                ctx,
                TransferType::RemoteWrite,
                NocAddr::default(),
                addr.offset,
                size,
                Some(pkt),
                None,
                delay,
                0,
            );
        } else {
            let size = pkt.size;
            self.start_transfer(
                ctx,
                TransferType::RemoteRead,
                NocAddr::default(),
                addr.offset,
                size,
                Some(pkt),
                None,
                delay,
                0,
            );
        }
    }

    /// Functional cache-memory access: immediate, no simulated time.
    pub(crate) fn mem_recv_functional(&mut self, ctx: &mut DtuCtx, mut pkt: NocPacket) {
        let offset = NocAddr::from_raw(pkt.addr).offset;
        if pkt.is_write {
            ctx.mem.write(offset, &pkt.data);
        } else {
            let mut buf = vec![0u8; pkt.size];
            ctx.mem.read(offset, &mut buf);
            pkt.data = buf;
        }
        pkt.make_response();
        ctx.push(DtuAction::NocResponse { pkt, delay: 0 });
    }
}
