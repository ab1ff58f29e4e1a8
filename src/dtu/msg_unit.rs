//! The message engine.
//!
//! Implements the send/reply/fetch/ack command quartet and the receive
//! side of MESSAGE packets. Credits throttle senders: a bounded SEND
//! endpoint pays `max_msg_size` credits per message and gets them back when
//! the receiver replies with a credit grant. Receives land in the ring
//! buffer of a RECEIVE endpoint, tracked by the `occupied` and `unread`
//! bitmaps; software consumes them with FETCH_MSG and frees the slot with
//! ACK_MSG.

use crate::error::Error;
use crate::noc::{Addr, MessageHeader, NocAddr, NocPacket, MSG_HEADER_SIZE};

use super::pt_unit::TransWaiter;
use super::regfile::{CmdReg, DtuReg, RecvEp, EpType, CREDITS_UNLIM, MAX_MSGS};
use super::tlb::{access, TlbResult};
use super::xfer_unit::{xfer_flags, TransferType};
use super::{Command, Dtu, DtuAction, DtuCtx, MemReqType, MemRequest, MemResponse, Opcode};

/// Parameters of the outbound message being assembled.
#[derive(Debug, Default)]
struct MsgInfo {
    ready: bool,
    unlim_cred: bool,
    flags: u8,
    target_core: u16,
    target_vpe: u16,
    target_ep: u8,
    reply_ep: u8,
    label: u64,
    reply_label: u64,
}

/// State of the message engine. Only one command runs at a time, so a
/// single set of staging fields suffices.
#[derive(Debug, Default)]
pub struct MessageUnit {
    info: MsgInfo,
    /// Header read back from the receive ring for a reply.
    header_buf: [u8; MSG_HEADER_SIZE],
    header: MessageHeader,
    /// Physical address of the stored header's flags byte.
    flags_phys: Addr,
    /// Read-back progress into `header_buf`.
    offset: usize,
}

impl Dtu {
    /// SEND and REPLY entry point.
    pub(crate) fn start_transmission(&mut self, ctx: &mut DtuCtx, cmd: Command) {
        let epid = cmd.epid;

        // a reply first has to read the stored header back
        if cmd.opcode == Opcode::Reply {
            self.msg.offset = 0;
            self.msg.flags_phys = 0;
            self.request_header(ctx, epid);
            return;
        }

        let message_size = self.regs().get_cmd(CmdReg::DataSize) as usize;
        let mut ep = self.regs().get_send_ep(epid);

        assert!(
            message_size + MSG_HEADER_SIZE <= ep.max_msg_size as usize,
            "EP{}: message size ({}) + header exceeds max message size ({})",
            epid,
            message_size,
            ep.max_msg_size
        );

        if ep.credits != CREDITS_UNLIM {
            if ep.credits < ep.max_msg_size {
                log::debug!(
                    "dtu{}: EP{}: not enough credits ({}) to send message ({})",
                    self.params.core_id, epid, ep.credits, ep.max_msg_size
                );
                self.schedule_finish_op(ctx, 1, Error::MissCredits);
                return;
            }

            ep.credits -= ep.max_msg_size;
            log::debug!(
                "dtu{}: EP{} pays {} credits ({} left)",
                self.params.core_id, epid, ep.max_msg_size, ep.credits
            );
            self.regs_mut().set_send_ep(epid, &ep);
        }

        self.msg.info = MsgInfo {
            ready: true,
            unlim_cred: ep.credits == CREDITS_UNLIM,
            flags: 0,
            target_core: ep.target_core,
            target_vpe: ep.vpe_id as u16,
            target_ep: ep.target_ep,
            reply_ep: self.regs().get_cmd(CmdReg::ReplyEpid) as u8,
            label: ep.label,
            reply_label: self.regs().get_cmd(CmdReg::ReplyLabel),
        };

        self.start_msg_xfer(ctx, cmd);
    }

    /// Issue the (first or next) memory read of the stored header the
    /// OFFSET register points at. The header may straddle two blocks.
    fn request_header(&mut self, ctx: &mut DtuCtx, epid: usize) {
        assert!(self.msg.offset < MSG_HEADER_SIZE);

        let ep = self.regs().get_recv_ep(epid);
        let msg = self.regs().get_cmd(CmdReg::Offset);

        let idx = ep.msg_to_idx(msg);
        assert!(idx != MAX_MSGS, "reply target outside the receive ring");
        assert!(ep.is_occupied(idx), "reply target slot is not occupied");

        let msg_addr = ep.buf_addr + idx as Addr * ep.msg_size as Addr + self.msg.offset as Addr;
        log::debug!(
            "dtu{}: EP{}: requesting header for reply on message @ {:#x} (idx={})",
            self.params.core_id, epid, msg_addr, idx
        );

        let mut phys = NocAddr::from_raw(msg_addr);
        if let Some(tlb) = self.tlb.as_mut() {
            let (res, translated) = tlb.lookup(msg_addr, access::READ | access::INTERN);
            if res != TlbResult::Hit {
                let pf = res == TlbResult::Pagefault;
                assert!(res != TlbResult::Nomap);
                let waiter = TransWaiter::MsgHeader { ep: epid, virt: msg_addr };
                self.start_translate(ctx, msg_addr, access::READ, waiter, pf);
                return;
            }
            phys = translated;
        }

        self.request_header_with_phys(ctx, epid, true, msg_addr, phys);
    }

    pub(crate) fn request_header_with_phys(
        &mut self,
        ctx: &mut DtuCtx,
        epid: usize,
        success: bool,
        _virt: Addr,
        phys: NocAddr,
    ) {
        assert!(success, "header translation failed");

        let block_size = self.xfer.block_size as Addr;
        let block_off = phys.as_raw() & (block_size - 1);
        let req_size = ((block_size - block_off) as usize).min(MSG_HEADER_SIZE - self.msg.offset);

        ctx.push(DtuAction::MemRequest(MemRequest {
            addr: phys.as_raw(),
            size: req_size,
            data: None,
            rtype: MemReqType::Header,
            tag: epid as u64,
            delay: 1,
        }));
    }

    /// A piece of the stored header arrived from local memory.
    pub(crate) fn msg_recv_from_mem(&mut self, ctx: &mut DtuCtx, resp: MemResponse) {
        let cmd = self.get_command();
        let n = resp.data.len();
        assert!(self.msg.offset + n <= MSG_HEADER_SIZE);
        self.msg.header_buf[self.msg.offset..self.msg.offset + n].copy_from_slice(&resp.data);

        // the flags byte sits first; remember where it lives
        if self.msg.offset == 0 {
            self.msg.flags_phys = resp.addr;
        }
        self.msg.offset += n;

        if self.msg.offset < MSG_HEADER_SIZE {
            self.request_header(ctx, cmd.epid);
            return;
        }

        let header = MessageHeader::read_from(&self.msg.header_buf);
        self.msg.header = header;
        assert!(
            header.flags & MessageHeader::REPLY_ENABLED != 0,
            "slot was already replied to"
        );

        self.msg.info = MsgInfo {
            ready: true,
            unlim_cred: false,
            // a pagefault reply keeps the pagefault marker
            flags: header.flags & MessageHeader::PAGEFAULT,
            target_core: header.sender_core,
            target_vpe: header.sender_vpe,
            // send the reply to the reply EP, grant credits to the sender EP
            target_ep: header.reply_ep,
            reply_ep: header.sender_ep,
            // the receiver of the reply gets the label it chose
            label: header.reply_label,
            // replies have no replies
            reply_label: 0,
        };

        // disable further replies to this slot; a functional write, no
        // simulated latency
        let cleared = header.flags & !MessageHeader::REPLY_ENABLED;
        ctx.mem.write(self.msg.flags_phys, &[cleared]);

        self.start_msg_xfer(ctx, cmd);
    }

    /// Assemble the outbound header and hand the payload to the transfer
    /// engine.
    fn start_msg_xfer(&mut self, ctx: &mut DtuCtx, cmd: Command) {
        assert!(self.msg.info.ready);

        let message_addr = self.regs().get_cmd(CmdReg::DataAddr);
        let message_size = self.regs().get_cmd(CmdReg::DataSize) as usize;

        log::debug!(
            "dtu{}: [{} -> {}] with EP{} of {:#x}:{}",
            self.params.core_id,
            if cmd.opcode == Opcode::Reply { "rp" } else { "sd" },
            self.msg.info.target_core,
            cmd.arg,
            message_addr,
            message_size
        );

        let mut flags = if cmd.opcode == Opcode::Reply {
            MessageHeader::REPLY | MessageHeader::GRANT_CREDITS
        } else {
            MessageHeader::REPLY_ENABLED
        };
        flags |= self.msg.info.flags;

        let header = MessageHeader {
            flags,
            sender_core: self.params.core_id,
            sender_vpe: self.regs().get(DtuReg::VpeId) as u16,
            sender_ep: if self.msg.info.unlim_cred {
                self.params.num_endpoints as u8
            } else {
                cmd.epid as u8
            },
            reply_ep: self.msg.info.reply_ep,
            length: message_size as u16,
            label: self.msg.info.label,
            reply_label: self.msg.info.reply_label,
        };

        assert!(message_size + MSG_HEADER_SIZE <= self.params.max_noc_packet_size);

        let noc_addr = NocAddr::new(
            self.msg.info.target_core,
            self.msg.info.target_vpe,
            self.msg.info.target_ep as Addr,
        );
        let delay = self.params.start_msg_transfer_delay;
        self.start_transfer(
            ctx,
            TransferType::LocalRead,
            noc_addr,
            message_addr,
            message_size,
            None,
            Some(header),
            delay,
            0,
        );

        self.msg.info.ready = false;
    }

    /// FETCH_MSG: return the address of the next unread message, or 0.
    pub(crate) fn fetch_message(&mut self, epid: usize) -> Addr {
        let mut ep = self.regs().get_recv_ep(epid);
        if ep.msg_count == 0 {
            return 0;
        }

        let size = ep.size as usize;
        let idx = (0..size)
            .map(|off| (ep.rd_pos as usize + off) % size)
            .find(|&i| ep.is_unread(i))
            .expect("message count and unread bitmap disagree");

        assert!(ep.is_occupied(idx));
        ep.set_unread(idx, false);
        ep.msg_count -= 1;
        ep.rd_pos = ((idx + 1) % size) as u8;

        log::debug!(
            "dtu{}: EP{}: fetched message at index {} (count={})",
            self.params.core_id, epid, idx, ep.msg_count
        );

        self.regs_mut().set_recv_ep(epid, &ep);
        ep.buf_addr + idx as Addr * ep.msg_size as Addr
    }

    /// Find a free ring slot, mark it occupied and advance the write
    /// position. Returns `ep.size` if the ring is full.
    fn alloc_slot(&mut self, msg_size: usize, epid: usize, ep: &mut RecvEp) -> usize {
        assert!(
            msg_size <= ep.msg_size as usize,
            "EP{}: packet ({}) larger than ring slot ({})",
            epid,
            msg_size,
            ep.msg_size
        );

        let size = ep.size as usize;
        let idx = (0..size)
            .map(|off| (ep.wr_pos as usize + off) % size)
            .find(|&i| !ep.is_occupied(i));

        match idx {
            None => size,
            Some(i) => {
                ep.set_occupied(i, true);
                ep.wr_pos = ((i + 1) % size) as u8;
                log::debug!("dtu{}: EP{}: put message at index {}", self.params.core_id, epid, i);
                self.regs_mut().set_recv_ep(epid, ep);
                i
            }
        }
    }

    /// ACK_MSG: free the slot the OFFSET register points at.
    pub(crate) fn ack_message(&mut self, epid: usize) {
        let mut ep = self.regs().get_recv_ep(epid);
        let msg = self.regs().get_cmd(CmdReg::Offset);

        let idx = ep.msg_to_idx(msg);
        assert!(idx != MAX_MSGS, "ack target outside the receive ring");
        assert!(ep.is_occupied(idx), "ack target slot is not occupied");

        ep.set_occupied(idx, false);
        // acking an unfetched message drops it
        if ep.is_unread(idx) {
            ep.set_unread(idx, false);
            ep.msg_count -= 1;
        }
        log::debug!("dtu{}: EP{}: acked msg at index {}", self.params.core_id, epid, idx);
        self.regs_mut().set_recv_ep(epid, &ep);
    }

    /// Completion hook of the REPLY command: patch the stored header and
    /// free the slot.
    pub(crate) fn finish_msg_reply(&mut self, ctx: &mut DtuCtx, error: Error, epid: usize) {
        assert!(self.msg.flags_phys != 0, "reply finished without header readback");

        let mut flags = self.msg.header.flags & !MessageHeader::REPLY_ENABLED;
        if error == Error::VpeGone {
            log::warn!("dtu{}: EP{}: could not reply, VPE gone", self.params.core_id, epid);
            flags |= MessageHeader::REPLY_FAILED;
        }
        ctx.mem.write(self.msg.flags_phys, &[flags]);

        // free the slot even on failure; the kernel does not retry replies
        self.ack_message(epid);
    }

    /// A receive transfer finished; publish the message to software.
    pub(crate) fn finish_msg_receive(&mut self, ctx: &mut DtuCtx, epid: usize, msg_addr: Addr) {
        let mut ep = self.regs().get_recv_ep(epid);
        let idx = ((msg_addr - ep.buf_addr) / ep.msg_size as Addr) as usize;

        if ep.msg_count == ep.size {
            log::warn!("dtu{}: EP{}: buffer full", self.params.core_id, epid);
            return;
        }

        ep.msg_count += 1;
        ep.set_unread(idx, true);
        log::debug!(
            "dtu{}: EP{}: message at index {} ready (count={})",
            self.params.core_id, epid, idx, ep.msg_count
        );
        self.regs_mut().set_recv_ep(epid, &ep);

        self.update_suspendable_pin(ctx);
        self.wakeup_core(ctx);
    }

    /// An inbound MESSAGE or PAGEFAULT packet.
    pub(crate) fn msg_recv_from_noc(&mut self, ctx: &mut DtuCtx, mut pkt: NocPacket) {
        assert!(pkt.is_write && !pkt.data.is_empty());

        let header = pkt.header();

        // pagefault replies go to the walker, not into a ring
        let pf_resp = MessageHeader::REPLY | MessageHeader::PAGEFAULT;
        if header.flags & pf_resp == pf_resp {
            self.pt_finish_pagefault(ctx, pkt);
            return;
        }

        let addr = NocAddr::from_raw(pkt.addr);
        let epid = addr.offset as usize;
        assert!(epid < self.params.num_endpoints, "message EP{} out of range", epid);

        log::debug!(
            "dtu{}: [rv <- {}] {} bytes on EP{}",
            self.params.core_id, header.sender_core, header.length, epid
        );

        let vpe_id = self.regs().get(DtuReg::VpeId) as u16;
        if addr.vpe_id != vpe_id {
            log::debug!(
                "dtu{}: EP{}: received message for VPE {}, but VPE {} is running",
                self.params.core_id, epid, addr.vpe_id, vpe_id
            );
            pkt.result = Error::VpeGone;
            self.send_noc_response(ctx, pkt);
            return;
        }

        let mut ep = self.regs().get_recv_ep(epid);
        let idx = self.alloc_slot(pkt.data.len(), epid, &mut ep);
        if idx == ep.size as usize {
            log::warn!("dtu{}: EP{}: ignoring message: no space left", self.params.core_id, epid);
            pkt.result = Error::NoRingSpace;
            self.send_noc_response(ctx, pkt);
            return;
        }

        let local_addr = ep.buf_addr + idx as Addr * ep.msg_size as Addr;

        // a reply gives the credits back to our sending EP
        if header.flags & MessageHeader::REPLY != 0
            && header.flags & MessageHeader::GRANT_CREDITS != 0
            && (header.reply_ep as usize) < self.params.num_endpoints
            && self.regs().ep_type(header.reply_ep as usize) == EpType::Send
        {
            let sepid = header.reply_ep as usize;
            let mut sep = self.regs().get_send_ep(sepid);
            if sep.credits != CREDITS_UNLIM {
                sep.credits += sep.max_msg_size;
                log::debug!(
                    "dtu{}: EP{}: received {} credits ({} in total)",
                    self.params.core_id, sepid, sep.max_msg_size, sep.credits
                );
                self.regs_mut().set_send_ep(sepid, &sep);
            }
        }

        // the packet is written to the ring piece by piece; the ring
        // bookkeeping happens when the transfer completes
        let delay = self.params.noc_to_transfer_latency;
        let size = pkt.data.len();
        self.start_transfer(
            ctx,
            TransferType::RemoteWrite,
            NocAddr::default(),
            local_addr,
            size,
            Some(pkt),
            None,
            delay,
            xfer_flags::MSGRECV,
        );
    }

    pub(crate) fn send_noc_response(&mut self, ctx: &mut DtuCtx, mut pkt: NocPacket) {
        pkt.make_response();
        let delay = self.params.noc_to_transfer_latency;
        ctx.push(DtuAction::NocResponse { pkt, delay });
    }
}
