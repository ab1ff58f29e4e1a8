//! The page-table walker and page-fault upcall protocol.
//!
//! A translate event either re-checks the TLB (the fast path that absorbs
//! spurious requests) or walks the page tables from ROOT_PT downward, one
//! PTE load per level. A failed walk turns into a message to the endpoint
//! named by PF_EP (falling back to the syscall endpoint), carrying
//! `{opcode, virt, access}`; the kernel's reply either lets the walk retry
//! or declares the page unmapped.
//!
//! Fault discipline: exactly one upcall is in flight at a time. New faults
//! on the same page with the same access are coalesced into the running
//! request (their waiters are appended); everything else queues in FIFO
//! order. While a fault is pending, the TLB entry for the page is blocked
//! so every other access to it stalls behind the resolution.

use std::collections::VecDeque;

use byteorder::{ByteOrder, LittleEndian};
use smallvec::{smallvec, SmallVec};

use crate::error::Error;
use crate::noc::{Addr, Cycles, MessageHeader, NocAddr, NocPacket, NocPacketType, MSG_HEADER_SIZE};

use super::regfile::{status, DtuReg};
use super::tlb::{access, LEVEL_BITS, LEVEL_CNT, LEVEL_MASK, PAGE_BITS, PAGE_MASK, PTE_BITS, PTE_SIZE};
use super::{Dtu, DtuAction, DtuCtx, DtuEvent, MemReqType, MemRequest, MemResponse, SYSCALL_EP};

/// Body of a page-fault upcall, following the message header.
pub const PF_MSG_OPCODE: u64 = 0;
pub const PF_MSG_SIZE: usize = 24;

/// Who is waiting for a translation to finish.
#[derive(Debug)]
pub enum TransWaiter {
    /// A transfer buffer stalled on its current block.
    Xfer { buf: usize },
    /// The reply path waiting to read a stored header back.
    MsgHeader { ep: usize, virt: Addr },
    /// A cache-memory request being re-resolved after VPE_GONE.
    CacheMem { pkt: NocPacket },
    /// A translated CPU data access.
    CpuAccess { req: super::CpuRequest },
}

/// One in-flight translation, owned by the walker until it completes.
#[derive(Debug)]
pub struct TranslateEvent {
    level: usize,
    virt: Addr,
    access: u8,
    /// Physical address of the page table for the current level.
    pt_addr: Addr,
    /// Walk unconditionally, skipping the TLB fast path.
    pf: bool,
    /// Escalate the upcall to the kernel's syscall endpoint.
    to_kernel: bool,
    waiters: SmallVec<[TransWaiter; 2]>,
}

/// Walker state: a slab of translate events plus the fault queue.
#[derive(Debug, Default)]
pub struct PtUnit {
    events: Vec<Option<TranslateEvent>>,
    pfqueue: VecDeque<usize>,
    last_pf_addr: Addr,
    last_pf_cnt: u32,
}

impl PtUnit {
    fn alloc(&mut self, ev: TranslateEvent) -> usize {
        match self.events.iter_mut().enumerate().find(|(_, e)| e.is_none()) {
            Some((id, slot)) => {
                *slot = Some(ev);
                id
            }
            None => {
                self.events.push(Some(ev));
                self.events.len() - 1
            }
        }
    }

    fn get(&self, id: usize) -> &TranslateEvent {
        self.events[id].as_ref().expect("stale translate event")
    }

    fn get_mut(&mut self, id: usize) -> &mut TranslateEvent {
        self.events[id].as_mut().expect("stale translate event")
    }

    fn free(&mut self, id: usize) -> TranslateEvent {
        self.events[id].take().expect("stale translate event")
    }

    pub fn pending_faults(&self) -> usize {
        self.pfqueue.len()
    }
}

impl Dtu {
    /// Kick off a translation of `virt` for `access`; `waiter` is notified
    /// when it completes. `pf` skips the TLB fast path.
    pub(crate) fn start_translate(
        &mut self,
        ctx: &mut DtuCtx,
        virt: Addr,
        acc: u8,
        waiter: TransWaiter,
        pf: bool,
    ) {
        let root = self.regs().get(DtuReg::RootPt);
        let pt = self.pt.as_mut().expect("translation without a PTU");
        let id = pt.alloc(TranslateEvent {
            level: LEVEL_CNT - 1,
            virt,
            access: acc,
            pt_addr: root,
            pf,
            to_kernel: false,
            waiters: smallvec![waiter],
        });
        ctx.schedule(1, DtuEvent::Translate(id));
    }

    /// Run one translate event.
    pub(crate) fn pt_process(&mut self, ctx: &mut DtuCtx, ev_id: usize) {
        let ev = self.pt.as_ref().unwrap().get(ev_id);
        let (pf, virt, acc) = (ev.pf, ev.virt, ev.access);

        if pf {
            self.pt_request_pte(ctx, ev_id);
            return;
        }

        // maybe the entry appeared in the meantime
        use super::tlb::TlbResult;
        let (res, phys) = self.tlb.as_mut().unwrap().lookup(virt, acc);
        match res {
            TlbResult::Hit => self.pt_finish_event(ctx, ev_id, true, phys),
            TlbResult::Nomap => self.pt_finish_event(ctx, ev_id, false, NocAddr::default()),
            TlbResult::Pagefault => {
                if !self.pt_send_pagefault_msg(ctx, ev_id) {
                    self.pt_finish_event(ctx, ev_id, false, NocAddr::default());
                }
            }
            TlbResult::Miss => self.pt_request_pte(ctx, ev_id),
        }
    }

    /// Load the PTE for the event's current level.
    fn pt_request_pte(&mut self, ctx: &mut DtuCtx, ev_id: usize) {
        let ev = self.pt.as_ref().unwrap().get(ev_id);
        let idx = (ev.virt >> (PAGE_BITS + (ev.level as u32) * LEVEL_BITS)) & LEVEL_MASK;
        let pte_addr = ev.pt_addr + (idx << PTE_BITS);

        log::debug!(
            "dtu{}: loading level {} PTE for {:#x} from {:#x}",
            self.params.core_id, ev.level, ev.virt, pte_addr
        );

        ctx.push(DtuAction::MemRequest(MemRequest {
            addr: pte_addr,
            size: PTE_SIZE,
            data: None,
            rtype: MemReqType::Translation,
            tag: ev_id as u64,
            delay: 0,
        }));
    }

    /// A PTE arrived from memory; check it and descend or finish.
    pub(crate) fn pt_recv_from_mem(&mut self, ctx: &mut DtuCtx, resp: MemResponse) {
        let ev_id = resp.tag as usize;
        let pte = LittleEndian::read_u64(&resp.data);

        let ev = self.pt.as_ref().unwrap().get(ev_id);
        let (level, virt, acc) = (ev.level, ev.virt, ev.access);

        log::debug!(
            "dtu{}: received level {} PTE for {:#x}: {:#x}",
            self.params.core_id, level, virt, pte
        );

        let ixwr = (pte & 0xF) as u8;
        // GONE is a protocol marker, never a stored right; leaf PTEs need
        // the full requested access, inner levels additionally not INTERN
        let required = if level == 0 {
            acc & !access::GONE
        } else {
            acc & !(access::INTERN | access::GONE)
        };

        if ixwr & required != required {
            if !self.pt_send_pagefault_msg(ctx, ev_id) {
                self.pt_finish_event(ctx, ev_id, false, NocAddr::default());
            }
            return;
        }

        let base = pte & !PAGE_MASK;
        if level > 0 {
            let ev = self.pt.as_mut().unwrap().get_mut(ev_id);
            ev.level -= 1;
            ev.pt_addr = base;
            self.pt_request_pte(ctx, ev_id);
            return;
        }

        self.pt_mk_tlb_entry(virt, NocAddr::from_raw(base), ixwr);
        let phys = NocAddr::from_raw(base + (virt & PAGE_MASK));
        self.pt_finish_event(ctx, ev_id, true, phys);
    }

    fn pt_mk_tlb_entry(&mut self, virt: Addr, phys: NocAddr, flags: u8) {
        let tlb_virt = virt & !PAGE_MASK;
        log::debug!(
            "dtu{}: inserting into TLB: virt={:#x} phys={:#x} flags={:#x}",
            self.params.core_id, tlb_virt, phys.offset, flags
        );
        self.tlb.as_mut().unwrap().insert(tlb_virt, phys, flags);
    }

    /// Send (or queue) the page-fault upcall for `ev_id`. Returns false if
    /// pagefault sending is disabled and the event must fail.
    fn pt_send_pagefault_msg(&mut self, ctx: &mut DtuCtx, ev_id: usize) -> bool {
        if self.regs().get(DtuReg::Status) & status::PAGEFAULTS == 0 {
            let ev = self.pt.as_ref().unwrap().get(ev_id);
            log::debug!(
                "dtu{}: pagefault ({:#x} @ {:#x}), but pagefault sending is disabled",
                self.params.core_id, ev.access, ev.virt
            );

            // drop everything else that is still queued
            let queued: Vec<usize> = self
                .pt
                .as_mut()
                .unwrap()
                .pfqueue
                .drain(..)
                .filter(|&q| q != ev_id)
                .collect();
            if !queued.is_empty() {
                log::debug!(
                    "dtu{}: dropping all pending pagefaults ({})",
                    self.params.core_id,
                    queued.len()
                );
                for q in queued {
                    self.pt_finish_event(ctx, q, false, NocAddr::default());
                }
            }
            return false;
        }

        let ev = self.pt.as_ref().unwrap().get(ev_id);
        let (virt, acc, to_kernel) = (ev.virt, ev.access, ev.to_kernel);

        // stall every access to the page until the fault is resolved
        self.tlb.as_mut().unwrap().block(virt, true);

        let mut pfep = if to_kernel {
            SYSCALL_EP
        } else {
            self.regs().get(DtuReg::PfEp) as usize
        };
        assert!(pfep < self.params.num_endpoints, "PF_EP out of range");
        let mut ep = self.regs().get_send_ep(pfep);

        // fall back to the syscall EP if the pagefault EP is not set up
        if ep.max_msg_size == 0 {
            self.pt.as_mut().unwrap().get_mut(ev_id).to_kernel = true;
            pfep = SYSCALL_EP;
            ep = self.regs().get_send_ep(pfep);
        }

        let size = MSG_HEADER_SIZE + PF_MSG_SIZE;
        assert!(size <= ep.max_msg_size as usize, "pagefault message exceeds EP limit");

        {
            let pt = self.pt.as_mut().unwrap();
            if pt.pfqueue.is_empty() {
                pt.pfqueue.push_back(ev_id);
            } else if pt.pfqueue.front() != Some(&ev_id) {
                // coalesce with a queued fault on the same page & access
                let page = virt >> PAGE_BITS;
                let merge = pt.pfqueue.iter().copied().find(|&q| {
                    let qev = pt.events[q].as_ref().unwrap();
                    qev.access == acc && (qev.virt >> PAGE_BITS) == page
                });
                if let Some(q) = merge {
                    log::debug!(
                        "dtu{}: adding pagefault @ {:#x} to running request",
                        self.params.core_id, virt
                    );
                    let waiters = pt.free(ev_id).waiters;
                    pt.get_mut(q).waiters.extend(waiters);
                    return true;
                }

                // not mergeable; wait for our turn
                log::debug!(
                    "dtu{}: appending pagefault ({:#x} @ {:#x}) to queue",
                    self.params.core_id, acc, virt
                );
                pt.get_mut(ev_id).pf = true;
                pt.pfqueue.push_back(ev_id);
                return true;
            }
        }

        self.pt_resolve_failed(ctx, virt);

        let header = MessageHeader {
            flags: MessageHeader::PAGEFAULT | MessageHeader::REPLY_ENABLED,
            sender_core: self.params.core_id,
            sender_vpe: self.regs().get(DtuReg::VpeId) as u16,
            sender_ep: pfep as u8,
            reply_ep: 0,
            length: PF_MSG_SIZE as u16,
            label: ep.label,
            // opaque pointer back to the waiting event
            reply_label: ev_id as u64,
        };

        let mut data = vec![0u8; MSG_HEADER_SIZE + PF_MSG_SIZE];
        header.write_to(&mut data[..MSG_HEADER_SIZE]);
        LittleEndian::write_u64(&mut data[MSG_HEADER_SIZE..], PF_MSG_OPCODE);
        LittleEndian::write_u64(&mut data[MSG_HEADER_SIZE + 8..], virt);
        LittleEndian::write_u64(&mut data[MSG_HEADER_SIZE + 16..], acc as u64);

        log::debug!(
            "dtu{}: [sd -> {}] with EP{} for pagefault ({:#x} @ {:#x})",
            self.params.core_id, ep.target_core, pfep, acc, virt
        );

        let target = NocAddr::new(ep.target_core, ep.vpe_id as u16, ep.target_ep as Addr);
        let pkt = NocPacket::write(
            NocPacketType::Pagefault,
            target.as_raw(),
            data,
            self.params.core_id,
        );
        let delay = self.params.transfer_to_noc_latency;
        ctx.push(DtuAction::NocRequest { pkt, delay });
        true
    }

    /// The upcall itself could not be delivered.
    pub(crate) fn pt_sending_pf_failed(&mut self, ctx: &mut DtuCtx, pkt: &NocPacket) {
        let header = pkt.header();
        let ev_id = header.reply_label as usize;

        {
            let ev = self.pt.as_ref().unwrap().get(ev_id);
            log::debug!(
                "dtu{}: sending pagefault ({:#x} @ {:#x}) failed ({:?}); notifying kernel",
                self.params.core_id, ev.access, ev.virt, pkt.result
            );
        }

        if pkt.result == Error::VpeGone {
            let ev = self.pt.as_mut().unwrap().get_mut(ev_id);
            ev.pf = true;
            ev.to_kernel = true;
            ctx.schedule(1, DtuEvent::Translate(ev_id));
        } else {
            let ev = self.pt.as_ref().unwrap().get(ev_id);
            panic!("unable to resolve pagefault ({:#x} @ {:#x})", ev.access, ev.virt);
        }

        self.pt_next_pagefault(ctx, ev_id, 1);
    }

    /// The kernel replied to an upcall.
    pub(crate) fn pt_finish_pagefault(&mut self, ctx: &mut DtuCtx, mut pkt: NocPacket) {
        let header = pkt.header();
        let exp_size = MSG_HEADER_SIZE + 8;
        let error = if pkt.data.len() == exp_size {
            LittleEndian::read_u64(&pkt.data[MSG_HEADER_SIZE..]) as i64
        } else {
            -1
        };

        let ev_id = header.label as usize;
        let (virt, acc) = {
            let ev = self.pt.as_ref().unwrap().get(ev_id);
            (ev.virt, ev.access)
        };

        log::debug!(
            "dtu{}: [rv <- {}] {} bytes for pagefault ({:#x} @ {:#x}) -> {}",
            self.params.core_id, header.sender_core, header.length, acc, virt, error
        );

        let delay = self.params.noc_to_transfer_latency;
        self.pt_next_pagefault(ctx, ev_id, delay);

        pkt.make_response();
        ctx.push(DtuAction::NocResponse { pkt, delay });

        if error != 0 {
            if error == Error::NoMapping as i64 {
                // remember the miss so the next access does not fault again
                self.pt_mk_tlb_entry(virt, NocAddr::default(), 0);
                self.pt_finish_event(ctx, ev_id, false, NocAddr::default());
            } else if error == Error::VpeGone as i64 {
                let ev = self.pt.as_mut().unwrap().get_mut(ev_id);
                ev.pf = true;
                ev.to_kernel = true;
                ctx.schedule(1, DtuEvent::Translate(ev_id));
            } else {
                panic!("unable to resolve pagefault ({:#x} @ {:#x}): {}", acc, virt, error);
            }
            return;
        }

        log::debug!(
            "dtu{}: retrying pagetable walk for {:#x} @ {:#x}",
            self.params.core_id, acc, virt
        );

        // lift the block and walk again from the root
        self.tlb.as_mut().unwrap().block(virt, false);
        let ev = self.pt.as_mut().unwrap().get_mut(ev_id);
        ev.pf = false;
        ev.to_kernel = false;
        ev.level = LEVEL_CNT - 1;
        let root = self.regs().get(DtuReg::RootPt);
        self.pt.as_mut().unwrap().get_mut(ev_id).pt_addr = root;
        ctx.schedule(1, DtuEvent::Translate(ev_id));
    }

    /// Pop the resolved fault off the queue head and start the next one.
    fn pt_next_pagefault(&mut self, ctx: &mut DtuCtx, ev_id: usize, delay: Cycles) {
        let pt = self.pt.as_mut().unwrap();
        assert_eq!(pt.pfqueue.front(), Some(&ev_id), "fault finished out of order");
        pt.pfqueue.pop_front();

        if let Some(&next) = pt.pfqueue.front() {
            ctx.schedule(delay.max(1), DtuEvent::Translate(next));
        }
    }

    /// Notify all waiters and destroy the event.
    fn pt_finish_event(&mut self, ctx: &mut DtuCtx, ev_id: usize, success: bool, phys: NocAddr) {
        let ev = self.pt.as_mut().unwrap().free(ev_id);
        for waiter in ev.waiters {
            match waiter {
                TransWaiter::Xfer { buf } => {
                    assert!(success, "transfer translation failed for {:#x}", ev.virt);
                    self.xfer_translate_done(ctx, buf, phys);
                }
                TransWaiter::MsgHeader { ep, virt } => {
                    self.request_header_with_phys(ctx, ep, success, virt, phys);
                }
                TransWaiter::CacheMem { pkt } => {
                    if success {
                        let cmd = if pkt.is_write {
                            super::CacheCmd::Write
                        } else {
                            super::CacheCmd::Read
                        };
                        self.handle_cache_mem_request(ctx, pkt, cmd, false);
                    } else {
                        ctx.push(DtuAction::CacheMemResponse { pkt, success: false });
                    }
                }
                TransWaiter::CpuAccess { req } => {
                    if success {
                        self.cpu_access_mem(ctx, req, phys);
                    } else {
                        ctx.push(DtuAction::CpuResponse { req, success: false });
                    }
                }
            }
        }
    }

    /// Track back-to-back faults on the same page; after the configured
    /// threshold, record the address and raise an interrupt so software can
    /// intervene.
    fn pt_resolve_failed(&mut self, ctx: &mut DtuCtx, virt: Addr) {
        let threshold = self.params.pf_fail_threshold;
        let hit = {
            let pt = self.pt.as_mut().unwrap();
            if virt == pt.last_pf_addr {
                pt.last_pf_cnt += 1;
                pt.last_pf_cnt == threshold
            } else {
                pt.last_pf_addr = virt;
                pt.last_pf_cnt = 1;
                threshold == 1
            }
        };

        if hit {
            let vector = self.params.pf_fail_irq;
            self.regs_mut().set(DtuReg::LastPf, virt);
            self.inject_irq(ctx, vector);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::test_params;
    use super::*;
    use crate::dtu::FunctionalMem;
    use crate::sim::memory::Memory;

    struct LocalMem(Memory);

    impl FunctionalMem for LocalMem {
        fn read(&mut self, addr: Addr, buf: &mut [u8]) {
            self.0.read(NocAddr::from_raw(addr).offset, buf);
        }
        fn write(&mut self, addr: Addr, data: &[u8]) {
            self.0.write(NocAddr::from_raw(addr).offset, data);
        }
    }

    fn pf_dtu() -> Dtu {
        let mut params = test_params(0);
        params.tlb_entries = 32;
        let mut dtu = Dtu::new(params);
        dtu.regs_mut().set(DtuReg::Status, status::PAGEFAULTS);
        dtu.regs_mut().set(DtuReg::PfEp, 1);
        let pf_ep = crate::dtu::regfile::SendEp {
            vpe_id: 0,
            target_core: 9,
            target_ep: 2,
            max_msg_size: 64,
            credits: crate::dtu::regfile::CREDITS_UNLIM,
            label: 0x77,
        };
        dtu.regs_mut().set_send_ep(1, &pf_ep);
        dtu
    }

    fn ctx_parts() -> (LocalMem, Vec<DtuAction>) {
        (LocalMem(Memory::new()), Vec::new())
    }

    #[test]
    fn test_pagefault_upcall_payload() {
        let mut dtu = pf_dtu();
        let (mut mem, mut actions) = ctx_parts();
        let mut ctx = DtuCtx { now: 0, mem: &mut mem, actions: &mut actions };

        dtu.start_translate(&mut ctx, 0x4000, access::READ | access::INTERN,
            TransWaiter::Xfer { buf: 0 }, true);

        // run the scheduled translate event; pf=true walks immediately
        let ev = actions
            .drain(..)
            .find_map(|a| match a {
                DtuAction::Schedule { event: DtuEvent::Translate(id), .. } => Some(id),
                _ => None,
            })
            .unwrap();
        let mut ctx = DtuCtx { now: 1, mem: &mut mem, actions: &mut actions };
        dtu.pt_process(&mut ctx, ev);

        // the walk loads a root-level PTE; answer with "no rights"
        let req = actions
            .drain(..)
            .find_map(|a| match a {
                DtuAction::MemRequest(req) => Some(req),
                _ => None,
            })
            .expect("no PTE load issued");
        assert_eq!(req.size, PTE_SIZE);

        let mut ctx = DtuCtx { now: 2, mem: &mut mem, actions: &mut actions };
        dtu.pt_recv_from_mem(
            &mut ctx,
            MemResponse { addr: req.addr, rtype: MemReqType::Translation, tag: req.tag, data: vec![0u8; 8] },
        );

        // now an upcall must be on its way to PF_EP's target
        let pkt = actions
            .iter()
            .find_map(|a| match a {
                DtuAction::NocRequest { pkt, .. } => Some(pkt),
                _ => None,
            })
            .expect("no pagefault upcall sent");
        assert_eq!(pkt.packet_type, NocPacketType::Pagefault);
        let addr = NocAddr::from_raw(pkt.addr);
        assert_eq!(addr.core_id, 9);
        assert_eq!(addr.offset, 2);

        let hdr = pkt.header();
        assert_eq!(hdr.flags, MessageHeader::PAGEFAULT | MessageHeader::REPLY_ENABLED);
        assert_eq!(hdr.label, 0x77);
        assert_eq!(hdr.length as usize, PF_MSG_SIZE);

        let body = &pkt.data[MSG_HEADER_SIZE..];
        assert_eq!(LittleEndian::read_u64(&body[0..8]), PF_MSG_OPCODE);
        assert_eq!(LittleEndian::read_u64(&body[8..16]), 0x4000);
        assert_eq!(
            LittleEndian::read_u64(&body[16..24]),
            (access::READ | access::INTERN) as u64
        );

        // the faulting page is blocked while the fault is pending
        assert_eq!(
            dtu.tlb_mut().unwrap().lookup(0x4000, access::READ).0,
            crate::dtu::tlb::TlbResult::Pagefault
        );
    }

    #[test]
    fn test_fault_dedup_same_page() {
        let mut dtu = pf_dtu();
        let (mut mem, mut actions) = ctx_parts();

        // first fault: goes through the queue head and sends
        let mut ctx = DtuCtx { now: 0, mem: &mut mem, actions: &mut actions };
        dtu.start_translate(&mut ctx, 0x4000, access::READ, TransWaiter::Xfer { buf: 0 }, true);
        let ev0 = match actions.pop().unwrap() {
            DtuAction::Schedule { event: DtuEvent::Translate(id), .. } => id,
            other => panic!("unexpected action {:?}", other),
        };
        let mut ctx = DtuCtx { now: 1, mem: &mut mem, actions: &mut actions };
        assert!(dtu.pt_send_pagefault_msg(&mut ctx, ev0));
        assert_eq!(dtu.pt.as_ref().unwrap().pending_faults(), 1);

        // second fault on the same page & access: coalesced, no new upcall
        actions.clear();
        let mut ctx = DtuCtx { now: 2, mem: &mut mem, actions: &mut actions };
        dtu.start_translate(&mut ctx, 0x4008, access::READ, TransWaiter::Xfer { buf: 1 }, true);
        let ev1 = match actions.pop().unwrap() {
            DtuAction::Schedule { event: DtuEvent::Translate(id), .. } => id,
            other => panic!("unexpected action {:?}", other),
        };
        let mut ctx = DtuCtx { now: 3, mem: &mut mem, actions: &mut actions };
        assert!(dtu.pt_send_pagefault_msg(&mut ctx, ev1));

        assert_eq!(dtu.pt.as_ref().unwrap().pending_faults(), 1);
        assert!(actions.iter().all(|a| !matches!(a, DtuAction::NocRequest { .. })));
        assert_eq!(dtu.pt.as_ref().unwrap().get(ev0).waiters.len(), 2);
    }

    #[test]
    fn test_fault_on_other_page_queues() {
        let mut dtu = pf_dtu();
        let (mut mem, mut actions) = ctx_parts();

        let mut ctx = DtuCtx { now: 0, mem: &mut mem, actions: &mut actions };
        dtu.start_translate(&mut ctx, 0x4000, access::READ, TransWaiter::Xfer { buf: 0 }, true);
        let ev0 = match actions.pop().unwrap() {
            DtuAction::Schedule { event: DtuEvent::Translate(id), .. } => id,
            other => panic!("unexpected action {:?}", other),
        };
        let mut ctx = DtuCtx { now: 1, mem: &mut mem, actions: &mut actions };
        assert!(dtu.pt_send_pagefault_msg(&mut ctx, ev0));

        let mut ctx = DtuCtx { now: 2, mem: &mut mem, actions: &mut actions };
        dtu.start_translate(&mut ctx, 0x9000, access::READ, TransWaiter::Xfer { buf: 1 }, true);
        let ev1 = match actions.pop().unwrap() {
            DtuAction::Schedule { event: DtuEvent::Translate(id), .. } => id,
            other => panic!("unexpected action {:?}", other),
        };
        let mut ctx = DtuCtx { now: 3, mem: &mut mem, actions: &mut actions };
        assert!(dtu.pt_send_pagefault_msg(&mut ctx, ev1));

        assert_eq!(dtu.pt.as_ref().unwrap().pending_faults(), 2);
    }

    #[test]
    fn test_repeated_faults_raise_irq() {
        let mut params = test_params(0);
        params.tlb_entries = 32;
        params.pf_fail_threshold = 3;
        let mut dtu = Dtu::new(params);

        let (mut mem, mut actions) = ctx_parts();
        for _ in 0..2 {
            let mut ctx = DtuCtx { now: 0, mem: &mut mem, actions: &mut actions };
            dtu.pt_resolve_failed(&mut ctx, 0x4000);
        }
        assert!(actions.iter().all(|a| !matches!(a, DtuAction::InjectIrq(_))));

        let mut ctx = DtuCtx { now: 0, mem: &mut mem, actions: &mut actions };
        dtu.pt_resolve_failed(&mut ctx, 0x4000);
        assert!(actions.iter().any(|a| matches!(a, DtuAction::InjectIrq(0x41))));
        assert_eq!(dtu.regs().get(DtuReg::LastPf), 0x4000);
    }

    #[test]
    fn test_resolve_failed_resets_on_other_page() {
        let mut params = test_params(0);
        params.tlb_entries = 32;
        params.pf_fail_threshold = 2;
        let mut dtu = Dtu::new(params);

        let (mut mem, mut actions) = ctx_parts();
        let mut ctx = DtuCtx { now: 0, mem: &mut mem, actions: &mut actions };
        dtu.pt_resolve_failed(&mut ctx, 0x4000);
        dtu.pt_resolve_failed(&mut ctx, 0x5000);
        dtu.pt_resolve_failed(&mut ctx, 0x4000);
        assert!(actions.iter().all(|a| !matches!(a, DtuAction::InjectIrq(_))));
    }
}
