//! The transfer engine.
//!
//! All data movement between local memory and the NoC is staged through a
//! small pool of block-sized buffers. A transfer claims one buffer, then
//! loops block by block: translate the local address, issue one local
//! memory request, wait for the response, advance. When the byte count
//! reaches zero the buffer's content goes out (or the inbound packet is
//! answered) and the buffer is released.
//!
//! ```text
//! ┌─────────┐ alloc ┌───────────────┐ translate ┌──────────────┐
//! │ request ├──────►│ buffer claimed├──────────►│ mem req/resp │──┐
//! └─────────┘       └───────────────┘           └──────┬───────┘  │ per
//!      │ none free                                     │          │ block
//!      ▼                                               ▼          │
//! ┌─────────┐                                   ┌──────────────┐  │
//! │ retry +1│                                   │ size == 0 ?  │◄─┘
//! └─────────┘                                   └──────┬───────┘
//!                                                      ▼
//!                                ─ LOCAL_READ:   emit NoC packet
//!                                ─ LOCAL_WRITE:  finish command on LAST
//!                                ─ REMOTE_READ:  answer with buffer bytes
//!                                ─ REMOTE_WRITE: finalize receive, answer
//! ```
//!
//! Message receives are serialized: at most one MSGRECV transfer may hold a
//! buffer at any time, so message counts become visible in completion order
//! and a second receive cannot overtake the first into the same ring.

use crate::error::Error;
use crate::noc::{Addr, Cycles, MessageHeader, NocAddr, NocPacket, NocPacketType, MSG_HEADER_SIZE};

use super::pt_unit::TransWaiter;
use super::tlb::{access, TlbResult};
use super::{Dtu, DtuAction, DtuCtx, DtuEvent, MemReqType, MemRequest};

/// Flags attached to a transfer.
pub mod xfer_flags {
    /// The transfer finalizes a message receive (serialized, see above).
    pub const MSGRECV: u8 = 1 << 0;
    /// Last chunk of a READ/WRITE command; completion finishes the command.
    pub const LAST: u8 = 1 << 1;
    /// The buffer carries a message header; emit a MESSAGE packet.
    pub const MESSAGE: u8 = 1 << 2;
}

/// What a transfer does, from the viewpoint of this DTU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferType {
    /// Read from local memory and send the result out (send path).
    LocalRead,
    /// Write data that came back from the NoC into local memory.
    LocalWrite,
    /// Write an inbound packet's payload into local memory.
    RemoteWrite,
    /// Read local memory to answer an inbound request.
    RemoteRead,
}

impl TransferType {
    fn is_local_write(self) -> bool {
        matches!(self, TransferType::LocalWrite | TransferType::RemoteWrite)
    }

    fn is_remote(self) -> bool {
        matches!(self, TransferType::RemoteWrite | TransferType::RemoteRead)
    }
}

/// In-flight state of a transfer, pinned inside its buffer.
#[derive(Debug, Default)]
pub struct TransferEvent {
    pub ttype: Option<TransferType>,
    pub remote: NocAddr,
    /// Next local address to move; advances block by block.
    pub local_addr: Addr,
    /// Local address the transfer started at.
    pub start_addr: Addr,
    /// Remaining bytes.
    pub size: usize,
    pub flags: u8,
    /// The inbound packet this transfer serves, if any.
    pub pkt: Option<NocPacket>,
}

/// One staging buffer.
#[derive(Debug)]
pub struct Buffer {
    pub id: usize,
    pub bytes: Vec<u8>,
    /// Fill cursor within `bytes`.
    pub offset: usize,
    pub free: bool,
    pub event: TransferEvent,
}

/// A transfer request that found no free buffer and is reposted.
#[derive(Debug)]
pub struct PendingTransfer {
    pub ttype: TransferType,
    pub remote: NocAddr,
    pub local: Addr,
    pub size: usize,
    pub pkt: Option<NocPacket>,
    pub header: Option<MessageHeader>,
    pub flags: u8,
}

/// The buffer pool.
pub struct XferUnit {
    pub block_size: usize,
    pub buf_size: usize,
    pub bufs: Vec<Buffer>,
}

impl XferUnit {
    pub fn new(block_size: usize, buf_count: usize, buf_size: usize) -> Self {
        assert!(block_size.is_power_of_two());
        let bufs = (0..buf_count)
            .map(|id| Buffer {
                id,
                bytes: vec![0u8; buf_size],
                offset: 0,
                free: true,
                event: TransferEvent::default(),
            })
            .collect();
        Self { block_size, buf_size, bufs }
    }

    /// Claim a free buffer. Message receives are mutually exclusive: while
    /// any MSGRECV transfer holds a buffer, further receives must wait.
    pub fn allocate_buf(&mut self, recvmsg: bool) -> Option<usize> {
        if recvmsg
            && self
                .bufs
                .iter()
                .any(|b| !b.free && b.event.flags & xfer_flags::MSGRECV != 0)
        {
            return None;
        }

        let buf = self.bufs.iter_mut().find(|b| b.free)?;
        buf.free = false;
        buf.offset = 0;
        Some(buf.id)
    }

    pub fn busy_bufs(&self) -> usize {
        self.bufs.iter().filter(|b| !b.free).count()
    }
}

impl Dtu {
    /// Start staging `size` bytes between `local` and `remote`.
    ///
    /// Returns `false` if no buffer was available and the request was
    /// reposted for one cycle later.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn start_transfer(
        &mut self,
        ctx: &mut DtuCtx,
        ttype: TransferType,
        remote: NocAddr,
        local: Addr,
        size: usize,
        pkt: Option<NocPacket>,
        header: Option<MessageHeader>,
        delay: Cycles,
        flags: u8,
    ) -> bool {
        let Some(buf_id) = self.xfer.allocate_buf(flags & xfer_flags::MSGRECV != 0) else {
            log::debug!(
                "dtu{}: delaying {:?} transfer of {} bytes @ {:#x} (all buffers busy)",
                self.params.core_id, ttype, size, local
            );
            let pending = PendingTransfer { ttype, remote, local, size, pkt, header, flags };
            ctx.schedule(delay + 1, DtuEvent::StartTransfer(Box::new(pending)));
            return false;
        };

        let buf = &mut self.xfer.bufs[buf_id];
        assert_eq!(buf.event.size, 0);

        buf.event.ttype = Some(ttype);
        buf.event.remote = remote;
        buf.event.local_addr = local;
        buf.event.start_addr = local;
        buf.event.size = size;
        buf.event.flags = flags;
        buf.event.pkt = None;

        if let Some(header) = header {
            // the header is created directly in the buffer; no extra delay
            header.write_to(&mut buf.bytes[..MSG_HEADER_SIZE]);
            buf.event.flags |= xfer_flags::MESSAGE;
            buf.offset += MSG_HEADER_SIZE;
        } else if let Some(pkt) = pkt {
            // inbound payload is staged in parallel, already paid for
            buf.bytes[..pkt.data.len()].copy_from_slice(&pkt.data);
            buf.event.pkt = Some(pkt);
        }

        log::debug!(
            "dtu{}: buf{}: starting {:?} transfer of {} bytes @ {:#x}",
            self.params.core_id, buf_id, ttype, size, local
        );

        ctx.schedule(delay + 1, DtuEvent::TransferStep(buf_id));
        true
    }

    pub(crate) fn retry_transfer(&mut self, ctx: &mut DtuCtx, p: PendingTransfer) {
        self.start_transfer(ctx, p.ttype, p.remote, p.local, p.size, p.pkt, p.header, 0, p.flags);
    }

    /// One step of the per-block loop: translate the current local address
    /// and issue the memory request for the next block.
    pub(crate) fn xfer_process(&mut self, ctx: &mut DtuCtx, buf_id: usize) {
        let ev = &self.xfer.bufs[buf_id].event;
        let ttype = ev.ttype.expect("transfer step on idle buffer");
        let local_addr = ev.local_addr;

        if ev.size == 0 {
            // nothing to move (empty payload); complete right away
            self.xfer_complete(ctx, buf_id);
            return;
        }

        let mut phys = NocAddr::from_raw(local_addr);
        if self.tlb.is_some() {
            let mut acc = if ttype.is_local_write() { access::WRITE } else { access::READ };
            if !ttype.is_remote() {
                acc |= access::INTERN;
            }

            let (res, translated) = self.tlb.as_mut().unwrap().lookup(local_addr, acc);
            if res != TlbResult::Hit {
                let pf = res == TlbResult::Pagefault;
                assert!(res != TlbResult::Nomap, "transfer hit a known-unmapped page");
                log::debug!(
                    "dtu{}: {} for {} access to {:#x}",
                    self.params.core_id,
                    if pf { "pagefault" } else { "TLB-miss" },
                    if acc & access::WRITE != 0 { "write" } else { "read" },
                    local_addr
                );
                self.start_translate(ctx, local_addr, acc, TransWaiter::Xfer { buf: buf_id }, pf);
                return;
            }
            phys = translated;
        }

        self.xfer_translate_done(ctx, buf_id, phys);
    }

    /// Translation for the current block finished; move one block.
    pub(crate) fn xfer_translate_done(&mut self, ctx: &mut DtuCtx, buf_id: usize, phys: NocAddr) {
        let block_size = self.xfer.block_size;
        let buf = &mut self.xfer.bufs[buf_id];
        let ev = &mut buf.event;
        let ttype = ev.ttype.expect("translate done on idle buffer");
        assert!(ev.size > 0);

        let local_off = (ev.local_addr as usize) & (block_size - 1);
        let req_size = ev.size.min(block_size - local_off);

        let data = if ttype.is_local_write() {
            assert!(buf.offset + req_size <= buf.bytes.len());
            let data = buf.bytes[buf.offset..buf.offset + req_size].to_vec();
            buf.offset += req_size;
            Some(data)
        } else {
            None
        };

        log::trace!(
            "dtu{}: buf{}: {} {} bytes @ {:#x}->{:#x} in local memory",
            self.params.core_id,
            buf_id,
            if data.is_some() { "writing" } else { "reading" },
            req_size,
            ev.local_addr,
            phys.as_raw()
        );

        ev.local_addr += req_size as Addr;
        ev.size -= req_size;

        let delay = self.params.transfer_to_mem_request_latency;
        ctx.push(DtuAction::MemRequest(MemRequest {
            addr: phys.as_raw(),
            size: req_size,
            data,
            rtype: MemReqType::Transfer,
            tag: buf_id as u64,
            delay,
        }));
    }

    /// A local-memory response for this buffer arrived.
    pub(crate) fn xfer_recv_mem_response(&mut self, ctx: &mut DtuCtx, buf_id: usize, data: &[u8]) {
        let buf = &mut self.xfer.bufs[buf_id];
        assert!(!buf.free, "memory response for a free buffer");

        let ttype = buf.event.ttype.expect("memory response on idle buffer");
        if matches!(ttype, TransferType::LocalRead | TransferType::RemoteRead) {
            assert!(buf.offset + data.len() <= buf.bytes.len());
            buf.bytes[buf.offset..buf.offset + data.len()].copy_from_slice(data);
            buf.offset += data.len();
        }

        if buf.event.size == 0 {
            self.xfer_complete(ctx, buf_id);
        } else {
            // next block
            self.xfer_process(ctx, buf_id);
        }
    }

    fn xfer_complete(&mut self, ctx: &mut DtuCtx, buf_id: usize) {
        let core_id = self.params.core_id;
        let noc_delay = self.params.transfer_to_noc_latency;

        let buf = &mut self.xfer.bufs[buf_id];
        let ttype = buf.event.ttype.take().expect("completing idle buffer");
        let flags = buf.event.flags;
        let remote = buf.event.remote;
        let start_addr = buf.event.start_addr;
        let filled = buf.offset;
        let pkt = buf.event.pkt.take();

        match ttype {
            TransferType::LocalRead => {
                log::debug!(
                    "dtu{}: buf{}: sending NoC request of {} bytes @ {:#x}",
                    core_id, buf_id, filled, remote.offset
                );
                let ptype = if flags & xfer_flags::MESSAGE != 0 {
                    NocPacketType::Message
                } else {
                    NocPacketType::WriteReq
                };
                let data = buf.bytes[..filled].to_vec();
                let out = NocPacket::write(ptype, remote.as_raw(), data, core_id);
                ctx.push(DtuAction::NocRequest { pkt: out, delay: noc_delay });
            }
            TransferType::LocalWrite => {
                if flags & xfer_flags::LAST != 0 {
                    self.schedule_finish_op(ctx, 1, Error::None);
                }
            }
            TransferType::RemoteRead | TransferType::RemoteWrite => {
                let mut pkt = pkt.expect("remote transfer without inbound packet");

                if ttype == TransferType::RemoteWrite && flags & xfer_flags::MSGRECV != 0 {
                    let ep = NocAddr::from_raw(pkt.addr).offset as usize;
                    self.finish_msg_receive(ctx, ep, start_addr);
                }

                log::debug!(
                    "dtu{}: buf{}: sending NoC response of {} bytes",
                    core_id, buf_id, filled
                );
                pkt.make_response();
                if ttype == TransferType::RemoteRead {
                    pkt.data = self.xfer.bufs[buf_id].bytes[..filled].to_vec();
                }
                ctx.push(DtuAction::NocResponse { pkt, delay: noc_delay });
            }
        }

        let buf = &mut self.xfer.bufs[buf_id];
        log::debug!("dtu{}: buf{}: transfer done", core_id, buf_id);
        buf.event = TransferEvent::default();
        buf.free = true;
    }
}
