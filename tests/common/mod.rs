//! Shared setup for the cross-PE tests.
#![allow(dead_code)]

use dtu_emu::config::SimConfig;
use dtu_emu::dtu::regfile::{DtuReg, RecvEp, SendEp};
use dtu_emu::dtu::Opcode;
use dtu_emu::sim::Machine;

/// A machine with the given PE descriptors; `mem_pe` must name a memory PE.
pub fn machine_with_pes(pes: Vec<u64>, mem_pe: usize) -> Machine {
    let mut cfg = SimConfig::default();
    cfg.pes = pes;
    cfg.mem_pe = mem_pe;
    Machine::new(cfg)
}

/// Eight scratchpad cores (ids 0..7) plus a memory PE as core 8.
pub fn eight_core_machine() -> Machine {
    let mut pes = vec![0x80_0000u64; 8];
    pes.push(1);
    machine_with_pes(pes, 8)
}

/// Encode a command register value.
pub fn cmd(op: Opcode, ep: u64) -> u64 {
    (ep << 3) | op as u64
}

/// Bind both PEs to the same VPE and wire a SEND endpoint on `src` to a
/// RECEIVE endpoint on `dst`.
#[allow(clippy::too_many_arguments)]
pub fn wire_channel(
    m: &mut Machine,
    vpe: u16,
    src: usize,
    src_ep: usize,
    dst: usize,
    dst_ep: usize,
    credits: u16,
    buf_addr: u64,
) {
    m.dtus[src].regs_mut().set(DtuReg::VpeId, vpe as u64);
    m.dtus[dst].regs_mut().set(DtuReg::VpeId, vpe as u64);

    m.dtus[src].regs_mut().set_send_ep(
        src_ep,
        &SendEp {
            vpe_id: vpe as u32,
            target_core: dst as u16,
            target_ep: dst_ep as u8,
            max_msg_size: 64,
            credits,
            label: 0xAA,
        },
    );

    m.dtus[dst].regs_mut().set_recv_ep(
        dst_ep,
        &RecvEp {
            rd_pos: 0,
            wr_pos: 0,
            buf_addr,
            msg_size: 64,
            size: 4,
            msg_count: 0,
            occupied: 0,
            unread: 0,
        },
    );
}
