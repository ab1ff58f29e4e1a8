//! End-to-end scenarios on a multi-PE machine, driven through the MMIO
//! command path exactly as software would.

mod common;

use common::{cmd, eight_core_machine, machine_with_pes, wire_channel};

use dtu_emu::config::SimConfig;
use dtu_emu::dtu::regfile::{status, CmdReg, DtuReg, RecvEp, SendEp};
use dtu_emu::dtu::tlb::access;
use dtu_emu::dtu::Opcode;
use dtu_emu::error::Error;
use dtu_emu::noc::{MessageHeader, MSG_HEADER_SIZE};
use dtu_emu::sim::Machine;

const RUN: usize = 100_000;

/// Scenario 1: a send lands in the receive ring and can be fetched.
#[test]
fn send_then_fetch() {
    let mut m = eight_core_machine();
    wire_channel(&mut m, 5, 0, 3, 7, 4, 128, 0x1000);

    let payload: Vec<u8> = (1..=16).collect();
    m.phys_write(0, 0x500, &payload);

    m.dtus[0].regs_mut().set_cmd(CmdReg::DataAddr, 0x500);
    m.dtus[0].regs_mut().set_cmd(CmdReg::DataSize, 16);
    m.dtus[0].regs_mut().set_cmd(CmdReg::ReplyEpid, 5);
    m.dtus[0].regs_mut().set_cmd(CmdReg::ReplyLabel, 0xBB);
    m.issue_command(0, cmd(Opcode::Send, 3));
    m.run(RUN);

    // the command completed without error
    let done = m.dtus[0].get_command();
    assert_eq!(done.opcode, Opcode::Idle);
    assert_eq!(done.error, Error::None);

    // credits were debited by max_msg_size
    assert_eq!(m.dtus[0].regs().get_send_ep(3).credits, 64);

    // the ring slot is occupied and unread
    let ep = m.dtus[7].regs().get_recv_ep(4);
    assert_eq!(ep.occupied, 0b0001);
    assert_eq!(ep.unread, 0b0001);
    assert_eq!(ep.msg_count, 1);
    assert_eq!(m.dtus[7].regs().get(DtuReg::MsgCnt), 1);
    assert!(m.cores[7].deny_suspend);

    // header and payload were written to the slot
    let mut stored = vec![0u8; MSG_HEADER_SIZE + 16];
    m.phys_read(7, 0x1000, &mut stored);
    let header = MessageHeader::read_from(&stored);
    assert_eq!(header.flags, MessageHeader::REPLY_ENABLED);
    assert_eq!(header.sender_core, 0);
    assert_eq!(header.sender_ep, 3);
    assert_eq!(header.reply_ep, 5);
    assert_eq!(header.sender_vpe, 5);
    assert_eq!(header.length, 16);
    assert_eq!(header.label, 0xAA);
    assert_eq!(header.reply_label, 0xBB);
    assert_eq!(&stored[MSG_HEADER_SIZE..], &payload[..]);

    // fetch returns the slot address and consumes the unread bit
    m.issue_command(7, cmd(Opcode::FetchMsg, 4));
    m.run(RUN);
    assert_eq!(m.dtus[7].regs().get_cmd(CmdReg::Offset), 0x1000);

    let ep = m.dtus[7].regs().get_recv_ep(4);
    assert_eq!(ep.unread, 0);
    assert_eq!(ep.occupied, 0b0001);
    assert_eq!(ep.rd_pos, 1);
    assert_eq!(ep.msg_count, 0);

    // fetching again yields nothing
    m.issue_command(7, cmd(Opcode::FetchMsg, 4));
    m.run(RUN);
    assert_eq!(m.dtus[7].regs().get_cmd(CmdReg::Offset), 0);
}

/// Scenario 2: a send without enough credits fails immediately.
#[test]
fn credit_exhaustion() {
    let mut m = eight_core_machine();
    wire_channel(&mut m, 5, 0, 3, 7, 4, 32, 0x1000);

    m.dtus[0].regs_mut().set_cmd(CmdReg::DataAddr, 0x500);
    m.dtus[0].regs_mut().set_cmd(CmdReg::DataSize, 16);
    m.issue_command(0, cmd(Opcode::Send, 3));
    m.run(RUN);

    let done = m.dtus[0].get_command();
    assert_eq!(done.error, Error::MissCredits);
    assert_eq!(m.dtus[0].regs().get_send_ep(3).credits, 32);

    // nothing arrived at the receiver
    let ep = m.dtus[7].regs().get_recv_ep(4);
    assert_eq!(ep.occupied, 0);
}

/// Scenario 3: a reply grants the credits back and frees the slot.
#[test]
fn reply_grants_credits() {
    let mut m = eight_core_machine();
    wire_channel(&mut m, 5, 0, 3, 7, 4, 128, 0x1000);

    // core 0 needs a receive ring for the reply
    m.dtus[0].regs_mut().set_recv_ep(
        5,
        &RecvEp { buf_addr: 0x2000, msg_size: 64, size: 4, ..Default::default() },
    );

    m.phys_write(0, 0x500, &[0x11; 16]);
    m.dtus[0].regs_mut().set_cmd(CmdReg::DataAddr, 0x500);
    m.dtus[0].regs_mut().set_cmd(CmdReg::DataSize, 16);
    m.dtus[0].regs_mut().set_cmd(CmdReg::ReplyEpid, 5);
    m.dtus[0].regs_mut().set_cmd(CmdReg::ReplyLabel, 0xBB);
    m.issue_command(0, cmd(Opcode::Send, 3));
    m.run(RUN);
    assert_eq!(m.dtus[0].regs().get_send_ep(3).credits, 64);

    // core 7 replies to the message at 0x1000
    m.phys_write(7, 0x600, &[0x22; 8]);
    m.dtus[7].regs_mut().set_cmd(CmdReg::Offset, 0x1000);
    m.dtus[7].regs_mut().set_cmd(CmdReg::DataAddr, 0x600);
    m.dtus[7].regs_mut().set_cmd(CmdReg::DataSize, 8);
    m.issue_command(7, cmd(Opcode::Reply, 4));
    m.run(RUN);

    let done = m.dtus[7].get_command();
    assert_eq!(done.error, Error::None);

    // the stored header can no longer be replied to
    let mut stored = vec![0u8; MSG_HEADER_SIZE];
    m.phys_read(7, 0x1000, &mut stored);
    assert_eq!(stored[0] & MessageHeader::REPLY_ENABLED, 0);

    // the reply arrived on core 0 EP5 with a credit grant
    let ep = m.dtus[0].regs().get_recv_ep(5);
    assert_eq!(ep.occupied, 0b0001);
    assert_eq!(ep.msg_count, 1);

    let mut reply = vec![0u8; MSG_HEADER_SIZE + 8];
    m.phys_read(0, 0x2000, &mut reply);
    let header = MessageHeader::read_from(&reply);
    assert_eq!(
        header.flags,
        MessageHeader::REPLY | MessageHeader::GRANT_CREDITS
    );
    assert_eq!(header.label, 0xBB);
    assert_eq!(&reply[MSG_HEADER_SIZE..], &[0x22; 8]);

    // credits restored, slot on core 7 freed
    assert_eq!(m.dtus[0].regs().get_send_ep(3).credits, 128);
    assert_eq!(m.dtus[7].regs().get_recv_ep(4).occupied, 0);
}

/// Scenario 4: a full ring answers NO_RING_SPACE and stays untouched.
#[test]
fn ring_overflow() {
    let mut m = eight_core_machine();
    wire_channel(&mut m, 5, 0, 3, 7, 4, dtu_emu::dtu::regfile::CREDITS_UNLIM, 0x1000);

    // both slots already taken
    m.dtus[7].regs_mut().set_recv_ep(
        4,
        &RecvEp {
            buf_addr: 0x1000,
            msg_size: 64,
            size: 2,
            msg_count: 2,
            occupied: 0b11,
            unread: 0b11,
            ..Default::default()
        },
    );

    m.dtus[0].regs_mut().set_cmd(CmdReg::DataAddr, 0x500);
    m.dtus[0].regs_mut().set_cmd(CmdReg::DataSize, 16);
    m.issue_command(0, cmd(Opcode::Send, 3));
    m.run(RUN);

    let done = m.dtus[0].get_command();
    assert_eq!(done.error, Error::NoRingSpace);

    let ep = m.dtus[7].regs().get_recv_ep(4);
    assert_eq!(ep.occupied, 0b11);
    assert_eq!(ep.unread, 0b11);
    assert_eq!(ep.msg_count, 2);
}

/// Scenario 5: a missing mapping raises an upcall; the reply lets the
/// walk retry and the stalled transfer resume.
#[test]
fn page_fault_upcall() {
    // PE 0: memory, PE 1: paging (faulting), PE 2: pagefault handler
    let mut cfg = SimConfig::default();
    cfg.pes = vec![1, 0, 0x80_0000];
    cfg.mem_pe = 0;
    let mut m = Machine::new(cfg);

    m.dtus[1].regs_mut().set(DtuReg::VpeId, 0);
    m.dtus[2].regs_mut().set(DtuReg::VpeId, 0);
    m.dtus[1].regs_mut().set(DtuReg::Status, status::PAGEFAULTS);
    m.dtus[1].regs_mut().set(DtuReg::RootPt, 0x10000);
    m.dtus[1].regs_mut().set(DtuReg::PfEp, 1);

    // EP1 on the faulting PE sends upcalls to the handler's EP6
    m.dtus[1].regs_mut().set_send_ep(
        1,
        &SendEp {
            vpe_id: 0,
            target_core: 2,
            target_ep: 6,
            max_msg_size: 64,
            credits: dtu_emu::dtu::regfile::CREDITS_UNLIM,
            label: 0x77,
        },
    );
    m.dtus[2].regs_mut().set_recv_ep(
        6,
        &RecvEp { buf_addr: 0x3000, msg_size: 64, size: 4, ..Default::default() },
    );

    // an ordinary message channel whose payload sits on the unmapped page
    m.dtus[1].regs_mut().set_send_ep(
        3,
        &SendEp {
            vpe_id: 0,
            target_core: 2,
            target_ep: 4,
            max_msg_size: 64,
            credits: dtu_emu::dtu::regfile::CREDITS_UNLIM,
            label: 0xAA,
        },
    );
    m.dtus[2].regs_mut().set_recv_ep(
        4,
        &RecvEp { buf_addr: 0x4000, msg_size: 64, size: 4, ..Default::default() },
    );

    // sending from virt 0x4000 faults: the page is not mapped yet
    m.dtus[1].regs_mut().set_cmd(CmdReg::DataAddr, 0x4000);
    m.dtus[1].regs_mut().set_cmd(CmdReg::DataSize, 8);
    m.issue_command(1, cmd(Opcode::Send, 3));
    m.run(RUN);

    // the upcall arrived at the handler
    let pf_ring = m.dtus[2].regs().get_recv_ep(6);
    assert_eq!(pf_ring.msg_count, 1);

    m.issue_command(2, cmd(Opcode::FetchMsg, 6));
    m.run(RUN);
    let pf_msg = m.dtus[2].regs().get_cmd(CmdReg::Offset);
    assert_eq!(pf_msg, 0x3000);

    let mut upcall = vec![0u8; MSG_HEADER_SIZE + 24];
    m.phys_read(2, pf_msg, &mut upcall);
    let header = MessageHeader::read_from(&upcall);
    assert_eq!(
        header.flags,
        MessageHeader::PAGEFAULT | MessageHeader::REPLY_ENABLED
    );
    assert_eq!(header.label, 0x77);

    let body = &upcall[MSG_HEADER_SIZE..];
    assert_eq!(u64::from_le_bytes(body[0..8].try_into().unwrap()), 0); // OPCODE_PF
    assert_eq!(u64::from_le_bytes(body[8..16].try_into().unwrap()), 0x4000);
    assert_eq!(
        u64::from_le_bytes(body[16..24].try_into().unwrap()),
        (access::READ | access::INTERN) as u64
    );

    // the handler installs the mapping: level-1 PTE at the root, leaf
    // pointing at phys page 0x80000 with R|I rights
    m.phys_write_u64(1, 0x10000, 0x11000 | access::RWX as u64);
    m.phys_write_u64(
        1,
        0x11000 + 4 * 8,
        0x80000 | (access::READ | access::INTERN) as u64,
    );
    // the payload the retried send will pick up
    m.phys_write(1, 0x80000, &[0x5A; 8]);

    // reply with error = 0
    m.phys_write(2, 0x700, &0u64.to_le_bytes());
    m.dtus[2].regs_mut().set_cmd(CmdReg::Offset, pf_msg);
    m.dtus[2].regs_mut().set_cmd(CmdReg::DataAddr, 0x700);
    m.dtus[2].regs_mut().set_cmd(CmdReg::DataSize, 8);
    m.issue_command(2, cmd(Opcode::Reply, 6));
    m.run(RUN);

    // the walk retried and the TLB now maps the page
    let (res, phys) = m.dtus[1]
        .tlb_mut()
        .unwrap()
        .lookup(0x4321, access::READ | access::INTERN);
    assert_eq!(res, dtu_emu::dtu::tlb::TlbResult::Hit);
    assert_eq!(phys.offset, 0x80321);

    // the stalled send resumed and the message reached EP4
    let ep = m.dtus[2].regs().get_recv_ep(4);
    assert_eq!(ep.msg_count, 1);

    let mut msg = vec![0u8; MSG_HEADER_SIZE + 8];
    m.phys_read(2, 0x4000, &mut msg);
    assert_eq!(&msg[MSG_HEADER_SIZE..], &[0x5A; 8]);

    // the faulting PE's send command completed
    assert_eq!(m.dtus[1].get_command().error, Error::None);
    assert!(!m.dtus[1].command_in_progress());
}

/// Scenario 6: a message for a VPE that is no longer running bounces.
#[test]
fn vpe_mismatch_on_receive() {
    let mut m = eight_core_machine();
    wire_channel(&mut m, 5, 0, 3, 7, 4, 128, 0x1000);

    // the receiver now runs VPE 5, but the sender still targets VPE 6
    let mut sep = m.dtus[0].regs().get_send_ep(3);
    sep.vpe_id = 6;
    m.dtus[0].regs_mut().set_send_ep(3, &sep);

    m.dtus[0].regs_mut().set_cmd(CmdReg::DataAddr, 0x500);
    m.dtus[0].regs_mut().set_cmd(CmdReg::DataSize, 16);
    m.issue_command(0, cmd(Opcode::Send, 3));
    m.run(RUN);

    let done = m.dtus[0].get_command();
    assert_eq!(done.error, Error::VpeGone);

    // no buffer allocation, no ring change
    let ep = m.dtus[7].regs().get_recv_ep(4);
    assert_eq!(ep.occupied, 0);
    assert_eq!(ep.unread, 0);
    assert_eq!(ep.msg_count, 0);
}

/// Remote memory read and write through a MEMORY endpoint, including
/// chunking of an oversized request.
#[test]
fn remote_memory_read_write() {
    let mut m = machine_with_pes(vec![0x80_0000, 0x80_0000, 1], 2);

    m.dtus[0].regs_mut().set_mem_ep(
        2,
        &dtu_emu::dtu::regfile::MemEp {
            vpe_id: 0,
            remote_addr: 0x8000,
            remote_size: 0x4000,
            target_core: 1,
            flags: dtu_emu::dtu::regfile::mem_flags::READ
                | dtu_emu::dtu::regfile::mem_flags::WRITE,
        },
    );

    // write 5000 bytes (two chunks) from local 0x500 to remote 0x8000+0x10
    let data: Vec<u8> = (0..5000u32).map(|i| i as u8).collect();
    m.phys_write(0, 0x500, &data);
    m.dtus[0].regs_mut().set_cmd(CmdReg::DataAddr, 0x500);
    m.dtus[0].regs_mut().set_cmd(CmdReg::DataSize, 5000);
    m.dtus[0].regs_mut().set_cmd(CmdReg::Offset, 0x10);
    m.issue_command(0, cmd(Opcode::Write, 2));
    m.run(RUN);

    assert_eq!(m.dtus[0].get_command().error, Error::None);
    let mut remote = vec![0u8; 5000];
    m.phys_read(1, 0x8010, &mut remote);
    assert_eq!(remote, data);

    // read it back to local 0x40000
    m.dtus[0].regs_mut().set_cmd(CmdReg::DataAddr, 0x40000);
    m.dtus[0].regs_mut().set_cmd(CmdReg::DataSize, 5000);
    m.dtus[0].regs_mut().set_cmd(CmdReg::Offset, 0x10);
    m.issue_command(0, cmd(Opcode::Read, 2));
    m.run(RUN);

    assert_eq!(m.dtus[0].get_command().error, Error::None);
    let mut readback = vec![0u8; 5000];
    m.phys_read(0, 0x40000, &mut readback);
    assert_eq!(readback, data);
}

/// Atomic mode produces the same observable state as timing mode.
#[test]
fn atomic_mode_matches_timing() {
    let run_send = |atomic: bool| {
        let mut pes = vec![0x80_0000u64; 8];
        pes.push(1);
        let mut cfg = SimConfig::default();
        cfg.pes = pes;
        cfg.mem_pe = 8;
        cfg.atomic = atomic;
        let mut m = Machine::new(cfg);
        wire_channel(&mut m, 5, 0, 3, 7, 4, 128, 0x1000);

        m.phys_write(0, 0x500, &[0x33; 16]);
        m.dtus[0].regs_mut().set_cmd(CmdReg::DataAddr, 0x500);
        m.dtus[0].regs_mut().set_cmd(CmdReg::DataSize, 16);
        m.issue_command(0, cmd(Opcode::Send, 3));
        m.run(RUN);

        let ep = m.dtus[7].regs().get_recv_ep(4);
        (
            m.dtus[0].get_command().error,
            m.dtus[0].regs().get_send_ep(3).credits,
            ep.occupied,
            ep.unread,
            ep.msg_count,
        )
    };

    assert_eq!(run_send(false), run_send(true));
}
