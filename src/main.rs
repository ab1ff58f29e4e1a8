//! dtu-emu: behavioral model of a per-tile Data Transfer Unit

use std::env;
use std::path::Path;

use dtu_emu::bringup::{Bringup, KernelImage};
use dtu_emu::config::SimConfig;
use dtu_emu::dtu::regfile::{DtuReg, EpType};
use dtu_emu::sim::Machine;

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();

    let mut dump_state = false;
    let mut max_steps = 1_000_000usize;
    let mut config_path = None;
    let mut kernel_path = None;

    let mut iter = args[1..].iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--dump-state" => dump_state = true,
            "--kernel" => kernel_path = iter.next().cloned(),
            "--max-steps" => {
                max_steps = iter
                    .next()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(max_steps);
            }
            "--help" | "-h" => {
                print_usage();
                return Ok(());
            }
            other if !other.starts_with('-') => config_path = Some(other.to_string()),
            other => {
                eprintln!("unknown option: {}", other);
                print_usage();
                std::process::exit(1);
            }
        }
    }

    let cfg = match &config_path {
        Some(path) => {
            SimConfig::load_from_file(Path::new(path))
                .ok_or_else(|| anyhow::anyhow!("unable to load config '{}'", path))?
        }
        None => SimConfig::load(),
    };
    cfg.validate();

    println!("PEs: {:?} (memory PE: {})", cfg.pes, cfg.mem_pe);
    if !cfg.cmdline.is_empty() {
        println!("Boot command line: {}", cfg.cmdline);
    }
    println!();

    let kernel = match &kernel_path {
        Some(path) => Some(KernelImage::from_elf(Path::new(path))?),
        None => None,
    };

    let mut machine = Machine::new(cfg);

    // plant the initial state of every core PE
    for pe in 0..machine.num_pes() {
        if machine.cfg.pe_is_mem(pe) {
            continue;
        }
        if !machine.cfg.cmdline.is_empty() {
            let mut bringup = Bringup::new(&mut machine, pe, kernel);
            bringup.init_state()?;
        }
    }

    let steps = machine.run(max_steps);
    println!("Simulation drained after {} events at tick {}", steps, machine.now);

    if dump_state {
        println!();
        print_state(&machine);
    }

    Ok(())
}

fn print_state(machine: &Machine) {
    for (pe, dtu) in machine.dtus.iter().enumerate() {
        let core = &machine.cores[pe];
        println!("PE{:02}:", pe);
        println!("  MSG_CNT:  {}", dtu.regs().get(DtuReg::MsgCnt));
        println!("  ROOT_PT:  {:#x}", dtu.regs().get(DtuReg::RootPt));
        println!("  VPE_ID:   {}", dtu.regs().get(DtuReg::VpeId));
        println!(
            "  core:     suspended={} deny_suspend={} irqs={:?}",
            core.suspended, core.deny_suspend, core.irqs
        );

        for ep in 0..dtu.params.num_endpoints {
            match dtu.regs().ep_type(ep) {
                EpType::Invalid => {}
                EpType::Send => {
                    let s = dtu.regs().get_send_ep(ep);
                    println!(
                        "  EP{:02}: Send[core={} ep={} maxmsg={} credits={}]",
                        ep, s.target_core, s.target_ep, s.max_msg_size, s.credits
                    );
                }
                EpType::Receive => {
                    let r = dtu.regs().get_recv_ep(ep);
                    println!(
                        "  EP{:02}: Recv[buf={:#x} slots={} msgs={} occ={:#x} unr={:#x}]",
                        ep, r.buf_addr, r.size, r.msg_count, r.occupied, r.unread
                    );
                }
                EpType::Memory => {
                    let m = dtu.regs().get_mem_ep(ep);
                    println!(
                        "  EP{:02}: Mem[core={} addr={:#x} size={:#x} flags={:#x}]",
                        ep, m.target_core, m.remote_addr, m.remote_size, m.flags
                    );
                }
            }
        }
    }
}

fn print_usage() {
    println!("usage: dtu-emu [options] [config.toml]");
    println!();
    println!("options:");
    println!("  --dump-state        print DTU and core state after the run");
    println!("  --kernel <elf>      kernel image for initial page tables");
    println!("  --max-steps <n>     stop after n simulation events");
}
