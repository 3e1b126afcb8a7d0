//! PDP-11/70 emulator binary.
//!
//! Boots from an RK05/RL02 image or an absolute loader tape and wires
//! the console TTY to stdin/stdout. Logging goes to stderr, filtered by
//! `RUST_LOG`.

use std::io::Read;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::thread;

use tracing_subscriber::EnvFilter;

use emu_pdp1170::{ChannelConsole, MachineConfig, Pdp1170, RunOutcome};
use format_bic::BicFile;

struct CliArgs {
    config_path: Option<PathBuf>,
    memory_pages: Option<u32>,
    tape_path: Option<PathBuf>,
    rk05_paths: Vec<PathBuf>,
    rl02_paths: Vec<PathBuf>,
    load_path: Option<PathBuf>,
    load_at: u16,
    start: Option<u16>,
    snapshots: bool,
    switches: u16,
}

fn usage() -> ! {
    eprintln!("usage: emu-pdp1170 [options]");
    eprintln!("  --config f.json   load a machine configuration");
    eprintln!("  --memory-pages n  memory size in 8 KiB pages (default 30)");
    eprintln!("  --tape f.bic      load an absolute loader tape");
    eprintln!("  --rk05 f.rk       attach an RK05 image (repeatable, installs bootstrap)");
    eprintln!("  --rl02 f.rl       attach an RL02 image (repeatable)");
    eprintln!("  --load f.bin      load a raw binary at --at");
    eprintln!("  --at addr         load address for --load, octal (default 1000)");
    eprintln!("  --start addr      override the start PC, octal");
    eprintln!("  --snapshots       stage disk writes in memory");
    eprintln!("  --switches val    console switch register, octal");
    process::exit(1);
}

fn octal_arg(value: Option<&String>) -> u16 {
    let Some(raw) = value else { usage() };
    match u16::from_str_radix(raw, 8) {
        Ok(v) => v,
        Err(_) => {
            eprintln!("not an octal value: {raw}");
            usage()
        }
    }
}

fn parse_args() -> CliArgs {
    let args: Vec<String> = std::env::args().collect();
    let mut cli = CliArgs {
        config_path: None,
        memory_pages: None,
        tape_path: None,
        rk05_paths: Vec::new(),
        rl02_paths: Vec::new(),
        load_path: None,
        load_at: 0o1000,
        start: None,
        snapshots: false,
        switches: 0,
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" => {
                i += 1;
                cli.config_path = args.get(i).map(PathBuf::from);
            }
            "--memory-pages" => {
                i += 1;
                cli.memory_pages = args.get(i).and_then(|s| s.parse().ok());
            }
            "--tape" => {
                i += 1;
                cli.tape_path = args.get(i).map(PathBuf::from);
            }
            "--rk05" => {
                i += 1;
                match args.get(i) {
                    Some(p) => cli.rk05_paths.push(PathBuf::from(p)),
                    None => usage(),
                }
            }
            "--rl02" => {
                i += 1;
                match args.get(i) {
                    Some(p) => cli.rl02_paths.push(PathBuf::from(p)),
                    None => usage(),
                }
            }
            "--load" => {
                i += 1;
                cli.load_path = args.get(i).map(PathBuf::from);
            }
            "--at" => {
                i += 1;
                cli.load_at = octal_arg(args.get(i));
            }
            "--start" => {
                i += 1;
                cli.start = Some(octal_arg(args.get(i)));
            }
            "--snapshots" => cli.snapshots = true,
            "--switches" => {
                i += 1;
                cli.switches = octal_arg(args.get(i));
            }
            "--help" | "-h" => usage(),
            other => {
                eprintln!("unknown option: {other}");
                usage();
            }
        }
        i += 1;
    }
    cli
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = parse_args();

    let mut config = match &cli.config_path {
        Some(path) => match MachineConfig::load(path) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("{err}");
                process::exit(1);
            }
        },
        None => MachineConfig::default(),
    };
    if let Some(pages) = cli.memory_pages {
        config.memory_pages = pages;
    }
    config.rk05_images.extend(cli.rk05_paths.iter().cloned());
    config.rl02_images.extend(cli.rl02_paths.iter().cloned());
    config.snapshots |= cli.snapshots;
    if cli.start.is_some() {
        config.start_address = cli.start;
    }

    // Console: stdout for output, a reader thread feeding stdin bytes
    let (console, input_tx) = ChannelConsole::new(Box::new(std::io::stdout()));
    thread::spawn(move || {
        let mut byte = [0u8; 1];
        while let Ok(1) = std::io::stdin().read(&mut byte) {
            if input_tx.send(byte[0]).is_err() {
                break;
            }
        }
    });

    let mut machine = match Pdp1170::new(&config, Box::new(console)) {
        Ok(machine) => machine,
        Err(err) => {
            eprintln!("{err}");
            process::exit(1);
        }
    };
    machine.bus.set_console_switches(cli.switches);

    if let Some(path) = &cli.tape_path {
        let raw = match std::fs::read(path) {
            Ok(raw) => raw,
            Err(err) => {
                eprintln!("cannot read {}: {err}", path.display());
                process::exit(1);
            }
        };
        match BicFile::parse(&raw) {
            Ok(tape) => machine.load_tape(&tape),
            Err(err) => {
                eprintln!("bad tape {}: {err}", path.display());
                process::exit(1);
            }
        }
    }

    if let Some(path) = &cli.load_path {
        match std::fs::read(path) {
            Ok(raw) => {
                machine.load_image(cli.load_at, &raw);
                machine.cpu.regs.pc = cli.load_at;
            }
            Err(err) => {
                eprintln!("cannot read {}: {err}", path.display());
                process::exit(1);
            }
        }
    }
    if let Some(start) = config.start_address {
        machine.cpu.regs.pc = start;
    }

    eprintln!("starting at {:o}", machine.cpu.regs.pc);

    let terminate = Arc::new(AtomicBool::new(false));
    let pause = Arc::new(AtomicBool::new(false));
    match machine.run(&terminate, &pause) {
        RunOutcome::Halted => {
            eprintln!(
                "halted at {:o} after {} instructions",
                machine.cpu.regs.pc,
                machine.cpu.instruction_count()
            );
        }
        RunOutcome::Terminated => eprintln!("terminated"),
        RunOutcome::Paused => eprintln!("paused"),
    }
}
