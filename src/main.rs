use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::info;

use rv32sim::{System, SystemConfig};

/// RV32IMAC+Zcmp system emulator testbench
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Flat binary to load, as FILE or FILE@ADDR (ADDR defaults to the RAM base)
    #[arg(long = "bin", value_name = "FILE[@ADDR]")]
    bin: Vec<String>,

    /// Print memory between START and END (exclusive) after execution finishes
    #[arg(long = "dump", num_args = 2, value_names = ["START", "END"], value_parser = parse_num_u32, action = clap::ArgAction::Append)]
    dump: Vec<u32>,

    /// Maximum number of cycles to run before exiting (0 = no limit)
    #[arg(long, default_value_t = 100_000, value_parser = parse_num_u64)]
    cycles: u64,

    /// Memory size in units of 1024 bytes
    #[arg(long, default_value_t = 256 * 1024, value_parser = parse_num_u32)]
    memsize: u32,

    /// Print execution tracing info
    #[arg(long)]
    trace: bool,

    /// Enable tracing upon reaching this PC (can be passed multiple times)
    #[arg(long = "ton-pc", value_name = "PC", value_parser = parse_num_u32)]
    ton_pc: Vec<u32>,

    /// Disable tracing upon reaching this PC (can be passed multiple times)
    #[arg(long = "toff-pc", value_name = "PC", value_parser = parse_num_u32)]
    toff_pc: Vec<u32>,

    /// Use the exit code written to the exit port as this process's exit
    /// code, or 255 if the run timed out
    #[arg(long)]
    cpuret: bool,

    /// Restore machine state from a snapshot before running
    #[arg(long = "state-in", value_name = "FILE")]
    state_in: Option<PathBuf>,

    /// Save machine state to a snapshot after running
    #[arg(long = "state-out", value_name = "FILE")]
    state_out: Option<PathBuf>,
}

fn parse_num_u64(s: &str) -> Result<u64, String> {
    let (digits, radix) = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => (hex, 16),
        None => (s, 10),
    };
    u64::from_str_radix(digits, radix).map_err(|e| e.to_string())
}

fn parse_num_u32(s: &str) -> Result<u32, String> {
    parse_num_u64(s).and_then(|v| u32::try_from(v).map_err(|_| "value out of range".into()))
}

/// Split a `FILE[@ADDR]` binary spec.
fn parse_bin_spec(spec: &str) -> Result<(PathBuf, Option<u32>)> {
    match spec.rsplit_once('@') {
        Some((path, addr)) => {
            let addr = parse_num_u32(addr)
                .map_err(|e| anyhow::anyhow!("bad load address in {:?}: {}", spec, e))?;
            Ok((PathBuf::from(path), Some(addr)))
        }
        None => Ok((PathBuf::from(spec), None)),
    }
}

fn main() -> Result<ExitCode> {
    env_logger::init();
    let args = Args::parse();

    if args.bin.is_empty() && args.state_in.is_none() {
        bail!("nothing to run: pass at least one --bin or --state-in");
    }

    let mut system = match &args.state_in {
        Some(path) => {
            let blob = fs::read(path)
                .with_context(|| format!("reading snapshot {}", path.display()))?;
            info!("restoring state from {}", path.display());
            System::restore_state(&blob)?
        }
        None => System::new(SystemConfig {
            ram_size: args
                .memsize
                .checked_mul(1024)
                .context("memory size overflows the address space")?,
            ..SystemConfig::default()
        }),
    };

    for spec in &args.bin {
        let (path, addr) = parse_bin_spec(spec)?;
        let addr = addr.unwrap_or(system.config().ram_base);
        let data =
            fs::read(&path).with_context(|| format!("reading binary {}", path.display()))?;
        info!("loading {} ({} bytes) at {:#010x}", path.display(), data.len(), addr);
        system.load_binary(&data, addr)?;
    }

    let mut trace = args.trace;
    let mut cycles = 0u64;
    let mut guest_exit = None;
    let stdout = std::io::stdout();

    while args.cycles == 0 || cycles < args.cycles {
        system.step(trace);
        cycles += 1;

        let output = system.drain_output();
        if !output.is_empty() {
            let mut handle = stdout.lock();
            handle.write_all(&output)?;
            handle.flush()?;
        }

        if let Some(code) = system.exit_code() {
            guest_exit = Some(code);
            break;
        }

        if !trace && args.ton_pc.contains(&system.cpu.pc) {
            println!("(Trace enabled at PC {:08x})", system.cpu.pc);
            trace = true;
        }
        if trace && args.toff_pc.contains(&system.cpu.pc) {
            println!("(Trace disabled at PC {:08x})", system.cpu.pc);
            trace = false;
        }
    }

    match guest_exit {
        Some(code) => {
            println!("CPU requested halt. Exit code {}", code);
            println!("Ran for {} cycles", cycles);
        }
        None => println!("Timed out."),
    }

    for range in args.dump.chunks(2) {
        let (start, end) = (range[0], range[1]);
        println!("Dumping memory from {:08x} to {:08x}:", start, end);
        let mut line = String::new();
        for i in 0..end.wrapping_sub(start) {
            let byte = system.read_memory(start.wrapping_add(i)).unwrap_or(0);
            line.push_str(&format!("{:02x}", byte));
            if i % 16 == 15 {
                println!("{}", line);
                line.clear();
            } else {
                line.push(' ');
            }
        }
        if !line.is_empty() {
            println!("{}", line.trim_end());
        }
        println!();
    }

    if let Some(path) = &args.state_out {
        let blob = system.save_state()?;
        fs::write(path, &blob)
            .with_context(|| format!("writing snapshot {}", path.display()))?;
        info!("saved {} byte snapshot to {}", blob.len(), path.display());
    }

    if args.cpuret {
        match guest_exit {
            Some(code) => Ok(ExitCode::from(code as u8)),
            None => Ok(ExitCode::from(255)),
        }
    } else {
        Ok(ExitCode::SUCCESS)
    }
}
