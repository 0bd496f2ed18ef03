//! Command line front end
//!
//! Loads a flat firmware binary (and optionally a device tree blob) into the
//! SoC and runs it until the success PC or the cycle bound is reached. A
//! background thread feeds single characters from stdin into the console
//! UART's receive FIFO.

use anyhow::{bail, Context};
use clap::Parser;
use hart::XlenU;
use soc::uart::ConsoleInput;
use soc::{ConsoleKind, Soc};
use std::io::Read;
use std::path::PathBuf;
use std::thread;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum ConsoleArg {
    Simple,
    Ns16550,
}

impl From<ConsoleArg> for ConsoleKind {
    fn from(arg: ConsoleArg) -> Self {
        match arg {
            ConsoleArg::Simple => ConsoleKind::Simple,
            ConsoleArg::Ns16550 => ConsoleKind::Ns16550,
        }
    }
}

#[derive(Debug, Parser)]
#[command(about = "single-hart riscv soc emulator")]
struct Args {
    /// Flat firmware binary, loaded at the dram base
    #[arg(short = 'f', long)]
    firmware: PathBuf,

    /// Device tree blob, loaded near the high end of dram
    #[arg(short = 'd', long)]
    dtb: Option<PathBuf>,

    /// Stop once the pc reaches this (hex) address
    #[arg(short = 's', long, value_parser = parse_hex)]
    success_pc: Option<XlenU>,

    /// Stop after this many cycles, 0 meaning never
    #[arg(short = 'n', long, default_value_t = 0)]
    max_cycles: u64,

    /// Which uart model is the console
    #[arg(long, value_enum, default_value_t = ConsoleArg::Simple)]
    console: ConsoleArg,
}

fn parse_hex(arg: &str) -> Result<XlenU, String> {
    let digits = arg.trim_start_matches("0x");
    XlenU::from_str_radix(digits, 16).map_err(|e| format!("invalid hex address: {}", e))
}

/// Put the controlling terminal into non-canonical, no-echo mode so the
/// guest sees key presses immediately. Not a tty, no raw mode.
fn set_raw_terminal() {
    use nix::sys::termios::{self, LocalFlags, SetArg, SpecialCharacterIndices};

    let stdin = std::io::stdin();
    let Ok(mut term) = termios::tcgetattr(&stdin) else {
        return;
    };
    term.local_flags &= !(LocalFlags::ICANON | LocalFlags::ECHO);
    term.control_chars[SpecialCharacterIndices::VMIN as usize] = 1;
    term.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;
    if let Err(err) = termios::tcsetattr(&stdin, SetArg::TCSANOW, &term) {
        log::warn!("could not configure the terminal: {}", err);
    }
}

/// Read single characters from stdin forever and hand them to the console.
fn spawn_input_thread(console: Box<dyn ConsoleInput>) {
    thread::spawn(move || {
        set_raw_terminal();
        let mut stdin = std::io::stdin();
        let mut byte = [0u8; 1];
        loop {
            match stdin.read(&mut byte) {
                Ok(1) => console.push_byte(byte[0]),
                Ok(_) => break,
                Err(err) => {
                    log::warn!("stdin read failed: {}", err);
                    break;
                }
            }
        }
    });
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let firmware = std::fs::read(&args.firmware)
        .with_context(|| format!("could not read firmware {}", args.firmware.display()))?;
    if firmware.is_empty() {
        bail!("firmware {} is empty", args.firmware.display());
    }

    let dtb = match &args.dtb {
        Some(path) => Some(
            std::fs::read(path)
                .with_context(|| format!("could not read dtb {}", path.display()))?,
        ),
        None => {
            log::warn!("no dtb given, an os kernel will probably not come up");
            None
        }
    };

    let mut soc = Soc::new(&firmware, dtb.as_deref(), args.console.into())?;

    spawn_input_thread(soc.console_input());

    log::info!(
        "starting at the reset vector: {} bytes firmware, success pc {:?}, cycle bound {}",
        firmware.len(),
        args.success_pc,
        args.max_cycles
    );
    soc.run(args.success_pc, args.max_cycles);

    log::info!(
        "stopped at pc {:#x} after {} cycles",
        soc.hart.pc(),
        soc.hart.cycle()
    );
    Ok(())
}
