use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use clap::Parser;
use log::LevelFilter;

use rv32_core::av::HeadlessAvBackend;
use rv32_core::cpu::{Cpu, DEFAULT_RUN_BUDGET};
use rv32_core::memory::Memory;
use rv32_core::RunState;

mod bootstrap;
mod elf;
mod logger;

/// Default guest RAM size (spec.md §6 "CLI").
const DEFAULT_MEMORY_BYTES: u32 = 128 * 1024 * 1024;

/// `-m` rejects anything above this.
const MAX_MEMORY_BYTES: u32 = 512 * 1024 * 1024;

#[derive(Parser)]
#[command(about = "Run a statically linked RV32IMA newlib executable")]
struct Args {
    /// Guest RAM size in bytes.
    #[arg(short = 'm', long, default_value_t = DEFAULT_MEMORY_BYTES)]
    memory: u32,

    /// Raise the log level to trace (every trap and syscall dispatched).
    #[arg(short, long, action)]
    verbose: bool,

    /// Print approximate MIPS to stderr once a second.
    #[arg(long, action)]
    profile: bool,

    /// Path to the RV32 ELF executable to run.
    program: PathBuf,

    /// Arguments forwarded to the guest as argv[1..].
    args: Vec<String>,
}

/// Validate the `-m` value against spec.md §6's CLI contract (reject `0`,
/// reject anything above [`MAX_MEMORY_BYTES`]) and round the accepted value
/// up to a whole number of pages, matching `Memory::new`'s precondition. `Err`
/// carries the rejected value back for the error message.
fn validated_ram_size(requested: u32) -> Result<u32, u32> {
    if requested == 0 || requested > MAX_MEMORY_BYTES {
        return Err(requested);
    }
    Ok((requested + 4095) & !4095)
}

fn main() -> ExitCode {
    let args = Args::parse();

    let level = if args.verbose { LevelFilter::Trace } else { LevelFilter::Info };
    logger::RunnerLogger::init(level).expect("failed to install logger");

    let ram_size = match validated_ram_size(args.memory) {
        Ok(size) => size,
        Err(bad) => {
            log::error!("-m must be between 1 and {MAX_MEMORY_BYTES} bytes, got {bad}");
            return ExitCode::FAILURE;
        }
    };

    let bytes = match fs::read(&args.program) {
        Ok(bytes) => bytes,
        Err(err) => {
            log::error!("failed to read {}: {err}", args.program.display());
            return ExitCode::FAILURE;
        }
    };

    let image = match elf::parse(&bytes) {
        Ok(image) => image,
        Err(err) => {
            log::error!("failed to load {}: {err}", args.program.display());
            return ExitCode::FAILURE;
        }
    };

    let mut mem = Memory::new(ram_size);
    let mut argv = vec![args.program.display().to_string()];
    argv.extend(args.args.iter().cloned());
    let (entry, sp) = bootstrap::bootstrap(&mut mem, &image, &argv);
    log::trace!("bootstrap complete: entry={entry:#010x} sp={sp:#010x}");

    let mut cpu = Cpu::new(mem, entry, sp, HeadlessAvBackend::default());

    if args.profile {
        spawn_profiler(cpu.cycle_counter());
    }

    loop {
        match cpu.run(DEFAULT_RUN_BUDGET) {
            RunState::BudgetExhausted => continue,
            RunState::Exited(status) => {
                return if status == 0 { ExitCode::SUCCESS } else { ExitCode::from(status) };
            }
        }
    }
}

/// Spawn the optional profiler thread (spec.md §5/§9 "Profiler thread"):
/// once a second, print the delta of the cycle counter as an approximate
/// MIPS figure to stderr.
fn spawn_profiler(cycles: std::sync::Arc<std::sync::atomic::AtomicU64>) {
    thread::spawn(move || {
        let mut last = cycles.load(Ordering::Relaxed);
        loop {
            thread::sleep(Duration::from_secs(1));
            let now = cycles.load(Ordering::Relaxed);
            let delta = now.saturating_sub(last);
            last = now;
            eprintln!("MIPS: {:.2}", delta as f64 / 1e6);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_zero() {
        assert_eq!(validated_ram_size(0), Err(0));
    }

    #[test]
    fn accepts_max_memory_bytes() {
        assert_eq!(validated_ram_size(MAX_MEMORY_BYTES), Ok(MAX_MEMORY_BYTES));
    }

    #[test]
    fn rejects_above_max_memory_bytes() {
        assert_eq!(validated_ram_size(MAX_MEMORY_BYTES + 1), Err(MAX_MEMORY_BYTES + 1));
    }

    #[test]
    fn rounds_up_to_a_whole_page() {
        assert_eq!(validated_ram_size(1), Ok(4096));
        assert_eq!(validated_ram_size(4096), Ok(4096));
        assert_eq!(validated_ram_size(4097), Ok(8192));
    }
}
