//! `rknpu`: command-line interface for the RK3588 NPU driver core.
//!
//! ```text
//! USAGE:
//!   rknpu info                         Query actions on a simulated RK3588
//!   rknpu simulate [--jobs N] ...      Run blocking jobs on the software NPU
//!   rknpu regs <path> [--offset X]     Dump a mapped register window
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rknpu_chip::regs::{self, BANK_SIZE};
use rknpu_chip::ChipConfig;
use rknpu_driver::mmio::{MappedRegion, RegisterBank};
use rknpu_driver::software::{synthetic_tasks, SoftwareNpu};
use rknpu_driver::{Action, CoreMask, DriverConfig, SubmitRequest};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rknpu", about = "RK3588 NPU driver core CLI", version)]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Print every query action against a simulated device.
    Info {
        /// Also dump every non-zero register.
        #[arg(long)]
        dump: bool,
    },
    /// Run blocking jobs against the software NPU.
    Simulate {
        /// Number of jobs.
        #[arg(long, default_value_t = 8)]
        jobs: u32,
        /// Tasks per job.
        #[arg(long, default_value_t = 64)]
        tasks: u32,
        /// Cores: auto, or a comma-separated list such as 0,1,2.
        #[arg(long, default_value = "auto")]
        cores: String,
        /// Override the per-commit task limit.
        #[arg(long)]
        max_submit: Option<u32>,
        /// Simulated completion latency in microseconds.
        #[arg(long, default_value_t = 200)]
        latency_us: u64,
    },
    /// Map a register window from a device file and print it.
    Regs {
        /// Device file (e.g. /dev/uio0).
        path: String,
        /// Offset of the window in the file.
        #[arg(long, default_value = "0", value_parser = parse_u64)]
        offset: u64,
        /// Window size in bytes.
        #[arg(long, default_value = "0x10000", value_parser = parse_u64)]
        size: u64,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Cmd::Info { dump } => cmd_info(dump)?,
        Cmd::Simulate {
            jobs,
            tasks,
            cores,
            max_submit,
            latency_us,
        } => cmd_simulate(jobs, tasks, &cores, max_submit, Duration::from_micros(latency_us))?,
        Cmd::Regs { path, offset, size } => cmd_regs(&path, offset, size)?,
    }

    Ok(())
}

fn parse_u64(s: &str) -> std::result::Result<u64, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("{s}: {e}"))
}

fn parse_cores(list: &str) -> Result<CoreMask> {
    if list == "auto" {
        return Ok(CoreMask::AUTO);
    }
    let mut mask = CoreMask::empty();
    for part in list.split(',') {
        let core: usize = part.trim().parse().with_context(|| format!("bad core '{part}'"))?;
        if core >= rknpu_driver::job::MAX_CORES {
            bail!("core {core} out of range");
        }
        mask |= CoreMask::for_core(core);
    }
    Ok(mask)
}

fn cmd_info(dump: bool) -> Result<()> {
    let npu = SoftwareNpu::rk3588();
    let device = npu.attach(DriverConfig::from_env())?;
    let session = device.open_session();
    let chip = device.chip();

    println!("Chip         : {} (simulated)", chip.name);
    println!("Cores        : {} (mask {:#x})", chip.num_cores, chip.core_mask);
    println!("Max submit   : {} tasks per commit", chip.max_submit_number);
    println!("DMA mask     : {} bits", chip.dma_mask_bits);
    println!();

    for action in Action::QUERIES {
        let value = session.action(action)?;
        println!("{:<18} : {value:#x} ({value})", format!("{action:?}"));
    }
    println!("{:<18} : {:?}", "CoreLoad", device.core_load());

    if dump {
        let _power = device.power().guard()?;
        println!();
        print!("{}", device.dump_registers());
    }
    Ok(())
}

fn cmd_simulate(jobs: u32, tasks: u32, cores: &str, max_submit: Option<u32>, latency: Duration) -> Result<()> {
    let mask = parse_cores(cores)?;
    let mut chip = ChipConfig::rk3588();
    if let Some(max) = max_submit {
        if max == 0 || max > chip.max_submit_number {
            bail!("--max-submit must be 1..={}", chip.max_submit_number);
        }
        chip.max_submit_number = max;
    }

    let npu = SoftwareNpu::new(chip);
    let device = npu.attach(DriverConfig::from_env())?;
    let responder = npu.responder(&device, latency);
    let session = device.open_session();

    let task_buffer = session.create(u64::from(tasks.max(1)) * 40, None)?;
    session
        .object(task_buffer.object_id)?
        .write_tasks(&synthetic_tasks(tasks, 0x10_0000))?;

    println!("{:>4}  {:>6}  {:>7}  {:>10}  {:>10}", "job", "cores", "tasks", "hw (us)", "total (us)");
    let started = Instant::now();
    for i in 0..jobs {
        let t0 = Instant::now();
        let outcome = session.submit(&SubmitRequest::new(task_buffer.object_id, 0, tasks).with_core_mask(mask))?;
        println!(
            "{i:>4}  {:>#6x}  {:>7}  {:>10}  {:>10}",
            outcome.core_mask.bits(),
            outcome.task_counter,
            outcome.hw_elapsed.as_micros(),
            t0.elapsed().as_micros()
        );
    }

    let commits: usize = npu.regs.iter().map(|r| r.commits().len()).sum();
    println!();
    println!(
        "{jobs} jobs, {commits} commits in {:.1} ms",
        started.elapsed().as_secs_f64() * 1e3
    );
    drop(session);
    responder.stop();
    Ok(())
}

fn cmd_regs(path: &str, offset: u64, size: u64) -> Result<()> {
    let size = usize::try_from(size).context("window size")?;
    let region = MappedRegion::open(path, offset, size).with_context(|| format!("mapping {path}"))?;

    if size >= BANK_SIZE {
        let banks: Vec<Arc<dyn RegisterBank>> = vec![Arc::new(region)];
        print!("{}", rknpu_driver::diag::dump_registers(&banks));
        return Ok(());
    }

    println!("PC block of {path} @ {offset:#x}:");
    for reg in (regs::VERSION..=regs::PC_DMA_BASE_ADDR + 8).step_by(4) {
        if reg + 4 > size {
            break;
        }
        println!("  0x{reg:04X} = 0x{:08X}", region.read32(reg));
    }
    Ok(())
}
