//! Operator and demo front end for `shm-spinlock`.
//!
//! `demo` provisions a region and spawns worker processes of this binary that
//! contend for the same flag. The other subcommands inspect or repair a lock
//! from the outside.

use std::process::{Command as ProcessCommand, ExitCode};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use shm_spinlock::{Backing, LockOptions, ShmLock, region};

/// Exit code of a worker that gave up waiting for the lock.
const EXIT_TIMEOUT: u8 = 2;

/// Cross-process spinlock over a shared-memory flag byte.
#[derive(Parser, Debug)]
#[command(name = "shm-spinlock")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Provision a region and let worker processes contend for its lock.
    Demo(DemoArgs),

    /// Attach to an existing region, take the lock, hold it, release it.
    Worker(WorkerArgs),

    /// Print whether the lock is currently held.
    Status(Target),

    /// Force the flag back to unlocked (recovers a lock whose holder died).
    Reset(Target),

    /// Delete the backing object of a region.
    Remove {
        /// Region identity (`/name` for POSIX shm, otherwise a file path).
        #[arg(long)]
        region: String,
    },
}

#[derive(Args, Debug, Clone)]
struct Target {
    /// Region identity (`/name` for POSIX shm, otherwise a file path).
    #[arg(long)]
    region: String,

    /// Byte offset of the flag inside the region.
    #[arg(long, default_value_t = 0)]
    offset: usize,
}

impl Target {
    fn attach(&self) -> Result<ShmLock> {
        let options = LockOptions::new(self.region.as_str())
            .offset(self.offset)
            .create(false);
        ShmLock::open(options).with_context(|| format!("attaching to {}", self.region))
    }
}

#[derive(Args, Debug)]
struct DemoArgs {
    #[arg(long, default_value = "/dev/shm/ipc_region_demo")]
    region: String,

    #[arg(long, default_value_t = 128)]
    offset: usize,

    /// Number of worker processes.
    #[arg(long, default_value_t = 2)]
    workers: usize,

    /// How long each worker holds the lock.
    #[arg(long, default_value_t = 1000)]
    hold_ms: u64,

    /// How long each worker waits for the lock.
    #[arg(long, default_value_t = 5000)]
    timeout_ms: u64,
}

#[derive(Args, Debug)]
struct WorkerArgs {
    #[command(flatten)]
    target: Target,

    /// Give up after this long; waits forever when omitted.
    #[arg(long)]
    timeout_ms: Option<u64>,

    #[arg(long, default_value_t = 0)]
    hold_ms: u64,

    /// Acquire/release cycles to run.
    #[arg(long, default_value_t = 1)]
    iterations: u64,

    /// Increment the 8-byte counter at this offset while holding the lock.
    #[arg(long)]
    counter_offset: Option<usize>,

    /// Label used in progress lines.
    #[arg(long, default_value_t = 1)]
    id: usize,

    /// Suppress progress lines.
    #[arg(long)]
    quiet: bool,
}

fn main() -> ExitCode {
    shm_spinlock::init_tracing();

    let cli = Cli::parse();
    match run(cli.command) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(command: Command) -> Result<ExitCode> {
    match command {
        Command::Demo(args) => demo(&args),
        Command::Worker(args) => worker(&args),
        Command::Status(target) => {
            let lock = target.attach()?;
            println!("{}", if lock.is_locked() { "locked" } else { "unlocked" });
            Ok(ExitCode::SUCCESS)
        }
        Command::Reset(target) => {
            let lock = target.attach()?;
            lock.release();
            println!("reset {} at offset {}", target.region, target.offset);
            Ok(ExitCode::SUCCESS)
        }
        Command::Remove { region: identity } => {
            region::remove(&Backing::resolve(&identity)?)?;
            println!("removed {identity}");
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn demo(args: &DemoArgs) -> Result<ExitCode> {
    let backing = Backing::resolve(&args.region)?;
    region::ensure(&backing, (args.offset as u64).saturating_add(1), true)?;
    println!("Shared memory: {} (flag at offset {})", args.region, args.offset);

    let exe = std::env::current_exe().context("locating own executable")?;
    let mut children = Vec::with_capacity(args.workers);
    for id in 1..=args.workers {
        let child = ProcessCommand::new(&exe)
            .arg("worker")
            .args(["--region", &args.region])
            .args(["--offset", &args.offset.to_string()])
            .args(["--timeout-ms", &args.timeout_ms.to_string()])
            .args(["--hold-ms", &args.hold_ms.to_string()])
            .args(["--id", &id.to_string()])
            .spawn()
            .with_context(|| format!("spawning worker {id}"))?;
        children.push(child);
        // stagger so the first worker is likely to win
        thread::sleep(Duration::from_millis(100));
    }

    let mut failed = 0;
    for mut child in children {
        if !child.wait().context("waiting for worker")?.success() {
            failed += 1;
        }
    }

    println!("Demo complete.");
    Ok(if failed == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn worker(args: &WorkerArgs) -> Result<ExitCode> {
    let mut lock = args.target.attach()?;
    let counter = args
        .counter_offset
        .map(|offset| counter_ptr(&lock, offset))
        .transpose()?;
    let timeout = args.timeout_ms.map(Duration::from_millis);
    let hold = Duration::from_millis(args.hold_ms);
    let id = args.id;

    for _ in 0..args.iterations {
        if !args.quiet {
            println!("[worker {id}] trying to acquire...");
        }
        if !lock.acquire(timeout) {
            println!("[worker {id}] timeout waiting for lock");
            return Ok(ExitCode::from(EXIT_TIMEOUT));
        }
        if !args.quiet {
            println!("[worker {id}] acquired -> working {}ms", args.hold_ms);
        }

        if let Some(counter) = counter {
            // SAFETY: counter_ptr checked bounds and alignment; the counter is
            // only touched by processes holding this lock.
            unsafe {
                let value = counter.read_volatile();
                counter.write_volatile(value + 1);
            }
        }
        if !hold.is_zero() {
            thread::sleep(hold);
        }

        lock.release();
        if !args.quiet {
            println!("[worker {id}] released");
        }
    }

    lock.close();
    Ok(ExitCode::SUCCESS)
}

fn counter_ptr(lock: &ShmLock, offset: usize) -> Result<*mut u64> {
    let region = lock.region();
    let end = offset.checked_add(8).filter(|end| *end <= region.len());
    let Some(end) = end.filter(|_| offset % 8 == 0) else {
        bail!(
            "counter at offset {offset} must be 8-byte aligned and inside the {}-byte region",
            region.len()
        );
    };
    if (offset..end).contains(&lock.offset()) {
        bail!("counter at offset {offset} overlaps the lock flag");
    }
    let base = region.as_ptr().context("region is not mapped")?;
    // SAFETY: bounds checked above.
    Ok(unsafe { base.as_ptr().add(offset).cast::<u64>() })
}
