use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;

use zynqus_csdemo::access::{DevMem, MemoryAccess, ProbeMemory};
use zynqus_csdemo::board::{self, Board, Devices};
use zynqus_csdemo::coresight::{CoreSight, Registry};
use zynqus_csdemo::demo::{Console, Demo, DemoError, DemoOptions, DEFAULT_TRACE_END, DEFAULT_TRACE_START};
use zynqus_csdemo::{primes, stm_example};

/// How the physical address space of the target is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Backend {
    Probe,
    DevMem,
    Sim,
}

impl std::str::FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match &s.to_ascii_lowercase()[..] {
            "probe" => Ok(Backend::Probe),
            "devmem" => Ok(Backend::DevMem),
            "sim" => Ok(Backend::Sim),
            _ => Err(format!(
                "'{}' is not a valid backend. Choose from [probe, devmem, sim].",
                s
            )),
        }
    }
}

fn parse_hex(s: &str) -> Result<u64, std::num::ParseIntError> {
    let digits = s.trim_start_matches("0x").trim_start_matches("0X");
    u64::from_str_radix(digits, 16)
}

#[derive(Parser, Debug)]
#[clap(version, about = "CoreSight trace demonstrators for the Xilinx Zynq UltraScale+ MPSoC")]
struct Opts {
    /// Register access: a debug probe, /dev/mem on the target, or a simulated SoC.
    #[clap(long, global = true, default_value = "probe")]
    backend: Backend,

    /// Target chip name passed to the debug probe.
    #[clap(long, global = true, default_value = "ZynqUltraScale+MPSoC")]
    chip: String,

    /// Index of the debug probe in the list of connected probes.
    #[clap(long, global = true, default_value_t)]
    probe_index: usize,

    /// Core the debug probe accesses memory through.
    #[clap(long, global = true, default_value_t)]
    core: usize,

    #[clap(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Configure a trace session, wait for the traced program and fetch the trace.
    Csdemo(CsdemoArgs),

    /// Run the prime number workload.
    Primes {
        /// Number of primes to find.
        #[clap(long, default_value_t = primes::TARGET_COUNT)]
        count: usize,

        /// Wait for RETURN before starting.
        #[clap(long)]
        pause: bool,
    },

    /// Send a string through the STM.
    Stm {
        /// Number of times the string is sent.
        #[clap(long, default_value_t = stm_example::DEFAULT_REPETITIONS)]
        count: usize,

        /// Stimulus port channel.
        #[clap(long, default_value_t)]
        channel: u16,
    },
}

#[derive(clap::Args, Debug)]
struct CsdemoArgs {
    /// Board to register. Defaults to $CSAL_BOARD, then the Zynq UltraScale+.
    #[clap(long)]
    board: Option<String>,

    /// CPU whose instructions are traced.
    #[clap(long, default_value_t)]
    cpu: usize,

    /// Add the STM as a trace source.
    #[clap(long)]
    stm: bool,

    /// Trace the STM only.
    #[clap(long)]
    stm_only: bool,

    /// Trace everything instead of the address range.
    #[clap(long)]
    full: bool,

    /// Keep the trace buffers running on flush.
    #[clap(long)]
    no_stop_on_flush: bool,

    /// Words captured by the main ETF after a trigger.
    #[clap(long, default_value_t)]
    post_trigger_words: u32,

    #[clap(long)]
    timestamps: bool,

    #[clap(long)]
    cycle_accurate: bool,

    #[clap(long)]
    return_stack: bool,

    /// First address of the traced range, in hex.
    #[clap(long, parse(try_from_str = parse_hex), default_value = "15a1c")]
    start: u64,

    /// Last address of the traced range, in hex.
    #[clap(long, parse(try_from_str = parse_hex), default_value = "15b2c")]
    end: u64,

    /// Wait for RETURN after each step.
    #[clap(long)]
    pause: bool,

    /// Less progress output.
    #[clap(short, long)]
    quiet: bool,

    /// Do not log every register access.
    #[clap(long)]
    no_diag: bool,

    /// Run the TPIU test patterns first.
    #[clap(long)]
    tpiu_pattern_test: bool,

    /// Device the trace is written to instead of stdout.
    #[clap(long, parse(from_os_str))]
    uart: Option<PathBuf>,

    /// Send the trace as raw bytes instead of hex words.
    #[clap(long)]
    raw: bool,

    /// Write a snapshot for offline decoding to this directory.
    #[clap(long, parse(from_os_str))]
    snapshot: Option<PathBuf>,
}

impl CsdemoArgs {
    fn options(&self) -> DemoOptions {
        if self.full && (self.start, self.end) != (DEFAULT_TRACE_START, DEFAULT_TRACE_END) {
            log::warn!("Address range is ignored when tracing everything");
        }
        DemoOptions {
            cpu: self.cpu,
            stm: self.stm,
            stm_only: self.stm_only,
            full: self.full,
            stop_on_flush: !self.no_stop_on_flush,
            post_trigger_words: self.post_trigger_words,
            timestamps: self.timestamps,
            cycle_accurate: self.cycle_accurate,
            return_stack: self.return_stack,
            trace_start: self.start,
            trace_end: self.end,
            tpiu_pattern_test: self.tpiu_pattern_test,
            raw: self.raw,
            verbose: !self.quiet,
            snapshot: self.snapshot.clone(),
        }
    }
}

fn memory(
    opts: &Opts,
    registry: &Registry,
    devices: &Devices,
) -> anyhow::Result<Box<dyn MemoryAccess>> {
    Ok(match opts.backend {
        Backend::Probe => Box::new(
            ProbeMemory::attach(&opts.chip, opts.probe_index, opts.core)
                .with_context(|| format!("Failed to attach to {}", opts.chip))?,
        ),
        Backend::DevMem => Box::new(DevMem::open().context("Failed to map physical memory")?),
        Backend::Sim => Box::new(board::simulator(registry, devices)),
    })
}

fn default_filter(diag: bool) -> &'static str {
    if diag {
        "debug"
    } else {
        "info"
    }
}

fn register_board(name: Option<&str>) -> anyhow::Result<(Registry, &'static Board, Devices)> {
    let mut registry = Registry::new();
    let (board, devices) =
        board::setup_known_board(name, &mut registry).context("Failed to register CoreSight devices")?;
    Ok((registry, board, devices))
}

fn csdemo(opts: &Opts, args: &CsdemoArgs) -> anyhow::Result<ExitCode> {
    println!("CoreSight demonstrator");

    let (registry, board, devices) = register_board(args.board.as_deref())?;
    let memory = memory(opts, &registry, &devices)?;
    let mut demo = Demo::new(CoreSight::new(memory, registry), board, devices, args.options());
    let mut console = Console::stdio(args.pause);

    let uart: Box<dyn Write> = match &args.uart {
        Some(path) => Box::new(
            OpenOptions::new()
                .write(true)
                .open(path)
                .with_context(|| format!("Failed to open {}", path.display()))?,
        ),
        None => Box::new(io::stdout()),
    };

    match demo.run(&mut console, uart) {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(DemoError::Quit) => Ok(ExitCode::FAILURE),
        Err(e) => Err(e).context("Trace demo failed"),
    }
}

fn main() -> anyhow::Result<ExitCode> {
    let opts = Opts::parse();

    // Register accesses are logged at debug level. RUST_LOG overrides the default.
    let diag = matches!(&opts.command, Command::Csdemo(args) if !args.no_diag);
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(default_filter(diag)),
    )
    .init();

    match &opts.command {
        Command::Csdemo(args) => csdemo(&opts, args),
        Command::Primes { count, pause } => {
            if *pause {
                match Console::stdio(true).app_pause() {
                    Ok(()) => {}
                    Err(DemoError::Quit) => return Ok(ExitCode::FAILURE),
                    Err(e) => return Err(e.into()),
                }
            }
            println!("Demo application to trace");
            primes::calculate_primes(*count);
            println!("End of Demo application");
            Ok(ExitCode::SUCCESS)
        }
        Command::Stm { count, channel } => {
            let (registry, _, devices) = register_board(None)?;
            let memory = memory(&opts, &registry, &devices)?;
            let mut cs = CoreSight::new(memory, registry);
            stm_example::string_example(&mut cs, devices.stm, *channel, *count)
                .context("STM example failed")?;
            Ok(ExitCode::SUCCESS)
        }
    }
}
