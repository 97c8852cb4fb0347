//! The CoreSight demonstrator.
//!
//! Runs one trace session on a registered board: the trace path of one CPU is enabled, its ETM
//! is programmed to trace an address range into the main ETF, and once the user stops the
//! session the captured trace is read back and sent to a UART. Progress is gated by keypresses
//! on a [`Console`].
use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use crate::access::MemoryAccess;
use crate::board::{Board, Devices};
use crate::coresight::etf::{FlushOutcome, TraceMemoryController};
use crate::coresight::etm::{AddressComparator, ConfigSelect, EtmV4};
use crate::coresight::funnel::TraceFunnel;
use crate::coresight::stm::Stm;
use crate::coresight::tpiu::Tpiu;
use crate::coresight::{CoreSight, CoreSightError, DeviceClass, DeviceId, DeviceKind};
use crate::snapshot::{self, SnapshotError};
use crate::uart::UartWriter;

/// Instruction address range traced unless the whole program is traced.
pub const DEFAULT_TRACE_START: u64 = 0x0001_5A1C;
pub const DEFAULT_TRACE_END: u64 = 0x0001_5B2C;

/// The ETM of CPU n traces with ID 0x10 + n.
const ETM_TRACE_ID_BASE: u8 = 0x10;
const STM_TRACE_ID: u8 = 0x20;

/// Trace all instructions, start/stop logic started.
const VICTLR_TRACE_ALL: u32 = 0x201;
/// Synchronisation every 4096 bytes.
const SYNCPR_4K: u32 = 0xC;

const WORDS_PER_LINE: usize = 8;
const BANNER: &str = "*******************************************************";

#[derive(Debug, thiserror::Error)]
pub enum DemoError {
    #[error("demo aborted by the user")]
    Quit,
    #[error(transparent)]
    CoreSight(#[from] CoreSightError),
    #[error("CPU #{0} has no trace ID")]
    NoTraceId(usize),
    #[error("ETM at {0:#010x} has fewer than two address comparators")]
    NoAddressRange(u64),
    #[error("failed to write the trace snapshot")]
    Snapshot(#[from] SnapshotError),
    #[error("console I/O failed")]
    Io(#[from] io::Error),
}

/// Settings of a demo session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DemoOptions {
    /// CPU whose instruction trace is captured.
    pub cpu: usize,
    /// Add the STM as a second trace source.
    pub stm: bool,
    /// Keep the ETM from tracing instructions, leaving only STM trace.
    pub stm_only: bool,
    /// Trace the whole program instead of the address range.
    pub full: bool,
    pub stop_on_flush: bool,
    /// Words captured by the main ETF after a trigger. Zero leaves the counter untouched.
    pub post_trigger_words: u32,
    pub timestamps: bool,
    pub cycle_accurate: bool,
    pub return_stack: bool,
    pub trace_start: u64,
    pub trace_end: u64,
    pub tpiu_pattern_test: bool,
    /// Send the trace as raw bytes instead of hex words.
    pub raw: bool,
    pub verbose: bool,
    /// Directory receiving a snapshot of the session for offline decoding.
    pub snapshot: Option<PathBuf>,
}

impl Default for DemoOptions {
    fn default() -> Self {
        Self {
            cpu: 0,
            stm: false,
            stm_only: false,
            full: false,
            stop_on_flush: true,
            post_trigger_words: 0,
            timestamps: false,
            cycle_accurate: false,
            return_stack: false,
            trace_start: DEFAULT_TRACE_START,
            trace_end: DEFAULT_TRACE_END,
            tpiu_pattern_test: false,
            raw: false,
            verbose: true,
            snapshot: None,
        }
    }
}

/// Keypress gating of the demos. Prompts go to `output`, answers are read from `input`.
pub struct Console<R, W> {
    input: R,
    output: W,
    pause: bool,
}

const DEMO_EXIT: &str = "CSDEMO: exiting demo.\n";
const APP_EXIT: &str = "AppToTrace: exiting demo.\n";

impl Console<io::StdinLock<'static>, io::Stderr> {
    pub fn stdio(pause: bool) -> Self {
        Self::new(io::stdin().lock(), io::stderr(), pause)
    }
}

impl<R: BufRead, W: Write> Console<R, W> {
    /// With `pause` set, the demo also stops after each significant step.
    pub fn new(input: R, output: W, pause: bool) -> Self {
        Self {
            input,
            output,
            pause,
        }
    }

    pub fn pause_demo(&mut self) -> Result<(), DemoError> {
        if !self.pause {
            return Ok(());
        }
        self.prompt("[press RETURN to continue or q/Q to quit]\r", DEMO_EXIT)
    }

    pub fn await_user_stop(&mut self) -> Result<(), DemoError> {
        self.prompt("[press RETURN to stop tracing or q/Q to quit]\r", DEMO_EXIT)
    }

    pub fn fetch_trace_option(&mut self) -> Result<(), DemoError> {
        self.prompt("[press RETURN to fetch trace data or q/Q to quit]\r", DEMO_EXIT)
    }

    /// Gate for the traced application itself.
    pub fn app_pause(&mut self) -> Result<(), DemoError> {
        self.prompt("[AppToTrace: press RETURN to continue or q/Q to quit]\r\n", APP_EXIT)
    }

    /// Show `text` and wait for an answer. On q/Q, `exit` is shown and [`DemoError::Quit`]
    /// returned.
    fn prompt(&mut self, text: &str, exit: &str) -> Result<(), DemoError> {
        io::stdout().flush()?;
        self.output.write_all(text.as_bytes())?;
        self.output.flush()?;

        // End of input counts as RETURN.
        let mut answer = String::new();
        self.input.read_line(&mut answer)?;
        match answer.as_bytes().first() {
            Some(b'q' | b'Q') => {
                self.output.write_all(exit.as_bytes())?;
                self.output.flush()?;
                Err(DemoError::Quit)
            }
            _ => Ok(()),
        }
    }
}

/// A demo session on a registered board.
pub struct Demo<M> {
    cs: CoreSight<M>,
    board: &'static Board,
    devices: Devices,
    options: DemoOptions,
}

impl<M: MemoryAccess> Demo<M> {
    pub fn new(
        cs: CoreSight<M>,
        board: &'static Board,
        devices: Devices,
        options: DemoOptions,
    ) -> Self {
        Self {
            cs,
            board,
            devices,
            options,
        }
    }

    pub fn coresight(&self) -> &CoreSight<M> {
        &self.cs
    }

    /// Run the whole session, sending the captured trace to `uart`.
    ///
    /// A quit at any prompt returns [`DemoError::Quit`]. Only a quit in place of fetching the
    /// trace shuts the session down first.
    pub fn run<R: BufRead, W: Write>(
        &mut self,
        console: &mut Console<R, W>,
        uart: impl Write,
    ) -> Result<(), DemoError> {
        console.pause_demo()?;

        if self.options.tpiu_pattern_test {
            println!("*****************************");
            println!("CSDEMO: Run TPIU pattern test");
            println!("*****************************");
            let patterns = Tpiu::new(&mut self.cs, self.devices.tpiu)?.pattern_test()?;
            log::info!("TPIU ran test patterns {:#x}", patterns);
            self.cs.checkpoint()?;
            self.disable_tpiu()?;
        }

        self.manual_path_enable()?;
        self.configure_trace()?;

        if let Some(dir) = self.options.snapshot.clone() {
            let range = (!self.options.full).then_some((self.options.trace_start, self.options.trace_end));
            snapshot::write_config(&dir, &mut self.cs, self.board, &self.devices, self.options.cpu, range)?;
            println!("CSDEMO: Snapshot written to {}", dir.display());
        }

        console.await_user_stop()?;

        // Stopping the formatter keeps the trace of the disable sequence out of the buffer.
        if self.options.stop_on_flush {
            self.flush_and_wait_stop()?;
        }
        self.disable_trace()?;
        console.pause_demo()?;

        if let Err(e) = console.fetch_trace_option() {
            if matches!(e, DemoError::Quit) {
                self.shutdown()?;
            }
            return Err(e);
        }
        let trace = self.fetch_trace(uart)?;
        if let Some(dir) = &self.options.snapshot {
            snapshot::write_buffer(dir, &trace)?;
        }

        self.shutdown()
    }

    /// The ETM of the traced CPU.
    pub fn etm(&self) -> Result<DeviceId, DemoError> {
        let cpu = self.options.cpu;
        self.cs
            .registry()
            .cpu_device(cpu, DeviceClass::SOURCE)
            .map_err(|e| {
                eprintln!("** Failed to get trace source for CPU #{}", cpu);
                e.into()
            })
    }

    /// Trace ID of the ETM of the traced CPU.
    pub fn etm_trace_id(&self) -> Result<u8, DemoError> {
        let cpu = self.options.cpu;
        u8::try_from(cpu)
            .ok()
            .and_then(|cpu| ETM_TRACE_ID_BASE.checked_add(cpu))
            .ok_or(DemoError::NoTraceId(cpu))
    }

    /// Enable every funnel input between the ETM of the traced CPU and the main ETF.
    pub fn manual_path_enable(&mut self) -> Result<(), DemoError> {
        let etm = self.etm()?;
        let path = self
            .cs
            .registry()
            .trace_path(etm, self.devices.etf_main)?;

        for link in path {
            let registry = self.cs.registry();
            if registry.kind(link.to) != DeviceKind::Funnel {
                continue;
            }
            println!(
                "CSDEMO: Enable Path: {} {:#010x} -> Port{} @ funnel {:#010x}",
                registry.kind(link.from),
                registry.base(link.from),
                link.to_port,
                registry.base(link.to)
            );
            TraceFunnel::new(&mut self.cs, link.to)?.enable_port(link.to_port)?;
        }
        Ok(())
    }

    pub fn configure_trace(&mut self) -> Result<(), DemoError> {
        println!("{}", BANNER);
        println!("CSDEMO: Configuring trace...");
        println!("{}", BANNER);

        // No back-pressure from the TPIU, and no capture while programming.
        self.disable_tpiu()?;
        let sinks = [self.devices.etr, self.devices.etf_main, self.devices.etf_a53];
        for sink in sinks.into_iter().chain(self.devices.itm_etb) {
            TraceMemoryController::new(&mut self.cs, sink)?.disable()?;
        }

        let cpu = self.options.cpu;
        println!("CSDEMO: Configuring trace source id for CPU #{} ETM/PTM...", cpu);
        let etm = self.etm()?;
        let trace_id = self.etm_trace_id()?;
        EtmV4::new(&mut self.cs, etm)?.set_trace_id(trace_id)?;
        self.init_etm(etm)?;
        self.config_etmv4(etm)?;

        if self.options.stm || self.options.stm_only {
            println!("CSDEMO: Adding STM as trace source...");
            let mut stm = Stm::new(&mut self.cs, self.devices.stm)?;
            stm.set_trace_id(STM_TRACE_ID)?;
            stm.enable()?;
        }

        {
            let mut etm = EtmV4::new(&mut self.cs, etm)?;
            if self.options.timestamps {
                etm.enable_timestamps(true)?;
            }
            if self.options.cycle_accurate {
                etm.enable_cycle_accurate(true)?;
            }
        }
        self.cs.checkpoint()?;

        println!("CSDEMO: Enabling ETF-Main as trace buffer...");
        let mut etf_main = TraceMemoryController::new(&mut self.cs, self.devices.etf_main)?;
        etf_main.enable_sink()?;
        if self.options.post_trigger_words > 0 {
            etf_main.set_trigger_counter(self.options.post_trigger_words)?;
        }
        println!("CSDEMO: Enable ETF-A53 in HW FIFO mode...");
        TraceMemoryController::new(&mut self.cs, self.devices.etf_a53)?.enable_fifo()?;

        if self.options.stop_on_flush {
            for etf in [self.devices.etf_main, self.devices.etf_a53] {
                let base = self.cs.registry().base(etf);
                match TraceMemoryController::new(&mut self.cs, etf)?.stop_on_flush(true) {
                    Ok(ffcr) => println!("CSDEMO: setting stop on flush, ETB FFCR = 0x{:08X}", ffcr),
                    Err(e) => println!(
                        "CSDEMO: Failed to set stop on flush for ETB at {:#010x}: {}",
                        base, e
                    ),
                }
            }
        }

        EtmV4::new(&mut self.cs, etm)?.enable()?;
        self.cs.checkpoint()?;

        println!("{}", BANNER);
        println!("CSDEMO: Configured and enabled trace. [ETFs, ETMs, STM]");
        println!("{}", BANNER);
        Ok(())
    }

    /// Put the ETM into a known state that traces everything.
    fn init_etm(&mut self, device: DeviceId) -> Result<(), DemoError> {
        println!("CSDEMO: Initialising ETM/PTM");
        let mut etm = EtmV4::new(&mut self.cs, device)?;
        if let Err(e) = etm.clean() {
            println!("CSDEMO: Failed to set ETM/PTM into clean state");
            return Err(e.into());
        }

        let mut config = etm.config_init()?;
        config.select = ConfigSelect::CONFIG;
        etm.config_get(&mut config)?;
        config.select |= ConfigSelect::TRACE_ENABLE | ConfigSelect::EVENT_SELECT;

        if self.options.stm_only {
            println!("No Viewinst, STM only");
            config.victlr = 0;
        } else {
            println!("Viewinst trace everything");
            config.victlr = VICTLR_TRACE_ALL;
        }
        config.viiectlr = 0;
        config.vissctlr = 0;
        config.eventctl0r = 0;
        config.eventctl1r = 0;
        config.stallctlr = 0;
        config.syncpr = SYNCPR_4K;
        etm.config_put(&config)?;
        Ok(())
    }

    /// Restrict the ETM to the traced address range and enable the optional trace features.
    fn config_etmv4(&mut self, device: DeviceId) -> Result<(), DemoError> {
        let base = self.cs.registry().base(device);
        let mut etm = EtmV4::new(&mut self.cs, device)?;

        let mut config = etm.config_init()?;
        config.select = ConfigSelect::TRACE_ENABLE | ConfigSelect::CONFIG | ConfigSelect::EVENT_SELECT;
        etm.config_get(&mut config)?;

        if config.idr2.vmidsize() > 0 {
            config.configr.set_vmid(true);
        }
        if config.idr2.cidsize() > 0 {
            config.configr.set_cid(true);
        }
        if self.options.return_stack {
            config.configr.set_rs(true);
        }

        if !self.options.full {
            // Instruction address compare in all exception levels, no context matching.
            let [start, end, ..] = config.addr_comps.as_mut_slice() else {
                return Err(DemoError::NoAddressRange(base));
            };
            *start = AddressComparator {
                value: self.options.trace_start,
                access_type: 0,
            };
            *end = AddressComparator {
                value: self.options.trace_end,
                access_type: 0,
            };
            config.addr_comps_mask = 0b11;
            config.select |= ConfigSelect::ADDR_COMP;

            // Include the range of comparator pair 0.
            config.viiectlr = 0x1;
            config.syncpr = 0;
        }

        print!("{}", config);
        etm.config_put(&config)?;
        Ok(())
    }

    fn disable_tpiu(&mut self) -> Result<(), DemoError> {
        if let FlushOutcome::Running { ffsr } = Tpiu::new(&mut self.cs, self.devices.tpiu)?.disable()? {
            log::warn!("TPIU formatter did not stop, FFSR = {:#010x}", ffsr);
        }
        Ok(())
    }

    /// Flush the A53 cluster ETF, then the main ETF, and wait for their formatters to stop.
    /// A formatter that keeps running is reported but does not end the session.
    pub fn flush_and_wait_stop(&mut self) -> Result<(), DemoError> {
        for etf in [self.devices.etf_a53, self.devices.etf_main] {
            println!("CSDEMO: Flushing ETB and waiting for formatter stop");
            match TraceMemoryController::new(&mut self.cs, etf)?.flush_and_wait_stop()? {
                FlushOutcome::Stopped => {
                    if self.options.verbose {
                        println!("CSDEMO: ETB collection stopped");
                    }
                }
                FlushOutcome::Running { ffsr } => {
                    if self.options.verbose {
                        println!("CSDEMO: ETB FFSR=0x{:08X}", ffsr);
                    }
                    println!("CSDEMO: Warning ETB collection not stopped on flush on trigger");
                }
            }
        }
        Ok(())
    }

    pub fn disable_trace(&mut self) -> Result<(), DemoError> {
        println!("CSDEMO: Disable trace...");
        let etm = self.etm()?;
        EtmV4::new(&mut self.cs, etm)?.disable()?;
        if self.options.stm || self.options.stm_only {
            Stm::new(&mut self.cs, self.devices.stm)?.disable()?;
        }
        TraceMemoryController::new(&mut self.cs, self.devices.etf_a53)?.disable()?;
        TraceMemoryController::new(&mut self.cs, self.devices.etf_main)?.disable()?;
        Ok(())
    }

    /// Read the main ETF and send its contents to `uart`. Returns the trace read.
    pub fn fetch_trace(&mut self, uart: impl Write) -> Result<Vec<u8>, DemoError> {
        println!(
            "CSDEMO: Fetching trace from ETB at {:#010x}...",
            self.cs.registry().base(self.devices.etf_main)
        );
        let mut etf_main = TraceMemoryController::new(&mut self.cs, self.devices.etf_main)?;
        if etf_main.triggered()? {
            log::info!("ETF-Main stopped on a trigger");
        }
        let trace = etf_main.drain()?;

        if self.options.raw {
            let mut uart = UartWriter::raw(uart);
            uart.write_all(&trace)?;
            uart.flush()?;
        } else {
            let mut uart = UartWriter::new(uart);
            for line in trace.chunks(4 * WORDS_PER_LINE) {
                let words: Vec<String> = line
                    .chunks_exact(4)
                    .map(|word| format!("{:08X}", u32::from_le_bytes([word[0], word[1], word[2], word[3]])))
                    .collect();
                writeln!(uart, "{}", words.join(" "))?;
            }
            uart.flush()?;
        }

        println!("CSDEMO: {} bytes of trace fetched", trace.len());
        Ok(trace)
    }

    pub fn shutdown(&mut self) -> Result<(), DemoError> {
        println!("CSDEMO: shutdown...");
        self.cs.checkpoint()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::sim::Access;
    use crate::access::SimulatedMemory;
    use crate::board::{self, ZYNQUS_NAME};
    use crate::coresight::model::SYNTHETIC_TRACE;
    use crate::coresight::Registry;
    use pretty_assertions::assert_eq;
    use std::io::Cursor;

    const ETM0: u64 = 0xFEC4_0000;
    const ETF_MAIN: u64 = 0xFE95_0000;

    fn demo(options: DemoOptions) -> Demo<SimulatedMemory> {
        let mut registry = Registry::new();
        let (board, devices) = board::setup_known_board_by_name(ZYNQUS_NAME, &mut registry).unwrap();
        let memory = board::simulator(&registry, &devices);
        Demo::new(CoreSight::new(memory, registry), board, devices, options)
    }

    fn console(answers: &str, pause: bool) -> Console<Cursor<Vec<u8>>, Vec<u8>> {
        Console::new(Cursor::new(answers.as_bytes().to_vec()), Vec::new(), pause)
    }

    fn position(writes: &[(u64, u32)], write: (u64, u32)) -> usize {
        writes
            .iter()
            .position(|w| *w == write)
            .unwrap_or_else(|| panic!("no write of {:#x} to {:#x}", write.1, write.0))
    }

    #[test]
    fn session_sends_captured_trace_as_hex() {
        let mut demo = demo(DemoOptions::default());
        let mut uart = Vec::new();
        demo.run(&mut console("\n\n", false), &mut uart).unwrap();

        let words: Vec<String> = SYNTHETIC_TRACE.iter().map(|w| format!("{:08X}", w)).collect();
        assert_eq!(String::from_utf8(uart).unwrap(), format!("{}\r\n", words.join(" ")));
    }

    #[test]
    fn raw_session_sends_trace_bytes() {
        let mut demo = demo(DemoOptions {
            raw: true,
            ..Default::default()
        });
        let mut uart = Vec::new();
        demo.run(&mut console("", false), &mut uart).unwrap();

        let expected: Vec<u8> = SYNTHETIC_TRACE.iter().flat_map(|w| w.to_le_bytes()).collect();
        assert_eq!(uart, expected);
    }

    #[test]
    fn registers_are_programmed_in_order() {
        let mut demo = demo(DemoOptions::default());
        demo.run(&mut console("", false), Vec::new()).unwrap();
        let writes = demo.coresight().memory().writes();

        let fnl_a53 = position(&writes, (0xFE92_0000, 0x1));
        let fnl_main = position(&writes, (0xFE93_0000, 0x4));
        let trace_id = position(&writes, (ETM0 + 0x040, 0x10));
        let range_start = position(&writes, (ETM0 + 0x400, 0x15A1C));
        let range_end = position(&writes, (ETM0 + 0x408, 0x15B2C));
        let include = position(&writes, (ETM0 + 0x084, 0x1));
        let etm_enable = position(&writes, (ETM0 + 0x004, 0x1));
        let flush = writes
            .iter()
            .position(|(address, value)| *address == ETF_MAIN + 0x304 && value & (1 << 6) != 0)
            .unwrap();
        let last_main_ctl = writes
            .iter()
            .rposition(|(address, _)| *address == ETF_MAIN + 0x020)
            .unwrap();

        assert!(fnl_a53 < trace_id && fnl_main < trace_id);
        assert!(trace_id < range_start && range_start < range_end);
        assert!(include < etm_enable);
        assert!(etm_enable < flush);
        assert!(flush < last_main_ctl);
        assert_eq!(writes[last_main_ctl].1, 0);
        assert!(writes.contains(&(ETM0 + 0x080, VICTLR_TRACE_ALL)));
        assert!(writes.contains(&(ETF_MAIN + 0x028, 0)));
        assert!(writes.contains(&(0xFE94_0028, 0b10)));
    }

    #[test]
    fn flush_covers_both_etfs_in_order() {
        let mut demo = demo(DemoOptions::default());
        demo.run(&mut console("", false), Vec::new()).unwrap();
        let writes = demo.coresight().memory().writes();

        let flushes: Vec<u64> = writes
            .iter()
            .filter(|(address, value)| address & 0xFFF == 0x304 && value & (1 << 6) != 0)
            .map(|(address, _)| address & !0xFFF)
            .collect();
        // The TPIU is flushed while trace is configured.
        assert_eq!(flushes, vec![0xFE98_0000, 0xFE94_0000, ETF_MAIN]);
    }

    #[test]
    fn full_trace_programs_no_address_range() {
        let mut demo = demo(DemoOptions {
            full: true,
            ..Default::default()
        });
        demo.run(&mut console("", false), Vec::new()).unwrap();
        let writes = demo.coresight().memory().writes();

        assert!(!writes.contains(&(ETM0 + 0x400, 0x15A1C)));
        assert!(!writes.contains(&(ETM0 + 0x084, 0x1)));
    }

    #[test]
    fn stm_only_disables_instruction_trace() {
        let mut demo = demo(DemoOptions {
            stm_only: true,
            ..Default::default()
        });
        demo.run(&mut console("", false), Vec::new()).unwrap();
        let state = demo.coresight().memory().state();

        assert_eq!(state.get(ETM0 + 0x080), 0);
        assert_eq!((state.get(0xFE9C_0E80) >> 16) & 0x7F, u32::from(STM_TRACE_ID));
    }

    #[test]
    fn optional_features_reach_the_etm() {
        let mut demo = demo(DemoOptions {
            timestamps: true,
            cycle_accurate: true,
            return_stack: true,
            post_trigger_words: 0x40,
            ..Default::default()
        });
        demo.run(&mut console("", false), Vec::new()).unwrap();
        let state = demo.coresight().memory().state();

        let configr = state.get(ETM0 + 0x010);
        assert_eq!(configr & (1 << 12 | 1 << 11 | 1 << 4), 1 << 12 | 1 << 11 | 1 << 4);
        // VMID and context ID are implemented by the A53 ETM.
        assert_eq!(configr & (1 << 7 | 1 << 6), 1 << 7 | 1 << 6);
        assert_eq!(state.get(ETF_MAIN + 0x01C), 0x40);
    }

    #[test]
    fn quit_aborts_at_every_prompt() {
        for answered in 0..4 {
            let mut demo = demo(DemoOptions::default());
            let answers = format!("{}q\n", "\n".repeat(answered));
            let mut uart = Vec::new();

            let result = demo.run(&mut console(&answers, true), &mut uart);
            assert!(matches!(result, Err(DemoError::Quit)), "prompt {}", answered);
            assert!(uart.is_empty());
        }
    }

    #[test]
    fn prompts_are_written_to_the_console() {
        let mut demo = demo(DemoOptions::default());
        let mut console = console("\nQ\n", false);
        assert!(matches!(demo.run(&mut console, Vec::new()), Err(DemoError::Quit)));

        let prompts = String::from_utf8(console.output).unwrap();
        assert_eq!(
            prompts,
            "[press RETURN to stop tracing or q/Q to quit]\r\
             [press RETURN to fetch trace data or q/Q to quit]\r\
             CSDEMO: exiting demo.\n"
        );
    }

    fn checkpoints(demo: &Demo<SimulatedMemory>) -> usize {
        demo.coresight()
            .memory()
            .accesses()
            .iter()
            .filter(|access| matches!(access, Access::Flush))
            .count()
    }

    #[test]
    fn only_quit_at_fetch_shuts_down() {
        let mut stopped = demo(DemoOptions::default());
        let mut console_stopped = console("q\n", false);
        assert!(matches!(stopped.run(&mut console_stopped, Vec::new()), Err(DemoError::Quit)));

        let mut fetched = demo(DemoOptions::default());
        let mut console_fetched = console("\nq\n", false);
        assert!(matches!(fetched.run(&mut console_fetched, Vec::new()), Err(DemoError::Quit)));

        // Quitting instead of stopping leaves trace running.
        let configured = checkpoints(&stopped);
        assert_eq!(checkpoints(&fetched), configured + 1);
        assert_eq!(fetched.coresight().memory().accesses().last(), Some(&Access::Flush));
        assert!(String::from_utf8(console_stopped.output)
            .unwrap()
            .ends_with("CSDEMO: exiting demo.\n"));
    }

    #[test]
    fn trace_id_overflow_names_the_cpu() {
        let overflowing = demo(DemoOptions {
            cpu: 0xF0,
            ..Default::default()
        });
        assert!(matches!(overflowing.etm_trace_id(), Err(DemoError::NoTraceId(0xF0))));
        assert_eq!(
            demo(DemoOptions {
                cpu: 3,
                ..Default::default()
            })
            .etm_trace_id()
            .unwrap(),
            0x13
        );
    }

    #[test]
    fn app_quit_is_announced() {
        let mut console = console("q\n", false);
        assert!(matches!(console.app_pause(), Err(DemoError::Quit)));
        assert_eq!(
            String::from_utf8(console.output).unwrap(),
            "[AppToTrace: press RETURN to continue or q/Q to quit]\r\nAppToTrace: exiting demo.\n"
        );
    }

    #[test]
    fn r5_cores_have_no_trace_path() {
        let mut demo = demo(DemoOptions {
            cpu: 4,
            ..Default::default()
        });
        assert!(matches!(
            demo.run(&mut console("", false), Vec::new()),
            Err(DemoError::CoreSight(CoreSightError::NoTracePath { .. }))
        ));
    }

    #[test]
    fn unknown_cpu_is_reported() {
        let mut demo = demo(DemoOptions {
            cpu: 9,
            ..Default::default()
        });
        assert!(matches!(
            demo.manual_path_enable(),
            Err(DemoError::CoreSight(CoreSightError::NoCpuDevice { cpu: 9, .. }))
        ));
    }

    #[test]
    fn snapshot_is_written_when_requested() {
        let dir = tempfile::tempdir().unwrap();
        let mut demo = demo(DemoOptions {
            snapshot: Some(dir.path().to_path_buf()),
            ..Default::default()
        });
        demo.run(&mut console("", false), Vec::new()).unwrap();

        assert!(dir.path().join("snapshot.ini").exists());
        assert_eq!(
            std::fs::read(dir.path().join(snapshot::BUFFER_FILE)).unwrap().len(),
            SYNTHETIC_TRACE.len() * 4
        );
    }
}
