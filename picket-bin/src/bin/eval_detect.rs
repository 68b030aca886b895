use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use log::{info, warn};
use picket_core::util::{PAGE_MASK, PAGE_SIZE};
use picket_core::{
    CacheDescriptor, Detector, DetectorConfig, FaultVerdict, FrameSymbolizer, FreeOutcome,
    OobSide, Report, StackCapturer, Violation,
};
use picket_bin::NamedProgress;
use picket_mmap::MmapMapper;
use picket_sim::SimMapper;
use serde::Serialize;

/// CLI arguments for the `eval_detect` binary.
///
/// This struct defines the command line arguments that can be passed to the
/// `eval_detect` binary for provoking memory-safety violations against a
/// live detector and measuring what it reports.
#[derive(Debug, Parser, Serialize, Clone)]
struct CliArgs {
    /// Number of guarded slots in the pool.
    #[clap(long = "slots", default_value = "16")]
    slots: usize,
    /// Mean number of allocation requests between diversions.
    #[clap(long = "interval", default_value = "50")]
    interval: u32,
    /// Seed for placement and sampling randomness (random when absent).
    #[clap(long = "seed")]
    seed: Option<u64>,
    /// The violation scenario to run.
    #[clap(long = "scenario", value_enum, default_value = "all")]
    scenario: Scenario,
    /// The page mapper backing the pool.
    #[clap(long = "mapper", value_enum, default_value = "mmap")]
    mapper: MapperKind,
    /// Allocation requests for the soak scenario (default: 200 intervals).
    #[clap(long = "soak-rounds")]
    soak_rounds: Option<u64>,
    /// Output file for results (JSON format).
    #[clap(long = "output")]
    output: Option<String>,
    /// Log every object the pool still tracks after the run.
    #[clap(long = "dump")]
    dump: bool,
    /// Verbose output - print probe addresses and per-step details.
    #[clap(long = "verbose", short = 'v')]
    verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "kebab-case")]
enum Scenario {
    OobRight,
    OobLeft,
    UseAfterFree,
    DoubleFree,
    Corruption,
    Exhaustion,
    Soak,
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "kebab-case")]
enum MapperKind {
    /// Anonymous mapping with real `mprotect` traps.
    Mmap,
    /// Simulated byte-array pool; nothing traps.
    Sim,
}

#[derive(Debug, Serialize)]
struct ScenarioResult {
    scenario: String,
    detected: bool,
    duration_ms: u64,
    violation: Option<String>,
    fault_address: Option<String>,
    report: Option<String>,
}

#[derive(Debug, Serialize)]
struct EvaluationResults {
    args: CliArgs,
    date: String,
    total_scenarios: u32,
    detected_scenarios: u32,
    results: Vec<ScenarioResult>,
}

impl EvaluationResults {
    fn new(args: CliArgs) -> Self {
        Self {
            args,
            date: chrono::Local::now().to_rfc3339(),
            total_scenarios: 0,
            detected_scenarios: 0,
            results: Vec::new(),
        }
    }

    fn add(&mut self, result: ScenarioResult) {
        self.total_scenarios += 1;
        if result.detected {
            self.detected_scenarios += 1;
        }
        self.results.push(result);
    }

    fn save_to_file(&self, filename: &str) -> Result<()> {
        let file = File::create(filename)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, self)?;
        writer.flush()?;
        info!("Results saved to {}", filename);
        Ok(())
    }
}

/// Stack frames the scenarios pretend to run in. The shim frames contain
/// the default skip markers, so rendered reports lead with the real caller.
const FRAME_ALLOC: usize = 0x1000;
const FRAME_FREE: usize = 0x2000;
const FRAME_ACCESS: usize = 0x3000;
const FRAME_MAIN: usize = 0x4000;
const FRAME_SHIM_FAULT: usize = 0x5000;
const FRAME_SHIM_FREE: usize = 0x6000;

#[derive(Clone, Default)]
struct SharedStacks(Arc<Mutex<Vec<usize>>>);

impl SharedStacks {
    fn set(&self, frames: &[usize]) {
        if let Ok(mut current) = self.0.lock() {
            current.clear();
            current.extend_from_slice(frames);
        }
    }
}

impl StackCapturer for SharedStacks {
    fn capture(&self, frames: &mut [usize]) -> usize {
        let Ok(current) = self.0.lock() else {
            return 0;
        };
        let depth = current.len().min(frames.len());
        frames[..depth].copy_from_slice(&current[..depth]);
        depth
    }
}

#[derive(Clone, Default)]
struct SharedSymbols(Arc<Mutex<HashMap<usize, String>>>);

impl SharedSymbols {
    fn define(&self, frame: usize, name: &str) {
        if let Ok(mut table) = self.0.lock() {
            table.insert(frame, name.to_string());
        }
    }
}

impl FrameSymbolizer for SharedSymbols {
    fn symbolize(&self, frame: usize) -> Option<String> {
        self.0
            .lock()
            .ok()
            .and_then(|table| table.get(&frame).cloned())
    }
}

static DETECTOR: OnceLock<Detector> = OnceLock::new();
static LAST_VERDICT: AtomicUsize = AtomicUsize::new(VERDICT_NONE);

const VERDICT_NONE: usize = 0;
const VERDICT_UNHANDLED: usize = 1;
const VERDICT_SILENCED: usize = 2;
const VERDICT_REPORTED: usize = 3;

/// SIGSEGV entry point. The detector takes its internal lock and logs from
/// here, which is tolerable in this harness because the faulting thread
/// never holds either when it touches guarded memory.
extern "C" fn on_segv(
    _signal: libc::c_int,
    info: *mut libc::siginfo_t,
    _context: *mut libc::c_void,
) {
    let addr = unsafe { (*info).si_addr() } as usize;
    let Some(detector) = DETECTOR.get() else {
        restore_default_segv();
        return;
    };
    let code = match detector.handle_fault(addr) {
        FaultVerdict::Unhandled => {
            // not ours: let the re-executed access crash normally
            restore_default_segv();
            VERDICT_UNHANDLED
        }
        FaultVerdict::Silenced => VERDICT_SILENCED,
        FaultVerdict::Reported(_) => {
            // reported pages stay protected; open this one so the
            // interrupted access can complete (the scenario re-guards it)
            let page = (addr & !PAGE_MASK) as *mut libc::c_void;
            unsafe {
                libc::mprotect(page, PAGE_SIZE, libc::PROT_READ | libc::PROT_WRITE);
            }
            VERDICT_REPORTED
        }
    };
    LAST_VERDICT.store(code, Ordering::SeqCst);
}

fn take_verdict() -> usize {
    LAST_VERDICT.swap(VERDICT_NONE, Ordering::SeqCst)
}

fn install_segv_handler() -> Result<()> {
    let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
    action.sa_sigaction = on_segv as usize;
    action.sa_flags = libc::SA_SIGINFO;
    let rc = unsafe { libc::sigaction(libc::SIGSEGV, &action, std::ptr::null_mut()) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

fn restore_default_segv() {
    unsafe { libc::signal(libc::SIGSEGV, libc::SIG_DFL) };
}

/// Pool byte access for the scenarios: raw dereferences on real mappings
/// (these are what trap), mapper calls on the simulated pool.
enum PoolMemory {
    Direct,
    Sim(SimMapper),
}

impl PoolMemory {
    fn peek(&self, addr: usize) -> u8 {
        match self {
            PoolMemory::Direct => unsafe { std::ptr::read_volatile(addr as *const u8) },
            PoolMemory::Sim(mapper) => mapper.read(addr),
        }
    }

    fn poke(&self, addr: usize, value: u8) {
        match self {
            PoolMemory::Direct => unsafe { std::ptr::write_volatile(addr as *mut u8, value) },
            PoolMemory::Sim(mapper) => mapper.write(addr, value),
        }
    }
}

/// Puts the guard back after the handler opened a reported page.
fn reguard(page: usize) {
    let rc = unsafe { libc::mprotect(page as *mut libc::c_void, PAGE_SIZE, libc::PROT_NONE) };
    if rc != 0 {
        warn!(
            "failed to re-guard page 0x{page:x}: {}",
            std::io::Error::last_os_error()
        );
    }
}

struct Harness {
    detector: &'static Detector,
    memory: PoolMemory,
    stacks: SharedStacks,
    symbols: SharedSymbols,
    cache: Arc<CacheDescriptor>,
    soak_rounds: Option<u64>,
    verbose: bool,
}

struct ScenarioOutcome {
    detected: bool,
    report: Option<Report>,
}

fn scenario_oob(harness: &Harness, side: OobSide) -> Result<ScenarioOutcome> {
    let detector = harness.detector;
    harness.stacks.set(&[FRAME_ALLOC, FRAME_MAIN]);
    let addr = detector.place(64, &harness.cache).context("no free slot")?;
    let page = addr & !PAGE_MASK;
    let probe = match side {
        OobSide::Right => page + PAGE_SIZE,
        OobSide::Left => page - 1,
    };
    if harness.verbose {
        info!("object at 0x{addr:x}, touching guard byte 0x{probe:x}");
    }

    harness.stacks.set(&[FRAME_SHIM_FAULT, FRAME_ACCESS, FRAME_MAIN]);
    let _ = harness.memory.peek(probe);
    reguard(probe & !PAGE_MASK);

    let verdict = take_verdict();
    let report = detector.take_last_report();
    let detected = verdict == VERDICT_REPORTED
        && report.as_ref().is_some_and(|report| {
            report.kind == Violation::OutOfBounds(side) && report.fault_address == probe
        });

    detector.rearm();
    harness.stacks.set(&[FRAME_FREE, FRAME_MAIN]);
    detector.remove(addr);
    Ok(ScenarioOutcome { detected, report })
}

fn scenario_use_after_free(harness: &Harness) -> Result<ScenarioOutcome> {
    let detector = harness.detector;
    harness.stacks.set(&[FRAME_ALLOC, FRAME_MAIN]);
    let addr = detector.place(48, &harness.cache).context("no free slot")?;
    harness.stacks.set(&[FRAME_FREE, FRAME_MAIN]);
    detector.remove(addr);
    if harness.verbose {
        info!("freed object at 0x{addr:x}, reading it back");
    }

    harness.stacks.set(&[FRAME_SHIM_FAULT, FRAME_ACCESS, FRAME_MAIN]);
    let _ = harness.memory.peek(addr);
    reguard(addr & !PAGE_MASK);

    let verdict = take_verdict();
    let report = detector.take_last_report();
    let detected = verdict == VERDICT_REPORTED
        && report.as_ref().is_some_and(|report| {
            report.kind == Violation::UseAfterFree && report.fault_address == addr
        });

    detector.rearm();
    Ok(ScenarioOutcome { detected, report })
}

fn scenario_double_free(harness: &Harness) -> Result<ScenarioOutcome> {
    let detector = harness.detector;
    harness.stacks.set(&[FRAME_ALLOC, FRAME_MAIN]);
    let addr = detector.place(32, &harness.cache).context("no free slot")?;
    harness.stacks.set(&[FRAME_FREE, FRAME_MAIN]);
    detector.remove(addr);

    harness.stacks.set(&[FRAME_SHIM_FREE, FRAME_FREE, FRAME_MAIN]);
    let outcome = detector.remove(addr);
    let report = detector.take_last_report();
    let detected = outcome == Some(FreeOutcome::DoubleFree)
        && report
            .as_ref()
            .is_some_and(|report| report.kind == Violation::DoubleFree);

    detector.rearm();
    Ok(ScenarioOutcome { detected, report })
}

fn scenario_corruption(harness: &Harness) -> Result<ScenarioOutcome> {
    let detector = harness.detector;
    harness.stacks.set(&[FRAME_ALLOC, FRAME_MAIN]);
    let addr = detector.place(64, &harness.cache).context("no free slot")?;
    let page = addr & !PAGE_MASK;
    // stay inside the open object page: past the end when the object leads
    // the page, before the start when it trails it
    let target = if addr == page { addr + 64 } else { addr - 1 };
    let current = harness.memory.peek(target);
    harness.memory.poke(target, current ^ 0xFF);
    if harness.verbose {
        info!("object at 0x{addr:x}, smashed redzone byte 0x{target:x}");
    }

    harness.stacks.set(&[FRAME_SHIM_FREE, FRAME_FREE, FRAME_MAIN]);
    let outcome = detector.remove(addr);
    let report = detector.take_last_report();
    let detected = outcome == Some(FreeOutcome::Corruption)
        && report.as_ref().is_some_and(|report| {
            report.kind == Violation::Corruption && report.fault_address == target
        });

    detector.rearm();
    Ok(ScenarioOutcome { detected, report })
}

fn scenario_exhaustion(harness: &Harness) -> Result<ScenarioOutcome> {
    let detector = harness.detector;
    let slots = detector.config().slot_count;
    harness.stacks.set(&[FRAME_ALLOC, FRAME_MAIN]);

    let mut placed = Vec::with_capacity(slots);
    for _ in 0..slots {
        match detector.place(16, &harness.cache) {
            Some(addr) => placed.push(addr),
            None => break,
        }
    }
    let overflow_denied = detector.place(16, &harness.cache).is_none();
    let report = detector.take_last_report();
    let detected = placed.len() == slots && overflow_denied && report.is_none();
    info!(
        "filled {} of {} slots, overflow request denied: {}",
        placed.len(),
        slots,
        overflow_denied
    );

    harness.stacks.set(&[FRAME_FREE, FRAME_MAIN]);
    for addr in placed {
        detector.remove(addr);
    }
    Ok(ScenarioOutcome { detected, report })
}

fn scenario_soak(harness: &Harness, progress: &MultiProgress) -> Result<ScenarioOutcome> {
    let detector = harness.detector;
    let interval = u64::from(detector.config().sample_interval);
    let rounds = harness.soak_rounds.unwrap_or(interval * 200);
    let slots = detector.config().slot_count;

    let p = progress.add(ProgressBar::new(rounds));
    p.set_style(ProgressStyle::named_bar("Soak round"));
    p.enable_steady_tick(Duration::from_secs(1));

    let mut live = Vec::new();
    let mut diverted = 0u64;
    for round in 1..=rounds {
        p.set_position(round);
        harness.stacks.set(&[FRAME_ALLOC, FRAME_MAIN]);
        if let Some(addr) = detector.try_allocate(24, &harness.cache) {
            diverted += 1;
            live.push(addr);
        }
        if live.len() >= slots {
            harness.stacks.set(&[FRAME_FREE, FRAME_MAIN]);
            for addr in live.drain(..) {
                detector.remove(addr);
            }
        }
    }
    harness.stacks.set(&[FRAME_FREE, FRAME_MAIN]);
    for addr in live.drain(..) {
        detector.remove(addr);
    }
    p.finish_and_clear();

    let report = detector.take_last_report();
    info!(
        "soak: {} of {} requests diverted (expected about {})",
        diverted,
        rounds,
        rounds / interval
    );
    Ok(ScenarioOutcome {
        detected: diverted > 0 && report.is_none(),
        report,
    })
}

fn run_scenario(
    scenario: Scenario,
    harness: &Harness,
    progress: &MultiProgress,
) -> Result<ScenarioResult> {
    let start = Instant::now();
    let outcome = match scenario {
        Scenario::OobRight => scenario_oob(harness, OobSide::Right)?,
        Scenario::OobLeft => scenario_oob(harness, OobSide::Left)?,
        Scenario::UseAfterFree => scenario_use_after_free(harness)?,
        Scenario::DoubleFree => scenario_double_free(harness)?,
        Scenario::Corruption => scenario_corruption(harness)?,
        Scenario::Exhaustion => scenario_exhaustion(harness)?,
        Scenario::Soak => scenario_soak(harness, progress)?,
        Scenario::All => anyhow::bail!("the all scenario expands before dispatch"),
    };

    let markers = &harness.detector.config().skip_markers;
    let report_text = outcome.report.as_ref().map(|report| {
        let mut text = String::new();
        report.render(&harness.symbols, markers, Some(&mut text));
        text
    });
    Ok(ScenarioResult {
        scenario: format!("{scenario:?}"),
        detected: outcome.detected,
        duration_ms: start.elapsed().as_millis() as u64,
        violation: outcome
            .report
            .as_ref()
            .map(|report| format!("{:?}", report.kind)),
        fault_address: outcome
            .report
            .as_ref()
            .map(|report| format!("0x{:x}", report.fault_address)),
        report: report_text,
    })
}

fn needs_real_traps(scenario: Scenario) -> bool {
    matches!(
        scenario,
        Scenario::OobRight | Scenario::OobLeft | Scenario::UseAfterFree
    )
}

fn main() -> Result<()> {
    let progress = picket_bin::init_logging_with_progress()?;
    let args = CliArgs::parse();
    info!("CLI args: {:?}", args);

    let stacks = SharedStacks::default();
    let symbols = SharedSymbols::default();
    symbols.define(FRAME_ALLOC, "eval_alloc_object");
    symbols.define(FRAME_FREE, "eval_free_object");
    symbols.define(FRAME_ACCESS, "eval_touch_object");
    symbols.define(FRAME_MAIN, "eval_main");
    symbols.define(FRAME_SHIM_FAULT, "picket_handle_fault_shim");
    symbols.define(FRAME_SHIM_FREE, "picket_try_free_shim");

    let config = DetectorConfig {
        slot_count: args.slots,
        sample_interval: args.interval,
        seed: args.seed.unwrap_or_else(rand::random),
        ..DetectorConfig::default()
    };
    let builder = Detector::builder()
        .config(config)
        .stack_capturer(stacks.clone())
        .symbolizer(symbols.clone());
    let (detector, memory) = match args.mapper {
        MapperKind::Mmap => (
            builder.mapper(MmapMapper::new()?).build()?,
            PoolMemory::Direct,
        ),
        MapperKind::Sim => {
            let mapper = SimMapper::new();
            let handle = mapper.clone();
            (builder.mapper(mapper).build()?, PoolMemory::Sim(handle))
        }
    };
    let detector: &'static Detector = DETECTOR.get_or_init(move || detector);

    if args.mapper == MapperKind::Mmap {
        install_segv_handler()?;
    }

    let harness = Harness {
        detector,
        memory,
        stacks,
        symbols,
        cache: Arc::new(CacheDescriptor::new("eval-objects", 8)),
        soak_rounds: args.soak_rounds,
        verbose: args.verbose,
    };

    let scenarios = match args.scenario {
        Scenario::All => vec![
            Scenario::OobRight,
            Scenario::OobLeft,
            Scenario::UseAfterFree,
            Scenario::DoubleFree,
            Scenario::Corruption,
            Scenario::Exhaustion,
            Scenario::Soak,
        ],
        one => vec![one],
    };

    let start_time = Instant::now();
    let mut results = EvaluationResults::new(args.clone());
    for scenario in scenarios {
        if args.mapper == MapperKind::Sim && needs_real_traps(scenario) {
            warn!(
                "scenario {scenario:?} needs real traps, skipping under the simulated mapper"
            );
            continue;
        }
        info!("Running scenario {scenario:?}");
        let result = run_scenario(scenario, &harness, &progress)?;
        if result.detected {
            info!("Scenario {scenario:?} detected in {}ms", result.duration_ms);
        } else {
            warn!("Scenario {scenario:?} NOT detected");
        }
        results.add(result);
    }

    if args.dump {
        detector.log_objects(log::Level::Info);
    }

    if let Some(output) = &args.output {
        results.save_to_file(output)?;
    }

    info!("=== DETECTION SUMMARY ===");
    info!("Scenarios run: {}", results.total_scenarios);
    info!(
        "Detected: {}/{}",
        results.detected_scenarios, results.total_scenarios
    );
    info!(
        "Total evaluation time: {:.2}s",
        start_time.elapsed().as_secs_f64()
    );

    Ok(())
}
