//! The detector context: pool, sampling gate, and the host-facing API.
//!
//! All mutable state sits behind one mutex. The fast paths the host calls on
//! every allocation ([`Detector::should_divert`]) and on every fault
//! ([`Detector::handle_fault`] for out-of-range addresses) never take it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use log::{error, info, warn};
use thiserror::Error;

use crate::cache::CacheDescriptor;
use crate::config::DetectorConfig;
use crate::fault::{Classification, Violation, classify};
use crate::mapper::{MapError, PageMapper};
use crate::pool::{FreeInspection, FreeOutcome, PoolLayout, PoolState};
use crate::report::{DUMP_SEPARATOR, ObjectSnapshot, Report, emit};
use crate::sampler::SampleGate;
use crate::slot::{SlotState, StackTrace};
use crate::stack::{FrameSymbolizer, NoStacks, NoSymbols, StackCapturer};
use crate::util::{CORRUPTION_DUMP_BYTES, PAGE_MASK, PAGE_SHIFT, PAGE_SIZE};

/// Errors from [`DetectorBuilder::build`].
#[derive(Debug, Error)]
pub enum BuildError {
    /// No page mapper was supplied.
    #[error("no page mapper was supplied")]
    MissingMapper,
    /// A configuration field is out of range.
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    /// The mapper failed while setting up the pool.
    #[error(transparent)]
    Map(#[from] MapError),
}

/// Why the detector stopped detecting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisarmReason {
    /// The host asked for it.
    Requested,
    /// A violation was reported; one report per arming.
    Violation,
    /// The detector caught itself misbehaving and shut down.
    SelfProtect(String),
}

/// What [`Detector::handle_fault`] decided about a trap.
#[derive(Debug)]
pub enum FaultVerdict {
    /// The address is not the detector's business.
    Unhandled,
    /// The trap was absorbed without a report.
    Silenced,
    /// A violation was detected and reported.
    Reported(Report),
}

struct Inner {
    pool: PoolState,
    mapper: Box<dyn PageMapper + Send>,
    stacks: Box<dyn StackCapturer + Send>,
    symbols: Box<dyn FrameSymbolizer + Send>,
    disarm_reason: Option<DisarmReason>,
    last_report: Option<Report>,
}

/// A sampling guard-page detector instance.
///
/// Built through [`Detector::builder`]. The detector owns a reserved pool
/// of guarded pages and watches the small sample of allocations diverted
/// into it. It starts armed and disarms after its first report; call
/// [`Detector::rearm`] to keep detecting.
pub struct Detector {
    config: DetectorConfig,
    layout: PoolLayout,
    armed: AtomicBool,
    gate: SampleGate,
    inner: Mutex<Inner>,
}

/// Assembles a [`Detector`].
#[derive(Default)]
pub struct DetectorBuilder {
    config: DetectorConfig,
    mapper: Option<Box<dyn PageMapper + Send>>,
    stacks: Option<Box<dyn StackCapturer + Send>>,
    symbols: Option<Box<dyn FrameSymbolizer + Send>>,
}

impl DetectorBuilder {
    /// Replaces the default configuration.
    pub fn config(mut self, config: DetectorConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the page mapper backing the pool. Required.
    pub fn mapper(mut self, mapper: impl PageMapper + Send + 'static) -> Self {
        self.mapper = Some(Box::new(mapper));
        self
    }

    /// Sets the stack capturer. Defaults to capturing nothing.
    pub fn stack_capturer(mut self, stacks: impl StackCapturer + Send + 'static) -> Self {
        self.stacks = Some(Box::new(stacks));
        self
    }

    /// Sets the frame symbolizer. Defaults to resolving nothing.
    pub fn symbolizer(mut self, symbols: impl FrameSymbolizer + Send + 'static) -> Self {
        self.symbols = Some(Box::new(symbols));
        self
    }

    /// Reserves the pool, protects its guard pages, and arms the detector.
    ///
    /// # Errors
    ///
    /// [`BuildError::InvalidConfig`] for a zero slot count or sample
    /// interval, [`BuildError::MissingMapper`] without a mapper, and
    /// [`BuildError::Map`] when the reservation or guard protection fails.
    pub fn build(self) -> Result<Detector, BuildError> {
        if self.config.slot_count == 0 {
            return Err(BuildError::InvalidConfig(
                "slot_count must be at least 1".to_string(),
            ));
        }
        if self.config.sample_interval == 0 {
            return Err(BuildError::InvalidConfig(
                "sample_interval must be at least 1".to_string(),
            ));
        }
        let mut mapper = self.mapper.ok_or(BuildError::MissingMapper)?;

        let base = mapper.reserve(PoolLayout::pages_for(self.config.slot_count) << PAGE_SHIFT)?;
        if base & PAGE_MASK != 0 {
            mapper.release();
            return Err(MapError::Unsupported(format!(
                "reservation at 0x{base:x} is not page aligned"
            ))
            .into());
        }
        let layout = PoolLayout::new(base, self.config.slot_count);
        for guard_page in layout.guard_pages() {
            if let Err(err) = mapper.protect(guard_page) {
                mapper.release();
                return Err(err.into());
            }
        }
        info!(
            "guarded pool: {} slots at 0x{:x}..0x{:x}",
            layout.slot_count(),
            layout.base(),
            layout.base() + layout.byte_len()
        );

        Ok(Detector {
            layout,
            armed: AtomicBool::new(true),
            gate: SampleGate::new(self.config.sample_interval, self.config.seed),
            inner: Mutex::new(Inner {
                pool: PoolState::new(layout, self.config.seed),
                mapper,
                stacks: self.stacks.unwrap_or_else(|| Box::new(NoStacks)),
                symbols: self.symbols.unwrap_or_else(|| Box::new(NoSymbols)),
                disarm_reason: None,
                last_report: None,
            }),
            config: self.config,
        })
    }
}

fn capture(stacks: &dyn StackCapturer) -> StackTrace {
    StackTrace::capture_with(|frames| stacks.capture(frames))
}

impl Detector {
    /// Starts a builder.
    pub fn builder() -> DetectorBuilder {
        DetectorBuilder::default()
    }

    /// The configuration the detector was built with.
    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// True while violations are detected and reported.
    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }

    /// Why the detector is disarmed, if it is.
    pub fn disarm_reason(&self) -> Option<DisarmReason> {
        self.lock().disarm_reason.clone()
    }

    /// True if `addr` falls inside the pool reservation. Lock-free.
    pub fn is_pool_address(&self, addr: usize) -> bool {
        self.layout.contains(addr)
    }

    /// Decides, without taking the lock, whether the current allocation
    /// request should be diverted into the pool.
    pub fn should_divert(&self) -> bool {
        self.is_armed() && self.gate.tick()
    }

    /// Offers an allocation request to the detector.
    ///
    /// Returns the guarded object address when the sampling gate elects this
    /// request and a slot is available; `None` means the host allocator
    /// serves it. Requests above one page are never diverted.
    pub fn try_allocate(&self, size: usize, cache: &Arc<CacheDescriptor>) -> Option<usize> {
        if !self.should_divert() {
            return None;
        }
        self.place(size, cache)
    }

    /// Places an object into the pool, bypassing the sampling gate.
    pub fn place(&self, size: usize, cache: &Arc<CacheDescriptor>) -> Option<usize> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        if inner.disarm_reason.is_some() {
            return None;
        }
        let stack = capture(&*inner.stacks);
        match inner.pool.place(size, cache, inner.mapper.as_mut(), stack) {
            Ok(address) => address,
            Err(err) => {
                self.stand_down(
                    inner,
                    DisarmReason::SelfProtect(format!("placement failed: {err}")),
                );
                None
            }
        }
    }

    /// Releases the guarded object at `addr`.
    ///
    /// `None` means `addr` names no pool object. Double frees and corrupted
    /// redzones are reported before the outcome is returned; an interior
    /// pointer is reported as corruption and leaves the object allocated.
    pub fn remove(&self, addr: usize) -> Option<FreeOutcome> {
        if !self.layout.contains(addr) {
            return None;
        }
        let mut guard = self.lock();
        let inner = &mut *guard;
        let validate = inner.disarm_reason.is_none();
        match inner.pool.inspect_free(addr, inner.mapper.as_ref(), validate) {
            FreeInspection::NotAnObject => None,
            FreeInspection::DoubleFree { slot } => {
                if self.is_armed() {
                    let report = self.build_report(inner, Violation::DoubleFree, addr, slot);
                    self.emit_report(inner, report);
                    self.stand_down(inner, DisarmReason::Violation);
                }
                Some(FreeOutcome::DoubleFree)
            }
            FreeInspection::Interior { slot } => {
                if self.is_armed() {
                    let report = self.build_report(inner, Violation::Corruption, addr, slot);
                    self.emit_report(inner, report);
                    self.stand_down(inner, DisarmReason::Violation);
                }
                Some(FreeOutcome::Corruption)
            }
            FreeInspection::Clean { slot } => {
                self.finish_free(inner, slot);
                Some(FreeOutcome::Freed)
            }
            FreeInspection::Corrupt { slot, mismatch } => {
                let report = self.build_report(inner, Violation::Corruption, mismatch, slot);
                self.emit_report(inner, report);
                self.stand_down(inner, DisarmReason::Violation);
                self.finish_free(inner, slot);
                Some(FreeOutcome::Corruption)
            }
        }
    }

    /// Hook for the host allocator's free path.
    ///
    /// Returns true when `addr` belongs to the pool and the detector handled
    /// the free; false hands the pointer back to the host allocator.
    pub fn try_free(&self, addr: usize) -> bool {
        if !self.layout.contains(addr) {
            return false;
        }
        self.remove(addr);
        true
    }

    /// Size in bytes of the object in `addr`'s slot, or 0 when no object
    /// lives or lived there.
    pub fn object_size(&self, addr: usize) -> usize {
        let Some(slot) = self.layout.slot_of(addr) else {
            return 0;
        };
        let guard = self.lock();
        let record = &guard.pool.records[slot];
        if record.state() == SlotState::Unused {
            0
        } else {
            record.byte_length()
        }
    }

    /// Attributes a trapping access at `addr`.
    ///
    /// Call this from the host's fault path before any other handling.
    /// [`FaultVerdict::Unhandled`] means the trap is not the detector's
    /// (outside the pool, or nothing can absorb it). After a report the
    /// trapped page stays protected, so re-executing the access traps again.
    pub fn handle_fault(&self, addr: usize) -> FaultVerdict {
        if !self.layout.contains(addr) {
            return FaultVerdict::Unhandled;
        }
        let mut guard = self.lock();
        let inner = &mut *guard;
        if inner.disarm_reason.is_some() {
            return Self::open_page(inner, addr);
        }
        match classify(&inner.pool, addr) {
            Classification::Wild => {
                warn!("unattributable access at 0x{addr:x} inside the pool");
                FaultVerdict::Unhandled
            }
            Classification::Inconsistent(what) => {
                self.stand_down(inner, DisarmReason::SelfProtect(what));
                Self::open_page(inner, addr)
            }
            Classification::Violation { slot, kind } => {
                let report = self.build_report(inner, kind, addr, slot);
                self.emit_report(inner, report.clone());
                self.stand_down(inner, DisarmReason::Violation);
                FaultVerdict::Reported(report)
            }
        }
    }

    /// Stops detecting until [`Detector::rearm`]. Frees of pool objects
    /// still complete, without validation or reports.
    pub fn disarm(&self) {
        let mut guard = self.lock();
        let inner = &mut *guard;
        self.stand_down(inner, DisarmReason::Requested);
    }

    /// Resumes detection after a report or an explicit disarm.
    ///
    /// The last report stays readable through
    /// [`Detector::take_last_report`].
    pub fn rearm(&self) {
        let mut guard = self.lock();
        guard.disarm_reason = None;
        self.armed.store(true, Ordering::Release);
        info!("detector rearmed");
    }

    /// Takes the most recent report, leaving none behind.
    pub fn take_last_report(&self) -> Option<Report> {
        self.lock().last_report.take()
    }

    /// Severs the pool's references to `cache`.
    ///
    /// Returns false while the cache still owns live pool objects; the host
    /// must free those first and call again. Freed slots that pointed at the
    /// cache lose its name but keep their provenance stacks.
    pub fn unregister_cache(&self, cache: &Arc<CacheDescriptor>) -> bool {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let target = Arc::downgrade(cache);
        let lingering = inner.pool.records.iter().any(|record| {
            record.state() == SlotState::Allocated && record.cache.ptr_eq(&target)
        });
        if lingering {
            warn!("cache {} still has live guarded objects", cache.name());
            return false;
        }
        for record in inner.pool.records.iter_mut() {
            if record.cache.ptr_eq(&target) {
                record.cache = Weak::new();
            }
        }
        true
    }

    /// Writes every live and freed object's bookkeeping to `out`, or to the
    /// error log when `out` is `None`.
    pub fn dump_objects(&self, mut out: Option<&mut String>) {
        let guard = self.lock();
        let out = &mut out;
        let mut first = true;
        for (index, record) in guard.pool.records.iter().enumerate() {
            if record.state() == SlotState::Unused {
                continue;
            }
            if !first {
                emit(out, format_args!("{DUMP_SEPARATOR}"));
            }
            first = false;
            ObjectSnapshot::of(index, record).render(guard.symbols.as_ref(), out);
        }
    }

    /// Logs the object dump line by line at `level`.
    pub fn log_objects(&self, level: log::Level) {
        let mut text = String::new();
        self.dump_objects(Some(&mut text));
        for line in text.lines() {
            log::log!(level, "{line}");
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn open_page(inner: &mut Inner, addr: usize) -> FaultVerdict {
        match inner.mapper.unprotect(addr & !PAGE_MASK) {
            Ok(()) => FaultVerdict::Silenced,
            Err(err) => {
                error!("failed to open trapped page at 0x{addr:x}: {err}");
                FaultVerdict::Unhandled
            }
        }
    }

    fn build_report(
        &self,
        inner: &Inner,
        kind: Violation,
        fault_address: usize,
        slot: usize,
    ) -> Report {
        let corrupted_bytes = if kind == Violation::Corruption {
            read_corruption_window(inner, fault_address)
        } else {
            Vec::new()
        };
        Report {
            kind,
            fault_address,
            object: ObjectSnapshot::of(slot, &inner.pool.records[slot]),
            access_stack: capture(&*inner.stacks),
            corrupted_bytes,
        }
    }

    fn emit_report(&self, inner: &mut Inner, report: Report) {
        report.render(inner.symbols.as_ref(), &self.config.skip_markers, None);
        inner.last_report = Some(report);
    }

    fn finish_free(&self, inner: &mut Inner, slot: usize) {
        let stack = capture(&*inner.stacks);
        if let Err(err) = inner.pool.commit_free(slot, inner.mapper.as_mut(), stack) {
            self.stand_down(
                inner,
                DisarmReason::SelfProtect(format!("protect on free failed: {err}")),
            );
        }
    }

    /// First reason wins; later calls while disarmed change nothing.
    fn stand_down(&self, inner: &mut Inner, reason: DisarmReason) {
        if inner.disarm_reason.is_some() {
            return;
        }
        match &reason {
            DisarmReason::SelfProtect(what) => error!("detector standing down: {what}"),
            DisarmReason::Violation => {
                info!("detector disarmed after reporting; rearm() to continue detecting");
            }
            DisarmReason::Requested => info!("detector disarmed on request"),
        }
        inner.disarm_reason = Some(reason);
        self.armed.store(false, Ordering::Release);
    }
}

impl Drop for Detector {
    fn drop(&mut self) {
        let inner = match self.inner.get_mut() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.mapper.release();
    }
}

fn read_corruption_window(inner: &Inner, start: usize) -> Vec<u8> {
    let page_end = (start & !PAGE_MASK) + PAGE_SIZE;
    let len = CORRUPTION_DUMP_BYTES.min(page_end - start);
    (start..start + len)
        .map(|addr| inner.mapper.read_byte(addr))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_rejects_bad_config() {
        let config = DetectorConfig {
            slot_count: 0,
            ..DetectorConfig::default()
        };
        let result = Detector::builder().config(config).build();
        assert!(matches!(result, Err(BuildError::InvalidConfig(_))));

        let config = DetectorConfig {
            sample_interval: 0,
            ..DetectorConfig::default()
        };
        let result = Detector::builder().config(config).build();
        assert!(matches!(result, Err(BuildError::InvalidConfig(_))));
    }

    #[test]
    fn test_builder_requires_mapper() {
        let result = Detector::builder().build();
        assert!(matches!(result, Err(BuildError::MissingMapper)));
    }
}
