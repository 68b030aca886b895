//! End-to-end detector behavior against the simulated page mapper.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use picket::util::{PAGE_MASK, PAGE_SIZE};
use picket::{
    CacheDescriptor, Detector, DetectorConfig, DisarmReason, FaultVerdict, FrameSymbolizer,
    FreeOutcome, OobSide, SkipMarkers, SlotState, StackCapturer, Violation,
};
use picket_sim::SimMapper;

/// Stack capturer that replays whatever frames the test staged last.
#[derive(Clone, Default)]
struct RecordedStacks(Arc<Mutex<Vec<usize>>>);

impl RecordedStacks {
    fn set(&self, frames: &[usize]) {
        let mut current = self.0.lock().unwrap();
        current.clear();
        current.extend_from_slice(frames);
    }
}

impl StackCapturer for RecordedStacks {
    fn capture(&self, frames: &mut [usize]) -> usize {
        let current = self.0.lock().unwrap();
        let depth = current.len().min(frames.len());
        frames[..depth].copy_from_slice(&current[..depth]);
        depth
    }
}

#[derive(Clone)]
struct NameTable(HashMap<usize, String>);

impl NameTable {
    fn new(entries: &[(usize, &str)]) -> Self {
        Self(
            entries
                .iter()
                .map(|(frame, name)| (*frame, name.to_string()))
                .collect(),
        )
    }
}

impl FrameSymbolizer for NameTable {
    fn symbolize(&self, frame: usize) -> Option<String> {
        self.0.get(&frame).cloned()
    }
}

fn test_config(slots: usize, interval: u32) -> DetectorConfig {
    DetectorConfig {
        slot_count: slots,
        sample_interval: interval,
        seed: 0x5EED_CAFE,
        ..DetectorConfig::default()
    }
}

fn build_detector(slots: usize, interval: u32) -> anyhow::Result<(Detector, SimMapper)> {
    let _ = env_logger::builder().is_test(true).try_init();
    let mapper = SimMapper::new();
    let handle = mapper.clone();
    let detector = Detector::builder()
        .config(test_config(slots, interval))
        .mapper(mapper)
        .build()?;
    Ok((detector, handle))
}

fn widget_cache() -> Arc<CacheDescriptor> {
    Arc::new(CacheDescriptor::new("widgets", 8))
}

#[test]
fn test_clean_roundtrip_emits_no_report() -> anyhow::Result<()> {
    let (detector, mapper) = build_detector(4, 1)?;
    let cache = widget_cache();

    let addr = detector.try_allocate(24, &cache).expect("interval 1 diverts");
    assert!(detector.is_pool_address(addr));
    assert_eq!(detector.object_size(addr), 24);
    assert!(!mapper.is_protected(addr));

    mapper.write(addr, 0x7F);
    assert_eq!(mapper.read(addr), 0x7F);

    assert_eq!(detector.remove(addr), Some(FreeOutcome::Freed));
    assert!(mapper.is_protected(addr));
    assert!(detector.take_last_report().is_none());
    assert!(detector.is_armed());
    Ok(())
}

#[test]
fn test_faults_outside_pool_or_on_untouched_slots_are_unhandled() -> anyhow::Result<()> {
    let (detector, mapper) = build_detector(2, 1)?;

    assert!(!detector.is_pool_address(0x10));
    assert!(matches!(detector.handle_fault(0x10), FaultVerdict::Unhandled));

    // Slot 0 data page and the first guard page, with nothing allocated yet.
    let untouched = mapper.base() + 2 * PAGE_SIZE;
    assert!(matches!(
        detector.handle_fault(untouched),
        FaultVerdict::Unhandled
    ));
    assert!(matches!(
        detector.handle_fault(mapper.base() + PAGE_SIZE),
        FaultVerdict::Unhandled
    ));

    assert!(detector.is_armed());
    assert!(detector.take_last_report().is_none());
    Ok(())
}

#[test]
fn test_guard_faults_report_out_of_bounds() -> anyhow::Result<()> {
    let (detector, mapper) = build_detector(4, 1)?;
    let cache = widget_cache();

    let addr = detector.place(64, &cache).expect("free slot");
    let page = addr & !PAGE_MASK;

    let right_probe = page + PAGE_SIZE;
    let FaultVerdict::Reported(report) = detector.handle_fault(right_probe) else {
        panic!("expected a report for the right guard");
    };
    assert_eq!(report.kind, Violation::OutOfBounds(OobSide::Right));
    assert_eq!(report.fault_address, right_probe);
    assert_eq!(report.object.address, addr);
    assert!(!detector.is_armed());
    assert_eq!(detector.disarm_reason(), Some(DisarmReason::Violation));
    // Reported guard pages stay protected.
    assert!(mapper.is_protected(right_probe));

    detector.rearm();
    let left_probe = page - 1;
    let FaultVerdict::Reported(report) = detector.handle_fault(left_probe) else {
        panic!("expected a report for the left guard");
    };
    assert_eq!(report.kind, Violation::OutOfBounds(OobSide::Left));
    assert_eq!(report.fault_address, left_probe);

    // Both reports were retained in turn, the newer one wins.
    let retained = detector.take_last_report().expect("retained report");
    assert_eq!(retained.kind, Violation::OutOfBounds(OobSide::Left));
    assert!(detector.take_last_report().is_none());
    Ok(())
}

#[test]
fn test_use_after_free_reported_at_each_offset() -> anyhow::Result<()> {
    let (detector, _mapper) = build_detector(2, 1)?;
    let cache = widget_cache();

    let addr = detector.place(100, &cache).expect("free slot");
    assert_eq!(detector.remove(addr), Some(FreeOutcome::Freed));

    let page = addr & !PAGE_MASK;
    for offset in [0, 17, 99, PAGE_SIZE - 1] {
        let FaultVerdict::Reported(report) = detector.handle_fault(page + offset) else {
            panic!("expected a report at offset {offset}");
        };
        assert_eq!(report.kind, Violation::UseAfterFree);
        assert_eq!(report.fault_address, page + offset);
        assert_eq!(report.object.state, SlotState::Freed);
        detector.rearm();
    }
    Ok(())
}

#[test]
fn test_double_free_keeps_original_free_stack() -> anyhow::Result<()> {
    let stacks = RecordedStacks::default();
    let detector = Detector::builder()
        .config(test_config(2, 1))
        .mapper(SimMapper::new())
        .stack_capturer(stacks.clone())
        .build()?;
    let cache = widget_cache();

    stacks.set(&[0xA1]);
    let addr = detector.place(16, &cache).expect("free slot");

    stacks.set(&[0xB2]);
    assert_eq!(detector.remove(addr), Some(FreeOutcome::Freed));

    stacks.set(&[0xC3]);
    assert_eq!(detector.remove(addr), Some(FreeOutcome::DoubleFree));

    let report = detector.take_last_report().expect("double-free report");
    assert_eq!(report.kind, Violation::DoubleFree);
    assert_eq!(report.fault_address, addr);
    // The snapshot keeps the first free, the access stack is the second one.
    assert_eq!(report.object.alloc_stack.frames(), &[0xA1]);
    assert_eq!(report.object.free_stack.frames(), &[0xB2]);
    assert_eq!(report.access_stack.frames(), &[0xC3]);
    assert!(!detector.is_armed());
    Ok(())
}

#[test]
fn test_redzone_corruption_detected_on_free() -> anyhow::Result<()> {
    let (detector, mapper) = build_detector(2, 1)?;
    let cache = widget_cache();

    let addr = detector.place(40, &cache).expect("free slot");
    let page = addr & !PAGE_MASK;
    // Smash one redzone byte next to the object, whichever side exists.
    let target = if addr == page { addr + 40 } else { addr - 1 };
    let smashed = mapper.read(target) ^ 0x55;
    mapper.write(target, smashed);

    assert_eq!(detector.remove(addr), Some(FreeOutcome::Corruption));
    let report = detector.take_last_report().expect("corruption report");
    assert_eq!(report.kind, Violation::Corruption);
    assert_eq!(report.fault_address, target);
    assert_eq!(report.corrupted_bytes[0], smashed);
    assert_eq!(report.object.state, SlotState::Allocated);

    // The free still completed and the page is guarded again.
    assert!(mapper.is_protected(addr));
    assert!(!detector.is_armed());
    Ok(())
}

#[test]
fn test_interior_free_reports_corruption_and_keeps_object() -> anyhow::Result<()> {
    let (detector, _mapper) = build_detector(2, 1)?;
    let cache = widget_cache();

    let addr = detector.place(64, &cache).expect("free slot");
    assert_eq!(detector.remove(addr + 8), Some(FreeOutcome::Corruption));

    let report = detector.take_last_report().expect("interior free report");
    assert_eq!(report.kind, Violation::Corruption);
    assert_eq!(report.fault_address, addr + 8);

    // The object survived and a clean free still works after rearming.
    detector.rearm();
    assert_eq!(detector.object_size(addr), 64);
    assert_eq!(detector.remove(addr), Some(FreeOutcome::Freed));
    Ok(())
}

#[test]
fn test_trap_inside_live_object_stands_the_detector_down() -> anyhow::Result<()> {
    let (detector, _mapper) = build_detector(2, 1)?;
    let cache = widget_cache();

    let addr = detector.place(64, &cache).expect("free slot");
    // A trap inside a live object contradicts the pool's own records.
    assert!(matches!(
        detector.handle_fault(addr + 3),
        FaultVerdict::Silenced
    ));
    assert!(matches!(
        detector.disarm_reason(),
        Some(DisarmReason::SelfProtect(_))
    ));
    assert!(detector.take_last_report().is_none());
    Ok(())
}

#[test]
fn test_pool_exhaustion_fails_open() -> anyhow::Result<()> {
    let (detector, _mapper) = build_detector(3, 1)?;
    let cache = widget_cache();

    let mut addrs = Vec::new();
    for _ in 0..3 {
        addrs.push(detector.place(8, &cache).expect("free slot"));
    }
    assert_eq!(detector.place(8, &cache), None);
    assert!(detector.is_armed());
    assert!(detector.take_last_report().is_none());

    for addr in &addrs {
        assert_eq!(detector.object_size(*addr), 8);
    }
    for addr in addrs {
        assert_eq!(detector.remove(addr), Some(FreeOutcome::Freed));
    }
    assert!(detector.place(8, &cache).is_some());
    Ok(())
}

#[test]
fn test_detector_is_quiet_until_rearmed() -> anyhow::Result<()> {
    let (detector, mapper) = build_detector(4, 1)?;
    let cache = widget_cache();

    let first = detector.place(32, &cache).expect("free slot");
    let second = detector.place(32, &cache).expect("free slot");

    let first_page = first & !PAGE_MASK;
    let FaultVerdict::Reported(_) = detector.handle_fault(first_page + PAGE_SIZE) else {
        panic!("expected the first violation to report");
    };
    let _ = detector.take_last_report();

    // Disarmed: placements refuse, in-range traps are absorbed by opening
    // the page, and no further reports appear.
    assert_eq!(detector.place(8, &cache), None);
    let second_guard = (second & !PAGE_MASK) + PAGE_SIZE;
    assert!(matches!(
        detector.handle_fault(second_guard),
        FaultVerdict::Silenced
    ));
    assert!(!mapper.is_protected(second_guard));
    assert!(detector.take_last_report().is_none());

    // Frees still complete silently.
    assert_eq!(detector.remove(second), Some(FreeOutcome::Freed));
    assert!(detector.take_last_report().is_none());

    detector.rearm();
    assert!(detector.is_armed());
    assert_eq!(detector.disarm_reason(), None);
    assert!(detector.place(8, &cache).is_some());
    Ok(())
}

#[test]
fn test_requested_disarm_roundtrip() -> anyhow::Result<()> {
    let (detector, _mapper) = build_detector(2, 1)?;
    let cache = widget_cache();

    detector.disarm();
    assert!(!detector.is_armed());
    assert_eq!(detector.disarm_reason(), Some(DisarmReason::Requested));
    assert_eq!(detector.place(8, &cache), None);

    detector.rearm();
    assert_eq!(detector.disarm_reason(), None);
    assert!(detector.place(8, &cache).is_some());
    Ok(())
}

#[test]
fn test_report_renders_deterministically() -> anyhow::Result<()> {
    let stacks = RecordedStacks::default();
    let names = NameTable::new(&[(0x10, "widget_write_past_end"), (0x20, "widget_new")]);
    let detector = Detector::builder()
        .config(test_config(2, 1))
        .mapper(SimMapper::new())
        .stack_capturer(stacks.clone())
        .symbolizer(names.clone())
        .build()?;
    let cache = widget_cache();

    stacks.set(&[0x20]);
    let addr = detector.place(48, &cache).expect("free slot");
    stacks.set(&[0x10]);
    let FaultVerdict::Reported(report) = detector.handle_fault((addr & !PAGE_MASK) + PAGE_SIZE)
    else {
        panic!("expected a report");
    };

    let markers = SkipMarkers::default();
    let mut first = String::new();
    let mut second = String::new();
    report.render(&names, &markers, Some(&mut first));
    report.render(&names, &markers, Some(&mut second));

    assert_eq!(first, second);
    assert!(first.starts_with("=========="));
    assert!(first.contains("BUG: picket: out-of-bounds in widget_write_past_end"));
    assert!(first.contains("widget_new"));
    assert!(first.contains("belongs to cache widgets"));
    Ok(())
}

#[test]
fn test_sampling_interval_paces_diversions() -> anyhow::Result<()> {
    let (detector, _mapper) = build_detector(2, 5)?;
    let cache = widget_cache();

    let mut diverted = 0;
    for _ in 0..100 {
        if let Some(addr) = detector.try_allocate(16, &cache) {
            diverted += 1;
            assert_eq!(detector.remove(addr), Some(FreeOutcome::Freed));
        }
    }
    // Gate resets land in [interval / 2, 3 * interval / 2], so 100 requests
    // at interval 5 divert somewhere between roughly 1-in-8 and 1-in-2.
    assert!(diverted >= 100 / 8, "diverted {diverted} of 100");
    assert!(diverted <= 100 / 2, "diverted {diverted} of 100");
    Ok(())
}

#[test]
fn test_unregister_cache_requires_no_live_objects() -> anyhow::Result<()> {
    let (detector, _mapper) = build_detector(2, 1)?;
    let cache = Arc::new(CacheDescriptor::new("session", 8));

    let addr = detector.place(16, &cache).expect("free slot");
    assert!(!detector.unregister_cache(&cache));

    assert_eq!(detector.remove(addr), Some(FreeOutcome::Freed));
    assert!(detector.unregister_cache(&cache));

    // The freed object survives, but no longer names the cache.
    let mut dump = String::new();
    detector.dump_objects(Some(&mut dump));
    assert!(dump.contains("Object #0"));
    assert!(!dump.contains("session"));
    Ok(())
}

#[test]
fn test_dump_objects_lists_live_and_freed_slots() -> anyhow::Result<()> {
    let (detector, _mapper) = build_detector(3, 1)?;
    let cache = widget_cache();

    let live = detector.place(24, &cache).expect("free slot");
    let freed = detector.place(8, &cache).expect("free slot");
    assert_eq!(detector.remove(freed), Some(FreeOutcome::Freed));

    let mut dump = String::new();
    detector.dump_objects(Some(&mut dump));
    assert!(dump.contains(&format!("Object #0: starts at 0x{live:x}, size=24")));
    assert!(dump.contains(&format!("Object #1: starts at 0x{freed:x}, size=8")));
    assert!(dump.contains("freed at:"));
    assert!(dump.contains("belongs to cache widgets"));
    Ok(())
}

#[test]
fn test_object_size_and_pool_membership() -> anyhow::Result<()> {
    let (detector, mapper) = build_detector(2, 1)?;
    let cache = widget_cache();

    // The reserved first page holds no objects.
    assert_eq!(detector.object_size(mapper.base()), 0);
    assert!(!detector.is_pool_address(mapper.base() - 1));

    let addr = detector.place(33, &cache).expect("free slot");
    assert_eq!(detector.object_size(addr), 33);
    assert_eq!(detector.object_size(addr + 5), 33);

    assert_eq!(detector.remove(addr), Some(FreeOutcome::Freed));
    // Freed slots keep their last size until reuse.
    assert_eq!(detector.object_size(addr), 33);

    // try_free claims every pool address, even ones holding no object.
    assert!(detector.try_free((addr & !PAGE_MASK) + PAGE_SIZE));
    assert!(!detector.try_free(0x10));
    Ok(())
}

#[test]
fn test_allocation_size_limits() -> anyhow::Result<()> {
    let (detector, _mapper) = build_detector(2, 1)?;
    let cache = widget_cache();

    // Zero-size requests round up to a single byte.
    let addr = detector.place(0, &cache).expect("free slot");
    assert_eq!(detector.object_size(addr), 1);
    assert_eq!(detector.remove(addr), Some(FreeOutcome::Freed));

    assert!(detector.place(PAGE_SIZE + 1, &cache).is_none());
    assert!(detector.place(PAGE_SIZE, &cache).is_some());
    assert!(detector.is_armed());
    Ok(())
}
