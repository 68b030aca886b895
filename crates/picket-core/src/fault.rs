//! Fault attribution: maps a trapped address to a violation and a slot.

use serde::Serialize;

use crate::pool::PoolState;
use crate::slot::SlotState;
use crate::util::PAGE_SIZE;

/// Which side of the object an out-of-bounds access landed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OobSide {
    /// Below the object's base address.
    Left,
    /// At or above the object's end address.
    Right,
}

/// The kind of memory-safety violation a report documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Violation {
    /// Access beyond either edge of a live object.
    OutOfBounds(OobSide),
    /// Access to an object that has been freed.
    UseAfterFree,
    /// Redzone bytes were modified without a trap firing.
    Corruption,
    /// Second free of an already freed object.
    DoubleFree,
}

/// Outcome of attributing one trapped address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Classification {
    /// No live or freed object explains the access.
    Wild,
    /// Attributed to `slot` as `kind`.
    Violation { slot: usize, kind: Violation },
    /// The trap contradicts the pool's own records.
    Inconsistent(String),
}

/// Attributes a trapping access inside the pool range.
///
/// Guard-page hits are charged to the nearest live neighbor, measured from
/// the neighbor's object edge to the fault; ties go to the slot below the
/// guard. Usable-page hits follow the slot's state.
pub(crate) fn classify(pool: &PoolState, addr: usize) -> Classification {
    if pool.layout.is_guard_page(addr) {
        return classify_guard(pool, addr);
    }
    let Some(slot) = pool.layout.slot_of(addr) else {
        return Classification::Wild;
    };
    let record = &pool.records[slot];
    match record.state() {
        SlotState::Unused => Classification::Wild,
        SlotState::Freed => Classification::Violation {
            slot,
            kind: Violation::UseAfterFree,
        },
        SlotState::Allocated => {
            if record.object_range().contains(&addr) {
                Classification::Inconsistent(format!(
                    "trap at 0x{addr:x} inside live object #{slot}"
                ))
            } else {
                let side = if addr < record.address() {
                    OobSide::Left
                } else {
                    OobSide::Right
                };
                Classification::Violation {
                    slot,
                    kind: Violation::OutOfBounds(side),
                }
            }
        }
    }
}

fn classify_guard(pool: &PoolState, addr: usize) -> Classification {
    // (slot, byte distance from that slot's object edge to the fault)
    let mut best: Option<(usize, usize)> = None;

    if let Some(slot) = pool.layout.slot_of(addr - PAGE_SIZE) {
        let record = &pool.records[slot];
        if record.state() == SlotState::Allocated {
            let object_end = record.address() + record.byte_length();
            best = Some((slot, addr - object_end));
        }
    }
    if let Some(slot) = pool.layout.slot_of(addr + PAGE_SIZE) {
        let record = &pool.records[slot];
        if record.state() == SlotState::Allocated {
            let distance = record.address() - addr;
            let closer = match best {
                Some((_, current)) => distance < current,
                None => true,
            };
            if closer {
                best = Some((slot, distance));
            }
        }
    }

    let Some((slot, _)) = best else {
        return Classification::Wild;
    };
    let side = if addr < pool.records[slot].address() {
        OobSide::Left
    } else {
        OobSide::Right
    };
    Classification::Violation {
        slot,
        kind: Violation::OutOfBounds(side),
    }
}
