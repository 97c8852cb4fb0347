//! Behavioural models of CoreSight components for [`SimulatedMemory`].
//!
//! The models reproduce just enough hardware behaviour for the drivers to run against the
//! simulator: reset values, status bits that follow control bits, and a trace memory that holds
//! [`SYNTHETIC_TRACE`] once a capture has been stopped.
use super::{DeviceKind, Registry};
use crate::access::sim::SimState;
use crate::access::SimulatedMemory;

/// Trace returned by a simulated trace memory after each capture: a formatter frame
/// synchronisation followed by a few frames of payload.
pub const SYNTHETIC_TRACE: [u32; 8] = [
    0x7FFF_FFFF,
    0x0000_0000,
    0x0000_0080,
    0x2100_1011,
    0x9D00_4400,
    0x0001_5A1C,
    0x0001_5B2C,
    0x0000_0000,
];

/// Default size of a simulated trace memory, in words.
pub const TRACE_MEMORY_WORDS: u32 = 0x800;

const ETM_STATR: u64 = 0x00C;
const ETM_PRGCTLR: u64 = 0x004;
const ETM_IDR0: u64 = 0x1E0;
const ETM_IDR1: u64 = 0x1E4;
const ETM_IDR2: u64 = 0x1E8;
const ETM_IDR3: u64 = 0x1EC;
const ETM_IDR4: u64 = 0x1F0;
const ETM_AUTHSTATUS: u64 = 0xFB8;

const TMC_RSZ: u64 = 0x04;
const TMC_STS: u64 = 0x0C;
const TMC_RRD: u64 = 0x10;
const TMC_RWP: u64 = 0x18;
const TMC_CTL: u64 = 0x20;
const FFSR: u64 = 0x300;
const FFCR: u64 = 0x304;

const TPIU_SUPPORTED_PATTERNS: u64 = 0x200;
const TPIU_CURRENT_PATTERN: u64 = 0x204;

const FFSR_STOPPED: u32 = 1 << 1;
const FFCR_FLUSHMAN: u32 = 1 << 6;
const FFCR_STOPONFL: u32 = 1 << 12;

/// Install the model of every device in `registry` into `memory`.
pub fn install(memory: &mut SimulatedMemory, registry: &Registry) {
    for (_, info) in registry.devices() {
        match info.kind {
            DeviceKind::Etm => etm(memory, info.base),
            DeviceKind::Etf | DeviceKind::Etr => trace_memory(memory, info.base),
            DeviceKind::Tpiu => tpiu(memory, info.base),
            _ => {}
        }
    }
}

/// An ETMv4 of a Cortex-A53: 4 address comparator pairs, 8 bit VMID and 32 bit context ID.
fn etm(memory: &mut SimulatedMemory, base: u64) {
    memory
        .preset(base + ETM_STATR, 0b11)
        .preset(base + ETM_IDR0, 0x2800_0EA1)
        .preset(base + ETM_IDR1, 0x4100_F401)
        .preset(base + ETM_IDR2, 0x0000_0488)
        .preset(base + ETM_IDR3, 0x0D7B_0004)
        .preset(base + ETM_IDR4, 0x1117_0004)
        .preset(base + ETM_AUTHSTATUS, 0x0000_00CC)
        .on_write(base + ETM_PRGCTLR, move |value, state| {
            if value & 1 != 0 {
                state.modify(base + ETM_STATR, 0, 0b1);
            } else {
                state.modify(base + ETM_STATR, 0b1, 0);
            }
        });
}

fn trace_memory(memory: &mut SimulatedMemory, base: u64) {
    let mut capturing = false;

    memory
        .preset(base + TMC_RSZ, TRACE_MEMORY_WORDS)
        .preset(base + TMC_STS, 1 << 2)
        .preset(base + TMC_RRD, 0xFFFF_FFFF)
        .on_write(base + TMC_CTL, move |value, state| {
            if value & 1 != 0 {
                capturing = true;
                state.modify(base + TMC_STS, 0, 1 << 2);
                state.modify(base + FFSR, 0, FFSR_STOPPED);
            } else {
                state.modify(base + TMC_STS, 1 << 2, 0);
                if std::mem::replace(&mut capturing, false) {
                    state.set(base + TMC_RWP, (SYNTHETIC_TRACE.len() * 4) as u32);
                    state.clear_stream(base + TMC_RRD);
                    state.push_stream(base + TMC_RRD, SYNTHETIC_TRACE);
                }
            }
        })
        .on_write(base + FFCR, move |value, state| flush(base, value, state));
}

fn tpiu(memory: &mut SimulatedMemory, base: u64) {
    memory
        .preset(base + TPIU_SUPPORTED_PATTERNS, 0x0003_000F)
        .on_write(base + FFCR, move |value, state| flush(base, value, state))
        .on_write(base + TPIU_CURRENT_PATTERN, move |_, state| {
            state.set(base + TPIU_CURRENT_PATTERN, 0)
        });
}

/// A manual flush completes at once and stops the formatter if stop-on-flush is set.
fn flush(base: u64, ffcr: u32, state: &mut SimState) {
    if ffcr & FFCR_FLUSHMAN == 0 {
        return;
    }
    state.modify(base + FFCR, 0, FFCR_FLUSHMAN);
    if ffcr & FFCR_STOPONFL != 0 {
        state.modify(base + FFSR, FFSR_STOPPED, 0);
    }
}
