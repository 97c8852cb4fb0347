//! Trace port interface unit driver.
use super::etf::FlushOutcome;
use super::{register, CoreSight, CoreSightError, DeviceId, DeviceKind, Register, WaitBits};
use crate::access::MemoryAccess;

const REGISTER_OFFSET_SUPPORTED_PATTERNS: u32 = 0x200;
const REGISTER_OFFSET_CURRENT_PATTERN: u32 = 0x204;
const REGISTER_OFFSET_PATTERN_REPEAT: u32 = 0x208;

/// Test patterns a TPIU can drive onto the trace port.
const PATTERN_MASK: u32 = 0xF;
/// Run the selected patterns for a fixed number of cycles.
const PATTERN_TIMED: u32 = 1 << 16;
const PATTERN_CYCLES: u32 = 0xFF;

/// Trace port interface unit.
pub struct Tpiu<'a, M> {
    cs: &'a mut CoreSight<M>,
    device: DeviceId,
}

impl<'a, M: MemoryAccess> Tpiu<'a, M> {
    pub fn new(cs: &'a mut CoreSight<M>, device: DeviceId) -> Result<Self, CoreSightError> {
        cs.registry()
            .expect_kind(device, DeviceKind::Tpiu, "a trace port interface unit")?;
        Ok(Self { cs, device })
    }

    /// Stop the formatter so the TPIU no longer exerts back-pressure on the trace bus.
    pub fn disable(&mut self) -> Result<FlushOutcome, CoreSightError> {
        let mut ffcr = FormatFlushControl::load(self.cs, self.device)?;
        ffcr.set_stoponfl(true);
        ffcr.set_flushman(true);
        ffcr.store(self.cs, self.device)?;

        match self.cs.wait(
            self.device,
            FormatFlushStatus::ADDRESS,
            FormatFlushStatus::STOPPED_MASK,
            WaitBits::AllOne,
        ) {
            Ok(_) => Ok(FlushOutcome::Stopped),
            Err(CoreSightError::Timeout { value, .. }) => Ok(FlushOutcome::Running { ffsr: value }),
            Err(e) => Err(e),
        }
    }

    /// Drive every implemented test pattern onto the trace port for a fixed number of cycles.
    /// Returns the mask of patterns that were run.
    pub fn pattern_test(&mut self) -> Result<u32, CoreSightError> {
        let supported = self.cs.read(self.device, REGISTER_OFFSET_SUPPORTED_PATTERNS)?;
        let patterns = supported & PATTERN_MASK;
        if patterns == 0 || supported & PATTERN_TIMED == 0 {
            return Err(CoreSightError::NoTestPatterns(
                self.cs.registry().base(self.device),
            ));
        }

        self.cs
            .write(self.device, REGISTER_OFFSET_PATTERN_REPEAT, PATTERN_CYCLES)?;
        self.cs.write(
            self.device,
            REGISTER_OFFSET_CURRENT_PATTERN,
            patterns | PATTERN_TIMED,
        )?;
        // The pattern register clears once the timed run has completed.
        self.cs.wait(
            self.device,
            REGISTER_OFFSET_CURRENT_PATTERN,
            PATTERN_TIMED,
            WaitBits::AllZero,
        )?;
        Ok(patterns)
    }
}

register! {
    pub struct FormatFlushControl(0x304, "TPIU_FFCR");

    pub stoponfl, set_stoponfl: 12;
    pub flushman, set_flushman: 6;
}

register! {
    pub struct FormatFlushStatus(0x300, "TPIU_FFSR");

    pub ftstopped, _: 1;
}

impl FormatFlushStatus {
    pub const STOPPED_MASK: u32 = 1 << 1;
}
