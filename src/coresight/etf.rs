//! Trace memory controller (TMC) driver.
//!
//! The same control block implements the embedded trace FIFO (ETF), the embedded trace buffer
//! (ETB) and the embedded trace router (ETR). Only the configuration differs.
use super::{register, CoreSight, CoreSightError, DeviceId, DeviceKind, Register, WaitBits};
use crate::access::MemoryAccess;

const REGISTER_OFFSET_RSZ: u32 = 0x04;
const REGISTER_OFFSET_RRD: u32 = 0x10;
const REGISTER_OFFSET_RRP: u32 = 0x14;
const REGISTER_OFFSET_RWP: u32 = 0x18;
const REGISTER_OFFSET_TRG: u32 = 0x1C;
const REGISTER_OFFSET_CTL: u32 = 0x20;

/// Value read from RRD once all captured trace has been read.
const RRD_EMPTY: u32 = 0xFFFF_FFFF;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Trace memory is used as a circular buffer. When the buffer fills, incoming trace data will
    /// overwrite older trace memory until the trace is stopped.
    Circular = 0b00,

    /// Trace memory is used as a FIFO that is drained through hardware to the next trace link.
    /// Whenever the buffer is non-empty, trace data is drained downstream.
    Hardware = 0b10,
}

/// Result of a manual flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// The formatter stopped once the flush completed.
    Stopped,
    /// The formatter was still running when polling gave up.
    Running { ffsr: u32 },
}

pub struct TraceMemoryController<'a, M> {
    cs: &'a mut CoreSight<M>,
    device: DeviceId,
}

impl<'a, M: MemoryAccess> TraceMemoryController<'a, M> {
    /// Construct a new trace memory controller for an ETF or ETR device.
    pub fn new(cs: &'a mut CoreSight<M>, device: DeviceId) -> Result<Self, CoreSightError> {
        let info = cs.registry().info(device);
        if !matches!(info.kind, DeviceKind::Etf | DeviceKind::Etr) {
            return Err(CoreSightError::WrongKind {
                base: info.base,
                kind: info.kind,
                expected: "a trace memory controller",
            });
        }
        Ok(Self { cs, device })
    }

    /// Configure the operational mode.
    ///
    /// # Args
    /// * `mode` - The desired operational mode of the trace memory.
    pub fn set_mode(&mut self, mode: Mode) -> Result<(), CoreSightError> {
        let mut mode_reg = EtfMode::load(self.cs, self.device)?;
        mode_reg.set_mode(mode as _);
        mode_reg.store(self.cs, self.device)
    }

    /// Enable trace capture.
    pub fn enable_capture(&mut self) -> Result<(), CoreSightError> {
        self.cs.write(self.device, REGISTER_OFFSET_CTL, 1)
    }

    /// Disable trace capture.
    pub fn disable_capture(&mut self) -> Result<(), CoreSightError> {
        self.cs.write(self.device, REGISTER_OFFSET_CTL, 0)
    }

    /// Enable the device as the end point of a trace session: a circular buffer that is read
    /// back once capture stops.
    pub fn enable_sink(&mut self) -> Result<(), CoreSightError> {
        self.disable()?;
        self.set_mode(Mode::Circular)?;
        self.cs.write(self.device, REGISTER_OFFSET_RWP, 0)?;
        self.cs.write(self.device, REGISTER_OFFSET_RRP, 0)?;
        self.enable_formatter()?;
        self.enable_capture()
    }

    /// Enable the device as a hardware FIFO between two trace links.
    pub fn enable_fifo(&mut self) -> Result<(), CoreSightError> {
        self.disable()?;
        self.set_mode(Mode::Hardware)?;
        self.enable_formatter()?;
        self.enable_capture()
    }

    /// Stop capture and wait until all internal pipelines are drained.
    pub fn disable(&mut self) -> Result<(), CoreSightError> {
        self.disable_capture()?;
        self.cs.wait(
            self.device,
            Status::ADDRESS,
            Status::READY_MASK,
            WaitBits::AllOne,
        )?;
        Ok(())
    }

    /// Attempt to read a value out of the trace memory.
    pub fn read(&mut self) -> Result<Option<u32>, CoreSightError> {
        match self.cs.read(self.device, REGISTER_OFFSET_RRD)? {
            // The register has a sentinel value to indicate no more data is available.
            RRD_EMPTY => Ok(None),

            value => Ok(Some(value)),
        }
    }

    /// Check if the trace memory is full. In circular buffer mode this means it has wrapped.
    pub fn full(&mut self) -> Result<bool, CoreSightError> {
        let status = Status::load(self.cs, self.device)?;
        Ok(status.full())
    }

    /// Whether a trigger was seen since capture was enabled. Only circular buffers trigger.
    pub fn triggered(&mut self) -> Result<bool, CoreSightError> {
        Ok(Status::load(self.cs, self.device)?.trigd())
    }

    /// Get the size of the trace memory in bytes.
    pub fn buffer_size(&mut self) -> Result<u32, CoreSightError> {
        let size_words = self.cs.read(self.device, REGISTER_OFFSET_RSZ)?;
        Ok(size_words * core::mem::size_of::<u32>() as u32)
    }

    /// Number of words captured after a trigger event before capture stops.
    pub fn set_trigger_counter(&mut self, words: u32) -> Result<(), CoreSightError> {
        self.cs.write(self.device, REGISTER_OFFSET_TRG, words)
    }

    /// Configure the capture stop-on-flush semantics. Returns the new FFCR value.
    ///
    /// # Args
    /// * `stop` - Specified true if the capture should stop on flush events.
    pub fn stop_on_flush(&mut self, stop: bool) -> Result<u32, CoreSightError> {
        let mut ffcr = FormatFlushControl::load(self.cs, self.device)?;
        ffcr.set_stoponfl(stop);
        ffcr.store(self.cs, self.device)?;
        Ok(ffcr.into())
    }

    /// Generate a manual flush event.
    pub fn manual_flush(&mut self) -> Result<(), CoreSightError> {
        let mut ffcr = FormatFlushControl::load(self.cs, self.device)?;
        ffcr.set_flushman(true);
        ffcr.store(self.cs, self.device)
    }

    /// Flush and wait for the formatter to stop. Only stops if stop-on-flush is set.
    pub fn flush_and_wait_stop(&mut self) -> Result<FlushOutcome, CoreSightError> {
        self.manual_flush()?;
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

    /// Number of bytes of trace waiting to be read after a circular buffer capture.
    pub fn unread_bytes(&mut self) -> Result<u32, CoreSightError> {
        if self.full()? {
            return self.buffer_size();
        }
        let written = self.cs.read(self.device, REGISTER_OFFSET_RWP)?;
        let read = self.cs.read(self.device, REGISTER_OFFSET_RRP)?;
        Ok(written.saturating_sub(read))
    }

    /// Read back everything captured in circular buffer mode, oldest data first.
    ///
    /// # Note
    /// Capture has to be disabled.
    pub fn drain(&mut self) -> Result<Vec<u8>, CoreSightError> {
        let wrapped = self.full()?;
        let bytes = self.unread_bytes()?;
        if wrapped {
            // The oldest data sits right behind the write pointer.
            let write_pointer = self.cs.read(self.device, REGISTER_OFFSET_RWP)?;
            self.cs.write(self.device, REGISTER_OFFSET_RRP, write_pointer)?;
        }

        let words = bytes as usize / core::mem::size_of::<u32>();
        let mut data = Vec::with_capacity(bytes as usize);
        for _ in 0..words {
            match self.read()? {
                Some(word) => data.extend_from_slice(&word.to_le_bytes()),
                None => break,
            }
        }
        log::debug!("Read {} of {} bytes of trace", data.len(), bytes);
        Ok(data)
    }

    fn enable_formatter(&mut self) -> Result<(), CoreSightError> {
        let mut ffcr = FormatFlushControl::load(self.cs, self.device)?;
        ffcr.set_enft(true);
        ffcr.set_enti(true);
        ffcr.store(self.cs, self.device)
    }
}

register! {
    pub struct FormatFlushControl(0x304, "TMC_FFCR");

    pub stoponfl, set_stoponfl: 12;
    pub flushman, set_flushman: 6;
    pub enti, set_enti: 1;
    pub enft, set_enft: 0;
}

impl FormatFlushControl {
    pub const STOP_ON_FLUSH: u32 = 1 << 12;
}

register! {
    pub struct FormatFlushStatus(0x300, "TMC_FFSR");

    pub ftstopped, _: 1;
}

impl FormatFlushStatus {
    pub const STOPPED_MASK: u32 = 1 << 1;
}

register! {
    pub struct Status(0xC, "TMC_STS");

    pub ready, _: 2;
    pub trigd, _: 1;
    pub full, _: 0;
}

impl Status {
    pub const READY_MASK: u32 = 1 << 2;
    pub const FULL_MASK: u32 = 1 << 0;
}

register! {
    pub struct EtfMode(0x28, "TMC_MODE");

    // The Mode register configures the operational mode of the trace memory.
    pub u8, mode, set_mode: 1, 0;
}
