//! Trace funnel driver.
//!
//! The funnel merges up to eight ATB inputs onto one output. Inputs are passed through only
//! while their slave port is enabled.
use super::{register, CoreSight, CoreSightError, DeviceId, DeviceKind, Register};
use crate::access::MemoryAccess;

pub struct TraceFunnel<'a, M> {
    cs: &'a mut CoreSight<M>,
    device: DeviceId,
}

impl<'a, M: MemoryAccess> TraceFunnel<'a, M> {
    pub fn new(cs: &'a mut CoreSight<M>, device: DeviceId) -> Result<Self, CoreSightError> {
        cs.registry()
            .expect_kind(device, DeviceKind::Funnel, "a trace funnel")?;
        Ok(Self { cs, device })
    }

    /// Enable input `port`, leaving the other inputs as they are.
    pub fn enable_port(&mut self, port: u8) -> Result<(), CoreSightError> {
        self.check_port(port)?;
        let mut control = Control::load(self.cs, self.device)?;
        control.set_slave_enable(control.enable_slave_port() | 1 << port);
        control.store(self.cs, self.device)
    }

    /// Disable input `port`, leaving the other inputs as they are.
    pub fn disable_port(&mut self, port: u8) -> Result<(), CoreSightError> {
        self.check_port(port)?;
        let mut control = Control::load(self.cs, self.device)?;
        control.set_slave_enable(control.enable_slave_port() & !(1 << port));
        control.store(self.cs, self.device)
    }

    /// Bit mask of the enabled inputs.
    pub fn enabled_ports(&mut self) -> Result<u8, CoreSightError> {
        Ok(Control::load(self.cs, self.device)?.enable_slave_port())
    }

    fn check_port(&self, port: u8) -> Result<(), CoreSightError> {
        if port >= DeviceKind::Funnel.input_ports() {
            return Err(CoreSightError::InvalidPort {
                base: self.cs.registry().base(self.device),
                kind: DeviceKind::Funnel,
                port,
            });
        }
        Ok(())
    }
}

register! {
    /// Funnel control register.
    pub struct Control(0x000, "CSTF_CTRL");

    // The minimum hold time specifies the number of transactions that the arbiter of the funnel
    // will perform on an individual active input before switching to the next port.
    pub u8, min_hold_time, set_min_hold_time: 11, 8;

    // One enable bit per funnel input port.
    pub u8, enable_slave_port, set_slave_enable: 7, 0;
}
