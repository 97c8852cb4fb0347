//! Cross trigger interface wiring.
//!
//! The trigger signals of trace components are hard wired to CTI trigger inputs and outputs.
//! The wiring cannot be discovered, so boards describe it here.
use std::fmt;

use super::{CoreSightError, DeviceId, DeviceKind, Registry};

const CTI_TRIGGERS: u8 = 8;

/// Trigger signals of the components wired to a CTI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerSignal {
    EtbFull,
    EtbAcqComplete,
    EtbFlushIn,
    EtbTrigIn,
    TpiuFlushIn,
    TpiuTrigIn,
    StmTrigOutSpte,
    StmTrigOutSw,
    StmTrigOutHete,
    StmAsyncOut,
    StmHwEvent(u8),
}

impl fmt::Display for TriggerSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerSignal::EtbFull => f.write_str("FULL"),
            TriggerSignal::EtbAcqComplete => f.write_str("ACQCOMP"),
            TriggerSignal::EtbFlushIn | TriggerSignal::TpiuFlushIn => f.write_str("FLUSHIN"),
            TriggerSignal::EtbTrigIn | TriggerSignal::TpiuTrigIn => f.write_str("TRIGIN"),
            TriggerSignal::StmTrigOutSpte => f.write_str("TRIGOUTSPTE"),
            TriggerSignal::StmTrigOutSw => f.write_str("TRIGOUTSW"),
            TriggerSignal::StmTrigOutHete => f.write_str("TRIGOUTHETE"),
            TriggerSignal::StmAsyncOut => f.write_str("ASYNCOUT"),
            TriggerSignal::StmHwEvent(n) => write!(f, "HWEVENT{}", n),
        }
    }
}

/// A numbered trigger input or output of a CTI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CtiTrigger {
    pub cti: DeviceId,
    pub index: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerConnection {
    /// A component output signal drives a CTI trigger input.
    Source {
        device: DeviceId,
        signal: TriggerSignal,
        trigin: CtiTrigger,
    },
    /// A CTI trigger output drives a component input signal.
    Destination {
        trigout: CtiTrigger,
        device: DeviceId,
        signal: TriggerSignal,
    },
}

impl Registry {
    /// Trigger input `index` of `cti`.
    pub fn cti_trigsrc(&self, cti: DeviceId, index: u8) -> Result<CtiTrigger, CoreSightError> {
        self.cti_trigger(cti, index)
    }

    /// Trigger output `index` of `cti`.
    pub fn cti_trigdst(&self, cti: DeviceId, index: u8) -> Result<CtiTrigger, CoreSightError> {
        self.cti_trigger(cti, index)
    }

    /// Record that `signal` of `device` drives `trigin`.
    pub fn cti_connect_trigsrc(&mut self, device: DeviceId, signal: TriggerSignal, trigin: CtiTrigger) {
        self.triggers.push(TriggerConnection::Source {
            device,
            signal,
            trigin,
        });
    }

    /// Record that `trigout` drives `signal` of `device`.
    pub fn cti_connect_trigdst(&mut self, trigout: CtiTrigger, device: DeviceId, signal: TriggerSignal) {
        self.triggers.push(TriggerConnection::Destination {
            trigout,
            device,
            signal,
        });
    }

    pub fn trigger_connections(&self) -> &[TriggerConnection] {
        &self.triggers
    }

    /// Human readable listing of the trigger wiring.
    pub fn describe_triggers(&self) -> Vec<String> {
        self.triggers
            .iter()
            .map(|connection| match *connection {
                TriggerConnection::Source {
                    device,
                    signal,
                    trigin,
                } => format!(
                    "{} {:#010x} {} -> CTI {:#010x} TRIGIN{}",
                    self.kind(device),
                    self.base(device),
                    signal,
                    self.base(trigin.cti),
                    trigin.index
                ),
                TriggerConnection::Destination {
                    trigout,
                    device,
                    signal,
                } => format!(
                    "CTI {:#010x} TRIGOUT{} -> {} {:#010x} {}",
                    self.base(trigout.cti),
                    trigout.index,
                    self.kind(device),
                    self.base(device),
                    signal
                ),
            })
            .collect()
    }

    fn cti_trigger(&self, cti: DeviceId, index: u8) -> Result<CtiTrigger, CoreSightError> {
        self.expect_kind(cti, DeviceKind::Cti, "a cross trigger interface")?;
        if index >= CTI_TRIGGERS {
            return Err(CoreSightError::InvalidPort {
                base: self.base(cti),
                kind: DeviceKind::Cti,
                port: index,
            });
        }
        Ok(CtiTrigger { cti, index })
    }
}
