//! Software instrumentation through the STM: a fixed string is written to a stimulus port over
//! and over.
use crate::access::MemoryAccess;
use crate::coresight::stm::{Stm, StmConfig};
use crate::coresight::{CoreSight, CoreSightError, DeviceId};

pub const MESSAGE: &str = "Cambridge\nCambridge\nCambridge\nCambridge";
pub const DEFAULT_REPETITIONS: usize = 65536;

/// Timestamp counter frequency. Decoders use it to convert timestamps to wall-clock time.
pub const TIMESTAMP_FREQUENCY: u32 = 250_000_000;
/// Synchronisation every 1024 bytes keeps the trace decodable after the buffer wraps.
pub const SYNC_FREQUENCY: u32 = 1024;
pub const TRACE_ID: u8 = 16;

/// STM settings of the Zynq UltraScale+.
pub fn platform_config() -> StmConfig {
    StmConfig {
        trace_id: TRACE_ID,
        timestamp_frequency: TIMESTAMP_FREQUENCY,
        sync_frequency: SYNC_FREQUENCY,
        compression: true,
        timestamps: true,
        port_enable: 0xFFFF_FFFF,
    }
}

/// Configure the STM and send [`MESSAGE`] `repetitions` times on `channel`.
pub fn string_example<M: MemoryAccess>(
    cs: &mut CoreSight<M>,
    stm: DeviceId,
    channel: u16,
    repetitions: usize,
) -> Result<(), CoreSightError> {
    let mut stm = Stm::new(cs, stm)?;
    stm.configure(&platform_config())?;

    println!("Sending string to STM...");
    for _ in 0..repetitions {
        stm.send_string(channel, MESSAGE.as_bytes())?;
    }
    println!("Stop sending string to STM...");

    cs.checkpoint()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::sim::Access;
    use crate::access::SimulatedMemory;
    use crate::board::{self, ZYNQUS_NAME};
    use crate::coresight::stm::{port, CHANNEL_SIZE};
    use crate::coresight::Registry;

    fn zynqus() -> (CoreSight<SimulatedMemory>, DeviceId) {
        let mut registry = Registry::new();
        let (_, devices) = board::setup_known_board_by_name(ZYNQUS_NAME, &mut registry).unwrap();
        let memory = board::simulator(&registry, &devices);
        (CoreSight::new(memory, registry), devices.stm)
    }

    #[test]
    fn message_is_repeated_on_the_channel() {
        let (mut cs, stm) = zynqus();
        string_example(&mut cs, stm, 0, 3).unwrap();

        let bytes: Vec<(u64, u8)> = cs
            .memory()
            .accesses()
            .iter()
            .filter_map(|access| match *access {
                Access::WriteByte { address, value } => Some((address, value)),
                _ => None,
            })
            .collect();
        assert_eq!(bytes.len(), 3 * MESSAGE.len());

        let marked: Vec<usize> = bytes
            .iter()
            .enumerate()
            .filter(|(_, (address, _))| *address == 0xF800_0000 + port::G_DMTS)
            .map(|(n, _)| n)
            .collect();
        assert_eq!(marked, vec![MESSAGE.len() - 1, 2 * MESSAGE.len() - 1, 3 * MESSAGE.len() - 1]);

        let text: Vec<u8> = bytes.iter().take(MESSAGE.len()).map(|(_, value)| *value).collect();
        assert_eq!(text, MESSAGE.as_bytes());
    }

    #[test]
    fn stm_is_configured_before_sending() {
        let (mut cs, stm) = zynqus();
        string_example(&mut cs, stm, 5, 1).unwrap();

        let accesses = cs.memory().accesses();
        let control = accesses
            .iter()
            .position(|access| {
                *access
                    == Access::Write {
                        address: 0xFE9C_0E80,
                        value: 0x0010_0027,
                    }
            })
            .unwrap();
        let first_byte = accesses
            .iter()
            .position(|access| matches!(access, Access::WriteByte { .. }))
            .unwrap();
        assert!(control < first_byte);
        assert!(accesses.iter().any(|access| matches!(
            access,
            Access::WriteByte { address, .. } if *address == 0xF800_0000 + 5 * CHANNEL_SIZE + port::G_D
        )));
        assert_eq!(accesses.last(), Some(&Access::Flush));
    }
}
