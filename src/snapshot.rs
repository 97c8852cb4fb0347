//! Trace snapshots for offline decoding.
//!
//! A snapshot is a directory of ini files that describes the trace session well enough for a
//! decoder to interpret the captured trace without access to the target: the cores, the ETM
//! programming, which buffer holds the trace of which source, and a dump of the traced code.
use std::fs;
use std::io;
use std::path::Path;

use crate::access::{AccessError, MemoryAccess};
use crate::board::{Board, Devices, CORTEX_A53, CORTEX_R5};
use crate::coresight::etm::EtmV4;
use crate::coresight::{CoreSight, CoreSightError, DeviceClass};

pub const SNAPSHOT_FILE: &str = "snapshot.ini";
pub const TRACE_FILE: &str = "trace.ini";
pub const BUFFER_FILE: &str = "trace.bin";
pub const DUMP_FILE: &str = "kernel_dump.bin";

const BUFFER_NAME: &str = "ETB_0";
/// Largest memory dump written to a snapshot.
pub const MAX_DUMP_BYTES: u64 = 16 << 20;

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("failed to write snapshot file")]
    Io(#[from] io::Error),
    #[error(transparent)]
    CoreSight(#[from] CoreSightError),
    #[error("failed to read traced memory")]
    Access(#[from] AccessError),
    #[error("dump of {start:#x}..{end:#x} exceeds {} bytes", MAX_DUMP_BYTES)]
    DumpTooLarge { start: u64, end: u64 },
}

fn core_name(cpu_id: u32) -> &'static str {
    match cpu_id {
        CORTEX_A53 => "Cortex-A53",
        CORTEX_R5 => "Cortex-R5",
        _ => "unknown",
    }
}

/// Describe the session of `cpu` in `dir`. With a `dump_range` the memory between the two
/// addresses is saved as well.
pub fn write_config<M: MemoryAccess>(
    dir: &Path,
    cs: &mut CoreSight<M>,
    board: &Board,
    devices: &Devices,
    cpu: usize,
    dump_range: Option<(u64, u64)>,
) -> Result<(), SnapshotError> {
    fs::create_dir_all(dir)?;

    let etm = cs.registry().cpu_device(cpu, DeviceClass::SOURCE)?;
    let etm_name = format!("ETM_{}", cpu);
    let cpu_name = format!("cpu_{}", cpu);

    let snapshot = format!(
        "[snapshot]\nversion=1.0\ndescription={}\n\n\
         [device_list]\ndevice0={}.ini\ndevice1=device_1.ini\n\n\
         [trace]\nmetadata={}\n",
        board.hardware, cpu_name, TRACE_FILE
    );
    fs::write(dir.join(SNAPSHOT_FILE), snapshot)?;

    let cpu_id = devices.cpu_id.get(cpu).copied().unwrap_or_default();
    let mut core = format!(
        "[device]\nname={}\nclass=core\ntype={}\n\n[regs]\nPC(size:64)=0x0\n",
        cpu_name,
        core_name(cpu_id)
    );
    if let Some((start, end)) = dump_range {
        let dump = read_range(cs, start, end)?;
        fs::write(dir.join(DUMP_FILE), &dump)?;
        core.push_str(&format!(
            "\n[dump1]\nfile={}\naddress={:#018x}\nlength={:#x}\n",
            DUMP_FILE,
            start & !0x3,
            dump.len()
        ));
    }
    fs::write(dir.join(format!("{}.ini", cpu_name)), core)?;

    let mut device = format!(
        "[device]\nname={}\nclass=trace_source\ntype=ETM4\n\n[regs]\n",
        etm_name
    );
    for (name, value) in EtmV4::new(cs, etm)?.decoder_registers()? {
        device.push_str(&format!("{}={:#010x}\n", name, value));
    }
    fs::write(dir.join("device_1.ini"), device)?;

    let trace = format!(
        "[trace_buffers]\nbuffers=buffer0\n\n\
         [buffer0]\nname={buffer}\nfile={}\nformat=coresight\n\n\
         [source_buffers]\n{etm}={buffer}\n\n\
         [core_trace_sources]\n{}={etm}\n",
        BUFFER_FILE,
        cpu_name,
        buffer = BUFFER_NAME,
        etm = etm_name
    );
    fs::write(dir.join(TRACE_FILE), trace)?;

    log::info!("Snapshot of CPU #{} written to {}", cpu, dir.display());
    Ok(())
}

/// Store the trace captured in the session.
pub fn write_buffer(dir: &Path, trace: &[u8]) -> Result<(), SnapshotError> {
    fs::write(dir.join(BUFFER_FILE), trace)?;
    Ok(())
}

fn read_range<M: MemoryAccess>(
    cs: &mut CoreSight<M>,
    start: u64,
    end: u64,
) -> Result<Vec<u8>, SnapshotError> {
    let mut address = start & !0x3;
    if end.saturating_sub(address) > MAX_DUMP_BYTES {
        return Err(SnapshotError::DumpTooLarge { start, end });
    }

    let mut data = Vec::new();
    while address < end {
        let word = cs.memory_mut().read_word_32(address)?;
        data.extend_from_slice(&word.to_le_bytes());
        address = match address.checked_add(4) {
            Some(next) => next,
            None => break,
        };
    }
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::SimulatedMemory;
    use crate::board::{self, ZYNQUS_NAME};
    use crate::coresight::Registry;

    fn zynqus() -> (CoreSight<SimulatedMemory>, &'static Board, Devices) {
        let mut registry = Registry::new();
        let (board, devices) = board::setup_known_board_by_name(ZYNQUS_NAME, &mut registry).unwrap();
        let memory = board::simulator(&registry, &devices);
        (CoreSight::new(memory, registry), board, devices)
    }

    #[test]
    fn snapshot_describes_the_session() {
        let dir = tempfile::tempdir().unwrap();
        let (mut cs, board, devices) = zynqus();

        write_config(dir.path(), &mut cs, board, &devices, 1, None).unwrap();

        let snapshot = fs::read_to_string(dir.path().join(SNAPSHOT_FILE)).unwrap();
        assert!(snapshot.contains("device0=cpu_1.ini"));
        assert!(snapshot.contains("metadata=trace.ini"));

        let core = fs::read_to_string(dir.path().join("cpu_1.ini")).unwrap();
        assert!(core.contains("type=Cortex-A53"));
        assert!(!core.contains("[dump1]"));

        let trace = fs::read_to_string(dir.path().join(TRACE_FILE)).unwrap();
        assert!(trace.contains("ETM_1=ETB_0"));
        assert!(trace.contains("cpu_1=ETM_1"));
    }

    #[test]
    fn etm_registers_are_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let (mut cs, board, devices) = zynqus();
        cs.memory_mut().preset(0xFEC4_0040, 0x10);

        write_config(dir.path(), &mut cs, board, &devices, 0, None).unwrap();

        let device = fs::read_to_string(dir.path().join("device_1.ini")).unwrap();
        assert!(device.contains("type=ETM4"));
        assert!(device.contains("TRCTRACEIDR=0x00000010"));
        assert!(device.contains("TRCIDR1=0x4100f401"));
        assert!(device.contains("TRCAUTHSTATUS=0x000000cc"));
    }

    #[test]
    fn traced_range_is_dumped() {
        let dir = tempfile::tempdir().unwrap();
        let (mut cs, board, devices) = zynqus();
        cs.memory_mut()
            .preset(0x15A1C, 0xD503_201F)
            .preset(0x15A20, 0x1400_0000);

        write_config(dir.path(), &mut cs, board, &devices, 0, Some((0x15A1C, 0x15A24))).unwrap();

        let dump = fs::read(dir.path().join(DUMP_FILE)).unwrap();
        assert_eq!(dump, [0x1F, 0x20, 0x03, 0xD5, 0x00, 0x00, 0x00, 0x14]);
        let core = fs::read_to_string(dir.path().join("cpu_0.ini")).unwrap();
        assert!(core.contains("address=0x0000000000015a1c"));
        assert!(core.contains("length=0x8"));
    }

    #[test]
    fn oversized_dump_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let (mut cs, board, devices) = zynqus();

        let result = write_config(dir.path(), &mut cs, board, &devices, 0, Some((0, u64::MAX)));
        assert!(matches!(result, Err(SnapshotError::DumpTooLarge { start: 0, end: u64::MAX })));
        assert!(!dir.path().join(DUMP_FILE).exists());
    }

    #[test]
    fn dump_stops_at_the_end_of_the_address_space() {
        let (mut cs, _, _) = zynqus();
        cs.memory_mut().preset(u64::MAX - 3, 0x1234_5678);

        let dump = read_range(&mut cs, u64::MAX - 7, u64::MAX).unwrap();
        assert_eq!(dump, [0, 0, 0, 0, 0x78, 0x56, 0x34, 0x12]);
    }
}
