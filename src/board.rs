//! Known boards.
//!
//! A board is described by a registration function that fills a [`Registry`] with the
//! CoreSight devices of the SoC and returns the handles the demos need, keyed by role.
use crate::access::SimulatedMemory;
use crate::coresight::cti::TriggerSignal;
use crate::coresight::{model, CoreSightError, DeviceClass, DeviceId, DeviceKind, Registry};

/// Environment variable that selects a board by name.
pub const BOARD_ENV: &str = "CSAL_BOARD";

pub const ZYNQUS_NAME: &str = "Xilinx Zynq Ultrascale+ MPSoC";

/// Primary part numbers from the Main ID Register.
pub const CORTEX_A53: u32 = 0xD03;
pub const CORTEX_R5: u32 = 0xC15;

#[derive(Debug, thiserror::Error)]
pub enum BoardError {
    #[error("board \"{name}\" is not known, known boards: {known}")]
    Unknown { name: String, known: String },
    #[error("registration of \"{board}\" failed")]
    Registration {
        board: &'static str,
        #[source]
        source: CoreSightError,
    },
}

/// Static description of a board.
#[derive(Debug)]
pub struct Board {
    pub hardware: &'static str,
    pub n_cpu: usize,
    pub do_registration: fn(&mut Registry) -> Result<Devices, CoreSightError>,
}

/// Device handles of a registered board, keyed by their role in the demos.
#[derive(Debug, Clone)]
pub struct Devices {
    pub stm: DeviceId,
    pub fnl_a53: DeviceId,
    pub fnl_main: DeviceId,
    pub etf_a53: DeviceId,
    pub etf_main: DeviceId,
    pub replicator: DeviceId,
    pub etr: DeviceId,
    pub tpiu: DeviceId,
    pub cti: DeviceId,
    /// Dedicated buffer for the instrumentation trace, on boards that have one.
    pub itm_etb: Option<DeviceId>,
    pub cpu_id: Vec<u32>,
}

pub const KNOWN_BOARDS: &[Board] = &[Board {
    hardware: ZYNQUS_NAME,
    n_cpu: 6,
    do_registration: register_zynqus,
}];

const A53_0: usize = 0;
const A53_1: usize = 1;
const A53_2: usize = 2;
const A53_3: usize = 3;
const R5_0: usize = 4;
const R5_1: usize = 5;

fn register_zynqus(registry: &mut Registry) -> Result<Devices, CoreSightError> {
    log::info!("Registering CoreSight devices...");
    // R5 debug logic
    registry.exclude_range(0xFEBF_0000, 0xFEBF_7FFF);
    registry.register_romtable(0xFE80_0000);

    log::info!("Registering CPU affinities...");
    let per_cpu: [(DeviceKind, [(u64, usize); 6]); 2] = [
        (
            DeviceKind::Cti,
            [
                (0xFEBF_8000, R5_0),
                (0xFEBF_9000, R5_1),
                (0xFEC2_0000, A53_0),
                (0xFED2_0000, A53_1),
                (0xFEE2_0000, A53_2),
                (0xFEF2_0000, A53_3),
            ],
        ),
        (
            DeviceKind::Etm,
            [
                (0xFEBF_C000, R5_0),
                (0xFEBF_D000, R5_1),
                (0xFEC4_0000, A53_0),
                (0xFED4_0000, A53_1),
                (0xFEE4_0000, A53_2),
                (0xFEF4_0000, A53_3),
            ],
        ),
    ];
    for (kind, devices) in per_cpu {
        for (base, cpu) in devices {
            let device = registry.register(base, kind)?;
            registry.set_affinity(device, cpu);
        }
    }
    // The R5 cores have no PMU in the debug address map.
    for (base, cpu) in [
        (0xFEC3_0000, A53_0),
        (0xFED3_0000, A53_1),
        (0xFEE3_0000, A53_2),
        (0xFEF3_0000, A53_3),
    ] {
        let pmu = registry.register(base, DeviceKind::Pmu)?;
        registry.set_affinity(pmu, cpu);
    }

    log::info!("Registering trace-bus connections...");
    let fnl_a53 = registry.register(0xFE92_0000, DeviceKind::Funnel)?;
    let fnl_main = registry.register(0xFE93_0000, DeviceKind::Funnel)?;
    let etf_a53 = registry.register(0xFE94_0000, DeviceKind::Etf)?;
    let etf_main = registry.register(0xFE95_0000, DeviceKind::Etf)?;
    let replicator = registry.register(0xFE96_0000, DeviceKind::Replicator)?;
    let etr = registry.register(0xFE97_0000, DeviceKind::Etr)?;
    let tpiu = registry.register(0xFE98_0000, DeviceKind::Tpiu)?;
    let cti = registry.register(0xFE99_0000, DeviceKind::Cti)?;
    let stm = registry.register(0xFE9C_0000, DeviceKind::Stm)?;

    for (port, cpu) in [A53_0, A53_1, A53_2, A53_3].into_iter().enumerate() {
        let etm = registry.cpu_device(cpu, DeviceClass::SOURCE)?;
        registry.atb_register(etm, 0, fnl_a53, port as u8)?;
    }
    registry.atb_register(fnl_a53, 0, etf_a53, 0)?;
    registry.atb_register(etf_a53, 0, fnl_main, 2)?;
    registry.atb_register(fnl_main, 0, etf_main, 0)?;
    registry.atb_register(etf_main, 0, replicator, 0)?;
    registry.atb_register(replicator, 0, etr, 0)?;
    registry.atb_register(replicator, 1, tpiu, 0)?;

    // All cores see a single stimulus master; security state and core select the master ID
    // seen in the trace.
    registry.stm_config_master(stm, 0, 0xF800_0000)?;
    registry.stm_select_master(stm, 0)?;

    let sources = [
        (etf_main, TriggerSignal::EtbFull, 0),
        (etf_main, TriggerSignal::EtbAcqComplete, 1),
        (stm, TriggerSignal::StmTrigOutSpte, 4),
        (stm, TriggerSignal::StmTrigOutSw, 5),
        (stm, TriggerSignal::StmTrigOutHete, 6),
        (stm, TriggerSignal::StmAsyncOut, 7),
    ];
    for (device, signal, trigin) in sources {
        let trigin = registry.cti_trigsrc(cti, trigin)?;
        registry.cti_connect_trigsrc(device, signal, trigin);
    }

    // Rising and falling edges of CTI outputs 4 and 5 go to separate STM hardware events.
    let destinations = [
        (7, etf_main, TriggerSignal::EtbFlushIn),
        (6, etf_main, TriggerSignal::EtbTrigIn),
        (0, tpiu, TriggerSignal::TpiuFlushIn),
        (1, tpiu, TriggerSignal::TpiuTrigIn),
        (4, stm, TriggerSignal::StmHwEvent(0)),
        (4, stm, TriggerSignal::StmHwEvent(1)),
        (5, stm, TriggerSignal::StmHwEvent(2)),
        (5, stm, TriggerSignal::StmHwEvent(3)),
    ];
    for (trigout, device, signal) in destinations {
        let trigout = registry.cti_trigdst(cti, trigout)?;
        registry.cti_connect_trigdst(trigout, device, signal);
    }

    let mut cpu_id = vec![CORTEX_A53; 4];
    cpu_id.extend([CORTEX_R5; 2]);

    Ok(Devices {
        stm,
        fnl_a53,
        fnl_main,
        etf_a53,
        etf_main,
        replicator,
        etr,
        tpiu,
        cti,
        itm_etb: None,
        cpu_id,
    })
}

/// Find a known board by its hardware name. Exact matches win over case-insensitive ones.
pub fn find_board(name: &str) -> Option<&'static Board> {
    KNOWN_BOARDS
        .iter()
        .find(|board| board.hardware == name)
        .or_else(|| {
            KNOWN_BOARDS
                .iter()
                .find(|board| board.hardware.eq_ignore_ascii_case(name))
        })
}

/// Register the board called `name`.
pub fn setup_known_board_by_name(
    name: &str,
    registry: &mut Registry,
) -> Result<(&'static Board, Devices), BoardError> {
    let board = find_board(name).ok_or_else(|| BoardError::Unknown {
        name: name.to_string(),
        known: KNOWN_BOARDS
            .iter()
            .map(|board| format!("\"{}\"", board.hardware))
            .collect::<Vec<_>>()
            .join(", "),
    })?;

    log::info!("Using board \"{}\"", board.hardware);
    let devices = (board.do_registration)(registry).map_err(|source| BoardError::Registration {
        board: board.hardware,
        source,
    })?;
    Ok((board, devices))
}

/// Register the board named by `name`, falling back to the `CSAL_BOARD` environment variable
/// and finally to the Zynq UltraScale+.
pub fn setup_known_board(
    name: Option<&str>,
    registry: &mut Registry,
) -> Result<(&'static Board, Devices), BoardError> {
    let name = select_board(name, std::env::var(BOARD_ENV).ok());
    setup_known_board_by_name(&name, registry)
}

/// The board name to use given a command line choice and the value of `CSAL_BOARD`.
pub fn select_board(name: Option<&str>, env: Option<String>) -> String {
    name.map(str::to_string)
        .or(env)
        .unwrap_or_else(|| ZYNQUS_NAME.to_string())
}

/// A simulated address space for a registered board.
pub fn simulator(registry: &Registry, devices: &Devices) -> SimulatedMemory {
    let mut memory = SimulatedMemory::new();
    model::install(&mut memory, registry);
    // The A53 cluster ETF is 4KB, the main ETF 8KB.
    memory.preset(registry.base(devices.etf_a53) + 0x04, 0x400);
    memory.preset(registry.base(devices.etf_main) + 0x04, 0x800);
    memory
}
