//! Machine core: wires the Z80, memory, clock, Beta Disk controller,
//! profiler and recording hook together, and runs the emulation loop
//! on a background thread driven by commands from the shell.

pub mod clock;
pub mod memory;
pub mod profiler;
pub mod z80;

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use log::{info, warn};

use crate::config::Config;
use crate::fdc::trd::{InterleavePattern, LoaderTrd};
use crate::fdc::wd1793::{Wd1793, PORT_CMD, PORT_DAT, PORT_SEC, PORT_SYS, PORT_TRK};
use crate::features::{self, FeatureRegistry};
use crate::message_center::MessageCenter;
use crate::recording::RecordingManager;
use clock::{Clock, FRAMES_PER_SECOND};
use memory::Memory;
use profiler::OpcodeProfiler;
use z80::{Bus, Z80};

/// INT line is held for this many T-states at each frame start.
pub const INT_LENGTH_TSTATES: u32 = 32;

/// Spectrum screen bitmap + attributes, resident at the start of RAM
/// page 5.
const SCREEN_BYTES: usize = 6912;

/// The CPU-visible bus: memory plus the I/O port map.
struct MachineBus<'a> {
    memory: &'a mut Memory,
    fdc: &'a mut Wd1793,
    now: u64,
}

impl Bus for MachineBus<'_> {
    fn read(&mut self, addr: u16) -> u8 {
        self.memory.read(addr)
    }

    fn write(&mut self, addr: u16, value: u8) {
        self.memory.write(addr, value);
    }

    fn io_read(&mut self, port: u16) -> u8 {
        match port & 0x00FF {
            low @ (PORT_CMD | PORT_TRK | PORT_SEC | PORT_DAT | PORT_SYS) => {
                self.fdc.port_in(low, self.now)
            }
            _ => 0xFF, // Undecoded ports float high
        }
    }

    fn io_write(&mut self, port: u16, value: u8) {
        // 128K memory paging port
        if port & 0x8002 == 0 {
            self.memory.select_ram_page(3, (value & 0x07) as usize);
            self.memory.select_rom_page(((value >> 4) & 0x01) as usize);
            return;
        }

        match port & 0x00FF {
            low @ (PORT_CMD | PORT_TRK | PORT_SEC | PORT_DAT | PORT_SYS) => {
                self.fdc.port_out(low, value, self.now);
            }
            _ => {}
        }
    }
}

/// Snapshot of machine state for the shell.
#[derive(Debug, Clone)]
pub struct MachineStatus {
    pub frame: u32,
    pub tstates: u64,
    pub paused: bool,
    pub pc: u16,
    pub banks: [String; 4],
    pub selected_drive: usize,
    pub drive_track: u8,
    pub disk_inserted: bool,
    pub disk_path: String,
    pub fdc_status: u8,
    pub fdc_state: String,
    pub fdc_sleeping: bool,
    pub shared_memory: Option<String>,
    pub recording: bool,
}

/// Commands from the shell to the emulation thread.
#[derive(Debug)]
pub enum EmuCmd {
    Pause,
    Resume,
    Reset,
    InsertDisk { drive: u8, path: PathBuf },
    EjectDisk { drive: u8 },
    StartRecording { path: String },
    StopRecording,
    Query(Sender<MachineStatus>),
    Quit,
}

pub struct Machine {
    pub clock: Clock,
    pub memory: Memory,
    pub cpu: Z80,
    pub fdc: Wd1793,
    pub profiler: Arc<OpcodeProfiler>,
    pub recording: RecordingManager,
    features: Arc<FeatureRegistry>,
    interleave: InterleavePattern,
    paused: bool,

    // Cached feature flags, refreshed on generation change only
    feature_generation: u64,
    profiler_enabled: bool,
}

impl Machine {
    pub fn new(
        emulator_id: &str,
        features: Arc<FeatureRegistry>,
        message_center: MessageCenter,
        config: &Config,
    ) -> Self {
        let mut machine = Self {
            clock: Clock::new(),
            memory: Memory::new(),
            cpu: Z80::new(),
            fdc: Wd1793::new(emulator_id, message_center),
            profiler: Arc::new(OpcodeProfiler::new()),
            recording: RecordingManager::new(Arc::clone(&features)),
            features,
            interleave: InterleavePattern::from_index(config.trdos_interleave),
            paused: false,
            feature_generation: u64::MAX,
            profiler_enabled: false,
        };
        machine.refresh_feature_cache();
        machine
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
    }

    pub fn reset(&mut self) {
        self.cpu.reset();
        self.fdc.reset();
        self.clock.reset();
        info!("machine: reset");
    }

    /// Re-read feature toggles after a registry change. Never called
    /// per instruction; the generation counter makes the check cheap.
    pub fn refresh_feature_cache(&mut self) {
        let generation = self.features.generation();
        if generation == self.feature_generation {
            return;
        }
        self.feature_generation = generation;

        self.profiler_enabled = self.features.is_enabled(features::OPCODE_PROFILER);

        let want_shared = self.features.is_enabled(features::SHARED_MEMORY);
        if want_shared != self.memory.is_shared() {
            self.memory.set_shared(want_shared);
        }
    }

    /// Execute one instruction (or accept an interrupt) and run the
    /// clocked peripherals forward. Returns T-states elapsed.
    pub fn step(&mut self) -> u32 {
        let now = self.clock.now();

        // INT window at frame start
        let mut cycles = 0;
        let mut ran_instruction = false;
        if self.clock.frame_t() < INT_LENGTH_TSTATES && self.cpu.interrupts_enabled() {
            let mut bus = MachineBus {
                memory: &mut self.memory,
                fdc: &mut self.fdc,
                now,
            };
            cycles = self.cpu.take_interrupt(&mut bus);
        }

        if cycles == 0 {
            let mut bus = MachineBus {
                memory: &mut self.memory,
                fdc: &mut self.fdc,
                now,
            };
            cycles = self.cpu.step(&mut bus);
            ran_instruction = true;
        }

        let frames = self.clock.advance(cycles);

        if self.profiler_enabled && ran_instruction {
            let (pc, prefix, opcode) = self.cpu.last_instruction();
            self.profiler.log(
                pc,
                prefix,
                opcode,
                self.cpu.f,
                self.cpu.a,
                self.clock.frame_counter(),
                self.clock.frame_t(),
            );
        }

        self.fdc.handle_step(self.clock.now());

        for _ in 0..frames {
            self.on_frame_end();
        }

        cycles
    }

    /// Run a full frame's worth of T-states.
    pub fn run_frame(&mut self) {
        let target = self.clock.frame_counter().wrapping_add(1);
        while self.clock.frame_counter() != target {
            self.step();
        }
    }

    fn on_frame_end(&mut self) {
        self.fdc.handle_frame_end(self.clock.now());

        if self.recording.is_recording() {
            let frame = self.memory.ram_page(5)[..SCREEN_BYTES].to_vec();
            self.recording.capture_frame(&frame);
        }

        self.refresh_feature_cache();
    }

    // ── Disk handling ──────────────────────────────────────────

    pub fn insert_disk(&mut self, drive: u8, path: &PathBuf) -> bool {
        let loader = LoaderTrd::new(self.interleave);
        match loader.load_image(path) {
            Ok(image) => {
                match self.fdc.drive_at_mut(drive as usize) {
                    Some(fdd) => {
                        fdd.insert_disk(Some(image));
                        true
                    }
                    None => {
                        warn!("machine: no drive {drive}");
                        false
                    }
                }
            }
            Err(e) => {
                warn!("machine: cannot load {}: {e}", path.display());
                false
            }
        }
    }

    pub fn eject_disk(&mut self, drive: u8) -> bool {
        match self.fdc.drive_at_mut(drive as usize) {
            Some(fdd) => fdd.eject_disk().is_some(),
            None => false,
        }
    }

    pub fn status(&self) -> MachineStatus {
        let drive = self.fdc.drive();
        MachineStatus {
            frame: self.clock.frame_counter(),
            tstates: self.clock.now(),
            paused: self.paused,
            pc: self.cpu.pc,
            banks: [
                self.memory.current_bank_name(0),
                self.memory.current_bank_name(1),
                self.memory.current_bank_name(2),
                self.memory.current_bank_name(3),
            ],
            selected_drive: self.fdc.selected_drive_index(),
            drive_track: drive.track(),
            disk_inserted: drive.is_disk_inserted(),
            disk_path: drive
                .disk()
                .map(|d| d.file_path.clone())
                .unwrap_or_default(),
            fdc_status: self.fdc.status_register(),
            fdc_state: format!("{:?}", self.fdc.state()),
            fdc_sleeping: self.fdc.is_sleeping(),
            shared_memory: self.memory.shared_name().map(str::to_string),
            recording: self.recording.is_recording(),
        }
    }
}

/// Apply one shell command. Returns false when the thread should exit.
fn handle_cmd(machine: &mut Machine, cmd: EmuCmd) -> bool {
    match cmd {
        EmuCmd::Pause => machine.set_paused(true),
        EmuCmd::Resume => machine.set_paused(false),
        EmuCmd::Reset => machine.reset(),
        EmuCmd::InsertDisk { drive, path } => {
            machine.insert_disk(drive, &path);
        }
        EmuCmd::EjectDisk { drive } => {
            machine.eject_disk(drive);
        }
        EmuCmd::StartRecording { path } => {
            machine.recording.start_recording(&path, "h264", "aac", 0, 0);
        }
        EmuCmd::StopRecording => machine.recording.stop_recording(),
        EmuCmd::Query(reply) => {
            let _ = reply.send(machine.status());
        }
        EmuCmd::Quit => {
            machine.recording.stop_recording();
            info!("machine: shutting down");
            return false;
        }
    }
    true
}

/// Emulation thread main loop: drains commands, runs frames, paces to
/// real time unless turbo is requested.
pub fn run_machine_thread(mut machine: Machine, cmd_rx: Receiver<EmuCmd>, turbo: bool) {
    let frame_duration = Duration::from_secs_f64(1.0 / FRAMES_PER_SECOND);
    let mut next_deadline = Instant::now() + frame_duration;

    loop {
        while let Ok(cmd) = cmd_rx.try_recv() {
            if !handle_cmd(&mut machine, cmd) {
                return;
            }
        }

        if machine.is_paused() {
            // Stay responsive to commands while paused
            if let Ok(cmd) = cmd_rx.recv_timeout(Duration::from_millis(50)) {
                if !handle_cmd(&mut machine, cmd) {
                    return;
                }
            }
            next_deadline = Instant::now() + frame_duration;
            continue;
        }

        machine.run_frame();

        if !turbo {
            let now = Instant::now();
            if next_deadline > now {
                // Sleep the bulk, spin the last stretch for accuracy
                let remaining = next_deadline - now;
                if remaining > Duration::from_millis(2) {
                    thread::sleep(remaining - Duration::from_millis(1));
                }
                while Instant::now() < next_deadline {
                    std::hint::spin_loop();
                }
            }
            next_deadline += frame_duration;
        }
    }
}

/// Spawn the emulation thread.
pub fn spawn_machine(
    machine: Machine,
    cmd_rx: Receiver<EmuCmd>,
    turbo: bool,
) -> thread::JoinHandle<()> {
    thread::Builder::new()
        .name("machine".into())
        .spawn(move || run_machine_thread(machine, cmd_rx, turbo))
        .expect("spawn machine thread")
}
