//! Line-oriented command shell.
//!
//! Parses command lines and dispatches to the feature registry, the
//! opcode profiler and the emulation thread. Every command produces a
//! printable response; parse and dispatch failures come back as `Err`
//! so the caller can map them to a non-zero exit code.

use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Sender};

use crate::features::{self, FeatureRegistry};
use crate::machine::profiler::OpcodeProfiler;
use crate::machine::{EmuCmd, MachineStatus};

/// What the caller should do after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Continue,
    Quit,
}

pub struct Shell {
    features: Arc<FeatureRegistry>,
    profiler: Arc<OpcodeProfiler>,
    cmd_tx: Sender<EmuCmd>,
    emulators: Vec<String>,
    selected: usize,
}

impl Shell {
    pub fn new(
        features: Arc<FeatureRegistry>,
        profiler: Arc<OpcodeProfiler>,
        cmd_tx: Sender<EmuCmd>,
    ) -> Self {
        Self {
            features,
            profiler,
            cmd_tx,
            emulators: vec!["pentagon-128".to_string()],
            selected: 0,
        }
    }

    /// Execute one command line. `Ok` carries the response text and
    /// whether to keep going; `Err` carries a user-facing error.
    pub fn execute(&mut self, line: &str) -> Result<(Outcome, String), String> {
        let args: Vec<&str> = line.split_whitespace().collect();
        let Some(&command) = args.first() else {
            return Ok((Outcome::Continue, String::new()));
        };

        match command.to_ascii_lowercase().as_str() {
            "help" | "?" => Ok((Outcome::Continue, Self::help_text())),
            "quit" | "exit" => {
                let _ = self.cmd_tx.send(EmuCmd::Quit);
                Ok((Outcome::Quit, "Bye.".into()))
            }
            "list" => Ok((Outcome::Continue, self.cmd_list())),
            "select" => self.cmd_select(&args[1..]),
            "feature" => self.cmd_feature(&args[1..]),
            "profiler" => self.cmd_profiler(&args[1..]),
            "disk" => self.cmd_disk(&args[1..]),
            "mem" => self.cmd_mem(&args[1..]),
            "record" => self.cmd_record(&args[1..]),
            "pause" => {
                self.send(EmuCmd::Pause)?;
                Ok((Outcome::Continue, "Emulation paused.".into()))
            }
            "resume" => {
                self.send(EmuCmd::Resume)?;
                Ok((Outcome::Continue, "Emulation resumed.".into()))
            }
            "reset" => {
                self.send(EmuCmd::Reset)?;
                Ok((Outcome::Continue, "Machine reset.".into()))
            }
            "status" => {
                let status = self.query_status()?;
                Ok((Outcome::Continue, Self::format_status(&status)))
            }
            other => Err(format!("Unknown command '{other}'. Type 'help' for a list.")),
        }
    }

    fn send(&self, cmd: EmuCmd) -> Result<(), String> {
        self.cmd_tx
            .send(cmd)
            .map_err(|_| "Emulation thread is gone.".to_string())
    }

    fn query_status(&self) -> Result<MachineStatus, String> {
        let (reply_tx, reply_rx) = bounded(1);
        self.send(EmuCmd::Query(reply_tx))?;
        reply_rx
            .recv_timeout(Duration::from_secs(2))
            .map_err(|_| "Emulation thread did not answer.".to_string())
    }

    fn help_text() -> String {
        concat!(
            "Commands:\n",
            "  list                                   - list emulator instances\n",
            "  select <index>                         - select emulator instance\n",
            "  status                                 - machine status snapshot\n",
            "  feature list                           - list feature toggles\n",
            "  feature <id|alias> [on|off|mode <m>]   - show or change a feature\n",
            "  profiler opcode <action>               - opcode profiler control\n",
            "      actions: start pause resume stop clear status\n",
            "               counters [N]  trace [N]  save <path>\n",
            "  disk insert <drive> <path>             - load a TRD image\n",
            "  disk eject <drive>                     - eject disk\n",
            "  disk status                            - drive/controller state\n",
            "  mem banks                              - current memory banks\n",
            "  record start <path> | record stop      - recording control\n",
            "  pause | resume | reset                 - emulation control\n",
            "  quit                                   - leave\n",
        )
        .to_string()
    }

    // ── Emulator selection ─────────────────────────────────────

    fn cmd_list(&self) -> String {
        let mut out = String::new();
        for (i, name) in self.emulators.iter().enumerate() {
            let marker = if i == self.selected { '*' } else { ' ' };
            let _ = writeln!(out, "{marker} [{i}] {name}");
        }
        out
    }

    fn cmd_select(&mut self, args: &[&str]) -> Result<(Outcome, String), String> {
        let Some(index) = args.first() else {
            return Err("Usage: select <index>".into());
        };
        let index: usize = index
            .parse()
            .map_err(|_| format!("'{index}' is not an index"))?;
        if index >= self.emulators.len() {
            return Err(format!("No emulator with index {index}"));
        }
        self.selected = index;
        Ok((
            Outcome::Continue,
            format!("Selected [{index}] {}", self.emulators[index]),
        ))
    }

    // ── Features ───────────────────────────────────────────────

    fn cmd_feature(&self, args: &[&str]) -> Result<(Outcome, String), String> {
        let Some(&target) = args.first() else {
            return Err("Usage: feature <id|alias> [on|off|mode <name>] | feature list".into());
        };

        if target.eq_ignore_ascii_case("list") {
            let mut out = String::new();
            let _ = writeln!(out, "{:<16} {:<8} {:<6} {:<10} DESCRIPTION", "ID", "ALIAS", "STATE", "MODE");
            for info in self.features.list() {
                let _ = writeln!(
                    out,
                    "{:<16} {:<8} {:<6} {:<10} {}",
                    info.id,
                    info.alias,
                    if info.enabled { "on" } else { "off" },
                    info.mode,
                    info.description
                );
            }
            return Ok((Outcome::Continue, out));
        }

        match args.get(1).map(|s| s.to_ascii_lowercase()) {
            None => {
                let info = self
                    .features
                    .info(target)
                    .ok_or_else(|| format!("Unknown feature '{target}'"))?;
                Ok((
                    Outcome::Continue,
                    format!(
                        "{}: {} (mode: {}, allowed: {})",
                        info.id,
                        if info.enabled { "on" } else { "off" },
                        info.mode,
                        info.allowed_modes.join("/")
                    ),
                ))
            }
            Some(state) if state == "on" || state == "off" => {
                let enable = state == "on";
                if self.features.set(target, enable) {
                    Ok((Outcome::Continue, format!("Feature '{target}' {state}.")))
                } else {
                    Err(format!("Unknown feature '{target}'"))
                }
            }
            Some(word) if word == "mode" => {
                let Some(&mode) = args.get(2) else {
                    return Err("Usage: feature <id> mode <name>".into());
                };
                if self.features.set_mode(target, mode) {
                    Ok((
                        Outcome::Continue,
                        format!("Feature '{target}' mode set to '{mode}'."),
                    ))
                } else {
                    Err(format!(
                        "Cannot set mode '{mode}' on '{target}' (unknown feature or mode)"
                    ))
                }
            }
            Some(other) => Err(format!("Unknown feature action '{other}'")),
        }
    }

    // ── Profiler ───────────────────────────────────────────────

    fn cmd_profiler(&self, args: &[&str]) -> Result<(Outcome, String), String> {
        let Some(&kind) = args.first() else {
            return Err("Usage: profiler opcode <action>".into());
        };
        if !kind.eq_ignore_ascii_case("opcode") {
            return Err(format!("Unknown profiler type '{kind}' (only 'opcode' is available)"));
        }
        let Some(action) = args.get(1).map(|s| s.to_ascii_lowercase()) else {
            return Err("Usage: profiler opcode <start|pause|resume|stop|clear|status|counters [N]|trace [N]|save <path>>".into());
        };

        match action.as_str() {
            "start" => {
                if !self.features.is_enabled(features::OPCODE_PROFILER) {
                    return Err(
                        "OpcodeProfiler feature is disabled. Enable with 'feature opcodeprofiler on'"
                            .into(),
                    );
                }
                self.profiler.start();
                Ok((Outcome::Continue, "Opcode capture started (data cleared).".into()))
            }
            "pause" => {
                self.profiler.pause();
                Ok((Outcome::Continue, "Opcode capture paused. Data retained.".into()))
            }
            "resume" => {
                self.profiler.resume();
                Ok((Outcome::Continue, "Opcode capture resumed.".into()))
            }
            "stop" => {
                self.profiler.stop();
                Ok((Outcome::Continue, "Opcode capture stopped. Data retained.".into()))
            }
            "clear" => {
                self.profiler.clear();
                Ok((Outcome::Continue, "Profiler data cleared.".into()))
            }
            "status" => {
                let status = self.profiler.status();
                Ok((
                    Outcome::Continue,
                    format!(
                        "capturing: {}\ntotal_executions: {}\ntrace: {}/{}",
                        status.capturing,
                        status.total_executions,
                        status.trace_size,
                        status.trace_capacity
                    ),
                ))
            }
            "counters" => {
                let limit = parse_count(args.get(2), 50)?;
                let top = self.profiler.top(limit);
                if top.is_empty() {
                    return Ok((Outcome::Continue, "No executions recorded.".into()));
                }
                let mut out = String::new();
                let _ = writeln!(out, "{:<8} {:<8} {:<12} COUNT", "PREFIX", "OPCODE", "MNEMONIC");
                for c in top {
                    let _ = writeln!(
                        out,
                        "0x{:04x}   0x{:02x}     {:<12} {}",
                        c.prefix, c.opcode, c.mnemonic, c.count
                    );
                }
                Ok((Outcome::Continue, out))
            }
            "trace" => {
                let count = parse_count(args.get(2), 100)?;
                let trace = self.profiler.recent(count);
                if trace.is_empty() {
                    return Ok((Outcome::Continue, "Trace is empty.".into()));
                }
                let mut out = String::new();
                let _ = writeln!(
                    out,
                    "{:<5} {:<8} {:<8} {:<6} {:<6} {:<6} {:<8} T_STATE",
                    "IDX", "PC", "PREFIX", "OP", "FLAGS", "A", "FRAME"
                );
                for (i, t) in trace.iter().enumerate() {
                    let _ = writeln!(
                        out,
                        "-{:<4} 0x{:04x}   0x{:04x}   0x{:02x}   0x{:02x}   0x{:02x}   {:<8} {}",
                        i, t.pc, t.prefix, t.opcode, t.flags, t.a, t.frame, t.t_state
                    );
                }
                Ok((Outcome::Continue, out))
            }
            "save" => {
                let Some(&path) = args.get(2) else {
                    return Err("Usage: profiler opcode save <file-path>".into());
                };
                if self.profiler.save_to(std::path::Path::new(path)) {
                    Ok((Outcome::Continue, format!("Profiler data saved to {path}")))
                } else {
                    Err(format!("Cannot write profiler data to {path}"))
                }
            }
            other => Err(format!("Unknown profiler action '{other}'")),
        }
    }

    // ── Disk ───────────────────────────────────────────────────

    fn cmd_disk(&self, args: &[&str]) -> Result<(Outcome, String), String> {
        let Some(action) = args.first().map(|s| s.to_ascii_lowercase()) else {
            return Err("Usage: disk <insert|eject|status> ...".into());
        };

        match action.as_str() {
            "insert" => {
                let (drive, path) = match args {
                    [_, drive, path] => (parse_drive(drive)?, PathBuf::from(path)),
                    _ => return Err("Usage: disk insert <drive 0-3> <path>".into()),
                };
                self.send(EmuCmd::InsertDisk { drive, path: path.clone() })?;
                Ok((
                    Outcome::Continue,
                    format!("Inserting {} into drive {drive}.", path.display()),
                ))
            }
            "eject" => {
                let drive = match args {
                    [_, drive] => parse_drive(drive)?,
                    _ => return Err("Usage: disk eject <drive 0-3>".into()),
                };
                self.send(EmuCmd::EjectDisk { drive })?;
                Ok((Outcome::Continue, format!("Ejecting drive {drive}.")))
            }
            "status" => {
                let status = self.query_status()?;
                let mut out = String::new();
                let _ = writeln!(out, "drive:     {} (track {})", status.selected_drive, status.drive_track);
                let _ = writeln!(
                    out,
                    "disk:      {}",
                    if status.disk_inserted {
                        status.disk_path.as_str()
                    } else {
                        "<none>"
                    }
                );
                let _ = writeln!(out, "fdc state: {}", status.fdc_state);
                let _ = writeln!(out, "fdc stat:  0b{:08b}", status.fdc_status);
                let _ = writeln!(out, "sleeping:  {}", status.fdc_sleeping);
                Ok((Outcome::Continue, out))
            }
            other => Err(format!("Unknown disk action '{other}'")),
        }
    }

    // ── Memory / recording ─────────────────────────────────────

    fn cmd_mem(&self, args: &[&str]) -> Result<(Outcome, String), String> {
        match args.first().map(|s| s.to_ascii_lowercase()).as_deref() {
            Some("banks") => {
                let status = self.query_status()?;
                let mut out = String::new();
                for (slot, bank) in status.banks.iter().enumerate() {
                    let _ = writeln!(out, "slot {slot} (0x{:04X}): {bank}", slot * 0x4000);
                }
                if let Some(name) = &status.shared_memory {
                    let _ = writeln!(out, "shared region: {name}");
                }
                Ok((Outcome::Continue, out))
            }
            _ => Err("Usage: mem banks".into()),
        }
    }

    fn cmd_record(&self, args: &[&str]) -> Result<(Outcome, String), String> {
        match args.first().map(|s| s.to_ascii_lowercase()).as_deref() {
            Some("start") => {
                let Some(&path) = args.get(1) else {
                    return Err("Usage: record start <path>".into());
                };
                if !self.features.is_enabled(features::RECORDING) {
                    return Err(
                        "Recording feature is disabled. Enable with 'feature recording on'".into(),
                    );
                }
                self.send(EmuCmd::StartRecording { path: path.to_string() })?;
                Ok((Outcome::Continue, format!("Recording to {path}.")))
            }
            Some("stop") => {
                self.send(EmuCmd::StopRecording)?;
                Ok((Outcome::Continue, "Recording stopped.".into()))
            }
            _ => Err("Usage: record <start <path>|stop>".into()),
        }
    }

    fn format_status(status: &MachineStatus) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "frame:    {}", status.frame);
        let _ = writeln!(out, "t-states: {}", status.tstates);
        let _ = writeln!(out, "pc:       0x{:04X}", status.pc);
        let _ = writeln!(out, "paused:   {}", status.paused);
        let _ = writeln!(
            out,
            "banks:    {} | {} | {} | {}",
            status.banks[0], status.banks[1], status.banks[2], status.banks[3]
        );
        let _ = writeln!(out, "recording: {}", status.recording);
        out
    }
}

fn parse_count(arg: Option<&&str>, default: usize) -> Result<usize, String> {
    match arg {
        None => Ok(default),
        Some(v) => v.parse().map_err(|_| format!("'{v}' is not a count")),
    }
}

fn parse_drive(arg: &str) -> Result<u8, String> {
    let drive: u8 = arg
        .parse()
        .map_err(|_| format!("'{arg}' is not a drive number"))?;
    if drive > 3 {
        return Err(format!("Drive {drive} out of range (0-3)"));
    }
    Ok(drive)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    fn test_shell() -> (Shell, crossbeam_channel::Receiver<EmuCmd>) {
        let features = Arc::new(FeatureRegistry::new(None));
        let profiler = Arc::new(OpcodeProfiler::new());
        let (tx, rx) = unbounded();
        (Shell::new(features, profiler, tx), rx)
    }

    #[test]
    fn test_empty_and_unknown() {
        let (mut shell, _rx) = test_shell();
        assert!(shell.execute("").is_ok());
        assert!(shell.execute("   ").is_ok());
        assert!(shell.execute("frobnicate").is_err());
    }

    #[test]
    fn test_quit_sends_command() {
        let (mut shell, rx) = test_shell();
        let (outcome, _) = shell.execute("quit").unwrap();
        assert_eq!(outcome, Outcome::Quit);
        assert!(matches!(rx.try_recv(), Ok(EmuCmd::Quit)));
    }

    #[test]
    fn test_feature_commands() {
        let (mut shell, _rx) = test_shell();

        let (_, listing) = shell.execute("feature list").unwrap();
        assert!(listing.contains("opcodeprofiler"));

        shell.execute("feature opcodeprofiler on").unwrap();
        assert!(shell.features.is_enabled(features::OPCODE_PROFILER));

        shell.execute("feature op off").unwrap();
        assert!(!shell.features.is_enabled(features::OPCODE_PROFILER));

        assert!(shell.execute("feature nonexistent on").is_err());
        assert!(shell.execute("feature calltrace mode verbose").is_err());
        shell.execute("feature calltrace mode minimal").unwrap();
    }

    #[test]
    fn test_profiler_start_requires_feature() {
        let (mut shell, _rx) = test_shell();
        let err = shell.execute("profiler opcode start").unwrap_err();
        assert!(err.contains("feature opcodeprofiler on"));

        shell.execute("feature opcodeprofiler on").unwrap();
        shell.execute("profiler opcode start").unwrap();
        assert!(shell.profiler.is_capturing());

        let (_, status) = shell.execute("profiler opcode status").unwrap();
        assert!(status.contains("capturing: true"));
    }

    #[test]
    fn test_profiler_tables() {
        let (mut shell, _rx) = test_shell();
        shell.execute("feature op on").unwrap();
        shell.execute("profiler opcode start").unwrap();
        shell.profiler.log(0x1234, 0, 0x3E, 0x01, 0x02, 3, 400);

        let (_, counters) = shell.execute("profiler opcode counters 10").unwrap();
        assert!(counters.contains("0x3e"));
        let (_, trace) = shell.execute("profiler opcode trace").unwrap();
        assert!(trace.contains("0x1234"));

        assert!(shell.execute("profiler opcode counters bogus").is_err());
        assert!(shell.execute("profiler memory start").is_err());
    }

    #[test]
    fn test_disk_commands_dispatch() {
        let (mut shell, rx) = test_shell();
        shell.execute("disk insert 1 /tmp/game.trd").unwrap();
        match rx.try_recv() {
            Ok(EmuCmd::InsertDisk { drive, path }) => {
                assert_eq!(drive, 1);
                assert_eq!(path, PathBuf::from("/tmp/game.trd"));
            }
            other => panic!("unexpected: {other:?}"),
        }

        shell.execute("disk eject 1").unwrap();
        assert!(matches!(rx.try_recv(), Ok(EmuCmd::EjectDisk { drive: 1 })));

        assert!(shell.execute("disk insert 7 /tmp/game.trd").is_err());
        assert!(shell.execute("disk insert").is_err());
    }

    #[test]
    fn test_select_and_list() {
        let (mut shell, _rx) = test_shell();
        let (_, listing) = shell.execute("list").unwrap();
        assert!(listing.contains("[0] pentagon-128"));

        shell.execute("select 0").unwrap();
        assert!(shell.execute("select 5").is_err());
        assert!(shell.execute("select x").is_err());
    }

    #[test]
    fn test_record_requires_feature() {
        let (mut shell, rx) = test_shell();
        assert!(shell.execute("record start /tmp/out.mkv").is_err());
        shell.execute("feature recording on").unwrap();
        shell.execute("record start /tmp/out.mkv").unwrap();
        assert!(matches!(rx.try_recv(), Ok(EmuCmd::StartRecording { .. })));
    }
}
