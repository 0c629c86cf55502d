mod config;
mod fdc;
mod features;
mod machine;
mod message_center;
mod recording;
mod shared_mem;
mod shell;

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use crossbeam_channel::unbounded;

use config::Config;
use features::FeatureRegistry;
use machine::{spawn_machine, EmuCmd, Machine};
use message_center::MessageCenter;
use shell::{Outcome, Shell};

const EMULATOR_ID: &str = "spectral-0";

struct CliArgs {
    disk: Option<PathBuf>,
    turbo: bool,
    exec: Option<String>,
}

fn print_usage() {
    println!("Usage: spectral [OPTIONS] [DISK.trd]");
    println!();
    println!("Options:");
    println!("  --turbo          run unpaced (no frame rate limit)");
    println!("  --exec <cmd>     run one shell command and exit");
    println!("  --help           show this help");
    println!("  --version        show version");
}

fn parse_args() -> Result<Option<CliArgs>, String> {
    let mut args = CliArgs {
        disk: None,
        turbo: false,
        exec: None,
    };

    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                return Ok(None);
            }
            "--version" | "-V" => {
                println!("spectral {}", env!("CARGO_PKG_VERSION"));
                return Ok(None);
            }
            "--turbo" => args.turbo = true,
            "--exec" | "-e" => {
                let cmd = iter.next().ok_or("--exec needs a command string")?;
                args.exec = Some(cmd);
            }
            other if other.starts_with('-') => {
                return Err(format!("Unknown option '{other}'"));
            }
            other => {
                if args.disk.is_some() {
                    return Err("Only one disk image can be given".into());
                }
                args.disk = Some(PathBuf::from(other));
            }
        }
    }

    Ok(Some(args))
}

fn main() {
    std::process::exit(run());
}

fn run() -> i32 {
    env_logger::init();

    let args = match parse_args() {
        Ok(Some(args)) => args,
        Ok(None) => return 0,
        Err(e) => {
            eprintln!("spectral: {e}");
            print_usage();
            return 1;
        }
    };

    let mut config = Config::load();
    if args.turbo {
        config.turbo = true;
    }

    let features = Arc::new(FeatureRegistry::new(config.features_path()));
    if let Some(path) = config.features_path() {
        features.load_from(&path);
    }

    let message_center = MessageCenter::new();
    let machine = Machine::new(EMULATOR_ID, Arc::clone(&features), message_center, &config);
    let profiler = Arc::clone(&machine.profiler);

    let (cmd_tx, cmd_rx) = unbounded();
    let handle = spawn_machine(machine, cmd_rx, config.turbo);

    if let Some(path) = &args.disk {
        let _ = cmd_tx.send(EmuCmd::InsertDisk {
            drive: 0,
            path: path.clone(),
        });
        if let Some(dir) = path.parent() {
            config.last_disk_dir = Some(dir.display().to_string());
            config.save();
        }
    }

    let mut shell = Shell::new(features, profiler, cmd_tx.clone());

    // One-shot mode: run a single command, propagate its result as the
    // exit code.
    if let Some(command) = &args.exec {
        let code = match shell.execute(command) {
            Ok((_, output)) => {
                if !output.is_empty() {
                    println!("{output}");
                }
                0
            }
            Err(e) => {
                eprintln!("spectral: {e}");
                1
            }
        };
        let _ = cmd_tx.send(EmuCmd::Quit);
        let _ = handle.join();
        return code;
    }

    println!("spectral {} — type 'help' for commands", env!("CARGO_PKG_VERSION"));

    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        print!("spectral> ");
        let _ = io::stdout().flush();

        let Some(Ok(line)) = lines.next() else {
            // EOF behaves like quit
            let _ = cmd_tx.send(EmuCmd::Quit);
            break;
        };

        match shell.execute(&line) {
            Ok((Outcome::Quit, output)) => {
                if !output.is_empty() {
                    println!("{output}");
                }
                break;
            }
            Ok((Outcome::Continue, output)) => {
                if !output.is_empty() {
                    println!("{output}");
                }
            }
            Err(e) => eprintln!("error: {e}"),
        }
    }

    let _ = handle.join();
    0
}
