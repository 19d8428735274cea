/// Terminal control panel for the stepper driver board
///
/// Reads operator commands from stdin and drives the board over serial.
/// Run with: cargo run --bin stepper_console -- --port /dev/ttyACM0 --connect

use anyhow::Result;
use clap::Parser;
use crossbeam_channel::{bounded, never, select, tick, unbounded};
use gethostname::gethostname;
use log::LevelFilter;
use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use stepper_panel::config_loader::{self, PanelSettings};
use stepper_panel::controller::{Controller, SessionState};
use stepper_panel::intents::Intent;
use stepper_panel::protocol::{Command, Microstep, Profile};
use stepper_panel::telemetry::{TelemetryClock, TelemetryWindow};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Serial port of the driver board (overrides MOTOR_PORT)
    #[arg(long)]
    port: Option<String>,
    #[arg(long)]
    baud: Option<u32>,
    /// Settings YAML (defaults to stepper_panel.yaml next to Cargo.toml)
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    debug: bool,
    /// Also write the log to this file
    #[arg(long)]
    log_file: Option<PathBuf>,
    /// Print the latest RPM once a second
    #[arg(long)]
    watch: bool,
    /// Time the RPM history by wall clock instead of read ticks
    #[arg(long)]
    measured_clock: bool,
    /// Connect as soon as the console starts
    #[arg(long)]
    connect: bool,
}

enum Input {
    Line(String),
    Eof,
}

#[derive(PartialEq, Eq)]
enum Flow {
    Continue,
    Quit,
}

const HELP: &str = "\
connect [port] | disconnect | toggle      open/close the driver port
start | stop | run | space                motor on/off (run/space toggles)
cw | ccw | < | >                          direction
speed <rpm> | + | -                       set speed / nudge by 5 RPM
micro <1|2|4|8|16|32|64>                  microstepping
profile <1|2|3>                           acceleration profile
send <COMMAND>                            apply a raw protocol command
status | plot | help | quit";

const SPARK: [char; 8] = ['▁', '▂', '▃', '▄', '▅', '▆', '▇', '█'];
const PLOT_COLUMNS: usize = 60;

fn init_logging(debug: bool, log_file: Option<&Path>) -> Result<()> {
    let level = if debug { LevelFilter::Debug } else { LevelFilter::Info };
    let Some(path) = log_file else {
        env_logger::Builder::from_default_env().filter_level(level).init();
        return Ok(());
    };
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{} [{}] {}: {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(level)
        .chain(io::stderr())
        .chain(fern::log_file(path)?)
        .apply()?;
    Ok(())
}

fn load_settings(args: &Args) -> Result<PanelSettings> {
    let hostname = gethostname().to_string_lossy().to_string();
    let path = args.config.clone().unwrap_or_else(config_loader::config_path);
    let mut settings = config_loader::load_panel_settings_from(&path, &hostname)?;
    if let Some(port) = &args.port {
        settings.port = Some(port.clone());
    }
    if let Some(baud) = args.baud {
        settings.baud = baud;
    }
    if args.measured_clock {
        settings.telemetry_clock = TelemetryClock::Measured;
    }
    Ok(settings)
}

fn print_status(controller: &Controller) {
    let state = controller.state();
    println!("Status: {}", controller.status());
    println!(
        "Motor: {} | microstep 1/{} | profile {} | speed {}/{} RPM | queued {}",
        if state.running { "running" } else { "stopped" },
        state.microstep,
        state.profile.label(),
        state.speed_rpm,
        state.max_rpm,
        controller.pacer().len()
    );
}

fn sparkline(window: &TelemetryWindow, max_rpm: f64) -> String {
    let points = window.points();
    if points.is_empty() {
        return String::new();
    }
    let per_column = points.len().div_ceil(PLOT_COLUMNS);
    points
        .chunks(per_column)
        .map(|chunk| {
            let mean = chunk.iter().map(|p| p[1]).sum::<f64>() / chunk.len() as f64;
            let level = if max_rpm > 0.0 { (mean / max_rpm).clamp(0.0, 1.0) } else { 0.0 };
            SPARK[((level * (SPARK.len() - 1) as f64).round()) as usize]
        })
        .collect()
}

fn print_plot(controller: &Controller) {
    let window = controller.telemetry();
    let Some(stats) = window.stats() else {
        println!("No telemetry yet");
        return;
    };
    println!(
        "RPM over last {:.1}s ({} samples): now {:.1}, min {:.1}, max {:.1}, mean {:.1}",
        stats.span_s, stats.count, stats.latest, stats.min, stats.max, stats.mean
    );
    let scale = stats.max.max(f64::from(controller.state().max_rpm));
    println!("{}", sparkline(window, scale));
}

fn handle_line(controller: &mut Controller, line: &str, default_port: Option<&str>) -> Flow {
    let trimmed = line.trim();
    let (verb, rest) = trimmed.split_once(char::is_whitespace).unwrap_or((trimmed, ""));
    match verb.to_ascii_lowercase().as_str() {
        "" => {}
        "quit" | "exit" => return Flow::Quit,
        "help" | "?" => println!("{}", HELP),
        "status" => print_status(controller),
        "plot" => print_plot(controller),
        "send" => match rest.parse::<Command>() {
            Ok(cmd) => apply_raw_command(controller, cmd),
            Err(e) => println!("Rejected: {}", e),
        },
        _ => match trimmed.parse::<Intent>() {
            Ok(intent) => apply_intent(controller, intent, default_port),
            Err(e) => println!("{} (type 'help')", e),
        },
    }
    Flow::Continue
}

/// Raw commands go through their intent so session state and the speed
/// limit stay in step with what the board was told.
fn apply_raw_command(controller: &mut Controller, cmd: Command) {
    let intent = match cmd {
        Command::Stop => Intent::Stop,
        Command::Start => Intent::Start,
        Command::Dir(d) => Intent::Direction(d),
        Command::Microstep(m) => Intent::SelectMicrostep(m),
        Command::SetProfile(p) => Intent::SelectProfile(p),
        Command::SetSpeed(rpm) => Intent::SetSpeed(rpm),
    };
    controller.apply(intent, "");
}

fn apply_intent(controller: &mut Controller, intent: Intent, default_port: Option<&str>) {
    let needs_port = match &intent {
        Intent::Connect(None) => true,
        Intent::ToggleConnection => !controller.is_connected(),
        _ => false,
    };
    let reports_status = matches!(
        intent,
        Intent::Connect(_) | Intent::Disconnect | Intent::ToggleConnection
    );
    if needs_port && default_port.is_none() {
        println!("No port configured; use 'connect <port>' or --port");
        return;
    }
    controller.apply(intent, default_port.unwrap_or_default());
    if reports_status {
        println!("{}", controller.status());
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.debug, args.log_file.as_deref())?;

    let settings = load_settings(&args)?;
    log::info!(
        "Stepper console: port={:?} baud={} cmd_tick={:?} telemetry_tick={:?} clock={:?}",
        settings.port, settings.baud, settings.cmd_tick, settings.telemetry_tick, settings.telemetry_clock
    );

    let mut controller = Controller::new(
        SessionState::new(settings.microstep, settings.profile),
        TelemetryWindow::new(settings.telemetry_window_s, settings.telemetry_tick, settings.telemetry_clock),
        settings.link_settings(),
    );
    let default_port = settings.port.clone();

    if args.connect {
        apply_intent(&mut controller, Intent::Connect(None), default_port.as_deref());
    }

    println!(
        "Microsteps: {:?}",
        Microstep::ALL.iter().map(|m| m.value()).collect::<Vec<_>>()
    );
    for profile in Profile::ALL {
        println!("Profile {}", profile.label());
    }
    println!("Type 'help' for commands.");

    let (input_tx, input_rx) = unbounded();
    thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            match line {
                Ok(line) => {
                    if input_tx.send(Input::Line(line)).is_err() {
                        return;
                    }
                }
                Err(e) => {
                    log::warn!("stdin read error: {}", e);
                    break;
                }
            }
        }
        let _ = input_tx.send(Input::Eof);
    });

    let (interrupt_tx, interrupt_rx) = bounded(1);
    ctrlc::set_handler(move || {
        let _ = interrupt_tx.try_send(());
    })?;

    let cmd_ticker = tick(settings.cmd_tick);
    let telemetry_ticker = tick(settings.telemetry_tick);
    let watch_ticker = if args.watch { tick(Duration::from_secs(1)) } else { never() };

    loop {
        select! {
            recv(cmd_ticker) -> _ => {
                controller.tick_commands();
            }
            recv(telemetry_ticker) -> _ => {
                controller.tick_telemetry();
            }
            recv(watch_ticker) -> _ => {
                if let Some(sample) = controller.telemetry().latest() {
                    println!("t={:7.2}s  {:8.1} RPM", sample.time_s, sample.rpm);
                }
            }
            recv(input_rx) -> msg => match msg {
                Ok(Input::Line(line)) => {
                    if handle_line(&mut controller, &line, default_port.as_deref()) == Flow::Quit {
                        break;
                    }
                }
                Ok(Input::Eof) | Err(_) => break,
            },
            recv(interrupt_rx) -> _ => {
                log::info!("Interrupted");
                break;
            }
        }
    }

    controller.shutdown();
    println!("Stopped.");
    Ok(())
}
