/// Plugwise Monitor
///
/// Runs the polling loop against a Stick and prints every status, power
/// and history event. Without a serial port it drives a simulated network.
///
/// Usage: plugwise-monitor [PORT | --simulate] [CONFIG_DIR]
///
/// CONFIG_DIR holds `pw-conf.json` (the roster), `pw-control.json` (the
/// control intents), `schedules/*.json`, the history cursor file
/// `pwlastlog.log` and optionally `pw-stick.json` with serial settings.
/// A PORT argument overrides the port named there.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Duration as ChronoDuration;
use tokio::io::duplex;
use tokio::sync::mpsc::UnboundedReceiver;

use plugwise::config::{read_json_file, ScheduleTable};
use plugwise::simulator::{SimulatedCircle, SimulatedStick};
use plugwise::utils::format::format_metrics;
use plugwise::{
    Channel, CircleConfig, ControlFile, Controller, ControllerConfig, ControllerEvent,
    CursorRecord, Mac, PlugwiseResult, ScheduleFile, StaticConfig, Stick,
    StickConfig, StreamTransport, TickTime,
};

const ROSTER_FILE: &str = "pw-conf.json";
const CONTROL_FILE: &str = "pw-control.json";
const CURSOR_FILE: &str = "pwlastlog.log";
const STICK_FILE: &str = "pw-stick.json";
const SIMULATE: &str = "--simulate";
const SIMULATED_STICK: &str = "000D6F0000A1B2C3";
const SIMULATED_CIRCLE: &str = "000D6F0000B1B64B";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    println!("🔌 Plugwise Monitor");
    println!("===================");
    println!("{}", plugwise::info());

    let port_arg = std::env::args().nth(1);
    let config_dir = PathBuf::from(
        std::env::args().nth(2).unwrap_or_else(|| "config".to_string()),
    );

    let mut stick_config = match read_json_file::<StickConfig>(config_dir.join(STICK_FILE)) {
        Ok(config) => {
            println!("📋 Stick settings loaded from {}", STICK_FILE);
            config
        }
        Err(_) => StickConfig::new(SIMULATE),
    };
    if let Some(port) = port_arg {
        stick_config.port = port;
    }

    let mut roster = load_roster(&config_dir);
    let simulate = stick_config.port == SIMULATE;
    if simulate && roster.is_empty() {
        roster.push(CircleConfig::new(SIMULATED_CIRCLE.parse()?, "demo"));
    }

    let channel = if simulate {
        println!("🧪 Using a simulated Stick with {} Circles", roster.len());
        let (host, device) = duplex(64 * 1024);
        let sim = SimulatedStick::new(SIMULATED_STICK.parse()?);
        for entry in &roster {
            sim.add_circle(simulated_circle(entry.mac.clone()));
        }
        sim.spawn(device);
        let mut transport = StreamTransport::new(host);
        transport.set_packet_logging(stick_config.packet_trace);
        Channel::new(Box::new(transport), stick_config.channel_config())
    } else {
        println!("Opening Stick on {}...", stick_config.port);
        match stick_config.open_serial() {
            Ok(transport) => {
                println!("✅ Serial port open");
                Channel::new(Box::new(transport), stick_config.channel_config())
            }
            Err(e) => {
                eprintln!("❌ Failed to open {}: {}", stick_config.port, e);
                eprintln!("Run with {} to try the monitor without hardware", SIMULATE);
                return Ok(());
            }
        }
    };

    let stick = Stick::new(Arc::new(channel), stick_config.reconnect_backoff());
    let (mut controller, handle) = Controller::new(ControllerConfig::default(), stick, roster);

    let cursor_path = config_dir.join(CURSOR_FILE);
    controller.restore_cursors(load_cursors(&cursor_path));
    controller.update_schedules(load_schedules(&config_dir.join("schedules"))).await;

    match read_json_file::<ControlFile>(config_dir.join(CONTROL_FILE)) {
        Ok(control) => controller.update_control_file(control).await,
        Err(e) => println!("⚠️  No control file loaded: {}", e),
    }

    if let Err(e) = controller.startup(TickTime::now()).await {
        eprintln!("❌ Stick did not start: {}", e);
        return Ok(());
    }
    println!("✅ Controller started, press Ctrl-C to stop\n");

    // Keep the command side open for the lifetime of the loop
    let _commands = handle.commands;
    let printer = tokio::spawn(print_events(handle.events, cursor_path));

    tokio::select! {
        _ = controller.run() => {}
        _ = tokio::signal::ctrl_c() => println!("\n🛑 Stopping"),
    }

    println!("\n{}", format_metrics(controller.metrics()));
    drop(controller);
    let _ = printer.await;
    Ok(())
}

fn load_roster(dir: &Path) -> Vec<CircleConfig> {
    match read_json_file::<StaticConfig>(dir.join(ROSTER_FILE)) {
        Ok(config) => {
            println!("📋 Loaded {} Circles from {}", config.circles.len(), ROSTER_FILE);
            config.circles
        }
        Err(e) => {
            println!("⚠️  No roster loaded: {}", e);
            Vec::new()
        }
    }
}

fn load_schedules(dir: &Path) -> ScheduleTable {
    let mut table = ScheduleTable::new();
    let Ok(entries) = std::fs::read_dir(dir) else {
        return table;
    };
    for path in entries.filter_map(Result::ok).map(|e| e.path()) {
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let Some(name) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
            continue;
        };
        match read_json_file::<ScheduleFile>(&path).and_then(ScheduleFile::into_watts) {
            Ok(watts) => {
                println!("🗓️  Schedule '{}' loaded", name);
                table.insert(name, watts);
            }
            Err(e) => println!("❌ Schedule {} skipped: {}", path.display(), e),
        }
    }
    table
}

fn load_cursors(path: &Path) -> Vec<CursorRecord> {
    let Ok(text) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match CursorRecord::from_line(line) {
            Ok(record) => Some(record),
            Err(e) => {
                println!("⚠️  {}", e);
                None
            }
        })
        .collect()
}

fn save_cursors(path: &Path, cursors: &BTreeMap<String, CursorRecord>) -> PlugwiseResult<()> {
    let text: String = cursors.values().map(|c| c.to_line() + "\n").collect();
    std::fs::write(path, text)?;
    Ok(())
}

async fn print_events(mut events: UnboundedReceiver<ControllerEvent>, cursor_path: PathBuf) {
    let mut cursors: BTreeMap<String, CursorRecord> = load_cursors(&cursor_path)
        .into_iter()
        .map(|c| (c.mac.to_string(), c))
        .collect();

    while let Some(event) = events.recv().await {
        match event {
            ControllerEvent::Status(status) => {
                println!(
                    "📡 {} '{}' online={} switch={} schedule={} {:.1} W",
                    status.mac, status.name, status.online, status.switch, status.schedule, status.power8s
                );
            }
            ControllerEvent::Power { mac, ts, watts } => {
                println!("⚡ {} {} {:.1} W", ts.format("%H:%M:%S"), mac, watts);
            }
            ControllerEvent::History { mac, rows } => {
                for row in rows {
                    println!(
                        "📜 {} {} {:.1} W {:.3} Wh",
                        row.timestamp.format("%Y-%m-%d %H:%M"), mac, row.watts, row.watt_hours
                    );
                }
            }
            ControllerEvent::Cursor(record) => {
                cursors.insert(record.mac.to_string(), record);
                if let Err(e) = save_cursors(&cursor_path, &cursors) {
                    eprintln!("❌ Failed to store history cursors: {}", e);
                }
            }
        }
    }
}

/// A simulated Circle drawing about 100 W with a day of history
fn simulated_circle(mac: Mac) -> SimulatedCircle {
    let now = TickTime::now().local;
    let mut circle = SimulatedCircle::new(mac, now);
    circle.counters.pulse_1s = 6;
    circle.counters.pulse_8s = 47;
    circle.counters.pulse_1h = 21_400;
    let start = now - ChronoDuration::hours(24);
    for slot in 0..6u32 {
        let entries = std::array::from_fn(|i| plugwise::protocol::LogEntry {
            timestamp: Some(start + ChronoDuration::hours(slot as i64 * 4 + i as i64)),
            pulses: 21_000 + (slot as i64 * 100),
        });
        circle.set_log_slot(slot, entries);
    }
    circle
}
