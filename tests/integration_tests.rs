//! Integration Tests for the Plugwise Library
//!
//! These tests drive the public API against a simulated Stick over an
//! in-memory byte stream, the same way the library talks to a serial port.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, NaiveDate, NaiveDateTime};
use tokio::io::duplex;

use plugwise::codec::{decode_frame, encode_frame, FOOTER, HEADER, HEADER_PREFIX, LOG_BUFFER_SLOTS};
use plugwise::history::DEFAULT_BATCH_SLOTS;
use plugwise::protocol::{LogEntry, PulseCounters};
use plugwise::simulator::{Reachability, SimulatedCircle, SimulatedStick};
use plugwise::utils::format::{bytes_to_hex, hex_to_bytes};
use plugwise::*;

const STICK: &str = "000D6F0000AAAAAA";
const PLUS: &str = "000D6F0000B1B64B";
const LAMP: &str = "000D6F0000C3D4E5";

fn mac(s: &str) -> Mac {
    s.parse().unwrap()
}

fn clock() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 3, 4).unwrap().and_hms_opt(8, 0, 0).unwrap()
}

fn at(h: u32, m: u32, s: u32) -> TickTime {
    TickTime::new(NaiveDate::from_ymd_opt(2024, 3, 4).unwrap().and_hms_opt(h, m, s).unwrap(), false)
}

/// A Stick with a Circle+ and one Circle, reachable through a fresh channel
fn network() -> (Arc<Channel>, SimulatedStick) {
    plugwise::utils::logging::init_test_logger();
    let (host, device) = duplex(64 * 1024);
    let sim = SimulatedStick::new(mac(STICK));
    sim.add_circle(SimulatedCircle::circle_plus(mac(PLUS), clock(), vec![mac(LAMP)]));
    sim.add_circle(SimulatedCircle::new(mac(LAMP), clock()));
    sim.spawn(device);

    let config = ChannelConfig {
        read_timeout: Duration::from_millis(50),
        retries: 1,
        ..ChannelConfig::default()
    };
    (Arc::new(Channel::new(Box::new(StreamTransport::new(host)), config)), sim)
}

fn drain(handle: &mut ControllerHandle) -> Vec<ControllerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = handle.events.try_recv() {
        events.push(event);
    }
    events
}

/// Test that a captured acknowledgement decodes, with and without the stray prefix
#[tokio::test]
async fn test_captured_ack_frame() {
    let frame = encode_frame(0x0000, "002A00C1");
    assert!(frame.starts_with(HEADER));
    assert!(frame.ends_with(FOOTER));
    assert_eq!(frame.len(), 22);

    // what a line capture looks like, fed back through the hex helpers
    let capture = bytes_to_hex(&frame);
    let raw = hex_to_bytes(&capture).unwrap();
    let ack = Response::decode(&raw).unwrap();
    assert_eq!(ack.seq, 0x002A);
    assert_eq!(ack.ack_status(), Some(AckStatus::Success));
    assert!(ack.mac.is_none());

    let mut prefixed = vec![HEADER_PREFIX];
    prefixed.extend_from_slice(&raw);
    assert_eq!(decode_frame(&prefixed).unwrap().function, 0x0000);

    let mut corrupted = raw.clone();
    corrupted[10] = b'9';
    assert!(Response::decode(&corrupted).is_err());
}

/// Test Stick start-up and a full Circle initialisation over the line
#[tokio::test]
async fn test_stick_and_circle_bring_up() {
    let (channel, sim) = network();
    let mut stick = Stick::new(channel.clone(), Duration::from_millis(10));
    let status = stick.init().await.unwrap().clone();
    assert_eq!(status.mac, Some(mac(STICK)));
    assert!(status.network_online);
    assert_eq!(stick.circle_plus(), Some(&mac(PLUS)));

    sim.with_circle(&mac(LAMP), |c| {
        c.counters = PulseCounters { pulse_1s: 469, pulse_8s: 8 * 469, pulse_1h: 0, pulse_prod_1h: 0 };
    });
    let mut lamp = Circle::new(CircleConfig::new(mac(LAMP), "lamp"), channel.clone());
    lamp.reinit().await.unwrap();
    assert!(lamp.is_online());
    assert_eq!(lamp.device_type(), Some(DeviceType::Circle));

    let power = lamp.get_power_usage().await.unwrap();
    assert!((power.watts_1s - 1000.0).abs() < 0.5);
    assert!((power.watts_8s - 1000.0).abs() < 0.5);

    let status = lamp.get_status();
    let json = serde_json::to_value(&status).unwrap();
    assert_eq!(json["switch"], "on");
    assert_eq!(json["mac"], LAMP);
    assert_eq!(json["online"], true);
}

/// Test that requests to different devices each get their own reply
#[tokio::test]
async fn test_replies_correlated_per_device() {
    let (channel, sim) = network();
    let mut plus = Circle::new(CircleConfig::new(mac(PLUS), "plus"), channel.clone());
    let mut lamp = Circle::new(CircleConfig::new(mac(LAMP), "lamp"), channel.clone());
    plus.reinit().await.unwrap();
    lamp.reinit().await.unwrap();

    lamp.switch_off().await.unwrap();
    plus.switch_on().await.unwrap();
    assert!(!sim.circle(&mac(LAMP)).unwrap().relay_on);
    assert!(sim.circle(&mac(PLUS)).unwrap().relay_on);
    assert_eq!(lamp.relay_state(), SwitchState::Off);
    assert_eq!(plus.relay_state(), SwitchState::On);

    assert_eq!(plus.read_node_table().await.unwrap(), vec![mac(LAMP)]);
    assert_eq!(sim.stats().bad_frames, 0);
    assert_eq!(channel.stats().await.errors, 0);
}

/// Test the offline path and recovery through a pong
#[tokio::test]
async fn test_unreachable_circle_goes_offline_and_recovers() {
    let (channel, sim) = network();
    let mut lamp = Circle::new(CircleConfig::new(mac(LAMP), "lamp"), channel.clone());
    lamp.reinit().await.unwrap();

    sim.set_reachability(&mac(LAMP), Reachability::Unreachable);
    assert!(lamp.get_power_usage().await.is_err());
    assert!(!lamp.is_online());
    assert!(lamp.take_online_changed());

    sim.set_reachability(&mac(LAMP), Reachability::Online);
    lamp.ping().await.unwrap();
    channel.drain_unsolicited().await.unwrap();
    assert!(lamp.check_pong());
    lamp.reinit().await.unwrap();
    assert!(lamp.is_online());
}

/// Test history retrieval across the end of the circular log buffer
#[tokio::test]
async fn test_history_wraps_around_log_buffer() {
    let (channel, sim) = network();
    let base = clock() - ChronoDuration::hours(12);
    let hour = |h: i64| Some(base + ChronoDuration::hours(h));
    let full = |first: i64| -> [LogEntry; 4] {
        std::array::from_fn(|i| LogEntry { timestamp: hour(first + i as i64), pulses: 1_688_179 })
    };

    let last = LOG_BUFFER_SLOTS - 1;
    sim.with_circle(&mac(LAMP), |c| {
        c.set_log_slot(last, full(1));
        c.set_log_slot(0, full(5));
        c.set_log_slot(
            1,
            [
                LogEntry { timestamp: hour(9), pulses: 1_688_179 },
                LogEntry { timestamp: hour(10), pulses: 1_688_179 },
                LogEntry { timestamp: None, pulses: 0 },
                LogEntry { timestamp: None, pulses: 0 },
            ],
        );
    });

    let mut lamp = Circle::new(CircleConfig::new(mac(LAMP), "lamp"), channel);
    lamp.reinit().await.unwrap();
    lamp.set_cursor(LogCursor { index: last - 1, sub_index: 4, timestamp: hour(0) }, 100.0);

    let rows = lamp.read_history(DEFAULT_BATCH_SLOTS).await.unwrap();
    assert_eq!(rows.len(), 10);
    assert_eq!(rows[0].timestamp, hour(1).unwrap());
    assert_eq!(rows[9].timestamp, hour(10).unwrap());
    assert!(rows.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    for row in &rows {
        assert!((row.watt_hours - 1000.0).abs() < 1.0);
    }

    let cursor = lamp.cursor();
    assert_eq!((cursor.index, cursor.sub_index), (1, 2));
    assert_eq!(cursor.timestamp, hour(10));
    assert!((lamp.cum_energy() - 10_100.0).abs() < 10.0);

    // nothing new has been written since
    assert!(lamp.read_history(DEFAULT_BATCH_SLOTS).await.unwrap().is_empty());
    assert_eq!(lamp.cursor(), cursor);
}

/// Test configuration documents driving a controller end to end
#[tokio::test]
async fn test_config_documents_drive_controller() {
    let roster = StaticConfig::from_json_str(&format!(
        r#"{{"static": [
            {{"mac": "{}", "name": "plus", "loginterval": "60"}},
            {{"mac": "{}", "name": "lamp", "production": "False"}}
        ]}}"#,
        PLUS, LAMP
    ))
    .unwrap();
    let control = ControlFile::from_json_str(&format!(
        r#"{{"dynamic": [
            {{"mac": "{}", "schedule": "night", "schedule_state": "on", "monitor": "yes"}},
            {{"mac": "{}", "switch_state": "off"}}
        ], "log_comm": "no", "log_level": "debug"}}"#,
        LAMP, PLUS
    ))
    .unwrap();
    let day: Vec<i32> = (0..96).map(|q| if q < 28 { 0 } else { -1 }).collect();
    let night = ScheduleFile::from_json_str(&serde_json::json!({ "schedule": vec![day; 7] }).to_string())
        .unwrap()
        .into_watts()
        .unwrap();

    let (channel, sim) = network();
    let stick = Stick::new(channel, Duration::from_millis(10));
    let (mut controller, mut handle) = Controller::new(ControllerConfig::default(), stick, roster.circles);
    controller.update_schedules([("night".to_string(), night)].into_iter().collect()).await;
    controller.update_control_file(control).await;
    controller.startup(at(8, 0, 0)).await.unwrap();

    let lamp = controller.circle(&mac(LAMP)).unwrap();
    assert_eq!(lamp.schedule().unwrap().name(), "night");
    let device = sim.circle(&mac(LAMP)).unwrap();
    assert_eq!(device.schedule_crc(), lamp.schedule().unwrap().crc());
    assert!(device.schedule_on);
    assert_eq!(controller.control(&mac(LAMP)).unwrap().schedule_state, SwitchState::On);
    assert!(!sim.circle(&mac(PLUS)).unwrap().relay_on);

    let events = drain(&mut handle);
    assert!(events.iter().any(|e| matches!(e, ControllerEvent::Status(s) if s.mac == mac(LAMP) && s.schedname == "night")));

    // the monitored lamp is sampled on the next tick
    controller.tick(at(8, 0, 10)).await;
    let sampled: Vec<Mac> = drain(&mut handle)
        .into_iter()
        .filter_map(|e| match e {
            ControllerEvent::Power { mac, .. } => Some(mac),
            _ => None,
        })
        .collect();
    assert_eq!(sampled, vec![mac(LAMP)]);
}

/// Test commands arriving through the handle between ticks
#[tokio::test]
async fn test_commands_through_handle() {
    let (channel, sim) = network();
    let stick = Stick::new(channel, Duration::from_millis(10));
    let roster = vec![CircleConfig::new(mac(PLUS), "plus"), CircleConfig::new(mac(LAMP), "lamp")];
    let (mut controller, mut handle) = Controller::new(ControllerConfig::default(), stick, roster);
    controller.startup(at(8, 0, 0)).await.unwrap();
    controller.update_controls(vec![Control::new(mac(LAMP))]).await;
    drain(&mut handle);

    handle.commands.send(Command::Switch { mac: mac(LAMP), on: false }).await.unwrap();
    handle.commands.send(Command::RequestState { mac: mac(LAMP) }).await.unwrap();
    controller.tick(at(8, 0, 10)).await;

    assert!(!sim.circle(&mac(LAMP)).unwrap().relay_on);
    let last = drain(&mut handle)
        .into_iter()
        .filter_map(|e| match e {
            ControllerEvent::Status(s) if s.mac == mac(LAMP) => Some(s),
            _ => None,
        })
        .last()
        .unwrap();
    assert_eq!(last.switch, SwitchState::Off);
    assert_eq!(last.switchreq, SwitchState::Off);
}

/// Test that an always-on Circle refuses to be switched off
#[tokio::test]
async fn test_always_on_circle_is_never_switched_off() {
    let (channel, sim) = network();
    let config = CircleConfig { always_on: true, ..CircleConfig::new(mac(LAMP), "fridge") };
    let mut fridge = Circle::new(config, channel);
    fridge.reinit().await.unwrap();

    let err = fridge.switch_off().await.unwrap_err();
    assert!(matches!(err, PlugwiseError::Value { .. }));
    assert!(sim.circle(&mac(LAMP)).unwrap().relay_on);
}
