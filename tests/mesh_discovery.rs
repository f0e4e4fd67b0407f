//! Gateway board discovery, handshake and reconnection.

mod common;

use common::{MeshRig, HANDSHAKE};
use homegate::events::MeshEventKind;
use homegate::mesh::LinkState;
use homegate::serial::mock::MockPorts;
use homegate::settings::{MemorySettings, SettingsStore, KEY_PORT};

const USB0: &str = "/dev/ttyUSB0";
const USB1: &str = "/dev/ttyUSB1";
const ACM0: &str = "/dev/ttyACM0";
const AMA0: &str = "/dev/ttyAMA0";

#[test]
fn scan_skips_busy_and_reserved_ports() {
    let ports = MockPorts::new();
    ports.add(USB0).add(AMA0).add(ACM0);
    ports.set_busy(USB0, true);
    let mut rig = MeshRig::new(ports, MemorySettings::new());
    rig.link.start(rig.t0);
    assert_eq!(rig.ports.open_attempts(), vec![ACM0.to_string()]);
    assert_eq!(rig.link.state(), LinkState::AwaitingHandshake);
    assert_eq!(rig.link.port_name(), Some(ACM0));
}

#[test]
fn remembered_port_is_tried_first() {
    let ports = MockPorts::new();
    ports.add(USB0).add(USB1);
    let settings = MemorySettings::new().with(KEY_PORT, USB1);
    let mut rig = MeshRig::new(ports, settings);
    rig.link.start(rig.t0);
    assert_eq!(rig.ports.open_attempts(), vec![USB1.to_string()]);
}

#[test]
fn missing_remembered_port_falls_back_to_scan() {
    let ports = MockPorts::new();
    ports.add(USB0);
    let settings = MemorySettings::new().with(KEY_PORT, "/dev/ttyUSB9");
    let mut rig = MeshRig::new(ports, settings);
    rig.link.start(rig.t0);
    assert_eq!(rig.ports.open_attempts(), vec![USB0.to_string()]);
}

#[test]
fn handshake_is_case_insensitive_and_persists_port() {
    let ports = MockPorts::new();
    ports.add(USB0);
    let mut rig = MeshRig::new(ports, MemorySettings::new());
    rig.link.start(rig.t0);
    rig.ports.inject(USB0, b"booting\n0;255;3;0;14;GATEWAY startup COMPLETE\n");
    rig.link.poll(rig.at(10));
    assert_eq!(rig.link.state(), LinkState::Connected);
    assert_eq!(rig.settings.value(KEY_PORT).as_deref(), Some(USB0));
    let events = rig.sink.mesh_events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, MeshEventKind::SaveGateway);
    assert_eq!(events[0].payload, "1");
    assert_eq!((events[0].sender, events[0].sensor, events[0].sub_type), (0, 0, 0));
}

#[test]
fn silent_ports_are_probed_in_turn() {
    let ports = MockPorts::new();
    ports.add(USB0).add(USB1);
    let mut rig = MeshRig::new(ports, MemorySettings::new());
    rig.link.start(rig.t0);

    // USB0 never answers: closed, then the next scan resumes after it.
    rig.link.poll(rig.at(5000));
    assert!(!rig.ports.is_open(USB0));
    assert_eq!(rig.link.state(), LinkState::Disconnected);
    assert_eq!(rig.link.next_deadline(), Some(rig.at(22000)));
    rig.link.poll(rig.at(22000));
    assert!(rig.ports.is_open(USB1));

    // USB1 never answers either: nothing left after it, so that scan fails.
    rig.link.poll(rig.at(27000));
    rig.link.poll(rig.at(44000));
    assert!(!rig.link.is_connected());

    // The marker is gone; the following scan starts over.
    rig.link.poll(rig.at(61000));
    assert_eq!(
        rig.ports.open_attempts(),
        vec![USB0.to_string(), USB1.to_string(), USB0.to_string()]
    );
}

#[test]
fn no_port_at_startup_retries_after_cold_start_backoff() {
    let ports = MockPorts::new();
    let mut rig = MeshRig::new(ports, MemorySettings::new());
    rig.link.start(rig.t0);
    assert_eq!(rig.link.next_deadline(), Some(rig.at(8000)));

    rig.ports.add(USB0);
    rig.link.poll(rig.at(7999));
    assert!(!rig.link.is_connected());
    rig.link.poll(rig.at(8000));
    assert!(rig.link.is_connected());
}

#[test]
fn io_error_reports_link_loss_and_reconnects() {
    let ports = MockPorts::new();
    ports.add(USB0);
    let mut rig = MeshRig::connected(ports, USB0);
    rig.ports.fail(USB0);
    rig.link.poll(rig.at(100));

    assert!(!rig.link.is_connected());
    let events = rig.sink.mesh_events();
    let last = events.last().expect("events");
    assert_eq!(last.kind, MeshEventKind::SaveGateway);
    assert_eq!(last.payload, "0");
    assert_eq!(rig.link.next_deadline(), Some(rig.at(17100)));

    rig.ports.heal(USB0);
    rig.link.poll(rig.at(17100));
    assert_eq!(rig.link.state(), LinkState::AwaitingHandshake);
    rig.ports.inject(USB0, HANDSHAKE);
    rig.link.poll(rig.at(17200));
    assert_eq!(rig.link.state(), LinkState::Connected);
    let ups = rig
        .sink
        .mesh_events()
        .into_iter()
        .filter(|e| e.kind == MeshEventKind::SaveGateway && e.payload == "1")
        .count();
    assert_eq!(ups, 2);
}

#[test]
fn unopenable_port_is_passed_over() {
    let ports = MockPorts::new();
    ports.add(USB0).add(USB1);
    ports.set_openable(USB0, false);
    let mut rig = MeshRig::new(ports, MemorySettings::new());
    rig.link.start(rig.t0);
    assert_eq!(
        rig.ports.open_attempts(),
        vec![USB0.to_string(), USB1.to_string()]
    );
    assert_eq!(rig.link.port_name(), Some(USB1));
}

#[test]
fn unplugged_board_is_reported_once() {
    let ports = MockPorts::new();
    ports.add(USB0);
    let mut rig = MeshRig::connected(ports, USB0);
    rig.ports.remove(USB0);
    rig.link.poll(rig.at(10));
    rig.link.poll(rig.at(20));
    let downs = rig
        .sink
        .mesh_events()
        .into_iter()
        .filter(|e| e.kind == MeshEventKind::SaveGateway && e.payload == "0")
        .count();
    assert_eq!(downs, 1);
    assert_eq!(rig.link.state(), LinkState::Disconnected);
}
