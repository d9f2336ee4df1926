//! Session protocol tests against the manager facade.
//!
//! These drive the facade directly (no sockets, no event loop) with the mock
//! factories, checking the registry invariants after every step.

use std::collections::HashMap;

use sensord_core::{ErrorKind, INVALID_SESSION};
use sensord_daemon::bus::OBJECT_PATH;
use sensord_daemon::mock::{self, MockAdaptor, MockSensor};
use sensord_daemon::pump::{sample_pump, SampleDrain};
use sensord_daemon::{ControlBus, LocalBus, ManagerSignal, SensorManager, SocketHandler};

fn adaptor_state(manager: &SensorManager) -> &MockAdaptor {
    manager
        .pipelines()
        .adaptors
        .entry("acceladaptor")
        .unwrap()
        .instance()
        .unwrap()
        .as_any()
        .downcast_ref::<MockAdaptor>()
        .unwrap()
}

fn new_manager() -> (SensorManager, SampleDrain) {
    new_manager_with_bus(LocalBus::new())
}

fn new_manager_with_bus(bus: LocalBus) -> (SensorManager, SampleDrain) {
    let (writer, drain) = sample_pump(64);
    let mut manager = SensorManager::new(Box::new(bus), SocketHandler::new(), writer);
    mock::register_builtin_factories(&mut manager);
    (manager, drain)
}

fn register_accel(manager: &mut SensorManager) {
    manager.register_adaptor("acceladaptor", "mockadaptor", HashMap::new());
    manager.register_chain("accelchain", "mockchain");
    manager.register_sensor("accel", "mocksensor");
}

#[test]
fn control_then_release_restores_the_entry() {
    let (mut manager, _drain) = new_manager();
    register_accel(&mut manager);

    let s1 = manager.request_control_sensor("accel");
    assert!(s1 >= 1);
    manager.assert_invariants();

    let entry = manager.sensor_entry("accel").unwrap();
    assert!(entry.is_live());
    assert_eq!(entry.controlling_session(), s1);
    assert!(entry.listen_sessions().is_empty());

    assert!(manager.release_sensor("accel", s1));
    manager.assert_invariants();

    let entry = manager.sensor_entry("accel").unwrap();
    assert!(!entry.is_live());
    assert_eq!(entry.controlling_session(), INVALID_SESSION);
}

#[test]
fn second_control_request_is_rejected() {
    let (mut manager, _drain) = new_manager();
    register_accel(&mut manager);

    let s1 = manager.request_control_sensor("accel");
    let s2 = manager.request_control_sensor("accel");
    assert_eq!(s2, INVALID_SESSION);
    assert_eq!(manager.last_error().kind, ErrorKind::AlreadyUnderControl);

    // The entry is untouched by the rejected request.
    let entry = manager.sensor_entry("accel").unwrap();
    assert_eq!(entry.controlling_session(), s1);
    assert!(entry.listen_sessions().is_empty());
    manager.assert_invariants();
}

#[test]
fn listeners_coexist_with_the_controller() {
    let (mut manager, _drain) = new_manager();
    register_accel(&mut manager);

    let s1 = manager.request_control_sensor("accel");
    let s2 = manager.request_listen_sensor("accel");
    let s3 = manager.request_listen_sensor("accel");
    assert!(s1 < s2 && s2 < s3);
    manager.assert_invariants();

    assert!(manager.release_sensor("accel", s1));
    let entry = manager.sensor_entry("accel").unwrap();
    assert!(entry.is_live());
    assert_eq!(entry.controlling_session(), INVALID_SESSION);
    assert_eq!(entry.listen_sessions(), &[s2, s3]);
    manager.assert_invariants();

    assert!(manager.release_sensor("accel", s2));
    let entry = manager.sensor_entry("accel").unwrap();
    assert!(entry.is_live());
    assert_eq!(entry.listen_sessions(), &[s3]);
    manager.assert_invariants();

    assert!(manager.release_sensor("accel", s3));
    assert!(!manager.sensor_entry("accel").unwrap().is_live());
    manager.assert_invariants();
}

#[test]
fn control_grant_reuses_an_instance_kept_alive_by_listeners() {
    let (mut manager, _drain) = new_manager();
    register_accel(&mut manager);

    let listener = manager.request_listen_sensor("accel");
    let controller = manager.request_control_sensor("accel");
    assert!(controller > listener);

    let entry = manager.sensor_entry("accel").unwrap();
    assert_eq!(entry.controlling_session(), controller);
    assert_eq!(entry.listen_sessions(), &[listener]);
    manager.assert_invariants();

    assert!(manager.release_sensor("accel", controller));
    assert!(manager.release_sensor("accel", listener));
    assert!(!manager.sensor_entry("accel").unwrap().is_live());
}

#[test]
fn interleaved_listen_release_pairs_net_to_nothing() {
    let (mut manager, _drain) = new_manager();
    register_accel(&mut manager);

    let a = manager.request_listen_sensor("accel");
    let b = manager.request_listen_sensor("accel");
    assert!(manager.release_sensor("accel", a));
    let c = manager.request_listen_sensor("accel");
    assert!(manager.release_sensor("accel", b));
    assert!(manager.release_sensor("accel", c));

    let entry = manager.sensor_entry("accel").unwrap();
    assert!(!entry.is_live());
    assert!(entry.listen_sessions().is_empty());
    manager.assert_invariants();
}

#[test]
fn session_ids_strictly_increase() {
    let (mut manager, _drain) = new_manager();
    register_accel(&mut manager);

    let mut previous = 0;
    for _ in 0..5 {
        let session = manager.request_listen_sensor("accel");
        assert!(session > previous);
        previous = session;
        assert!(manager.release_sensor("accel", session));
    }
}

#[test]
fn unknown_sensor_id_is_rejected() {
    let (mut manager, _drain) = new_manager();
    register_accel(&mut manager);

    assert_eq!(manager.request_control_sensor("gyro"), INVALID_SESSION);
    assert_eq!(manager.last_error().kind, ErrorKind::IdNotRegistered);

    assert_eq!(manager.request_listen_sensor("gyro"), INVALID_SESSION);
    assert_eq!(manager.last_error().kind, ErrorKind::IdNotRegistered);

    assert!(!manager.release_sensor("gyro", 1));
    assert_eq!(manager.last_error().kind, ErrorKind::IdNotRegistered);
}

#[test]
fn missing_factory_fails_materialization() {
    let (mut manager, _drain) = new_manager();
    manager.register_sensor("exotic", "ghostsensor");

    assert_eq!(manager.request_control_sensor("exotic"), INVALID_SESSION);
    assert_eq!(manager.last_error().kind, ErrorKind::FactoryNotRegistered);
    assert!(!manager.sensor_entry("exotic").unwrap().is_live());
    manager.assert_invariants();
}

#[test]
fn invalid_instance_is_discarded() {
    let (mut manager, _drain) = new_manager();
    register_accel(&mut manager);

    let session = manager.request_control_sensor("accel;invalid=true");
    assert_eq!(session, INVALID_SESSION);
    // The discard is silent: no error is recorded for an invalid instance.
    assert_eq!(manager.last_error().kind, ErrorKind::NoError);
    assert!(!manager.sensor_entry("accel").unwrap().is_live());
    manager.assert_invariants();
}

#[test]
fn invalid_instance_releases_acquired_dependencies() {
    let (mut manager, _drain) = new_manager();
    register_accel(&mut manager);

    let session = manager.request_control_sensor("accel;chain=accelchain;invalid=true");
    assert_eq!(session, INVALID_SESSION);
    assert!(!manager.pipelines().chain_is_live("accelchain"));
    assert_eq!(
        manager.pipelines().adaptors.entry("acceladaptor").unwrap().refcount(),
        0
    );
    manager.assert_invariants();
}

#[test]
fn sensor_pulls_its_pipeline_and_teardown_releases_it() {
    let (mut manager, _drain) = new_manager();
    register_accel(&mut manager);

    let session = manager.request_control_sensor("accel;chain=accelchain");
    assert!(session >= 1);
    assert!(manager.pipelines().chain_is_live("accelchain"));
    assert_eq!(manager.pipelines().chain_refcount("accelchain"), Some(1));
    let adaptor_entry = manager.pipelines().adaptors.entry("acceladaptor").unwrap();
    assert!(adaptor_entry.is_live());
    assert_eq!(adaptor_entry.refcount(), 1);
    manager.assert_invariants();

    assert!(manager.release_sensor("accel", session));
    assert!(!manager.pipelines().chain_is_live("accelchain"));
    assert!(!manager.pipelines().adaptors.entry("acceladaptor").unwrap().is_live());
    manager.assert_invariants();
}

#[test]
fn bus_registration_failure_rolls_the_grant_back() {
    let mut bus = LocalBus::new();
    bus.register_object(&format!("{OBJECT_PATH}/accel")).unwrap();
    let (mut manager, _drain) = new_manager_with_bus(bus);
    register_accel(&mut manager);

    assert_eq!(manager.request_control_sensor("accel"), INVALID_SESSION);
    assert_eq!(manager.last_error().kind, ErrorKind::CanNotRegisterObject);

    let entry = manager.sensor_entry("accel").unwrap();
    assert!(!entry.is_live());
    assert_eq!(entry.controlling_session(), INVALID_SESSION);
    assert!(entry.listen_sessions().is_empty());
    manager.assert_invariants();
}

#[test]
fn release_with_unknown_session_still_clears_property_requests() {
    let (mut manager, _drain) = new_manager();
    register_accel(&mut manager);

    let s1 = manager.request_control_sensor("accel");
    assert!(s1 >= 1);

    // A session that never obtained a grant parks a property request.
    let bogus = 777;
    assert_eq!(
        manager.set_property_request(bogus, "interval", "acceladaptor", 42),
        42
    );

    assert!(!manager.release_sensor("accel", bogus));
    assert_eq!(manager.last_error().kind, ErrorKind::NotInstantiated);

    // The request was dropped even though the session was rejected.
    assert_eq!(manager.winning_property_value("interval", "acceladaptor"), 0);

    // The real grant is unaffected.
    let entry = manager.sensor_entry("accel").unwrap();
    assert_eq!(entry.controlling_session(), s1);
    manager.assert_invariants();
}

#[test]
fn release_of_uninstantiated_sensor_reports_not_instantiated() {
    let (mut manager, _drain) = new_manager();
    register_accel(&mut manager);

    assert!(!manager.release_sensor("accel", 5));
    assert_eq!(manager.last_error().kind, ErrorKind::NotInstantiated);
}

#[test]
fn lost_client_stops_then_releases_the_grant() {
    let (mut manager, _drain) = new_manager();
    register_accel(&mut manager);

    let controller = manager.request_control_sensor("accel");
    let listener = manager.request_listen_sensor("accel");

    manager.lost_client(controller);

    // The listener keeps the instance alive, so the stop call is observable.
    let entry = manager.sensor_entry("accel").unwrap();
    assert!(entry.is_live());
    assert_eq!(entry.controlling_session(), INVALID_SESSION);
    assert_eq!(entry.listen_sessions(), &[listener]);
    let sensor = entry
        .instance()
        .unwrap()
        .as_any()
        .downcast_ref::<MockSensor>()
        .unwrap();
    assert_eq!(sensor.stopped_sessions(), &[controller]);
    manager.assert_invariants();

    manager.lost_client(listener);
    assert!(!manager.sensor_entry("accel").unwrap().is_live());
    manager.assert_invariants();
}

#[test]
fn lost_client_with_no_grant_is_a_no_op() {
    let (mut manager, _drain) = new_manager();
    register_accel(&mut manager);

    let session = manager.request_control_sensor("accel");
    manager.lost_client(9999);

    let entry = manager.sensor_entry("accel").unwrap();
    assert_eq!(entry.controlling_session(), session);
    manager.assert_invariants();
}

#[test]
fn release_drops_the_sessions_sensor_requests() {
    let (mut manager, _drain) = new_manager();
    register_accel(&mut manager);

    let s1 = manager.request_control_sensor("accel");
    let s2 = manager.request_listen_sensor("accel");

    assert!(manager.release_sensor("accel", s2));

    let entry = manager.sensor_entry("accel").unwrap();
    let sensor = entry
        .instance()
        .unwrap()
        .as_any()
        .downcast_ref::<MockSensor>()
        .unwrap();
    assert_eq!(sensor.standby_override(s2), Some(false));
    assert!(sensor.interval_request_removed(s2));
    assert!(sensor.data_range_request_removed(s2));

    assert!(manager.release_sensor("accel", s1));
}

#[test]
fn property_arbitration_follows_the_sessions() {
    let (mut manager, _drain) = new_manager();
    let mut properties = HashMap::new();
    properties.insert("interval".to_string(), 5u32);
    manager.register_adaptor("acceladaptor", "mockadaptor", properties);
    manager.register_chain("accelchain", "mockchain");
    manager.register_sensor("accel", "mocksensor");

    let s1 = manager.request_listen_sensor("accel;chain=accelchain");
    let s2 = manager.request_listen_sensor("accel");

    assert_eq!(manager.set_property_request(s1, "interval", "acceladaptor", 10), 10);
    assert_eq!(manager.set_property_request(s2, "interval", "acceladaptor", 25), 25);

    assert!(manager.release_sensor("accel", s2));
    assert_eq!(manager.winning_property_value("interval", "acceladaptor"), 10);

    assert!(manager.release_sensor("accel", s1));
    // Back to the declared default.
    assert_eq!(manager.winning_property_value("interval", "acceladaptor"), 5);
    manager.assert_invariants();
}

#[test]
fn operational_state_fans_out_to_live_adaptors() {
    let (mut manager, _drain) = new_manager();
    register_accel(&mut manager);
    let mut signals = manager.subscribe_signals();

    assert!(manager.request_device_adaptor("acceladaptor"));

    manager.display_state_changed(false);
    assert_eq!(signals.try_recv().unwrap(), ManagerSignal::StopCalibration);
    {
        let adaptor = adaptor_state(&manager);
        assert!(adaptor.is_screen_blanked());
        assert!(adaptor.is_standby());
    }

    manager.display_state_changed(true);
    assert_eq!(signals.try_recv().unwrap(), ManagerSignal::ResumeCalibration);
    assert_eq!(signals.try_recv().unwrap(), ManagerSignal::DisplayOn);
    {
        let adaptor = adaptor_state(&manager);
        assert!(!adaptor.is_screen_blanked());
        assert!(!adaptor.is_standby());
    }

    manager.device_psm_state_changed(true);
    assert!(manager.psm_state());
    assert_eq!(signals.try_recv().unwrap(), ManagerSignal::StopCalibration);

    // Display-on while in power save does not resume calibration.
    manager.display_state_changed(false);
    assert_eq!(signals.try_recv().unwrap(), ManagerSignal::StopCalibration);
    manager.display_state_changed(true);
    assert_eq!(signals.try_recv().unwrap(), ManagerSignal::DisplayOn);

    manager.device_psm_state_changed(false);
    assert_eq!(signals.try_recv().unwrap(), ManagerSignal::ResumeCalibration);

    assert!(manager.release_device_adaptor("acceladaptor"));
}

#[test]
fn refcounted_pipeline_requests_through_the_facade() {
    let (mut manager, _drain) = new_manager();
    register_accel(&mut manager);

    assert!(manager.request_chain("accelchain"));
    assert!(manager.request_chain("accelchain"));
    assert_eq!(manager.pipelines().chain_refcount("accelchain"), Some(2));

    assert!(manager.release_chain("accelchain"));
    assert!(manager.pipelines().chain_is_live("accelchain"));
    assert!(manager.release_chain("accelchain"));
    assert!(!manager.pipelines().chain_is_live("accelchain"));

    assert!(!manager.release_chain("accelchain"));
    assert_eq!(manager.last_error().kind, ErrorKind::NotInstantiated);

    assert!(!manager.request_chain("ghostchain"));
    assert_eq!(manager.last_error().kind, ErrorKind::IdNotRegistered);
    manager.assert_invariants();
}

#[test]
fn failed_adaptor_start_surfaces_through_the_facade() {
    let (mut manager, _drain) = new_manager();
    manager.register_adaptor("broken", "failingadaptor", HashMap::new());

    assert!(!manager.request_device_adaptor("broken"));
    assert_eq!(manager.last_error().kind, ErrorKind::AdaptorNotStarted);
    assert!(!manager.pipelines().adaptors.entry("broken").unwrap().is_live());
    manager.assert_invariants();
}

#[test]
fn status_dump_lists_every_kind() {
    let (mut manager, _drain) = new_manager();
    register_accel(&mut manager);

    let session = manager.request_control_sensor("accel;chain=accelchain");
    assert!(session >= 1);

    let mut output = Vec::new();
    manager.print_status(&mut output);
    let text = output.concat();

    assert!(text.contains("  Adaptors:\n"));
    assert!(text.contains("    mockadaptor [1 listener(s)]\n"));
    assert!(text.contains("  Chains:\n"));
    assert!(text.contains("    mockchain [1 listener(s)]. Running\n"));
    assert!(text.contains("  Logical sensors:\n"));
    // No data socket is connected, so the PID is unknown.
    assert!(text.contains("    mocksensor [Control (PID: n/a) + No listen sessions]. Stopped\n"));

    assert!(manager.release_sensor("accel", session));
    let mut output = Vec::new();
    manager.print_status(&mut output);
    let text = output.concat();
    assert!(text.contains("    mockadaptor [0 listener(s)]\n"));
    assert!(text.contains("    mockchain [0 listener(s)]. Stopped\n"));
    assert!(text.contains("    mocksensor [No control, No listen sessions]. Stopped\n"));
}

#[test]
fn service_registration_claims_path_and_name() {
    let (mut manager, _drain) = new_manager();
    assert!(manager.register_service());

    let bus = manager
        .bus()
        .as_any()
        .downcast_ref::<LocalBus>()
        .unwrap();
    assert!(bus.is_registered(OBJECT_PATH));
    assert_eq!(bus.service_name(), Some(sensord_daemon::SERVICE_NAME));

    // A second registration fails on the service-name claim.
    assert!(!manager.register_service());
    assert_eq!(manager.last_error().kind, ErrorKind::CanNotRegisterService);
}

#[test]
fn failures_are_signalled_on_the_bus() {
    let (mut manager, _drain) = new_manager();
    register_accel(&mut manager);

    let _ = manager.request_control_sensor("nope");
    let _ = manager.request_control_sensor("accel");
    let _ = manager.request_control_sensor("accel");

    let bus = manager
        .bus()
        .as_any()
        .downcast_ref::<LocalBus>()
        .unwrap();
    assert_eq!(
        bus.emitted_errors(),
        &[ErrorKind::IdNotRegistered, ErrorKind::AlreadyUnderControl]
    );
}
