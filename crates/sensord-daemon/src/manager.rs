//! The sensor manager facade.
//!
//! Single owner of the whole object registry: logical-sensor entries with
//! their session grants, the refcounted chain/adaptor pipelines, the property
//! arbitrator, the transport gateway handle and the control-bus
//! registrations. Every method here runs on the daemon's one I/O thread (see
//! [`crate::events`]); nothing blocks and nothing re-enters.
//!
//! Lifecycle rules: a sensor instance exists exactly while at least one
//! session (the single controller or any listener) holds a grant on it;
//! chains and adaptors exist exactly while their reference count is positive.
//! Public operations clear the current error on entry, set it on failure and
//! report the failure through their return value; the detailed error stays
//! queryable afterwards. Violations of the bookkeeping invariants are bugs
//! and abort.

use std::collections::{BTreeMap, HashMap};

use sensord_core::error::{ErrorKind, ManagerError};
use sensord_core::{idutils, Filter, PipelineRef, SensorChannel, SessionId, INVALID_SESSION};
use tokio::sync::broadcast;
use tracing::{debug, error, warn};

use crate::bus::{ControlBus, OBJECT_PATH, SERVICE_NAME};
use crate::pipelines::{AdaptorFactory, ChainFactory, FilterFactory, Pipelines};
use crate::properties::PropertyArbitrator;
use crate::pump::SampleWriter;
use crate::socket::SocketHandler;

/// Builds a logical sensor. Receives the full id (parameter suffix included)
/// and a context for acquiring pipeline dependencies; must not touch the
/// facade itself.
pub type SensorFactory = fn(&str, &mut SensorContext<'_>) -> Box<dyn SensorChannel>;

/// What a sensor factory gets to work with during construction.
pub struct SensorContext<'a> {
    pub pipelines: &'a mut Pipelines,
    pub pump: SampleWriter,
}

/// Broadcast notifications driven by operational-state changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerSignal {
    ResumeCalibration,
    StopCalibration,
    DisplayOn,
}

/// Registry entry for one logical-sensor id.
pub struct SensorInstanceEntry {
    type_name: String,
    instance: Option<Box<dyn SensorChannel>>,
    controlling_session: SessionId,
    listen_sessions: Vec<SessionId>,
}

impl SensorInstanceEntry {
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn is_live(&self) -> bool {
        self.instance.is_some()
    }

    pub fn instance(&self) -> Option<&dyn SensorChannel> {
        self.instance.as_deref()
    }

    pub fn controlling_session(&self) -> SessionId {
        self.controlling_session
    }

    pub fn listen_sessions(&self) -> &[SessionId] {
        &self.listen_sessions
    }

    fn holds(&self, session: SessionId) -> bool {
        (self.controlling_session > 0 && self.controlling_session == session)
            || self.listen_sessions.contains(&session)
    }
}

pub struct SensorManager {
    sensor_factories: HashMap<String, SensorFactory>,
    sensors: BTreeMap<String, SensorInstanceEntry>,
    pipelines: Pipelines,
    arbitrator: PropertyArbitrator,
    socket: SocketHandler,
    bus: Box<dyn ControlBus>,
    pump_writer: SampleWriter,
    signals: broadcast::Sender<ManagerSignal>,
    session_counter: SessionId,
    display_on: bool,
    power_save: bool,
    last_error: ManagerError,
}

impl SensorManager {
    pub fn new(bus: Box<dyn ControlBus>, socket: SocketHandler, pump_writer: SampleWriter) -> Self {
        let (signals, _) = broadcast::channel(16);
        Self {
            sensor_factories: HashMap::new(),
            sensors: BTreeMap::new(),
            pipelines: Pipelines::new(),
            arbitrator: PropertyArbitrator::new(),
            socket,
            bus,
            pump_writer,
            signals,
            session_counter: 0,
            display_on: true,
            power_save: false,
            last_error: ManagerError::none(),
        }
    }

    // =========================================================================
    // Registration (driven by plugin/config loading at startup)
    // =========================================================================

    pub fn register_sensor_factory(&mut self, type_name: &str, factory: SensorFactory) {
        self.sensor_factories.insert(type_name.to_string(), factory);
    }

    pub fn has_sensor_factory(&self, type_name: &str) -> bool {
        self.sensor_factories.contains_key(type_name)
    }

    pub fn register_sensor(&mut self, id: &str, type_name: &str) {
        assert!(idutils::is_clean(id), "parameterized sensor id '{id}'");
        let previous = self.sensors.insert(
            id.to_string(),
            SensorInstanceEntry {
                type_name: type_name.to_string(),
                instance: None,
                controlling_session: INVALID_SESSION,
                listen_sessions: Vec::new(),
            },
        );
        if let Some(previous) = previous {
            assert!(
                !previous.is_live(),
                "sensor '{id}' re-registered while instantiated"
            );
            warn!(id, "sensor entry replaced");
        }
    }

    pub fn register_chain_factory(&mut self, type_name: &str, factory: ChainFactory) {
        self.pipelines.register_chain_factory(type_name, factory);
    }

    pub fn register_chain(&mut self, id: &str, type_name: &str) {
        self.pipelines.register_chain(id, type_name);
    }

    pub fn register_adaptor_factory(&mut self, type_name: &str, factory: AdaptorFactory) {
        self.pipelines.adaptors.register_factory(type_name, factory);
    }

    /// Declares an adaptor id. The construction property map doubles as the
    /// arbitration default for each declared property.
    pub fn register_adaptor(&mut self, id: &str, type_name: &str, properties: HashMap<String, u32>) {
        for (property, value) in &properties {
            self.arbitrator.set_default(property, id, *value as i32);
        }
        self.pipelines.adaptors.register_adaptor(id, type_name, properties);
    }

    pub fn register_filter_factory(&mut self, name: &str, factory: FilterFactory) {
        self.pipelines.register_filter_factory(name, factory);
    }

    /// Claims the manager's object path and service name on the control bus.
    pub fn register_service(&mut self) -> bool {
        self.clear_error();

        if !self.bus.is_connected() {
            self.set_error(ErrorKind::NotConnected, "control bus is not connected");
            return false;
        }
        if let Err(message) = self.bus.register_object(OBJECT_PATH) {
            self.set_error(ErrorKind::CanNotRegisterObject, message);
            return false;
        }
        if let Err(message) = self.bus.register_service(SERVICE_NAME) {
            self.set_error(ErrorKind::CanNotRegisterService, message);
            return false;
        }
        true
    }

    // =========================================================================
    // Session protocol
    // =========================================================================

    /// Grants exclusive control of the sensor, materializing the instance if
    /// this is the first grant. At most one controller exists per sensor.
    pub fn request_control_sensor(&mut self, id: &str) -> SessionId {
        self.clear_error();

        let clean = idutils::clean_id(id).to_string();
        let controlling = match self.sensors.get(&clean) {
            Some(entry) => entry.controlling_session,
            None => {
                self.set_error(
                    ErrorKind::IdNotRegistered,
                    format!("requested control sensor id '{clean}' not registered"),
                );
                return INVALID_SESSION;
            }
        };
        if controlling > 0 {
            self.set_error(
                ErrorKind::AlreadyUnderControl,
                "requested sensor already under control",
            );
            return INVALID_SESSION;
        }

        let session = self.create_session_id();
        let has_listeners = !self.sensors[&clean].listen_sessions.is_empty();
        if has_listeners {
            self.sensors
                .get_mut(&clean)
                .expect("entry checked above")
                .controlling_session = session;
        } else if !self.add_sensor(id, session, true) {
            return INVALID_SESSION;
        }

        session
    }

    /// Grants a read-only listen session, materializing the instance if this
    /// is the first grant of any kind.
    pub fn request_listen_sensor(&mut self, id: &str) -> SessionId {
        self.clear_error();

        let clean = idutils::clean_id(id).to_string();
        if !self.sensors.contains_key(&clean) {
            self.set_error(
                ErrorKind::IdNotRegistered,
                format!("requested listen sensor id '{clean}' not registered"),
            );
            return INVALID_SESSION;
        }

        let session = self.create_session_id();
        let live = {
            let entry = &self.sensors[&clean];
            !entry.listen_sessions.is_empty() || entry.controlling_session > 0
        };
        if live {
            self.sensors
                .get_mut(&clean)
                .expect("entry checked above")
                .listen_sessions
                .push(session);
        } else if !self.add_sensor(id, session, false) {
            return INVALID_SESSION;
        }

        session
    }

    /// Releases one session's grant. The id must be the clean id the grant
    /// was made under. Returns true when a grant was actually released.
    pub fn release_sensor(&mut self, id: &str, session: SessionId) -> bool {
        debug_assert!(idutils::is_clean(id), "parameterized id in release: '{id}'");
        self.clear_error();

        if !self.sensors.contains_key(id) {
            self.set_error(
                ErrorKind::IdNotRegistered,
                format!("requested sensor id '{id}' not registered"),
            );
            return false;
        }

        // The session's property requests are dropped before the session is
        // validated; a release with a bogus session still clears them.
        let changed = self.arbitrator.clear_requests(session);
        self.apply_property_changes(&changed);
        if let Some(sensor) = self
            .sensors
            .get_mut(id)
            .and_then(|entry| entry.instance.as_mut())
        {
            sensor.set_standby_override(session, false);
            sensor.remove_interval_request(session);
            sensor.remove_data_range_request(session);
        }

        let no_sessions = {
            let entry = &self.sensors[id];
            entry.controlling_session < 0 && entry.listen_sessions.is_empty()
        };
        if no_sessions {
            self.set_error(
                ErrorKind::NotInstantiated,
                "sensor has not been instantiated, no session to release",
            );
            return false;
        }

        let (is_controller, listener_pos) = {
            let entry = &self.sensors[id];
            (
                entry.controlling_session > 0 && entry.controlling_session == session,
                entry.listen_sessions.iter().position(|s| *s == session),
            )
        };

        let mut released = false;
        if is_controller {
            let teardown = {
                let entry = self.sensors.get_mut(id).expect("entry checked above");
                entry.controlling_session = INVALID_SESSION;
                entry.listen_sessions.is_empty()
            };
            if teardown {
                self.remove_sensor(id);
            }
            released = true;
        } else if let Some(pos) = listener_pos {
            let teardown = {
                let entry = self.sensors.get_mut(id).expect("entry checked above");
                entry.listen_sessions.remove(pos);
                entry.listen_sessions.is_empty() && entry.controlling_session == INVALID_SESSION
            };
            if teardown {
                self.remove_sensor(id);
            }
            released = true;
        } else {
            self.set_error(
                ErrorKind::NotInstantiated,
                "invalid session id, no session to release",
            );
        }

        self.socket.remove_session(session);
        released
    }

    /// Client disconnect: quiesce and release whichever grant the session
    /// held. At most one entry can match.
    pub fn lost_client(&mut self, session: SessionId) {
        let Some(id) = self
            .sensors
            .iter()
            .find(|(_, entry)| entry.holds(session))
            .map(|(id, _)| id.clone())
        else {
            debug!(session, "lost session held no sensor grant");
            return;
        };

        debug!(session, sensor = %id, "lost session");
        if let Some(sensor) = self
            .sensors
            .get_mut(&id)
            .and_then(|entry| entry.instance.as_mut())
        {
            sensor.stop(session);
        }
        self.release_sensor(&id, session);
    }

    /// Builds the sensor instance for its first grant and registers it on the
    /// control bus. Returns false with the error set (or, for an instance
    /// that reports itself invalid, silently) on failure.
    fn add_sensor(&mut self, id: &str, session: SessionId, controlling: bool) -> bool {
        self.clear_error();

        let clean = idutils::clean_id(id).to_string();
        let type_name = match self.sensors.get(&clean) {
            Some(entry) => entry.type_name.clone(),
            None => {
                self.set_error(
                    ErrorKind::IdNotRegistered,
                    format!("instance for sensor type '{clean}' not registered"),
                );
                return false;
            }
        };

        let Some(factory) = self.sensor_factories.get(&type_name).copied() else {
            self.set_error(
                ErrorKind::FactoryNotRegistered,
                format!("factory for sensor type '{type_name}' not registered"),
            );
            return false;
        };

        let mut context = SensorContext {
            pipelines: &mut self.pipelines,
            pump: self.pump_writer.clone(),
        };
        let sensor = factory(id, &mut context);

        if !sensor.is_valid() {
            debug!(id, "discarding invalid sensor instance");
            let dependencies = sensor.dependencies().to_vec();
            drop(sensor);
            self.release_dependencies(&dependencies);
            return false;
        }

        {
            let entry = self.sensors.get_mut(&clean).expect("entry checked above");
            assert!(entry.instance.is_none(), "sensor '{clean}' instantiated twice");
            assert!(
                entry.listen_sessions.is_empty()
                    && entry.controlling_session == INVALID_SESSION,
                "sensor '{clean}' has sessions without an instance"
            );
            if controlling {
                entry.controlling_session = session;
            } else {
                entry.listen_sessions.push(session);
            }
            entry.instance = Some(sensor);
        }

        let path = format!("{OBJECT_PATH}/{clean}");
        if let Err(message) = self.bus.register_object(&path) {
            self.set_error(ErrorKind::CanNotRegisterObject, message);
            let entry = self.sensors.get_mut(&clean).expect("entry checked above");
            entry.controlling_session = INVALID_SESSION;
            entry.listen_sessions.clear();
            let sensor = entry.instance.take().expect("instance recorded above");
            let dependencies = sensor.dependencies().to_vec();
            drop(sensor);
            self.release_dependencies(&dependencies);
            return false;
        }

        true
    }

    /// Tears the instance down once the last grant is gone. The entry stays
    /// registered.
    fn remove_sensor(&mut self, id: &str) {
        let sensor = {
            let entry = self.sensors.get_mut(id).expect("removing unknown sensor");
            assert!(
                entry.listen_sessions.is_empty()
                    && entry.controlling_session == INVALID_SESSION,
                "sensor '{id}' torn down with live sessions"
            );
            entry.instance.take().expect("removing uninstantiated sensor")
        };

        self.bus.unregister_object(&format!("{OBJECT_PATH}/{id}"));
        let dependencies = sensor.dependencies().to_vec();
        drop(sensor);
        self.release_dependencies(&dependencies);
        debug!(id, "sensor instance destroyed");
    }

    fn release_dependencies(&mut self, dependencies: &[PipelineRef]) {
        for dependency in dependencies {
            let result = match dependency {
                PipelineRef::Chain(chain_id) => self.pipelines.release_chain(chain_id),
                PipelineRef::Adaptor(adaptor_id) => self.pipelines.adaptors.release(adaptor_id),
            };
            if let Err(err) = result {
                warn!(%err, "sensor dependency release failed");
            }
        }
    }

    fn create_session_id(&mut self) -> SessionId {
        self.session_counter += 1;
        self.session_counter
    }

    // =========================================================================
    // Pipelines and filters (facade wrappers with error reporting)
    // =========================================================================

    pub fn request_chain(&mut self, id: &str) -> bool {
        self.clear_error();
        let result = self.pipelines.request_chain(id);
        self.report(result)
    }

    pub fn release_chain(&mut self, id: &str) -> bool {
        self.clear_error();
        let result = self.pipelines.release_chain(id);
        self.report(result)
    }

    pub fn request_device_adaptor(&mut self, id: &str) -> bool {
        self.clear_error();
        let result = self.pipelines.adaptors.request(id);
        self.report(result)
    }

    pub fn release_device_adaptor(&mut self, id: &str) -> bool {
        self.clear_error();
        let result = self.pipelines.adaptors.release(id);
        self.report(result)
    }

    pub fn instantiate_filter(&mut self, name: &str) -> Option<Box<dyn Filter>> {
        self.pipelines.instantiate_filter(name)
    }

    // =========================================================================
    // Property arbitration
    // =========================================================================

    /// Records a session's request and applies the new winning value to the
    /// adaptor. Returns the winning value.
    pub fn set_property_request(
        &mut self,
        session: SessionId,
        property: &str,
        adaptor: &str,
        value: i32,
    ) -> i32 {
        let winner = self.arbitrator.set_request(session, property, adaptor, value);
        self.apply_property_request(property, adaptor);
        winner
    }

    pub fn winning_property_value(&self, property: &str, adaptor: &str) -> i32 {
        self.arbitrator.winning_value(property, adaptor)
    }

    fn apply_property_changes(&mut self, pairs: &[(String, String)]) {
        for (property, adaptor) in pairs {
            self.apply_property_request(property, adaptor);
        }
    }

    fn apply_property_request(&mut self, property: &str, adaptor: &str) {
        let value = self.arbitrator.winning_value(property, adaptor);
        if !self.pipelines.adaptors.contains(adaptor) {
            warn!(property, adaptor, "setting property for nonexistent adaptor");
            return;
        }
        match self.pipelines.adaptors.adaptor_mut(adaptor) {
            Some(instance) => instance.set_property(property, value as u32),
            // Not instantiated: the value is picked up from the arbitrator
            // the next time the adaptor starts.
            None => debug!(property, adaptor, "property request for idle adaptor"),
        }
    }

    // =========================================================================
    // Operational state
    // =========================================================================

    pub fn display_state_changed(&mut self, display_on: bool) {
        debug!(display_on, "display state changed");
        self.display_on = display_on;

        if display_on {
            if !self.power_save {
                let _ = self.signals.send(ManagerSignal::ResumeCalibration);
            }
            let _ = self.signals.send(ManagerSignal::DisplayOn);
        } else {
            let _ = self.signals.send(ManagerSignal::StopCalibration);
        }

        for adaptor in self.pipelines.adaptors.iter_live_mut() {
            if display_on {
                adaptor.set_screen_blanked(false);
                adaptor.resume();
            } else {
                adaptor.set_screen_blanked(true);
                adaptor.standby();
            }
        }
    }

    pub fn device_psm_state_changed(&mut self, power_save: bool) {
        self.power_save = power_save;
        if power_save {
            let _ = self.signals.send(ManagerSignal::StopCalibration);
        } else if self.display_on {
            let _ = self.signals.send(ManagerSignal::ResumeCalibration);
        }
    }

    pub fn psm_state(&self) -> bool {
        self.power_save
    }

    pub fn display_state(&self) -> bool {
        self.display_on
    }

    pub fn subscribe_signals(&self) -> broadcast::Receiver<ManagerSignal> {
        self.signals.subscribe()
    }

    // =========================================================================
    // Per-sensor operations mirrored from the bus objects
    // =========================================================================

    pub fn start_sensor(&mut self, id: &str, session: SessionId) -> bool {
        let clean = idutils::clean_id(id);
        let Some(entry) = self.sensors.get_mut(clean) else {
            return false;
        };
        if !entry.holds(session) {
            return false;
        }
        entry
            .instance
            .as_mut()
            .map(|sensor| sensor.start(session))
            .unwrap_or(false)
    }

    pub fn stop_sensor(&mut self, id: &str, session: SessionId) -> bool {
        let clean = idutils::clean_id(id);
        let Some(entry) = self.sensors.get_mut(clean) else {
            return false;
        };
        if !entry.holds(session) {
            return false;
        }
        entry
            .instance
            .as_mut()
            .map(|sensor| sensor.stop(session))
            .unwrap_or(false)
    }

    // =========================================================================
    // Samples
    // =========================================================================

    /// Forwards one dequeued sample to the transport gateway. The copy dies
    /// here regardless of the outcome.
    pub fn forward_sample(&self, packet: sensord_core::PipePacket) {
        if !self.socket.write(packet.session_id, &packet.payload) {
            warn!(session = packet.session_id, "failed to write data to socket");
        }
    }

    // =========================================================================
    // Status and introspection
    // =========================================================================

    /// Appends the human-readable registry listing to `output`.
    pub fn print_status(&self, output: &mut Vec<String>) {
        output.push("  Adaptors:\n".to_string());
        for (_, entry) in self.pipelines.adaptors.iter() {
            output.push(format!(
                "    {} [{} listener(s)]\n",
                entry.type_name(),
                entry.refcount()
            ));
        }

        output.push("  Chains:\n".to_string());
        for (_, type_name, refcount, running) in self.pipelines.chain_status() {
            output.push(format!(
                "    {} [{} listener(s)]. {}\n",
                type_name,
                refcount,
                if running { "Running" } else { "Stopped" }
            ));
        }

        output.push("  Logical sensors:\n".to_string());
        for entry in self.sensors.values() {
            let mut line = format!("    {} [", entry.type_name);
            if entry.controlling_session > 0 {
                line.push_str(&format!(
                    "Control (PID: {}) + ",
                    self.socket_to_pid(entry.controlling_session)
                ));
            } else {
                line.push_str("No control, ");
            }
            if entry.listen_sessions.is_empty() {
                line.push_str("No listen sessions]");
            } else {
                let pids: Vec<String> = entry
                    .listen_sessions
                    .iter()
                    .map(|session| self.socket_to_pid(*session))
                    .collect();
                line.push_str(&format!(
                    "{} listen session(s), PID(s): {}]",
                    entry.listen_sessions.len(),
                    pids.join(", ")
                ));
            }
            let running = entry
                .instance
                .as_ref()
                .is_some_and(|sensor| sensor.running());
            line.push_str(&format!(". {}\n", if running { "Running" } else { "Stopped" }));
            output.push(line);
        }
    }

    fn socket_to_pid(&self, session: SessionId) -> String {
        self.socket
            .peer_label(session)
            .unwrap_or_else(|| "n/a".to_string())
    }

    pub fn sensor_entry(&self, id: &str) -> Option<&SensorInstanceEntry> {
        self.sensors.get(id)
    }

    pub fn pipelines(&self) -> &Pipelines {
        &self.pipelines
    }

    pub fn last_error(&self) -> &ManagerError {
        &self.last_error
    }

    pub fn bus(&self) -> &dyn ControlBus {
        self.bus.as_ref()
    }

    /// Panics when the registry bookkeeping disagrees with itself.
    pub fn assert_invariants(&self) {
        let mut seen = std::collections::HashSet::new();
        for (id, entry) in &self.sensors {
            let has_sessions =
                entry.controlling_session != INVALID_SESSION || !entry.listen_sessions.is_empty();
            assert_eq!(
                entry.instance.is_some(),
                has_sessions,
                "sensor '{id}' instance/session mismatch"
            );
            if entry.controlling_session != INVALID_SESSION {
                assert!(
                    seen.insert(entry.controlling_session),
                    "session {} appears twice",
                    entry.controlling_session
                );
            }
            for session in &entry.listen_sessions {
                assert!(seen.insert(*session), "session {session} appears twice");
            }
        }
        for (id, entry) in self.pipelines.adaptors.iter() {
            assert_eq!(
                entry.is_live(),
                entry.refcount() > 0,
                "adaptor '{id}' instance/refcount mismatch"
            );
        }
        for (id, _, refcount, _) in self.pipelines.chain_status() {
            assert_eq!(
                self.pipelines.chain_is_live(id),
                refcount > 0,
                "chain '{id}' instance/refcount mismatch"
            );
        }
    }

    // =========================================================================
    // Error bookkeeping
    // =========================================================================

    fn clear_error(&mut self) {
        self.last_error = ManagerError::none();
    }

    fn set_error(&mut self, kind: ErrorKind, message: impl Into<String>) {
        let message = message.into();
        warn!(%kind, error = %message, "sensor manager error");
        self.last_error = ManagerError::new(kind, message);
        self.bus.emit_error(kind);
    }

    fn report(&mut self, result: Result<(), ManagerError>) -> bool {
        match result {
            Ok(()) => true,
            Err(err) => {
                self.set_error(err.kind, err.message);
                false
            }
        }
    }
}

impl Drop for SensorManager {
    fn drop(&mut self) {
        // Teardown contract: every entry must already be empty. Violations
        // are reported loudly but nothing is cleaned up here.
        for (id, entry) in &self.sensors {
            if entry.instance.is_some() {
                error!(%id, "sensor not released at teardown");
            }
        }
        for (id, entry) in self.pipelines.adaptors.iter() {
            if entry.is_live() {
                error!(%id, "device adaptor not released at teardown");
            }
        }
        for (id, _, _, _) in self.pipelines.chain_status() {
            if self.pipelines.chain_is_live(id) {
                error!(%id, "chain not released at teardown");
            }
        }
    }
}
