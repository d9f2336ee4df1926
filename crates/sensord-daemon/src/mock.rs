//! Mock sensor pipeline implementations.
//!
//! Simulated stand-ins for real adaptor/chain/sensor plugins, used by the
//! integration tests and the example configuration. The mock sensor accepts
//! id parameters so tests can exercise the construction paths:
//!
//! - `chain=<id>` / `adaptor=<id>` — acquire that pipeline dependency
//! - `invalid=true` — report the instance as invalid (it is discarded)
//! - `burst=<n>` — on start, emit `n` samples from a producer thread

use std::collections::{HashMap, HashSet};

use sensord_core::{idutils, Chain, DeviceAdaptor, Filter, PipelineRef, SensorChannel, SessionId};
use tracing::warn;

use crate::manager::{SensorContext, SensorManager};
use crate::pipelines::AdaptorRegistry;
use crate::pump::SampleWriter;

/// Registers every mock factory under its conventional type name.
pub fn register_builtin_factories(manager: &mut SensorManager) {
    manager.register_sensor_factory("mocksensor", MockSensor::factory);
    manager.register_chain_factory("mockchain", MockChain::factory);
    manager.register_adaptor_factory("mockadaptor", MockAdaptor::factory);
    manager.register_adaptor_factory("failingadaptor", FailingAdaptor::factory);
    manager.register_filter_factory("passthrough", PassthroughFilter::factory);
    manager.register_filter_factory("downsample", DownsampleFilter::factory);
}

// =============================================================================
// Adaptors
// =============================================================================

/// Records every lifecycle call so tests can assert on it.
pub struct MockAdaptor {
    id: String,
    started: bool,
    screen_blanked: bool,
    standby: bool,
    properties: HashMap<String, u32>,
    properties_before_start: HashSet<String>,
}

impl MockAdaptor {
    pub fn factory(id: &str) -> Box<dyn DeviceAdaptor> {
        Box::new(Self {
            id: id.to_string(),
            started: false,
            screen_blanked: false,
            standby: false,
            properties: HashMap::new(),
            properties_before_start: HashSet::new(),
        })
    }

    pub fn property(&self, name: &str) -> Option<u32> {
        self.properties.get(name).copied()
    }

    pub fn property_set_before_start(&self, name: &str) -> bool {
        self.properties_before_start.contains(name)
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn is_screen_blanked(&self) -> bool {
        self.screen_blanked
    }

    pub fn is_standby(&self) -> bool {
        self.standby
    }
}

impl DeviceAdaptor for MockAdaptor {
    fn id(&self) -> &str {
        &self.id
    }

    fn start_adaptor(&mut self) -> bool {
        self.started = true;
        true
    }

    fn stop_adaptor(&mut self) {
        self.started = false;
    }

    fn set_screen_blanked(&mut self, blanked: bool) {
        self.screen_blanked = blanked;
    }

    fn resume(&mut self) {
        self.standby = false;
    }

    fn standby(&mut self) {
        self.standby = true;
    }

    fn set_property(&mut self, name: &str, value: u32) {
        if !self.started {
            self.properties_before_start.insert(name.to_string());
        }
        self.properties.insert(name.to_string(), value);
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// Adaptor whose hardware never comes up.
pub struct FailingAdaptor {
    id: String,
}

impl FailingAdaptor {
    pub fn factory(id: &str) -> Box<dyn DeviceAdaptor> {
        Box::new(Self { id: id.to_string() })
    }
}

impl DeviceAdaptor for FailingAdaptor {
    fn id(&self) -> &str {
        &self.id
    }

    fn start_adaptor(&mut self) -> bool {
        false
    }

    fn stop_adaptor(&mut self) {}

    fn set_screen_blanked(&mut self, _blanked: bool) {}

    fn resume(&mut self) {}

    fn standby(&mut self) {}

    fn set_property(&mut self, _name: &str, _value: u32) {}

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

// =============================================================================
// Chains
// =============================================================================

/// Chain that acquires the adaptor named after it: `accelchain` pulls in
/// `acceladaptor`.
pub struct MockChain {
    id: String,
    dependencies: Vec<PipelineRef>,
}

impl MockChain {
    pub fn factory(id: &str, adaptors: &mut AdaptorRegistry) -> Box<dyn Chain> {
        let mut dependencies = Vec::new();
        let adaptor_id = format!("{}adaptor", id.strip_suffix("chain").unwrap_or(id));
        match adaptors.request(&adaptor_id) {
            Ok(()) => dependencies.push(PipelineRef::Adaptor(adaptor_id)),
            Err(err) => warn!(chain = id, %err, "chain adaptor unavailable"),
        }
        Box::new(Self {
            id: id.to_string(),
            dependencies,
        })
    }
}

impl Chain for MockChain {
    fn id(&self) -> &str {
        &self.id
    }

    fn running(&self) -> bool {
        !self.dependencies.is_empty()
    }

    fn dependencies(&self) -> &[PipelineRef] {
        &self.dependencies
    }
}

// =============================================================================
// Sensors
// =============================================================================

/// Parameter-driven mock logical sensor.
pub struct MockSensor {
    id: String,
    valid: bool,
    dependencies: Vec<PipelineRef>,
    writer: SampleWriter,
    burst: usize,
    active_sessions: Vec<SessionId>,
    stopped_sessions: Vec<SessionId>,
    standby_overrides: HashMap<SessionId, bool>,
    removed_interval_requests: Vec<SessionId>,
    removed_data_range_requests: Vec<SessionId>,
}

impl MockSensor {
    pub fn factory(id: &str, context: &mut SensorContext<'_>) -> Box<dyn SensorChannel> {
        let params = idutils::parse_parameters(id);
        let mut valid = params.get("invalid").map(String::as_str) != Some("true");
        let mut dependencies = Vec::new();

        if let Some(chain_id) = params.get("chain") {
            match context.pipelines.request_chain(chain_id) {
                Ok(()) => dependencies.push(PipelineRef::Chain(chain_id.clone())),
                Err(err) => {
                    warn!(sensor = id, %err, "sensor chain unavailable");
                    valid = false;
                }
            }
        }
        if let Some(adaptor_id) = params.get("adaptor") {
            match context.pipelines.adaptors.request(adaptor_id) {
                Ok(()) => dependencies.push(PipelineRef::Adaptor(adaptor_id.clone())),
                Err(err) => {
                    warn!(sensor = id, %err, "sensor adaptor unavailable");
                    valid = false;
                }
            }
        }

        let burst = params
            .get("burst")
            .and_then(|value| value.parse().ok())
            .unwrap_or(0);

        Box::new(Self {
            id: idutils::clean_id(id).to_string(),
            valid,
            dependencies,
            writer: context.pump.clone(),
            burst,
            active_sessions: Vec::new(),
            stopped_sessions: Vec::new(),
            standby_overrides: HashMap::new(),
            removed_interval_requests: Vec::new(),
            removed_data_range_requests: Vec::new(),
        })
    }

    pub fn stopped_sessions(&self) -> &[SessionId] {
        &self.stopped_sessions
    }

    pub fn standby_override(&self, session: SessionId) -> Option<bool> {
        self.standby_overrides.get(&session).copied()
    }

    pub fn interval_request_removed(&self, session: SessionId) -> bool {
        self.removed_interval_requests.contains(&session)
    }

    pub fn data_range_request_removed(&self, session: SessionId) -> bool {
        self.removed_data_range_requests.contains(&session)
    }
}

impl SensorChannel for MockSensor {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_valid(&self) -> bool {
        self.valid
    }

    fn running(&self) -> bool {
        !self.active_sessions.is_empty()
    }

    fn start(&mut self, session: SessionId) -> bool {
        if !self.active_sessions.contains(&session) {
            self.active_sessions.push(session);
        }
        if self.burst > 0 {
            let writer = self.writer.clone();
            let burst = self.burst;
            std::thread::spawn(move || {
                for index in 0..burst {
                    let payload = format!("sample-{index}");
                    writer.write(session, payload.as_bytes());
                }
            });
        }
        true
    }

    fn stop(&mut self, session: SessionId) -> bool {
        self.active_sessions.retain(|s| *s != session);
        self.stopped_sessions.push(session);
        true
    }

    fn set_standby_override(&mut self, session: SessionId, value: bool) {
        self.standby_overrides.insert(session, value);
    }

    fn remove_interval_request(&mut self, session: SessionId) {
        self.removed_interval_requests.push(session);
    }

    fn remove_data_range_request(&mut self, session: SessionId) {
        self.removed_data_range_requests.push(session);
    }

    fn dependencies(&self) -> &[PipelineRef] {
        &self.dependencies
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

// =============================================================================
// Filters
// =============================================================================

/// Copies every sample through unchanged.
pub struct PassthroughFilter;

impl PassthroughFilter {
    pub fn factory() -> Box<dyn Filter> {
        Box::new(Self)
    }
}

impl Filter for PassthroughFilter {
    fn name(&self) -> &str {
        "passthrough"
    }

    fn process(&mut self, payload: &[u8]) -> Option<Vec<u8>> {
        Some(payload.to_vec())
    }
}

/// Keeps the first sample of every window of `every`, swallowing the rest.
pub struct DownsampleFilter {
    every: usize,
    seen: usize,
}

impl DownsampleFilter {
    pub fn factory() -> Box<dyn Filter> {
        Box::new(Self { every: 2, seen: 0 })
    }

    pub fn with_ratio(every: usize) -> Self {
        Self {
            every: every.max(1),
            seen: 0,
        }
    }
}

impl Filter for DownsampleFilter {
    fn name(&self) -> &str {
        "downsample"
    }

    fn process(&mut self, payload: &[u8]) -> Option<Vec<u8>> {
        let keep = self.seen % self.every == 0;
        self.seen += 1;
        keep.then(|| payload.to_vec())
    }
}
