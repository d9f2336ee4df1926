//! Session identifiers and the sample record that crosses threads.

/// Handle representing one client's grant on one logical sensor.
///
/// Allocated from a monotonically increasing counter, never reused within a
/// process lifetime. Zero is reserved as "no session"; negative values are
/// the invalid sentinel.
pub type SessionId = i64;

/// Sentinel for "no valid session" results.
pub const INVALID_SESSION: SessionId = -1;

/// Reserved "no session" value; never allocated.
pub const NO_SESSION: SessionId = 0;

/// One sample on its way from a producer thread to the I/O thread.
///
/// The payload is an opaque byte run whose layout is defined by the sensor;
/// the daemon only routes it. The buffer is a fresh copy owned by the packet,
/// handed to the consumer on dequeue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipePacket {
    pub session_id: SessionId,
    pub payload: Vec<u8>,
}

impl PipePacket {
    pub fn new(session_id: SessionId, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            session_id,
            payload: payload.into(),
        }
    }
}
