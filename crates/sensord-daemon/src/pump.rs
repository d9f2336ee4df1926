//! Producer-to-I/O-thread sample hand-off.
//!
//! Sensor pipelines run their own producer threads; the socket belongs to
//! the I/O thread. Samples cross that boundary through a bounded queue: the
//! writer copies the payload into a fresh buffer and enqueues it without ever
//! blocking, and the I/O thread drains one record at a time and forwards it
//! to the transport gateway. A full queue drops the sample with a warning;
//! there is no back-pressure and no coalescing. Ordering is FIFO per
//! producer.

use sensord_core::{PipePacket, SessionId};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::warn;

/// Creates the pump with the given queue capacity.
pub fn sample_pump(capacity: usize) -> (SampleWriter, SampleDrain) {
    let (tx, rx) = mpsc::channel(capacity);
    (SampleWriter { tx }, SampleDrain { rx })
}

/// Producer-side handle. Cheap to clone; safe to use from any thread.
#[derive(Clone)]
pub struct SampleWriter {
    tx: mpsc::Sender<PipePacket>,
}

impl SampleWriter {
    /// Copies `payload` and enqueues it for `session_id`. Returns false when
    /// the queue is full or the daemon is shutting down; the sample is
    /// dropped in either case.
    pub fn write(&self, session_id: SessionId, payload: &[u8]) -> bool {
        match self.tx.try_send(PipePacket::new(session_id, payload)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(session_id, "sample queue full, dropping sample");
                false
            }
            Err(TrySendError::Closed(_)) => {
                warn!(session_id, "sample queue closed, dropping sample");
                false
            }
        }
    }
}

/// Consumer side, owned by the I/O thread's event loop.
pub struct SampleDrain {
    rx: mpsc::Receiver<PipePacket>,
}

impl SampleDrain {
    pub async fn recv(&mut self) -> Option<PipePacket> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<PipePacket> {
        self.rx.try_recv().ok()
    }
}
