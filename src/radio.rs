//! Transceiver seam and completion-event dispatch
//!
//! The transceiver driver itself lives outside this crate; protocol engines
//! talk to it through the [`Radio`] trait and learn about completions through
//! [`RadioEvent`]s delivered by the host's event loop. Several protocol
//! engines can share the one physical radio by registering with a
//! [`Dispatcher`], which offers each event to the registered protocols until
//! one claims it.

use std::sync::Arc;

use crate::time::{Duration, Instant};

/// Identifies a protocol engine in the event-dispatch registry.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ProtocolId(pub u16);

/// A transceiver completion event, as delivered by the host event loop
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RadioEvent {
    /// A transmission completed.
    TxDone,
    /// A frame of `len` bytes was received.
    RxDone {
        /// Length of the received frame in bytes.
        len: usize,
    },
    /// The programmed receive timeout expired without a frame.
    RxTimeout,
    /// The receiver reported a corrupted or rejected frame.
    RxError,
    /// The transmitter failed to start or complete.
    TxError,
}

/// Interface to the (external) UWB transceiver driver
///
/// Buffer access and control operations mirror the driver's register-level
/// primitives; implementations are expected to be cheap wrappers. Only
/// `start_tx` can fail in a way the protocol layer has to react to: a
/// delayed transmission whose start time has already passed.
pub trait Radio: Send {
    /// Writes `data` into the transmit buffer at byte `offset`.
    fn write_tx(&mut self, offset: usize, data: &[u8]);

    /// Reads from the receive buffer at byte `offset` into `buf`.
    fn read_rx(&mut self, offset: usize, buf: &mut [u8]);

    /// Programs the transmit frame control for a payload of `len` bytes.
    fn write_tx_fctrl(&mut self, len: usize);

    /// Arms the receiver immediately after the next transmission completes.
    fn wait_for_response(&mut self, enable: bool);

    /// Programs the receive timeout, in UWB microseconds. Zero disables it.
    fn set_rx_timeout(&mut self, timeout_us: u32);

    /// Schedules the next transmission at `at` in radio time.
    ///
    /// The transceiver ignores the low 9 bits of the programmed value.
    fn set_delayed_start(&mut self, at: Instant);

    /// Starts the transmitter.
    ///
    /// Fails when a delayed start could not be honored; the caller must
    /// treat the current stage as failed.
    fn start_tx(&mut self) -> crate::Result<()>;

    /// Starts the receiver.
    fn start_rx(&mut self);

    /// Re-arms the receiver after a frame was rejected, keeping the current
    /// receive context.
    fn restart_rx(&mut self);

    /// Forces the transceiver out of any active TX/RX state.
    fn force_trx_off(&mut self);

    /// Current radio system time.
    fn sys_time(&self) -> Instant;

    /// Reception timestamp of the most recently received frame.
    fn rx_time(&self) -> Instant;

    /// Low 32 bits of the most recent transmission timestamp.
    fn tx_time_lo(&self) -> u32;

    /// Low 32 bits of the most recent reception timestamp.
    fn rx_time_lo(&self) -> u32;

    /// The calibrated transmit antenna delay.
    fn tx_antenna_delay(&self) -> Duration;

    /// Estimated on-air duration of a frame with `payload_len` payload
    /// bytes, in UWB microseconds.
    fn frame_duration(&self, payload_len: usize) -> u32;

    /// Length of the most recently received frame, in bytes.
    fn frame_len(&self) -> usize;
}

/// A protocol engine that consumes transceiver events
pub trait Protocol: Send + Sync {
    /// The engine's identity in the dispatch registry.
    fn id(&self) -> ProtocolId;

    /// Offers `event` to the engine.
    ///
    /// Returns `true` when the event belonged to this protocol and was
    /// consumed; `false` lets the dispatcher offer it to the next engine.
    fn handle(&self, event: RadioEvent) -> bool;
}

/// Event-dispatch registry for protocol engines sharing one transceiver
#[derive(Default)]
pub struct Dispatcher {
    protocols: Vec<Arc<dyn Protocol>>,
}

impl Dispatcher {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Dispatcher { protocols: Vec::new() }
    }

    /// Registers a protocol engine, replacing any engine with the same id.
    pub fn register(&mut self, protocol: Arc<dyn Protocol>) {
        let id = protocol.id();
        self.protocols.retain(|p| p.id() != id);
        self.protocols.push(protocol);
    }

    /// Removes the engine registered under `id`, if any.
    pub fn unregister(&mut self, id: ProtocolId) {
        self.protocols.retain(|p| p.id() != id);
    }

    /// Delivers `event` to the first engine that consumes it.
    ///
    /// Returns the id of the consuming engine, or `None` if nobody claimed
    /// the event.
    pub fn dispatch(&self, event: RadioEvent) -> Option<ProtocolId> {
        for protocol in &self.protocols {
            if protocol.handle(event) {
                return Some(protocol.id());
            }
        }
        None
    }
}
