//! TDMA slot scheduler
//!
//! Divides a fixed superframe into `nslots` equal slots and invokes the
//! handler assigned to each slot, in order, once per superframe. Slot 0 is
//! conventionally reserved for the clock beacon; ranging services claim the
//! remaining slots.

use std::sync::{Arc, Mutex};

use tracing::trace;

use crate::host::{lock, TimerDriver, TimerHandle};
use crate::{Error, Result};

/// Callback invoked when a slot's turn comes around. Receives the slot index.
pub type SlotHandler = Box<dyn FnMut(u16) + Send>;

struct Slots {
    idx: u16,
    handlers: Vec<Option<SlotHandler>>,
}

/// Periodic slot scheduler over a fixed superframe
///
/// The driving ticker fires `nslots` times per superframe; each tick advances
/// the slot index (wrapping to 0 after the last slot) and runs that slot's
/// handler, if one is assigned. Unassigned slots pass in silence.
pub struct Tdma<D: TimerDriver> {
    slots: Arc<Mutex<Slots>>,
    nslots: u16,
    timer: D::Handle,
}

impl<D: TimerDriver> Tdma<D> {
    /// Creates a scheduler for `nslots` slots over a superframe of
    /// `period_us` microseconds and starts its ticker.
    ///
    /// `nslots` must be at least 1.
    pub fn new(driver: &D, period_us: u32, nslots: u16) -> Result<Self> {
        if nslots == 0 {
            return Err(Error::InvalidConfiguration);
        }

        let slots = Arc::new(Mutex::new(Slots {
            // Starts one before slot 0, so the first tick lands on slot 0.
            idx: nslots - 1,
            handlers: (0..nslots).map(|_| None).collect(),
        }));

        let ticker_slots = slots.clone();
        let timer = driver.periodic(
            period_us / u32::from(nslots),
            Box::new(move || {
                let mut slots = lock(&ticker_slots);
                slots.idx = (slots.idx + 1) % nslots;
                let idx = slots.idx;
                trace!(slot = idx, "slot boundary");
                if let Some(handler) = slots.handlers[usize::from(idx)].as_mut() {
                    handler(idx);
                }
            }),
        );

        Ok(Tdma { slots, nslots, timer })
    }

    /// Assigns `handler` to `slot`, replacing any previous assignment.
    pub fn assign_slot(&self, slot: u16, handler: SlotHandler) -> Result<()> {
        if slot >= self.nslots {
            return Err(Error::SlotOutOfRange { slot, nslots: self.nslots });
        }
        lock(&self.slots).handlers[usize::from(slot)] = Some(handler);
        Ok(())
    }

    /// Releases `slot`, leaving it silent.
    pub fn release_slot(&self, slot: u16) -> Result<()> {
        if slot >= self.nslots {
            return Err(Error::SlotOutOfRange { slot, nslots: self.nslots });
        }
        lock(&self.slots).handlers[usize::from(slot)] = None;
        Ok(())
    }

    /// The number of slots per superframe.
    pub fn nslots(&self) -> u16 {
        self.nslots
    }

    /// The slot index most recently entered.
    pub fn current_slot(&self) -> u16 {
        lock(&self.slots).idx
    }
}

impl<D: TimerDriver> Drop for Tdma<D> {
    fn drop(&mut self) {
        self.timer.stop();
    }
}
