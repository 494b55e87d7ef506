//! Beacon-driven clock synchronization
//!
//! One node in the network transmits a clock beacon in slot 0 of every
//! superframe; every other node tracks those beacons to anchor its slot
//! schedule in radio time. [`ClockSync`] keeps the latest beacon reception
//! timestamp, the measured beacon interval, and the node's own slot
//! transmission timestamp derived from them.
//!
//! When a beacon goes missing, a watchdog extrapolates the epoch forward by
//! one interval so dependent services keep a usable (if degraded) time base
//! until beacons return.

use std::sync::{Arc, Mutex, Weak};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::host::{lock, TimerDriver, TimerHandle};
use crate::time::{Duration, Instant, TIME_UNIT_S};

/// Configuration for the clock synchronization service
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct SyncConfig {
    /// This node's slot in the superframe.
    pub slot_id: u16,
    /// Number of slots per superframe.
    pub nslots: u16,
    /// Superframe period in radio clock ticks.
    pub superframe_period: u64,
    /// Slack added to the beacon interval before the watchdog fires, in
    /// microseconds.
    pub guard_us: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            slot_id: 1,
            nslots: 16,
            // 0.1 s at the nominal counter rate.
            superframe_period: 6_389_760_000,
            guard_us: 1_000,
        }
    }
}

/// A received clock beacon, as handed to [`ClockSync::on_beacon_received`]
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct BeaconFrame {
    /// Beacon sequence number, incremented by one per superframe.
    pub seq: u8,
    /// Radio timestamp at which the beacon was received.
    pub reception_timestamp: Instant,
    /// Clock correction factor reported by the beacon master.
    pub correction_factor: f32,
}

/// Synchronization quality of the local time base
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SyncState {
    /// No beacon seen yet.
    Unsynchronized,
    /// The epoch comes from a received beacon.
    Synchronized,
    /// The epoch was extrapolated by the watchdog after a missed beacon.
    Extrapolated,
}

/// Notification passed to the beacon postprocess callback
#[derive(Clone, Copy, Debug)]
pub struct BeaconEvent {
    /// Epoch of the current superframe.
    pub reception_timestamp: Instant,
    /// Measured beacon interval in microseconds, or `None` before two
    /// consecutive beacons have been seen.
    pub interval_us: Option<u64>,
    /// Whether this epoch was extrapolated rather than measured.
    pub extrapolated: bool,
}

struct Inner {
    state: SyncState,
    last_seq: Option<u8>,
    reception_timestamp: Option<Instant>,
    transmission_timestamp: Option<Instant>,
    correction_factor: f32,
    interval_us: Option<u64>,
    last_beacon_host_us: u64,
    fresh: bool,
}

type Postprocess = Box<dyn FnMut(&BeaconEvent) + Send>;

/// Tracks clock beacons and derives the node's slot epoch from them
pub struct ClockSync<D: TimerDriver> {
    config: SyncConfig,
    inner: Arc<Mutex<Inner>>,
    postprocess: Arc<Mutex<Option<Postprocess>>>,
    watchdog: Mutex<D::Handle>,
    driver: D,
}

impl<D: TimerDriver> ClockSync<D> {
    /// Creates the service in the unsynchronized state.
    pub fn new(driver: &D, config: SyncConfig) -> Self {
        let inner = Arc::new(Mutex::new(Inner {
            state: SyncState::Unsynchronized,
            last_seq: None,
            reception_timestamp: None,
            transmission_timestamp: None,
            correction_factor: 1.0,
            interval_us: None,
            last_beacon_host_us: 0,
            fresh: false,
        }));

        let weak_inner: Weak<Mutex<Inner>> = Arc::downgrade(&inner);
        let postprocess: Arc<Mutex<Option<Postprocess>>> = Arc::new(Mutex::new(None));
        let weak_postprocess = Arc::downgrade(&postprocess);
        let watchdog_config = config;

        let watchdog = driver.watchdog(Box::new(move || {
            let inner = weak_inner.upgrade()?;
            let event;
            let step_us;
            {
                let mut inner = lock(&inner);
                let interval = inner.interval_us?;
                let reception = inner.reception_timestamp?;
                step_us = interval + u64::from(watchdog_config.guard_us);
                let extrapolated = reception + Duration::from_uwb_us(step_us);
                inner.reception_timestamp = Some(extrapolated);
                inner.transmission_timestamp =
                    Some(slot_transmission_time(extrapolated, &watchdog_config));
                inner.state = SyncState::Extrapolated;
                warn!(
                    epoch = extrapolated.value(),
                    interval_us = interval,
                    "beacon missed, epoch extrapolated"
                );
                event = BeaconEvent {
                    reception_timestamp: extrapolated,
                    interval_us: Some(interval),
                    extrapolated: true,
                };
            }
            if let Some(postprocess) = weak_postprocess.upgrade() {
                if let Some(callback) = lock(&postprocess).as_mut() {
                    callback(&event);
                }
            }
            Some(step_us as u32)
        }));

        ClockSync {
            config,
            inner,
            postprocess,
            watchdog: Mutex::new(watchdog),
            driver: driver.clone(),
        }
    }

    /// Installs the callback run after every beacon, received or
    /// extrapolated.
    pub fn set_postprocess(&self, callback: Postprocess) {
        *lock(&self.postprocess) = Some(callback);
    }

    /// Feeds a received beacon into the service.
    ///
    /// The interval and correction factor are only taken from beacons whose
    /// sequence number directly follows the previous one; after a gap the
    /// epoch is re-anchored but the stale interval measurement is kept.
    pub fn on_beacon_received(&self, frame: &BeaconFrame) {
        lock(&self.watchdog).stop();

        let event;
        {
            let mut inner = lock(&self.inner);

            // Intervals are only measured between two received beacons; an
            // extrapolated epoch carries the guard slack and would skew the
            // measurement.
            let consecutive = inner.state == SyncState::Synchronized
                && match inner.last_seq {
                    Some(prev) => frame.seq == prev.wrapping_add(1),
                    None => false,
                };
            if consecutive {
                if let Some(prev_ts) = inner.reception_timestamp {
                    let delta = frame.reception_timestamp.duration_since(prev_ts);
                    let interval_us =
                        (delta.value() as f64 * TIME_UNIT_S * 1e6).round() as u64;
                    if interval_us > 0 {
                        inner.interval_us = Some(interval_us);
                    }
                    inner.correction_factor = frame.correction_factor;
                }
            }

            inner.last_seq = Some(frame.seq);
            inner.reception_timestamp = Some(frame.reception_timestamp);
            inner.transmission_timestamp =
                Some(slot_transmission_time(frame.reception_timestamp, &self.config));
            inner.state = SyncState::Synchronized;
            inner.fresh = true;
            inner.last_beacon_host_us = self.driver.now_us();

            debug!(
                seq = frame.seq,
                epoch = frame.reception_timestamp.value(),
                consecutive,
                "beacon received"
            );

            if let Some(interval) = inner.interval_us {
                let delay = interval + u64::from(self.config.guard_us);
                lock(&self.watchdog).arm(delay.min(u64::from(u32::MAX)) as u32);
            }

            event = BeaconEvent {
                reception_timestamp: frame.reception_timestamp,
                interval_us: inner.interval_us,
                extrapolated: false,
            };
        }

        if let Some(callback) = lock(&self.postprocess).as_mut() {
            callback(&event);
        }
    }

    /// Whether a new beacon epoch is due, judged by the host clock.
    ///
    /// Returns `false` once for the superframe whose beacon has already been
    /// consumed, then `true` as soon as the host clock runs past the measured
    /// interval.
    pub fn check_due(&self) -> bool {
        let mut inner = lock(&self.inner);
        if inner.fresh {
            inner.fresh = false;
            return false;
        }
        match inner.interval_us {
            Some(interval) => {
                self.driver.now_us().saturating_sub(inner.last_beacon_host_us) > interval
            }
            None => false,
        }
    }

    /// Current synchronization state.
    pub fn state(&self) -> SyncState {
        lock(&self.inner).state
    }

    /// Latest epoch, received or extrapolated.
    pub fn reception_timestamp(&self) -> Option<Instant> {
        lock(&self.inner).reception_timestamp
    }

    /// This node's slot transmission timestamp for the current superframe.
    pub fn transmission_timestamp(&self) -> Option<Instant> {
        lock(&self.inner).transmission_timestamp
    }

    /// Latest clock correction factor reported by the beacon master.
    pub fn correction_factor(&self) -> f32 {
        lock(&self.inner).correction_factor
    }

    /// Measured beacon interval, in microseconds.
    pub fn interval_us(&self) -> Option<u64> {
        lock(&self.inner).interval_us
    }

    /// Stops the watchdog, e.g. before tearing the service down.
    pub fn stop(&self) {
        lock(&self.watchdog).stop();
    }
}

fn slot_transmission_time(epoch: Instant, config: &SyncConfig) -> Instant {
    let slot_period = config.superframe_period / u64::from(config.nslots.max(1));
    Instant::truncated(epoch.value() + u64::from(config.slot_id) * slot_period)
}

/// Radio time `delay_us` UWB microseconds after the superframe `epoch`.
pub fn absolute_time(epoch: Instant, delay_us: u64) -> Instant {
    epoch + Duration::from_uwb_us(delay_us)
}

/// Radio time `delay_us` UWB microseconds after `now`.
pub fn relative_time(now: Instant, delay_us: u64) -> Instant {
    now + Duration::from_uwb_us(delay_us)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::mock::MockDriver;
    use crate::time::TIME_MAX;
    use std::sync::atomic::{AtomicUsize, Ordering};

    // 1 ms of radio time: 499.2 MHz x 128 ticks per second.
    const MS_TICKS: u64 = 63_897_600;

    fn beacon(seq: u8, ts: u64) -> BeaconFrame {
        BeaconFrame {
            seq,
            reception_timestamp: Instant::new(ts).unwrap(),
            correction_factor: 1.0,
        }
    }

    fn config() -> SyncConfig {
        SyncConfig {
            slot_id: 3,
            nslots: 8,
            superframe_period: 8 * MS_TICKS,
            guard_us: 100,
        }
    }

    #[test]
    fn interval_measured_from_consecutive_beacons() {
        let driver = MockDriver::default();
        let sync = ClockSync::new(&driver, config());
        assert_eq!(sync.state(), SyncState::Unsynchronized);

        sync.on_beacon_received(&beacon(10, 1_000));
        assert_eq!(sync.state(), SyncState::Synchronized);
        assert_eq!(sync.interval_us(), None);

        sync.on_beacon_received(&beacon(11, 1_000 + MS_TICKS));
        assert_eq!(sync.interval_us(), Some(1_000));
    }

    #[test]
    fn gap_in_sequence_keeps_previous_interval() {
        let driver = MockDriver::default();
        let sync = ClockSync::new(&driver, config());

        sync.on_beacon_received(&beacon(1, 0));
        sync.on_beacon_received(&beacon(2, MS_TICKS));
        assert_eq!(sync.interval_us(), Some(1_000));

        // seq 4 skips 3; the huge delta must not poison the interval.
        let mut frame = beacon(4, 5 * MS_TICKS);
        frame.correction_factor = 0.5;
        sync.on_beacon_received(&frame);
        assert_eq!(sync.interval_us(), Some(1_000));
        // Correction factor is gated the same way.
        assert_eq!(sync.correction_factor(), 1.0);
        // The epoch itself is still re-anchored.
        assert_eq!(
            sync.reception_timestamp().unwrap().value(),
            5 * MS_TICKS
        );
    }

    #[test]
    fn interval_survives_counter_wraparound() {
        let driver = MockDriver::default();
        let sync = ClockSync::new(&driver, config());

        let before_wrap = TIME_MAX - MS_TICKS / 2;
        sync.on_beacon_received(&beacon(7, before_wrap));
        sync.on_beacon_received(&beacon(8, MS_TICKS / 2 - 1));
        assert_eq!(sync.interval_us(), Some(1_000));
    }

    #[test]
    fn transmission_timestamp_offsets_by_slot() {
        let driver = MockDriver::default();
        let slot_period = MS_TICKS;
        for slot_id in 0..8 {
            let sync = ClockSync::new(
                &driver,
                SyncConfig { slot_id, ..config() },
            );
            sync.on_beacon_received(&beacon(1, 10_000));
            assert_eq!(
                sync.transmission_timestamp().unwrap().value(),
                10_000 + u64::from(slot_id) * slot_period
            );
        }
    }

    #[test]
    fn watchdog_extrapolates_one_interval() {
        let driver = MockDriver::default();
        let sync = ClockSync::new(&driver, config());

        let fired = Arc::new(AtomicUsize::new(0));
        let count = fired.clone();
        let seen: Arc<Mutex<Option<BeaconEvent>>> = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        sync.set_postprocess(Box::new(move |event| {
            count.fetch_add(1, Ordering::SeqCst);
            *sink.lock().unwrap() = Some(*event);
        }));

        sync.on_beacon_received(&beacon(1, 0));
        sync.on_beacon_received(&beacon(2, MS_TICKS));
        assert_eq!(fired.load(Ordering::SeqCst), 2);
        // Armed for interval + guard.
        assert_eq!(driver.armed_delay(0), Some(1_100));

        driver.expire(0);
        assert_eq!(fired.load(Ordering::SeqCst), 3);
        assert_eq!(sync.state(), SyncState::Extrapolated);

        let event = seen.lock().unwrap().take().unwrap();
        assert!(event.extrapolated);
        // Epoch stepped by interval + guard, converted at the UWB rate.
        let step = Duration::from_uwb_us(1_100);
        assert_eq!(
            event.reception_timestamp.value(),
            MS_TICKS + step.value()
        );
        // The watchdog re-armed itself for another step.
        assert_eq!(driver.armed_delay(0), Some(1_100));
    }

    #[test]
    fn beacon_after_extrapolation_resynchronizes() {
        let driver = MockDriver::default();
        let sync = ClockSync::new(&driver, config());

        sync.on_beacon_received(&beacon(1, 0));
        sync.on_beacon_received(&beacon(2, MS_TICKS));
        driver.expire(0);
        assert_eq!(sync.state(), SyncState::Extrapolated);

        sync.on_beacon_received(&beacon(3, 2 * MS_TICKS));
        assert_eq!(sync.state(), SyncState::Synchronized);
        assert_eq!(sync.reception_timestamp().unwrap().value(), 2 * MS_TICKS);
    }

    #[test]
    fn check_due_follows_host_clock() {
        let driver = MockDriver::default();
        let sync = ClockSync::new(&driver, config());

        // Unknown interval: never due.
        assert!(!sync.check_due());

        driver.set_now(1_000_000);
        sync.on_beacon_received(&beacon(1, 0));
        driver.set_now(1_001_000);
        sync.on_beacon_received(&beacon(2, MS_TICKS));

        // First check after a beacon consumes the fresh flag.
        assert!(!sync.check_due());
        assert!(!sync.check_due());

        driver.set_now(1_002_500);
        assert!(sync.check_due());
    }

    #[test]
    fn delay_helpers_shift_by_uwb_microseconds() {
        let epoch = Instant::new(500).unwrap();
        assert_eq!(absolute_time(epoch, 2).value(), 500 + (2 << 16));
        assert_eq!(relative_time(epoch, 1).value(), 500 + (1 << 16));
    }
}
