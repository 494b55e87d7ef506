//! N-node double-sided two-way ranging engine
//!
//! One initiator measures its distance to up to N responders in a single
//! 4-stage exchange: a broadcast request, one response per responder slot, a
//! broadcast echo carrying the first-side timestamps, and one final frame per
//! responder. Both sides of the exchange run through the same engine,
//! differing only in [`Role`].
//!
//! The engine is driven from two directions: a blocking entry point
//! ([`Nrng::request`] or [`Nrng::listen`]) claims the round and parks the
//! caller on a rendezvous, and the host event loop feeds transceiver
//! completions through the [`Protocol`] implementation until a terminal
//! event releases the caller with the round's outcome.

use core::convert::TryFrom;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::frame::{
    self, ExtFinalFrame, FinalFrame, Opcode, RangeData, RequestFrame, Stage, BROADCAST_ADDRESS,
    EXT_FINAL_LEN, FCTRL_N_RANGES, FINAL_LEN, FRAMES_PER_RANGE, REQUEST_LEN, RESPONSE_LEN,
};
use crate::host::{lock, Rendezvous};
use crate::radio::{Protocol, ProtocolId, Radio, RadioEvent};
use crate::time::{Duration, Instant, TIME_UNIT_S};
use crate::{Error, Result};

/// Dispatch-registry id of the ranging engine.
pub const NRNG_PROTOCOL_ID: ProtocolId = ProtocolId(17);

/// PAN identifier stamped on every transmitted frame.
const PAN_ID: u16 = 0xDECA;

/// The transceiver ignores the low 9 bits of a programmed transmit time.
const DELAY_TX_MASK: u64 = 0xFF_FFFF_FE00;

const SPEED_OF_LIGHT_M_S: f64 = 299_792_458.0;

/// Which side of the exchange this engine plays
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Role {
    /// Opens rounds and computes ranges.
    Initiator,
    /// Answers requests in its assigned slot.
    Responder,
}

/// Tuning knobs of the exchange, all in UWB microseconds except the flag
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct NrngConfig {
    /// Margin added per slot when sizing receive windows.
    pub tx_guard_delay: u32,
    /// Turnaround delay between receiving a frame and the programmed reply.
    pub tx_holdoff_delay: u32,
    /// Base receive timeout added to every receive window.
    pub rx_timeout_period: u32,
    /// Receiver settling time accounted per slot.
    pub rx_holdoff_delay: u32,
    /// Apply the close-range bias table to reported ranges.
    pub bias_correction: bool,
}

impl Default for NrngConfig {
    fn default() -> Self {
        NrngConfig {
            tx_guard_delay: 32,
            tx_holdoff_delay: 512,
            rx_timeout_period: 64,
            rx_holdoff_delay: 32,
            bias_correction: false,
        }
    }
}

/// Terminal tally of one ranging round
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RoundOutcome {
    /// Frames received in the round's last stage.
    pub resp_count: u16,
    /// Receive windows that expired in the round's last stage.
    pub timeout_count: u16,
}

/// Both halves of one completed (or in-progress) exchange with one responder
///
/// `first` holds the request/response round trip, `second` the echo/final
/// round trip. Within each half the outer timestamps span one side's round
/// trip and the embedded response's timestamps span the other side's
/// turnaround.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct FramePair {
    /// Request/response half.
    pub first: FinalFrame,
    /// Echo/final half.
    pub second: FinalFrame,
    /// Auxiliary payload of the extended family, zeroed otherwise.
    pub data: RangeData,
}

/// Callback producing the auxiliary payload appended to extended finals.
pub type FinalPayload = Box<dyn FnMut() -> RangeData + Send>;

/// Callback run on a responder when its final frame left the antenna.
pub type CompleteCallback = Box<dyn FnMut() + Send>;

struct Round {
    idx: u16,
    resp_count: u16,
    timeout_count: u16,
    t1_final: bool,
    final_pending: bool,
    seq: u8,
    pairs: Vec<FramePair>,
    final_payload: Option<FinalPayload>,
    on_complete: Option<CompleteCallback>,
}

/// The ranging engine
///
/// Lock order is round state before radio, everywhere.
pub struct Nrng<R: Radio> {
    radio: Arc<Mutex<R>>,
    round: Mutex<Round>,
    gate: Rendezvous<RoundOutcome>,
    config: NrngConfig,
    address: u16,
    slot_id: u16,
    role: Role,
    nnodes: u16,
}

impl<R: Radio> Nrng<R> {
    /// Creates an engine for `nnodes` peers backed by `nframes` frame slots.
    ///
    /// `nframes` must hold [`FRAMES_PER_RANGE`] frames per peer.
    pub fn new(
        radio: Arc<Mutex<R>>,
        config: NrngConfig,
        role: Role,
        address: u16,
        slot_id: u16,
        nnodes: u16,
        nframes: u16,
    ) -> Result<Self> {
        if nnodes == 0 || usize::from(nframes) < FRAMES_PER_RANGE * usize::from(nnodes) {
            return Err(Error::InvalidConfiguration);
        }
        Ok(Nrng {
            radio,
            round: Mutex::new(Round {
                idx: u16::MAX,
                resp_count: 0,
                timeout_count: 0,
                t1_final: false,
                final_pending: false,
                seq: 0,
                pairs: vec![
                    FramePair::default();
                    usize::from(nframes) / FRAMES_PER_RANGE
                ],
                final_payload: None,
                on_complete: None,
            }),
            gate: Rendezvous::new(),
            config,
            address,
            slot_id,
            role,
            nnodes,
        })
    }

    /// Installs the producer of the auxiliary payload carried by extended
    /// final frames.
    pub fn set_final_payload(&self, producer: FinalPayload) {
        lock(&self.round).final_payload = Some(producer);
    }

    /// Installs the callback run on a responder after its final frame was
    /// transmitted. Must not call back into the engine.
    pub fn set_on_complete(&self, callback: CompleteCallback) {
        lock(&self.round).on_complete = Some(callback);
    }

    /// Opens a ranging round and blocks until it terminates.
    ///
    /// `code` selects the family ([`Opcode::Request`] or
    /// [`Opcode::ExtRequest`]); responders in slots `start_slot..=end_slot`
    /// are invited to answer.
    pub fn request(
        &self,
        dst: u16,
        code: Opcode,
        start_slot: u8,
        end_slot: u8,
    ) -> Result<RoundOutcome> {
        self.request_at(dst, code, start_slot, end_slot, None)
    }

    /// Like [`request`](Self::request), with the opening transmission
    /// scheduled at `at` in radio time.
    pub fn request_delayed(
        &self,
        dst: u16,
        code: Opcode,
        start_slot: u8,
        end_slot: u8,
        at: Instant,
    ) -> Result<RoundOutcome> {
        let outcome = self.request_at(dst, code, start_slot, end_slot, Some(at))?;
        lock(&self.radio).force_trx_off();
        Ok(outcome)
    }

    fn request_at(
        &self,
        dst: u16,
        code: Opcode,
        start_slot: u8,
        end_slot: u8,
        at: Option<Instant>,
    ) -> Result<RoundOutcome> {
        if code.stage() != Stage::Request || self.role != Role::Initiator {
            return Err(Error::InvalidConfiguration);
        }

        self.gate.begin();
        {
            let mut round = lock(&self.round);
            round.resp_count = 0;
            round.timeout_count = 0;
            round.t1_final = false;
            round.final_pending = false;
            round.idx = u16::MAX;
            round.seq = round.seq.wrapping_add(1);

            let mut staged = FinalFrame::default();
            staged.response.request = RequestFrame {
                fctrl: FCTRL_N_RANGES,
                seq: round.seq,
                pan_id: PAN_ID,
                dst,
                src: self.address,
                code: code.into(),
                start_slot,
                end_slot,
            };

            let mut buf = [0u8; FINAL_LEN];
            let encode = frame::encode_prefix(&staged, REQUEST_LEN, &mut buf);
            let mut radio = lock(&self.radio);
            match encode {
                Ok(len) => {
                    debug!(dst, seq = round.seq, start_slot, end_slot, "opening round");
                    radio.write_tx(0, &buf[..len]);
                    radio.write_tx_fctrl(len);
                    radio.wait_for_response(true);
                    let timeout = self.window_timeout(&*radio, end_slot, REQUEST_LEN);
                    radio.set_rx_timeout(timeout);
                    if let Some(at) = at {
                        radio.set_delayed_start(at);
                    }
                    if let Err(err) = radio.start_tx() {
                        drop(radio);
                        drop(round);
                        self.gate.cancel();
                        return Err(err);
                    }
                }
                Err(err) => {
                    drop(radio);
                    drop(round);
                    self.gate.cancel();
                    return Err(err);
                }
            }
        }
        Ok(self.gate.wait())
    }

    /// Arms the receiver and blocks until a full exchange (or the timeout)
    /// terminates the round. Responder side only.
    pub fn listen(&self, timeout_us: u32) -> Result<RoundOutcome> {
        if self.role != Role::Responder {
            return Err(Error::InvalidConfiguration);
        }
        self.gate.begin();
        {
            let mut round = lock(&self.round);
            round.resp_count = 0;
            round.timeout_count = 0;
            round.t1_final = false;
            round.final_pending = false;
            let mut radio = lock(&self.radio);
            radio.set_rx_timeout(timeout_us);
            radio.start_rx();
        }
        Ok(self.gate.wait())
    }

    /// Snapshot of the frame pair at `offset`.
    pub fn pair(&self, offset: usize) -> Option<FramePair> {
        lock(&self.round).pairs.get(offset).copied()
    }

    /// The range measured against the responder at pair `offset`, in
    /// centimeters, with the bias table applied when configured.
    pub fn range_cm(&self, offset: usize) -> Option<u16> {
        let pair = self.pair(offset)?;
        let meters = tof_to_meters(twr_to_tof(&pair));
        if !meters.is_finite() || meters < 0.0 {
            return None;
        }
        let cm = (meters * 100.0).round().min(f32::from(u16::MAX)) as u16;
        if self.config.bias_correction {
            Some(corrected_range_cm(cm))
        } else {
            Some(cm)
        }
    }

    #[cfg(test)]
    fn counters(&self) -> (u16, u16) {
        let round = lock(&self.round);
        (round.resp_count, round.timeout_count)
    }

    /// Receive window covering one frame per slot from this node's slot up
    /// to `end_slot`.
    fn window_timeout(&self, radio: &R, end_slot: u8, payload_len: usize) -> u32 {
        let span = (u32::from(end_slot) + 1)
            .saturating_sub(u32::from(self.slot_id))
            .max(1);
        span * self.slot_us(radio, payload_len)
    }

    fn single_frame_timeout(&self, radio: &R, payload_len: usize) -> u32 {
        self.slot_us(radio, payload_len)
    }

    /// One slot's worth of receive window: the frame on the air, the guard
    /// margin, twice the flight time and the remote side's turnaround.
    fn slot_us(&self, radio: &R, payload_len: usize) -> u32 {
        radio.frame_duration(payload_len)
            + self.config.tx_guard_delay
            + self.config.rx_timeout_period
            + self.config.tx_holdoff_delay
    }

    fn finish(&self, round: &Round) -> bool {
        self.gate.finish(RoundOutcome {
            resp_count: round.resp_count,
            timeout_count: round.timeout_count,
        })
    }

    fn on_rx(&self, len: usize) -> bool {
        let mut round = lock(&self.round);

        let mut header = [0u8; REQUEST_LEN];
        {
            let mut radio = lock(&self.radio);
            let take = len.min(REQUEST_LEN);
            radio.read_rx(0, &mut header[..take]);
        }

        if frame::peek_fctrl(&header) != Some(FCTRL_N_RANGES) {
            return false;
        }
        let code = match frame::peek_code(&header) {
            Some(code) => code,
            None => return false,
        };
        let dst = match frame::peek_dst(&header) {
            Some(dst) => dst,
            None => return false,
        };

        // Frames for someone else are dropped without touching round state.
        if dst != self.address && (dst != BROADCAST_ADDRESS || self.role == Role::Initiator) {
            trace!(dst, "frame addressed elsewhere");
            lock(&self.radio).restart_rx();
            return true;
        }

        match (code.stage(), self.role) {
            (Stage::Request, Role::Responder) => self.on_request(&mut round, code, len),
            (Stage::Response, Role::Initiator) => self.on_response(&mut round, code, len),
            (Stage::Echo, Role::Responder) => self.on_echo(&mut round, code, len),
            (Stage::Final, Role::Initiator) => self.on_final(&mut round, code, len),
            _ => {
                lock(&self.radio).restart_rx();
                true
            }
        }
    }

    /// Responder, stage 1: answer the request at this node's slot offset.
    fn on_request(&self, round: &mut Round, code: Opcode, len: usize) -> bool {
        let mut radio = lock(&self.radio);
        if len < REQUEST_LEN {
            radio.restart_rx();
            return true;
        }
        let mut buf = [0u8; REQUEST_LEN];
        radio.read_rx(0, &mut buf);
        let request = match frame::decode_request(&buf) {
            Ok(request) => request,
            Err(_) => {
                radio.restart_rx();
                return true;
            }
        };
        if !self.in_slot_range(request.start_slot, request.end_slot) {
            trace!(
                start_slot = request.start_slot,
                end_slot = request.end_slot,
                "slot range excludes this node"
            );
            radio.restart_rx();
            return true;
        }

        let npairs = round.pairs.len() as u16;
        round.idx = round.idx.wrapping_add(1) % npairs;
        round.seq = request.seq;
        let idx = usize::from(round.idx);

        let reception = radio.rx_time();
        // Replies are staggered by absolute slot; slot 1 answers first.
        let offset = self.slot_id.saturating_sub(1);
        let delay_us = u64::from(self.config.tx_holdoff_delay)
            + u64::from(offset)
                * u64::from(self.config.tx_guard_delay + radio.frame_duration(RESPONSE_LEN));
        let programmed = Instant::truncated(
            (reception + Duration::from_uwb_us(delay_us)).value() & DELAY_TX_MASK,
        );
        let actual = programmed + radio.tx_antenna_delay();

        let pair = &mut round.pairs[idx];
        *pair = FramePair::default();
        pair.first.response.request = RequestFrame {
            dst: request.src,
            src: self.address,
            code: code.next_stage().into(),
            ..request
        };
        pair.first.response.slot_id = self.slot_id as u8;
        pair.first.response.reception_timestamp = reception.lo32();
        pair.first.response.transmission_timestamp = actual.lo32();

        let mut out = [0u8; FINAL_LEN];
        match frame::encode_prefix(&pair.first, RESPONSE_LEN, &mut out) {
            Ok(written) => {
                radio.write_tx(0, &out[..written]);
                radio.write_tx_fctrl(written);
                radio.wait_for_response(true);
                let timeout = self.window_timeout(&*radio, request.end_slot, RESPONSE_LEN);
                radio.set_rx_timeout(timeout);
                radio.set_delayed_start(programmed);
                if radio.start_tx().is_err() {
                    warn!(seq = request.seq, "response transmission missed its slot");
                    drop(radio);
                    self.finish(round);
                }
            }
            Err(_) => {
                drop(radio);
                self.finish(round);
            }
        }
        true
    }

    /// Initiator, stage 2: record both sides of the first round trip and
    /// stage the echo.
    fn on_response(&self, round: &mut Round, code: Opcode, len: usize) -> bool {
        let mut radio = lock(&self.radio);
        if len < RESPONSE_LEN {
            radio.restart_rx();
            return true;
        }
        let mut buf = [0u8; RESPONSE_LEN];
        radio.read_rx(0, &mut buf);
        let response = match frame::decode_response(&buf) {
            Ok(response) => response,
            Err(_) => {
                radio.restart_rx();
                return true;
            }
        };
        let off = match pair_offset(response.slot_id, response.request.start_slot, round) {
            Some(off) => off,
            None => {
                radio.restart_rx();
                return true;
            }
        };

        let reception = radio.rx_time();
        let echo = Instant::truncated(
            (reception + Duration::from_uwb_us(u64::from(self.config.tx_holdoff_delay))).value()
                & DELAY_TX_MASK,
        );
        let actual_echo = echo + radio.tx_antenna_delay();

        let pair = &mut round.pairs[off];
        pair.first.response = response;
        pair.first.request_timestamp = radio.tx_time_lo();
        pair.first.response_timestamp = radio.rx_time_lo();

        pair.second.response.request = RequestFrame {
            fctrl: FCTRL_N_RANGES,
            seq: response.request.seq.wrapping_add(1),
            pan_id: response.request.pan_id,
            dst: BROADCAST_ADDRESS,
            src: self.address,
            code: code.next_stage().into(),
            start_slot: response.request.start_slot,
            end_slot: response.request.end_slot,
        };
        pair.second.response.slot_id = response.slot_id;
        pair.second.response.reception_timestamp = reception.lo32();
        pair.second.response.transmission_timestamp = actual_echo.lo32();
        pair.second.request_timestamp = pair.first.request_timestamp;
        pair.second.response_timestamp = pair.first.response_timestamp;

        round.resp_count += 1;
        round.idx = off as u16;
        round.t1_final = true;
        debug!(
            slot = response.slot_id,
            resp_count = round.resp_count,
            "response collected"
        );

        if round.resp_count + round.timeout_count >= self.nnodes {
            drop(radio);
            self.send_echo(round, Some(echo));
        } else {
            let timeout = self.single_frame_timeout(&*radio, RESPONSE_LEN);
            radio.set_rx_timeout(timeout);
            radio.start_rx();
        }
        true
    }

    /// Transmits the staged echo and flips the round into its final phase.
    ///
    /// `at` is the delayed start staged when the last response arrived; the
    /// timeout path passes `None` and transmits immediately, since by then
    /// the staged instant may already be past.
    fn send_echo(&self, round: &mut Round, at: Option<Instant>) {
        let outcome = RoundOutcome {
            resp_count: round.resp_count,
            timeout_count: round.timeout_count,
        };
        round.resp_count = 0;
        round.timeout_count = 0;
        round.t1_final = false;

        let idx = usize::from(round.idx);
        let echo_code = match Opcode::try_from(round.pairs[idx].second.response.request.code) {
            Ok(code) => code,
            Err(_) => {
                self.gate.finish(outcome);
                return;
            }
        };
        let final_len = echo_code.next_stage().frame_len();

        let mut buf = [0u8; FINAL_LEN];
        let encoded = frame::encode_prefix(&round.pairs[idx].second, FINAL_LEN, &mut buf);
        let mut radio = lock(&self.radio);
        match encoded {
            Ok(written) => {
                radio.write_tx(0, &buf[..written]);
                radio.write_tx_fctrl(written);
                radio.wait_for_response(true);
                let timeout = self.single_frame_timeout(&*radio, final_len);
                radio.set_rx_timeout(timeout);
                if let Some(at) = at {
                    radio.set_delayed_start(at);
                }
                if radio.start_tx().is_err() {
                    warn!("echo transmission missed its slot");
                    drop(radio);
                    self.gate.finish(outcome);
                }
            }
            Err(_) => {
                drop(radio);
                self.gate.finish(outcome);
            }
        }
    }

    /// Responder, stage 3: fold the echoed first-side timestamps in and
    /// transmit the final frame.
    fn on_echo(&self, round: &mut Round, code: Opcode, len: usize) -> bool {
        let mut radio = lock(&self.radio);
        if len < FINAL_LEN {
            radio.restart_rx();
            return true;
        }
        let mut buf = [0u8; FINAL_LEN];
        radio.read_rx(0, &mut buf);
        let echo = match frame::decode_final(&buf) {
            Ok(echo) => echo,
            Err(_) => {
                radio.restart_rx();
                return true;
            }
        };
        let request = echo.response.request;
        if !self.in_slot_range(request.start_slot, request.end_slot) {
            radio.restart_rx();
            return true;
        }
        if round.idx == u16::MAX {
            // Echo without a preceding request in this round.
            radio.restart_rx();
            return true;
        }
        let idx = usize::from(round.idx);

        let reception = radio.rx_time();
        let response_tx = radio.tx_time_lo();
        let echo_rx = radio.rx_time_lo();
        let offset = self.slot_id.saturating_sub(1);
        let final_code = code.next_stage();
        let final_len = final_code.frame_len();
        let delay_us = u64::from(self.config.tx_holdoff_delay)
            + u64::from(offset)
                * u64::from(self.config.tx_guard_delay + radio.frame_duration(final_len));
        let programmed = Instant::truncated(
            (reception + Duration::from_uwb_us(delay_us)).value() & DELAY_TX_MASK,
        );
        let actual = programmed + radio.tx_antenna_delay();

        let pair = &mut round.pairs[idx];
        pair.first.request_timestamp = echo.request_timestamp;
        pair.first.response_timestamp = echo.response_timestamp;

        pair.second.response.request = RequestFrame {
            fctrl: FCTRL_N_RANGES,
            seq: request.seq,
            pan_id: request.pan_id,
            dst: request.src,
            src: self.address,
            code: final_code.into(),
            start_slot: request.start_slot,
            end_slot: request.end_slot,
        };
        pair.second.response.slot_id = self.slot_id as u8;
        pair.second.response.reception_timestamp = reception.lo32();
        pair.second.response.transmission_timestamp = actual.lo32();
        pair.second.request_timestamp = response_tx;
        pair.second.response_timestamp = echo_rx;

        let sent = if final_code.is_ext() {
            let data = match round.final_payload.as_mut() {
                Some(producer) => producer(),
                None => RangeData::default(),
            };
            let pair = &mut round.pairs[idx];
            pair.data = data;
            let ext = ExtFinalFrame { base: pair.second, data };
            let mut out = [0u8; EXT_FINAL_LEN];
            frame::encode_ext_final(&ext, &mut out).map(|written| {
                radio.write_tx(0, &out[..written]);
                written
            })
        } else {
            let mut out = [0u8; FINAL_LEN];
            frame::encode_prefix(&round.pairs[idx].second, FINAL_LEN, &mut out).map(|written| {
                radio.write_tx(0, &out[..written]);
                written
            })
        };

        match sent {
            Ok(written) => {
                radio.write_tx_fctrl(written);
                let timeout = self.window_timeout(&*radio, request.end_slot, final_len);
                radio.set_rx_timeout(timeout);
                radio.set_delayed_start(programmed);
                round.resp_count += 1;
                round.final_pending = true;
                if radio.start_tx().is_err() {
                    warn!("final transmission missed its slot");
                    round.final_pending = false;
                    drop(radio);
                    self.finish(round);
                }
            }
            Err(_) => {
                drop(radio);
                self.finish(round);
            }
        }
        true
    }

    /// Initiator, stage 4: record the second round trip for one responder.
    fn on_final(&self, round: &mut Round, code: Opcode, len: usize) -> bool {
        let mut radio = lock(&self.radio);
        let required = code.frame_len();
        // A truncated extended final would decode into garbage; drop it and
        // let the slot run into its timeout.
        if len < required {
            radio.restart_rx();
            return true;
        }

        let (fin, data) = if code.is_ext() {
            let mut buf = [0u8; EXT_FINAL_LEN];
            radio.read_rx(0, &mut buf);
            match frame::decode_ext_final(&buf) {
                Ok(ext) => (ext.base, Some(ext.data)),
                Err(_) => {
                    radio.restart_rx();
                    return true;
                }
            }
        } else {
            let mut buf = [0u8; FINAL_LEN];
            radio.read_rx(0, &mut buf);
            match frame::decode_final(&buf) {
                Ok(fin) => (fin, None),
                Err(_) => {
                    radio.restart_rx();
                    return true;
                }
            }
        };

        let off = match pair_offset(fin.response.slot_id, fin.response.request.start_slot, round)
        {
            Some(off) => off,
            None => {
                radio.restart_rx();
                return true;
            }
        };

        let pair = &mut round.pairs[off];
        pair.second.request_timestamp = fin.request_timestamp;
        pair.second.response_timestamp = fin.response_timestamp;
        pair.second.response.request.dst = fin.response.request.src;
        pair.second.response.slot_id = fin.response.slot_id;
        // The echo left at the delayed-start boundary; the transceiver's own
        // record is authoritative.
        pair.second.response.transmission_timestamp = radio.tx_time_lo();
        if let Some(data) = data {
            pair.data = data;
        }

        round.t1_final = false;
        round.resp_count += 1;
        debug!(
            slot = fin.response.slot_id,
            resp_count = round.resp_count,
            "final collected"
        );

        if round.resp_count + round.timeout_count < self.nnodes {
            let timeout = self.single_frame_timeout(&*radio, required);
            radio.set_rx_timeout(timeout);
            radio.start_rx();
        } else {
            drop(radio);
            self.finish(round);
        }
        true
    }

    fn on_rx_timeout(&self) -> bool {
        let mut round = lock(&self.round);
        match self.role {
            Role::Responder => {
                debug!("round timed out");
                self.finish(&round);
                true
            }
            Role::Initiator => {
                round.timeout_count += 1;
                let total = round.resp_count + round.timeout_count;
                if round.resp_count == 0 && round.timeout_count >= self.nnodes {
                    // Nobody answered; there is no echo to send.
                    debug!("round aborted, all slots silent");
                    self.finish(&round);
                } else if total >= self.nnodes && round.t1_final {
                    self.send_echo(&mut round, None);
                } else if total < self.nnodes {
                    let mut radio = lock(&self.radio);
                    let timeout = self.single_frame_timeout(&*radio, RESPONSE_LEN);
                    radio.set_rx_timeout(timeout);
                    radio.start_rx();
                } else {
                    self.finish(&round);
                }
                true
            }
        }
    }

    fn in_slot_range(&self, start_slot: u8, end_slot: u8) -> bool {
        let slot = self.slot_id;
        u16::from(start_slot) <= slot && slot <= u16::from(end_slot)
    }
}

fn pair_offset(slot_id: u8, start_slot: u8, round: &Round) -> Option<usize> {
    let off = usize::from(slot_id.checked_sub(start_slot)?);
    if off < round.pairs.len() {
        Some(off)
    } else {
        None
    }
}

impl<R: Radio> Protocol for Nrng<R> {
    fn id(&self) -> ProtocolId {
        NRNG_PROTOCOL_ID
    }

    fn handle(&self, event: RadioEvent) -> bool {
        if !self.gate.busy() {
            return false;
        }
        match event {
            RadioEvent::RxDone { len } => self.on_rx(len),
            RadioEvent::RxTimeout => self.on_rx_timeout(),
            RadioEvent::RxError => {
                let round = lock(&self.round);
                self.finish(&round);
                true
            }
            RadioEvent::TxDone => {
                let mut round = lock(&self.round);
                if round.final_pending {
                    round.final_pending = false;
                    if let Some(callback) = round.on_complete.as_mut() {
                        callback();
                    }
                    self.finish(&round);
                }
                true
            }
            RadioEvent::TxError => {
                warn!("transmission failed mid-round");
                let round = lock(&self.round);
                self.finish(&round);
                true
            }
        }
    }
}

/// Computes the time of flight of one completed exchange, in radio ticks.
///
/// The double-sided estimate cancels first-order clock offset between the
/// two nodes; when the two round trips are symmetric it reduces to half the
/// round-trip difference.
pub fn twr_to_tof(pair: &FramePair) -> f32 {
    let t1_trip = i64::from(
        pair.first
            .response_timestamp
            .wrapping_sub(pair.first.request_timestamp),
    );
    let t1_turn = i64::from(
        pair.first
            .response
            .transmission_timestamp
            .wrapping_sub(pair.first.response.reception_timestamp),
    );
    let t2_trip = i64::from(
        pair.second
            .response_timestamp
            .wrapping_sub(pair.second.request_timestamp),
    );
    let t2_turn = i64::from(
        pair.second
            .response
            .transmission_timestamp
            .wrapping_sub(pair.second.response.reception_timestamp),
    );

    let denom = t1_trip + t1_turn + t2_trip + t2_turn;
    if denom == 0 {
        return 0.0;
    }
    ((t1_trip as f64 * t2_trip as f64 - t1_turn as f64 * t2_turn as f64) / denom as f64) as f32
}

/// Converts a time of flight in radio ticks to meters.
pub fn tof_to_meters(tof: f32) -> f32 {
    (f64::from(tof) * SPEED_OF_LIGHT_M_S * TIME_UNIT_S) as f32
}

/// Close-range bias of the receiver front end, as (upper bound in cm,
/// correction in cm) pairs. The last entry covers everything beyond.
const RANGE_BIAS_CM: &[(u16, i16)] = &[
    (100, -11),
    (150, -9),
    (200, -7),
    (300, -5),
    (400, -3),
    (600, -2),
    (800, -1),
    (1000, 0),
    (1400, 1),
    (2000, 2),
    (3000, 4),
    (4500, 6),
    (65535, 8),
];

/// Applies the close-range bias table to a measured range.
pub fn corrected_range_cm(measured_cm: u16) -> u16 {
    for &(upper_bound_cm, correction_cm) in RANGE_BIAS_CM {
        if measured_cm <= upper_bound_cm {
            let corrected = i32::from(measured_cm) + i32::from(correction_cm);
            return corrected.max(0).min(i32::from(u16::MAX)) as u16;
        }
    }
    measured_cm
}
