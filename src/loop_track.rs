//! One looping sound, phase-locked to [`VirtualTime`].
//!
//! A track never counts its own loops. Every time it is (re)started it asks
//! the shared clock where in the cycle the installation is, so two devices
//! that started the same loop at different moments, on different clocks,
//! still play the same sample at the same virtual instant.

use crate::allocator::SoundId;
use crate::buffer_bank::{quantized_duration, BufferId};
use crate::clock::{VirtualClock, VirtualTime};
use crate::engine::{AudioEngine, Route, VoiceId, MIN_CUTOFF};
use log::{debug, info, warn};

/// Seconds without a keep-alive after which a remote track evicts itself.
pub const IDLE_TIMEOUT: f64 = 6.0;

/// Distance (meters) up to which a distance update keeps a track alive.
pub const KEEP_ALIVE_DISTANCE: f64 = 3.0;

/// Distance (meters) of the gain law's spread.
pub const DISTANCE_SPREAD: f64 = 1.0;

/// Seconds over which distance gain changes are ramped.
pub const DISTANCE_RAMP: f64 = 0.5;

/// Which track of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKey {
    /// The device's own always-on track.
    Local,
    /// Another player's sound, by identity.
    Remote(SoundId),
}

/// Lifecycle of a [`LoopTrack`]. A playing track always has its next
/// boundary pending in the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackState {
    /// Created or explicitly stopped.
    Idle,
    /// Sounding, with a boundary scheduled.
    Playing,
    /// Stopped for lack of keep-alives; its pool drops it once the
    /// boundary it was evicted at has passed.
    Evicted,
}

/// Gain for a listener `dist` meters away. Zero distance means no
/// measurement and is silent.
pub fn distance_gain(dist: f64) -> f32 {
    if dist == 0.0 {
        return 0.0;
    }
    let spread2 = DISTANCE_SPREAD * DISTANCE_SPREAD;
    (-(dist * dist) / (spread2 / 0.7)).exp().min(1.0) as f32
}

/// A looping buffer on its own voice.
#[derive(Debug)]
pub struct LoopTrack {
    key: TrackKey,
    buffer: Option<BufferId>,
    buffer_duration: f64,
    phase_duration: f64,
    last_updated_at: VirtualTime,
    evicted_at: Option<VirtualTime>,
    idle_timeout: f64,
    gain: f32,
    filter_cutoff: f32,
    state: TrackState,
    voice: VoiceId,
    min_cutoff: f32,
    log_cutoff_ratio: f32,
}

impl LoopTrack {
    /// A silent, idle track with its own direct voice.
    pub fn new(key: TrackKey, engine: &mut AudioEngine, idle_timeout: f64) -> Self {
        let voice = engine.create_voice(Route::Direct);
        engine.set_gain(voice, 0.0);

        let min_cutoff = MIN_CUTOFF;
        let max_cutoff = engine.max_cutoff();
        Self {
            key,
            buffer: None,
            buffer_duration: 0.0,
            phase_duration: 0.0,
            last_updated_at: 0.0,
            evicted_at: None,
            idle_timeout,
            gain: 0.0,
            filter_cutoff: engine.cutoff(voice).unwrap_or(max_cutoff),
            state: TrackState::Idle,
            voice,
            min_cutoff,
            log_cutoff_ratio: (max_cutoff / min_cutoff).ln(),
        }
    }

    /// Binds the track to `buffer`, its loop length snapped to
    /// `quantization`. A missing buffer is logged and leaves the track as
    /// it was.
    pub fn set_buffer(&mut self, buffer: BufferId, engine: &AudioEngine, quantization: f64) -> bool {
        let Some(data) = engine.buffers().get(buffer) else {
            warn!("LoopTrack {:?} : buffer {buffer} was never loaded.", self.key);
            return false;
        };
        self.buffer = Some(buffer);
        self.buffer_duration = data.duration();
        self.phase_duration = quantized_duration(self.buffer_duration, quantization);
        true
    }

    /// Starts the loop mid-cycle, at the phase the shared clock says it is
    /// at, so the track joins every other device already playing it.
    /// Returns the next boundary to schedule, or `None` if the track was
    /// already playing or has nothing to play.
    pub fn launch(
        &mut self,
        now: VirtualTime,
        clock: &dyn VirtualClock,
        engine: &mut AudioEngine,
    ) -> Option<VirtualTime> {
        if self.state == TrackState::Playing {
            return None;
        }
        let Some(buffer) = self.buffer else {
            warn!("LoopTrack {:?} : launched without a buffer.", self.key);
            return None;
        };
        if self.phase_duration <= 0.0 {
            warn!("LoopTrack {:?} : buffer {buffer} is empty.", self.key);
            return None;
        }

        let offset = now.rem_euclid(self.phase_duration);
        let delay = self.phase_duration - offset;
        // a quantized period can outlast the buffer; stay silent until the
        // next boundary in that case
        if offset < self.buffer_duration {
            engine.start(self.voice, buffer, clock.to_local_time(now), offset, false);
        }

        self.state = TrackState::Playing;
        self.last_updated_at = now;
        debug!(
            "LoopTrack {:?} : launched at {now:.3} with offset {offset:.3}.",
            self.key
        );
        Some(now + delay)
    }

    /// Called at each loop boundary `due`, up to a lookahead before it.
    /// Restarts the loop from its first sample and returns the next
    /// boundary, or evicts a remote track that has gone without keep-alives
    /// for too long and returns `None`. An eviction can be taken back with
    /// [`LoopTrack::revive`] until `due` is reached.
    pub fn advance_time(
        &mut self,
        due: VirtualTime,
        clock: &dyn VirtualClock,
        engine: &mut AudioEngine,
    ) -> Option<VirtualTime> {
        let at = clock.to_local_time(due);

        if self.key != TrackKey::Local && due - self.last_updated_at > self.idle_timeout {
            engine.stop(self.voice, at);
            self.state = TrackState::Evicted;
            self.evicted_at = Some(due);
            info!(
                "LoopTrack {:?} : idle for {:.2}s, evicted.",
                self.key,
                due - self.last_updated_at
            );
            return None;
        }

        let buffer = self.buffer?;
        if self.state != TrackState::Playing {
            return None;
        }
        engine.start(self.voice, buffer, at, 0.0, false);
        Some(due + self.phase_duration)
    }

    /// Undoes an eviction whose boundary is still ahead of `now`: the
    /// pending stop becomes a restart, as if the boundary had never been
    /// in doubt. Returns the boundary after it, or `None` when the track is
    /// not evicted or its boundary has already passed.
    pub fn revive(
        &mut self,
        now: VirtualTime,
        clock: &dyn VirtualClock,
        engine: &mut AudioEngine,
    ) -> Option<VirtualTime> {
        if self.state != TrackState::Evicted {
            return None;
        }
        let boundary = self.evicted_at.filter(|&at| now < at)?;
        let buffer = self.buffer?;
        engine.start(self.voice, buffer, clock.to_local_time(boundary), 0.0, false);

        self.state = TrackState::Playing;
        self.evicted_at = None;
        self.last_updated_at = now;
        debug!("LoopTrack {:?} : revived before {boundary:.3}.", self.key);
        Some(boundary + self.phase_duration)
    }

    /// Silences the track now. The owner cancels the pending boundary.
    pub fn stop(&mut self, engine: &mut AudioEngine) {
        engine.stop(self.voice, engine.current_time());
        self.state = TrackState::Idle;
        self.evicted_at = None;
    }

    /// Applies the distance gain law with a ramp. Updates from within
    /// [`KEEP_ALIVE_DISTANCE`] keep the track alive; farther ones let the
    /// idle countdown run, so a brief signal loss does not cut the sound.
    pub fn update_distance(&mut self, dist: f64, now: VirtualTime, engine: &mut AudioEngine) {
        self.set_gain(distance_gain(dist), DISTANCE_RAMP, engine);
        if dist <= KEEP_ALIVE_DISTANCE {
            self.last_updated_at = now;
        }
    }

    /// Maps `val` in [0, 1] exponentially onto the lowpass cutoff, from
    /// 5 Hz up to the engine's highest cutoff.
    pub fn set_effect(&mut self, val: f32, engine: &mut AudioEngine) {
        let val = val.clamp(0.0, 1.0);
        self.filter_cutoff = self.min_cutoff * (self.log_cutoff_ratio * val).exp();
        engine.set_cutoff(self.voice, self.filter_cutoff);
    }

    /// Sets the gain, ramped over `fade` seconds when `fade` is positive.
    pub fn set_gain(&mut self, val: f32, fade: f64, engine: &mut AudioEngine) {
        if fade > 0.0 {
            engine.ramp_gain(self.voice, val, engine.current_time(), fade);
        } else {
            engine.set_gain(self.voice, val);
        }
        self.gain = val;
    }

    /// Which track this is.
    pub fn key(&self) -> TrackKey {
        self.key
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TrackState {
        self.state
    }

    /// The engine voice the track plays on.
    pub fn voice(&self) -> VoiceId {
        self.voice
    }

    /// The bound buffer.
    pub fn buffer(&self) -> Option<BufferId> {
        self.buffer
    }

    /// Loop period in seconds.
    pub fn phase_duration(&self) -> f64 {
        self.phase_duration
    }

    /// The boundary the track was evicted at, while it is evicted.
    pub fn evicted_at(&self) -> Option<VirtualTime> {
        self.evicted_at
    }

    /// Last keep-alive.
    pub fn last_updated_at(&self) -> VirtualTime {
        self.last_updated_at
    }

    /// Target gain.
    pub fn gain(&self) -> f32 {
        self.gain
    }

    /// Lowpass cutoff requested by the last effect value.
    pub fn filter_cutoff(&self) -> f32 {
        self.filter_cutoff
    }
}
