//! The audio engine context. One [`AudioEngine`] per device, owned
//! explicitly and lent to every component that needs to make sound; there
//! is no ambient global audio graph.
//!
//! The engine knows just enough to play the installation: mono buffer
//! voices that start and stop at given local times, a linearly ramped gain
//! and a lowpass biquad per voice, and a block renderer. Voices either mix
//! straight to the output (`Route::Direct`) or hand their signal to the
//! spatial field (`Route::Field`), which does the ambisonic work.

use crate::buffer_bank::{AudioBuffer, BufferBank, BufferId};
use crate::clock::LocalTime;
use biquad::{Biquad, Coefficients, DirectForm2Transposed, ToHertz, Q_BUTTERWORTH_F32};
use log::{debug, warn};
use std::collections::{BTreeMap, HashMap};

/// Handle of a voice inside one [`AudioEngine`].
pub type VoiceId = u32;

/// Lowest cutoff the lowpass accepts, in Hz.
pub const MIN_CUTOFF: f32 = 5.0;

/// Where a voice's signal goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Mixed equally into both output channels.
    Direct,
    /// Collected per voice in [`RenderedBlock::sends`] for spatialization.
    Field,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Play {
    buffer: BufferId,
    offset: f64,
    looping: bool,
}

/// From `start_at` on, the voice plays `play`, or nothing if it is `None`.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Segment {
    start_at: LocalTime,
    play: Option<Play>,
}

/// A linear ramp, flat outside `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Ramp {
    from: f32,
    to: f32,
    start: LocalTime,
    end: LocalTime,
}

impl Ramp {
    fn constant(value: f32) -> Self {
        Self {
            from: value,
            to: value,
            start: 0.0,
            end: 0.0,
        }
    }

    fn value_at(&self, t: LocalTime) -> f32 {
        if t <= self.start {
            self.from
        } else if t >= self.end {
            self.to
        } else {
            let frac = ((t - self.start) / (self.end - self.start)) as f32;
            self.from + (self.to - self.from) * frac
        }
    }
}

struct Voice {
    route: Route,
    segments: Vec<Segment>,
    gain: Ramp,
    cutoff: f32,
    filter: DirectForm2Transposed<f32>,
    transient: bool,
}

impl Voice {
    fn active_segment(&self, t: LocalTime) -> Option<&Segment> {
        self.segments.iter().rev().find(|s| s.start_at <= t)
    }

    /// Keeps the segment in effect at `t` and everything after it.
    fn prune(&mut self, t: LocalTime) {
        if let Some(idx) = self.segments.iter().rposition(|s| s.start_at <= t) {
            self.segments.drain(..idx);
        }
    }

    /// Replaces everything from `segment.start_at` on.
    fn insert(&mut self, segment: Segment) {
        self.segments.retain(|s| s.start_at < segment.start_at);
        self.segments.push(segment);
    }
}

fn playhead(segment: &Segment, buffer: Option<&AudioBuffer>, t: LocalTime) -> Option<f64> {
    let play = segment.play?;
    let buffer = buffer?;
    let duration = buffer.duration();
    let pos = play.offset + (t - segment.start_at);
    if play.looping && duration > 0.0 {
        Some(pos.rem_euclid(duration))
    } else if pos < duration {
        Some(pos)
    } else {
        None
    }
}

/// The output of one [`AudioEngine::render`] call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RenderedBlock {
    /// Sum of every [`Route::Direct`] voice.
    pub direct: Vec<f32>,
    /// Each [`Route::Field`] voice's signal, after its gain and filter.
    pub sends: HashMap<VoiceId, Vec<f32>>,
}

/// A device's audio context.
pub struct AudioEngine {
    sample_rate: u32,
    current_time: LocalTime,
    buffers: BufferBank,
    voices: BTreeMap<VoiceId, Voice>,
    next_voice: VoiceId,
}

impl AudioEngine {
    /// An engine rendering at `sample_rate`, starting at local time zero.
    pub fn new(sample_rate: u32, buffers: BufferBank) -> Self {
        Self {
            sample_rate: sample_rate.max(1),
            current_time: 0.0,
            buffers,
            voices: BTreeMap::new(),
            next_voice: 0,
        }
    }

    /// Output samples per second.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// The local time of the next sample to be rendered.
    pub fn current_time(&self) -> LocalTime {
        self.current_time
    }

    /// The loaded buffers.
    pub fn buffers(&self) -> &BufferBank {
        &self.buffers
    }

    /// Skips ahead to `t` without rendering. Time never goes backwards.
    pub fn advance_to(&mut self, t: LocalTime) {
        if t > self.current_time {
            self.current_time = t;
            let now = self.current_time;
            self.voices.values_mut().for_each(|v| v.prune(now));
        }
    }

    /// Creates a silent voice with unity gain and an open filter.
    pub fn create_voice(&mut self, route: Route) -> VoiceId {
        let id = self.next_voice;
        self.next_voice += 1;

        let cutoff = self.max_cutoff();
        let filter = DirectForm2Transposed::<f32>::new(self.lowpass(cutoff));
        self.voices.insert(
            id,
            Voice {
                route,
                segments: Vec::new(),
                gain: Ramp::constant(1.0),
                cutoff,
                filter,
                transient: false,
            },
        );
        id
    }

    /// Frees a voice. Returns whether it existed.
    pub fn remove_voice(&mut self, voice: VoiceId) -> bool {
        self.voices.remove(&voice).is_some()
    }

    /// Hands `voice` over to the engine, which frees it once nothing is
    /// left for it to play. Anything already scheduled still sounds.
    pub fn release_voice(&mut self, voice: VoiceId) {
        if let Some(v) = self.voices.get_mut(&voice) {
            v.transient = true;
        }
    }

    /// Whether `voice` exists.
    pub fn has_voice(&self, voice: VoiceId) -> bool {
        self.voices.contains_key(&voice)
    }

    /// Number of live voices.
    pub fn voice_count(&self) -> usize {
        self.voices.len()
    }

    /// Starts `buffer` on `voice` at local time `at`, `offset` seconds into
    /// the buffer. Replaces whatever the voice plays from `at` on. Returns
    /// `false`, and logs, when the voice or the buffer does not exist.
    pub fn start(
        &mut self,
        voice: VoiceId,
        buffer: BufferId,
        at: LocalTime,
        offset: f64,
        looping: bool,
    ) -> bool {
        if self.buffers.get(buffer).is_none() {
            warn!("AudioEngine : buffer {buffer} was never loaded, not starting voice {voice}.");
            return false;
        }
        let Some(v) = self.voices.get_mut(&voice) else {
            debug!("AudioEngine : start on unknown voice {voice}.");
            return false;
        };
        v.insert(Segment {
            start_at: at,
            play: Some(Play {
                buffer,
                offset: offset.max(0.0),
                looping,
            }),
        });
        true
    }

    /// Silences `voice` from local time `at` on, dropping anything that
    /// was scheduled after it.
    pub fn stop(&mut self, voice: VoiceId, at: LocalTime) {
        if let Some(v) = self.voices.get_mut(&voice) {
            v.insert(Segment {
                start_at: at,
                play: None,
            });
        }
    }

    /// Plays `buffer` once on a fresh direct voice that frees itself when
    /// the buffer runs out.
    pub fn play_once(&mut self, buffer: BufferId, at: LocalTime) -> Option<VoiceId> {
        if self.buffers.get(buffer).is_none() {
            warn!("AudioEngine : buffer {buffer} was never loaded, nothing to play.");
            return None;
        }
        let voice = self.create_voice(Route::Direct);
        self.start(voice, buffer, at, 0.0, false);
        self.release_voice(voice);
        Some(voice)
    }

    /// Sets the gain immediately, dropping any ramp in progress.
    pub fn set_gain(&mut self, voice: VoiceId, value: f32) {
        if let Some(v) = self.voices.get_mut(&voice) {
            v.gain = Ramp::constant(value);
        }
    }

    /// Ramps the gain linearly from wherever it is at `at` to `target` over
    /// `duration` seconds, replacing any ramp in progress.
    pub fn ramp_gain(&mut self, voice: VoiceId, target: f32, at: LocalTime, duration: f64) {
        if let Some(v) = self.voices.get_mut(&voice) {
            let from = v.gain.value_at(at);
            v.gain = Ramp {
                from,
                to: target,
                start: at,
                end: at + duration.max(0.0),
            };
        }
    }

    /// The gain of `voice` at local time `t`.
    pub fn gain_at(&self, voice: VoiceId, t: LocalTime) -> Option<f32> {
        self.voices.get(&voice).map(|v| v.gain.value_at(t))
    }

    /// The value the current gain ramp ends on.
    pub fn target_gain(&self, voice: VoiceId) -> Option<f32> {
        self.voices.get(&voice).map(|v| v.gain.to)
    }

    /// Moves the lowpass cutoff, clamped to what the sample rate allows.
    pub fn set_cutoff(&mut self, voice: VoiceId, hz: f32) {
        let cutoff = hz.clamp(MIN_CUTOFF, self.max_cutoff());
        let coeffs = self.lowpass(cutoff);
        if let Some(v) = self.voices.get_mut(&voice) {
            v.cutoff = cutoff;
            v.filter.update_coefficients(coeffs);
        }
    }

    /// The lowpass cutoff of `voice`.
    pub fn cutoff(&self, voice: VoiceId) -> Option<f32> {
        self.voices.get(&voice).map(|v| v.cutoff)
    }

    /// Highest usable cutoff: just under Nyquist.
    pub fn max_cutoff(&self) -> f32 {
        self.sample_rate as f32 * 0.49
    }

    /// Seconds into its buffer that `voice` is at local time `t`, or `None`
    /// when it is silent then.
    pub fn playhead(&self, voice: VoiceId, t: LocalTime) -> Option<f64> {
        let v = self.voices.get(&voice)?;
        let segment = v.active_segment(t)?;
        let buffer = segment.play.and_then(|p| self.buffers.get(p.buffer));
        playhead(segment, buffer, t)
    }

    /// Whether `voice` makes sound at local time `t`.
    pub fn is_playing(&self, voice: VoiceId, t: LocalTime) -> bool {
        self.playhead(voice, t).is_some()
    }

    /// Renders `frames` samples starting at the current time and advances
    /// the clock past them.
    pub fn render(&mut self, frames: usize) -> RenderedBlock {
        let mut block = RenderedBlock {
            direct: vec![0.0; frames],
            sends: HashMap::new(),
        };
        let start = self.current_time;
        let rate = self.sample_rate as f64;
        let buffers = &self.buffers;

        for (&id, voice) in self.voices.iter_mut() {
            let mut out = vec![0.0f32; frames];
            for (n, sample) in out.iter_mut().enumerate() {
                let t = start + n as f64 / rate;
                let dry = voice
                    .active_segment(t)
                    .and_then(|segment| {
                        let buffer = segment.play.and_then(|p| buffers.get(p.buffer))?;
                        playhead(segment, Some(buffer), t).map(|pos| buffer.sample_at(pos))
                    })
                    .unwrap_or(0.0);
                *sample = voice.filter.run(dry) * voice.gain.value_at(t);
            }

            match voice.route {
                Route::Direct => block
                    .direct
                    .iter_mut()
                    .zip(&out)
                    .for_each(|(acc, s)| *acc += s),
                Route::Field => {
                    block.sends.insert(id, out);
                }
            }
        }

        self.current_time = start + frames as f64 / rate;
        let now = self.current_time;
        self.voices.values_mut().for_each(|v| v.prune(now));
        self.reap_transients();
        block
    }

    fn reap_transients(&mut self) {
        let now = self.current_time;
        let buffers = &self.buffers;
        self.voices.retain(|id, v| {
            if !v.transient || v.segments.iter().any(|s| s.start_at > now) {
                return true;
            }
            let alive = v.active_segment(now).map_or(false, |segment| {
                let buffer = segment.play.and_then(|p| buffers.get(p.buffer));
                playhead(segment, buffer, now).is_some()
            });
            if !alive {
                debug!("AudioEngine : transient voice {id} finished.");
            }
            alive
        });
    }

    fn lowpass(&self, cutoff: f32) -> Coefficients<f32> {
        let fs = self.sample_rate as f32;
        // cutoff is already clamped below Nyquist, so this cannot fail; fall
        // back to a unity passthrough rather than panicking if it ever does
        Coefficients::<f32>::from_params(biquad::Type::LowPass, fs.hz(), cutoff.hz(), Q_BUTTERWORTH_F32)
            .unwrap_or(Coefficients {
                a1: 0.0,
                a2: 0.0,
                b0: 1.0,
                b1: 0.0,
                b2: 0.0,
            })
    }
}
