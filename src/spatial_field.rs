//! The spatial field: moving point sources encoded into one ambisonic
//! scene, rotated against the listener's aim and decoded to two ears.
//!
//! Sources are engine voices on [`Route::Field`]; the field only decides
//! where they sit and how loud they are, and turns the engine's per-voice
//! sends into a stereo block.

use crate::allocator::SoundId;
use crate::ambisonics::{wrap_degrees, AmbisonicOrder, BinauralDecoder, Encoder, Rotator};
use crate::buffer_bank::BufferId;
use crate::engine::{AudioEngine, Route, VoiceId};
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::Rng;
use std::collections::{BTreeMap, HashMap};

/// Spatial sources are keyed by the sound identity of whoever steers them.
pub type SourceId = SoundId;

/// Direction changes up to this many degrees are ignored.
pub const HYSTERESIS_DEGREES: f64 = 3.0;

/// Distances are floored here before the inverse-square law.
pub const MIN_DISTANCE: f64 = 0.1;

/// Ceiling of the distance gain.
pub const MAX_DISTANCE_GAIN: f32 = 2.0;

/// Source volumes are scaled by this before reaching the voice.
pub const VOLUME_SCALE: f32 = 3.5;

/// Ramp applied to volume changes, in seconds.
pub const VOLUME_RAMP: f64 = 0.01;

/// Inverse-square distance gain, bounded at both ends.
pub fn distance_gain(dist: f64) -> f32 {
    let d = dist.max(MIN_DISTANCE);
    ((1.0 / (d * d)) as f32).min(MAX_DISTANCE_GAIN)
}

#[derive(Debug, Clone, Copy)]
struct SpatialSource {
    voice: VoiceId,
    volume: f32,
    fading_out: bool,
}

/// Ambisonic encode, rotate and decode pipeline.
pub struct SpatialField {
    order: AmbisonicOrder,
    sources: BTreeMap<SourceId, SpatialSource>,
    encoders: HashMap<SourceId, Encoder>,
    front: Encoder,
    rotator: Rotator,
    decoder: BinauralDecoder,
    aim: (f64, f64),
    aim_offset: (f64, f64),
    output_gain: f32,
    rng: StdRng,
}

impl SpatialField {
    /// A field of `order` decoded by `decoder`. `rng` picks the start
    /// offsets of new sources.
    pub fn new(
        order: AmbisonicOrder,
        decoder: BinauralDecoder,
        output_gain: f32,
        rng: StdRng,
    ) -> Self {
        Self {
            order,
            sources: BTreeMap::new(),
            encoders: HashMap::new(),
            front: Encoder::new(order),
            rotator: Rotator::new(order),
            decoder,
            aim: (0.0, 0.0),
            aim_offset: (0.0, 0.0),
            output_gain,
            rng,
        }
    }

    /// Starts source `id` looping `buffer` from a random point, fading in
    /// over `fade` seconds. A source that is still fading out is taken
    /// over again; its owner cancels the pending cleanup.
    pub fn start_source(
        &mut self,
        id: SourceId,
        buffer: BufferId,
        fade: f64,
        engine: &mut AudioEngine,
    ) -> bool {
        let Some(duration) = engine.buffers().get(buffer).map(|b| b.duration()) else {
            warn!("SpatialField : buffer {buffer} was never loaded, source {id} stays silent.");
            return false;
        };

        let now = engine.current_time();
        let source = self.sources.entry(id).or_insert_with(|| {
            let voice = engine.create_voice(Route::Field);
            engine.set_gain(voice, 0.0);
            SpatialSource {
                voice,
                volume: 1.0,
                fading_out: false,
            }
        });
        source.fading_out = false;

        let offset = if duration > 0.0 {
            self.rng.gen_range(0.0..duration)
        } else {
            0.0
        };
        engine.start(source.voice, buffer, now, offset, true);
        engine.ramp_gain(source.voice, VOLUME_SCALE * source.volume, now, fade);
        info!("SpatialField : source {id} started at {offset:.2}s into buffer {buffer}.");
        true
    }

    /// Fades source `id` out over `fade` seconds. The voice stays until
    /// [`SpatialField::cleanup`] is called for it after the fade.
    pub fn stop_source(&mut self, id: SourceId, fade: f64, engine: &mut AudioEngine) -> bool {
        let Some(source) = self.sources.get_mut(&id) else {
            debug!("SpatialField : stop for unknown source {id} dropped.");
            return false;
        };
        let now = engine.current_time();
        engine.ramp_gain(source.voice, 0.0, now, fade);
        engine.stop(source.voice, now + fade);
        source.fading_out = true;
        true
    }

    /// Frees a faded-out source. Sources that were restarted meanwhile are
    /// left alone. The encoder stays cached.
    pub fn cleanup(&mut self, id: SourceId, engine: &mut AudioEngine) -> bool {
        match self.sources.get(&id) {
            Some(source) if source.fading_out => {
                engine.remove_voice(source.voice);
                self.sources.remove(&id);
                debug!("SpatialField : source {id} deallocated.");
                true
            }
            _ => false,
        }
    }

    /// Fades out every source, returning the ones that need a cleanup.
    pub fn stop_all(&mut self, fade: f64, engine: &mut AudioEngine) -> Vec<SourceId> {
        let ids: Vec<SourceId> = self.sources.keys().copied().collect();
        for id in &ids {
            self.stop_source(*id, fade, engine);
        }
        ids
    }

    /// Moves source `id`. Direction changes within the hysteresis are
    /// ignored; the distance gain is always applied.
    pub fn set_source_pos(
        &mut self,
        id: SourceId,
        azimuth: f64,
        elevation: f64,
        dist: f64,
        engine: &mut AudioEngine,
    ) {
        let order = self.order;
        let mut created = false;
        let encoder = self.encoders.entry(id).or_insert_with(|| {
            created = true;
            Encoder::new(order)
        });

        let moved = wrap_degrees(azimuth - encoder.azimuth()).abs() > HYSTERESIS_DEGREES
            || wrap_degrees(elevation - encoder.elevation()).abs() > HYSTERESIS_DEGREES;
        if created || moved {
            encoder.set_direction(azimuth, elevation);
        }

        self.set_source_volume(id, distance_gain(dist), engine);
    }

    /// Sets the volume of source `id`, ramped over [`VOLUME_RAMP`].
    pub fn set_source_volume(&mut self, id: SourceId, volume: f32, engine: &mut AudioEngine) {
        let Some(source) = self.sources.get_mut(&id) else {
            debug!("SpatialField : volume for silent source {id} dropped.");
            return;
        };
        source.volume = volume;
        if !source.fading_out {
            let now = engine.current_time();
            engine.ramp_gain(source.voice, VOLUME_SCALE * volume, now, VOLUME_RAMP);
        }
    }

    /// Points the listener. Angles are taken relative to the aim stored by
    /// the last [`SpatialField::reset_listener_aim`].
    pub fn set_listener_aim(&mut self, azimuth: f64, elevation: f64) {
        self.aim = (azimuth, elevation);
        self.rotator.set_orientation(
            wrap_degrees(azimuth - self.aim_offset.0),
            elevation - self.aim_offset.1,
        );
    }

    /// Makes the current aim the new front.
    pub fn reset_listener_aim(&mut self) {
        self.aim_offset = self.aim;
        self.rotator.set_orientation(0.0, 0.0);
        info!(
            "SpatialField : listener re-centered at ({:.1}, {:.1}).",
            self.aim.0, self.aim.1
        );
    }

    /// The playing source whose azimuth is closest to `azimuth`.
    pub fn nearest_source(&self, azimuth: f64) -> Option<SourceId> {
        self.sources
            .iter()
            .filter(|(_, source)| !source.fading_out)
            .map(|(id, _)| {
                let az = self.encoders.get(id).map_or(0.0, Encoder::azimuth);
                (*id, wrap_degrees(az - azimuth).abs())
            })
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(id, _)| id)
    }

    /// Turns the engine's field sends into one stereo block.
    pub fn process(
        &mut self,
        sends: &HashMap<VoiceId, Vec<f32>>,
        frames: usize,
    ) -> (Vec<f32>, Vec<f32>) {
        let mut field = vec![vec![0.0f32; frames]; self.order.channel_count()];

        for (id, source) in &self.sources {
            let Some(signal) = sends.get(&source.voice) else {
                continue;
            };
            let encoder = self.encoders.get(id).unwrap_or(&self.front);
            encoder.encode_into(signal, &mut field);
        }

        self.rotator.process(&mut field);
        let (mut left, mut right) = self.decoder.process(&field);
        for s in left.iter_mut().chain(right.iter_mut()) {
            *s *= self.output_gain;
        }
        (left, right)
    }

    /// The encoder of source `id`, if it was ever positioned.
    pub fn encoder(&self, id: SourceId) -> Option<&Encoder> {
        self.encoders.get(&id)
    }

    /// The voice behind source `id`.
    pub fn source_voice(&self, id: SourceId) -> Option<VoiceId> {
        self.sources.get(&id).map(|s| s.voice)
    }

    /// Number of allocated sources, fading ones included.
    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    /// The rotator's current compensation, (yaw, pitch).
    pub fn rotation(&self) -> (f64, f64) {
        (self.rotator.yaw(), self.rotator.pitch())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer_bank::{AudioBuffer, BufferBank};
    use rand::SeedableRng;

    fn setup() -> (SpatialField, AudioEngine) {
        let order = AmbisonicOrder::First;
        let field = SpatialField::new(
            order,
            BinauralDecoder::virtual_microphones(order),
            1.0,
            StdRng::seed_from_u64(1),
        );
        let bank = BufferBank::from_buffers(vec![
            AudioBuffer::new(vec![0.5; 1000], 1000),
            AudioBuffer::new(vec![0.5; 1000], 1000),
        ]);
        (field, AudioEngine::new(1000, bank))
    }

    #[test]
    fn small_moves_are_ignored() {
        let (mut field, mut engine) = setup();
        field.start_source(0, 0, 1.0, &mut engine);
        field.set_source_pos(0, 40.0, 10.0, 1.0, &mut engine);

        field.set_source_pos(0, 42.5, 12.0, 1.0, &mut engine);
        let encoder = field.encoder(0).unwrap();
        assert_eq!((encoder.azimuth(), encoder.elevation()), (40.0, 10.0));

        field.set_source_pos(0, 44.0, 10.0, 1.0, &mut engine);
        assert_eq!(field.encoder(0).unwrap().azimuth(), 44.0);
    }

    #[test]
    fn hysteresis_wraps_around() {
        let (mut field, mut engine) = setup();
        field.set_source_pos(1, 179.0, 0.0, 1.0, &mut engine);
        field.set_source_pos(1, -179.0, 0.0, 1.0, &mut engine);
        assert_eq!(field.encoder(1).unwrap().azimuth(), 179.0);
    }

    #[test]
    fn first_position_always_applies() {
        let (mut field, mut engine) = setup();
        field.set_source_pos(0, 1.0, -1.0, 1.0, &mut engine);
        let encoder = field.encoder(0).unwrap();
        assert_eq!((encoder.azimuth(), encoder.elevation()), (1.0, -1.0));
    }

    #[test]
    fn distance_law_is_bounded() {
        assert_eq!(distance_gain(0.0), MAX_DISTANCE_GAIN);
        assert_eq!(distance_gain(0.5), 2.0);
        assert_eq!(distance_gain(1.0), 1.0);
        assert_eq!(distance_gain(2.0), 0.25);
    }

    #[test]
    fn distance_reaches_the_voice_scaled() {
        let (mut field, mut engine) = setup();
        field.start_source(0, 0, 0.0, &mut engine);
        field.set_source_pos(0, 0.0, 0.0, 2.0, &mut engine);
        let voice = field.source_voice(0).unwrap();
        assert_eq!(engine.target_gain(voice), Some(VOLUME_SCALE * 0.25));
        assert_eq!(engine.gain_at(voice, VOLUME_RAMP), Some(VOLUME_SCALE * 0.25));
    }

    #[test]
    fn start_fades_in_from_a_random_offset() {
        let (mut field, mut engine) = setup();
        assert!(field.start_source(0, 1, 1.0, &mut engine));
        let voice = field.source_voice(0).unwrap();

        let pos = engine.playhead(voice, 0.0).unwrap();
        assert!((0.0..1.0).contains(&pos));
        assert_eq!(engine.gain_at(voice, 0.0), Some(0.0));
        assert_eq!(engine.gain_at(voice, 0.5), Some(VOLUME_SCALE * 0.5));
        assert_eq!(engine.gain_at(voice, 1.0), Some(VOLUME_SCALE));
    }

    #[test]
    fn stop_fades_then_cleans_up() {
        let (mut field, mut engine) = setup();
        field.start_source(0, 0, 0.0, &mut engine);
        field.set_source_pos(0, 30.0, 0.0, 1.0, &mut engine);
        let voice = field.source_voice(0).unwrap();

        assert!(field.stop_source(0, 1.0, &mut engine));
        assert!(engine.is_playing(voice, 0.5));
        assert!(!engine.is_playing(voice, 1.0));
        assert_eq!(field.nearest_source(30.0), None);

        assert!(field.cleanup(0, &mut engine));
        assert_eq!(field.source_count(), 0);
        assert!(!engine.has_voice(voice));
        // encoders outlive their sources
        assert_eq!(field.encoder(0).unwrap().azimuth(), 30.0);
    }

    #[test]
    fn restart_during_fade_keeps_the_source() {
        let (mut field, mut engine) = setup();
        field.start_source(0, 0, 0.0, &mut engine);
        let voice = field.source_voice(0).unwrap();
        field.stop_source(0, 1.0, &mut engine);
        field.start_source(0, 0, 1.0, &mut engine);

        assert_eq!(field.source_voice(0), Some(voice));
        assert!(!field.cleanup(0, &mut engine));
        assert!(engine.has_voice(voice));
    }

    #[test]
    fn missing_buffer_starts_nothing() {
        let (mut field, mut engine) = setup();
        assert!(!field.start_source(3, 9, 1.0, &mut engine));
        assert_eq!(field.source_count(), 0);
        assert!(!field.stop_source(3, 1.0, &mut engine));
    }

    #[test]
    fn aim_is_relative_to_the_stored_offset() {
        let (mut field, _) = setup();
        field.set_listener_aim(50.0, 10.0);
        assert_eq!(field.rotation(), (50.0, 10.0));

        field.reset_listener_aim();
        assert_eq!(field.rotation(), (0.0, 0.0));

        field.set_listener_aim(-170.0, 5.0);
        assert_eq!(field.rotation(), (140.0, -5.0));
    }

    #[test]
    fn nearest_source_wraps() {
        let (mut field, mut engine) = setup();
        field.start_source(0, 0, 0.0, &mut engine);
        field.start_source(1, 1, 0.0, &mut engine);
        field.set_source_pos(0, 170.0, 0.0, 1.0, &mut engine);
        field.set_source_pos(1, 90.0, 0.0, 1.0, &mut engine);

        assert_eq!(field.nearest_source(-175.0), Some(0));
        assert_eq!(field.nearest_source(100.0), Some(1));
    }

    #[test]
    fn stop_all_fades_everything() {
        let (mut field, mut engine) = setup();
        field.start_source(0, 0, 0.0, &mut engine);
        field.start_source(1, 1, 0.0, &mut engine);
        let mut ids = field.stop_all(0.5, &mut engine);
        ids.sort();
        assert_eq!(ids, vec![0, 1]);
        assert_eq!(field.nearest_source(0.0), None);
    }

    #[test]
    fn left_source_is_louder_on_the_left() {
        let (mut field, mut engine) = setup();
        field.start_source(0, 0, 0.0, &mut engine);
        field.set_source_pos(0, 90.0, 0.0, 1.0, &mut engine);

        engine.advance_to(0.1);
        let block = engine.render(64);
        let (left, right) = field.process(&block.sends, 64);
        let energy = |s: &[f32]| s.iter().map(|x| x * x).sum::<f32>();
        assert!(energy(&left) > 0.0);
        assert!(energy(&left) > 100.0 * energy(&right));

        // turning to face the source brings it to the front
        field.set_listener_aim(90.0, 0.0);
        let block = engine.render(64);
        let (left, right) = field.process(&block.sends, 64);
        let ratio = energy(&left) / energy(&right);
        assert!((ratio - 1.0).abs() < 1e-3);
    }
}
