//! A client node: one phone in the installation. It plays its own sound on
//! the local loop track, the sounds of nearby players on remote tracks, and
//! the soloists' sounds through the binaural field. Its sensors feed a
//! [`GestureClassifier`] whose findings go back to the server.
//!
//! Everything that changes the node goes through [`ClientNode::dispatch`]
//! (server messages), [`ClientNode::sense`] (sensor events) or
//! [`ClientNode::render`] (the audio clock), on one thread.

use crate::allocator::{ClientId, Location, SoundId};
use crate::ambisonics::BinauralDecoder;
use crate::buffer_bank::BufferBank;
use crate::clock::{OffsetClock, VirtualClock, VirtualTime};
use crate::engine::AudioEngine;
use crate::gesture::{touch_to_polar, GestureClassifier, SensorEvent, SensorReading, TouchPhase};
use crate::loop_track::TrackKey;
use crate::messages::{ClientMessage, ServerMessage};
use crate::scheduler::Scheduler;
use crate::setup::{InstallationSetup, SetupError};
use crate::spatial_field::{SourceId, SpatialField};
use crate::track_pool::{TrackPool, Transport};
use log::{debug, info, warn};
use rand::rngs::StdRng;
use std::collections::VecDeque;

/// Buffer played when another player throws a sound at this one.
pub const SWIPE_TARGET_BUFFER: u32 = 0;

/// What a client's scheduler can wake up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Timer {
    /// A loop boundary.
    Track(TrackKey),
    /// Freeing a faded-out spatial source.
    Cleanup(SourceId),
}

impl From<TrackKey> for Timer {
    fn from(value: TrackKey) -> Self {
        Timer::Track(value)
    }
}

/// One client device.
pub struct ClientNode {
    id: ClientId,
    clock: OffsetClock,
    engine: AudioEngine,
    scheduler: Scheduler<Timer>,
    pool: TrackPool,
    field: SpatialField,
    classifier: GestureClassifier,
    identity: Option<SoundId>,
    location: Location,
    soloist: bool,
    centered: bool,
    deferred: VecDeque<ServerMessage>,
    outbox: Vec<ClientMessage>,
    lookahead: f64,
    source_fade: f64,
}

impl ClientNode {
    /// A client with handle `id` playing from `buffers`.
    pub fn new(
        id: ClientId,
        setup: &InstallationSetup,
        buffers: BufferBank,
        decoder: BinauralDecoder,
        clock: OffsetClock,
        rng: StdRng,
    ) -> Result<Self, SetupError> {
        let order = setup.order()?;
        let mut engine = AudioEngine::new(setup.sample_rate, buffers);
        let pool = TrackPool::new(&mut engine, setup.quantization, setup.idle_timeout);
        Ok(Self {
            id,
            clock,
            engine,
            scheduler: Scheduler::new(),
            pool,
            field: SpatialField::new(order, decoder, setup.output_gain, rng),
            classifier: GestureClassifier::new(),
            identity: None,
            location: Location::Hall,
            soloist: false,
            centered: false,
            deferred: VecDeque::new(),
            outbox: Vec::new(),
            lookahead: setup.lookahead,
            source_fade: setup.source_fade,
        })
    }

    /// The client's handle.
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// The sound identity last granted by the server.
    pub fn identity(&self) -> Option<SoundId> {
        self.identity
    }

    /// The room the server last placed this client in.
    pub fn location(&self) -> Location {
        self.location
    }

    /// Makes the touch surface steer this client's own spatial source
    /// instead of reporting raw touches.
    pub fn set_soloist(&mut self, soloist: bool) {
        self.soloist = soloist;
    }

    /// Current virtual time, if the clock has converged.
    pub fn now(&self) -> Option<VirtualTime> {
        self.clock.now(self.engine.current_time())
    }

    /// Moves the audio engine forward to the local time of `now`, for a
    /// node that boots while the installation is already running.
    pub fn sync_to(&mut self, now: VirtualTime) {
        self.engine.advance_to(self.clock.to_local_time(now));
    }

    /// Marks the clock as converged. Deferred messages replay on the next
    /// [`ClientNode::render`].
    pub fn converge_clock(&mut self) {
        self.clock.converge();
    }

    /// Messages waiting for the clock.
    pub fn deferred_count(&self) -> usize {
        self.deferred.len()
    }

    /// The loop tracks.
    pub fn pool(&self) -> &TrackPool {
        &self.pool
    }

    /// The binaural field.
    pub fn field(&self) -> &SpatialField {
        &self.field
    }

    /// The audio context.
    pub fn engine(&self) -> &AudioEngine {
        &self.engine
    }

    /// Takes everything waiting to be sent to the server.
    pub fn drain(&mut self) -> Vec<ClientMessage> {
        std::mem::take(&mut self.outbox)
    }

    /// Handles one message from the server. Messages arriving before the
    /// clock has converged are kept, in order, until it has.
    pub fn dispatch(&mut self, message: ServerMessage) {
        match self.now() {
            Some(now) if self.deferred.is_empty() => self.apply(message, now),
            _ => {
                debug!("Client {} : clock not ready, deferring {:?}.", self.id, message);
                self.deferred.push_back(message);
            }
        }
    }

    /// Handles one sensor reading.
    pub fn sense(&mut self, event: &SensorEvent) {
        let gesture = match event.reading {
            SensorReading::Orientation(raw) => {
                let accepted = self.classifier.orientation(raw, event.at);
                if let Some(accepted) = accepted {
                    let [azimuth, _, _] = accepted.value;
                    self.field.set_listener_aim(azimuth, 0.0);
                    if !self.centered {
                        self.field.reset_listener_aim();
                        self.centered = true;
                    }
                    self.outbox.push(ClientMessage::Orientation(accepted.value));
                }
                accepted.and_then(|a| a.gesture)
            }
            SensorReading::Acceleration(data) => {
                let accepted = self.classifier.acceleration(data, event.at);
                if let Some(accepted) = accepted {
                    self.outbox.push(ClientMessage::Acceleration(accepted.value));
                }
                accepted.and_then(|a| a.gesture)
            }
            SensorReading::Touch {
                phase,
                contact,
                x,
                y,
            } => {
                self.touch(phase, x, y);
                self.classifier.touch(phase, contact, x, y, event.at)
            }
        };

        if let Some(gesture) = gesture {
            info!("Client {} : {:?}.", self.id, gesture);
            self.outbox.push(ClientMessage::Gesture(gesture));
        }
    }

    /// Renders `frames` of stereo output and moves the node's time past
    /// them. Loop boundaries up to the lookahead are scheduled first.
    pub fn render(&mut self, frames: usize) -> (Vec<f32>, Vec<f32>) {
        self.replay_deferred();
        if let Some(now) = self.now() {
            self.run_timers(now + self.lookahead);
        }

        let block = self.engine.render(frames);
        let (mut left, mut right) = self.field.process(&block.sends, frames);
        for ((l, r), d) in left.iter_mut().zip(right.iter_mut()).zip(&block.direct) {
            *l += d;
            *r += d;
        }
        (left, right)
    }

    fn touch(&mut self, phase: TouchPhase, x: f64, y: f64) {
        if self.soloist {
            let (azimuth, distance) = touch_to_polar(x, y);
            let position = ClientMessage::SourcePosition { azimuth, distance };
            match phase {
                TouchPhase::Start => {
                    self.outbox.push(ClientMessage::SourceStatus(true));
                    self.outbox.push(position);
                }
                TouchPhase::Move => self.outbox.push(position),
                TouchPhase::End => self.outbox.push(ClientMessage::SourceStatus(false)),
            }
            return;
        }

        if phase == TouchPhase::Start {
            self.outbox.push(ClientMessage::TouchActive(true));
        }
        self.outbox.push(ClientMessage::Touch { x, y });
        if phase == TouchPhase::End {
            self.outbox.push(ClientMessage::TouchActive(false));
        }
    }

    fn replay_deferred(&mut self) {
        if self.deferred.is_empty() {
            return;
        }
        let Some(now) = self.now() else {
            return;
        };
        info!(
            "Client {} : clock ready, replaying {} deferred messages.",
            self.id,
            self.deferred.len()
        );
        while let Some(message) = self.deferred.pop_front() {
            self.apply(message, now);
        }
    }

    fn run_timers(&mut self, until: VirtualTime) {
        let Self {
            clock,
            engine,
            scheduler,
            pool,
            field,
            ..
        } = self;
        scheduler.tick(until, |timer, due| match timer {
            Timer::Track(key) => pool.advance_time(key, due, &*clock, engine),
            Timer::Cleanup(id) => {
                field.cleanup(id, engine);
                None
            }
        });
    }

    fn apply(&mut self, message: ServerMessage, now: VirtualTime) {
        let mut io = Transport {
            now,
            clock: &self.clock,
            engine: &mut self.engine,
            scheduler: &mut self.scheduler,
        };

        match message {
            ServerMessage::SoundIdentity(Some(id)) => {
                self.identity = Some(id);
                // the sound is ours now, no longer a neighbour's
                self.pool.stop_track(id, &mut io);
                self.pool.start_local_track(id, &mut io);
            }
            ServerMessage::SoundIdentity(None) => {
                info!("Client {} : no sound identity available.", self.id);
            }
            ServerMessage::Location(location) => {
                info!("Client {} : moved to the {:?}.", self.id, location);
                self.location = location;
            }
            ServerMessage::SwipeTarget => {
                let at = io.engine.current_time();
                if io.engine.play_once(SWIPE_TARGET_BUFFER, at).is_none() {
                    warn!("Client {} : nothing to play for a throw.", self.id);
                }
            }
            ServerMessage::Proximity { identity, distance } => {
                if self.identity == Some(identity) {
                    debug!("Client {} : proximity to own sound ignored.", self.id);
                    return;
                }
                self.pool.update_track(identity, distance, &mut io);
            }
            ServerMessage::Effect(value) => {
                self.pool.set_effect(TrackKey::Local, value, io.engine);
            }
            ServerMessage::SourcePosition {
                id,
                azimuth,
                distance,
            } => {
                self.field.set_source_pos(id, azimuth, 0.0, distance, io.engine);
            }
            ServerMessage::SourceStatus { id, on: true } => {
                io.scheduler.cancel(Timer::Cleanup(id));
                self.field.start_source(id, id, self.source_fade, io.engine);
            }
            ServerMessage::SourceStatus { id, on: false } => {
                if self.field.stop_source(id, self.source_fade, io.engine) {
                    let at = now + self.source_fade + self.lookahead;
                    io.scheduler.schedule(Timer::Cleanup(id), at, false);
                }
            }
            ServerMessage::PlayerLeft { identity } => {
                debug!("Client {} : sound {identity} left.", self.id);
                self.pool.stop_track(identity, &mut io);
            }
            ServerMessage::StopAll => {
                self.pool.stop_all(&mut io);
                let at = now + self.source_fade + self.lookahead;
                for id in self.field.stop_all(self.source_fade, io.engine) {
                    io.scheduler.schedule(Timer::Cleanup(id), at, false);
                }
            }
        }
    }
}
