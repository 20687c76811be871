//! The loop tracks of one client: an always-on local track and one remote
//! track per nearby player, created on first reference and dropped once
//! they evict themselves.
//!
//! Boundaries are decided a lookahead early, so an evicted track stays in
//! the pool until the boundary it was evicted at has sounded. A keep-alive
//! in between revives it on the same voice.

use crate::allocator::SoundId;
use crate::clock::{VirtualClock, VirtualTime};
use crate::engine::AudioEngine;
use crate::loop_track::{LoopTrack, TrackKey, TrackState};
use crate::scheduler::Scheduler;
use log::{debug, info};
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;

/// Everything a pool operation needs from its node besides the pool itself.
/// `K` is the node's scheduler key, which must be able to name a track.
pub struct Transport<'a, K> {
    /// Virtual time of the operation.
    pub now: VirtualTime,
    /// The node's clock.
    pub clock: &'a dyn VirtualClock,
    /// The node's audio context.
    pub engine: &'a mut AudioEngine,
    /// The node's event queue.
    pub scheduler: &'a mut Scheduler<K>,
}

/// Keyed registry of [`LoopTrack`]s.
#[derive(Debug)]
pub struct TrackPool {
    local: LoopTrack,
    remote: HashMap<SoundId, LoopTrack>,
    quantization: f64,
    idle_timeout: f64,
}

impl TrackPool {
    /// A pool with an idle local track. `quantization` snaps every loop
    /// length, `idle_timeout` bounds how long a remote track lives without
    /// keep-alives.
    pub fn new(engine: &mut AudioEngine, quantization: f64, idle_timeout: f64) -> Self {
        Self {
            local: LoopTrack::new(TrackKey::Local, engine, idle_timeout),
            remote: HashMap::new(),
            quantization,
            idle_timeout,
        }
    }

    /// The remote track for `id`, created and launched if it does not exist
    /// or has been evicted, or revived if its eviction has not sounded yet.
    /// `None` if `id` has no buffer.
    pub fn get_or_create<K>(&mut self, id: SoundId, io: &mut Transport<K>) -> Option<&mut LoopTrack>
    where
        K: Copy + Eq + Hash + Debug + From<TrackKey>,
    {
        if let Some(track) = self.remote.get_mut(&id) {
            if track.state() == TrackState::Evicted {
                match track.revive(io.now, io.clock, io.engine) {
                    Some(next) => io
                        .scheduler
                        .schedule(K::from(TrackKey::Remote(id)), next, true),
                    None => self.drop_remote(id, io.engine),
                }
            }
        }

        if !self.remote.contains_key(&id) {
            let mut track = LoopTrack::new(TrackKey::Remote(id), io.engine, self.idle_timeout);
            if !track.set_buffer(id, io.engine, self.quantization) {
                io.engine.remove_voice(track.voice());
                return None;
            }
            debug!("TrackPool : created track for sound {id}.");
            self.remote.insert(id, track);
        }

        let track = self.remote.get_mut(&id)?;
        if let Some(next) = track.launch(io.now, io.clock, io.engine) {
            io.scheduler
                .schedule(K::from(TrackKey::Remote(id)), next, true);
        }
        Some(track)
    }

    /// Routes a proximity report to the track of `id`.
    pub fn update_track<K>(&mut self, id: SoundId, dist: f64, io: &mut Transport<K>)
    where
        K: Copy + Eq + Hash + Debug + From<TrackKey>,
    {
        let now = io.now;
        if let Some(track) = self.get_or_create(id, io) {
            track.update_distance(dist, now, io.engine);
        }
    }

    /// Plays `id` on the local track at full gain. A change of identity
    /// takes effect at the next loop boundary, or right away when the loop
    /// length changes, so the new loop lands on its own phase grid.
    pub fn start_local_track<K>(&mut self, id: SoundId, io: &mut Transport<K>) -> bool
    where
        K: Copy + Eq + Hash + Debug + From<TrackKey>,
    {
        let previous = self.local.phase_duration();
        if !self.local.set_buffer(id, io.engine, self.quantization) {
            return false;
        }
        if self.local.state() == TrackState::Playing && previous != self.local.phase_duration() {
            self.stop_local_track(io);
        }

        if let Some(next) = self.local.launch(io.now, io.clock, io.engine) {
            io.scheduler.schedule(K::from(TrackKey::Local), next, true);
        }
        self.local.set_gain(1.0, 0.0, io.engine);
        info!("TrackPool : local track plays sound {id}.");
        true
    }

    /// Stops and drops the remote track for `id`, if there is one.
    pub fn stop_track<K>(&mut self, id: SoundId, io: &mut Transport<K>)
    where
        K: Copy + Eq + Hash + Debug + From<TrackKey>,
    {
        io.scheduler.cancel(K::from(TrackKey::Remote(id)));
        if let Some(track) = self.remote.get_mut(&id) {
            track.stop(io.engine);
            self.drop_remote(id, io.engine);
        }
    }

    /// Silences the local track.
    pub fn stop_local_track<K>(&mut self, io: &mut Transport<K>)
    where
        K: Copy + Eq + Hash + Debug + From<TrackKey>,
    {
        io.scheduler.cancel(K::from(TrackKey::Local));
        self.local.stop(io.engine);
    }

    /// Sets the filter effect of a track. Unknown remote tracks are ignored.
    pub fn set_effect(&mut self, key: TrackKey, val: f32, engine: &mut AudioEngine) {
        match self.track_mut(key) {
            Some(track) => track.set_effect(val, engine),
            None => debug!("TrackPool : effect for unknown track {key:?} dropped."),
        }
    }

    /// The scheduler callback for a track boundary. Returns the next
    /// boundary, or `None` once the track is gone. A remote track evicted
    /// here is called back one loop later and leaves the pool then.
    pub fn advance_time(
        &mut self,
        key: TrackKey,
        due: VirtualTime,
        clock: &dyn VirtualClock,
        engine: &mut AudioEngine,
    ) -> Option<VirtualTime> {
        let track = self.track_mut(key)?;
        if let (TrackState::Evicted, TrackKey::Remote(id)) = (track.state(), key) {
            self.drop_remote(id, engine);
            return None;
        }

        let next = track.advance_time(due, clock, engine);
        if track.state() == TrackState::Evicted {
            return Some(due + track.phase_duration());
        }
        next
    }

    /// Cancels every pending boundary and stops every track.
    pub fn stop_all<K>(&mut self, io: &mut Transport<K>)
    where
        K: Copy + Eq + Hash + Debug + From<TrackKey>,
    {
        self.stop_local_track(io);
        for (id, track) in self.remote.iter_mut() {
            io.scheduler.cancel(K::from(TrackKey::Remote(*id)));
            track.stop(io.engine);
        }
        info!("TrackPool : stopped all tracks.");
    }

    /// A track, if the pool has it.
    pub fn track(&self, key: TrackKey) -> Option<&LoopTrack> {
        match key {
            TrackKey::Local => Some(&self.local),
            TrackKey::Remote(id) => self.remote.get(&id),
        }
    }

    /// Number of remote tracks.
    pub fn remote_count(&self) -> usize {
        self.remote.len()
    }

    fn track_mut(&mut self, key: TrackKey) -> Option<&mut LoopTrack> {
        match key {
            TrackKey::Local => Some(&mut self.local),
            TrackKey::Remote(id) => self.remote.get_mut(&id),
        }
    }

    fn drop_remote(&mut self, id: SoundId, engine: &mut AudioEngine) {
        if let Some(track) = self.remote.remove(&id) {
            // lets the fade-out already scheduled on the voice finish
            engine.release_voice(track.voice());
            debug!("TrackPool : dropped track for sound {id}.");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer_bank::{AudioBuffer, BufferBank};
    use crate::clock::OffsetClock;

    const RATE: u32 = 44100;
    const LOOKAHEAD: f64 = 0.1;

    struct Node {
        clock: OffsetClock,
        engine: AudioEngine,
        scheduler: Scheduler<TrackKey>,
        pool: TrackPool,
    }

    impl Node {
        fn new(offset: f64) -> Self {
            let bank = BufferBank::from_buffers(vec![
                AudioBuffer::new(vec![0.1; 2 * RATE as usize], RATE),
                AudioBuffer::new(vec![0.1; RATE as usize], RATE),
            ]);
            let mut engine = AudioEngine::new(RATE, bank);
            let pool = TrackPool::new(&mut engine, 0.0, 6.0);
            Self {
                clock: OffsetClock::new(offset),
                engine,
                scheduler: Scheduler::new(),
                pool,
            }
        }

        /// Moves the node to virtual time `t`, firing boundaries with the
        /// usual lookahead.
        fn run_until(&mut self, t: VirtualTime) {
            let Self {
                clock,
                engine,
                scheduler,
                pool,
            } = self;
            engine.advance_to(clock.to_local_time(t));
            scheduler.tick(t + LOOKAHEAD, |key, due| {
                pool.advance_time(key, due, &*clock, engine)
            });
        }

        fn io(&mut self, now: VirtualTime) -> (&mut TrackPool, Transport<'_, TrackKey>) {
            (
                &mut self.pool,
                Transport {
                    now,
                    clock: &self.clock,
                    engine: &mut self.engine,
                    scheduler: &mut self.scheduler,
                },
            )
        }

        fn phase(&self, key: TrackKey, t: VirtualTime) -> Option<f64> {
            let voice = self.pool.track(key)?.voice();
            self.engine.playhead(voice, self.clock.to_local_time(t))
        }
    }

    #[test]
    fn nodes_launched_apart_stay_in_phase() {
        let mut a = Node::new(0.0);
        let mut b = Node::new(3.7);

        a.run_until(10.0);
        let (pool, mut io) = a.io(10.0);
        assert!(pool.start_local_track(0, &mut io));

        b.run_until(12.34);
        let (pool, mut io) = b.io(12.34);
        assert!(pool.start_local_track(0, &mut io));

        for step in 0..400 {
            let t = 12.5 + step as f64 * 0.0371;
            a.run_until(t);
            b.run_until(t);
            let pa = a.phase(TrackKey::Local, t).unwrap();
            let pb = b.phase(TrackKey::Local, t).unwrap();
            assert!((pa - pb).abs() < 1.0 / RATE as f64, "at {t}: {pa} vs {pb}");
        }
    }

    #[test]
    fn remote_track_joins_running_cycle() {
        let mut a = Node::new(-1.0);
        a.run_until(5.5);
        let (pool, mut io) = a.io(5.5);
        pool.update_track(1, 1.0, &mut io);

        // one second loop: 5.5 is half way through a cycle
        let phase = a.phase(TrackKey::Remote(1), 5.5).unwrap();
        assert!((phase - 0.5).abs() < 1e-9);
        assert_eq!(a.scheduler.due_at(TrackKey::Remote(1)), Some(6.0));
    }

    #[test]
    fn remote_track_without_keep_alive_is_evicted() {
        let mut a = Node::new(0.0);
        let (pool, mut io) = a.io(0.0);
        pool.update_track(0, 1.0, &mut io);
        assert_eq!(a.pool.remote_count(), 1);

        a.run_until(5.8);
        assert!(a.pool.track(TrackKey::Remote(0)).is_some());
        // boundary at 6.0 is exactly the timeout, not past it
        a.run_until(7.8);
        assert!(a.pool.track(TrackKey::Remote(0)).is_some());
        a.run_until(8.0);
        let track = a.pool.track(TrackKey::Remote(0)).unwrap();
        assert_eq!(track.state(), TrackState::Evicted);
        assert!(a.phase(TrackKey::Remote(0), 8.5).is_none());

        a.run_until(10.0);
        assert!(a.pool.track(TrackKey::Remote(0)).is_none());
        assert!(a.scheduler.due_at(TrackKey::Remote(0)).is_none());
    }

    #[test]
    fn late_keep_alive_revives_the_same_voice() {
        let mut a = Node::new(0.0);
        let (pool, mut io) = a.io(0.0);
        pool.update_track(0, 1.0, &mut io);
        let voice = a.pool.track(TrackKey::Remote(0)).unwrap().voice();
        let voices = a.engine.voice_count();

        // the boundary at 8.0 fires from here and evicts
        a.run_until(7.95);
        assert_eq!(
            a.pool.track(TrackKey::Remote(0)).unwrap().state(),
            TrackState::Evicted
        );

        let (pool, mut io) = a.io(7.95);
        pool.update_track(0, 1.0, &mut io);
        let track = a.pool.track(TrackKey::Remote(0)).unwrap();
        assert_eq!(track.state(), TrackState::Playing);
        assert_eq!(track.voice(), voice);
        assert_eq!(a.engine.voice_count(), voices);
        assert_eq!(a.scheduler.due_at(TrackKey::Remote(0)), Some(10.0));
        assert_eq!(a.phase(TrackKey::Remote(0), 8.5), Some(0.5));
    }

    #[test]
    fn stopped_remote_track_leaves_the_pool() {
        let mut a = Node::new(0.0);
        let (pool, mut io) = a.io(0.0);
        pool.update_track(1, 1.0, &mut io);
        pool.stop_track(1, &mut io);
        assert_eq!(a.pool.remote_count(), 0);
        assert!(a.scheduler.is_empty());

        // unknown ids are fine
        let (pool, mut io) = a.io(0.5);
        pool.stop_track(5, &mut io);
    }

    #[test]
    fn far_updates_do_not_keep_a_track_alive() {
        let mut a = Node::new(0.0);
        for step in 0..20 {
            let t = step as f64 * 0.5;
            a.run_until(t);
            let (pool, mut io) = a.io(t);
            pool.update_track(1, if step == 0 { 1.0 } else { 5.0 }, &mut io);
        }
        // last keep-alive at 0.0, so the boundary at 7.0 evicts and the
        // update in the same step launches a fresh track
        let track = a.pool.track(TrackKey::Remote(1)).unwrap();
        assert_eq!(track.last_updated_at(), 7.0);
    }

    #[test]
    fn local_track_survives_any_silence() {
        let mut a = Node::new(0.0);
        let (pool, mut io) = a.io(0.0);
        pool.start_local_track(1, &mut io);

        a.run_until(120.0);
        assert!(a.phase(TrackKey::Local, 120.0).is_some());
        assert_eq!(
            a.pool.track(TrackKey::Local).unwrap().state(),
            TrackState::Playing
        );
    }

    #[test]
    fn unknown_sound_creates_nothing() {
        let mut a = Node::new(0.0);
        let voices = a.engine.voice_count();
        let (pool, mut io) = a.io(0.0);
        pool.update_track(7, 1.0, &mut io);
        assert_eq!(a.pool.remote_count(), 0);
        assert_eq!(a.engine.voice_count(), voices);
        assert!(a.scheduler.is_empty());
    }

    #[test]
    fn stop_all_clears_boundaries() {
        let mut a = Node::new(0.0);
        let (pool, mut io) = a.io(0.0);
        pool.start_local_track(0, &mut io);
        pool.update_track(1, 1.0, &mut io);
        assert_eq!(a.scheduler.len(), 2);

        let (pool, mut io) = a.io(0.5);
        pool.stop_all(&mut io);
        assert!(a.scheduler.is_empty());
        assert!(a.phase(TrackKey::Local, 0.6).is_none());
        assert!(a.phase(TrackKey::Remote(1), 0.6).is_none());
    }
}
