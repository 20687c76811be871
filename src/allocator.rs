//! The server's authoritative map between connected clients and sound
//! identities.
//!
//! No two players ever hold the same identity: every operation moves the
//! map from one injective state to the next in a single step, and the
//! server applies one operation at a time.

use crate::ambisonics::wrap_degrees;
use crate::clock::VirtualTime;
use log::{debug, info};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// A sound identity. It also names the buffer the holder plays.
pub type SoundId = u32;

/// Stable handle of a connected client, handed out in join order.
pub type ClientId = u32;

/// Drops further apart than this, in seconds, do not count as together.
pub const DROP_WINDOW: f64 = 10.0;

/// Where in the installation a player is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Location {
    /// The shared space; identities here can be swapped away.
    Hall,
    /// The studio; identities here are protected.
    Studio,
}

/// How identities are chosen among the available ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PickPolicy {
    /// Uniformly at random.
    #[default]
    Random,
    /// The lowest available identity, for reproducible sessions.
    Lowest,
}

/// The server's record of one player.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlayerRecord {
    /// Who.
    pub client: ClientId,
    /// What they play.
    pub identity: SoundId,
    /// Where they are.
    pub location: Location,
}

/// What a swap request did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapOutcome {
    /// The requester now holds `identity`. If it was held, `displaced`
    /// names the previous holder and the identity they received in return.
    Swapped {
        /// The requester's new identity.
        identity: SoundId,
        /// The other side of a two-way exchange.
        displaced: Option<(ClientId, SoundId)>,
    },
    /// Nothing was available; nobody changed.
    Unavailable,
    /// The requester holds no identity or is not in the hall.
    Ignored,
}

/// Identity allocator.
#[derive(Debug)]
pub struct Allocator {
    identity_count: u32,
    connected: BTreeSet<ClientId>,
    players: BTreeMap<ClientId, PlayerRecord>,
    drops: HashMap<ClientId, VirtualTime>,
    policy: PickPolicy,
    rng: StdRng,
}

impl Allocator {
    /// An allocator over identities `0..identity_count`.
    pub fn new(identity_count: u32, policy: PickPolicy, rng: StdRng) -> Self {
        Self {
            identity_count,
            connected: BTreeSet::new(),
            players: BTreeMap::new(),
            drops: HashMap::new(),
            policy,
            rng,
        }
    }

    fn held(&self) -> BTreeSet<SoundId> {
        self.players.values().map(|p| p.identity).collect()
    }

    fn pick(&mut self, available: &[SoundId]) -> Option<SoundId> {
        match self.policy {
            PickPolicy::Random => available.choose(&mut self.rng).copied(),
            PickPolicy::Lowest => available.iter().min().copied(),
        }
    }

    /// Connects `client` and gives it a free identity in the hall. Returns
    /// `None` when every identity is held; the client stays connected
    /// without one.
    pub fn join(&mut self, client: ClientId) -> Option<SoundId> {
        self.connected.insert(client);
        if let Some(record) = self.players.get(&client) {
            return Some(record.identity);
        }

        let held = self.held();
        let available: Vec<SoundId> = (0..self.identity_count)
            .filter(|id| !held.contains(id))
            .collect();
        let Some(identity) = self.pick(&available) else {
            info!("Allocator : no identity left for client {client}.");
            return None;
        };

        self.players.insert(
            client,
            PlayerRecord {
                client,
                identity,
                location: Location::Hall,
            },
        );
        info!("Allocator : client {client} joined with identity {identity}.");
        Some(identity)
    }

    /// Disconnects `client`, freeing its identity and forgetting its drop.
    pub fn leave(&mut self, client: ClientId) -> Option<PlayerRecord> {
        self.connected.remove(&client);
        self.drops.remove(&client);
        let record = self.players.remove(&client);
        if let Some(record) = record {
            info!(
                "Allocator : client {client} left, identity {} is free.",
                record.identity
            );
        }
        record
    }

    /// Trades the requester's identity for another one. Studio identities
    /// are never taken; a held identity is exchanged, never orphaned.
    pub fn swap(&mut self, client: ClientId) -> SwapOutcome {
        let Some(me) = self.players.get(&client).copied() else {
            debug!("Allocator : swap from unknown client {client} dropped.");
            return SwapOutcome::Ignored;
        };
        if me.location != Location::Hall {
            debug!("Allocator : client {client} is not in the hall, no swap.");
            return SwapOutcome::Ignored;
        }

        let protected: BTreeSet<SoundId> = self
            .players
            .values()
            .filter(|p| p.location == Location::Studio)
            .map(|p| p.identity)
            .collect();
        let available: Vec<SoundId> = (0..self.identity_count)
            .filter(|id| *id != me.identity && !protected.contains(id))
            .collect();
        let Some(identity) = self.pick(&available) else {
            info!("Allocator : nothing to swap for client {client}.");
            return SwapOutcome::Unavailable;
        };

        let holder = self
            .players
            .values()
            .find(|p| p.identity == identity)
            .map(|p| p.client);
        let displaced = holder.map(|other| (other, me.identity));

        if let Some(other) = holder.and_then(|other| self.players.get_mut(&other)) {
            other.identity = me.identity;
        }
        if let Some(record) = self.players.get_mut(&client) {
            record.identity = identity;
        }

        info!(
            "Allocator : client {client} swapped {} for {identity}{}.",
            me.identity,
            holder.map_or(String::new(), |other| format!(" with client {other}"))
        );
        SwapOutcome::Swapped {
            identity,
            displaced,
        }
    }

    /// Moves `client` to `location`. `None` leaves it where it is. Returns
    /// whether anything changed.
    pub fn set_location(&mut self, client: ClientId, location: Option<Location>) -> bool {
        let Some(location) = location else {
            return false;
        };
        match self.players.get_mut(&client) {
            Some(record) if record.location != location => {
                record.location = location;
                info!("Allocator : client {client} is now in the {location:?}.");
                true
            }
            Some(_) => false,
            None => {
                debug!("Allocator : location for unknown client {client} dropped.");
                false
            }
        }
    }

    /// Records a drop gesture of `client` at `at`. Returns `true` exactly
    /// when this completes a synchronized drop: every connected client has
    /// dropped, all within [`DROP_WINDOW`]. The record is then cleared.
    pub fn record_drop(&mut self, client: ClientId, at: VirtualTime) -> bool {
        if !self.connected.contains(&client) {
            debug!("Allocator : drop from unknown client {client} dropped.");
            return false;
        }
        self.drops.insert(client, at);

        let mut earliest = f64::INFINITY;
        let mut latest = f64::NEG_INFINITY;
        for id in &self.connected {
            let Some(t) = self.drops.get(id) else {
                return false;
            };
            earliest = earliest.min(*t);
            latest = latest.max(*t);
        }

        if latest - earliest < DROP_WINDOW {
            info!("Allocator : synchronized drop across {} clients.", self.connected.len());
            self.drops.clear();
            true
        } else {
            false
        }
    }

    /// The player a throw from `sender` is aimed at. The sender faces the
    /// centre of the room, turned by `sender_azimuth` degrees; the receiver
    /// with the smallest angle off that aim wins, ties going to the
    /// earliest joined. `coordinates` holds everybody's position by handle.
    pub fn route_throw(
        &self,
        sender: ClientId,
        sender_azimuth: f64,
        coordinates: &[(f64, f64)],
    ) -> Option<ClientId> {
        let &(sx, sy) = coordinates.get(sender as usize)?;
        let aim = (-sy).atan2(-sx).to_degrees() + sender_azimuth;

        let mut best: Option<(ClientId, f64)> = None;
        for client in self.players.keys().filter(|c| **c != sender) {
            let Some(&(x, y)) = coordinates.get(*client as usize) else {
                continue;
            };
            let bearing = (y - sy).atan2(x - sx).to_degrees();
            let deviation = wrap_degrees(bearing - aim).abs();
            if best.map_or(true, |(_, d)| deviation < d) {
                best = Some((*client, deviation));
            }
        }
        best.map(|(client, _)| client)
    }

    /// The identity `client` holds.
    pub fn identity_of(&self, client: ClientId) -> Option<SoundId> {
        self.players.get(&client).map(|p| p.identity)
    }

    /// Who holds `identity`.
    pub fn holder_of(&self, identity: SoundId) -> Option<ClientId> {
        self.players
            .values()
            .find(|p| p.identity == identity)
            .map(|p| p.client)
    }

    /// The record of `client`.
    pub fn player(&self, client: ClientId) -> Option<&PlayerRecord> {
        self.players.get(&client)
    }

    /// Every player, in join order.
    pub fn players(&self) -> impl Iterator<Item = &PlayerRecord> {
        self.players.values()
    }

    /// Whether `client` is connected, with or without an identity.
    pub fn is_connected(&self, client: ClientId) -> bool {
        self.connected.contains(&client)
    }

    /// Connected clients, in join order.
    pub fn connected(&self) -> impl Iterator<Item = ClientId> + '_ {
        self.connected.iter().copied()
    }

    /// Number of identities.
    pub fn identity_count(&self) -> u32 {
        self.identity_count
    }
}
