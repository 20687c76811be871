//! The server node. It owns the [`Allocator`] and is the only place sound
//! identities change hands. Everything it reacts to (connections, client
//! messages, bridge commands) goes through [`Server::dispatch`], one input
//! at a time; its own timers go through [`Server::tick`]. Replies pile up in
//! an outbox for the transport to deliver.

use crate::allocator::{Allocator, ClientId, Location, SwapOutcome};
use crate::bridge::{Bridge, BridgeArg, BridgeCommand};
use crate::clock::VirtualTime;
use crate::gesture::Gesture;
use crate::messages::{ClientMessage, ServerMessage};
use crate::scheduler::Scheduler;
use crate::setup::{InstallationSetup, SwipeUpMode};
use log::{debug, info};
use rand::rngs::StdRng;
use std::collections::{BTreeSet, HashMap};

/// Anything that happens to the server.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ServerInput {
    /// A client opened a session.
    Connected(ClientId),
    /// A client's session ended.
    Disconnected(ClientId),
    /// A client sent something.
    Client {
        /// The sender.
        from: ClientId,
        /// What it sent.
        message: ClientMessage,
    },
    /// The external tools sent something.
    Bridge(BridgeCommand),
}

/// Who an outgoing message is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recipient {
    /// One client.
    Client(ClientId),
    /// Every connected client.
    All,
}

/// A message waiting to be delivered.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Outgoing {
    /// Destination.
    pub to: Recipient,
    /// Payload.
    pub message: ServerMessage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum ServerTimer {
    ClockRelay,
}

/// The server node.
pub struct Server<B> {
    allocator: Allocator,
    bridge: B,
    coordinates: Vec<(f64, f64)>,
    orientations: HashMap<ClientId, [f64; 3]>,
    sources_on: BTreeSet<ClientId>,
    swipe_up: SwipeUpMode,
    clock_relay_interval: f64,
    scheduler: Scheduler<ServerTimer>,
    outbox: Vec<Outgoing>,
}

impl<B: Bridge> Server<B> {
    /// A server for `setup`, talking to the external tools through `bridge`.
    pub fn new(setup: &InstallationSetup, bridge: B, rng: StdRng) -> Self {
        Self {
            allocator: Allocator::new(setup.identity_count(), setup.pick_policy, rng),
            bridge,
            coordinates: setup.coordinates.clone(),
            orientations: HashMap::new(),
            sources_on: BTreeSet::new(),
            swipe_up: setup.swipe_up,
            clock_relay_interval: setup.clock_relay_interval,
            scheduler: Scheduler::new(),
            outbox: Vec::new(),
        }
    }

    /// Starts relaying the clock to the bridge from `now` on.
    pub fn start(&mut self, now: VirtualTime) {
        if self.clock_relay_interval > 0.0 {
            self.scheduler.schedule(ServerTimer::ClockRelay, now, true);
        }
    }

    /// Fires every timer due by `now`.
    pub fn tick(&mut self, now: VirtualTime) {
        let interval = self.clock_relay_interval;
        let bridge = &mut self.bridge;
        self.scheduler.tick(now, |timer, due| match timer {
            ServerTimer::ClockRelay => {
                bridge.send("/clock", &[due.into()]);
                Some(due + interval)
            }
        });
    }

    /// Handles one input at virtual time `now`.
    pub fn dispatch(&mut self, input: ServerInput, now: VirtualTime) {
        match input {
            ServerInput::Connected(client) => self.on_connect(client),
            ServerInput::Disconnected(client) => self.on_disconnect(client),
            ServerInput::Client { from, message } => {
                if !self.allocator.is_connected(from) {
                    debug!("Server : {:?} from unknown client {from} dropped.", message);
                    return;
                }
                self.on_message(from, message, now);
            }
            ServerInput::Bridge(command) => self.on_bridge(command),
        }
    }

    /// Takes everything waiting to be sent.
    pub fn drain(&mut self) -> Vec<Outgoing> {
        std::mem::take(&mut self.outbox)
    }

    /// The identity registry.
    pub fn allocator(&self) -> &Allocator {
        &self.allocator
    }

    /// The bridge.
    pub fn bridge(&self) -> &B {
        &self.bridge
    }

    /// Last stabilized orientation reported by `client`.
    pub fn orientation_of(&self, client: ClientId) -> Option<[f64; 3]> {
        self.orientations.get(&client).copied()
    }

    fn send(&mut self, client: ClientId, message: ServerMessage) {
        self.outbox.push(Outgoing {
            to: Recipient::Client(client),
            message,
        });
    }

    fn broadcast(&mut self, message: ServerMessage) {
        self.outbox.push(Outgoing {
            to: Recipient::All,
            message,
        });
    }

    fn on_connect(&mut self, client: ClientId) {
        let identity = self.allocator.join(client);
        self.send(client, ServerMessage::SoundIdentity(identity));
        self.bridge
            .send("/player/enterExit", &[client.into(), true.into()]);
        if let Some(location) = self.allocator.player(client).map(|p| p.location) {
            self.send(client, ServerMessage::Location(location));
            let studio = location == Location::Studio;
            self.bridge
                .send("/player/location", &[client.into(), studio.into()]);
        }
    }

    fn on_disconnect(&mut self, client: ClientId) {
        let record = self.allocator.leave(client);
        self.orientations.remove(&client);
        let source_on = self.sources_on.remove(&client);
        if let Some(record) = record {
            if source_on {
                self.broadcast(ServerMessage::SourceStatus {
                    id: record.identity,
                    on: false,
                });
            }
            self.broadcast(ServerMessage::PlayerLeft {
                identity: record.identity,
            });
        }
        self.bridge
            .send("/player/enterExit", &[client.into(), false.into()]);
    }

    fn on_message(&mut self, from: ClientId, message: ClientMessage, now: VirtualTime) {
        match message {
            ClientMessage::Orientation(angles) => {
                self.orientations.insert(from, angles);
                let [a, b, c] = angles;
                self.bridge.send(
                    "/player/deviceOrientation",
                    &[from.into(), a.into(), b.into(), c.into()],
                );
            }
            ClientMessage::Acceleration(sum) => {
                self.bridge
                    .send("/player/acceleration", &[from.into(), sum.into()]);
            }
            ClientMessage::Touch { x, y } => {
                self.bridge
                    .send("/player/deviceTouch", &[from.into(), x.into(), y.into()]);
            }
            ClientMessage::TouchActive(on) => {
                self.bridge
                    .send("/player/touchActive", &[from.into(), on.into()]);
            }
            ClientMessage::Gesture(gesture) => self.on_gesture(from, gesture, now),
            ClientMessage::SourcePosition { azimuth, distance } => {
                let Some(id) = self.allocator.identity_of(from) else {
                    debug!("Server : position from client {from} without identity dropped.");
                    return;
                };
                self.broadcast(ServerMessage::SourcePosition {
                    id,
                    azimuth,
                    distance,
                });
            }
            ClientMessage::SourceStatus(on) => {
                let Some(id) = self.allocator.identity_of(from) else {
                    debug!("Server : source status from client {from} without identity dropped.");
                    return;
                };
                if on {
                    self.sources_on.insert(from);
                } else {
                    self.sources_on.remove(&from);
                }
                self.broadcast(ServerMessage::SourceStatus { id, on });
            }
        }
    }

    fn on_gesture(&mut self, from: ClientId, gesture: Gesture, now: VirtualTime) {
        let Some(orientation) = self.orientations.get(&from).copied() else {
            debug!("Server : {gesture:?} from client {from} before any orientation dropped.");
            return;
        };
        info!("Server : client {from} made a {gesture:?}.");

        match gesture {
            Gesture::SwipeUp => match self.swipe_up {
                SwipeUpMode::Swap => self.swap(from),
                SwipeUpMode::Throw => {
                    let target =
                        self.allocator
                            .route_throw(from, orientation[0], &self.coordinates);
                    match target {
                        Some(target) => {
                            info!("Server : client {from} threw at client {target}.");
                            self.send(target, ServerMessage::SwipeTarget);
                        }
                        None => debug!("Server : throw from client {from} hit nobody."),
                    }
                }
            },
            Gesture::SwipeDown => self.bridge.send("/player/swipeDown", &[from.into()]),
            Gesture::Shake => self.bridge.send("/player/shake", &[from.into()]),
            Gesture::Drop => {
                if self.allocator.record_drop(from, now) {
                    self.bridge.send("/gesture/drop", &[1u32.into()]);
                }
            }
        }
    }

    fn swap(&mut self, from: ClientId) {
        match self.allocator.swap(from) {
            SwapOutcome::Swapped {
                identity,
                displaced,
            } => {
                self.send(from, ServerMessage::SoundIdentity(Some(identity)));
                if let Some((other, theirs)) = displaced {
                    self.send(other, ServerMessage::SoundIdentity(Some(theirs)));
                }
            }
            SwapOutcome::Unavailable => self.send(from, ServerMessage::SoundIdentity(None)),
            SwapOutcome::Ignored => {}
        }
    }

    fn on_bridge(&mut self, command: BridgeCommand) {
        match command {
            BridgeCommand::UpdateRequest => {
                let flat: Vec<BridgeArg> = self
                    .coordinates
                    .iter()
                    .flat_map(|&(x, y)| [BridgeArg::from(x), BridgeArg::from(y)])
                    .collect();
                self.bridge.send("/coordinates", &flat);
            }
            BridgeCommand::SetLocation { client, location } => {
                if self.allocator.set_location(client, Some(location)) {
                    self.send(client, ServerMessage::Location(location));
                    let studio = location == Location::Studio;
                    self.bridge
                        .send("/player/location", &[client.into(), studio.into()]);
                }
            }
            BridgeCommand::Proximity {
                client,
                identity,
                distance,
            } => {
                if !self.allocator.is_connected(client) {
                    debug!("Server : proximity for unknown client {client} dropped.");
                    return;
                }
                self.send(client, ServerMessage::Proximity { identity, distance });
            }
            BridgeCommand::Effect { client, value } => {
                if !self.allocator.is_connected(client) {
                    debug!("Server : effect for unknown client {client} dropped.");
                    return;
                }
                self.send(client, ServerMessage::Effect(value));
            }
            BridgeCommand::StopAll => {
                self.sources_on.clear();
                self.broadcast(ServerMessage::StopAll);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::PickPolicy;
    use crate::bridge::BridgeLog;
    use rand::SeedableRng;

    fn server(identities: usize, mode: SwipeUpMode) -> Server<BridgeLog> {
        let setup = InstallationSetup {
            coordinates: (0..identities).map(|i| (i as f64, 0.0)).collect(),
            pick_policy: PickPolicy::Lowest,
            swipe_up: mode,
            ..Default::default()
        };
        Server::new(&setup, BridgeLog::new(), StdRng::seed_from_u64(3))
    }

    fn msg(from: ClientId, message: ClientMessage) -> ServerInput {
        ServerInput::Client { from, message }
    }

    fn to(client: ClientId, message: ServerMessage) -> Outgoing {
        Outgoing {
            to: Recipient::Client(client),
            message,
        }
    }

    const FLAT: ClientMessage = ClientMessage::Orientation([0.0, 0.0, 0.0]);

    #[test]
    fn join_swap_and_studio() {
        let mut server = server(2, SwipeUpMode::Swap);
        server.dispatch(ServerInput::Connected(0), 0.0);
        server.dispatch(ServerInput::Connected(1), 0.0);
        let hall = ServerMessage::Location(Location::Hall);
        assert_eq!(
            server.drain(),
            vec![
                to(0, ServerMessage::SoundIdentity(Some(0))),
                to(0, hall),
                to(1, ServerMessage::SoundIdentity(Some(1))),
                to(1, hall),
            ]
        );
        assert_eq!(
            server.bridge().to_address("/player/location").count(),
            2
        );

        // No orientation yet, so the gesture is ignored.
        server.dispatch(msg(0, ClientMessage::Gesture(Gesture::SwipeUp)), 1.0);
        assert!(server.drain().is_empty());

        server.dispatch(msg(0, FLAT), 1.0);
        server.dispatch(msg(0, ClientMessage::Gesture(Gesture::SwipeUp)), 1.0);
        assert_eq!(
            server.drain(),
            vec![
                to(0, ServerMessage::SoundIdentity(Some(1))),
                to(1, ServerMessage::SoundIdentity(Some(0))),
            ]
        );

        server.dispatch(
            ServerInput::Bridge(BridgeCommand::SetLocation {
                client: 1,
                location: Location::Studio,
            }),
            2.0,
        );
        assert_eq!(server.drain(), vec![to(1, ServerMessage::Location(Location::Studio))]);

        server.dispatch(msg(0, ClientMessage::Gesture(Gesture::SwipeUp)), 3.0);
        assert_eq!(server.drain(), vec![to(0, ServerMessage::SoundIdentity(None))]);
        assert_eq!(server.allocator().identity_of(0), Some(1));
        assert_eq!(server.allocator().identity_of(1), Some(0));

        server.dispatch(ServerInput::Disconnected(1), 4.0);
        assert_eq!(
            server.drain(),
            vec![Outgoing {
                to: Recipient::All,
                message: ServerMessage::PlayerLeft { identity: 0 },
            }]
        );
        assert_eq!(server.allocator().holder_of(0), None);
    }

    #[test]
    fn join_without_identity_gets_no_location() {
        let mut server = server(1, SwipeUpMode::Swap);
        server.dispatch(ServerInput::Connected(0), 0.0);
        server.dispatch(ServerInput::Connected(1), 0.0);
        server.drain();
        server.dispatch(ServerInput::Connected(1), 0.0);
        assert_eq!(server.drain(), vec![to(1, ServerMessage::SoundIdentity(None))]);

        // nothing was freed, so nothing to announce
        server.dispatch(ServerInput::Disconnected(1), 1.0);
        assert!(server.drain().is_empty());
        assert_eq!(
            server.bridge().to_address("/player/location").count(),
            1
        );
    }

    #[test]
    fn throw_reaches_the_player_in_front() {
        let setup = InstallationSetup {
            coordinates: vec![(0.0, 2.0), (2.0, 0.0), (0.0, -2.0)],
            pick_policy: PickPolicy::Lowest,
            swipe_up: SwipeUpMode::Throw,
            ..Default::default()
        };
        let mut server = Server::new(&setup, BridgeLog::new(), StdRng::seed_from_u64(3));
        for c in 0..3 {
            server.dispatch(ServerInput::Connected(c), 0.0);
        }
        server.drain();

        // Client 2 faces the origin, client 0 is straight ahead.
        server.dispatch(msg(2, FLAT), 1.0);
        server.dispatch(msg(2, ClientMessage::Gesture(Gesture::SwipeUp)), 1.0);
        assert_eq!(server.drain(), vec![to(0, ServerMessage::SwipeTarget)]);

        // Turned 45 degrees clockwise, it points at client 1.
        server.dispatch(msg(2, ClientMessage::Orientation([-45.0, 0.0, 0.0])), 2.0);
        server.dispatch(msg(2, ClientMessage::Gesture(Gesture::SwipeUp)), 2.0);
        assert_eq!(server.drain(), vec![to(1, ServerMessage::SwipeTarget)]);
        assert_eq!(server.allocator().identity_of(2), Some(2));
    }

    #[test]
    fn drop_needs_everybody() {
        let mut server = server(3, SwipeUpMode::Swap);
        for c in 0..3 {
            server.dispatch(ServerInput::Connected(c), 0.0);
            server.dispatch(msg(c, FLAT), 0.0);
        }
        let drop = ClientMessage::Gesture(Gesture::Drop);
        server.dispatch(msg(0, drop), 10.0);
        server.dispatch(msg(1, drop), 11.5);
        assert_eq!(server.bridge().to_address("/gesture/drop").count(), 0);

        server.dispatch(msg(2, drop), 18.0);
        assert_eq!(server.bridge().to_address("/gesture/drop").count(), 1);

        server.dispatch(msg(2, drop), 18.5);
        assert_eq!(server.bridge().to_address("/gesture/drop").count(), 1);
    }

    #[test]
    fn mirrors_players_to_the_bridge() {
        let mut server = server(2, SwipeUpMode::Swap);
        server.dispatch(ServerInput::Connected(1), 0.0);
        server.dispatch(msg(1, ClientMessage::Orientation([10.0, 2.0, -1.0])), 0.5);
        server.dispatch(msg(1, ClientMessage::Touch { x: 0.25, y: 0.75 }), 0.6);
        server.dispatch(msg(1, ClientMessage::Gesture(Gesture::SwipeDown)), 0.7);
        server.dispatch(ServerInput::Disconnected(1), 1.0);
        server.dispatch(msg(1, ClientMessage::Gesture(Gesture::Shake)), 1.1);

        let addresses: Vec<&str> = server
            .bridge()
            .sent()
            .iter()
            .map(|(a, _)| a.as_str())
            .collect();
        assert_eq!(
            addresses,
            vec![
                "/player/enterExit",
                "/player/location",
                "/player/deviceOrientation",
                "/player/deviceTouch",
                "/player/swipeDown",
                "/player/enterExit",
            ]
        );
        // client 1 starts in the hall
        assert_eq!(
            server.bridge().sent()[1].1,
            vec![BridgeArg::Int(1), BridgeArg::Int(0)]
        );
        assert_eq!(
            server.bridge().sent()[5].1,
            vec![BridgeArg::Int(1), BridgeArg::Int(0)]
        );
        assert_eq!(server.orientation_of(1), None);
    }

    #[test]
    fn answers_update_requests_and_relays_the_clock() {
        let mut server = server(2, SwipeUpMode::Swap);
        server.dispatch(ServerInput::Bridge(BridgeCommand::UpdateRequest), 0.0);
        assert_eq!(
            server.bridge().sent()[0],
            (
                "/coordinates".to_string(),
                vec![
                    BridgeArg::Float(0.0),
                    BridgeArg::Float(0.0),
                    BridgeArg::Float(1.0),
                    BridgeArg::Float(0.0)
                ]
            )
        );

        server.start(1.0);
        server.tick(1.0);
        server.tick(1.035);
        assert_eq!(server.bridge().to_address("/clock").count(), 4);
    }

    #[test]
    fn solo_sources_follow_their_controller() {
        let mut server = server(2, SwipeUpMode::Swap);
        server.dispatch(ServerInput::Connected(0), 0.0);
        server.dispatch(ServerInput::Connected(1), 0.0);
        server.drain();

        server.dispatch(msg(1, ClientMessage::SourceStatus(true)), 1.0);
        server.dispatch(
            msg(
                1,
                ClientMessage::SourcePosition {
                    azimuth: 45.0,
                    distance: 0.2,
                },
            ),
            1.1,
        );
        server.dispatch(ServerInput::Disconnected(1), 2.0);

        let all: Vec<ServerMessage> = server
            .drain()
            .into_iter()
            .inspect(|o| assert_eq!(o.to, Recipient::All))
            .map(|o| o.message)
            .collect();
        assert_eq!(
            all,
            vec![
                ServerMessage::SourceStatus { id: 1, on: true },
                ServerMessage::SourcePosition {
                    id: 1,
                    azimuth: 45.0,
                    distance: 0.2
                },
                ServerMessage::SourceStatus { id: 1, on: false },
                ServerMessage::PlayerLeft { identity: 1 },
            ]
        );
    }

    #[test]
    fn bridge_commands_reach_connected_clients_only() {
        let mut server = server(2, SwipeUpMode::Swap);
        server.dispatch(ServerInput::Connected(0), 0.0);
        server.drain();

        server.dispatch(
            ServerInput::Bridge(BridgeCommand::Proximity {
                client: 0,
                identity: 1,
                distance: 1.5,
            }),
            1.0,
        );
        server.dispatch(
            ServerInput::Bridge(BridgeCommand::Effect {
                client: 5,
                value: 0.5,
            }),
            1.0,
        );
        server.dispatch(ServerInput::Bridge(BridgeCommand::StopAll), 1.0);
        assert_eq!(
            server.drain(),
            vec![
                to(
                    0,
                    ServerMessage::Proximity {
                        identity: 1,
                        distance: 1.5
                    }
                ),
                Outgoing {
                    to: Recipient::All,
                    message: ServerMessage::StopAll
                },
            ]
        );
    }
}
