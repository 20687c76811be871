//! A whole installation in one process: one server, a group of clients, and
//! a loopback transport between them that pushes every message through the
//! wire encoding.

use log::{debug, info, trace};
use rand::prelude::*;
use serde::{de::DeserializeOwned, Serialize};
use soundswarm::{
    allocator::{ClientId, Location},
    ambisonics::BinauralDecoder,
    args::SimulateCommand,
    bridge::{BridgeCommand, BridgeLog},
    buffer_bank::BufferBank,
    client::ClientNode,
    clock::{OffsetClock, VirtualTime},
    dummy_sensors::{DummySensors, Motion},
    gesture::SensorEvent,
    messages::{self, WireError},
    sensor_decoder::parse_feed,
    server::{Recipient, Server, ServerInput},
    setup::InstallationSetup,
};
use std::{collections::BTreeMap, error::Error, fmt::Debug, fs};

/// Seconds between proximity reports from the tracking system.
const PROXIMITY_INTERVAL: f64 = 1.0;
/// Radius of the circle players stand on when the setup places nobody.
const CIRCLE_RADIUS: f64 = 1.5;

struct Script {
    events: Vec<SensorEvent>,
    next: usize,
}

pub struct Session {
    server: Server<BridgeLog>,
    clients: Vec<ClientNode>,
    scripts: Vec<Script>,
    converge_at: Vec<VirtualTime>,
    coordinates: Vec<(f64, f64)>,
    next_proximity: VirtualTime,
    cues: Vec<(VirtualTime, BridgeCommand)>,
    block: usize,
}

impl Session {
    pub fn new(mut setup: InstallationSetup, cmd: &SimulateCommand) -> Result<Self, Box<dyn Error>> {
        let n = cmd.clients as usize;
        if setup.coordinates.len() < n {
            setup.coordinates = circle(n, CIRCLE_RADIUS);
        }
        let mut rng = match setup.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let order = setup.order()?;
        let buffers = if setup.sounds.is_empty() {
            BufferBank::synthesized(setup.identity_count() as usize, cmd.loop_length, setup.sample_rate)
        } else {
            BufferBank::load(&setup.sounds)
        };
        let decoder = match &setup.decoder_filters {
            Some(path) => BinauralDecoder::load(order, path, setup.sample_rate)?,
            None => BinauralDecoder::virtual_microphones(order),
        };

        let server_rng = StdRng::seed_from_u64(rng.gen());
        let mut server = Server::new(&setup, BridgeLog::new(), server_rng);
        server.start(0.0);

        let mut clients = Vec::with_capacity(n);
        let mut scripts = Vec::with_capacity(n);
        let mut converge_at = Vec::with_capacity(n);
        for i in 0..n {
            let id = i as ClientId;
            // every phone booted at a different moment
            let clock = OffsetClock::unsynchronized(-rng.gen_range(0.0..100.0));
            let client_rng = StdRng::seed_from_u64(rng.gen());
            let mut client = ClientNode::new(id, &setup, buffers.clone(), decoder.clone(), clock, client_rng)?;
            client.sync_to(0.0);
            let soloist = cmd.soloist == Some(id);
            client.set_soloist(soloist);

            let events = match (&cmd.feed, i) {
                (Some(path), 0) => parse_feed(&fs::read_to_string(path)?)?,
                _ => {
                    let mut sensors = DummySensors::new(StdRng::seed_from_u64(rng.gen()), 0.3, 20.0);
                    sensors.script(0.0, &default_script(i, soloist))
                }
            };
            info!("Session : client {id} has {} sensor events.", events.len());

            clients.push(client);
            scripts.push(Script { events, next: 0 });
            converge_at.push(rng.gen_range(0.2..1.5));
        }

        let cues = vec![
            (0.0, BridgeCommand::UpdateRequest),
            (
                8.0,
                BridgeCommand::Effect {
                    client: 0,
                    value: 0.4,
                },
            ),
            (
                10.0,
                BridgeCommand::SetLocation {
                    client: 1,
                    location: Location::Studio,
                },
            ),
            (
                20.0,
                BridgeCommand::SetLocation {
                    client: 1,
                    location: Location::Hall,
                },
            ),
        ];

        let mut session = Self {
            server,
            clients,
            scripts,
            converge_at,
            coordinates: setup.coordinates,
            next_proximity: 0.0,
            cues,
            block: cmd.block,
        };
        for i in 0..n {
            session.server.dispatch(ServerInput::Connected(i as ClientId), 0.0);
        }
        session.deliver()?;
        Ok(session)
    }

    /// Advances everything to `t` and renders one block of client 0.
    pub fn step(&mut self, t: VirtualTime) -> Result<(Vec<f32>, Vec<f32>), WireError> {
        self.server.tick(t);
        self.operate(t);

        for (i, client) in self.clients.iter_mut().enumerate() {
            if self.converge_at[i] <= t && client.now().is_none() {
                debug!("Session : client {i} clock converged at {t:.2}.");
                client.converge_clock();
            }

            let script = &mut self.scripts[i];
            while let Some(event) = script.events.get(script.next).filter(|e| e.at <= t).copied() {
                client.sense(&event);
                script.next += 1;
            }

            for message in client.drain() {
                let message = over_the_wire(&message)?;
                self.server.dispatch(
                    ServerInput::Client {
                        from: client.id(),
                        message,
                    },
                    t,
                );
            }
        }
        self.deliver()?;

        let mut out = (vec![0.0; self.block], vec![0.0; self.block]);
        for client in self.clients.iter_mut() {
            let rendered = client.render(self.block);
            if client.id() == 0 {
                out = rendered;
            }
        }
        Ok(out)
    }

    /// Logs what went out over the bridge.
    pub fn summarize(&self) {
        let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
        for (address, _) in self.server.bridge().sent() {
            *counts.entry(address.as_str()).or_default() += 1;
        }
        for (address, count) in counts {
            info!("Session : bridge {address} x{count}.");
        }
        for client in &self.clients {
            info!(
                "Session : client {} ended with identity {:?} and {} remote tracks.",
                client.id(),
                client.identity(),
                client.pool().remote_count()
            );
        }
    }

    // The operator's cue list and the tracking system's proximity reports.
    fn operate(&mut self, t: VirtualTime) {
        while let Some(&(at, command)) = self.cues.first() {
            if at > t {
                break;
            }
            self.cues.remove(0);
            self.server.dispatch(ServerInput::Bridge(command), t);
        }

        if t < self.next_proximity {
            return;
        }
        self.next_proximity += PROXIMITY_INTERVAL;
        for (a, &(ax, ay)) in self.coordinates.iter().enumerate() {
            for (b, &(bx, by)) in self.coordinates.iter().enumerate() {
                if a == b {
                    continue;
                }
                let Some(identity) = self.server.allocator().identity_of(b as ClientId) else {
                    continue;
                };
                let command = BridgeCommand::Proximity {
                    client: a as ClientId,
                    identity,
                    distance: (bx - ax).hypot(by - ay),
                };
                self.server.dispatch(ServerInput::Bridge(command), t);
            }
        }
    }

    fn deliver(&mut self) -> Result<(), WireError> {
        for outgoing in self.server.drain() {
            let message = over_the_wire(&outgoing.message)?;
            match outgoing.to {
                Recipient::Client(id) => match self.clients.get_mut(id as usize) {
                    Some(client) => client.dispatch(message),
                    None => debug!("Session : no client {id} to deliver {message:?} to."),
                },
                Recipient::All => self.clients.iter_mut().for_each(|c| c.dispatch(message)),
            }
        }
        Ok(())
    }
}

fn over_the_wire<T: Serialize + DeserializeOwned + Debug>(message: &T) -> Result<T, WireError> {
    let frame = messages::encode(message)?;
    trace!("Wire : {frame}");
    messages::decode(&frame)
}

fn circle(n: usize, radius: f64) -> Vec<(f64, f64)> {
    (0..n)
        .map(|i| {
            let angle = i as f64 / n as f64 * std::f64::consts::TAU;
            (radius * angle.cos(), radius * angle.sin())
        })
        .collect()
}

fn default_script(i: usize, soloist: bool) -> Vec<Motion> {
    let lead_in = Motion::Rest {
        duration: 1.0 + i as f64 * 0.7,
    };
    if soloist {
        return vec![
            lead_in,
            Motion::Solo {
                azimuth: -90.0,
                distance: 0.3,
                sweep: 180.0,
                duration: 6.0,
            },
            Motion::Rest { duration: 3.0 },
            Motion::Solo {
                azimuth: 45.0,
                distance: 0.15,
                sweep: -90.0,
                duration: 4.0,
            },
        ];
    }
    vec![
        lead_in,
        Motion::SwipeUp,
        Motion::Rest { duration: 3.0 },
        Motion::Turn {
            to: ((i * 90 + 45) % 360) as f64,
            duration: 1.5,
        },
        Motion::Rest { duration: 2.0 },
        Motion::Drop,
        Motion::Rest { duration: 2.0 },
        Motion::Shake,
        Motion::Rest { duration: 4.0 },
        Motion::SwipeDown,
        Motion::Rest { duration: 6.0 },
    ]
}
