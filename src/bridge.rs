//! The link to external sound design and lighting tools. Messages are an
//! OSC-style address plus a list of numbers, sent fire-and-forget.

use crate::allocator::{ClientId, Location, SoundId};
use log::trace;
use std::fmt;

/// One argument of a bridge message.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BridgeArg {
    /// An integer.
    Int(i64),
    /// A float.
    Float(f64),
}

impl fmt::Display for BridgeArg {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BridgeArg::Int(i) => write!(f, "{}", i),
            BridgeArg::Float(x) => write!(f, "{}", x),
        }
    }
}

impl From<u32> for BridgeArg {
    fn from(value: u32) -> Self {
        BridgeArg::Int(value as i64)
    }
}

impl From<bool> for BridgeArg {
    fn from(value: bool) -> Self {
        BridgeArg::Int(value as i64)
    }
}

impl From<f64> for BridgeArg {
    fn from(value: f64) -> Self {
        BridgeArg::Float(value)
    }
}

/// Outbound side of the bridge.
pub trait Bridge {
    /// Sends `args` to `address`. Never fails; a lost message is lost.
    fn send(&mut self, address: &str, args: &[BridgeArg]);
}

/// What the external tools can ask of the server.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BridgeCommand {
    /// Asks for everybody's coordinates.
    UpdateRequest,
    /// Moves a player between rooms.
    SetLocation {
        /// The player.
        client: ClientId,
        /// Where to.
        location: Location,
    },
    /// Distance between a client and the holder of a sound identity.
    Proximity {
        /// Who hears it.
        client: ClientId,
        /// Whose sound.
        identity: SoundId,
        /// Meters.
        distance: f64,
    },
    /// Filter amount for a client's own track.
    Effect {
        /// The player.
        client: ClientId,
        /// In [0, 1].
        value: f32,
    },
    /// Silences every client.
    StopAll,
}

/// A bridge with nothing on the other end.
#[derive(Debug, Default)]
pub struct NullBridge;

impl Bridge for NullBridge {
    fn send(&mut self, address: &str, args: &[BridgeArg]) {
        trace!("Bridge : {} {:?} dropped.", address, args);
    }
}

/// A bridge that keeps everything sent through it.
#[derive(Debug, Default)]
pub struct BridgeLog {
    sent: Vec<(String, Vec<BridgeArg>)>,
}

impl BridgeLog {
    /// An empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything sent so far, oldest first.
    pub fn sent(&self) -> &[(String, Vec<BridgeArg>)] {
        &self.sent
    }

    /// Arguments of every message sent to `address`.
    pub fn to_address<'a>(&'a self, address: &'a str) -> impl Iterator<Item = &'a [BridgeArg]> + 'a {
        self.sent
            .iter()
            .filter(move |(a, _)| a == address)
            .map(|(_, args)| args.as_slice())
    }

    /// Empties the log.
    pub fn clear(&mut self) {
        self.sent.clear();
    }
}

impl Bridge for BridgeLog {
    fn send(&mut self, address: &str, args: &[BridgeArg]) {
        self.sent.push((address.to_string(), args.to_vec()));
    }
}
