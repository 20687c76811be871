//! Typed messages exchanged between the server and its clients, and their
//! encoding on the wire. Every message is a [serde] enum written with [ron],
//! one message per frame:
//!
//! ```text
//! Orientation((91.5, -3.0, 0.25))
//! SoundIdentity(Some(2))
//! ```

use crate::allocator::{Location, SoundId};
use crate::gesture::Gesture;
use crate::spatial_field::SourceId;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{borrow::Cow, fmt};

/// Client to server.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Stabilized (azimuth, roll, tilt) in degrees.
    Orientation([f64; 3]),
    /// L1 sum of an accepted acceleration sample.
    Acceleration(f64),
    /// A touch position, normalized to [0, 1].
    Touch {
        /// Horizontal position.
        x: f64,
        /// Vertical position.
        y: f64,
    },
    /// Whether a finger is on the surface.
    TouchActive(bool),
    /// A classified gesture.
    Gesture(Gesture),
    /// Where this client wants its sound placed around the listeners.
    SourcePosition {
        /// Degrees.
        azimuth: f64,
        /// Normalized distance.
        distance: f64,
    },
    /// Turns this client's sound source on or off.
    SourceStatus(bool),
}

/// Server to client.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    /// The sound identity the client now holds. `None` means none was
    /// available.
    SoundIdentity(Option<SoundId>),
    /// The room the client was moved to.
    Location(Location),
    /// Another client threw a sound at this one.
    SwipeTarget,
    /// How far the holder of `identity` is from this client.
    Proximity {
        /// Remote sound identity.
        identity: SoundId,
        /// Meters.
        distance: f64,
    },
    /// Filter amount for this client's own track, in [0, 1].
    Effect(f32),
    /// Moves a spatial source.
    SourcePosition {
        /// Source, keyed by its controller's sound identity.
        id: SourceId,
        /// Degrees.
        azimuth: f64,
        /// Normalized distance.
        distance: f64,
    },
    /// Starts or stops a spatial source.
    SourceStatus {
        /// Source, keyed by its controller's sound identity.
        id: SourceId,
        /// On or off.
        on: bool,
    },
    /// The holder of `identity` left the installation.
    PlayerLeft {
        /// The identity just freed.
        identity: SoundId,
    },
    /// Silence everything.
    StopAll,
}

/// Errors when encoding or decoding a wire frame.
#[derive(Debug)]
pub enum WireError {
    /// Returned when a frame does not decode.
    Ron(ron::error::SpannedError),
    /// Returned when a message does not encode.
    RonSer(ron::Error),
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let msg = match self {
            WireError::Ron(error) => Cow::from(format!("bad frame: {}", error)),
            WireError::RonSer(error) => Cow::from(format!("cannot encode: {}", error)),
        };

        write!(f, "{}", msg)
    }
}

impl std::error::Error for WireError {}

impl From<ron::error::SpannedError> for WireError {
    fn from(value: ron::error::SpannedError) -> Self {
        WireError::Ron(value)
    }
}

impl From<ron::Error> for WireError {
    fn from(value: ron::Error) -> Self {
        WireError::RonSer(value)
    }
}

/// Encodes one message as a wire frame.
pub fn encode<T: Serialize>(message: &T) -> Result<String, WireError> {
    Ok(ron::ser::to_string(message)?)
}

/// Decodes one wire frame.
pub fn decode<T: DeserializeOwned>(frame: &str) -> Result<T, WireError> {
    Ok(ron::de::from_str(frame)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_are_readable() {
        assert_eq!(
            encode(&ServerMessage::SoundIdentity(Some(2))).unwrap(),
            "SoundIdentity(Some(2))"
        );
        assert_eq!(
            encode(&ClientMessage::Gesture(Gesture::SwipeUp)).unwrap(),
            "Gesture(SwipeUp)"
        );
    }

    #[test]
    fn frames_decode() {
        let msg: ClientMessage = decode("Touch(x: 0.25, y: 0.5)").unwrap();
        assert_eq!(msg, ClientMessage::Touch { x: 0.25, y: 0.5 });

        let msg: ServerMessage = decode("SourceStatus(id: 3, on: true)").unwrap();
        assert_eq!(msg, ServerMessage::SourceStatus { id: 3, on: true });

        let msg: ServerMessage = decode("SoundIdentity(None)").unwrap();
        assert_eq!(msg, ServerMessage::SoundIdentity(None));
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(matches!(
            decode::<ServerMessage>("Teleport(1)"),
            Err(WireError::Ron(_))
        ));
        assert!(decode::<ClientMessage>("Orientation((1.0, 2.0))").is_err());
    }
}
