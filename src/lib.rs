//! SoundSwarm is a networked sound installation. Every visitor carries a
//! phone that holds one sound of a shared piece; the phones loop their
//! sounds locked to a common clock, pick up the sounds of the players
//! standing close to them, and render the soloists' sounds binaurally
//! around the listener. Gestures (swipes, shakes, a group "drop") trade
//! sounds between players and drive external sound and light tools.
//!
//! The crate has three layers:
//!
//! - the audio core: [clock], [scheduler], [engine], [loop_track],
//!   [track_pool], [ambisonics] and [spatial_field];
//! - the session logic: [allocator] on the server and [gesture] on the
//!   clients;
//! - the nodes that wire it together: [server] and [client], speaking the
//!   [messages] protocol to each other and the [bridge] protocol to the
//!   outside world.
//!
//! The `swarm` binary runs a whole installation in one process.

#![warn(missing_docs)]
pub mod allocator;
pub mod ambisonics;
pub mod args;
pub mod bridge;
pub mod buffer_bank;
pub mod client;
pub mod clock;
pub mod dummy_sensors;
pub mod engine;
pub mod gesture;
pub mod hound_helpers;
pub mod hound_writer;
pub mod loop_track;
pub mod messages;
pub mod scheduler;
pub mod sensor_decoder;
pub mod server;
pub mod setup;
pub mod spatial_field;
pub mod track_pool;
