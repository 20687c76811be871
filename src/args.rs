// Commandline argument parser using clap for SoundSwarm

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser, Clone)]
#[clap(version, about)]
pub struct SwarmArgs {
    #[command(subcommand, long_about)]
    /// Which task to perform, a simulated session or gesture decoding
    pub command: CommandTask,
}

#[derive(Debug, Subcommand, Clone)]
pub enum CommandTask {
    /// Run a server and a group of clients in one process
    #[command(about)]
    Simulate(SimulateCommand),

    /// Print the gestures found in a sensor feed file
    #[command(about)]
    Decode(DecodeCommand),
}

#[derive(Debug, Args, Clone)]
#[command(version, about)]
pub struct SimulateCommand {
    /// Installation setup file, in RON. Defaults apply without one
    #[arg(short = 's', long = "setup")]
    pub setup: Option<String>,

    /// Number of clients to connect
    #[arg(short = 'n', long = "clients", default_value_t = 3)]
    pub clients: u32,

    /// Length of the session, in seconds
    #[arg(short = 'd', long = "duration", default_value_t = 30.0)]
    pub duration: f64,

    /// Filename for client 0's binaural output to be written to
    #[arg(short = 'o', long = "out", default_value = "swarm.wav")]
    pub outfile: String,

    /// Frames rendered per tick
    #[arg(short = 'b', long = "block", default_value_t = 512)]
    pub block: usize,

    /// Loop length of the synthesized sounds, when the setup names none
    #[arg(short = 'l', long = "loop", default_value_t = 4.0)]
    pub loop_length: f64,

    /// Client whose touch surface steers its own spatial source
    #[arg(long = "soloist")]
    pub soloist: Option<u32>,

    /// Sensor feed file replacing client 0's synthetic script
    #[arg(short = 'f', long = "feed")]
    pub feed: Option<String>,

    /// Pace the simulation in real time
    #[arg(short = 'r', long = "realtime")]
    pub realtime: bool,
}

#[derive(Debug, Args, Clone)]
#[command(version, about)]
pub struct DecodeCommand {
    /// Sensor feed file to read
    #[arg(short = 'f', long = "feed")]
    pub feed: String,
}
