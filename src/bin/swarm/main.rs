//! Runs a simulated installation, or decodes a recorded sensor feed.

mod session;

use clap::Parser;
use log::{error, info};
use session::Session;
use soundswarm::{
    args::{CommandTask, DecodeCommand, SimulateCommand, SwarmArgs},
    gesture::GestureClassifier,
    hound_writer::StereoWavWriter,
    sensor_decoder::parse_feed,
    setup::InstallationSetup,
};
use std::{
    error::Error,
    fs,
    process,
    time::{Duration, Instant},
};

// Example:
// cargo run --bin swarm -- simulate
//                          --clients  3
//                          --duration 30
//                          --out      swarm.wav
//                          --soloist  2

fn main() {
    env_logger::init();
    let args = SwarmArgs::parse();

    let result = match args.command {
        CommandTask::Simulate(cmd) => simulate(cmd),
        CommandTask::Decode(cmd) => decode(cmd),
    };
    if let Err(e) = result {
        error!("{}", e);
        process::exit(1);
    }
}

fn simulate(cmd: SimulateCommand) -> Result<(), Box<dyn Error>> {
    let setup = match &cmd.setup {
        Some(path) => InstallationSetup::from_path(path)?,
        None => InstallationSetup::default(),
    };
    let sample_rate = setup.sample_rate;
    let mut session = Session::new(setup, &cmd)?;
    let mut writer = StereoWavWriter::create(&cmd.outfile, sample_rate)?;

    let block_time = cmd.block as f64 / sample_rate as f64;
    let blocks = (cmd.duration / block_time).ceil() as usize;
    info!(
        "Simulating {} clients for {:.1}s in {} blocks.",
        cmd.clients, cmd.duration, blocks
    );

    let started = Instant::now();
    for k in 0..blocks {
        let t = k as f64 * block_time;
        let (left, right) = session.step(t)?;
        writer.append(&left, &right)?;

        if cmd.realtime {
            let deadline = started + Duration::from_secs_f64(t + block_time);
            if let Some(wait) = deadline.checked_duration_since(Instant::now()) {
                spin_sleep::sleep(wait);
            }
        }
    }

    writer.finalize()?;
    session.summarize();
    info!("Wrote {} frames to {}.", writer.frames(), cmd.outfile);
    Ok(())
}

fn decode(cmd: DecodeCommand) -> Result<(), Box<dyn Error>> {
    let text = fs::read_to_string(&cmd.feed)?;
    let events = parse_feed(&text)?;

    let mut classifier = GestureClassifier::new();
    let mut found = 0;
    for event in &events {
        if let Some(gesture) = classifier.feed(event) {
            println!("{:>9.3}  {:?}", event.at, gesture);
            found += 1;
        }
    }
    info!("Decoded {} sensor events, {} gestures.", events.len(), found);
    Ok(())
}
