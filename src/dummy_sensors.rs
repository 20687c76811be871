//! Synthetic sensor feeds. Stands in for a phone's motion and touch sensors
//! when running a simulated installation.

use crate::clock::VirtualTime;
use crate::gesture::{SensorEvent, SensorReading, TouchPhase};
use rand::prelude::*;
use serde::{Deserialize, Serialize};

/// Standard gravity, what a resting phone reads on its z axis.
pub const GRAVITY: f64 = 9.81;

/// One segment of a scripted performance.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Motion {
    /// Lie flat and still.
    Rest {
        /// Seconds.
        duration: f64,
    },
    /// Rotate flat to a new heading.
    Turn {
        /// Target heading in degrees, [0, 360).
        to: f64,
        /// Seconds.
        duration: f64,
    },
    /// Quick upward swipe.
    SwipeUp,
    /// Quick downward swipe.
    SwipeDown,
    /// A hard shake.
    Shake,
    /// Tilt up past vertical and lay flat again.
    Drop,
    /// Hold a finger on the surface and drag it around the listener.
    Solo {
        /// Starting azimuth in degrees.
        azimuth: f64,
        /// Distance from the centre, in [0, 0.5].
        distance: f64,
        /// Azimuth covered by the drag.
        sweep: f64,
        /// Seconds.
        duration: f64,
    },
}

/// Generates sensor events for a script of [`Motion`]s.
pub struct DummySensors {
    rng: StdRng,
    noise: f64,
    rate: f64,
    heading: f64,
}

impl DummySensors {
    /// `noise` is the jitter amplitude added to every reading, `rate` the
    /// sensor sampling rate in Hz.
    pub fn new(rng: StdRng, noise: f64, rate: f64) -> Self {
        DummySensors {
            rng,
            noise,
            rate,
            heading: 90.0,
        }
    }

    /// Current heading in degrees.
    pub fn heading(&self) -> f64 {
        self.heading
    }

    /// Plays `motions` back to back, starting at `start`.
    pub fn script(&mut self, start: VirtualTime, motions: &[Motion]) -> Vec<SensorEvent> {
        let mut events = Vec::new();
        let mut at = start;
        for motion in motions {
            at = self.perform(*motion, at, &mut events);
        }
        events
    }

    fn perform(&mut self, motion: Motion, at: VirtualTime, out: &mut Vec<SensorEvent>) -> VirtualTime {
        match motion {
            Motion::Rest { duration } => {
                let heading = self.heading;
                self.sweep(at, duration, out, |_| (heading, 0.0))
            }
            Motion::Turn { to, duration } => {
                let from = self.heading;
                let delta = (to - from + 540.0).rem_euclid(360.0) - 180.0;
                self.heading = to.rem_euclid(360.0);
                self.sweep(at, duration, out, |p| (from + delta * p, 0.0))
            }
            Motion::Drop => {
                let heading = self.heading;
                self.sweep(at, 5.0, out, |p| {
                    let tilt = if p < 0.4 {
                        85.0 * p / 0.4
                    } else if p < 0.6 {
                        85.0
                    } else {
                        85.0 * (1.0 - p) / 0.4
                    };
                    (heading, tilt)
                })
            }
            Motion::Shake => {
                let samples = (0.3 * self.rate).ceil() as usize;
                for i in 0..samples {
                    let sign = if i % 2 == 0 { 1.0 } else { -1.0 };
                    let t = at + i as f64 / self.rate;
                    let reading = SensorReading::Acceleration([
                        sign * 30.0 + self.jitter(),
                        sign * 30.0 + self.jitter(),
                        GRAVITY + self.jitter(),
                    ]);
                    out.push(SensorEvent { at: t, reading });
                }
                at + samples as f64 / self.rate
            }
            Motion::SwipeUp => self.swipe(at, 0.85, 0.15, out),
            Motion::SwipeDown => self.swipe(at, 0.15, 0.85, out),
            Motion::Solo {
                azimuth,
                distance,
                sweep,
                duration,
            } => {
                let steps = (duration * self.rate).ceil().max(1.0) as usize;
                for i in 0..=steps {
                    let p = i as f64 / steps as f64;
                    let (x, y) = polar_to_touch(azimuth + sweep * p, distance);
                    let phase = match i {
                        0 => TouchPhase::Start,
                        i if i == steps => TouchPhase::End,
                        _ => TouchPhase::Move,
                    };
                    out.push(SensorEvent {
                        at: at + duration * p,
                        reading: SensorReading::Touch {
                            phase,
                            contact: 0,
                            x,
                            y,
                        },
                    });
                }
                at + duration
            }
        }
    }

    // Flat orientation plus gravity, sampled at `rate`. `pose` maps progress
    // in [0, 1] to (heading, tilt).
    fn sweep<F>(
        &mut self,
        at: VirtualTime,
        duration: f64,
        out: &mut Vec<SensorEvent>,
        pose: F,
    ) -> VirtualTime
    where
        F: Fn(f64) -> (f64, f64),
    {
        let steps = (duration * self.rate).ceil() as usize;
        for i in 0..steps {
            let t = at + i as f64 / self.rate;
            let (heading, tilt) = pose(i as f64 / steps as f64);
            let alpha = (heading + self.jitter()).rem_euclid(360.0);
            out.push(SensorEvent {
                at: t,
                reading: SensorReading::Orientation([alpha, tilt + self.jitter(), self.jitter()]),
            });
            let acceleration = [self.jitter(), self.jitter(), GRAVITY + self.jitter()];
            out.push(SensorEvent {
                at: t,
                reading: SensorReading::Acceleration(acceleration),
            });
        }
        at + steps as f64 / self.rate
    }

    fn swipe(&mut self, at: VirtualTime, y0: f64, y1: f64, out: &mut Vec<SensorEvent>) -> VirtualTime {
        let duration = 0.3;
        let steps = 6;
        for i in 0..=steps {
            let p = i as f64 / steps as f64;
            let phase = match i {
                0 => TouchPhase::Start,
                i if i == steps => TouchPhase::End,
                _ => TouchPhase::Move,
            };
            out.push(SensorEvent {
                at: at + duration * p,
                reading: SensorReading::Touch {
                    phase,
                    contact: 0,
                    x: 0.5 + self.jitter() * 0.01,
                    y: y0 + (y1 - y0) * p,
                },
            });
        }
        at + duration
    }

    fn jitter(&mut self) -> f64 {
        if self.noise > 0.0 {
            self.rng.gen_range(-self.noise..self.noise)
        } else {
            0.0
        }
    }
}

/// Inverse of [`crate::gesture::touch_to_polar`].
pub fn polar_to_touch(azimuth: f64, distance: f64) -> (f64, f64) {
    let a = azimuth.to_radians();
    (0.5 + distance * a.sin(), 0.5 - distance * a.cos())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gesture::{touch_to_polar, Gesture, GestureClassifier};

    fn gestures(motions: &[Motion]) -> Vec<Gesture> {
        let mut sensors = DummySensors::new(StdRng::seed_from_u64(5), 0.3, 20.0);
        let mut classifier = GestureClassifier::new();
        sensors
            .script(0.0, motions)
            .iter()
            .filter_map(|e| classifier.feed(e))
            .collect()
    }

    #[test]
    fn scripted_gestures_are_recognized() {
        assert_eq!(gestures(&[Motion::Rest { duration: 1.0 }]), vec![]);
        assert_eq!(gestures(&[Motion::SwipeUp]), vec![Gesture::SwipeUp]);
        assert_eq!(gestures(&[Motion::SwipeDown]), vec![Gesture::SwipeDown]);
        assert_eq!(
            gestures(&[Motion::Rest { duration: 0.5 }, Motion::Shake]),
            vec![Gesture::Shake]
        );
        assert_eq!(
            gestures(&[
                Motion::Rest { duration: 1.0 },
                Motion::Drop,
                Motion::Rest { duration: 1.0 }
            ]),
            vec![Gesture::Drop]
        );
    }

    #[test]
    fn events_are_in_time_order() {
        let mut sensors = DummySensors::new(StdRng::seed_from_u64(1), 0.3, 20.0);
        let events = sensors.script(
            2.0,
            &[
                Motion::Turn {
                    to: 200.0,
                    duration: 1.0,
                },
                Motion::SwipeUp,
                Motion::Shake,
                Motion::Solo {
                    azimuth: 0.0,
                    distance: 0.3,
                    sweep: 90.0,
                    duration: 1.0,
                },
            ],
        );
        assert_eq!(events[0].at, 2.0);
        assert!(events.windows(2).all(|w| w[0].at <= w[1].at));
        assert_eq!(sensors.heading(), 200.0);
    }

    #[test]
    fn polar_touch_inverts() {
        for (azim, dist) in [(0.0, 0.2), (90.0, 0.4), (-135.0, 0.1)] {
            let (x, y) = polar_to_touch(azim, dist);
            let (a, d) = touch_to_polar(x, y);
            assert!((a - azim).abs() < 1e-9);
            assert!((d - dist).abs() < 1e-9);
        }
    }
}
