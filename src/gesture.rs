//! Reduces raw touch, orientation and acceleration streams to the discrete
//! gestures the installation reacts to.

use crate::clock::VirtualTime;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

/// Touches slower than this, in seconds, are not swipes.
pub const SWIPE_MAX_DURATION: f64 = 2.0;
/// Normalized vertical travel a swipe needs.
pub const SWIPE_DISTANCE: f64 = 0.4;
/// Orientation samples kept for drop detection.
pub const ORIENTATION_WINDOW: usize = 50;
/// Minimum change, in degrees over the three angles, for a new sample.
pub const ORIENTATION_THROTTLE: f64 = 5.0;
/// A drop takes at least this long, in seconds.
pub const DROP_MIN_SPAN: f64 = 4.0;
/// Tilt, in degrees, still counted as flat.
pub const FLAT_TOLERANCE: f64 = 10.0;
/// Tilt, in degrees, a drop has to pass through.
pub const DROP_PEAK: f64 = 80.0;
/// Minimum L1 change of an acceleration sample.
pub const ACCELERATION_THROTTLE: f64 = 0.1;
/// Acceleration magnitude of a shake.
pub const SHAKE_MAGNITUDE: f64 = 40.0;
/// Seconds between two shakes.
pub const SHAKE_DEBOUNCE: f64 = 0.5;

/// A recognized gesture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Gesture {
    /// Quick upward swipe.
    SwipeUp,
    /// Quick downward swipe.
    SwipeDown,
    /// Hard shake.
    Shake,
    /// Slow flat, tilted, flat motion.
    Drop,
}

/// Phase of a touch contact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TouchPhase {
    /// Finger down.
    Start,
    /// Finger moved.
    Move,
    /// Finger up.
    End,
}

/// One reading from a device's sensors.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SensorReading {
    /// Raw (alpha, beta, gamma) orientation in degrees.
    Orientation([f64; 3]),
    /// Acceleration including gravity.
    Acceleration([f64; 3]),
    /// A touch contact at normalized coordinates in [0, 1].
    Touch {
        /// What the contact did.
        phase: TouchPhase,
        /// Per-finger identity.
        contact: u32,
        /// Horizontal position, 0 is left.
        x: f64,
        /// Vertical position, 0 is top.
        y: f64,
    },
}

/// A timestamped sensor reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorEvent {
    /// When it was read.
    pub at: VirtualTime,
    /// What was read.
    pub reading: SensorReading,
}

/// A sample that made it through a throttle, and the gesture it completed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Accepted<T> {
    /// The (processed) sample.
    pub value: T,
    /// A gesture completed by this sample.
    pub gesture: Option<Gesture>,
}

/// Stabilizes raw (alpha, beta, gamma) into (azimuth, roll, tilt) so that
/// flipping the device over does not flip the readings. Tilt is folded
/// into [-90, 90], 0 meaning flat.
pub fn stabilize_orientation(raw: [f64; 3]) -> [f64; 3] {
    let [alpha, beta, gamma] = raw;
    let flipped = beta.abs() > 90.0;

    let azimuth = match (flipped, alpha < 180.0) {
        (false, _) => alpha,
        (true, true) => alpha + 180.0,
        (true, false) => alpha - 180.0,
    };

    let mut roll = if flipped { 180.0 - gamma } else { -gamma };
    roll = -roll;
    if roll < -180.0 {
        roll += 360.0;
    }

    let tilt = if beta > 90.0 {
        180.0 - beta
    } else if beta < -90.0 {
        -180.0 - beta
    } else {
        beta
    };

    [azimuth, roll, tilt]
}

/// Polar coordinates of a touch on a map centred on the listener: azimuth
/// in degrees (0 is the top of the surface) and distance.
pub fn touch_to_polar(x: f64, y: f64) -> (f64, f64) {
    let (x, y) = (x - 0.5, y - 0.5);
    (x.atan2(-y).to_degrees(), x.hypot(y))
}

#[derive(Debug, Clone, Copy)]
struct TouchSample {
    x: f64,
    y: f64,
    at: VirtualTime,
}

#[derive(Debug, Clone, Copy)]
struct OrientationSample {
    angles: [f64; 3],
    at: VirtualTime,
}

/// Per-device gesture classifier.
#[derive(Debug, Default)]
pub struct GestureClassifier {
    touches: HashMap<u32, Vec<TouchSample>>,
    orientations: VecDeque<OrientationSample>,
    last_acceleration: Option<[f64; 3]>,
    last_shake: Option<VirtualTime>,
}

impl GestureClassifier {
    /// A classifier with no history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a touch event. Swipes are classified when the contact lifts.
    pub fn touch(
        &mut self,
        phase: TouchPhase,
        contact: u32,
        x: f64,
        y: f64,
        at: VirtualTime,
    ) -> Option<Gesture> {
        let sample = TouchSample { x, y, at };
        match phase {
            TouchPhase::Start => {
                self.touches.insert(contact, vec![sample]);
                None
            }
            TouchPhase::Move => {
                self.touches.entry(contact).or_default().push(sample);
                None
            }
            TouchPhase::End => {
                let mut path = self.touches.remove(&contact).unwrap_or_default();
                path.push(sample);
                classify_swipe(&path)
            }
        }
    }

    /// Feeds a raw orientation. Returns the stabilized angles if they moved
    /// far enough from the last accepted ones.
    pub fn orientation(&mut self, raw: [f64; 3], at: VirtualTime) -> Option<Accepted<[f64; 3]>> {
        let angles = stabilize_orientation(raw);
        if let Some(last) = self.orientations.back() {
            let dist = angles
                .iter()
                .zip(last.angles)
                .map(|(a, b)| (a - b).powi(2))
                .sum::<f64>()
                .sqrt();
            if dist < ORIENTATION_THROTTLE {
                return None;
            }
        }

        if self.orientations.len() == ORIENTATION_WINDOW {
            self.orientations.pop_front();
        }
        self.orientations.push_back(OrientationSample { angles, at });

        let gesture = self.detect_drop().then_some(Gesture::Drop);
        if gesture.is_some() {
            self.orientations.clear();
        }
        Some(Accepted {
            value: angles,
            gesture,
        })
    }

    /// Feeds an acceleration. Returns the L1 sum of the sample if it
    /// changed enough to count.
    pub fn acceleration(&mut self, data: [f64; 3], at: VirtualTime) -> Option<Accepted<f64>> {
        if let Some(last) = self.last_acceleration {
            let delta: f64 = data.iter().zip(last).map(|(a, b)| (a - b).abs()).sum();
            if delta < ACCELERATION_THROTTLE {
                return None;
            }
        }
        self.last_acceleration = Some(data);

        let sum: f64 = data.iter().map(|a| a.abs()).sum();
        let magnitude = data.iter().map(|a| a * a).sum::<f64>().sqrt();
        let rested = self.last_shake.map_or(true, |t| at - t > SHAKE_DEBOUNCE);

        let gesture = if magnitude > SHAKE_MAGNITUDE && rested {
            self.last_shake = Some(at);
            Some(Gesture::Shake)
        } else {
            None
        };
        Some(Accepted {
            value: sum,
            gesture,
        })
    }

    /// Feeds any sensor event, keeping only the gesture.
    pub fn feed(&mut self, event: &SensorEvent) -> Option<Gesture> {
        match event.reading {
            SensorReading::Orientation(raw) => self.orientation(raw, event.at)?.gesture,
            SensorReading::Acceleration(data) => self.acceleration(data, event.at)?.gesture,
            SensorReading::Touch {
                phase,
                contact,
                x,
                y,
            } => self.touch(phase, contact, x, y, event.at),
        }
    }

    fn detect_drop(&self) -> bool {
        let (Some(first), Some(last)) = (self.orientations.front(), self.orientations.back())
        else {
            return false;
        };
        if last.at - first.at < DROP_MIN_SPAN {
            return false;
        }
        if first.angles[2].abs() > FLAT_TOLERANCE || last.angles[2].abs() > FLAT_TOLERANCE {
            return false;
        }
        self.orientations
            .iter()
            .any(|s| s.angles[2].abs() > DROP_PEAK)
    }
}

fn classify_swipe(path: &[TouchSample]) -> Option<Gesture> {
    let (first, last) = (path.first()?, path.last()?);
    if last.at - first.at > SWIPE_MAX_DURATION {
        return None;
    }
    let dy = last.y - first.y;
    if dy > SWIPE_DISTANCE {
        Some(Gesture::SwipeDown)
    } else if dy < -SWIPE_DISTANCE {
        Some(Gesture::SwipeUp)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn swipe(classifier: &mut GestureClassifier, contact: u32, y0: f64, y1: f64, dt: f64) -> Option<Gesture> {
        classifier.touch(TouchPhase::Start, contact, 0.5, y0, 0.0);
        classifier.touch(TouchPhase::Move, contact, 0.5, (y0 + y1) / 2.0, dt / 2.0);
        classifier.touch(TouchPhase::End, contact, 0.5, y1, dt)
    }

    #[test]
    fn swipes_by_direction() {
        let mut classifier = GestureClassifier::new();
        assert_eq!(swipe(&mut classifier, 0, 0.9, 0.2, 0.3), Some(Gesture::SwipeUp));
        assert_eq!(swipe(&mut classifier, 0, 0.1, 0.7, 0.3), Some(Gesture::SwipeDown));
        assert_eq!(swipe(&mut classifier, 0, 0.5, 0.6, 0.3), None);
    }

    #[test]
    fn slow_swipes_are_discarded() {
        let mut classifier = GestureClassifier::new();
        assert_eq!(swipe(&mut classifier, 0, 0.9, 0.1, 2.5), None);
    }

    #[test]
    fn contacts_are_tracked_separately() {
        let mut classifier = GestureClassifier::new();
        classifier.touch(TouchPhase::Start, 1, 0.2, 0.9, 0.0);
        classifier.touch(TouchPhase::Start, 2, 0.8, 0.1, 0.0);
        assert_eq!(
            classifier.touch(TouchPhase::End, 2, 0.8, 0.8, 0.2),
            Some(Gesture::SwipeDown)
        );
        assert_eq!(
            classifier.touch(TouchPhase::End, 1, 0.2, 0.3, 0.4),
            Some(Gesture::SwipeUp)
        );
    }

    #[test]
    fn stabilization_unflips() {
        assert_eq!(stabilize_orientation([45.0, 0.0, 0.0]), [45.0, 0.0, 0.0]);
        assert_eq!(stabilize_orientation([30.0, 120.0, 10.0]), [210.0, -170.0, 60.0]);
        assert_eq!(stabilize_orientation([200.0, -100.0, -30.0]), [20.0, 150.0, -80.0]);
    }

    #[test]
    fn touch_polar_mapping() {
        let close = |a: f64, b: f64| (a - b).abs() < 1e-9;
        let (azim, dist) = touch_to_polar(0.5, 0.0);
        assert!(close(azim, 0.0) && close(dist, 0.5));
        let (azim, dist) = touch_to_polar(1.0, 0.5);
        assert!(close(azim, 90.0) && close(dist, 0.5));
        let (azim, _) = touch_to_polar(0.5, 1.0);
        assert!(close(azim.abs(), 180.0));
    }

    #[test]
    fn orientation_is_throttled() {
        let mut classifier = GestureClassifier::new();
        assert!(classifier.orientation([0.0, 0.0, 0.0], 0.0).is_some());
        assert!(classifier.orientation([3.0, 0.0, 3.0], 0.1).is_none());
        assert!(classifier.orientation([0.0, 0.0, 5.0], 0.2).is_some());
    }

    fn tilt_sequence(step_time: f64) -> Vec<Gesture> {
        let mut classifier = GestureClassifier::new();
        let tilts = (0..=17).map(|i| i as f64 * 5.0).chain((0..17).rev().map(|i| i as f64 * 5.0));
        tilts
            .enumerate()
            .filter_map(|(i, beta)| {
                classifier
                    .orientation([0.0, beta, 0.0], i as f64 * step_time)
                    .and_then(|a| a.gesture)
            })
            .collect()
    }

    #[test]
    fn slow_tilt_and_back_is_a_drop() {
        assert_eq!(tilt_sequence(0.15), vec![Gesture::Drop]);
    }

    #[test]
    fn quick_tilt_is_not_a_drop() {
        assert!(tilt_sequence(0.05).is_empty());
    }

    #[test]
    fn drop_needs_to_end_flat() {
        let mut classifier = GestureClassifier::new();
        let mut found = false;
        for i in 0..=17 {
            let beta = i as f64 * 5.0;
            found |= classifier
                .orientation([0.0, beta, 0.0], i as f64 * 0.5)
                .and_then(|a| a.gesture)
                .is_some();
        }
        assert!(!found);
    }

    #[test]
    fn shakes_are_debounced() {
        let mut classifier = GestureClassifier::new();
        let first = classifier.acceleration([0.0, 0.0, 9.8], 0.0).unwrap();
        assert_eq!(first.gesture, None);
        assert!((first.value - 9.8).abs() < 1e-12);
        assert!(classifier.acceleration([0.0, 0.05, 9.8], 0.1).is_none());

        let hard = classifier.acceleration([30.0, 30.0, 10.0], 1.0).unwrap();
        assert_eq!(hard.gesture, Some(Gesture::Shake));
        assert_eq!(hard.value, 70.0);
        let soon = classifier.acceleration([30.0, 30.0, 10.5], 1.2).unwrap();
        assert_eq!(soon.gesture, None);
        let later = classifier.acceleration([31.0, 30.0, 10.0], 1.6).unwrap();
        assert_eq!(later.gesture, Some(Gesture::Shake));
    }

    #[test]
    fn feed_dispatches_readings() {
        let mut classifier = GestureClassifier::new();
        let event = |at, reading| SensorEvent { at, reading };
        assert_eq!(
            classifier.feed(&event(0.0, SensorReading::Acceleration([40.0, 10.0, 0.0]))),
            Some(Gesture::Shake)
        );
        classifier.feed(&event(
            0.0,
            SensorReading::Touch {
                phase: TouchPhase::Start,
                contact: 3,
                x: 0.5,
                y: 0.8,
            },
        ));
        assert_eq!(
            classifier.feed(&event(
                0.1,
                SensorReading::Touch {
                    phase: TouchPhase::End,
                    contact: 3,
                    x: 0.5,
                    y: 0.1,
                },
            )),
            Some(Gesture::SwipeUp)
        );
    }
}
