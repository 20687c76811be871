//! Spherical-harmonic building blocks for the spatial field: encoder gains,
//! a scene rotator and a binaural decoder.
//!
//! Conventions throughout:
//! - ACN channel ordering with SN3D normalization, orders 1 through 3.
//! - Azimuth in degrees, counter-clockwise positive (90 is left), elevation
//!   in degrees, positive up.
//! - Cartesian directions have x to the front, y to the left and z up.

use crate::hound_helpers::{read_wav, AudioFileError, ChannelData};
use log::{info, warn};
use std::borrow::Cow;
use std::f64::consts::PI;
use std::fmt;
use std::path::Path;

/// Ambisonic order supported by the field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AmbisonicOrder {
    /// 4 channels.
    First = 1,
    /// 9 channels.
    Second = 2,
    /// 16 channels.
    Third = 3,
}

impl AmbisonicOrder {
    /// Parses an order number.
    pub fn from_u8(order: u8) -> Option<Self> {
        match order {
            1 => Some(Self::First),
            2 => Some(Self::Second),
            3 => Some(Self::Third),
            _ => None,
        }
    }

    /// The order number N.
    pub fn order(&self) -> usize {
        *self as usize
    }

    /// Number of spherical-harmonic channels, (N+1)^2.
    pub fn channel_count(&self) -> usize {
        let n = self.order() + 1;
        n * n
    }
}

/// Degree `l` and index `m` of ACN channel `acn`.
pub fn degree_of(acn: usize) -> (usize, i32) {
    let l = (acn as f64).sqrt().floor() as usize;
    let m = acn as i32 - (l * l + l) as i32;
    (l, m)
}

/// Wraps an angle in degrees into (-180, 180].
pub fn wrap_degrees(angle: f64) -> f64 {
    let wrapped = (angle + 180.0).rem_euclid(360.0) - 180.0;
    if wrapped == -180.0 {
        180.0
    } else {
        wrapped
    }
}

/// Unit vector for a direction in degrees.
pub fn direction(azimuth: f64, elevation: f64) -> [f64; 3] {
    let (az, el) = (azimuth.to_radians(), elevation.to_radians());
    [el.cos() * az.cos(), el.cos() * az.sin(), el.sin()]
}

/// Azimuth and elevation in degrees of a (not necessarily unit) vector.
pub fn angles(v: [f64; 3]) -> (f64, f64) {
    let [x, y, z] = v;
    let horizontal = x.hypot(y);
    (y.atan2(x).to_degrees(), z.atan2(horizontal).to_degrees())
}

/// Real SN3D spherical harmonics of `v`, a unit vector, in ACN order.
fn harmonics(order: AmbisonicOrder, v: [f64; 3]) -> Vec<f64> {
    let [x, y, z] = v;
    let mut sh = Vec::with_capacity(order.channel_count());
    sh.push(1.0);

    sh.extend([y, z, x]);

    if order.order() >= 2 {
        let s3 = 3f64.sqrt();
        sh.extend([
            s3 * x * y,
            s3 * y * z,
            0.5 * (3.0 * z * z - 1.0),
            s3 * x * z,
            0.5 * s3 * (x * x - y * y),
        ]);
    }

    if order.order() >= 3 {
        let c3 = (5.0f64 / 8.0).sqrt();
        let c2 = 15f64.sqrt();
        let c1 = (3.0f64 / 8.0).sqrt();
        sh.extend([
            c3 * y * (3.0 * x * x - y * y),
            c2 * x * y * z,
            c1 * y * (5.0 * z * z - 1.0),
            0.5 * z * (5.0 * z * z - 3.0),
            c1 * x * (5.0 * z * z - 1.0),
            0.5 * c2 * z * (x * x - y * y),
            c3 * x * (x * x - 3.0 * y * y),
        ]);
    }
    sh
}

/// Encoder gains for a point source at `azimuth`, `elevation` (degrees).
pub fn sh_coefficients(order: AmbisonicOrder, azimuth: f64, elevation: f64) -> Vec<f32> {
    harmonics(order, direction(azimuth, elevation))
        .into_iter()
        .map(|c| c as f32)
        .collect()
}

/// Turns a mono source into an ambisonic field for one direction.
#[derive(Debug, Clone, PartialEq)]
pub struct Encoder {
    order: AmbisonicOrder,
    azimuth: f64,
    elevation: f64,
    gains: Vec<f32>,
}

impl Encoder {
    /// An encoder pointing straight ahead.
    pub fn new(order: AmbisonicOrder) -> Self {
        Self {
            order,
            azimuth: 0.0,
            elevation: 0.0,
            gains: sh_coefficients(order, 0.0, 0.0),
        }
    }

    /// Points the encoder and recomputes its gains.
    pub fn set_direction(&mut self, azimuth: f64, elevation: f64) {
        self.azimuth = azimuth;
        self.elevation = elevation;
        self.gains = sh_coefficients(self.order, azimuth, elevation);
    }

    /// Current azimuth in degrees.
    pub fn azimuth(&self) -> f64 {
        self.azimuth
    }

    /// Current elevation in degrees.
    pub fn elevation(&self) -> f64 {
        self.elevation
    }

    /// Per-channel gains.
    pub fn gains(&self) -> &[f32] {
        &self.gains
    }

    /// Adds `signal` into every channel of `field`, weighted by the gains.
    pub fn encode_into(&self, signal: &[f32], field: &mut [Vec<f32>]) {
        for (channel, gain) in field.iter_mut().zip(&self.gains) {
            for (out, s) in channel.iter_mut().zip(signal) {
                *out += gain * s;
            }
        }
    }
}

fn mat_vec(m: &[[f64; 3]; 3], v: [f64; 3]) -> [f64; 3] {
    [
        m[0][0] * v[0] + m[0][1] * v[1] + m[0][2] * v[2],
        m[1][0] * v[0] + m[1][1] * v[1] + m[1][2] * v[2],
        m[2][0] * v[0] + m[2][1] * v[1] + m[2][2] * v[2],
    ]
}

fn mat_mul(a: &[[f64; 3]; 3], b: &[[f64; 3]; 3]) -> [[f64; 3]; 3] {
    let mut out = [[0.0; 3]; 3];
    for (i, row) in out.iter_mut().enumerate() {
        for (j, cell) in row.iter_mut().enumerate() {
            *cell = (0..3).map(|k| a[i][k] * b[k][j]).sum();
        }
    }
    out
}

/// The rotation that undoes a listener looking towards `yaw` and `pitch`
/// (degrees): whatever lies in the aim direction ends up straight ahead.
fn compensation(yaw: f64, pitch: f64) -> [[f64; 3]; 3] {
    let (sy, cy) = (-yaw).to_radians().sin_cos();
    let (sp, cp) = pitch.to_radians().sin_cos();
    let rz = [[cy, -sy, 0.0], [sy, cy, 0.0], [0.0, 0.0, 1.0]];
    let ry = [[cp, 0.0, sp], [0.0, 1.0, 0.0], [-sp, 0.0, cp]];
    mat_mul(&ry, &rz)
}

// 4-point Gauss-Legendre in z, uniform in azimuth: exact for the degree-6
// products the rotation integrals need
const GAUSS_NODES: [f64; 4] = [
    -0.8611363115940526,
    -0.3399810435848563,
    0.3399810435848563,
    0.8611363115940526,
];
const GAUSS_WEIGHTS: [f64; 4] = [
    0.3478548451374538,
    0.6521451548625461,
    0.6521451548625461,
    0.3478548451374538,
];
const AZIMUTH_POINTS: usize = 16;

/// Rotates a whole ambisonic field to compensate the listener's aim.
///
/// The matrix is found by projecting rotated harmonics back onto the
/// unrotated ones with an exact spherical quadrature, so every degree is
/// rotated by its own orthogonal block and energy is preserved.
#[derive(Debug, Clone, PartialEq)]
pub struct Rotator {
    order: AmbisonicOrder,
    yaw: f64,
    pitch: f64,
    matrix: Vec<Vec<f32>>,
}

impl Rotator {
    /// A rotator that leaves the field untouched.
    pub fn new(order: AmbisonicOrder) -> Self {
        let mut rotator = Self {
            order,
            yaw: 0.0,
            pitch: 0.0,
            matrix: Vec::new(),
        };
        rotator.update_matrix();
        rotator
    }

    /// Sets the aim to compensate for, in degrees.
    pub fn set_orientation(&mut self, yaw: f64, pitch: f64) {
        self.yaw = yaw;
        self.pitch = pitch;
        self.update_matrix();
    }

    /// Compensated yaw.
    pub fn yaw(&self) -> f64 {
        self.yaw
    }

    /// Compensated pitch.
    pub fn pitch(&self) -> f64 {
        self.pitch
    }

    /// The channel mixing matrix, `out[i] = sum_j matrix[i][j] * in[j]`.
    pub fn matrix(&self) -> &[Vec<f32>] {
        &self.matrix
    }

    /// Where a source at `azimuth`, `elevation` ends up after rotation.
    pub fn rotate_direction(&self, azimuth: f64, elevation: f64) -> (f64, f64) {
        let rotation = compensation(self.yaw, self.pitch);
        angles(mat_vec(&rotation, direction(azimuth, elevation)))
    }

    /// Rotates `field` in place, one frame at a time.
    pub fn process(&self, field: &mut [Vec<f32>]) {
        let channels = self.order.channel_count().min(field.len());
        let frames = field.iter().take(channels).map(Vec::len).min().unwrap_or(0);
        let mut frame = vec![0.0f32; channels];

        for n in 0..frames {
            for (j, x) in frame.iter_mut().enumerate() {
                *x = field[j][n];
            }
            for (i, row) in self.matrix.iter().take(channels).enumerate() {
                field[i][n] = row.iter().zip(&frame).map(|(m, x)| m * x).sum();
            }
        }
    }

    fn update_matrix(&mut self) {
        let n = self.order.channel_count();
        let rotation = compensation(self.yaw, self.pitch);
        let mut matrix = vec![vec![0.0f64; n]; n];

        for (z, wz) in GAUSS_NODES.iter().zip(GAUSS_WEIGHTS) {
            let r = (1.0 - z * z).sqrt();
            for k in 0..AZIMUTH_POINTS {
                let phi = 2.0 * PI * k as f64 / AZIMUTH_POINTS as f64;
                let point = [r * phi.cos(), r * phi.sin(), *z];
                let weight = wz * 2.0 * PI / AZIMUTH_POINTS as f64;

                let original = harmonics(self.order, point);
                let rotated = harmonics(self.order, mat_vec(&rotation, point));
                for (i, row) in matrix.iter_mut().enumerate() {
                    let (li, _) = degree_of(i);
                    for (j, cell) in row.iter_mut().enumerate() {
                        // rotations never mix degrees
                        if degree_of(j).0 == li {
                            *cell += weight * rotated[i] * original[j];
                        }
                    }
                }
            }
        }

        self.matrix = matrix
            .into_iter()
            .map(|row| {
                row.into_iter()
                    .enumerate()
                    .map(|(j, m)| {
                        let l = degree_of(j).0 as f64;
                        (m * (2.0 * l + 1.0) / (4.0 * PI)) as f32
                    })
                    .collect()
            })
            .collect();
    }
}

/// Errors while setting up a [`BinauralDecoder`].
#[derive(Debug)]
pub enum DecoderError {
    /// The impulse response file has fewer channels than the order needs.
    ChannelCount {
        /// Channels the order needs.
        expected: usize,
        /// Channels the file has.
        found: usize,
    },
    /// The impulse response file could not be read.
    AudioFile(AudioFileError),
}

impl fmt::Display for DecoderError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let msg = match self {
            DecoderError::ChannelCount { expected, found } => Cow::from(format!(
                "decoder filters need {} channels, file has {}",
                expected, found
            )),
            DecoderError::AudioFile(error) => Cow::from(format!("decoder filters: {}", error)),
        };
        write!(f, "{}", msg)
    }
}

impl std::error::Error for DecoderError {}

impl From<AudioFileError> for DecoderError {
    fn from(value: AudioFileError) -> Self {
        Self::AudioFile(value)
    }
}

/// In-phase weight of degree `l` at order `n`.
fn in_phase_weight(l: usize, n: usize) -> f64 {
    let fact = |k: usize| (1..=k).map(|i| i as f64).product::<f64>();
    fact(n) * fact(n + 1) / (fact(n + l + 1) * fact(n - l))
}

/// Decodes an ambisonic field to two ears with one FIR filter per channel.
///
/// The filters describe the left ear. The right ear mirrors it: channels
/// with `m < 0` are odd under a left/right flip and get their filter
/// negated, all others are shared.
#[derive(Debug, Clone)]
pub struct BinauralDecoder {
    order: AmbisonicOrder,
    filters: Vec<Vec<f32>>,
    history: Vec<Vec<f32>>,
}

impl BinauralDecoder {
    /// A decoder with one left-ear impulse response per channel. Filters
    /// beyond the order's channel count are ignored.
    pub fn new(order: AmbisonicOrder, filters: Vec<Vec<f32>>) -> Result<Self, DecoderError> {
        let expected = order.channel_count();
        if filters.len() < expected {
            return Err(DecoderError::ChannelCount {
                expected,
                found: filters.len(),
            });
        }
        let filters: Vec<Vec<f32>> = filters.into_iter().take(expected).collect();
        let len = filters.iter().map(Vec::len).max().unwrap_or(0).max(1);
        let filters = filters
            .into_iter()
            .map(|mut f| {
                f.resize(len, 0.0);
                f
            })
            .collect();

        Ok(Self {
            order,
            filters,
            history: vec![vec![0.0; len - 1]; expected],
        })
    }

    /// A single-tap decoder: two in-phase virtual microphones pointing
    /// left and right. A source hard left reaches only the left ear, one
    /// in front reaches both equally.
    pub fn virtual_microphones(order: AmbisonicOrder) -> Self {
        let n = order.order();
        let left = harmonics(order, [0.0, 1.0, 0.0]);
        let norm: f64 = (0..=n)
            .map(|l| (2 * l + 1) as f64 * in_phase_weight(l, n))
            .sum();
        let filters = left
            .iter()
            .enumerate()
            .map(|(j, y)| {
                let l = degree_of(j).0;
                let tap = (2 * l + 1) as f64 * in_phase_weight(l, n) / norm * y;
                vec![tap as f32]
            })
            .collect();

        Self {
            order,
            filters,
            history: vec![Vec::new(); order.channel_count()],
        }
    }

    /// Builds a decoder from the channels of an impulse response file.
    pub fn from_channel_data(
        order: AmbisonicOrder,
        data: ChannelData,
        sample_rate: u32,
    ) -> Result<Self, DecoderError> {
        if data.sample_rate != sample_rate {
            warn!(
                "BinauralDecoder : filters are at {} Hz, rendering at {} Hz.",
                data.sample_rate, sample_rate
            );
        }
        Self::new(order, data.channels)
    }

    /// Loads the filters from a WAV file with one channel per harmonic.
    pub fn load(
        order: AmbisonicOrder,
        path: impl AsRef<Path>,
        sample_rate: u32,
    ) -> Result<Self, DecoderError> {
        let data = read_wav(path.as_ref())?;
        let decoder = Self::from_channel_data(order, data, sample_rate)?;
        info!(
            "BinauralDecoder : loaded {}-tap filters from {}.",
            decoder.filter_len(),
            path.as_ref().display()
        );
        Ok(decoder)
    }

    /// Taps per filter.
    pub fn filter_len(&self) -> usize {
        self.filters.first().map(Vec::len).unwrap_or(0)
    }

    /// Decodes one block of `field` into left and right samples, carrying
    /// filter state over to the next block.
    pub fn process(&mut self, field: &[Vec<f32>]) -> (Vec<f32>, Vec<f32>) {
        let frames = field.first().map(Vec::len).unwrap_or(0);
        let mut left = vec![0.0f32; frames];
        let mut right = vec![0.0f32; frames];
        let taps = self.filter_len();

        for (j, input) in field.iter().take(self.order.channel_count()).enumerate() {
            let filter = &self.filters[j];
            let history = &mut self.history[j];
            let sign = if degree_of(j).1 < 0 { -1.0 } else { 1.0 };

            let mut extended = Vec::with_capacity(history.len() + frames);
            extended.extend_from_slice(history);
            extended.extend_from_slice(&input[..frames.min(input.len())]);
            extended.resize(history.len() + frames, 0.0);

            for n in 0..frames {
                let newest = n + taps - 1;
                let y: f32 = filter
                    .iter()
                    .enumerate()
                    .map(|(k, h)| h * extended[newest - k])
                    .sum();
                left[n] += y;
                right[n] += sign * y;
            }

            let keep = taps - 1;
            history.clear();
            history.extend_from_slice(&extended[extended.len() - keep..]);
        }
        (left, right)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hound_helpers::write_wav_to;
    use rand::{Rng, SeedableRng};
    use std::fs::File;

    fn close(a: f64, b: f64, eps: f64) -> bool {
        (a - b).abs() < eps
    }

    #[test]
    fn wrapping() {
        assert_eq!(wrap_degrees(190.0), -170.0);
        assert_eq!(wrap_degrees(-180.0), 180.0);
        assert_eq!(wrap_degrees(540.0), 180.0);
        assert_eq!(wrap_degrees(-45.0), -45.0);
    }

    #[test]
    fn acn_degrees() {
        assert_eq!(degree_of(0), (0, 0));
        assert_eq!(degree_of(1), (1, -1));
        assert_eq!(degree_of(3), (1, 1));
        assert_eq!(degree_of(6), (2, 0));
        assert_eq!(degree_of(9), (3, -3));
        assert_eq!(degree_of(15), (3, 3));
    }

    #[test]
    fn coefficients_match_sn3d_angle_forms() {
        let (az, el) = (37.0f64, -21.0f64);
        let sh = sh_coefficients(AmbisonicOrder::Third, az, el);
        let (a, e) = (az.to_radians(), el.to_radians());
        let expected = [
            1.0,
            e.cos() * a.sin(),
            e.sin(),
            e.cos() * a.cos(),
            3f64.sqrt() / 2.0 * e.cos().powi(2) * (2.0 * a).sin(),
            3f64.sqrt() * e.sin() * e.cos() * a.sin(),
            0.5 * (3.0 * e.sin().powi(2) - 1.0),
            3f64.sqrt() * e.sin() * e.cos() * a.cos(),
            3f64.sqrt() / 2.0 * e.cos().powi(2) * (2.0 * a).cos(),
            0.790569 * e.cos().powi(3) * (3.0 * a).sin(),
            1.936492 * e.sin() * e.cos().powi(2) * (2.0 * a).sin(),
            0.612372 * e.cos() * (5.0 * e.sin().powi(2) - 1.0) * a.sin(),
            0.5 * e.sin() * (5.0 * e.sin().powi(2) - 3.0),
            0.612372 * e.cos() * (5.0 * e.sin().powi(2) - 1.0) * a.cos(),
            1.936492 * e.sin() * e.cos().powi(2) * (2.0 * a).cos(),
            0.790569 * e.cos().powi(3) * (3.0 * a).cos(),
        ];
        for (i, (got, want)) in sh.iter().zip(expected).enumerate() {
            assert!(close(*got as f64, want, 1e-5), "acn {i}: {got} vs {want}");
        }
    }

    #[test]
    fn unrotated_matrix_is_identity() {
        let rotator = Rotator::new(AmbisonicOrder::Third);
        for (i, row) in rotator.matrix().iter().enumerate() {
            for (j, m) in row.iter().enumerate() {
                let want = if i == j { 1.0 } else { 0.0 };
                assert!(close(*m as f64, want, 1e-6), "[{i}][{j}] = {m}");
            }
        }
    }

    #[test]
    fn aim_direction_rotates_to_front() {
        let mut rotator = Rotator::new(AmbisonicOrder::Second);
        rotator.set_orientation(60.0, 20.0);
        let (az, el) = rotator.rotate_direction(60.0, 20.0);
        assert!(close(az, 0.0, 1e-9) && close(el, 0.0, 1e-9));

        let (az, _) = rotator.rotate_direction(150.0, 0.0);
        assert!(az > 0.0, "a source left of the aim stays on the left");
    }

    #[test]
    fn matrix_rotates_encoded_sources() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let order = AmbisonicOrder::Third;
        let mut rotator = Rotator::new(order);
        rotator.set_orientation(-112.0, 33.0);

        for _ in 0..10 {
            let az = rng.gen_range(-180.0..180.0);
            let el = rng.gen_range(-80.0..80.0);
            let encoded = sh_coefficients(order, az, el);
            let (raz, rel) = rotator.rotate_direction(az, el);
            let expected = sh_coefficients(order, raz, rel);

            for (i, row) in rotator.matrix().iter().enumerate() {
                let got: f32 = row.iter().zip(&encoded).map(|(m, y)| m * y).sum();
                assert!(close(got as f64, expected[i] as f64, 1e-4));
            }
        }
    }

    #[test]
    fn process_applies_the_matrix() {
        let order = AmbisonicOrder::First;
        let mut rotator = Rotator::new(order);
        rotator.set_orientation(90.0, 0.0);

        // a source hard left, encoded over two frames
        let gains = sh_coefficients(order, 90.0, 0.0);
        let mut field: Vec<Vec<f32>> = gains.iter().map(|g| vec![*g, *g]).collect();
        rotator.process(&mut field);

        let front = sh_coefficients(order, 0.0, 0.0);
        for (channel, want) in field.iter().zip(front) {
            assert!(close(channel[1] as f64, want as f64, 1e-5));
        }
    }

    #[test]
    fn virtual_microphones_localize() {
        for order in [AmbisonicOrder::First, AmbisonicOrder::Third] {
            let mut decoder = BinauralDecoder::virtual_microphones(order);
            let ear = |decoder: &mut BinauralDecoder, az: f64| {
                let field: Vec<Vec<f32>> = sh_coefficients(order, az, 0.0)
                    .into_iter()
                    .map(|g| vec![g])
                    .collect();
                let (l, r) = decoder.process(&field);
                (l[0], r[0])
            };

            let (l, r) = ear(&mut decoder, 90.0);
            assert!(close(l as f64, 1.0, 1e-5) && close(r as f64, 0.0, 1e-5));
            let (l, r) = ear(&mut decoder, -90.0);
            assert!(close(l as f64, 0.0, 1e-5) && close(r as f64, 1.0, 1e-5));
            let (l, r) = ear(&mut decoder, 0.0);
            assert!(close(l as f64, r as f64, 1e-6) && l > 0.0);
        }
    }

    #[test]
    fn fir_state_carries_across_blocks() {
        let order = AmbisonicOrder::First;
        let mut filters = vec![vec![0.0f32; 3]; 4];
        // left ear: a two-sample delay on W, a negated echo on Y
        filters[0] = vec![0.0, 0.0, 1.0];
        filters[1] = vec![0.0, 0.5, 0.0];
        let mut decoder = BinauralDecoder::new(order, filters).unwrap();

        let mut field = vec![vec![0.0f32; 2]; 4];
        field[0] = vec![1.0, 0.0];
        field[1] = vec![1.0, 0.0];
        let (l1, r1) = decoder.process(&field);
        assert_eq!(l1, vec![0.0, 0.5]);
        assert_eq!(r1, vec![0.0, -0.5]);

        let silence = vec![vec![0.0f32; 2]; 4];
        let (l2, r2) = decoder.process(&silence);
        assert_eq!(l2, vec![1.0, 0.0]);
        assert_eq!(r2, vec![1.0, 0.0]);
    }

    #[test]
    fn filters_load_from_wav() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("filters.wav");
        let channels: Vec<Vec<f32>> = (0..9).map(|i| vec![i as f32 / 10.0, 0.0]).collect();
        write_wav_to(File::create(&path).unwrap(), 48000, &channels).unwrap();

        let decoder = BinauralDecoder::load(AmbisonicOrder::Second, &path, 48000).unwrap();
        assert_eq!(decoder.filter_len(), 2);

        let res = BinauralDecoder::load(AmbisonicOrder::Third, &path, 48000);
        assert!(matches!(
            res,
            Err(DecoderError::ChannelCount {
                expected: 16,
                found: 9
            })
        ));
    }
}
