use std::f64::consts::PI;

use log::debug;
use rand::Rng;
use rand_distr::StandardNormal;

const TWO_PI: f64 = 2.0 * PI;

/// Band weights per electrode site: [delta, theta, alpha, beta, gamma].
/// Frontal sites carry more slow activity, occipital sites the strongest alpha.
const SITE_WEIGHTS: [[f64; 5]; 8] = [
    [3.0, 1.5, 0.8, 0.4, 0.1], // Fp1
    [3.0, 1.5, 0.8, 0.4, 0.1], // Fp2
    [2.0, 1.2, 1.5, 0.6, 0.1], // C3
    [2.0, 1.2, 1.5, 0.6, 0.1], // C4
    [1.5, 1.0, 2.5, 0.7, 0.1], // P3
    [1.5, 1.0, 2.5, 0.7, 0.1], // P4
    [1.2, 0.8, 3.0, 0.5, 0.1], // O1
    [1.2, 0.8, 3.0, 0.5, 0.1], // O2
];

/// Center frequencies of the simulated bands, Hz.
const BAND_FREQS: [f64; 5] = [2.5, 6.0, 10.0, 20.0, 40.0];

/// Microvolts per unit of band weight.
const AMPLITUDE_UV: f64 = 10.0;

/// Standard deviation of the broadband noise, in band-weight units.
const NOISE_STD: f64 = 0.1;

/// Generator for EEG-like data: five frequency bands plus mains pickup and
/// Gaussian noise, with per-channel phases so channels are not identical.
#[derive(Debug, Clone)]
pub struct EegGenerator {
    sample_rate: f64,
    weights: Vec<[f64; 5]>,
    band_phase: Vec<[f64; 5]>,
    line_phase: Vec<[f64; 2]>,
    line_amplitude: Vec<f64>,
}

impl EegGenerator {
    pub fn new(sample_rate: f64, num_channels: usize) -> Self {
        let mut rng = rand::thread_rng();
        debug!("Initializing EEG generator: {} channels at {} Hz", num_channels, sample_rate);

        let weights = (0..num_channels).map(|i| SITE_WEIGHTS[i % SITE_WEIGHTS.len()]).collect();
        let band_phase = (0..num_channels)
            .map(|_| std::array::from_fn(|_| rng.gen::<f64>() * TWO_PI))
            .collect();
        let line_phase = (0..num_channels)
            .map(|_| [rng.gen::<f64>() * TWO_PI, rng.gen::<f64>() * TWO_PI])
            .collect();
        // Different channels pick up different amounts of line noise
        let line_amplitude = (0..num_channels).map(|_| rng.gen_range(0.2..0.7)).collect();

        Self {
            sample_rate,
            weights,
            band_phase,
            line_phase,
            line_amplitude,
        }
    }

    pub fn num_channels(&self) -> usize {
        self.weights.len()
    }

    /// Advance every channel by one sample and write the values in microvolts.
    pub fn next_frame(&mut self, out: &mut Vec<f64>) {
        let mut rng = rand::thread_rng();
        out.clear();
        for ch in 0..self.weights.len() {
            let mut signal = 0.0;
            for band in 0..BAND_FREQS.len() {
                let phase = &mut self.band_phase[ch][band];
                *phase = (*phase + TWO_PI * BAND_FREQS[band] / self.sample_rate) % TWO_PI;
                signal += phase.sin() * self.weights[ch][band];
            }

            let line = &mut self.line_phase[ch];
            line[0] = (line[0] + TWO_PI * 50.0 / self.sample_rate) % TWO_PI;
            line[1] = (line[1] + TWO_PI * 60.0 / self.sample_rate) % TWO_PI;
            signal += line[0].sin() * self.line_amplitude[ch] * 0.7;
            signal += line[1].sin() * self.line_amplitude[ch] * 0.3;

            signal += rng.sample::<f64, _>(StandardNormal) * NOISE_STD;
            out.push(signal * AMPLITUDE_UV);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_stay_in_eeg_range() {
        let mut gen = EegGenerator::new(250.0, 8);
        let mut frame = Vec::new();
        for _ in 0..500 {
            gen.next_frame(&mut frame);
            assert_eq!(frame.len(), 8);
            // weights sum to at most 5.8, line noise < 0.7, noise is a few tenths
            assert!(frame.iter().all(|v| v.abs() < 100.0), "{:?}", frame);
        }
    }

    #[test]
    fn channels_are_not_identical() {
        let mut gen = EegGenerator::new(250.0, 2);
        let mut frame = Vec::new();
        gen.next_frame(&mut frame);
        assert_ne!(frame[0], frame[1]);
    }
}
