use std::{f32::consts::PI, fmt, sync::Arc};

use realfft::{num_complex::Complex32, RealFftPlanner, RealToComplex};
use serde::{Deserialize, Serialize};

use crate::{Result, TriggerRigError};

/// Upper edge (exclusive) of the low band in Hz.
pub const LOW_BAND_MAX_HZ: f64 = 200.0;
/// Upper edge (exclusive) of the medium band in Hz.
pub const MEDIUM_BAND_MAX_HZ: f64 = 2000.0;
/// Smoothing applied between consecutive spectra unless configured otherwise.
pub const DEFAULT_SMOOTHING_TIME_CONSTANT: f32 = 0.8;

/// One of the three frequency ranges energy is aggregated into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Band {
    Low,
    Medium,
    High,
}

impl Band {
    /// Processing order used by every pipeline tick.
    pub const ALL: [Band; 3] = [Band::Low, Band::Medium, Band::High];

    pub fn as_str(self) -> &'static str {
        match self {
            Band::Low => "low",
            Band::Medium => "medium",
            Band::High => "high",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "low" => Some(Band::Low),
            "medium" => Some(Band::Medium),
            "high" => Some(Band::High),
            _ => None,
        }
    }

    /// Maps a bin centre frequency onto a band. Negative or non-finite
    /// frequencies belong to no band.
    pub fn for_frequency(hz: f64) -> Option<Self> {
        if !hz.is_finite() || hz < 0.0 {
            None
        } else if hz < LOW_BAND_MAX_HZ {
            Some(Band::Low)
        } else if hz < MEDIUM_BAND_MAX_HZ {
            Some(Band::Medium)
        } else {
            Some(Band::High)
        }
    }
}

impl fmt::Display for Band {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A value per band.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, bound(deserialize = "T: Deserialize<'de> + Default"))]
pub struct PerBand<T> {
    pub low: T,
    pub medium: T,
    pub high: T,
}

impl<T: Copy> PerBand<T> {
    pub fn splat(value: T) -> Self {
        Self {
            low: value,
            medium: value,
            high: value,
        }
    }

    pub fn get(&self, band: Band) -> T {
        match band {
            Band::Low => self.low,
            Band::Medium => self.medium,
            Band::High => self.high,
        }
    }
}

impl<T> PerBand<T> {
    pub fn get_mut(&mut self, band: Band) -> &mut T {
        match band {
            Band::Low => &mut self.low,
            Band::Medium => &mut self.medium,
            Band::High => &mut self.high,
        }
    }
}

/// Per-band levels in `[0, 1]`.
pub type BandLevels = PerBand<f64>;

/// Per-band peak level in dBFS; `-inf` when the band saw no energy.
pub type BandPeaksDb = PerBand<f64>;

/// Result of analysing a single spectrum frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BandAnalysis {
    /// Linear RMS of the bin magnitudes that fell into each band.
    pub rms: PerBand<f64>,
    pub peaks_db: BandPeaksDb,
}

impl Default for BandAnalysis {
    fn default() -> Self {
        Self {
            rms: PerBand::splat(0.0),
            peaks_db: PerBand::splat(f64::NEG_INFINITY),
        }
    }
}

/// Converts one frame of per-bin magnitudes (dB) into per-band RMS energy and
/// peak level. Non-finite bins are skipped.
pub fn analyze_bands(magnitudes_db: &[f32], sample_rate: f64, fft_size: usize) -> BandAnalysis {
    let mut analysis = BandAnalysis::default();
    if fft_size == 0 || !sample_rate.is_finite() || sample_rate <= 0.0 {
        return analysis;
    }

    let mut sum_sq = PerBand::splat(0.0_f64);
    let mut count = PerBand::splat(0_usize);
    let bin_hz = sample_rate / fft_size as f64;

    for (bin, &db) in magnitudes_db.iter().enumerate() {
        if !db.is_finite() {
            continue;
        }
        let Some(band) = Band::for_frequency(bin as f64 * bin_hz) else {
            continue;
        };

        let db = f64::from(db);
        let peak = analysis.peaks_db.get_mut(band);
        if db > *peak {
            *peak = db;
        }

        let lin = 10.0_f64.powf(db / 20.0);
        *sum_sq.get_mut(band) += lin * lin;
        *count.get_mut(band) += 1;
    }

    for band in Band::ALL {
        let n = count.get(band);
        *analysis.rms.get_mut(band) = if n == 0 {
            0.0
        } else {
            (sum_sq.get(band) / n as f64).sqrt()
        };
    }

    analysis
}

/// Turns a window of time-domain samples into a smoothed dB magnitude
/// spectrum with `fft_size / 2` bins.
pub struct SpectrumAnalyser {
    fft_size: usize,
    sample_rate: u32,
    smoothing: f32,
    plan: Arc<dyn RealToComplex<f32>>,
    input: Vec<f32>,
    spectrum: Vec<Complex32>,
    scratch: Vec<Complex32>,
    window: Vec<f32>,
    smoothed: Vec<f32>,
}

impl SpectrumAnalyser {
    pub fn new(sample_rate: u32, fft_size: usize, smoothing: f32) -> Result<Self> {
        if fft_size < 2 || fft_size % 2 != 0 {
            return Err(TriggerRigError::InvalidInput(
                "fft size must be an even number of at least two samples",
            ));
        }
        if sample_rate == 0 {
            return Err(TriggerRigError::InvalidInput("sample rate must be non-zero"));
        }

        let mut planner = RealFftPlanner::<f32>::new();
        let plan = planner.plan_fft_forward(fft_size);
        let smoothing = if smoothing.is_finite() {
            smoothing.clamp(0.0, 1.0)
        } else {
            DEFAULT_SMOOTHING_TIME_CONSTANT
        };

        Ok(Self {
            fft_size,
            sample_rate,
            smoothing,
            input: plan.make_input_vec(),
            spectrum: plan.make_output_vec(),
            scratch: plan.make_scratch_vec(),
            window: (0..fft_size).map(|i| hann_value(i, fft_size)).collect(),
            smoothed: vec![0.0; fft_size / 2],
            plan,
        })
    }

    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Number of bins written by [`SpectrumAnalyser::analyse`].
    pub fn bin_count(&self) -> usize {
        self.fft_size / 2
    }

    /// Forgets the smoothing history.
    pub fn reset(&mut self) {
        self.smoothed.iter_mut().for_each(|value| *value = 0.0);
    }

    /// Analyses the most recent `fft_size` samples of `samples`; shorter input
    /// is zero-padded at the front.
    pub fn analyse(&mut self, samples: &[f32], out_db: &mut Vec<f32>) -> Result<()> {
        let take = samples.len().min(self.fft_size);
        let pad = self.fft_size - take;
        let recent = &samples[samples.len() - take..];

        for (index, slot) in self.input.iter_mut().enumerate() {
            *slot = if index < pad {
                0.0
            } else {
                recent[index - pad] * self.window[index]
            };
        }

        self.plan
            .process_with_scratch(&mut self.input, &mut self.spectrum, &mut self.scratch)?;

        let scale = 1.0 / self.fft_size as f32;
        let tau = self.smoothing;
        out_db.clear();
        out_db.reserve(self.smoothed.len());
        for (smoothed, bin) in self.smoothed.iter_mut().zip(self.spectrum.iter()) {
            let magnitude = bin.norm() * scale;
            *smoothed = tau * *smoothed + (1.0 - tau) * magnitude;
            out_db.push(if *smoothed > 0.0 {
                20.0 * smoothed.log10()
            } else {
                f32::NEG_INFINITY
            });
        }

        Ok(())
    }
}

impl fmt::Debug for SpectrumAnalyser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpectrumAnalyser")
            .field("fft_size", &self.fft_size)
            .field("sample_rate", &self.sample_rate)
            .field("smoothing", &self.smoothing)
            .finish()
    }
}

fn hann_value(index: usize, len: usize) -> f32 {
    if len <= 1 {
        return 1.0;
    }

    0.5 - 0.5 * ((2.0 * PI * index as f32) / (len as f32 - 1.0)).cos()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_frequencies_to_bands() {
        assert_eq!(Band::for_frequency(0.0), Some(Band::Low));
        assert_eq!(Band::for_frequency(199.9), Some(Band::Low));
        assert_eq!(Band::for_frequency(200.0), Some(Band::Medium));
        assert_eq!(Band::for_frequency(1999.0), Some(Band::Medium));
        assert_eq!(Band::for_frequency(2000.0), Some(Band::High));
        assert_eq!(Band::for_frequency(f64::NAN), None);
        assert_eq!(Band::for_frequency(-1.0), None);
    }

    #[test]
    fn empty_spectrum_has_no_energy() {
        let analysis = analyze_bands(&[], 48_000.0, 1024);
        assert_eq!(analysis.rms, PerBand::splat(0.0));
        assert_eq!(analysis.peaks_db.low, f64::NEG_INFINITY);

        let silent = vec![f32::NEG_INFINITY; 512];
        let analysis = analyze_bands(&silent, 48_000.0, 1024);
        assert_eq!(analysis.rms, PerBand::splat(0.0));
        assert_eq!(analysis.peaks_db.high, f64::NEG_INFINITY);
    }

    #[test]
    fn aggregates_rms_and_peak_per_band() {
        // 1000 Hz sample rate, 10-point fft: 100 Hz per bin.
        // bins 0,1 -> low; 2..=9 -> medium.
        let mut bins = vec![f32::NEG_INFINITY; 10];
        bins[0] = 0.0; // lin 1.0
        bins[1] = -20.0; // lin 0.1
        bins[4] = -6.0;
        bins[5] = f32::NAN;

        let analysis = analyze_bands(&bins, 1000.0, 10);
        let expected_low = ((1.0 + 0.01) / 2.0_f64).sqrt();
        assert!((analysis.rms.low - expected_low).abs() < 1e-9);
        assert_eq!(analysis.peaks_db.low, 0.0);
        assert_eq!(analysis.peaks_db.medium, -6.0);
        assert!((analysis.rms.medium - 10.0_f64.powf(-6.0 / 20.0)).abs() < 1e-9);
        assert_eq!(analysis.rms.high, 0.0);
    }

    #[test]
    fn analyser_rejects_invalid_sizes() {
        assert!(SpectrumAnalyser::new(48_000, 0, 0.8).is_err());
        assert!(SpectrumAnalyser::new(48_000, 31, 0.8).is_err());
        assert!(SpectrumAnalyser::new(0, 64, 0.8).is_err());
    }

    #[test]
    fn analyser_produces_half_spectrum_in_db() {
        let mut analyser = SpectrumAnalyser::new(1024, 256, 0.0).unwrap();
        let tone: Vec<f32> = (0..256)
            .map(|i| (2.0 * PI * 64.0 * i as f32 / 1024.0).sin())
            .collect();
        let mut out = Vec::new();
        analyser.analyse(&tone, &mut out).unwrap();

        assert_eq!(out.len(), 128);
        let (peak_bin, _) = out
            .iter()
            .enumerate()
            .fold((0, f32::NEG_INFINITY), |best, (i, &db)| {
                if db > best.1 {
                    (i, db)
                } else {
                    best
                }
            });
        // 64 Hz with 4 Hz bins.
        assert_eq!(peak_bin, 16);
    }

    #[test]
    fn silence_yields_negative_infinity() {
        let mut analyser = SpectrumAnalyser::new(48_000, 64, 0.5).unwrap();
        let mut out = Vec::new();
        analyser.analyse(&[], &mut out).unwrap();
        assert!(out.iter().all(|db| *db == f32::NEG_INFINITY));
    }
}
