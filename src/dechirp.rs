use std::f32::consts::PI;
use std::sync::Arc;

use futuresdr::num_complex::Complex32;
use rustfft::{Fft, FftDirection, FftPlanner};

use crate::chirp::ChirpTable;
use crate::utilities::argmax_float;

/// Direction of the symbol being tested. An upchirp is dechirped with the
/// reference downchirp and vice versa.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DechirpDirection {
    Up,
    Down,
}

/// Dechirps one symbol window into a single `(magnitude, bin)` statistic.
///
/// The window is multiplied with the opposite reference chirp, zero-padded
/// by a factor of ten and transformed. Because the input is oversampled by
/// two, every tone aliases into two spectral images; the fold step adds the
/// upper image onto the lower half so the peak search only has to cover
/// `bin_size` bins.
///
/// The FFT plan and all scratch buffers are allocated once here and reused
/// for every call; calls are otherwise independent of each other.
pub struct Dechirper {
    chirps: ChirpTable,
    sn: usize,
    fft_size: usize,
    bin_size: usize,
    fft: Arc<dyn Fft<f32>>,
    fft_buf: Vec<Complex32>,
    fft_scratch: Vec<Complex32>,
    mag: Vec<f32>,
    folded: Vec<f32>,
    rotated: Vec<Complex32>,
}

impl Dechirper {
    pub fn new(sf: u8, bw: u32, fs: u32) -> Self {
        let chirps = ChirpTable::new(sf, bw, fs);
        let sn = chirps.samples_per_symbol();
        let fft_size = 10 * sn;
        let bin_size = fft_size / 2;
        let fft = FftPlanner::new().plan_fft(fft_size, FftDirection::Forward);
        let scratch_len = fft.get_inplace_scratch_len();
        Dechirper {
            chirps,
            sn,
            fft_size,
            bin_size,
            fft,
            fft_buf: vec![Complex32::new(0.0, 0.0); fft_size],
            fft_scratch: vec![Complex32::new(0.0, 0.0); scratch_len],
            mag: vec![0.0; fft_size],
            folded: vec![0.0; bin_size],
            rotated: vec![Complex32::new(0.0, 0.0); bin_size],
        }
    }

    pub fn samples_per_symbol(&self) -> usize {
        self.sn
    }

    pub fn bin_size(&self) -> usize {
        self.bin_size
    }

    pub fn chirps(&self) -> &ChirpTable {
        &self.chirps
    }

    /// Coherent power addition: fold the magnitude spectrum and return the
    /// peak as `(magnitude, bin)` with the bin in `[0, bin_size)`.
    pub fn dechirp(&mut self, window: &[Complex32], direction: DechirpDirection) -> (f32, usize) {
        self.run_fft(window, direction);
        for (m, c) in self.mag.iter_mut().zip(self.fft_buf.iter()) {
            *m = c.norm();
        }
        let tail = self.fft_size - self.bin_size;
        for i in 0..self.bin_size {
            self.folded[i] = self.mag[i] + self.mag[tail + i];
        }
        let peak = argmax_float(&self.folded);
        (self.folded[peak], peak)
    }

    /// Full phase addition: fold the complex spectrum under four trial
    /// rotations of the lower image and keep the strongest peak. More
    /// robust than the magnitude fold at low SNR, at four times the fold
    /// cost.
    pub fn dechirp_fpa(
        &mut self,
        window: &[Complex32],
        direction: DechirpDirection,
    ) -> (f32, usize) {
        self.run_fft(window, direction);
        let tail = self.fft_size - self.bin_size;
        let mut max_val = 0.0_f32;
        let mut peak = 0_usize;
        for i in 0..4 {
            let phase_offset = 2.0 * PI / 4.0 * i as f32;
            let s = Complex32::from_polar(1.0, phase_offset);
            for (r, (low, high)) in self.rotated.iter_mut().zip(
                self.fft_buf[..self.bin_size]
                    .iter()
                    .zip(self.fft_buf[tail..].iter()),
            ) {
                *r = low * s + high;
            }
            for (m, c) in self.folded.iter_mut().zip(self.rotated.iter()) {
                *m = c.norm();
            }
            let idx = argmax_float(&self.folded);
            if self.folded[idx] > max_val {
                max_val = self.folded[idx];
                peak = idx;
            }
        }
        (max_val, peak)
    }

    fn run_fft(&mut self, window: &[Complex32], direction: DechirpDirection) {
        assert_eq!(window.len(), self.sn, "dechirp window must be one symbol");
        let reference = match direction {
            DechirpDirection::Up => self.chirps.downchirp(),
            DechirpDirection::Down => self.chirps.upchirp(),
        };
        for ((slot, sample), chirp) in self.fft_buf.iter_mut().zip(window).zip(reference) {
            *slot = sample * chirp;
        }
        self.fft_buf[self.sn..].fill(Complex32::new(0.0, 0.0));
        self.fft
            .process_with_scratch(&mut self.fft_buf, &mut self.fft_scratch);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dechirper() -> Dechirper {
        Dechirper::new(7, 125_000, 250_000)
    }

    /// The reference upchirp delayed by `k` samples, cyclically.
    fn delayed_upchirp(dechirper: &Dechirper, k: usize) -> Vec<Complex32> {
        let up = dechirper.chirps().upchirp();
        let n = up.len();
        (0..n).map(|i| up[(i + n - k) % n]).collect()
    }

    #[test]
    fn self_dechirp_peaks_at_bin_zero() {
        let mut d = dechirper();
        let window = d.chirps().upchirp().to_vec();
        let (mag, bin) = d.dechirp(&window, DechirpDirection::Up);
        assert_eq!(bin, 0);
        assert!((mag - window.len() as f32).abs() < 0.05);
    }

    #[test]
    fn downchirp_window_peaks_at_bin_zero() {
        let mut d = dechirper();
        let window = d.chirps().downchirp().to_vec();
        let (mag, bin) = d.dechirp(&window, DechirpDirection::Down);
        assert_eq!(bin, 0);
        assert!((mag - window.len() as f32).abs() < 0.05);
    }

    #[test]
    fn delayed_window_moves_the_peak() {
        let mut d = dechirper();
        let bin_size = d.bin_size();
        // A one sample delay moves the dechirped tone by fft_size / sn / 2
        // folded bins, i.e. five bins at the ten-fold zero padding.
        for k in [2_usize, 16, 64] {
            let window = delayed_upchirp(&d, k);
            let (mag, bin) = d.dechirp(&window, DechirpDirection::Up);
            assert_eq!(bin, (5 * k) % bin_size, "delay of {} samples", k);
            assert!((mag - window.len() as f32).abs() < 2.0);
        }
    }

    #[test]
    fn opposite_direction_spreads_the_energy() {
        let mut d = dechirper();
        let window = d.chirps().upchirp().to_vec();
        let (up_mag, _) = d.dechirp(&window, DechirpDirection::Up);
        let (down_mag, _) = d.dechirp(&window, DechirpDirection::Down);
        assert!(up_mag > 4.0 * down_mag);
    }

    #[test]
    fn fpa_matches_cpa_on_the_reference_chirp() {
        let mut d = dechirper();
        let window = d.chirps().upchirp().to_vec();
        let (mag, bin) = d.dechirp_fpa(&window, DechirpDirection::Up);
        assert_eq!(bin, 0);
        assert!((mag - window.len() as f32).abs() < 0.05);
    }

    #[test]
    fn fpa_never_exceeds_the_magnitude_fold() {
        // the complex fold is bounded by the magnitude fold at every bin
        let mut d = dechirper();
        let window = delayed_upchirp(&d, 16);
        let (cpa_mag, _) = d.dechirp(&window, DechirpDirection::Up);
        let (fpa_mag, _) = d.dechirp_fpa(&window, DechirpDirection::Up);
        assert!(fpa_mag <= cpa_mag + 1e-3);
    }
}
