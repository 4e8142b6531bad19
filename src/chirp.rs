use std::f64::consts::PI;

use futuresdr::num_complex::Complex32;

use crate::utilities::{volk_32fc_conjugate_32fc, MAX_SF, MIN_SF};

/// Reference up- and downchirp for one symbol period, precomputed once and
/// read-only afterwards. These are the matched filters the detector
/// correlates against.
pub struct ChirpTable {
    upchirp: Vec<Complex32>,
    downchirp: Vec<Complex32>,
}

impl ChirpTable {
    /// Build both templates for the given spreading factor at the 2x
    /// sampling convention (`fs = 2 * bw`, `2^(sf+1)` samples per symbol).
    pub fn new(sf: u8, bw: u32, fs: u32) -> Self {
        assert!(
            (MIN_SF..=MAX_SF).contains(&(sf as usize)),
            "spreading factor {} out of range [{}, {}]",
            sf,
            MIN_SF,
            MAX_SF
        );
        assert!(bw > 0 && fs % bw == 0, "sample rate must be a multiple of the bandwidth");
        let upchirp = build_upchirp(sf, bw, fs);
        let downchirp = volk_32fc_conjugate_32fc(&upchirp);
        ChirpTable { upchirp, downchirp }
    }

    pub fn upchirp(&self) -> &[Complex32] {
        &self.upchirp
    }

    pub fn downchirp(&self) -> &[Complex32] {
        &self.downchirp
    }

    pub fn samples_per_symbol(&self) -> usize {
        self.upchirp.len()
    }
}

/// Closed-form chirp phase `pi / fsr * (i - i^2 / n)`. The quadratic form
/// avoids the drift a running phase accumulator picks up over a symbol.
fn build_upchirp(sf: u8, bw: u32, fs: u32) -> Vec<Complex32> {
    let n = (1_usize << sf) * 2;
    let fsr = (fs / bw) as f64;
    (0..n)
        .map(|i| {
            let i = i as f64;
            let phase = PI / fsr * (i - i * i / n as f64);
            Complex32::new(phase.cos() as f32, phase.sin() as f32)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lengths_follow_spreading_factor() {
        for sf in MIN_SF..=MAX_SF {
            let table = ChirpTable::new(sf as u8, 125_000, 250_000);
            assert_eq!(table.upchirp().len(), 1 << (sf + 1));
            assert_eq!(table.downchirp().len(), 1 << (sf + 1));
            assert_eq!(table.samples_per_symbol(), 1 << (sf + 1));
        }
    }

    #[test]
    fn downchirp_is_conjugate_of_upchirp() {
        let table = ChirpTable::new(7, 125_000, 250_000);
        for (up, down) in table.upchirp().iter().zip(table.downchirp().iter()) {
            assert_eq!(down.re, up.re);
            assert_eq!(down.im, -up.im);
        }
    }

    #[test]
    fn chirps_have_unit_modulus() {
        let table = ChirpTable::new(9, 125_000, 250_000);
        for s in table.upchirp() {
            assert!((s.norm() - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    #[should_panic(expected = "spreading factor")]
    fn rejects_out_of_range_sf() {
        ChirpTable::new(5, 125_000, 250_000);
    }
}
