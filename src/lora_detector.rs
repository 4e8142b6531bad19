use std::sync::atomic::{AtomicUsize, Ordering};

use futuresdr::anyhow::{bail, Error, Result};
use futuresdr::log::{debug, info};
use futuresdr::macros::async_trait;
use futuresdr::num_complex::Complex32;
use futuresdr::runtime::Block;
use futuresdr::runtime::BlockMeta;
use futuresdr::runtime::BlockMetaBuilder;
use futuresdr::runtime::Kernel;
use futuresdr::runtime::MessageIo;
use futuresdr::runtime::MessageIoBuilder;
use futuresdr::runtime::Pmt;
use futuresdr::runtime::StreamIo;
use futuresdr::runtime::StreamIoBuilder;
use futuresdr::runtime::WorkIo;

use crate::dechirp::{DechirpDirection, Dechirper};
use crate::peak_history::PeakHistory;
use crate::utilities::{mod_nonneg, my_roundf, volk_32fc_x2_multiply_32fc, MAX_SF, MIN_SF};

/// Number of consecutive consistent upchirp peaks that constitute a preamble.
pub const MIN_PREAMBLE_CHIRPS: usize = 6;
/// Tolerated folded-bin drift between preamble peaks, on either side of the
/// wrap at bin zero.
pub const MAX_DISTANCE: i64 = 10;
/// Upchirps a LoRa transmitter sends ahead of the SFD.
pub const PREAMBLE_CHIRPS: usize = 8;
/// Symbols of contiguous input the detector needs per call: the preamble
/// plus SFD and alignment headroom. The emitted frame has the same length.
pub const DEMOD_HISTORY: usize = PREAMBLE_CHIRPS + 5;

/// SFD confirmation gives up after this many windows without a downchirp.
const SFD_MAX_RECOVERY: u32 = 5;

/// Frames detected by all instances in this process, reported on teardown.
static DETECTED_FRAMES: AtomicUsize = AtomicUsize::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorMethod {
    /// Amplitude threshold over the window. Debug mode, not wired to the
    /// detection message path.
    Amplitude,
    /// Preamble/SFD detection by repeated dechirping.
    Chirp,
    /// Pass the dechirped window through unchanged, for inspection.
    Dechirp,
}

impl TryFrom<i32> for DetectorMethod {
    type Error = Error;

    fn try_from(value: i32) -> Result<Self> {
        match value {
            0 => Ok(DetectorMethod::Amplitude),
            1 => Ok(DetectorMethod::Chirp),
            2 => Ok(DetectorMethod::Dechirp),
            _ => bail!("invalid detector method {}", value),
        }
    }
}

/// Validated detector parameters and the sizes derived from them.
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    pub threshold: f32,
    pub sf: u8,
    pub bw: u32,
    pub method: DetectorMethod,
    /// Chips per symbol, `2^sf`.
    pub sps: usize,
    /// Samples per symbol at the 2x sampling convention, `2 * sps`.
    pub sn: usize,
    /// Sample rate, `2 * bw`.
    pub fs: u32,
    /// Zero-padded transform length, `10 * sn`.
    pub fft_size: usize,
    /// Folded spectrum length, `10 * sps = fft_size / 2`.
    pub bin_size: usize,
}

impl DetectorConfig {
    pub fn new(threshold: f32, sf: u8, bw: u32, method: i32) -> Result<Self> {
        if !(MIN_SF..=MAX_SF).contains(&(sf as usize)) {
            bail!(
                "spreading factor {} out of range [{}, {}]",
                sf,
                MIN_SF,
                MAX_SF
            );
        }
        if bw == 0 {
            bail!("bandwidth must be non-zero");
        }
        let method = DetectorMethod::try_from(method)?;
        let sps = 1_usize << sf;
        let sn = 2 * sps;
        let fs = 2 * bw;
        let fft_size = 10 * sn;
        let bin_size = 10 * sps;
        debug!(
            "lora detector: {} chips, {} samples per symbol, fft size {}, bin size {}",
            sps, sn, fft_size, bin_size
        );
        Ok(DetectorConfig {
            threshold,
            sf,
            bw,
            method,
            sps,
            sn,
            fs,
            fft_size,
            bin_size,
        })
    }

    /// Length of the emitted frame window and of the input history the
    /// detector requires per call.
    pub fn frame_len(&self) -> usize {
        DEMOD_HISTORY * self.sn
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DetectorState {
    Idle,
    Buffering,
    SfdSearch,
    CfoAlign,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StepResult {
    consumed: usize,
    produced: usize,
    detected: bool,
}

impl StepResult {
    fn wait() -> Self {
        StepResult {
            consumed: 0,
            produced: 0,
            detected: false,
        }
    }

    fn consumed(n: usize) -> Self {
        StepResult {
            consumed: n,
            produced: 0,
            detected: false,
        }
    }
}

/// All preamble peaks must sit within `MAX_DISTANCE` folded bins of the
/// newest one, with wrap tolerance on both sides of bin zero.
fn preamble_consistent(history: &PeakHistory, bin_size: i64) -> bool {
    let newest = history.newest() as i64;
    (1..history.len()).all(|i| {
        let d = mod_nonneg(newest - history[i] as i64, bin_size);
        d <= MAX_DISTANCE || d >= bin_size - MAX_DISTANCE
    })
}

/// Fine sample offset of the SFD downchirp peak. Bins above the fold
/// midpoint represent negative offsets. A value outside the representable
/// range clamps to zero and detection continues best-effort.
fn time_offset_from_bin(bin: usize, bin_size: usize) -> i32 {
    let centered = if bin > bin_size / 2 {
        bin as i64 - 1 - bin_size as i64
    } else {
        bin as i64 - 1
    };
    let scaled = centered as f32 / 10.0;
    if !scaled.is_finite() || scaled.abs() >= i32::MAX as f32 {
        return 0;
    }
    my_roundf(scaled)
}

/// Coarse carrier frequency offset from a preamble upchirp peak, in Hz.
fn cfo_from_bin(bin: usize, bin_size: usize, bw: u32) -> f32 {
    let centered = if bin > bin_size / 2 {
        bin as f32 - 1.0 - bin_size as f32
    } else {
        bin as f32 - 1.0
    };
    centered * bw as f32 / bin_size as f32
}

/// Receive-side LoRa front end: recognizes a preamble of upchirps in the
/// sample stream, locates the SFD, aligns on the first data symbol and
/// emits the captured frame window together with a `detected` message.
///
/// The stream input must hold at least [`DEMOD_HISTORY`] symbols of
/// contiguous samples per invocation; the last symbol is the current
/// detection window and the rest is the retrospective history the frame is
/// copied from.
pub struct LoraDetector {
    config: DetectorConfig,
    dechirper: Dechirper,
    history: PeakHistory,
    state: DetectorState,
    sfd_recovery_count: u32,
    /// Offset of the pending frame origin from the input block head, fixed
    /// when the SFD straddle is found.
    frame_offset: usize,
    cfo_estimate: f32,
    last_peak_bin: usize,
    last_peak_mag: f32,
}

impl LoraDetector {
    /// Panics on an invalid configuration; use [`DetectorConfig::new`] for
    /// fallible validation.
    pub fn new(threshold: f32, sf: u8, bw: u32, method: i32) -> Block {
        let config = DetectorConfig::new(threshold, sf, bw, method)
            .expect("invalid lora detector configuration");
        Self::from_config(config)
    }

    pub fn from_config(config: DetectorConfig) -> Block {
        Block::new(
            BlockMetaBuilder::new("LoraDetector").build(),
            StreamIoBuilder::new()
                .add_input::<Complex32>("in")
                .add_output::<Complex32>("out")
                .build(),
            MessageIoBuilder::new().add_output("detected").build(),
            Self::with_config(config),
        )
    }

    fn with_config(config: DetectorConfig) -> LoraDetector {
        let dechirper = Dechirper::new(config.sf, config.bw, config.fs);
        LoraDetector {
            dechirper,
            history: PeakHistory::new(MIN_PREAMBLE_CHIRPS),
            state: DetectorState::Idle,
            sfd_recovery_count: 0,
            frame_offset: 0,
            cfo_estimate: 0.0,
            last_peak_bin: 0,
            last_peak_mag: 0.0,
            config,
        }
    }

    /// One state-machine step over an input block of at least
    /// [`DetectorConfig::frame_len`] samples.
    fn step(&mut self, input: &[Complex32], out: &mut [Complex32]) -> StepResult {
        let sn = self.config.sn;
        let window_start = (DEMOD_HISTORY - 1) * sn;
        let window = &input[window_start..window_start + sn];
        match self.config.method {
            DetectorMethod::Amplitude => self.step_amplitude(window, out),
            DetectorMethod::Dechirp => self.step_dechirp(window, out),
            DetectorMethod::Chirp => self.step_chirp(input, out),
        }
    }

    /// Debug method 0: indicator sample per window, no frame emission.
    fn step_amplitude(&mut self, window: &[Complex32], out: &mut [Complex32]) -> StepResult {
        if out.is_empty() {
            return StepResult::wait();
        }
        let exceeded = window
            .iter()
            .any(|sample| sample.norm() > self.config.threshold);
        out[0] = if exceeded {
            Complex32::new(1.0, 0.0)
        } else {
            Complex32::new(0.0, 0.0)
        };
        StepResult {
            consumed: window.len(),
            produced: 1,
            detected: false,
        }
    }

    /// Diagnostic method 2: forward the dechirped window unchanged.
    fn step_dechirp(&mut self, window: &[Complex32], out: &mut [Complex32]) -> StepResult {
        let sn = self.config.sn;
        if out.len() < sn {
            return StepResult::wait();
        }
        let dechirped = volk_32fc_x2_multiply_32fc(window, self.dechirper.chirps().downchirp());
        out[..sn].copy_from_slice(&dechirped);
        StepResult {
            consumed: sn,
            produced: sn,
            detected: false,
        }
    }

    fn step_chirp(&mut self, input: &[Complex32], out: &mut [Complex32]) -> StepResult {
        let sn = self.config.sn;
        let window_start = (DEMOD_HISTORY - 1) * sn;
        let window = &input[window_start..window_start + sn];
        match self.state {
            DetectorState::Idle => {
                self.history.clear();
                self.sfd_recovery_count = 0;
                self.frame_offset = 0;
                self.state = DetectorState::Buffering;
                StepResult::wait()
            }
            DetectorState::Buffering => {
                let (mag, bin) = self.dechirper.dechirp(window, DechirpDirection::Up);
                self.last_peak_mag = mag;
                self.last_peak_bin = bin;
                self.history.push(bin);
                if !self.history.is_full()
                    || !preamble_consistent(&self.history, self.config.bin_size as i64)
                {
                    return StepResult::consumed(sn);
                }
                debug!(
                    "preamble detected at bin {} (peak magnitude {:.1})",
                    self.last_peak_bin, self.last_peak_mag
                );
                self.sfd_recovery_count = 0;
                self.state = DetectorState::SfdSearch;
                // move the preamble peak to bin zero in the next window
                StepResult::consumed(sn - 2 * self.history.newest() / 10)
            }
            DetectorState::SfdSearch => {
                self.sfd_recovery_count += 1;
                if self.sfd_recovery_count > SFD_MAX_RECOVERY {
                    debug!("no SFD within {} windows, dropping preamble", SFD_MAX_RECOVERY);
                    self.state = DetectorState::Idle;
                    return StepResult::wait();
                }
                let (up_mag, _) = self.dechirper.dechirp(window, DechirpDirection::Up);
                let (down_mag, _) = self.dechirper.dechirp(window, DechirpDirection::Down);
                if up_mag.abs() >= down_mag.abs() {
                    // still in the preamble
                    return StepResult::consumed(sn);
                }
                // The window head sits on the SFD; the preamble began
                // PREAMBLE_CHIRPS symbols earlier. Skipping one and a
                // quarter symbols puts the head on the first data symbol.
                let skip = (1.25 * sn as f32).ceil() as usize;
                self.frame_offset = window_start - PREAMBLE_CHIRPS * sn - skip;
                self.state = DetectorState::CfoAlign;
                StepResult::consumed(skip)
            }
            DetectorState::CfoAlign => self.align_and_emit(input, out),
        }
    }

    /// Estimate the fine time offset and coarse CFO, then emit the frame.
    /// Every quantity here is a pure function of the input block, so when
    /// the block is too short for the emission window the step backs off
    /// and recomputes on the next invocation.
    fn align_and_emit(&mut self, input: &[Complex32], out: &mut [Complex32]) -> StepResult {
        let sn = self.config.sn;
        let bin_size = self.config.bin_size;
        let frame_len = self.config.frame_len();
        if out.len() < frame_len || input.len() < self.frame_offset + frame_len {
            return StepResult::wait();
        }
        let window_start = (DEMOD_HISTORY - 1) * sn;
        let window = &input[window_start..window_start + sn];

        let (_, pkd_idx) = self.dechirper.dechirp(window, DechirpDirection::Down);
        let time_offset = time_offset_from_bin(pkd_idx, bin_size);

        // clean preamble upchirp, four symbols back from the aligned head
        let up_start = (window_start as i64 - 4 * sn as i64 + time_offset as i64) as usize;
        let up_window = &input[up_start..up_start + sn];
        let (_, pku_idx) = self.dechirper.dechirp(up_window, DechirpDirection::Up);
        self.cfo_estimate = cfo_from_bin(pku_idx, bin_size, self.config.bw);

        // an upchirp at the candidate first data symbol means the SFD ran
        // one symbol longer than expected
        let data_start = (window_start as i64 + time_offset as i64) as usize;
        let data_window = &input[data_start..data_start + sn];
        let (up_mag, _) = self.dechirper.dechirp(data_window, DechirpDirection::Up);
        let (down_mag, _) = self.dechirper.dechirp(data_window, DechirpDirection::Down);
        let symbols_to_skip = if up_mag.abs() > down_mag.abs() {
            2.25
        } else {
            1.25
        };
        let consumed = (time_offset as i64 + my_roundf(symbols_to_skip * sn as f32) as i64).max(0);

        out[..frame_len].copy_from_slice(&input[self.frame_offset..self.frame_offset + frame_len]);
        let total = DETECTED_FRAMES.fetch_add(1, Ordering::Relaxed) + 1;
        info!(
            "lora frame detected, cfo estimate {:.1} Hz ({} total)",
            self.cfo_estimate, total
        );
        self.state = DetectorState::Idle;
        StepResult {
            consumed: consumed as usize,
            produced: frame_len,
            detected: true,
        }
    }
}

impl Drop for LoraDetector {
    fn drop(&mut self) {
        info!(
            "lora detector torn down, {} frames detected in this process",
            DETECTED_FRAMES.load(Ordering::Relaxed)
        );
    }
}

#[async_trait]
impl Kernel for LoraDetector {
    async fn work(
        &mut self,
        io: &mut WorkIo,
        sio: &mut StreamIo,
        mio: &mut MessageIo<Self>,
        _meta: &mut BlockMeta,
    ) -> Result<()> {
        let input = sio.input(0).slice::<Complex32>();
        let out = sio.output(0).slice::<Complex32>();
        if input.len() < self.config.frame_len() {
            if sio.input(0).finished() {
                io.finished = true;
            }
            return Ok(());
        }

        let state_before = self.state;
        let res = self.step(input, out);
        if res.detected {
            // publish before reporting produced samples so observers see
            // the event no later than the frame
            mio.output_mut(0).post(Pmt::Bool(true)).await;
        }
        if res.consumed > 0 {
            sio.input(0).consume(res.consumed);
        }
        if res.produced > 0 {
            sio.output(0).produce(res.produced);
        }
        if res.consumed == 0 && res.produced == 0 {
            if self.state != state_before {
                // pure state transition, run again without new input
                io.call_again = true;
            } else if sio.input(0).finished() {
                io.finished = true;
            }
        }
        Ok(())
    }
}
