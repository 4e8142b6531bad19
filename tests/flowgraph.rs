use futuresdr::anyhow::Result;
use futuresdr::blocks::{MessagePipe, VectorSink, VectorSinkBuilder, VectorSource};
use futuresdr::futures::channel::mpsc;
use futuresdr::macros::connect;
use futuresdr::num_complex::Complex32;
use futuresdr::runtime::buffer::circular::Circular;
use futuresdr::runtime::{Flowgraph, Pmt, Runtime};

use lora_detector::{ChirpTable, LoraDetector, DEMOD_HISTORY};

const SF: u8 = 7;
const BW: u32 = 125_000;

/// History lead-in, eight preamble upchirps, the two SFD downchirps and a
/// quiet tail, as a `FileSink`-style sample vector.
fn clean_frame() -> (Vec<Complex32>, usize, usize) {
    let table = ChirpTable::new(SF, BW, 2 * BW);
    let sn = table.samples_per_symbol();
    let lead = (DEMOD_HISTORY - 1) * sn;
    let mut samples = vec![Complex32::new(0.0, 0.0); lead];
    for _ in 0..8 {
        samples.extend_from_slice(table.upchirp());
    }
    for _ in 0..2 {
        samples.extend_from_slice(table.downchirp());
    }
    samples.extend(std::iter::repeat(Complex32::new(0.0, 0.0)).take(4 * sn));
    (samples, lead, sn)
}

#[test]
fn detects_one_frame_in_a_flowgraph() -> Result<()> {
    let (samples, lead, sn) = clean_frame();
    let frame_len = DEMOD_HISTORY * sn;
    let expected = samples[lead..lead + frame_len].to_vec();

    let mut fg = Flowgraph::new();
    let src = VectorSource::<Complex32>::new(samples);
    let detector = LoraDetector::new(0.5, SF, BW, 1);
    let snk = VectorSinkBuilder::<Complex32>::new().build();
    let (tx, mut rx) = mpsc::channel(10);
    let pipe = MessagePipe::new(tx);
    connect!(fg,
        src [Circular::with_size(1 << 20)] detector [Circular::with_size(1 << 20)] snk;
        detector.detected | pipe;
    );

    let fg = Runtime::new().run(fg)?;

    let mut detections = 0;
    while let Ok(Some(p)) = rx.try_next() {
        assert!(matches!(p, Pmt::Bool(true)));
        detections += 1;
    }
    assert_eq!(detections, 1);

    // frames and messages are one-for-one, and the frame window starts at
    // the first preamble sample
    let emitted = fg.kernel::<VectorSink<Complex32>>(snk).unwrap().items();
    assert_eq!(emitted.len(), frame_len);
    assert_eq!(emitted[..], expected[..]);
    Ok(())
}

#[test]
fn quiet_input_stays_silent() -> Result<()> {
    let sn = 2 * (1_usize << SF);
    let samples = vec![Complex32::new(0.0, 0.0); 30 * sn];

    let mut fg = Flowgraph::new();
    let src = VectorSource::<Complex32>::new(samples);
    let detector = LoraDetector::new(0.5, SF, BW, 1);
    let snk = VectorSinkBuilder::<Complex32>::new().build();
    let (tx, mut rx) = mpsc::channel(10);
    let pipe = MessagePipe::new(tx);
    connect!(fg,
        src [Circular::with_size(1 << 20)] detector [Circular::with_size(1 << 20)] snk;
        detector.detected | pipe;
    );

    let fg = Runtime::new().run(fg)?;

    let mut detections = 0;
    while let Ok(Some(_)) = rx.try_next() {
        detections += 1;
    }
    assert_eq!(detections, 0);
    let emitted = fg.kernel::<VectorSink<Complex32>>(snk).unwrap().items();
    assert!(emitted.is_empty());
    Ok(())
}
