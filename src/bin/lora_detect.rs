use clap::Parser;
use futuresdr::anyhow::Result;
use futuresdr::blocks::{FileSource, MessagePipe, NullSink};
use futuresdr::futures::channel::mpsc;
use futuresdr::macros::connect;
use futuresdr::num_complex::Complex32;
use futuresdr::runtime::buffer::circular::Circular;
use futuresdr::runtime::{Flowgraph, Pmt, Runtime};

use lora_detector::LoraDetector;

#[derive(Parser, Debug)]
#[clap(version)]
struct Args {
    /// input file path dumped with a FileSink::<Complex32> block
    #[clap(long)]
    input_file: String,
    /// LoRa Spreading Factor
    #[clap(long, default_value_t = 7)]
    spreading_factor: u8,
    /// LoRa Bandwidth
    #[clap(long, default_value_t = 125000)]
    bandwidth: u32,
    /// Amplitude threshold (method 0 only)
    #[clap(long, default_value_t = 0.5)]
    threshold: f32,
    /// Detector method: 0 amplitude, 1 chirp, 2 dechirped passthrough
    #[clap(long, default_value_t = 1)]
    method: i32,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let rt = Runtime::new();
    let mut fg = Flowgraph::new();

    let src = FileSource::<Complex32>::new(args.input_file, false);
    let detector = LoraDetector::new(
        args.threshold,
        args.spreading_factor,
        args.bandwidth,
        args.method,
    );
    let snk = NullSink::<Complex32>::new();
    let (tx, mut rx) = mpsc::channel(64);
    let pipe = MessagePipe::new(tx);

    connect!(fg,
        src [Circular::with_size(1 << 21)] detector [Circular::with_size(1 << 21)] snk;
        detector.detected | pipe;
    );

    let _ = rt.run(fg)?;

    let mut frames = 0_usize;
    while let Ok(Some(Pmt::Bool(true))) = rx.try_next() {
        frames += 1;
    }
    println!("Detected LoRa frames: {}", frames);

    Ok(())
}
