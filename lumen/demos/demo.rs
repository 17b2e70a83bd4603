//! Minimal end-to-end demo: run either a display ("sink") or a producer
//! ("source") on loopback UDP and watch the handshake and frame cadence in
//! the logs.
//!
//! ```text
//! cargo run --example lumen-demo -- sink --port 9000 --lights 2
//! cargo run --example lumen-demo -- source --port 9000 --lights 2 --frames 50
//! ```

use clap::{Parser, Subcommand};
use lumen::{Sink, SinkState, Source, SourceState};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "lumen-demo", about = "Minimal lumen sink/source demo")]
struct Cli {
    #[command(subcommand)]
    role: Role,
}

#[derive(Subcommand)]
enum Role {
    /// Run a display endpoint, printing each displayed frame as it arrives.
    Sink {
        #[arg(long, default_value_t = 9000)]
        port: u16,
        #[arg(long, default_value_t = 2)]
        lights: u8,
    },
    /// Run a producer streaming a slowly rotating color pattern.
    Source {
        #[arg(long, default_value_t = 9000)]
        port: u16,
        #[arg(long, default_value_t = 2)]
        lights: u8,
        #[arg(long, default_value_t = 20)]
        frame_duration_ms: u8,
        #[arg(long, default_value_t = 100)]
        frames: u32,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    match Cli::parse().role {
        Role::Sink { port, lights } => run_sink(port, lights),
        Role::Source {
            port,
            lights,
            frame_duration_ms,
            frames,
        } => run_source(port, lights, frame_duration_ms, frames),
    }
}

fn run_sink(port: u16, lights: u8) {
    let config = Sink::builder(port, lights).build();
    let mut sink = Sink::new(config).expect("failed to bind sink");
    println!("sink listening on port {port} ({lights} lights)");

    let mut frame = vec![0u8; lights as usize * 3];
    loop {
        sink.tick();
        if sink.state() == SinkState::Lent && sink.get(&mut frame) {
            println!("displaying {frame:?}");
        }
        std::thread::sleep(std::time::Duration::from_millis(5));
    }
}

fn run_source(port: u16, lights: u8, frame_duration_ms: u8, frames: u32) {
    let config = Source::builder("127.0.0.1", port, frame_duration_ms)
        .max_buffered_frames(8)
        .build();
    let mut source = Source::connect(config).expect("failed to bind source");

    match source.state() {
        SourceState::Open => println!("borrowed sink at 127.0.0.1:{port}"),
        other => {
            eprintln!(
                "failed to borrow sink: {:?} ({})",
                other,
                source.error_message().unwrap_or("no message")
            );
            return;
        }
    }

    let frame_byte_size = lights as usize * 3;
    for i in 0..frames {
        let hue = (i % 255) as u8;
        let frame: Vec<u8> = (0..frame_byte_size)
            .map(|j| hue.wrapping_add(j as u8 * 37))
            .collect();
        source.put(&frame);
        source.tick();
        if source.state() != SourceState::Open {
            eprintln!("source left Open state early: {:?}", source.state());
            break;
        }
    }
    println!("sent {frames} frames");
}
