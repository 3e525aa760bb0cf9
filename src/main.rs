//! Aqueduct 演示 / 诊断 CLI
//!
//! 用一个模拟的采集设备把整条链路跑起来：
//! 生产者线程扮演硬件 DMA（写帧 + 发时间戳），
//! 采集会话在回调线程上消费，主线程打印进度统计。

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::{Parser, Subcommand};

use aqueduct::endpoint::backend::SimulatedDeviceFactory;
use aqueduct::session::CallbackResult;
use aqueduct::timing::now_nanos;
use aqueduct::{
    Direction, EndpointConfig, EndpointRegistry, SampleFormat, SharingMode, StreamSession,
};

/// Aqueduct - low-latency audio streaming engine demo
#[derive(Parser)]
#[command(name = "aqueduct")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Simulated device id
    #[arg(short, long, default_value = "0")]
    device: u32,

    /// Request exclusive (MMAP, free-running) access instead of shared
    #[arg(long)]
    exclusive: bool,

    /// Burst size in frames
    #[arg(short, long, default_value = "240")]
    burst: u32,

    /// Ring buffer capacity in frames (rounded up to a power of two)
    #[arg(long, default_value = "4096")]
    capacity_frames: usize,

    /// Device-side sample format: i16, i24, i32, f32
    #[arg(long, default_value = "i16")]
    device_format: String,

    /// Client-side sample format: i16, i24, i32, f32
    #[arg(long, default_value = "f32")]
    client_format: String,

    /// Channel count
    #[arg(long, default_value = "2")]
    channels: u32,

    /// Sample rate in Hz
    #[arg(long, default_value = "48000")]
    sample_rate: u32,

    /// How long to run the simulation, in seconds
    #[arg(long, default_value = "5")]
    duration_secs: u64,

    /// Show verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Show compiled-in engine defaults
    Info,

    /// Run the simulated capture pipeline (default)
    Simulate,
}

fn parse_format(s: &str) -> anyhow::Result<SampleFormat> {
    match s {
        "i16" => Ok(SampleFormat::I16),
        "i24" => Ok(SampleFormat::I24),
        "i32" => Ok(SampleFormat::I32),
        "f32" => Ok(SampleFormat::F32),
        other => anyhow::bail!("unknown sample format: {}", other),
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // 初始化日志
    if cli.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
    } else {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Info)
            .init();
    }

    match cli.command {
        Some(Commands::Info) => show_info(),
        Some(Commands::Simulate) | None => simulate(&cli),
    }
}

fn show_info() -> anyhow::Result<()> {
    println!("aqueduct {}", env!("CARGO_PKG_VERSION"));
    println!("  default burst:        240 frames");
    println!("  default capacity:     4096 frames");
    println!("  clock period clamp:   20 ms");
    println!("  startup poll:         2 ms");
    println!("  conversions:          identity, i16 <-> f32");
    Ok(())
}

fn simulate(cli: &Cli) -> anyhow::Result<()> {
    let device_format = parse_format(&cli.device_format)?;
    let client_format = parse_format(&cli.client_format)?;

    let config = EndpointConfig {
        device_id: cli.device,
        direction: Direction::Input,
        sharing_mode: if cli.exclusive {
            SharingMode::Exclusive
        } else {
            SharingMode::Shared
        },
        sample_format: device_format,
        channel_count: cli.channels,
        sample_rate: cli.sample_rate,
        frames_per_burst: cli.burst,
        capacity_frames: cli.capacity_frames,
    };

    let registry = Arc::new(EndpointRegistry::new(Box::new(SimulatedDeviceFactory::new(
        4,
    ))));
    let mut session = StreamSession::open(Arc::clone(&registry), config, client_format)?;

    // Ctrl-C 请求干净停止
    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let interrupted = Arc::clone(&interrupted);
        ctrlc::set_handler(move || {
            interrupted.store(true, Ordering::SeqCst);
        })?;
    }

    // 生产者线程：扮演硬件侧，按实时节奏写正弦波帧 + 发时间戳
    let producer_running = Arc::new(AtomicBool::new(true));
    let producer = {
        let endpoint = Arc::clone(session.endpoint());
        let running = Arc::clone(&producer_running);
        let burst = cli.burst as usize;
        let channels = cli.channels as usize;
        let sample_rate = cli.sample_rate;
        let free_running = endpoint.is_free_running();

        thread::Builder::new()
            .name("aqueduct-sim-device".to_string())
            .spawn(move || {
                let burst_nanos = burst as u64 * 1_000_000_000 / sample_rate as u64;
                let mut position: i64 = 0;
                let mut phase: f32 = 0.0;
                let step = 2.0 * std::f32::consts::PI * 440.0 / sample_rate as f32;
                let mut frame = vec![0u8; burst * channels * 2];

                log::info!(
                    "Simulated device running: {} frames per {}us burst",
                    burst,
                    burst_nanos / 1000
                );

                while running.load(Ordering::Acquire) {
                    position += burst as i64;

                    if free_running {
                        // 写计数器归会话侧（时钟外推）所有，硬件侧只发时间戳；
                        // 缓冲内容不重要，演示只看帧计数
                        endpoint.publish_timestamp(position, now_nanos());
                    } else {
                        for f in 0..burst {
                            let s = ((phase.sin() * 0.3) * 32767.0) as i16;
                            phase += step;
                            for c in 0..channels {
                                let o = (f * channels + c) * 2;
                                frame[o..o + 2].copy_from_slice(&s.to_le_bytes());
                            }
                        }
                        endpoint.ring().write_frames(&frame);
                    }

                    thread::sleep(Duration::from_nanos(burst_nanos));
                }

                log::info!("Simulated device stopped at position {}", position);
            })?
    };

    // 采集回调：计帧
    let captured = Arc::new(AtomicU64::new(0));
    {
        let captured = Arc::clone(&captured);
        session.start_with_callback(
            Box::new(move |_bytes, frames| {
                captured.fetch_add(frames as u64, Ordering::Relaxed);
                CallbackResult::Continue
            }),
            Some(Box::new(|err| {
                log::error!("Session error callback: {}", err);
            })),
        )?;
    }

    // 主线程：每秒打印一次进度
    let deadline = std::time::Instant::now() + Duration::from_secs(cli.duration_secs);
    while std::time::Instant::now() < deadline && !interrupted.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_secs(1));
        log::info!(
            "progress: captured {} frames, position read/written {}/{}, xruns {}",
            captured.load(Ordering::Relaxed),
            session.frames_read(),
            session.frames_written(),
            session.xrun_count()
        );
    }

    producer_running.store(false, Ordering::Release);
    let _ = producer.join();

    session.stop();
    log::info!(
        "Simulation finished: {} frames captured, {} xruns",
        captured.load(Ordering::Relaxed),
        session.xrun_count()
    );
    session.close();
    registry.shutdown();

    Ok(())
}
