//! Rewind Soak Test
//!
//! Drives the recorder with a synthetic source at a high frame rate and reports
//! ingest throughput, buffer occupancy, persistence drops and CPU usage.
//!
//! Usage:
//!   cargo run --features tempfile --bin soak_test [-- [OPTIONS]]
//!
//! Options:
//!   --duration <secs>     Run time (default: 30s)
//!   --fps <n>             Video frames per second (default: 60)
//!   --frame-kb <n>        Video frame size in KiB (default: 256)
//!   --buffer-mb <n>       Circular buffer size (default: 64)
//!   --verbose             Extra debug output

use std::sync::Arc;
use std::time::{Duration, Instant};

use rewind_lib::devices::{SyntheticSource, SyntheticSourceConfig};
use rewind_lib::{
    Clock, FrameFileSink, PatientContext, Recorder, RecorderConfig, RecorderEvent, SystemClock,
};

const DEFAULT_DURATION_SECS: u64 = 30;

fn arg<T: std::str::FromStr>(args: &[String], name: &str, default: T) -> T {
    args.iter()
        .position(|a| a == name)
        .and_then(|i| args.get(i + 1))
        .and_then(|s| s.parse::<T>().ok())
        .unwrap_or(default)
}

fn main() {
    let args: Vec<String> = std::env::args().collect();

    let verbose = args.iter().any(|a| a == "--verbose");
    let duration_secs = arg(&args, "--duration", DEFAULT_DURATION_SECS);
    let fps = arg(&args, "--fps", 60u32);
    let frame_kb = arg(&args, "--frame-kb", 256usize);
    let buffer_mb = arg(&args, "--buffer-mb", 64u32);

    // Init logging
    let log_level = if verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    let storage = match tempfile::tempdir() {
        Ok(dir) => dir,
        Err(e) => {
            eprintln!("Failed to create scratch directory: {}", e);
            std::process::exit(1);
        }
    };

    println!("\n=== Rewind Soak Test ===\n");
    println!("  Source:   {} fps x {} KiB", fps, frame_kb);
    println!("  Buffer:   {} MiB", buffer_mb);
    println!("  Duration: {}s", duration_secs);
    println!("  Storage:  {}\n", storage.path().display());

    let config = RecorderConfig {
        storage_path: storage.path().to_path_buf(),
        segment_duration_minutes: 1,
        circular_buffer_size_mb: buffer_mb,
        memory_threshold_bytes: (buffer_mb as u64 * 1024 * 1024) * 3 / 4,
        ..Default::default()
    };

    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    let recorder = Recorder::new(Arc::new(FrameFileSink::new()), clock.clone());
    let events = recorder.events();

    let handle = match recorder.start(PatientContext::new("SOAK", "Soak Test"), config) {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("Failed to start recording: {}", e);
            std::process::exit(1);
        }
    };

    let source = match SyntheticSource::start(
        handle,
        clock,
        SyntheticSourceConfig {
            fps,
            frame_bytes: frame_kb * 1024,
            ..Default::default()
        },
    ) {
        Ok(source) => source,
        Err(e) => {
            eprintln!("Failed to start source: {}", e);
            std::process::exit(1);
        }
    };

    let started = Instant::now();
    let mut last_frames = 0u64;
    while started.elapsed() < Duration::from_secs(duration_secs) {
        std::thread::sleep(Duration::from_secs(1));
        let stats = recorder.get_statistics();
        println!(
            "  {:>4}s  {:>6} fps  buffer {:>5.1} MiB  segment {:>2}  queued {:>4}  dropped {:>5}  cpu {:>5.1}%",
            started.elapsed().as_secs(),
            stats.total_frames - last_frames,
            stats.memory_usage_bytes as f64 / (1024.0 * 1024.0),
            stats.current_segment,
            stats.queued_frames,
            stats.persistence_dropped,
            stats.performance_metrics.cpu_usage_percent
        );
        last_frames = stats.total_frames;
    }

    let clip_started = Instant::now();
    match recorder.save_last_minutes(1, "soak", None) {
        Ok(clip) => println!(
            "\n  Clip: {} frames, {} missing, {:?} in {:.2}s",
            clip.frame_count,
            clip.missing_frames,
            clip.coverage,
            clip_started.elapsed().as_secs_f64()
        ),
        Err(e) => println!("\n  Clip failed: {}", e),
    }

    let final_stats = recorder.get_statistics();
    let report = match recorder.stop() {
        Ok(report) => report,
        Err(e) => {
            eprintln!("Failed to stop recording: {}", e);
            std::process::exit(1);
        }
    };
    let source_stats = source.stop();

    let pressure_events = events
        .try_iter()
        .filter(|e| matches!(e, RecorderEvent::MemoryPressureDetected { .. }))
        .count();

    println!("\n=== Results ===\n");
    println!("  Frames produced:     {}", source_stats.video_frames + source_stats.audio_frames);
    println!("  Frames ingested:     {}", report.totals.total_frames);
    println!("  Bytes ingested:      {}", report.totals.total_bytes);
    println!("  Evicted / offloaded: {} / {}", report.totals.frames_evicted, report.totals.frames_offloaded);
    println!("  Persistence drops:   {}", report.totals.persistence_dropped);
    println!("  Write failures:      {}", report.totals.write_failures);
    println!("  Pressure events:     {}", pressure_events);
    println!("  Segments:            {}", report.segments.len());
    println!("  Drain timed out:     {}", report.drain_timed_out);
    println!(
        "  CPU avg / process memory: {:.1}% / {:.1} MiB",
        final_stats.performance_metrics.cpu_usage_avg_percent,
        final_stats.performance_metrics.process_memory_bytes as f64 / (1024.0 * 1024.0)
    );
    println!();
}
