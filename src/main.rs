// Headless recorder: records a synthetic source, saves the last minutes, stops.
//
// Usage: rewind [--config <path>] [--patient <id>] [--seconds <n>] [--save-minutes <m>]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rewind_lib::devices::{SyntheticSource, SyntheticSourceConfig};
use rewind_lib::recording::events::describe;
use rewind_lib::{Clock, FrameFileSink, PatientContext, Recorder, RecorderConfig, SystemClock};

fn arg_value(args: &[String], name: &str) -> Option<String> {
    args.iter()
        .position(|a| a == name)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().collect();
    let config_path = arg_value(&args, "--config")
        .map(PathBuf::from)
        .unwrap_or_else(rewind_lib::config::default_config_path);
    let patient_id = arg_value(&args, "--patient").unwrap_or_else(|| "DEMO".to_string());
    let seconds: u64 = arg_value(&args, "--seconds")
        .map(|s| s.parse())
        .transpose()?
        .unwrap_or(10);
    let save_minutes: u32 = arg_value(&args, "--save-minutes")
        .map(|s| s.parse())
        .transpose()?
        .unwrap_or(1);

    let config = RecorderConfig::load_or_default(&config_path);
    println!("[Rewind] Storage: {}", config.storage_path.display());

    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    let recorder = Recorder::new(Arc::new(FrameFileSink::new()), clock.clone());
    recorder.subscribe(|event| println!("[Rewind] {}", describe(event)));

    let handle = recorder.start(PatientContext::new(patient_id, ""), config)?;
    let source = SyntheticSource::start(handle, clock, SyntheticSourceConfig::default())?;

    std::thread::sleep(Duration::from_secs(seconds));

    match recorder.save_last_minutes(save_minutes, "demo", None) {
        Ok(clip) => println!(
            "[Rewind] Clip: {} ({} frames, {:?})",
            clip.path.display(),
            clip.frame_count,
            clip.coverage
        ),
        Err(e) => eprintln!("[Rewind] Clip failed: {}", e),
    }

    let stats = recorder.get_statistics();
    println!(
        "[Rewind] {} frames, {} bytes buffered, segment {}, CPU {:.1}%",
        stats.total_frames,
        stats.memory_usage_bytes,
        stats.current_segment,
        stats.performance_metrics.cpu_usage_avg_percent
    );

    let report = recorder.stop()?;
    let source_stats = source.stop();
    println!(
        "[Rewind] Stopped: {} segment(s) in {}, {} video frame(s) produced{}",
        report.segments.len(),
        report.session_dir.display(),
        source_stats.video_frames,
        if report.drain_timed_out {
            ", drain timed out"
        } else {
            ""
        }
    );

    Ok(())
}
