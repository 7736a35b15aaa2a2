use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::{interval, Duration, Instant};

use road_anomaly::sim::{DriveProfile, SimulatedLocation, SimulatedResources, SimulatedSensors};
use road_anomaly::sources::BatteryStatus;
use road_anomaly::storage::EventExport;
use road_anomaly::{
    EventQuery, EventRepository, MemoryEventStore, MonitorConfig, MonitorDeps, MonitorPhase, MonitoringService,
    PipelineTuning,
};

#[derive(Parser, Debug)]
#[command(name = "road_anomaly")]
#[command(about = "Road anomaly monitor running against simulated sensors", long_about = None)]
struct Args {
    /// Duration in seconds (0 = until Ctrl-C)
    #[arg(value_name = "SECONDS", default_value = "60")]
    duration: u64,

    /// JSON config file; defaults are used for missing fields
    #[arg(long)]
    config: Option<PathBuf>,

    /// Output directory for live status and the event export
    #[arg(long, default_value = "road_anomaly_sessions")]
    output_dir: PathBuf,

    /// Seconds between simulated potholes (0 = smooth road)
    #[arg(long, default_value = "7")]
    bump_interval: u64,

    /// Simulated vehicle speed in km/h
    #[arg(long, default_value = "40")]
    speed: f32,

    /// Simulated battery level in percent
    #[arg(long, default_value = "80")]
    battery: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => MonitorConfig::from_json_file(path).with_context(|| format!("loading {}", path.display()))?,
        None => MonitorConfig::default(),
    };
    std::fs::create_dir_all(&args.output_dir)
        .with_context(|| format!("creating {}", args.output_dir.display()))?;

    log::info!("Road anomaly monitor starting");
    log::info!("  Duration: {} s (0 = continuous)", args.duration);
    log::info!("  Output dir: {}", args.output_dir.display());
    log::info!("  Threshold: {} m/s², rates {}/{} Hz", config.accel_threshold_ms2(), config.normal_rate_hz(), config.reduced_rate_hz());

    let bump_interval = (args.bump_interval > 0).then(|| Duration::from_secs(args.bump_interval));
    let sensors = Arc::new(SimulatedSensors::new(DriveProfile::Driving { bump_interval }));
    let location = Arc::new(SimulatedLocation::new(48.1372, 11.5756, args.speed, 6.0));
    let resources = Arc::new(SimulatedResources::new(BatteryStatus { level_percent: args.battery, charging: false }));
    let repository = EventRepository::from_config(Arc::new(MemoryEventStore::new()), &config);

    let service = MonitoringService::new(
        config,
        PipelineTuning::default(),
        MonitorDeps { sensors, location, resources, repository: repository.clone() },
    );
    service.start()?;

    let status_path = args.output_dir.join("live_status.json");
    let started = Instant::now();
    let mut status_ticker = interval(Duration::from_secs(2));
    loop {
        tokio::select! {
            _ = status_ticker.tick() => {
                let status = service.status();
                if let Err(e) = status.save(&status_path) {
                    log::warn!("Failed to write {}: {e}", status_path.display());
                }
                if status.phase == MonitorPhase::Stopped {
                    log::warn!("Monitoring stopped: {}", status.last_error.unwrap_or_default());
                    break;
                }
                if args.duration > 0 && started.elapsed() >= Duration::from_secs(args.duration) {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                log::info!("Interrupted");
                break;
            }
        }
    }

    if service.phase() != MonitorPhase::Stopped {
        service.stop()?;
    }
    let final_status = service.status();
    final_status.save(args.output_dir.join("live_status_final.json"))?;

    let export = repository.export(&EventQuery::default())?;
    let export_path = args.output_dir.join(format!("events_{}.json", chrono::Utc::now().format("%Y%m%d_%H%M%S")));
    export.save(&export_path)?;
    let geojson_path = export_path.with_extension("geojson");
    std::fs::write(&geojson_path, serde_json::to_string_pretty(&export.to_geojson())?)?;

    log::info!(
        "Stored {} events from {} candidates ({} rejected, {} dropped)",
        final_status.events_stored,
        final_status.candidates_detected,
        final_status.events_rejected,
        final_status.events_dropped
    );
    log::info!("Exported to {}", export_path.display());
    print_summary(&export);
    Ok(())
}

fn print_summary(export: &EventExport) {
    let mut by_severity = [0usize; 5];
    for event in &export.events {
        if let Some(slot) = by_severity.get_mut(event.severity.saturating_sub(1) as usize) {
            *slot += 1;
        }
    }
    println!("Severity  Count");
    for (i, count) in by_severity.iter().enumerate() {
        println!("{:>8}  {}", i + 1, count);
    }
}
