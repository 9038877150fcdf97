use std::path::PathBuf;

use anyhow::Result;
use image::GrayImage;
use tracing::{info, warn};

use slam_core::system::{Sensor, SlamSystem, SystemConfig};

/// Demo run: drive the system with synthetic frames, exercise the mode
/// protocol, save the map, then reload it into a fresh system.
fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let map_path = PathBuf::from(
        std::env::args()
            .nth(1)
            .unwrap_or_else(|| "map.bin".to_string()),
    );

    let mut config = SystemConfig::new(Sensor::Monocular);
    config.keyframe_interval = 5;
    let mut system = SlamSystem::new(config)?;

    for i in 0..120u32 {
        let timestamp = i as f64 / 30.0;
        system.track_monocular(GrayImage::new(64, 48), timestamp);

        // Freeze the map for a stretch, then resume mapping.
        if i == 60 {
            system.activate_localization_mode();
        }
        if i == 90 {
            system.deactivate_localization_mode();
        }
    }

    {
        let map = system.shared_state().map.read();
        info!(
            keyframes = map.num_keyframes(),
            landmarks = map.num_landmarks(),
            "run complete"
        );
    }

    system.save_map(&map_path)?;
    system.shutdown();

    // Reload into a fresh system.
    let reloaded = SlamSystem::new(SystemConfig::new(Sensor::Monocular))?;
    match reloaded.load_map(&map_path)? {
        Some(report) => info!(
            keyframes_inserted = report.keyframes_inserted,
            keyframes_total = report.keyframes_total,
            landmarks_inserted = report.landmarks_inserted,
            "map reloaded"
        ),
        None => warn!("saved map not found on reload"),
    }

    Ok(())
}
