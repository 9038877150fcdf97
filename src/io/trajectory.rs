//! Trajectory text export.
//!
//! Thin formatting wrappers over the tracking log and the map's keyframes:
//! - TUM format: `timestamp tx ty tz qx qy qz qw`, one line per frame or per
//!   keyframe
//! - KITTI format: the 3x4 pose matrix row-major, one line per frame
//!
//! Frame poses are stored relative to their reference keyframe; if that
//! keyframe was flagged bad, the export walks up the spanning tree
//! accumulating each bad keyframe's pose-in-parent until it reaches a live
//! ancestor. Frame-granularity exports are normalized so the first keyframe
//! sits at the origin (loop closure may have moved it).

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use tracing::{info, warn};

use crate::geometry::SE3;
use crate::map::WorldMap;
use crate::tracking::{TrajectoryEntry, TrajectoryLog};

/// Resolve the world pose of a logged frame, walking past bad reference
/// keyframes via the spanning tree.
fn resolve_frame_pose(map: &WorldMap, entry: &TrajectoryEntry) -> Option<SE3> {
    let mut acc = entry.pose_in_reference;
    let mut kf = map.keyframe(entry.reference)?;
    while kf.is_bad {
        acc = kf.pose_in_parent.unwrap_or_else(SE3::identity) * acc;
        kf = map.keyframe(kf.parent?)?;
    }
    Some(kf.pose * acc)
}

/// World-from-origin transform putting the first keyframe at the origin.
fn origin_inverse(map: &WorldMap) -> Option<SE3> {
    map.all_keyframes_sorted()
        .first()
        .map(|kf| kf.pose.inverse())
}

/// Export the per-frame trajectory in TUM format.
///
/// Frames logged as lost are skipped.
pub fn save_trajectory_tum(map: &WorldMap, log: &TrajectoryLog, path: &Path) -> std::io::Result<()> {
    let Some(origin_inv) = origin_inverse(map) else {
        warn!("map has no keyframes, nothing to export");
        return Ok(());
    };

    let file = File::create(path)?;
    let mut out = BufWriter::new(file);

    let mut lines = 0usize;
    for entry in &log.entries {
        if entry.lost {
            continue;
        }
        let Some(pose) = resolve_frame_pose(map, entry) else {
            continue;
        };
        let pose = origin_inv * pose;
        let q = &pose.rotation;
        let t = &pose.translation;
        writeln!(
            out,
            "{:.6} {:.9} {:.9} {:.9} {:.9} {:.9} {:.9} {:.9}",
            entry.timestamp, t.x, t.y, t.z, q.i, q.j, q.k, q.w
        )?;
        lines += 1;
    }
    out.flush()?;

    info!(path = %path.display(), frames = lines, "trajectory saved");
    Ok(())
}

/// Export the keyframe trajectory in TUM format, ascending keyframe id.
///
/// Bad keyframes are skipped; poses are written as-is (no origin
/// normalization).
pub fn save_keyframe_trajectory_tum(map: &WorldMap, path: &Path) -> std::io::Result<()> {
    let file = File::create(path)?;
    let mut out = BufWriter::new(file);

    let mut lines = 0usize;
    for kf in map.all_keyframes_sorted() {
        if kf.is_bad {
            continue;
        }
        let q = &kf.pose.rotation;
        let t = &kf.pose.translation;
        writeln!(
            out,
            "{:.6} {:.7} {:.7} {:.7} {:.7} {:.7} {:.7} {:.7}",
            kf.timestamp, t.x, t.y, t.z, q.i, q.j, q.k, q.w
        )?;
        lines += 1;
    }
    out.flush()?;

    info!(path = %path.display(), keyframes = lines, "keyframe trajectory saved");
    Ok(())
}

/// Export the per-frame trajectory in KITTI format: the top three rows of
/// the homogeneous pose, row-major, one line per logged frame.
pub fn save_trajectory_kitti(
    map: &WorldMap,
    log: &TrajectoryLog,
    path: &Path,
) -> std::io::Result<()> {
    let Some(origin_inv) = origin_inverse(map) else {
        warn!("map has no keyframes, nothing to export");
        return Ok(());
    };

    let file = File::create(path)?;
    let mut out = BufWriter::new(file);

    let mut lines = 0usize;
    for entry in &log.entries {
        let Some(pose) = resolve_frame_pose(map, entry) else {
            continue;
        };
        let pose = origin_inv * pose;
        let r = pose.rotation_matrix();
        let t = &pose.translation;
        writeln!(
            out,
            "{:.9} {:.9} {:.9} {:.9} {:.9} {:.9} {:.9} {:.9} {:.9} {:.9} {:.9} {:.9}",
            r[(0, 0)],
            r[(0, 1)],
            r[(0, 2)],
            t.x,
            r[(1, 0)],
            r[(1, 1)],
            r[(1, 2)],
            t.y,
            r[(2, 0)],
            r[(2, 1)],
            r[(2, 2)],
            t.z
        )?;
        lines += 1;
    }
    out.flush()?;

    info!(path = %path.display(), frames = lines, "trajectory saved");
    Ok(())
}
