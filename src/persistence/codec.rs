//! Binary wire format for map entities.
//!
//! The format is a flat little-endian dump with no header or compression,
//! intended for same-architecture reload:
//!
//! ```text
//! u64 keyframe_count, keyframe records (ascending id)
//! u64 landmark_count, landmark records (ascending id)
//! ```
//!
//! Every cross-entity reference (parent, child, observation slot,
//! covisibility neighbor) is written as the entity's u64 id, with
//! [`NONE_ID`] marking an empty reference; the decoder resolves ids against
//! its own tables, so the cyclic keyframe/landmark graph serializes without
//! duplicating entity bodies.
//!
//! Matrix payloads are written as `cols:i32, rows:i32, elem_size:u64,
//! elem_type:u64, raw bytes` and must round-trip byte-exactly. Poses are
//! 7x1 f64 payloads `[qw qx qy qz tx ty tz]`, decoded without quaternion
//! renormalization so a reload re-encodes to identical bytes.

use std::io::{Read, Write};

use nalgebra::Vector3;

use crate::features::{DenseMatrix, KeyPoint, MatDepth};
use crate::geometry::SE3;
use crate::map::{Keyframe, KeyframeId, Landmark, LandmarkId};

use super::error::PersistenceError;

/// Sentinel id marking an empty reference (vacant slot, missing parent).
pub(crate) const NONE_ID: u64 = u64::MAX;

/// Any count above this means a corrupt stream, not a big map.
const MAX_COUNT: u64 = 1 << 32;

pub(crate) struct MapWriter<W: Write> {
    inner: W,
}

impl<W: Write> MapWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }

    fn put_u8(&mut self, v: u8) -> std::io::Result<()> {
        self.inner.write_all(&[v])
    }

    fn put_i32(&mut self, v: i32) -> std::io::Result<()> {
        self.inner.write_all(&v.to_le_bytes())
    }

    fn put_u32(&mut self, v: u32) -> std::io::Result<()> {
        self.inner.write_all(&v.to_le_bytes())
    }

    pub fn put_u64(&mut self, v: u64) -> std::io::Result<()> {
        self.inner.write_all(&v.to_le_bytes())
    }

    fn put_f32(&mut self, v: f32) -> std::io::Result<()> {
        self.inner.write_all(&v.to_le_bytes())
    }

    fn put_f64(&mut self, v: f64) -> std::io::Result<()> {
        self.inner.write_all(&v.to_le_bytes())
    }

    fn put_matrix(&mut self, m: &DenseMatrix) -> std::io::Result<()> {
        self.put_i32(m.cols() as i32)?;
        self.put_i32(m.rows() as i32)?;
        self.put_u64(m.depth().elem_size() as u64)?;
        self.put_u64(m.depth().tag())?;
        self.inner.write_all(m.bytes())
    }

    fn put_keypoint(&mut self, kp: &KeyPoint) -> std::io::Result<()> {
        self.put_f32(kp.angle)?;
        self.put_i32(kp.class_id)?;
        self.put_i32(kp.octave)?;
        self.put_f32(kp.response)?;
        self.put_f32(kp.x)?;
        self.put_f32(kp.y)
    }

    fn put_pose(&mut self, pose: &SE3) -> std::io::Result<()> {
        let q = &pose.rotation;
        let t = &pose.translation;
        let payload = DenseMatrix::from_f64s(7, 1, &[q.w, q.i, q.j, q.k, t.x, t.y, t.z]);
        self.put_matrix(&payload)
    }

    pub fn put_keyframe(&mut self, kf: &Keyframe) -> std::io::Result<()> {
        self.put_u64(kf.id.0)?;
        self.put_f64(kf.timestamp)?;
        self.put_pose(&kf.pose)?;

        match &kf.pose_in_parent {
            Some(pose) => {
                self.put_u8(1)?;
                self.put_pose(pose)?;
            }
            None => self.put_u8(0)?,
        }

        self.put_u64(kf.keypoints.len() as u64)?;
        for kp in &kf.keypoints {
            self.put_keypoint(kp)?;
        }
        self.put_matrix(&kf.descriptors)?;

        self.put_u64(kf.landmark_slots.len() as u64)?;
        for slot in &kf.landmark_slots {
            self.put_u64(slot.map(|id| id.0).unwrap_or(NONE_ID))?;
        }

        self.put_u64(kf.parent.map(|id| id.0).unwrap_or(NONE_ID))?;

        // Sets and maps are written id-ascending so identical maps produce
        // identical bytes.
        let mut children: Vec<u64> = kf.children.iter().map(|id| id.0).collect();
        children.sort_unstable();
        self.put_u64(children.len() as u64)?;
        for child in children {
            self.put_u64(child)?;
        }

        let mut edges: Vec<(u64, u32)> = kf
            .covisibility_weights()
            .iter()
            .map(|(id, w)| (id.0, *w))
            .collect();
        edges.sort_unstable();
        self.put_u64(edges.len() as u64)?;
        for (id, weight) in edges {
            self.put_u64(id)?;
            self.put_u32(weight)?;
        }

        self.put_u8(kf.is_bad as u8)
    }

    pub fn put_landmark(&mut self, lm: &Landmark) -> std::io::Result<()> {
        self.put_u64(lm.id.0)?;

        let p = &lm.position;
        self.put_matrix(&DenseMatrix::from_f64s(3, 1, &[p.x, p.y, p.z]))?;
        self.put_matrix(&lm.descriptor)?;

        let mut observations: Vec<(u64, u64)> = lm
            .observations
            .iter()
            .map(|(kf_id, slot)| (kf_id.0, *slot as u64))
            .collect();
        observations.sort_unstable();
        self.put_u64(observations.len() as u64)?;
        for (kf_id, slot) in observations {
            self.put_u64(kf_id)?;
            self.put_u64(slot)?;
        }

        self.put_u64(lm.first_keyframe.0)?;
        self.put_u8(lm.is_bad as u8)
    }
}

pub(crate) struct MapReader<R: Read> {
    inner: R,
}

impl<R: Read> MapReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    fn get_u8(&mut self) -> Result<u8, PersistenceError> {
        let mut buf = [0u8; 1];
        self.inner.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    fn get_i32(&mut self) -> Result<i32, PersistenceError> {
        let mut buf = [0u8; 4];
        self.inner.read_exact(&mut buf)?;
        Ok(i32::from_le_bytes(buf))
    }

    fn get_u32(&mut self) -> Result<u32, PersistenceError> {
        let mut buf = [0u8; 4];
        self.inner.read_exact(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn get_u64(&mut self) -> Result<u64, PersistenceError> {
        let mut buf = [0u8; 8];
        self.inner.read_exact(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn get_f32(&mut self) -> Result<f32, PersistenceError> {
        let mut buf = [0u8; 4];
        self.inner.read_exact(&mut buf)?;
        Ok(f32::from_le_bytes(buf))
    }

    fn get_f64(&mut self) -> Result<f64, PersistenceError> {
        let mut buf = [0u8; 8];
        self.inner.read_exact(&mut buf)?;
        Ok(f64::from_le_bytes(buf))
    }

    /// A length prefix, sanity-bounded.
    pub fn get_count(&mut self) -> Result<usize, PersistenceError> {
        let count = self.get_u64()?;
        if count > MAX_COUNT {
            return Err(PersistenceError::Corrupt(format!(
                "implausible element count {count}"
            )));
        }
        Ok(count as usize)
    }

    fn get_matrix(&mut self) -> Result<DenseMatrix, PersistenceError> {
        let cols = self.get_i32()?;
        let rows = self.get_i32()?;
        if cols < 0 || rows < 0 {
            return Err(PersistenceError::Corrupt(format!(
                "negative matrix shape {rows}x{cols}"
            )));
        }
        let elem_size = self.get_u64()?;
        let elem_type = self.get_u64()?;
        let depth =
            MatDepth::from_tag(elem_type).ok_or(PersistenceError::UnknownElemType(elem_type))?;
        if elem_size != depth.elem_size() as u64 {
            return Err(PersistenceError::Corrupt(format!(
                "element size {elem_size} does not match type tag {elem_type}"
            )));
        }

        let data_len = (rows as u64)
            .checked_mul(cols as u64)
            .and_then(|n| n.checked_mul(elem_size))
            .filter(|&n| n <= MAX_COUNT)
            .ok_or_else(|| {
                PersistenceError::Corrupt(format!("implausible matrix payload {rows}x{cols}"))
            })?;

        // The payload is exactly rows * cols * elem_size bytes; no padding.
        let mut data = vec![0u8; data_len as usize];
        self.inner.read_exact(&mut data)?;
        DenseMatrix::from_raw(rows as usize, cols as usize, depth, data)
            .ok_or_else(|| PersistenceError::Corrupt("matrix payload length mismatch".into()))
    }

    fn get_keypoint(&mut self) -> Result<KeyPoint, PersistenceError> {
        let angle = self.get_f32()?;
        let class_id = self.get_i32()?;
        let octave = self.get_i32()?;
        let response = self.get_f32()?;
        let x = self.get_f32()?;
        let y = self.get_f32()?;
        Ok(KeyPoint::new(x, y, angle, octave, response, class_id))
    }

    fn get_pose(&mut self) -> Result<SE3, PersistenceError> {
        let payload = self.get_matrix()?;
        let values = payload
            .to_f64_vec()
            .filter(|v| v.len() == 7)
            .ok_or_else(|| PersistenceError::Corrupt("malformed pose payload".into()))?;
        Ok(SE3::from_raw_parts(
            values[0],
            values[1],
            values[2],
            values[3],
            Vector3::new(values[4], values[5], values[6]),
        ))
    }

    fn get_opt_id(&mut self) -> Result<Option<u64>, PersistenceError> {
        let id = self.get_u64()?;
        Ok((id != NONE_ID).then_some(id))
    }

    pub fn get_keyframe(&mut self) -> Result<Keyframe, PersistenceError> {
        let id = self.get_u64()?;
        let timestamp = self.get_f64()?;
        let pose = self.get_pose()?;

        let pose_in_parent = match self.get_u8()? {
            0 => None,
            1 => Some(self.get_pose()?),
            tag => {
                return Err(PersistenceError::Corrupt(format!(
                    "invalid presence byte {tag}"
                )))
            }
        };

        let num_keypoints = self.get_count()?;
        let mut keypoints = Vec::with_capacity(num_keypoints);
        for _ in 0..num_keypoints {
            keypoints.push(self.get_keypoint()?);
        }
        let descriptors = self.get_matrix()?;
        if descriptors.rows() != num_keypoints {
            return Err(PersistenceError::Corrupt(format!(
                "descriptor rows {} do not match keypoint count {num_keypoints}",
                descriptors.rows()
            )));
        }

        let num_slots = self.get_count()?;
        let mut landmark_slots = Vec::with_capacity(num_slots);
        for _ in 0..num_slots {
            landmark_slots.push(self.get_opt_id()?.map(LandmarkId::new));
        }

        let parent = self.get_opt_id()?.map(KeyframeId::new);

        let num_children = self.get_count()?;
        let mut children = std::collections::HashSet::with_capacity(num_children);
        for _ in 0..num_children {
            children.insert(KeyframeId::new(self.get_u64()?));
        }

        let num_edges = self.get_count()?;
        let mut kf = Keyframe::new(KeyframeId::new(id), timestamp, pose, keypoints, descriptors);
        for _ in 0..num_edges {
            let neighbor = KeyframeId::new(self.get_u64()?);
            let weight = self.get_u32()?;
            kf.add_covisibility(neighbor, weight);
        }

        kf.landmark_slots = landmark_slots;
        kf.parent = parent;
        kf.children = children;
        kf.pose_in_parent = pose_in_parent;
        kf.is_bad = self.get_u8()? != 0;
        Ok(kf)
    }

    pub fn get_landmark(&mut self) -> Result<Landmark, PersistenceError> {
        let id = self.get_u64()?;

        let position = self.get_matrix()?;
        let values = position
            .to_f64_vec()
            .filter(|v| v.len() == 3)
            .ok_or_else(|| PersistenceError::Corrupt("malformed position payload".into()))?;
        let position = Vector3::new(values[0], values[1], values[2]);

        let descriptor = self.get_matrix()?;

        let num_observations = self.get_count()?;
        let mut observations = Vec::with_capacity(num_observations);
        for _ in 0..num_observations {
            let kf_id = KeyframeId::new(self.get_u64()?);
            let slot = self.get_u64()? as usize;
            observations.push((kf_id, slot));
        }

        let first_keyframe = KeyframeId::new(self.get_u64()?);
        let is_bad = self.get_u8()? != 0;

        let mut lm = Landmark::new(LandmarkId::new(id), position, descriptor, first_keyframe);
        for (kf_id, slot) in observations {
            lm.add_observation(kf_id, slot);
        }
        lm.is_bad = is_bad;
        Ok(lm)
    }
}
