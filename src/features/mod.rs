//! Feature observation payload types.
//!
//! These are the plain-data types that flow between the tracking front-end,
//! the map, and the persistence codec:
//! - [`KeyPoint`] - a 2D feature detection with pyramid/score metadata
//! - [`DenseMatrix`] - an owned, contiguous, row-major matrix buffer used for
//!   descriptor blocks and serialized pose payloads
//!
//! The matrix type intentionally mirrors the layout a dense CV matrix dumps
//! to disk: shape, element size, element type tag, then the raw bytes.

/// A detected 2D feature point.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct KeyPoint {
    /// Image x coordinate in pixels.
    pub x: f32,
    /// Image y coordinate in pixels.
    pub y: f32,
    /// Dominant orientation in degrees, or -1.0 if not computed.
    pub angle: f32,
    /// Pyramid octave the point was detected at.
    pub octave: i32,
    /// Detector response score.
    pub response: f32,
    /// Optional cluster/class label, -1 if unused.
    pub class_id: i32,
}

impl KeyPoint {
    pub fn new(x: f32, y: f32, angle: f32, octave: i32, response: f32, class_id: i32) -> Self {
        Self {
            x,
            y,
            angle,
            octave,
            response,
            class_id,
        }
    }
}

/// Element type of a [`DenseMatrix`].
///
/// The discriminants double as the on-disk type tag and follow the OpenCV
/// depth codes so files stay readable by tooling that knows that convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatDepth {
    U8 = 0,
    F32 = 5,
    F64 = 6,
}

impl MatDepth {
    /// Size of one element in bytes.
    pub fn elem_size(&self) -> usize {
        match self {
            MatDepth::U8 => 1,
            MatDepth::F32 => 4,
            MatDepth::F64 => 8,
        }
    }

    /// Numeric tag written to disk.
    pub fn tag(&self) -> u64 {
        *self as u64
    }

    /// Parse a tag read from disk.
    pub fn from_tag(tag: u64) -> Option<Self> {
        match tag {
            0 => Some(MatDepth::U8),
            5 => Some(MatDepth::F32),
            6 => Some(MatDepth::F64),
            _ => None,
        }
    }
}

/// An owned dense matrix: row-major, always contiguous.
///
/// Element bytes are stored little-endian, so the buffer round-trips
/// byte-exactly through the map codec regardless of how it was built.
#[derive(Debug, Clone, PartialEq)]
pub struct DenseMatrix {
    rows: usize,
    cols: usize,
    depth: MatDepth,
    data: Vec<u8>,
}

impl DenseMatrix {
    /// Create a zero-filled matrix.
    pub fn zeros(rows: usize, cols: usize, depth: MatDepth) -> Self {
        Self {
            rows,
            cols,
            depth,
            data: vec![0u8; rows * cols * depth.elem_size()],
        }
    }

    /// Build a U8 matrix from row slices. All rows must share `cols` length.
    pub fn from_u8_rows(rows: &[Vec<u8>], cols: usize) -> Self {
        let mut data = Vec::with_capacity(rows.len() * cols);
        for row in rows {
            debug_assert_eq!(row.len(), cols);
            data.extend_from_slice(row);
        }
        Self {
            rows: rows.len(),
            cols,
            depth: MatDepth::U8,
            data,
        }
    }

    /// Build an F64 matrix from a flat row-major slice.
    pub fn from_f64s(rows: usize, cols: usize, values: &[f64]) -> Self {
        debug_assert_eq!(values.len(), rows * cols);
        let mut data = Vec::with_capacity(values.len() * 8);
        for v in values {
            data.extend_from_slice(&v.to_le_bytes());
        }
        Self {
            rows,
            cols,
            depth: MatDepth::F64,
            data,
        }
    }

    /// Reassemble a matrix from decoded parts.
    ///
    /// Fails if the buffer length does not match the declared shape.
    pub fn from_raw(rows: usize, cols: usize, depth: MatDepth, data: Vec<u8>) -> Option<Self> {
        if data.len() != rows * cols * depth.elem_size() {
            return None;
        }
        Some(Self {
            rows,
            cols,
            depth,
            data,
        })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn depth(&self) -> MatDepth {
        self.depth
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The raw contiguous byte buffer, `rows * cols * elem_size` long.
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// One row as raw bytes.
    pub fn row_bytes(&self, row: usize) -> Option<&[u8]> {
        let stride = self.cols * self.depth.elem_size();
        let start = row.checked_mul(stride)?;
        self.data.get(start..start + stride)
    }

    /// Decode the buffer as f64 values, row-major.
    ///
    /// Returns `None` when the element type is not F64.
    pub fn to_f64_vec(&self) -> Option<Vec<f64>> {
        if self.depth != MatDepth::F64 {
            return None;
        }
        Some(
            self.data
                .chunks_exact(8)
                .map(|c| {
                    let mut buf = [0u8; 8];
                    buf.copy_from_slice(c);
                    f64::from_le_bytes(buf)
                })
                .collect(),
        )
    }
}

impl Default for DenseMatrix {
    fn default() -> Self {
        Self::zeros(0, 0, MatDepth::U8)
    }
}

/// Hamming distance between two equally sized binary descriptor rows.
pub fn hamming_distance(a: &[u8], b: &[u8]) -> u32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x ^ y).count_ones())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_f64_roundtrip() {
        let values = [1.0, -2.5, 3.25, std::f64::consts::PI];
        let m = DenseMatrix::from_f64s(2, 2, &values);
        assert_eq!(m.to_f64_vec().unwrap(), values);
    }

    #[test]
    fn test_from_raw_rejects_bad_length() {
        assert!(DenseMatrix::from_raw(2, 2, MatDepth::F64, vec![0u8; 31]).is_none());
        assert!(DenseMatrix::from_raw(2, 2, MatDepth::F64, vec![0u8; 32]).is_some());
    }

    #[test]
    fn test_row_bytes() {
        let m = DenseMatrix::from_u8_rows(&[vec![1, 2, 3], vec![4, 5, 6]], 3);
        assert_eq!(m.row_bytes(0), Some(&[1u8, 2, 3][..]));
        assert_eq!(m.row_bytes(1), Some(&[4u8, 5, 6][..]));
        assert_eq!(m.row_bytes(2), None);
    }

    #[test]
    fn test_hamming_distance() {
        assert_eq!(hamming_distance(&[0b1010], &[0b0101]), 4);
        assert_eq!(hamming_distance(&[0xff, 0x00], &[0xff, 0x00]), 0);
    }

    #[test]
    fn test_depth_tags() {
        assert_eq!(MatDepth::from_tag(0), Some(MatDepth::U8));
        assert_eq!(MatDepth::from_tag(5), Some(MatDepth::F32));
        assert_eq!(MatDepth::from_tag(6), Some(MatDepth::F64));
        assert_eq!(MatDepth::from_tag(3), None);
    }
}
