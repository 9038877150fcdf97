//! SE3 - rigid body transform in 3D.
//!
//! Stored as a unit quaternion plus translation rather than a 4x4 matrix so
//! that composition stays numerically clean and serialization can round-trip
//! the exact quaternion coefficients.

use nalgebra::{Matrix3, Quaternion, UnitQuaternion, Vector3};

/// A rigid transform: rotation followed by translation.
///
/// Poses throughout the system follow the T_wc convention (camera to world):
/// `p_world = pose.transform_point(&p_cam)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SE3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
}

impl SE3 {
    /// The identity transform.
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
        }
    }

    /// Create a transform from rotation and translation.
    pub fn new(rotation: UnitQuaternion<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    /// Reconstruct from raw quaternion coefficients `[w, i, j, k]` and a
    /// translation, without renormalizing.
    ///
    /// Used by the map codec: the coefficients were written from a valid unit
    /// quaternion, and renormalization would perturb the stored bits.
    pub fn from_raw_parts(w: f64, i: f64, j: f64, k: f64, translation: Vector3<f64>) -> Self {
        Self {
            rotation: UnitQuaternion::new_unchecked(Quaternion::new(w, i, j, k)),
            translation,
        }
    }

    /// Inverse transform.
    pub fn inverse(&self) -> Self {
        let inv_rot = self.rotation.inverse();
        Self {
            rotation: inv_rot,
            translation: -(inv_rot * self.translation),
        }
    }

    /// Apply the transform to a point.
    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * p + self.translation
    }

    /// Rotation as a 3x3 matrix.
    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        self.rotation.to_rotation_matrix().into_inner()
    }
}

impl std::ops::Mul for SE3 {
    type Output = SE3;

    /// Compose two transforms: `(a * b).transform_point(p) == a(b(p))`.
    fn mul(self, rhs: SE3) -> SE3 {
        SE3 {
            rotation: self.rotation * rhs.rotation,
            translation: self.rotation * rhs.translation + self.translation,
        }
    }
}

impl Default for SE3 {
    fn default() -> Self {
        Self::identity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx_eq(a: &Vector3<f64>, b: &Vector3<f64>) -> bool {
        (a - b).norm() < 1e-12
    }

    #[test]
    fn test_identity_roundtrip() {
        let p = Vector3::new(1.0, -2.0, 3.0);
        assert!(approx_eq(&SE3::identity().transform_point(&p), &p));
    }

    #[test]
    fn test_inverse_composition() {
        let t = SE3::new(
            UnitQuaternion::from_euler_angles(0.1, -0.4, 0.7),
            Vector3::new(2.0, 0.5, -1.0),
        );
        let p = Vector3::new(-3.0, 4.0, 1.5);
        let back = t.inverse().transform_point(&t.transform_point(&p));
        assert!(approx_eq(&back, &p));
    }

    #[test]
    fn test_mul_matches_sequential_application() {
        let a = SE3::new(
            UnitQuaternion::from_euler_angles(0.3, 0.0, -0.2),
            Vector3::new(1.0, 1.0, 0.0),
        );
        let b = SE3::new(
            UnitQuaternion::from_euler_angles(-0.1, 0.5, 0.0),
            Vector3::new(0.0, -2.0, 3.0),
        );
        let p = Vector3::new(0.5, 0.5, 0.5);
        let ab = (a * b).transform_point(&p);
        let seq = a.transform_point(&b.transform_point(&p));
        assert!(approx_eq(&ab, &seq));
    }

    #[test]
    fn test_from_raw_parts_preserves_coefficients() {
        let q = UnitQuaternion::from_euler_angles(0.2, 0.3, 0.4);
        let t = Vector3::new(1.0, 2.0, 3.0);
        let rebuilt = SE3::from_raw_parts(q.w, q.i, q.j, q.k, t);
        assert_eq!(rebuilt.rotation.w, q.w);
        assert_eq!(rebuilt.rotation.i, q.i);
        assert_eq!(rebuilt.rotation.j, q.j);
        assert_eq!(rebuilt.rotation.k, q.k);
    }
}
