//! Rigid-body transform math.
//!
//! Rotations are unit quaternions stored as `[x, y, z, w]` (Hamilton
//! convention). A [`Transform`] maps coordinates expressed in a child frame
//! into its parent frame: `p_parent = R * p_child + t`.

use serde::{Deserialize, Serialize};

/// `[x, y, z]` in meters.
pub type Vector3 = [f64; 3];
/// `[x, y, z, w]` unit quaternion.
pub type Quaternion = [f64; 4];

/// Identity rotation.
pub const IDENTITY_ROTATION: Quaternion = [0.0, 0.0, 0.0, 1.0];

const NORM_EPSILON: f64 = 1e-10;

/// Translation plus rotation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    /// Translation of the child origin in the parent frame.
    pub translation: Vector3,
    /// Orientation of the child frame in the parent frame.
    pub rotation: Quaternion,
}

impl Default for Transform {
    fn default() -> Self {
        Self::identity()
    }
}

impl Transform {
    /// No translation, no rotation.
    #[must_use]
    pub const fn identity() -> Self {
        Self {
            translation: [0.0; 3],
            rotation: IDENTITY_ROTATION,
        }
    }

    /// Builds a transform, normalizing the rotation. Returns `None` when the
    /// quaternion has (near) zero norm or is not finite.
    #[must_use]
    pub fn new(translation: Vector3, rotation: Quaternion) -> Option<Self> {
        normalize(rotation).map(|rotation| Self {
            translation,
            rotation,
        })
    }

    /// Pure translation.
    #[must_use]
    pub const fn from_translation(translation: Vector3) -> Self {
        Self {
            translation,
            rotation: IDENTITY_ROTATION,
        }
    }

    /// Translation plus roll/pitch/yaw in radians.
    #[must_use]
    pub fn from_euler(translation: Vector3, roll: f64, pitch: f64, yaw: f64) -> Self {
        let (sr, cr) = (roll / 2.0).sin_cos();
        let (sp, cp) = (pitch / 2.0).sin_cos();
        let (sy, cy) = (yaw / 2.0).sin_cos();
        Self {
            translation,
            rotation: [
                sr * cp * cy - cr * sp * sy,
                cr * sp * cy + sr * cp * sy,
                cr * cp * sy - sr * sp * cy,
                cr * cp * cy + sr * sp * sy,
            ],
        }
    }

    /// `self ∘ other`: maps `other`'s child frame into `self`'s parent frame.
    #[must_use]
    pub fn compose(&self, other: &Self) -> Self {
        Self {
            translation: add(self.translation, rotate(self.rotation, other.translation)),
            rotation: multiply(self.rotation, other.rotation),
        }
    }

    /// Reverse direction: rotation conjugate, translation `-R⁻¹·t`.
    #[must_use]
    pub fn inverse(&self) -> Self {
        let rotation = conjugate(self.rotation);
        let negated = [
            -self.translation[0],
            -self.translation[1],
            -self.translation[2],
        ];
        Self {
            translation: rotate(rotation, negated),
            rotation,
        }
    }

    /// Row-major 4x4 homogeneous matrix.
    #[must_use]
    pub fn to_matrix(&self) -> [[f64; 4]; 4] {
        let [x, y, z, w] = self.rotation;
        let [tx, ty, tz] = self.translation;
        [
            [
                1.0 - 2.0 * (y * y + z * z),
                2.0 * (x * y - z * w),
                2.0 * (x * z + y * w),
                tx,
            ],
            [
                2.0 * (x * y + z * w),
                1.0 - 2.0 * (x * x + z * z),
                2.0 * (y * z - x * w),
                ty,
            ],
            [
                2.0 * (x * z - y * w),
                2.0 * (y * z + x * w),
                1.0 - 2.0 * (x * x + y * y),
                tz,
            ],
            [0.0, 0.0, 0.0, 1.0],
        ]
    }

    /// Applies rotation and translation as one affine map.
    #[must_use]
    pub fn transform_point(&self, point: Vector3) -> Vector3 {
        apply_affine(&self.to_matrix(), point, 1.0)
    }

    /// Applies the rotation only; vectors are not affected by translation.
    #[must_use]
    pub fn transform_vector(&self, vector: Vector3) -> Vector3 {
        apply_affine(&self.to_matrix(), vector, 0.0)
    }

    /// Rotation angle in radians, in `[0, π]`.
    #[must_use]
    pub fn rotation_angle(&self) -> f64 {
        2.0 * self.rotation[3].abs().clamp(0.0, 1.0).acos()
    }

    /// Component-wise comparison within `epsilon`, treating `q` and `-q` as
    /// the same rotation.
    #[must_use]
    pub fn approx_eq(&self, other: &Self, epsilon: f64) -> bool {
        let close = |a: &[f64], b: &[f64]| a.iter().zip(b).all(|(x, y)| (x - y).abs() <= epsilon);
        let flipped = other.rotation.map(|c| -c);
        close(&self.translation, &other.translation)
            && (close(&self.rotation, &other.rotation) || close(&self.rotation, &flipped))
    }
}

fn normalize(q: Quaternion) -> Option<Quaternion> {
    let norm = q.iter().map(|c| c * c).sum::<f64>().sqrt();
    (norm.is_finite() && norm > NORM_EPSILON).then(|| q.map(|c| c / norm))
}

const fn conjugate(q: Quaternion) -> Quaternion {
    [-q[0], -q[1], -q[2], q[3]]
}

fn multiply(a: Quaternion, b: Quaternion) -> Quaternion {
    [
        a[3] * b[0] + a[0] * b[3] + a[1] * b[2] - a[2] * b[1],
        a[3] * b[1] - a[0] * b[2] + a[1] * b[3] + a[2] * b[0],
        a[3] * b[2] + a[0] * b[1] - a[1] * b[0] + a[2] * b[3],
        a[3] * b[3] - a[0] * b[0] - a[1] * b[1] - a[2] * b[2],
    ]
}

fn rotate(q: Quaternion, v: Vector3) -> Vector3 {
    let [qx, qy, qz, qw] = q;
    // v' = v + w·t + q×t with t = 2·(q×v)
    let t = [
        2.0 * (qy * v[2] - qz * v[1]),
        2.0 * (qz * v[0] - qx * v[2]),
        2.0 * (qx * v[1] - qy * v[0]),
    ];
    [
        v[0] + qw * t[0] + qy * t[2] - qz * t[1],
        v[1] + qw * t[1] + qz * t[0] - qx * t[2],
        v[2] + qw * t[2] + qx * t[1] - qy * t[0],
    ]
}

fn add(a: Vector3, b: Vector3) -> Vector3 {
    [a[0] + b[0], a[1] + b[1], a[2] + b[2]]
}

fn apply_affine(m: &[[f64; 4]; 4], v: Vector3, w: f64) -> Vector3 {
    let row = |r: &[f64; 4]| r[0] * v[0] + r[1] * v[1] + r[2] * v[2] + r[3] * w;
    [row(&m[0]), row(&m[1]), row(&m[2])]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::FRAC_PI_2;

    const EPS: f64 = 1e-9;

    fn close3(a: Vector3, b: Vector3) -> bool {
        a.iter().zip(b).all(|(x, y)| (x - y).abs() < EPS)
    }

    #[test]
    fn rejects_degenerate_rotation() {
        assert!(Transform::new([0.0; 3], [0.0; 4]).is_none());
        assert!(Transform::new([0.0; 3], [f64::NAN, 0.0, 0.0, 1.0]).is_none());
        let tf = Transform::new([0.0; 3], [0.0, 0.0, 0.0, 2.0]).unwrap();
        assert_eq!(tf.rotation, IDENTITY_ROTATION);
    }

    #[test]
    fn yaw_rotates_points_and_vectors() {
        let tf = Transform::from_euler([1.0, 0.0, 0.0], 0.0, 0.0, FRAC_PI_2);
        assert!(close3(tf.transform_point([1.0, 0.0, 0.0]), [1.0, 1.0, 0.0]));
        assert!(close3(tf.transform_vector([1.0, 0.0, 0.0]), [0.0, 1.0, 0.0]));
        assert!((tf.rotation_angle() - FRAC_PI_2).abs() < EPS);
    }

    #[test]
    fn inverse_undoes_transform() {
        let tf = Transform::from_euler([0.5, -2.0, 1.0], 0.3, -0.2, 1.1);
        let p = [3.0, 4.0, -1.0];
        let back = tf.inverse().transform_point(tf.transform_point(p));
        assert!(close3(back, p));
        assert!(tf.compose(&tf.inverse()).approx_eq(&Transform::identity(), EPS));
    }

    #[test]
    fn compose_chains_frames() {
        let a = Transform::from_translation([1.0, 0.0, 0.0]);
        let b = Transform::from_euler([0.0, 2.0, 0.0], 0.0, 0.0, FRAC_PI_2);
        let chained = a.compose(&b);
        let p = [1.0, 0.0, 0.0];
        assert!(close3(
            chained.transform_point(p),
            a.transform_point(b.transform_point(p))
        ));
    }
}
