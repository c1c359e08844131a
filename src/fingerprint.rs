//! Structural fingerprints: a canonical text dump of kinematic/geometric
//! structure, hashed with a stable digest. Fingerprints key external caches
//! (precomputed IK databases, cached models), so the dump must be
//! bit-reproducible for identical structure: fixed floating-point
//! precision, deterministic index ordering, no pointers.

use bitflags::bitflags;
use sha2::{Digest, Sha256};

use crate::model::Pose;

bitflags! {
    /// Sections selectable in a structure dump.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct SerializationFlags: u32 {
        const KINEMATICS   = 0b0001;
        const GEOMETRY     = 0b0010;
        const MANIPULATORS = 0b0100;
        const SENSORS      = 0b1000;
    }
}

/// Write one real with fixed precision. Values within rounding noise of
/// zero are snapped so `-0.000000` can never alternate with `0.000000`.
pub fn fmt_real(out: &mut String, value: f64) {
    let value = if value.abs() < 1e-9 { 0.0 } else { value };
    out.push_str(&format!("{:.6} ", value));
}

pub fn fmt_vec3(out: &mut String, v: &nalgebra::Vector3<f64>) {
    fmt_real(out, v.x);
    fmt_real(out, v.y);
    fmt_real(out, v.z);
}

/// Translation followed by the rotation quaternion in (w, i, j, k) order.
pub fn fmt_pose(out: &mut String, pose: &Pose) {
    fmt_real(out, pose.translation.vector.x);
    fmt_real(out, pose.translation.vector.y);
    fmt_real(out, pose.translation.vector.z);
    let q = pose.rotation.quaternion();
    fmt_real(out, q.w);
    fmt_real(out, q.i);
    fmt_real(out, q.j);
    fmt_real(out, q.k);
}

/// Stable digest of a canonical dump, rendered as lowercase hex.
pub fn digest(dump: &str) -> String {
    let hash = Sha256::digest(dump.as_bytes());
    hash.iter().map(|byte| format!("{:02x}", byte)).collect()
}
