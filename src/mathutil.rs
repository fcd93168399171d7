// src/mathutil.rs
// Small vector helpers for tool and probe coordinates.

pub type Vector3d = [f64; 3];

pub fn vector_add(v1: Vector3d, v2: Vector3d) -> Vector3d {
    [v1[0] + v2[0], v1[1] + v2[1], v1[2] + v2[2]]
}

pub fn vector_sub(v1: Vector3d, v2: Vector3d) -> Vector3d {
    [v1[0] - v2[0], v1[1] - v2[1], v1[2] - v2[2]]
}

/// Subtract only the XY part of `offset`, keeping Z.
pub fn xy_sub(v: Vector3d, offset: Vector3d) -> Vector3d {
    [v[0] - offset[0], v[1] - offset[1], v[2]]
}

/// Linear interpolation over evenly spaced samples starting at `start`.
/// Outside the table the nearest segment is extrapolated.
pub fn interpolate_even(start: f64, spacing: f64, values: &[f64], at: f64) -> f64 {
    match values.len() {
        0 => 0.0,
        1 => values[0],
        n => {
            let pos = (at - start) / spacing;
            let idx = (pos.floor().max(0.0) as usize).min(n - 2);
            let t = pos - idx as f64;
            values[idx] + (values[idx + 1] - values[idx]) * t
        }
    }
}
