//! Math types.
//!
//! This module intentionally stays small and deterministic.
//! Angles are in degrees, matching what goes over the wire.

use std::ops::{Add, Index, IndexMut, Mul, Neg, Sub};

use serde::{Deserialize, Serialize};

/// 3D vector.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub const ZERO: Self = Self {
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };

    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub fn dot(self, rhs: Self) -> f32 {
        self.x * rhs.x + self.y * rhs.y + self.z * rhs.z
    }

    pub fn len_sq(self) -> f32 {
        self.dot(self)
    }

    pub fn len(self) -> f32 {
        self.len_sq().sqrt()
    }

    /// Returns the unit vector and the original length.
    pub fn normalize(self) -> (Self, f32) {
        let len = self.len();
        if len == 0.0 {
            (Self::ZERO, 0.0)
        } else {
            (self * (1.0 / len), len)
        }
    }

    /// `self + dir * scale`.
    pub fn mul_add(self, dir: Self, scale: f32) -> Self {
        Self::new(
            self.x + dir.x * scale,
            self.y + dir.y * scale,
            self.z + dir.z * scale,
        )
    }

    pub fn lerp(self, to: Self, t: f32) -> Self {
        let t = t.clamp(0.0, 1.0);
        Self::new(
            self.x + (to.x - self.x) * t,
            self.y + (to.y - self.y) * t,
            self.z + (to.z - self.z) * t,
        )
    }

    /// Per-component shortest-path angle interpolation.
    pub fn lerp_angles(self, to: Self, t: f32) -> Self {
        Self::new(
            lerp_angle(self.x, to.x, t),
            lerp_angle(self.y, to.y, t),
            lerp_angle(self.z, to.z, t),
        )
    }
}

impl Index<usize> for Vec3 {
    type Output = f32;

    fn index(&self, i: usize) -> &f32 {
        match i {
            0 => &self.x,
            1 => &self.y,
            2 => &self.z,
            _ => panic!("Vec3 index {i} out of range"),
        }
    }
}

impl IndexMut<usize> for Vec3 {
    fn index_mut(&mut self, i: usize) -> &mut f32 {
        match i {
            0 => &mut self.x,
            1 => &mut self.y,
            2 => &mut self.z,
            _ => panic!("Vec3 index {i} out of range"),
        }
    }
}

impl Add for Vec3 {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl Sub for Vec3 {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

impl Mul<f32> for Vec3 {
    type Output = Self;

    fn mul(self, s: f32) -> Self {
        Self::new(self.x * s, self.y * s, self.z * s)
    }
}

impl Neg for Vec3 {
    type Output = Self;

    fn neg(self) -> Self {
        Self::new(-self.x, -self.y, -self.z)
    }
}

/// Wraps an angle into `[0, 360)` with 16-bit precision.
pub fn angle_mod(a: f32) -> f32 {
    short_to_angle(angle_to_short(a))
}

/// Packs an angle into the 16-bit representation used by user commands.
pub fn angle_to_short(a: f32) -> u16 {
    ((a * (65536.0 / 360.0)) as i32 & 0xFFFF) as u16
}

pub fn short_to_angle(s: u16) -> f32 {
    s as f32 * (360.0 / 65536.0)
}

/// Signed difference `a1 - a2` folded into `[-180, 180)`.
pub fn angle_subtract(a1: f32, a2: f32) -> f32 {
    let mut a = a1 - a2;
    while a > 180.0 {
        a -= 360.0;
    }
    while a < -180.0 {
        a += 360.0;
    }
    a
}

/// Interpolates from `from` toward `to` along the shorter arc.
pub fn lerp_angle(from: f32, to: f32, frac: f32) -> f32 {
    let mut to = to;
    if to - from > 180.0 {
        to -= 360.0;
    }
    if to - from < -180.0 {
        to += 360.0;
    }
    from + frac * (to - from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vec3_lerp_midpoint() {
        let a = Vec3::new(0.0, 0.0, 0.0);
        let b = Vec3::new(2.0, 4.0, 6.0);
        let mid = a.lerp(b, 0.5);
        assert_eq!(mid, Vec3::new(1.0, 2.0, 3.0));
    }

    #[test]
    fn lerp_angle_takes_short_way_round() {
        assert_eq!(lerp_angle(350.0, 10.0, 0.5), 360.0);
        assert_eq!(lerp_angle(10.0, 350.0, 0.5), 0.0);
        assert_eq!(lerp_angle(90.0, 100.0, 0.5), 95.0);
    }

    #[test]
    fn short_angle_packing_wraps() {
        assert_eq!(angle_to_short(0.0), 0);
        assert_eq!(angle_to_short(360.0), 0);
        assert_eq!(angle_to_short(180.0), 32768);
        assert_eq!(angle_to_short(-90.0), 49152);
    }

    #[test]
    fn angle_subtract_folds() {
        assert_eq!(angle_subtract(10.0, 350.0), 20.0);
        assert_eq!(angle_subtract(350.0, 10.0), -20.0);
    }
}
