

//! Simple 2-dimensional vectors and the integer arithmetic
//! used for resolution levels and precinct grids.

use std::ops::{Add, Div, Mul, Sub};


/// A generic 2-dimensional vector. Used for image sizes,
/// window corners and precinct coordinates.
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Vec2<T> (pub T, pub T);

/// A pixel position on the full-resolution grid of an image.
pub type Point = Vec2<u64>;

/// A size in pixels.
pub type Size = Vec2<u64>;


impl<T> Vec2<T> {

    /// The first component of this vector, by convention the horizontal axis.
    #[inline] pub fn x(self) -> T where T: Copy { self.0 }

    /// The second component of this vector, by convention the vertical axis.
    #[inline] pub fn y(self) -> T where T: Copy { self.1 }

    /// Applies a function to each component.
    #[inline] pub fn map<B>(self, map: impl Fn(T) -> B) -> Vec2<B> {
        Vec2(map(self.0), map(self.1))
    }

    /// The product of the two components.
    #[inline] pub fn area(self) -> T where T: Copy + Mul<T, Output = T> {
        self.0 * self.1
    }
}

impl<T: Add<T>> Add<Vec2<T>> for Vec2<T> {
    type Output = Vec2<T::Output>;
    fn add(self, other: Vec2<T>) -> Self::Output {
        Vec2(self.0 + other.0, self.1 + other.1)
    }
}

impl<T: Sub<T>> Sub<Vec2<T>> for Vec2<T> {
    type Output = Vec2<T::Output>;
    fn sub(self, other: Vec2<T>) -> Self::Output {
        Vec2(self.0 - other.0, self.1 - other.1)
    }
}

impl<T: Mul<T> + Copy> Mul<T> for Vec2<T> {
    type Output = Vec2<T::Output>;
    fn mul(self, factor: T) -> Self::Output {
        Vec2(self.0 * factor, self.1 * factor)
    }
}

impl<T: Div<T> + Copy> Div<T> for Vec2<T> {
    type Output = Vec2<T::Output>;
    fn div(self, divisor: T) -> Self::Output {
        Vec2(self.0 / divisor, self.1 / divisor)
    }
}

impl<T> From<(T, T)> for Vec2<T> {
    fn from((x, y): (T, T)) -> Self { Vec2(x, y) }
}


/// Integer division, rounded towards positive infinity.
/// Only works for positive numbers.
#[inline]
pub fn ceil_div(dividend: u64, divisor: u64) -> u64 {
    debug_assert_ne!(divisor, 0, "division by zero");
    (dividend + divisor - 1) / divisor
}

/// Computes the size of one image axis at the given resolution level,
/// with level zero being the full resolution.
#[inline]
pub fn level_size(full_res: u64, level: u32) -> u64 {
    ceil_div(full_res, 1_u64 << level)
}


/// How to choose a resolution level when the requested
/// frame size does not match any level exactly.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RoundingMode {

    /// The smallest level that is at least as large as the request on both axes.
    Up,

    /// The largest level that is at most as large as the request on both axes.
    Down,

    /// The level with the smallest Manhattan distance to the request.
    Closest,
}

impl Default for RoundingMode {
    fn default() -> Self { RoundingMode::Closest }
}
