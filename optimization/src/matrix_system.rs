//! Normal-equation system storage.

use nalgebra::{DMatrix, DVector};

/// Stores both sides of a least-squares system in premultiplied form:
/// `lhs = A'A` and one `rhs = A'y` per observation channel (red, green, blue
/// for color systems).
///
/// Systems built independently (one per view) combine by elementwise addition,
/// which is associative and commutative, so per-view contributions can be
/// built in parallel and merged by reduction in any order.
#[derive(Clone, Debug)]
pub struct MatrixSystem {
    /// The square, symmetric left-hand side `A'A`.
    pub lhs: DMatrix<f64>,
    /// One right-hand side `A'y` per channel.
    pub rhs: Vec<DVector<f64>>,
}

impl MatrixSystem {
    /// Creates a zeroed system of the given dimension with `channels`
    /// right-hand sides.
    pub fn new(dim: usize, channels: usize) -> Self {
        Self {
            lhs: DMatrix::zeros(dim, dim),
            rhs: (0..channels).map(|_| DVector::zeros(dim)).collect(),
        }
    }

    /// The number of rows (and columns) of the system.
    pub fn dim(&self) -> usize {
        self.lhs.nrows()
    }

    /// The number of right-hand-side channels.
    pub fn channels(&self) -> usize {
        self.rhs.len()
    }

    #[inline]
    pub fn add_to_lhs(&mut self, row: usize, col: usize, amount: f64) {
        self.lhs[(row, col)] += amount;
    }

    #[inline]
    pub fn add_to_rhs(&mut self, row: usize, channel: usize, amount: f64) {
        self.rhs[channel][row] += amount;
    }

    /// Adds another contribution elementwise.
    pub fn add_contribution(&mut self, other: &MatrixSystem) {
        self.lhs += &other.lhs;
        for (rhs, other_rhs) in self.rhs.iter_mut().zip(&other.rhs) {
            *rhs += other_rhs;
        }
    }
}
