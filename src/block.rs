use serde::{Deserialize, Serialize};

/// A dense three-dimensional array of state vectors. The backing array is a
/// flat `Vec<f64>` in row-major (x-outermost) order, with `num_fields`
/// contiguous values per cell, like the field layout of a 2D patch
/// generalized to cubes.
///
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Block {
    dim: [usize; 3],
    num_fields: usize,
    data: Vec<f64>,
}

impl Block {
    /// Create a zero-filled block with the given cell dimensions and number
    /// of fields per cell.
    ///
    pub fn zeros(dim: [usize; 3], num_fields: usize) -> Self {
        Self {
            dim,
            num_fields,
            data: vec![0.0; dim[0] * dim[1] * dim[2] * num_fields],
        }
    }

    /// Create a block with values defined from a closure mapping a cell index
    /// to a state vector slice.
    ///
    pub fn from_fn<F>(dim: [usize; 3], num_fields: usize, f: F) -> Self
    where
        F: Fn([usize; 3], &mut [f64]),
    {
        let mut block = Self::zeros(dim, num_fields);
        for i in 0..dim[0] {
            for j in 0..dim[1] {
                for k in 0..dim[2] {
                    f([i, j, k], block.get_mut(i, j, k))
                }
            }
        }
        block
    }

    pub fn dim(&self) -> [usize; 3] {
        self.dim
    }

    pub fn num_fields(&self) -> usize {
        self.num_fields
    }

    fn slot(&self, i: usize, j: usize, k: usize) -> usize {
        debug_assert!(
            i < self.dim[0] && j < self.dim[1] && k < self.dim[2],
            "index ({} {} {}) out of range on block ({} {} {})",
            i,
            j,
            k,
            self.dim[0],
            self.dim[1],
            self.dim[2]
        );
        ((i * self.dim[1] + j) * self.dim[2] + k) * self.num_fields
    }

    /// Return the state vector at the given cell.
    ///
    pub fn get(&self, i: usize, j: usize, k: usize) -> &[f64] {
        let s = self.slot(i, j, k);
        &self.data[s..s + self.num_fields]
    }

    pub fn get_mut(&mut self, i: usize, j: usize, k: usize) -> &mut [f64] {
        let s = self.slot(i, j, k);
        let n = self.num_fields;
        &mut self.data[s..s + n]
    }

    /// Set every value in the block to zero.
    ///
    pub fn clear(&mut self) {
        self.data.iter_mut().for_each(|x| *x = 0.0)
    }

    pub fn total_cells(&self) -> usize {
        self.dim[0] * self.dim[1] * self.dim[2]
    }
}

#[cfg(test)]
mod test {
    use super::Block;

    #[test]
    fn indexing_round_trips() {
        let mut block = Block::zeros([4, 3, 2], 2);
        block.get_mut(3, 2, 1).copy_from_slice(&[1.0, 2.0]);
        block.get_mut(0, 1, 0).copy_from_slice(&[3.0, 4.0]);
        assert_eq!(block.get(3, 2, 1), &[1.0, 2.0]);
        assert_eq!(block.get(0, 1, 0), &[3.0, 4.0]);
        assert_eq!(block.get(1, 1, 1), &[0.0, 0.0]);
    }

    #[test]
    fn from_fn_visits_every_cell() {
        let block = Block::from_fn([2, 2, 2], 1, |[i, j, k], u| {
            u[0] = (i * 4 + j * 2 + k) as f64;
        });
        assert_eq!(block.get(0, 0, 0), &[0.0]);
        assert_eq!(block.get(1, 1, 1), &[7.0]);
        assert_eq!(block.total_cells(), 8);
    }

    #[test]
    fn clear_zeroes_the_data() {
        let mut block = Block::from_fn([2, 2, 2], 1, |_, u| u[0] = 1.0);
        block.clear();
        assert_eq!(block.get(1, 0, 1), &[0.0]);
    }
}
