use serde::{Deserialize, Serialize};

/// Identifier for a Cartesian axis.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Axis {
    X,
    Y,
    Z,
}

impl Axis {
    pub const ALL: [Axis; 3] = [Axis::X, Axis::Y, Axis::Z];

    pub fn index(self) -> usize {
        match self {
            Axis::X => 0,
            Axis::Y => 1,
            Axis::Z => 2,
        }
    }
}

/// One of the six axial faces of a grid node. `L` faces point toward
/// decreasing coordinate, `U` faces toward increasing coordinate.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Face {
    XL,
    XU,
    YL,
    YU,
    ZL,
    ZU,
}

impl Face {
    pub const ALL: [Face; 6] = [Face::XL, Face::XU, Face::YL, Face::YU, Face::ZL, Face::ZU];

    /// Return the face on the opposite side of the node.
    ///
    pub fn invert(self) -> Face {
        match self {
            Face::XL => Face::XU,
            Face::XU => Face::XL,
            Face::YL => Face::YU,
            Face::YU => Face::YL,
            Face::ZL => Face::ZU,
            Face::ZU => Face::ZL,
        }
    }

    /// Return the axis normal to this face.
    ///
    pub fn axis(self) -> Axis {
        match self {
            Face::XL | Face::XU => Axis::X,
            Face::YL | Face::YU => Axis::Y,
            Face::ZL | Face::ZU => Axis::Z,
        }
    }

    pub fn is_upper(self) -> bool {
        matches!(self, Face::XU | Face::YU | Face::ZU)
    }

    /// Return the outward unit offset of this face: the integer vector from a
    /// node's location to the location of its neighbor across the face.
    ///
    pub fn unit(self) -> [i64; 3] {
        let mut v = [0; 3];
        v[self.axis().index()] = if self.is_upper() { 1 } else { -1 };
        v
    }

    pub fn index(self) -> usize {
        match self {
            Face::XL => 0,
            Face::XU => 1,
            Face::YL => 2,
            Face::YU => 3,
            Face::ZL => 4,
            Face::ZU => 5,
        }
    }
}

impl TryFrom<usize> for Face {
    type Error = crate::error::Error;

    fn try_from(index: usize) -> Result<Self, Self::Error> {
        Face::ALL
            .get(index)
            .copied()
            .ok_or(crate::error::Error::OutOfRangeFace(index))
    }
}

#[cfg(test)]
mod test {
    use super::{Axis, Face};

    #[test]
    fn faces_invert_to_their_opposites() {
        for face in Face::ALL {
            assert_ne!(face, face.invert());
            assert_eq!(face, face.invert().invert());
            assert_eq!(face.axis(), face.invert().axis());
        }
    }

    #[test]
    fn unit_offsets_point_outward() {
        assert_eq!(Face::XL.unit(), [-1, 0, 0]);
        assert_eq!(Face::YU.unit(), [0, 1, 0]);
        assert_eq!(Face::ZU.unit(), [0, 0, 1]);
        assert_eq!(Face::ZL.axis(), Axis::Z);
    }

    #[test]
    fn face_indexes_are_dense() {
        for (n, face) in Face::ALL.iter().enumerate() {
            assert_eq!(face.index(), n);
            assert_eq!(Face::try_from(n).unwrap(), *face);
        }
        assert!(Face::try_from(6).is_err());
    }
}
