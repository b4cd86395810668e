use serde::{Deserialize, Serialize};

use crate::face::{Axis, Face};

/// A three-bit octant selector identifying one of a node's eight children.
/// Bit 0 selects the upper half on x, bit 1 on y, bit 2 on z.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Octant(u8);

impl Octant {
    pub const ALL: [Octant; 8] = [
        Octant(0),
        Octant(1),
        Octant(2),
        Octant(3),
        Octant(4),
        Octant(5),
        Octant(6),
        Octant(7),
    ];

    pub fn new(index: usize) -> Self {
        assert!(index < 8, "octant index {} out of range", index);
        Octant(index as u8)
    }

    /// Build the octant whose per-axis bits are the parities of the given
    /// location vector. The child of a node at `location` covering the
    /// finer-level cell `2 * location + bits` has exactly these bits.
    ///
    pub fn from_location(location: [i64; 3]) -> Self {
        let mut bits = 0;
        for (axis, loc) in location.iter().enumerate() {
            bits |= (loc.rem_euclid(2) as u8) << axis;
        }
        Octant(bits)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// The bit selecting the upper (1) or lower (0) half on the given axis.
    ///
    pub fn bit(self, axis: Axis) -> i64 {
        ((self.0 >> axis.index()) & 1) as i64
    }

    /// Return this octant with the bit on the given axis flipped: the octant
    /// of the face-adjacent sibling along that axis.
    ///
    pub fn flip(self, axis: Axis) -> Self {
        Octant(self.0 ^ (1 << axis.index()))
    }

    pub fn vector(self) -> [i64; 3] {
        [self.bit(Axis::X), self.bit(Axis::Y), self.bit(Axis::Z)]
    }

    /// The face of a child at this octant that points out of the parent's
    /// volume along the given axis.
    ///
    pub fn exterior_face(self, axis: Axis) -> Face {
        match (axis, self.bit(axis)) {
            (Axis::X, 0) => Face::XL,
            (Axis::X, _) => Face::XU,
            (Axis::Y, 0) => Face::YL,
            (Axis::Y, _) => Face::YU,
            (Axis::Z, 0) => Face::ZL,
            (Axis::Z, _) => Face::ZU,
        }
    }

    /// The face of a child at this octant that points toward its sibling
    /// along the given axis: the opposite of the exterior face.
    ///
    pub fn interior_face(self, axis: Axis) -> Face {
        self.exterior_face(axis).invert()
    }
}

/// Flip the octant bit on the axis of the given face. Where `invert(f)` maps
/// a face to its opposite, `invert(f, c)` maps a child to its neighbor across
/// the plane that `f` is normal to.
///
pub fn invert(face: Face, octant: Octant) -> Octant {
    octant.flip(face.axis())
}

#[cfg(test)]
mod test {
    use super::{invert, Octant};
    use crate::face::{Axis, Face};

    #[test]
    fn octant_bits_select_halves() {
        let c = Octant::new(5);
        assert_eq!(c.bit(Axis::X), 1);
        assert_eq!(c.bit(Axis::Y), 0);
        assert_eq!(c.bit(Axis::Z), 1);
        assert_eq!(c.vector(), [1, 0, 1]);
    }

    #[test]
    fn flipping_twice_is_identity() {
        for c in Octant::ALL {
            for axis in Axis::ALL {
                assert_ne!(c, c.flip(axis));
                assert_eq!(c, c.flip(axis).flip(axis));
            }
        }
    }

    #[test]
    fn exterior_faces_point_out_of_the_parent() {
        assert_eq!(Octant::new(0).exterior_face(Axis::X), Face::XL);
        assert_eq!(Octant::new(1).exterior_face(Axis::X), Face::XU);
        assert_eq!(Octant::new(1).interior_face(Axis::X), Face::XL);
        assert_eq!(Octant::new(6).exterior_face(Axis::Z), Face::ZU);
    }

    #[test]
    fn invert_flips_the_face_axis_bit() {
        assert_eq!(invert(Face::XL, Octant::new(0)), Octant::new(1));
        assert_eq!(invert(Face::XU, Octant::new(1)), Octant::new(0));
        assert_eq!(invert(Face::ZU, Octant::new(2)), Octant::new(6));
    }

    #[test]
    fn octant_from_location_parity() {
        assert_eq!(Octant::from_location([2, 3, 4]), Octant::new(2));
        assert_eq!(Octant::from_location([-1, 0, -2]), Octant::new(1));
    }
}
