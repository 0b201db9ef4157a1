//! Compass directions with table-driven rotation and opposite lookup
//!
//! Yaw follows the voxel-world convention: 0 faces south (+Z), 90 west (-X),
//! 180 north (-Z) and 270 east (+X).

use serde::{Deserialize, Serialize};

/// One of the 19 block faces / compass directions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DirectionFace {
    North,
    East,
    South,
    West,
    Up,
    Down,
    NorthEast,
    NorthWest,
    SouthEast,
    SouthWest,
    WestNorthWest,
    NorthNorthWest,
    NorthNorthEast,
    EastNorthEast,
    EastSouthEast,
    SouthSouthEast,
    SouthSouthWest,
    WestSouthWest,
    SelfFace,
}

use DirectionFace::*;

/// The eight horizontal faces, clockwise from south, indexed by notch
const RADIAL: [DirectionFace; 8] = [
    South, SouthWest, West, NorthWest, North, NorthEast, East, SouthEast,
];

/// The four axis faces, every other radial entry
const AXIS: [DirectionFace; 4] = [South, West, North, East];

impl DirectionFace {
    pub const ALL: [DirectionFace; 19] = [
        North,
        East,
        South,
        West,
        Up,
        Down,
        NorthEast,
        NorthWest,
        SouthEast,
        SouthWest,
        WestNorthWest,
        NorthNorthWest,
        NorthNorthEast,
        EastNorthEast,
        EastSouthEast,
        SouthSouthEast,
        SouthSouthWest,
        WestSouthWest,
        SelfFace,
    ];

    /// Offset (dx, dy, dz) of this face. Composite faces sum their parts.
    pub const fn offset(self) -> (i32, i32, i32) {
        match self {
            North => (0, 0, -1),
            East => (1, 0, 0),
            South => (0, 0, 1),
            West => (-1, 0, 0),
            Up => (0, 1, 0),
            Down => (0, -1, 0),
            NorthEast => (1, 0, -1),
            NorthWest => (-1, 0, -1),
            SouthEast => (1, 0, 1),
            SouthWest => (-1, 0, 1),
            WestNorthWest => (-2, 0, -1),
            NorthNorthWest => (-1, 0, -2),
            NorthNorthEast => (1, 0, -2),
            EastNorthEast => (2, 0, -1),
            EastSouthEast => (2, 0, 1),
            SouthSouthEast => (1, 0, 2),
            SouthSouthWest => (-1, 0, 2),
            WestSouthWest => (-2, 0, 1),
            SelfFace => (0, 0, 0),
        }
    }

    #[inline]
    pub const fn dx(self) -> i32 {
        self.offset().0
    }

    #[inline]
    pub const fn dy(self) -> i32 {
        self.offset().1
    }

    #[inline]
    pub const fn dz(self) -> i32 {
        self.offset().2
    }

    pub const fn opposite(self) -> Self {
        match self {
            North => South,
            South => North,
            East => West,
            West => East,
            Up => Down,
            Down => Up,
            NorthEast => SouthWest,
            NorthWest => SouthEast,
            SouthEast => NorthWest,
            SouthWest => NorthEast,
            WestNorthWest => EastSouthEast,
            NorthNorthWest => SouthSouthEast,
            NorthNorthEast => SouthSouthWest,
            EastNorthEast => WestSouthWest,
            EastSouthEast => WestNorthWest,
            SouthSouthEast => NorthNorthWest,
            SouthSouthWest => NorthNorthEast,
            WestSouthWest => EastNorthEast,
            SelfFace => SelfFace,
        }
    }

    /// Position of this face on the radial ring, if it is one of the eight
    pub fn notch(self) -> Option<u8> {
        RADIAL.iter().position(|&f| f == self).map(|i| i as u8)
    }

    /// Radial face for a notch index (wraps modulo 8)
    #[inline]
    pub fn from_notch(notch: i32) -> Self {
        RADIAL[(notch & 0x7) as usize]
    }

    /// Rotate clockwise by `notches` steps of 45 degrees.
    /// Only the eight radial faces can rotate.
    pub fn rotate(self, notches: i32) -> Option<Self> {
        self.notch().map(|n| Self::from_notch(n as i32 + notches))
    }

    /// Face the player looks towards for a yaw in degrees
    pub fn from_yaw(yaw: f32, sub_cardinal: bool) -> Self {
        let yaw = yaw.rem_euclid(360.0);
        if sub_cardinal {
            RADIAL[((yaw / 45.0).round() as i32 & 0x7) as usize]
        } else {
            AXIS[((yaw / 90.0).round() as i32 & 0x3) as usize]
        }
    }

    /// Whether this face lies in the horizontal plane (and is not SELF)
    pub fn is_horizontal(self) -> bool {
        let (dx, dy, dz) = self.offset();
        dy == 0 && (dx != 0 || dz != 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opposite_is_involution() {
        for face in DirectionFace::ALL {
            assert_eq!(face.opposite().opposite(), face);
            let (dx, dy, dz) = face.offset();
            assert_eq!(face.opposite().offset(), (-dx, -dy, -dz));
        }
    }

    #[test]
    fn test_yaw_to_face_radial() {
        assert_eq!(DirectionFace::from_yaw(0.0, true), South);
        assert_eq!(DirectionFace::from_yaw(90.0, true), West);
        assert_eq!(DirectionFace::from_yaw(180.0, true), North);
        assert_eq!(DirectionFace::from_yaw(270.0, true), East);
        assert_eq!(DirectionFace::from_yaw(-90.0, true), East);
        assert_eq!(DirectionFace::from_yaw(44.0, true), SouthWest);
        assert_eq!(DirectionFace::from_yaw(359.0, true), South);
        assert_eq!(DirectionFace::from_yaw(720.0 + 135.0, true), NorthWest);
    }

    #[test]
    fn test_yaw_to_face_axis() {
        assert_eq!(DirectionFace::from_yaw(40.0, false), South);
        assert_eq!(DirectionFace::from_yaw(50.0, false), West);
        assert_eq!(DirectionFace::from_yaw(-100.0, false), East);
    }

    #[test]
    fn test_rotate() {
        assert_eq!(South.rotate(2), Some(West));
        assert_eq!(North.rotate(-4), Some(South));
        assert_eq!(SouthEast.rotate(1), Some(South));
        assert_eq!(Up.rotate(1), None);
        assert_eq!(WestNorthWest.rotate(1), None);
    }

    #[test]
    fn test_horizontal() {
        assert!(NorthEast.is_horizontal());
        assert!(!Up.is_horizontal());
        assert!(!SelfFace.is_horizontal());
    }
}
