//! POV-Codec für Hat-Switches
//!
//! Ein POV wird in zwei Sichten gehalten: als Winkel in Grad (`-1` = zentriert)
//! und als vier Richtungs-Flags. Winkel → Flags ist total, Flags → Winkel kennt
//! nur die acht Einzel- bzw. Nachbarpaar-Kombinationen; alles andere gilt als
//! zentriert.

use serde::{Deserialize, Serialize};

/// Winkel eines zentrierten Hats
pub const CENTERED: f32 = -1.0;

/// Rohwert, den ein Bridge-Gerät für einen zentrierten Hat sendet
pub const RAW_CENTERED: u16 = u16::MAX;

/// Richtungs-Flags eines Hats in der Reihenfolge Up/Right/Down/Left
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PovDirections {
    pub up: bool,
    pub right: bool,
    pub down: bool,
    pub left: bool,
}

impl PovDirections {
    pub const fn new(up: bool, right: bool, down: bool, left: bool) -> Self {
        Self {
            up,
            right,
            down,
            left,
        }
    }

    fn from_bits(bits: u8) -> Self {
        Self {
            up: bits & 0b0001 != 0,
            right: bits & 0b0010 != 0,
            down: bits & 0b0100 != 0,
            left: bits & 0b1000 != 0,
        }
    }
}

/// Ordnet `angle` einem von acht 45°-Sektoren zu und liefert dessen Flags.
///
/// Negative Winkel (zentriert) ergeben keine Richtung, Winkel ab 360 werden umgebrochen.
pub fn angle_to_buttons(angle: f32) -> PovDirections {
    if !(angle >= 0.0) {
        return PovDirections::default();
    }

    let sector = (angle.rem_euclid(360.0) / 45.0).floor() as u32 % 8;
    let half = sector / 2;
    let bits = ((1u32 << half) | (((sector % 2) << (half + 1)) % 15)) & 0b1111;

    PovDirections::from_bits(bits as u8)
}

/// Bildet die acht erreichbaren Flag-Kombinationen auf ihren Winkel ab.
///
/// Gegenüberliegende Richtungen, drei oder mehr Flags oder gar kein Flag ergeben zentriert.
pub fn buttons_to_angle(dirs: PovDirections) -> f32 {
    match (dirs.up, dirs.right, dirs.down, dirs.left) {
        (true, false, false, false) => 0.0,
        (true, true, false, false) => 45.0,
        (false, true, false, false) => 90.0,
        (false, true, true, false) => 135.0,
        (false, false, true, false) => 180.0,
        (false, false, true, true) => 225.0,
        (false, false, false, true) => 270.0,
        (true, false, false, true) => 315.0,
        _ => CENTERED,
    }
}

/// Hat-Zustand mit Winkel und abgeleiteten Flags
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pov {
    angle: f32,
    dirs: PovDirections,
}

impl Default for Pov {
    fn default() -> Self {
        Self {
            angle: CENTERED,
            dirs: PovDirections::default(),
        }
    }
}

impl Pov {
    pub fn from_angle(angle: f32) -> Self {
        let mut pov = Self::default();
        pov.set_angle(angle);
        pov
    }

    pub fn from_directions(dirs: PovDirections) -> Self {
        let mut pov = Self::default();
        pov.set_directions(dirs);
        pov
    }

    /// Dekodiert einen Bridge-Wert in Hundertstelgrad (`0xFFFF` = zentriert)
    pub fn from_centidegrees(raw: u16) -> Self {
        if raw == RAW_CENTERED {
            Self::default()
        } else {
            Self::from_angle(f32::from(raw) / 100.0)
        }
    }

    /// Dekodiert ein HID-Hat-Nibble (0..=7 im Uhrzeigersinn ab Norden, ab 8 zentriert)
    pub fn from_hat(hat: u8) -> Self {
        if hat < 8 {
            Self::from_angle(f32::from(hat) * 45.0)
        } else {
            Self::default()
        }
    }

    pub fn angle(&self) -> f32 {
        self.angle
    }

    pub fn directions(&self) -> PovDirections {
        self.dirs
    }

    pub fn is_centered(&self) -> bool {
        self.angle < 0.0
    }

    /// Setzt den Winkel und berechnet die Flags neu. Nicht-endliche oder negative Werte zentrieren.
    pub fn set_angle(&mut self, angle: f32) {
        self.angle = if angle.is_finite() && angle >= 0.0 {
            angle.rem_euclid(360.0)
        } else {
            CENTERED
        };
        self.dirs = angle_to_buttons(self.angle);
    }

    /// Übernimmt die Flags unverändert und leitet den Winkel daraus ab.
    pub fn set_directions(&mut self, dirs: PovDirections) {
        self.dirs = dirs;
        self.angle = buttons_to_angle(dirs);
    }

    pub fn up(&self) -> bool {
        self.dirs.up
    }

    pub fn right(&self) -> bool {
        self.dirs.right
    }

    pub fn down(&self) -> bool {
        self.dirs.down
    }

    pub fn left(&self) -> bool {
        self.dirs.left
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const COMPASS: [f32; 8] = [0.0, 45.0, 90.0, 135.0, 180.0, 225.0, 270.0, 315.0];

    #[test]
    fn compass_angles_are_fixed_points() {
        for angle in COMPASS {
            assert_eq!(buttons_to_angle(angle_to_buttons(angle)), angle);
        }
    }

    #[test]
    fn centered_maps_to_no_direction_and_back() {
        assert_eq!(angle_to_buttons(CENTERED), PovDirections::default());
        assert_eq!(buttons_to_angle(angle_to_buttons(CENTERED)), CENTERED);
    }

    #[test]
    fn sector_patterns_match_compass() {
        assert_eq!(angle_to_buttons(0.0), PovDirections::new(true, false, false, false));
        assert_eq!(angle_to_buttons(45.0), PovDirections::new(true, true, false, false));
        assert_eq!(angle_to_buttons(90.0), PovDirections::new(false, true, false, false));
        assert_eq!(angle_to_buttons(135.0), PovDirections::new(false, true, true, false));
        assert_eq!(angle_to_buttons(180.0), PovDirections::new(false, false, true, false));
        assert_eq!(angle_to_buttons(225.0), PovDirections::new(false, false, true, true));
        assert_eq!(angle_to_buttons(270.0), PovDirections::new(false, false, false, true));
        assert_eq!(angle_to_buttons(315.0), PovDirections::new(true, false, false, true));
        // innerhalb eines Sektors wird abgerundet
        assert_eq!(angle_to_buttons(44.9), angle_to_buttons(0.0));
    }

    #[test]
    fn unreachable_combinations_are_centered() {
        let opposite_vertical = PovDirections::new(true, false, true, false);
        let opposite_horizontal = PovDirections::new(false, true, false, true);
        let three = PovDirections::new(true, true, true, false);
        let all = PovDirections::new(true, true, true, true);

        for dirs in [opposite_vertical, opposite_horizontal, three, all, PovDirections::default()] {
            assert_eq!(buttons_to_angle(dirs), CENTERED);
        }
    }

    #[test]
    fn exactly_eight_of_sixteen_combinations_have_an_angle() {
        let reachable = (0u8..16)
            .map(PovDirections::from_bits)
            .filter(|d| buttons_to_angle(*d) >= 0.0)
            .count();
        assert_eq!(reachable, 8);
    }

    #[test]
    fn raw_centered_value_decodes_to_minus_one() {
        let pov = Pov::from_centidegrees(0xFFFF);
        assert_eq!(pov.angle(), -1.0);
        assert!(!pov.up() && !pov.right() && !pov.down() && !pov.left());
    }

    #[test]
    fn centidegrees_and_hat_decode() {
        assert_eq!(Pov::from_centidegrees(9000).angle(), 90.0);
        assert!(Pov::from_centidegrees(9000).right());
        assert_eq!(Pov::from_hat(3).angle(), 135.0);
        assert!(Pov::from_hat(8).is_centered());
    }

    #[test]
    fn setting_directions_derives_angle() {
        let pov = Pov::from_directions(PovDirections::new(false, false, true, true));
        assert_eq!(pov.angle(), 225.0);

        let pov = Pov::from_directions(PovDirections::new(true, false, true, false));
        assert!(pov.is_centered());
        // Flags bleiben erhalten, auch ohne gültigen Winkel
        assert!(pov.up() && pov.down());
    }

    proptest! {
        #[test]
        fn conversion_pair_is_idempotent(angle in -10.0f32..720.0) {
            let once = buttons_to_angle(angle_to_buttons(angle));
            let twice = buttons_to_angle(angle_to_buttons(once));
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn flags_pair_is_idempotent(bits in 0u8..16) {
            let dirs = PovDirections::from_bits(bits);
            let once = angle_to_buttons(buttons_to_angle(dirs));
            let twice = angle_to_buttons(buttons_to_angle(once));
            prop_assert_eq!(once, twice);
        }
    }
}
