//! Physical header pin → BCM GPIO number translation.
//!
//! The table matches the 40-pin Raspberry-Pi-compatible header used by the
//! target board revision. `ModuleConfig.pins` values are physical pin
//! numbers (what's silkscreened on the board); every other component calls
//! [`map_physical_to_gpio`] to get the real GPIO line before touching
//! `rppal::gpio`.

/// physical pin -> BCM GPIO number, or `None` for power/ground pins that
/// carry no GPIO function.
const TABLE: [(u8, Option<u8>); 40] = [
    (1, None),       // 3V3
    (2, None),       // 5V
    (3, Some(2)),
    (4, None),       // 5V
    (5, Some(3)),
    (6, None),       // GND
    (7, Some(4)),
    (8, Some(14)),
    (9, None),       // GND
    (10, Some(15)),
    (11, Some(17)),
    (12, Some(18)),
    (13, Some(27)),
    (14, None),      // GND
    (15, Some(22)),
    (16, Some(23)),
    (17, None),      // 3V3
    (18, Some(24)),
    (19, Some(10)),
    (20, None),      // GND
    (21, Some(9)),
    (22, Some(25)),
    (23, Some(11)),
    (24, Some(8)),
    (25, None),      // GND
    (26, Some(7)),
    (27, Some(0)),
    (28, Some(1)),
    (29, Some(5)),
    (30, None),      // GND
    (31, Some(6)),
    (32, Some(12)),
    (33, Some(13)),
    (34, None),      // GND
    (35, Some(19)),
    (36, Some(16)),
    (37, Some(26)),
    (38, Some(20)),
    (39, None),      // GND
    (40, Some(21)),
];

/// Translates a physical header pin number into a BCM GPIO number.
///
/// Returns `None` for unknown physical pins and for power/ground pins —
/// callers should treat both as a configuration error, not a panic.
pub fn map_physical_to_gpio(physical: u8) -> Option<u8> {
    TABLE.iter().find(|(p, _)| *p == physical).and_then(|(_, gpio)| *gpio)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_known_pins() {
        assert_eq!(map_physical_to_gpio(7), Some(4));
        assert_eq!(map_physical_to_gpio(40), Some(21));
    }

    #[test]
    fn rejects_power_and_ground_pins() {
        assert_eq!(map_physical_to_gpio(1), None);
        assert_eq!(map_physical_to_gpio(6), None);
    }

    #[test]
    fn rejects_out_of_range_pins() {
        assert_eq!(map_physical_to_gpio(41), None);
        assert_eq!(map_physical_to_gpio(0), None);
    }
}
