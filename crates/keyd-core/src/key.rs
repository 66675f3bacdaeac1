// Keyd Key Codes
// Internal 8-bit key space, name table, and mouse-button folding

use std::collections::HashMap;
use std::sync::OnceLock;

/// Synthetic key delivered to a keyboard when a bound pointer device
/// scrolls. It exists so oneshot and similar transient state is cleared by
/// scroll activity; it is never written to the virtual device.
pub const EXTERNAL_MOUSE_BUTTON: u8 = 0xfd;

/// First internal code used for folded mouse buttons.
const BUTTON_BASE: u8 = 0xf0;

/// BTN_LEFT, the first of the eight folded evdev button codes.
const BTN_FIRST: u16 = 0x110;

const NUM_BUTTONS: u16 = 8;

/// Highest evdev key code passed through unchanged.
const PASSTHROUGH_MAX: u16 = 0xef;

/// Map an evdev key code into the internal 8-bit space.
///
/// Codes up to 0xef map through unchanged; BTN_LEFT..=BTN_TASK fold into
/// 0xf0..=0xf7. Anything else (joystick buttons, multimedia codes above the
/// 8-bit range) has no internal representation and is dropped by the caller.
pub fn code_from_evdev(code: u16) -> Option<u8> {
    if code <= PASSTHROUGH_MAX {
        Some(code as u8)
    } else if (BTN_FIRST..BTN_FIRST + NUM_BUTTONS).contains(&code) {
        Some(BUTTON_BASE + (code - BTN_FIRST) as u8)
    } else {
        None
    }
}

/// Map an internal code back to the evdev code emitted on the virtual
/// device. `None` for purely synthetic codes such as
/// [`EXTERNAL_MOUSE_BUTTON`].
pub fn evdev_from_code(code: u8) -> Option<u16> {
    if code <= PASSTHROUGH_MAX as u8 {
        Some(code as u16)
    } else if (BUTTON_BASE..BUTTON_BASE + NUM_BUTTONS as u8).contains(&code) {
        Some(BTN_FIRST + (code - BUTTON_BASE) as u16)
    } else {
        None
    }
}

// Names follow input-event-codes.h, lowercased and with the KEY_/BTN_
// prefix stripped; mouse buttons use their folded internal codes.
static NAMES: &[(&str, u8)] = &[
    ("esc", 1),
    ("1", 2),
    ("2", 3),
    ("3", 4),
    ("4", 5),
    ("5", 6),
    ("6", 7),
    ("7", 8),
    ("8", 9),
    ("9", 10),
    ("0", 11),
    ("minus", 12),
    ("equal", 13),
    ("backspace", 14),
    ("tab", 15),
    ("q", 16),
    ("w", 17),
    ("e", 18),
    ("r", 19),
    ("t", 20),
    ("y", 21),
    ("u", 22),
    ("i", 23),
    ("o", 24),
    ("p", 25),
    ("leftbrace", 26),
    ("rightbrace", 27),
    ("enter", 28),
    ("leftctrl", 29),
    ("a", 30),
    ("s", 31),
    ("d", 32),
    ("f", 33),
    ("g", 34),
    ("h", 35),
    ("j", 36),
    ("k", 37),
    ("l", 38),
    ("semicolon", 39),
    ("apostrophe", 40),
    ("grave", 41),
    ("leftshift", 42),
    ("backslash", 43),
    ("z", 44),
    ("x", 45),
    ("c", 46),
    ("v", 47),
    ("b", 48),
    ("n", 49),
    ("m", 50),
    ("comma", 51),
    ("dot", 52),
    ("slash", 53),
    ("rightshift", 54),
    ("kpasterisk", 55),
    ("leftalt", 56),
    ("space", 57),
    ("capslock", 58),
    ("f1", 59),
    ("f2", 60),
    ("f3", 61),
    ("f4", 62),
    ("f5", 63),
    ("f6", 64),
    ("f7", 65),
    ("f8", 66),
    ("f9", 67),
    ("f10", 68),
    ("numlock", 69),
    ("scrolllock", 70),
    ("kp7", 71),
    ("kp8", 72),
    ("kp9", 73),
    ("kpminus", 74),
    ("kp4", 75),
    ("kp5", 76),
    ("kp6", 77),
    ("kpplus", 78),
    ("kp1", 79),
    ("kp2", 80),
    ("kp3", 81),
    ("kp0", 82),
    ("kpdot", 83),
    ("102nd", 86),
    ("f11", 87),
    ("f12", 88),
    ("kpenter", 96),
    ("rightctrl", 97),
    ("kpslash", 98),
    ("sysrq", 99),
    ("rightalt", 100),
    ("home", 102),
    ("up", 103),
    ("pageup", 104),
    ("left", 105),
    ("right", 106),
    ("end", 107),
    ("down", 108),
    ("pagedown", 109),
    ("insert", 110),
    ("delete", 111),
    ("mute", 113),
    ("volumedown", 114),
    ("volumeup", 115),
    ("power", 116),
    ("kpequal", 117),
    ("pause", 119),
    ("kpcomma", 121),
    ("leftmeta", 125),
    ("rightmeta", 126),
    ("compose", 127),
    ("stop", 128),
    ("again", 129),
    ("props", 130),
    ("undo", 131),
    ("front", 132),
    ("copy", 133),
    ("open", 134),
    ("paste", 135),
    ("find", 136),
    ("cut", 137),
    ("help", 138),
    ("nextsong", 163),
    ("playpause", 164),
    ("previoussong", 165),
    ("f13", 183),
    ("f14", 184),
    ("f15", 185),
    ("f16", 186),
    ("f17", 187),
    ("f18", 188),
    ("f19", 189),
    ("f20", 190),
    ("f21", 191),
    ("f22", 192),
    ("f23", 193),
    ("f24", 194),
    ("leftmouse", 0xf0),
    ("rightmouse", 0xf1),
    ("middlemouse", 0xf2),
    ("sidemouse", 0xf3),
    ("extramouse", 0xf4),
    ("forwardmouse", 0xf5),
    ("backmouse", 0xf6),
    ("taskmouse", 0xf7),
];

fn name_map() -> &'static HashMap<&'static str, u8> {
    static MAP: OnceLock<HashMap<&'static str, u8>> = OnceLock::new();
    MAP.get_or_init(|| NAMES.iter().copied().collect())
}

/// Resolve a key name from a configuration file to its internal code.
/// Lookup is case-insensitive.
pub fn lookup_keycode(name: &str) -> Option<u8> {
    let lowered = name.to_ascii_lowercase();
    name_map().get(lowered.as_str()).copied()
}

/// Display name for an internal code, if it has one.
pub fn keycode_name(code: u8) -> Option<&'static str> {
    NAMES.iter().find(|(_, c)| *c == code).map(|(n, _)| *n)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_common_keys() {
        assert_eq!(lookup_keycode("a"), Some(30));
        assert_eq!(lookup_keycode("capslock"), Some(58));
        assert_eq!(lookup_keycode("esc"), Some(1));
        assert_eq!(lookup_keycode("ESC"), Some(1));
        assert_eq!(lookup_keycode("no-such-key"), None);
    }

    #[test]
    fn test_keycode_name_round_trip() {
        for (name, code) in NAMES {
            assert_eq!(lookup_keycode(name), Some(*code));
            assert_eq!(keycode_name(*code), Some(*name));
        }
    }

    #[test]
    fn test_evdev_passthrough_codes() {
        assert_eq!(code_from_evdev(30), Some(30));
        assert_eq!(code_from_evdev(0xef), Some(0xef));
        assert_eq!(evdev_from_code(30), Some(30));
    }

    #[test]
    fn test_mouse_button_folding() {
        // BTN_LEFT folds to the first button slot and unfolds back.
        assert_eq!(code_from_evdev(0x110), Some(0xf0));
        assert_eq!(code_from_evdev(0x117), Some(0xf7));
        assert_eq!(evdev_from_code(0xf0), Some(0x110));
        assert_eq!(evdev_from_code(0xf7), Some(0x117));
    }

    #[test]
    fn test_unmappable_codes() {
        // Joystick buttons have no internal slot.
        assert_eq!(code_from_evdev(0x120), None);
        // The external mouse button is synthetic only.
        assert_eq!(evdev_from_code(EXTERNAL_MOUSE_BUTTON), None);
    }
}
