//! Key name to Linux input event code mapping
//!
//! Codes are from linux/input-event-codes.h. Only keys that make sense
//! as a dedicated push-to-talk key are supported; letter keys would
//! collide with normal typing.

/// Supported hotkeys, in the order shown by `taptype config`
pub const SUPPORTED_KEYS: [(&str, u16); 23] = [
    ("F1", 59),
    ("F2", 60),
    ("F3", 61),
    ("F4", 62),
    ("F5", 63),
    ("F6", 64),
    ("F7", 65),
    ("F8", 66),
    ("F9", 67),
    ("F10", 68),
    ("F11", 87),
    ("F12", 88),
    ("ScrollLock", 70),
    ("Pause", 119),
    ("Insert", 110),
    ("Home", 102),
    ("End", 107),
    ("PageUp", 104),
    ("PageDown", 109),
    ("NumpadAdd", 78),
    ("NumpadSubtract", 74),
    ("NumpadMultiply", 55),
    ("NumpadDivide", 98),
];

/// Look up the event code for a key name (case-insensitive)
pub fn key_code(name: &str) -> Option<u16> {
    SUPPORTED_KEYS
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, code)| *code)
}

/// Canonical name for an event code, if it is a supported hotkey
pub fn key_name(code: u16) -> Option<&'static str> {
    SUPPORTED_KEYS
        .iter()
        .find(|(_, c)| *c == code)
        .map(|(name, _)| *name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_code_lookup() {
        assert_eq!(key_code("F1"), Some(59));
        assert_eq!(key_code("f12"), Some(88));
        assert_eq!(key_code("scrolllock"), Some(70));
        assert_eq!(key_code("A"), None);
    }

    #[test]
    fn test_key_name_roundtrip() {
        for (name, code) in SUPPORTED_KEYS {
            assert_eq!(key_name(code), Some(name));
            assert_eq!(key_code(name), Some(code));
        }
    }

    #[test]
    fn test_unsupported_code() {
        // KEY_A
        assert_eq!(key_name(30), None);
    }
}
