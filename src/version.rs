//! Firmware / hardware version numbers as reported by the headset.
//!
//! The device reports versions as ASCII text (`"1.7.4"`), firmware images
//! carry them in their file names (`mm-ota-i5-1_7_4.bin`). Both go through
//! [`FirmwareVersion::parse`].

use std::fmt;

use serde::{Deserialize, Serialize};

/// A `major.minor.fix` version triple.
///
/// Ordering is componentwise (major first). A string with fewer than three
/// numeric components parses to `0.0.0` rather than failing, which makes an
/// unknown version compare lower than any real one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FirmwareVersion {
    pub major: u16,
    pub minor: u16,
    pub fix: u16,
}

impl FirmwareVersion {
    pub const fn new(major: u16, minor: u16, fix: u16) -> Self {
        Self { major, minor, fix }
    }

    /// Parse `x.y.z`, `x_y_z` or `x-y-z`. Surrounding text such as a leading
    /// `v` or trailing NUL padding is tolerated as long as three numbers remain.
    pub fn parse(text: &str) -> Self {
        let parts: Vec<u16> = text
            .split(['.', '_', '-'])
            .map(|p| p.trim_matches(|c: char| !c.is_ascii_digit()))
            .filter(|p| !p.is_empty())
            .filter_map(|p| p.parse().ok())
            .collect();

        match parts.as_slice() {
            [major, minor, fix, ..] => Self::new(*major, *minor, *fix),
            _ => Self::default(),
        }
    }

    /// Single comparable integer: `major * 10000 + minor * 100 + fix`.
    pub fn value(&self) -> u32 {
        self.major as u32 * 10_000 + self.minor as u32 * 100 + self.fix as u32
    }

    pub fn is_unknown(&self) -> bool {
        *self == Self::default()
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.fix)
    }
}

// ── Firmware file names ───────────────────────────────────────────────────────

/// Extract the version encoded in a firmware binary name.
///
/// `mm-ota-i3-1_6_7.bin` → `Some(1.6.7)` when `prefix` is `"mm-ota-i3-"`.
/// Returns `None` when the name does not start with `prefix`, is not a `.bin`,
/// or does not carry three version components.
pub fn version_from_binary_name(file_name: &str, prefix: &str) -> Option<FirmwareVersion> {
    let rest = file_name.strip_prefix(prefix)?;
    let stem = rest.strip_suffix(".bin")?;
    if stem.split('_').count() != 3 || !stem.split('_').all(|p| p.chars().all(|c| c.is_ascii_digit()) && !p.is_empty()) {
        return None;
    }
    Some(FirmwareVersion::parse(stem))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_all_separators() {
        assert_eq!(FirmwareVersion::parse("1.6.7"), FirmwareVersion::new(1, 6, 7));
        assert_eq!(FirmwareVersion::parse("1_7_1"), FirmwareVersion::new(1, 7, 1));
        assert_eq!(FirmwareVersion::parse("2-0-10"), FirmwareVersion::new(2, 0, 10));
    }

    #[test]
    fn short_or_garbage_is_unknown() {
        assert!(FirmwareVersion::parse("1.6").is_unknown());
        assert!(FirmwareVersion::parse("").is_unknown());
        assert!(FirmwareVersion::parse("abc").is_unknown());
    }

    #[test]
    fn tolerates_padding() {
        assert_eq!(FirmwareVersion::parse("v1.7.4\0\0"), FirmwareVersion::new(1, 7, 4));
    }

    #[test]
    fn ordering_is_componentwise() {
        let a = FirmwareVersion::parse("1.6.7");
        let b = FirmwareVersion::parse("1.7.1");
        let c = FirmwareVersion::parse("1.10.0");
        assert!(a < b);
        assert!(b < c);
        assert_eq!(c.value(), 11_000);
    }

    #[test]
    fn binary_names() {
        assert_eq!(
            version_from_binary_name("mm-ota-i5-1_7_4.bin", "mm-ota-i5-"),
            Some(FirmwareVersion::new(1, 7, 4))
        );
        assert_eq!(version_from_binary_name("mm-ota-i5-1_7_4.bin", "mm-ota-i3-"), None);
        assert_eq!(version_from_binary_name("mm-ota-1_7.bin", "mm-ota-"), None);
        assert_eq!(version_from_binary_name("mm-ota-1_7_4.hex", "mm-ota-"), None);
    }
}
