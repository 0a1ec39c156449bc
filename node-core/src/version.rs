//! Firmware version triples and the "is newer" comparison used by automatic updates.

use core::fmt;

use log::warn;
use winnow::ascii::dec_uint;
use winnow::combinator::opt;
use winnow::prelude::*;
use winnow::token::one_of;

/// Semantic-style `major.minor.patch` firmware version.
///
/// Ordering is lexicographic over the three components, so equal versions are
/// never considered newer than each other.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FirmwareVersion {
    pub major: u16,
    pub minor: u16,
    pub patch: u16,
}

/// Reasons a version string could not be parsed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VersionParseError {
    Empty,
    Malformed,
}

impl fmt::Display for VersionParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionParseError::Empty => f.write_str("version string is empty"),
            VersionParseError::Malformed => f.write_str("expected <major>.<minor>.<patch>"),
        }
    }
}

impl FirmwareVersion {
    #[must_use]
    pub const fn new(major: u16, minor: u16, patch: u16) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Parses `1.2.3` or `v1.2.3`, ignoring surrounding whitespace.
    ///
    /// Trailing text such as pre-release suffixes is rejected.
    pub fn parse(text: &str) -> Result<Self, VersionParseError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(VersionParseError::Empty);
        }

        version_triple
            .parse(trimmed)
            .map_err(|_| VersionParseError::Malformed)
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

fn version_triple(input: &mut &str) -> winnow::Result<FirmwareVersion> {
    (opt(one_of(['v', 'V'])), dec_uint, '.', dec_uint, '.', dec_uint)
        .map(|(_, major, _, minor, _, patch)| FirmwareVersion::new(major, minor, patch))
        .parse_next(input)
}

/// Returns `true` when `target` is strictly newer than `current`.
///
/// An empty or unparseable string on either side is never newer.
#[must_use]
pub fn is_newer(target: &str, current: &str) -> bool {
    match (FirmwareVersion::parse(target), FirmwareVersion::parse(current)) {
        (Ok(target), Ok(current)) => target > current,
        (Err(VersionParseError::Empty), _) => false,
        (Err(err), _) => {
            warn!("ignoring target version {target:?}: {err}");
            false
        }
        (_, Err(err)) => {
            warn!("ignoring current version {current:?}: {err}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_and_prefixed_versions() {
        assert_eq!(
            FirmwareVersion::parse("1.2.3").expect("plain version"),
            FirmwareVersion::new(1, 2, 3)
        );
        assert_eq!(
            FirmwareVersion::parse(" v10.0.7 ").expect("prefixed version"),
            FirmwareVersion::new(10, 0, 7)
        );
    }

    #[test]
    fn rejects_partial_and_suffixed_versions() {
        assert_eq!(
            FirmwareVersion::parse(""),
            Err(VersionParseError::Empty)
        );
        assert_eq!(
            FirmwareVersion::parse("1.2"),
            Err(VersionParseError::Malformed)
        );
        assert_eq!(
            FirmwareVersion::parse("1.2.3-beta"),
            Err(VersionParseError::Malformed)
        );
        assert_eq!(
            FirmwareVersion::parse("1.x.3"),
            Err(VersionParseError::Malformed)
        );
    }

    #[test]
    fn newer_compares_component_wise() {
        assert!(is_newer("1.2.0", "1.1.9"));
        assert!(is_newer("2.0.0", "1.9.9"));
        assert!(is_newer("1.1.10", "1.1.9"));
        assert!(!is_newer("1.1.0", "1.1.0"));
        assert!(!is_newer("1.0.9", "1.1.0"));
    }

    #[test]
    fn unset_target_is_never_newer() {
        assert!(!is_newer("", "1.0.0"));
        assert!(!is_newer("garbage", "1.0.0"));
        assert!(!is_newer("1.0.0", ""));
    }

    #[test]
    fn display_renders_dotted_triple() {
        let version = FirmwareVersion::new(3, 14, 1);
        let mut rendered: heapless::String<16> = heapless::String::new();
        core::fmt::write(&mut rendered, format_args!("{version}")).expect("fits");
        assert_eq!(rendered.as_str(), "3.14.1");
    }
}
