//! Type-safe wrappers for CSI parameters.
//!
//! These types provide compile-time safety for values that arrive as
//! strings in StorageClass parameters, volume contexts and volume handles.
//! Each implements `FromStr` for parsing at API boundaries.

use std::fmt::{self, Display};
use std::str::FromStr;

// ============================================================================
// VolumeHandle
// ============================================================================

/// Separator between the array volume id and the protocol tag in a CSI
/// volume handle.
pub const VOLUME_HANDLE_SEPARATOR: &str = "$$";

/// Compound volume handle of the form `<array-vol-id>$$<protocol>`.
///
/// The protocol tag routes the request to the matching storage engine; the
/// engine itself only ever sees the bare array volume id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeHandle {
    pub id: String,
    pub protocol: String,
}

impl Display for VolumeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.id, VOLUME_HANDLE_SEPARATOR, self.protocol)
    }
}

impl FromStr for VolumeHandle {
    type Err = VolumeHandleParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(VOLUME_HANDLE_SEPARATOR).collect();
        match parts.as_slice() {
            [id, protocol] if !id.is_empty() && !protocol.is_empty() => {
                Ok(VolumeHandle { id: id.to_string(), protocol: protocol.to_string() })
            }
            _ => Err(VolumeHandleParseError(s.to_string())),
        }
    }
}

/// Error returned when a volume handle does not carry exactly one `$$`.
#[derive(Debug, Clone)]
pub struct VolumeHandleParseError(String);

impl Display for VolumeHandleParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "volume id and storage protocol not found in handle '{}'", self.0)
    }
}

impl std::error::Error for VolumeHandleParseError {}

// ============================================================================
// UseChap
// ============================================================================

/// Requested CHAP posture for a volume, from the `useCHAP` context key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UseChap {
    /// No session authentication (default)
    #[default]
    None,
    /// Inbound CHAP only
    Chap,
    /// Inbound and outbound CHAP
    MutualChap,
}

impl UseChap {
    /// Whether session records need CHAP credentials applied.
    pub const fn session_enabled(self) -> bool {
        matches!(self, UseChap::Chap | UseChap::MutualChap)
    }

    /// The array-side security method this posture maps to.
    pub const fn security_method(self) -> &'static str {
        match self {
            UseChap::None => "NONE",
            UseChap::Chap => "CHAP",
            UseChap::MutualChap => "MUTUAL_CHAP",
        }
    }
}

impl Display for UseChap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UseChap::None => write!(f, "none"),
            UseChap::Chap => write!(f, "chap"),
            UseChap::MutualChap => write!(f, "mutual_chap"),
        }
    }
}

impl FromStr for UseChap {
    type Err = UseChapParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "" | "none" => Ok(UseChap::None),
            "chap" => Ok(UseChap::Chap),
            "mutual_chap" => Ok(UseChap::MutualChap),
            _ => Err(UseChapParseError(s.to_string())),
        }
    }
}

/// Error returned when parsing an invalid CHAP posture.
#[derive(Debug, Clone)]
pub struct UseChapParseError(String);

impl Display for UseChapParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown useCHAP value '{}': expected 'none', 'chap' or 'mutual_chap'", self.0)
    }
}

impl std::error::Error for UseChapParseError {}

// ============================================================================
// YAML booleans
// ============================================================================

const YAML_TRUE: [&str; 11] =
    ["y", "Y", "yes", "Yes", "YES", "true", "True", "TRUE", "on", "On", "ON"];
const YAML_FALSE: [&str; 11] =
    ["n", "N", "no", "No", "NO", "false", "False", "FALSE", "off", "Off", "OFF"];

/// Many strings are true in YAML. Convert to boolean.
/// Ref: https://yaml.org/type/bool.html
pub fn yaml_bool(value: &str) -> Result<bool, YamlBoolError> {
    if YAML_TRUE.contains(&value) {
        return Ok(true);
    }
    if YAML_FALSE.contains(&value) {
        return Ok(false);
    }
    Err(YamlBoolError(value.to_string()))
}

/// Error returned for a string that is not a YAML boolean.
#[derive(Debug, Clone)]
pub struct YamlBoolError(String);

impl Display for YamlBoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{}' is not a valid YAML boolean", self.0)
    }
}

impl std::error::Error for YamlBoolError {}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_volume_handle_from_str() {
        let handle: VolumeHandle = "93642189$$iscsi".parse().unwrap();
        assert_eq!(handle.id, "93642189");
        assert_eq!(handle.protocol, "iscsi");
    }

    #[test]
    fn test_volume_handle_round_trip() {
        let handle = VolumeHandle { id: "93642189".into(), protocol: "iscsi".into() };
        assert_eq!(handle.to_string().parse::<VolumeHandle>().unwrap(), handle);
    }

    #[test]
    fn test_volume_handle_invalid() {
        assert!("bogus".parse::<VolumeHandle>().is_err());
        assert!("".parse::<VolumeHandle>().is_err());
        assert!("$$iscsi".parse::<VolumeHandle>().is_err());
        assert!("93642189$$".parse::<VolumeHandle>().is_err());
        assert!("a$$b$$c".parse::<VolumeHandle>().is_err());
    }

    #[test]
    fn test_use_chap_from_str() {
        assert_eq!("none".parse::<UseChap>().unwrap(), UseChap::None);
        assert_eq!("".parse::<UseChap>().unwrap(), UseChap::None);
        assert_eq!("chap".parse::<UseChap>().unwrap(), UseChap::Chap);
        assert_eq!("CHAP".parse::<UseChap>().unwrap(), UseChap::Chap);
        assert_eq!("mutual_chap".parse::<UseChap>().unwrap(), UseChap::MutualChap);
        assert!("sometimes".parse::<UseChap>().is_err());
    }

    #[test]
    fn test_use_chap_session_enabled() {
        assert!(!UseChap::None.session_enabled());
        assert!(UseChap::Chap.session_enabled());
        assert!(UseChap::MutualChap.session_enabled());
    }

    #[test]
    fn test_use_chap_security_method() {
        assert_eq!(UseChap::None.security_method(), "NONE");
        assert_eq!(UseChap::Chap.security_method(), "CHAP");
        assert_eq!(UseChap::MutualChap.security_method(), "MUTUAL_CHAP");
    }

    #[test]
    fn test_yaml_bool_truthiness() {
        for value in ["y", "Yes", "TRUE", "on"] {
            assert!(yaml_bool(value).unwrap(), "{value} should be true");
        }
        for value in ["n", "No", "FALSE", "off"] {
            assert!(!yaml_bool(value).unwrap(), "{value} should be false");
        }
        assert!(yaml_bool("maybe").is_err());
        assert!(yaml_bool("1").is_err());
    }
}
