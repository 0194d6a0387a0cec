//! Version range constraints for the `version_matches` value matcher.
//!
//! Syntax:
//! - exact: `1.2.3` (missing components are zero: `1.2` == `1.2.0`)
//! - prefix: `1.2+`, `1.+`, `+`
//! - interval: `[1.0,2.0)`, `(1.0,]`, `[,2.0]`

use std::fmt;
use std::str::FromStr;

use semver::Version;

use crate::error::{AutopilotError, Result};

/// A parsed version constraint. Parsing happens once; matching is cheap.
#[derive(Debug, Clone)]
pub struct VersionConstraint {
    raw: String,
    kind: ConstraintKind,
}

#[derive(Debug, Clone)]
enum ConstraintKind {
    Exact(Version),
    Prefix(Vec<u64>),
    Range {
        lower: Option<Bound>,
        upper: Option<Bound>,
    },
}

#[derive(Debug, Clone)]
struct Bound {
    version: Version,
    inclusive: bool,
}

impl VersionConstraint {
    pub fn parse(constraint: &str) -> Result<Self> {
        let raw = constraint.trim();
        if raw.is_empty() {
            return Err(AutopilotError::construction("empty version constraint"));
        }

        let kind = if raw.starts_with('[') || raw.starts_with('(') {
            parse_range(raw)?
        } else if let Some(prefix) = raw.strip_suffix('+') {
            parse_prefix(prefix, raw)?
        } else {
            ConstraintKind::Exact(parse_version(raw).map_err(|e| {
                AutopilotError::construction(format!("invalid version constraint '{raw}': {e}"))
            })?)
        };

        Ok(Self {
            raw: raw.to_string(),
            kind,
        })
    }

    /// Check a candidate version string. Unparseable candidates never match.
    pub fn matches(&self, candidate: &str) -> bool {
        let Ok(version) = parse_version(candidate) else {
            return false;
        };
        match &self.kind {
            ConstraintKind::Exact(expected) => version == *expected,
            ConstraintKind::Prefix(components) => {
                let actual = [version.major, version.minor, version.patch];
                components.iter().zip(actual.iter()).all(|(a, b)| a == b)
            }
            ConstraintKind::Range { lower, upper } => {
                let above = lower.as_ref().is_none_or(|b| {
                    if b.inclusive {
                        version >= b.version
                    } else {
                        version > b.version
                    }
                });
                let below = upper.as_ref().is_none_or(|b| {
                    if b.inclusive {
                        version <= b.version
                    } else {
                        version < b.version
                    }
                });
                above && below
            }
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

fn parse_prefix(prefix: &str, raw: &str) -> Result<ConstraintKind> {
    let trimmed = prefix.trim_end_matches('.');
    if trimmed.is_empty() {
        return Ok(ConstraintKind::Prefix(Vec::new()));
    }
    let components = trimmed
        .split('.')
        .map(|part| part.trim().parse::<u64>())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| AutopilotError::construction(format!("invalid version prefix '{raw}': {e}")))?;
    if components.len() > 3 {
        return Err(AutopilotError::construction(format!(
            "version prefix '{raw}' has more than three components"
        )));
    }
    Ok(ConstraintKind::Prefix(components))
}

fn parse_range(raw: &str) -> Result<ConstraintKind> {
    let invalid = |why: &str| AutopilotError::construction(format!("invalid version range '{raw}': {why}"));

    let lower_inclusive = raw.starts_with('[');
    let upper_inclusive = match raw.chars().last() {
        Some(']') => true,
        Some(')') => false,
        _ => return Err(invalid("missing closing bracket")),
    };
    let inner = &raw[1..raw.len() - 1];
    let parts: Vec<&str> = inner.split(',').map(str::trim).collect();
    if parts.len() != 2 {
        return Err(invalid("expected exactly one ','"));
    }

    let bound = |text: &str, inclusive: bool| -> Result<Option<Bound>> {
        if text.is_empty() {
            return Ok(None);
        }
        let version = parse_version(text).map_err(|e| invalid(&e.to_string()))?;
        Ok(Some(Bound { version, inclusive }))
    };
    let lower = bound(parts[0], lower_inclusive)?;
    let upper = bound(parts[1], upper_inclusive)?;

    match (&lower, &upper) {
        (None, None) => return Err(invalid("at least one bound is required")),
        (Some(l), Some(u)) if l.version > u.version => {
            return Err(invalid("lower bound exceeds upper bound"));
        }
        _ => {}
    }

    Ok(ConstraintKind::Range { lower, upper })
}

/// Lenient version parsing: pads `1` and `1.2` to three components.
fn parse_version(text: &str) -> std::result::Result<Version, semver::Error> {
    let text = text.trim();
    let split = text.find(['-', '+']).unwrap_or(text.len());
    let (core, rest) = text.split_at(split);
    let padding = match core.matches('.').count() {
        0 => ".0.0",
        1 => ".0",
        _ => "",
    };
    Version::parse(&format!("{core}{padding}{rest}"))
}

impl fmt::Display for VersionConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for VersionConstraint {
    type Err = AutopilotError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl PartialEq for VersionConstraint {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact() {
        let c = VersionConstraint::parse("1.2").unwrap();
        assert!(c.matches("1.2.0"));
        assert!(c.matches("1.2"));
        assert!(!c.matches("1.2.1"));
    }

    #[test]
    fn test_prefix() {
        let c = VersionConstraint::parse("2.1+").unwrap();
        assert!(c.matches("2.1.0"));
        assert!(c.matches("2.1.9"));
        assert!(!c.matches("2.2.0"));

        let any = VersionConstraint::parse("+").unwrap();
        assert!(any.matches("0.0.1"));
        assert!(!any.matches("not a version"));
    }

    #[test]
    fn test_ranges() {
        let c = VersionConstraint::parse("[1.0, 2.0)").unwrap();
        assert!(c.matches("1.0.0"));
        assert!(c.matches("1.9.9"));
        assert!(!c.matches("2.0.0"));
        assert!(!c.matches("0.9"));

        let open = VersionConstraint::parse("(1.0,]").unwrap();
        assert!(!open.matches("1.0"));
        assert!(open.matches("15.0.3"));

        let upper = VersionConstraint::parse("[,3.0]").unwrap();
        assert!(upper.matches("3.0.0"));
        assert!(!upper.matches("3.0.1"));
    }

    #[test]
    fn test_prerelease_precedence() {
        let c = VersionConstraint::parse("[1.0.0,)").unwrap();
        assert!(!c.matches("1.0.0-beta.1"));
        assert!(c.matches("1.0.1-rc.1"));
    }

    #[test]
    fn test_invalid_syntax_fails_construction() {
        for bad in ["", "abc", "[1.0", "[2.0,1.0]", "[,]", "1.2.3.4+", "[1,2,3]"] {
            let err = VersionConstraint::parse(bad).unwrap_err();
            assert!(
                matches!(err, AutopilotError::Construction(_)),
                "expected construction error for {bad:?}"
            );
        }
    }
}
