// [libs/domain/models/src/binary_pattern.rs]
//! Binary-version patterns used to match agents to job binary requirements.
//!
//! A pattern is one of `default`, `M.x`, `M.m.x`, `M.m.p` or `M.m.p-suffix`.
//! The wildcard placeholder `x` is matched case-insensitively; a suffix is
//! delimited from the patch component by `-` or `+`.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PatternError {
    #[error("empty version pattern")]
    Empty,
    #[error("malformed version pattern: {0}")]
    Malformed(String),
    #[error("no binary satisfies pattern {0}")]
    NoMatch(String),
}

/// A concrete cracker release version, e.g. `7.1.2` or `7.1.2-rc1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinaryVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    pub suffix: Option<String>,
}

impl BinaryVersion {
    pub fn parse(raw: &str) -> Result<Self, PatternError> {
        match BinaryPattern::parse(raw)? {
            BinaryPattern::Exact(version) => Ok(version),
            other => Err(PatternError::Malformed(format!(
                "expected a concrete version, got pattern {other}"
            ))),
        }
    }

    /// Ordering key for resolution: release versions outrank pre-releases at
    /// the same numeric triple, matching semantic-version precedence.
    fn precedence(&self) -> (u32, u32, u32, bool, String) {
        (
            self.major,
            self.minor,
            self.patch,
            self.suffix.is_none(),
            // Inverted lexicographic tiebreak is not needed; plain suffix
            // comparison keeps resolution deterministic.
            self.suffix.clone().unwrap_or_default(),
        )
    }
}

impl fmt::Display for BinaryVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.suffix {
            Some(suffix) => write!(f, "{}.{}.{}-{}", self.major, self.minor, self.patch, suffix),
            None => write!(f, "{}.{}.{}", self.major, self.minor, self.patch),
        }
    }
}

/// A version requirement attached to an agent or a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryPattern {
    /// No constraint; any binary satisfies it.
    Default,
    /// `M.x`: any release within one major line.
    MajorWild(u32),
    /// `M.m.x`: any release within one minor line.
    MinorWild(u32, u32),
    /// A single concrete release, optionally suffix-qualified.
    Exact(BinaryVersion),
}

/// A binary the server can serve, with its parsed concrete version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinaryRelease {
    pub id: i64,
    pub version: BinaryVersion,
    pub archive_name: String,
}

impl BinaryPattern {
    pub fn parse(raw: &str) -> Result<Self, PatternError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(PatternError::Empty);
        }
        if trimmed.eq_ignore_ascii_case("default") {
            return Ok(BinaryPattern::Default);
        }

        let segments: Vec<&str> = trimmed.splitn(3, '.').collect();
        match segments.as_slice() {
            [major, wild] if is_wildcard(wild) => {
                Ok(BinaryPattern::MajorWild(parse_component(major, trimmed)?))
            }
            [major, minor, wild] if is_wildcard(wild) => Ok(BinaryPattern::MinorWild(
                parse_component(major, trimmed)?,
                parse_component(minor, trimmed)?,
            )),
            [major, minor, patch_and_suffix] => {
                let (patch_raw, suffix) = split_suffix(patch_and_suffix);
                Ok(BinaryPattern::Exact(BinaryVersion {
                    major: parse_component(major, trimmed)?,
                    minor: parse_component(minor, trimmed)?,
                    patch: parse_component(patch_raw, trimmed)?,
                    suffix,
                }))
            }
            _ => Err(PatternError::Malformed(trimmed.to_string())),
        }
    }

    /// Whether a concrete version satisfies this pattern.
    pub fn matches(&self, version: &BinaryVersion) -> bool {
        match self {
            BinaryPattern::Default => true,
            BinaryPattern::MajorWild(major) => version.major == *major,
            BinaryPattern::MinorWild(major, minor) => {
                version.major == *major && version.minor == *minor
            }
            BinaryPattern::Exact(wanted) => {
                let numbers_equal = wanted.major == version.major
                    && wanted.minor == version.minor
                    && wanted.patch == version.patch;
                match &wanted.suffix {
                    None => numbers_equal,
                    Some(suffix) => numbers_equal && version.suffix.as_deref() == Some(suffix),
                }
            }
        }
    }

    /// Whether the set of versions the agent can run intersects the set the
    /// job accepts.
    pub fn is_compatible(agent: &BinaryPattern, job: &BinaryPattern) -> bool {
        use BinaryPattern::*;
        match (agent, job) {
            (Default, _) | (_, Default) => true,
            (MajorWild(a), MajorWild(b)) => a == b,
            (MajorWild(a), MinorWild(b, _)) | (MinorWild(b, _), MajorWild(a)) => a == b,
            (MinorWild(a_major, a_minor), MinorWild(b_major, b_minor)) => {
                a_major == b_major && a_minor == b_minor
            }
            (Exact(version), wild @ (MajorWild(_) | MinorWild(..)))
            | (wild @ (MajorWild(_) | MinorWild(..)), Exact(version)) => wild.matches(version),
            (Exact(agent_version), job_pattern @ Exact(_)) => job_pattern.matches(agent_version),
        }
    }

    /// Picks the newest available binary satisfying this pattern.
    ///
    /// # Errors
    /// `PatternError::NoMatch` when no release satisfies the pattern.
    pub fn resolve<'a>(
        &self,
        available: &'a [BinaryRelease],
    ) -> Result<&'a BinaryRelease, PatternError> {
        available
            .iter()
            .filter(|release| self.matches(&release.version))
            .max_by_key(|release| release.version.precedence())
            .ok_or_else(|| PatternError::NoMatch(self.to_string()))
    }
}

impl fmt::Display for BinaryPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BinaryPattern::Default => write!(f, "default"),
            BinaryPattern::MajorWild(major) => write!(f, "{major}.x"),
            BinaryPattern::MinorWild(major, minor) => write!(f, "{major}.{minor}.x"),
            BinaryPattern::Exact(version) => write!(f, "{version}"),
        }
    }
}

fn is_wildcard(segment: &str) -> bool {
    segment.eq_ignore_ascii_case("x")
}

fn parse_component(segment: &str, whole: &str) -> Result<u32, PatternError> {
    segment
        .parse::<u32>()
        .map_err(|_| PatternError::Malformed(whole.to_string()))
}

fn split_suffix(segment: &str) -> (&str, Option<String>) {
    match segment.find(['-', '+']) {
        Some(index) => (
            &segment[..index],
            Some(segment[index + 1..].to_string()),
        ),
        None => (segment, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pat(raw: &str) -> BinaryPattern {
        BinaryPattern::parse(raw).expect("pattern parses")
    }

    fn ver(raw: &str) -> BinaryVersion {
        BinaryVersion::parse(raw).expect("version parses")
    }

    #[test]
    fn parses_every_variant() {
        assert_eq!(pat("default"), BinaryPattern::Default);
        assert_eq!(pat("DEFAULT"), BinaryPattern::Default);
        assert_eq!(pat("7.x"), BinaryPattern::MajorWild(7));
        assert_eq!(pat("7.X"), BinaryPattern::MajorWild(7));
        assert_eq!(pat("7.1.x"), BinaryPattern::MinorWild(7, 1));
        assert_eq!(pat("7.1.2"), BinaryPattern::Exact(ver("7.1.2")));
        assert_eq!(
            pat("7.1.2-rc1"),
            BinaryPattern::Exact(BinaryVersion {
                major: 7,
                minor: 1,
                patch: 2,
                suffix: Some("rc1".to_string())
            })
        );
        // `+` delimits a suffix the same way `-` does.
        assert_eq!(pat("7.1.2+cuda"), pat("7.1.2-cuda"));
    }

    #[test]
    fn rejects_malformed_input() {
        assert!(BinaryPattern::parse("").is_err());
        assert!(BinaryPattern::parse("7").is_err());
        assert!(BinaryPattern::parse("7.").is_err());
        assert!(BinaryPattern::parse("x.1.2").is_err());
        assert!(BinaryPattern::parse("7.one.2").is_err());
    }

    #[test]
    fn display_parse_round_trip() {
        for raw in ["default", "7.x", "7.1.x", "7.1.2", "7.1.2-rc1"] {
            let parsed = pat(raw);
            assert_eq!(pat(&parsed.to_string()), parsed, "round trip for {raw}");
        }
    }

    #[test]
    fn default_is_compatible_with_everything() {
        for other in ["default", "6.x", "6.2.x", "6.2.6", "6.2.6-rc1"] {
            assert!(BinaryPattern::is_compatible(&pat("default"), &pat(other)));
            assert!(BinaryPattern::is_compatible(&pat(other), &pat("default")));
        }
    }

    #[test]
    fn wildcard_compatibility_uses_shared_prefix() {
        assert!(BinaryPattern::is_compatible(&pat("7.x"), &pat("7.1.x")));
        assert!(BinaryPattern::is_compatible(&pat("7.1.x"), &pat("7.x")));
        assert!(!BinaryPattern::is_compatible(&pat("7.x"), &pat("6.1.x")));
        assert!(!BinaryPattern::is_compatible(&pat("7.1.x"), &pat("7.2.x")));
    }

    #[test]
    fn exact_must_fall_inside_wildcard_range() {
        assert!(BinaryPattern::is_compatible(&pat("7.1.2"), &pat("7.x")));
        assert!(BinaryPattern::is_compatible(&pat("7.x"), &pat("7.1.2")));
        assert!(!BinaryPattern::is_compatible(&pat("6.2.6"), &pat("7.x")));
        assert!(!BinaryPattern::is_compatible(&pat("7.2.0"), &pat("7.1.x")));
    }

    #[test]
    fn exact_suffix_rule_follows_the_job_side() {
        // Job without suffix accepts any same-numbered agent build.
        assert!(BinaryPattern::is_compatible(&pat("7.1.2-rc1"), &pat("7.1.2")));
        // Job with suffix demands the exact build.
        assert!(!BinaryPattern::is_compatible(&pat("7.1.2"), &pat("7.1.2-rc1")));
        assert!(BinaryPattern::is_compatible(&pat("7.1.2-rc1"), &pat("7.1.2-rc1")));
        assert!(!BinaryPattern::is_compatible(&pat("7.1.2-rc1"), &pat("7.1.2-rc2")));
    }

    #[test]
    fn compatibility_matches_version_set_intersection() {
        // Over suffix-free patterns, is_compatible agrees exactly with
        // "some concrete version satisfies both" and is therefore symmetric.
        let universe: Vec<BinaryVersion> = [
            "6.2.5", "6.2.6", "7.0.0", "7.1.1", "7.1.2", "7.2.0", "8.0.0",
        ]
        .iter()
        .map(|raw| ver(raw))
        .collect();
        let patterns = ["default", "6.x", "7.x", "6.2.x", "7.1.x", "7.2.x", "6.2.6", "7.1.2"];

        for a in &patterns {
            for b in &patterns {
                let a_pat = pat(a);
                let b_pat = pat(b);
                let intersects = universe.iter().any(|v| a_pat.matches(v) && b_pat.matches(v));
                assert_eq!(
                    BinaryPattern::is_compatible(&a_pat, &b_pat),
                    intersects,
                    "{a} vs {b}"
                );
                assert_eq!(
                    BinaryPattern::is_compatible(&a_pat, &b_pat),
                    BinaryPattern::is_compatible(&b_pat, &a_pat),
                    "symmetry for {a} vs {b}"
                );
            }
        }
    }

    #[test]
    fn resolve_prefers_newest_then_release_over_prerelease() {
        let releases = vec![
            BinaryRelease { id: 1, version: ver("6.2.6"), archive_name: "hashcat-6.2.6.tar.gz".into() },
            BinaryRelease { id: 2, version: ver("7.1.1"), archive_name: "hashcat-7.1.1.tar.gz".into() },
            BinaryRelease { id: 3, version: ver("7.1.2-rc1"), archive_name: "hashcat-7.1.2rc1.tar.gz".into() },
            BinaryRelease { id: 4, version: ver("7.1.2"), archive_name: "hashcat-7.1.2.tar.gz".into() },
        ];

        assert_eq!(pat("default").resolve(&releases).unwrap().id, 4);
        assert_eq!(pat("7.x").resolve(&releases).unwrap().id, 4);
        assert_eq!(pat("6.x").resolve(&releases).unwrap().id, 1);
        assert_eq!(pat("7.1.2-rc1").resolve(&releases).unwrap().id, 3);
        assert!(pat("8.x").resolve(&releases).is_err());
    }
}
