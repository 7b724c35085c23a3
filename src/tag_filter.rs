//! Narrows a registry's tag list down to tags that look like newer releases
//! of the currently deployed tag.
//!
//! This is a heuristic. A candidate must have the same shape as the current
//! tag (every digit run may differ, everything else must match literally),
//! so `v1.2.3-rc1` only ever matches other `vX.Y.Z-rcN` tags and a switch
//! of separators (`1.2.3` vs `1-2-3`) never matches. Within a shape, semver
//! precedence decides when the current tag parses as semver, plain string
//! ordering otherwise.

use regex::Regex;
use semver::{Prerelease, Version};
use tracing::{debug, warn};

/// Returns the tags from `all_tags` that are newer than `current_tag`, in registry order.
pub fn newer_tags(all_tags: &[String], current_tag: &str) -> Vec<String> {
    let shape = match shape_pattern(current_tag) {
        Ok(shape) => shape,
        Err(e) => {
            warn!("Failed to build tag pattern for {}: {}", current_tag, e);
            return Vec::new();
        }
    };
    let same_shape = all_tags.iter().filter(|tag| shape.is_match(tag));

    let newer: Vec<String> = match parse_version(current_tag) {
        Some(current) => same_shape
            .filter(|tag| {
                parse_version(tag)
                    .is_some_and(|version| precedence(&version) > precedence(&current))
            })
            .cloned()
            .collect(),
        None => {
            debug!(
                "Tag {} is not a semantic version, comparing tags lexicographically",
                current_tag
            );
            same_shape
                .filter(|tag| tag.as_str() > current_tag)
                .cloned()
                .collect()
        }
    };

    debug!(
        "{} of {} tags are newer than {}",
        newer.len(),
        all_tags.len(),
        current_tag
    );
    newer
}

/// Builds `^...$` where digit runs become `\d+` and everything else is literal.
fn shape_pattern(tag: &str) -> Result<Regex, regex::Error> {
    let mut pattern = String::from("^");
    let mut in_digits = false;
    for c in tag.chars() {
        if c.is_ascii_digit() {
            if !in_digits {
                pattern.push_str(r"\d+");
            }
            in_digits = true;
            continue;
        }
        in_digits = false;
        let mut buf = [0; 4];
        pattern.push_str(&regex::escape(c.encode_utf8(&mut buf)));
    }
    pattern.push('$');
    Regex::new(&pattern)
}

fn parse_version(tag: &str) -> Option<Version> {
    Version::parse(tag.strip_prefix('v').unwrap_or(tag)).ok()
}

/// Build metadata does not take part in precedence, unlike `Version`'s `Ord`.
fn precedence(version: &Version) -> (u64, u64, u64, &Prerelease) {
    (version.major, version.minor, version.patch, &version.pre)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(tags: &[&str]) -> Vec<String> {
        tags.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn test_empty_tag_list() {
        assert!(newer_tags(&[], "v1.0.0").is_empty());
        assert!(newer_tags(&[], "latest").is_empty());
    }

    #[test]
    fn test_newer_semver_tags() {
        let all = tags(&["v1.0.0", "v1.1.0", "v2.0.0"]);
        assert_eq!(newer_tags(&all, "v1.0.0"), tags(&["v1.1.0", "v2.0.0"]));
    }

    #[test]
    fn test_shape_mismatch_is_excluded() {
        let all = tags(&["v1.0.0", "abc", "v1.2.0"]);
        assert_eq!(newer_tags(&all, "v1.0.0"), tags(&["v1.2.0"]));
    }

    #[test]
    fn test_latest_only_matches_itself() {
        let all = tags(&["latest", "dev"]);
        assert!(newer_tags(&all, "latest").is_empty());
    }

    #[test]
    fn test_registry_order_is_kept() {
        let all = tags(&["v1.3.0", "latest", "v1.2.4", "v1.2.3", "v1.10.0"]);
        assert_eq!(
            newer_tags(&all, "v1.2.3"),
            tags(&["v1.3.0", "v1.2.4", "v1.10.0"])
        );
    }

    #[test]
    fn test_semver_precedence_not_string_order() {
        // "1.10.0" < "1.9.0" as strings
        let all = tags(&["1.9.0", "1.10.0", "1.8.9"]);
        assert_eq!(newer_tags(&all, "1.9.0"), tags(&["1.10.0"]));
    }

    #[test]
    fn test_build_metadata_is_ignored() {
        let all = tags(&["1.0.0+2", "1.0.1+1", "1.0.0+1"]);
        assert_eq!(newer_tags(&all, "1.0.0+1"), tags(&["1.0.1+1"]));
    }

    #[test]
    fn test_prerelease_tags_keep_their_shape() {
        let all = tags(&["v1.2.3-rc2", "v1.2.3", "v1.2.4-rc1", "v1.2.2-rc9"]);
        assert_eq!(
            newer_tags(&all, "v1.2.3-rc1"),
            tags(&["v1.2.3-rc2", "v1.2.4-rc1"])
        );
    }

    #[test]
    fn test_non_semver_current_tag_falls_back_to_string_order() {
        let all = tags(&["1.24", "1.25", "1.9", "2.0"]);
        assert_eq!(newer_tags(&all, "1.24"), tags(&["1.25", "1.9", "2.0"]));
    }

    #[test]
    fn test_dots_are_literal() {
        let all = tags(&["1x2x3", "1.2.4"]);
        assert_eq!(newer_tags(&all, "1.2.3"), tags(&["1.2.4"]));
    }

    #[test]
    fn test_shape_pattern() {
        let shape = shape_pattern("v1.20.3-alpine").unwrap();
        assert_eq!(shape.as_str(), r"^v\d+\.\d+\.\d+\-alpine$");
        assert!(shape.is_match("v2.0.10-alpine"));
        assert!(!shape.is_match("v2.0-alpine"));
        assert!(!shape.is_match("xv2.0.10-alpine"));
    }
}
