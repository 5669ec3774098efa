use std::{cmp::Ordering, collections::HashMap};

use serde::{Deserialize, Serialize};

/// Split an image reference into (repository, tag). The tag separator is the
/// first `:` after the last `/`, so registry ports do not confuse the split.
pub fn split_repo_tag(image: &str) -> (&str, Option<&str>) {
    let name_start = image.rfind('/').map(|i| i + 1).unwrap_or(0);
    match image[name_start..].find(':') {
        Some(i) => {
            let colon = name_start + i;
            (&image[..colon], Some(&image[colon + 1..]))
        }
        None => (image, None),
    }
}

pub fn image_repo(image: &str) -> &str {
    split_repo_tag(image).0
}

pub fn image_tag(image: &str) -> Option<&str> {
    split_repo_tag(image).1
}

/// The application-name portion of an image reference: the last path
/// segment of the repository, lowercased, without the tag.
pub fn app_name(image: &str) -> String {
    let repo = image_repo(image);
    let name = repo.rsplit('/').next().unwrap_or(repo);
    name.to_lowercase()
}

/// Whether an image reference is an opaque image id rather than a
/// `repo[:tag]` name: a hex run of at least 12 chars, optionally
/// `sha256:`-prefixed, with no repository path.
pub fn is_image_id(image: &str) -> bool {
    let hex = image.strip_prefix("sha256:").unwrap_or(image);
    hex.len() >= 12 && !hex.contains('/') && !hex.contains(':') && hex.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Glob-style match: `*` matches any run of characters, everything else is
/// literal. Patterns without `*` compare by equality.
pub fn pattern_matches(pattern: &str, value: &str) -> bool {
    if !pattern.contains('*') {
        return pattern == value;
    }
    let body = pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    match regex::Regex::new(&format!("^{body}$")) {
        Ok(re) => re.is_match(value),
        Err(_) => false,
    }
}

/// Numeric-aware tag comparison: dot-separated segments compare as integers
/// where both sides parse, falling back to lexicographic comparison.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let mut left = a.split('.');
    let mut right = b.split('.');
    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(l), Some(r)) => {
                let ord = match (l.parse::<u64>(), r.parse::<u64>()) {
                    (Ok(ln), Ok(rn)) => ln.cmp(&rn),
                    _ => l.cmp(r),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}

/// One update policy entry: which image it applies to and which source
/// versions move to which target version.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ImageUpdate {
    pub name: String,
    pub from: Option<String>,
    pub to: Option<String>,
}

impl ImageUpdate {
    /// Whether a version pattern matches a container's image reference.
    ///
    /// `None`/`"*"` match everything. Containers running by opaque image id
    /// cannot be matched by a tag pattern; a non-wildcard pattern compares
    /// against the id itself.
    pub fn matches_version(pattern: Option<&str>, image: &str, image_id: Option<&str>) -> bool {
        let pattern = match pattern {
            None | Some("*") => return true,
            Some(p) => p,
        };
        if is_image_id(image) {
            let id = image_id.unwrap_or(image);
            return pattern_matches(pattern, id);
        }
        let tag = image_tag(image).unwrap_or("latest");
        pattern_matches(pattern, tag)
    }

    pub fn matches_from(&self, image: &str, image_id: Option<&str>) -> bool {
        Self::matches_version(self.from.as_deref(), image, image_id)
    }

    /// A target of `None`/`"*"` means "update to the latest discovered tag".
    pub fn to_latest(&self) -> bool {
        matches!(self.to.as_deref(), None | Some("*"))
    }
}

/// The update policy for one job invocation: an ordered list of entries,
/// with exact names indexed for O(1) lookup and wildcard names scanned in
/// declaration order.
#[derive(Debug, Clone, Default)]
pub struct ImagesForUpdate {
    entries: Vec<ImageUpdate>,
    exact: HashMap<String, usize>,
}

impl ImagesForUpdate {
    pub fn new(entries: Vec<ImageUpdate>) -> Self {
        let mut exact = HashMap::new();
        for (i, entry) in entries.iter().enumerate() {
            if !entry.name.contains('*') {
                exact.entry(entry.name.clone()).or_insert(i);
            }
        }
        Self { entries, exact }
    }

    pub fn entries(&self) -> &[ImageUpdate] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up the policy entry for a container image. Exact lookups go by
    /// image id first, then by name-without-tag; wildcard entries are
    /// scanned in declaration order, first match wins.
    pub fn find_image(&self, name: Option<&str>, image_id: Option<&str>) -> Option<&ImageUpdate> {
        if let Some(id) = image_id {
            if let Some(&i) = self.exact.get(id) {
                return Some(&self.entries[i]);
            }
        }
        let repo = name.map(image_repo);
        if let Some(repo) = repo {
            if let Some(&i) = self.exact.get(repo) {
                return Some(&self.entries[i]);
            }
        }
        self.entries
            .iter()
            .filter(|e| e.name.contains('*'))
            .find(|e| {
                repo.map(|r| pattern_matches(&e.name, r)).unwrap_or(false)
                    || image_id
                        .map(|id| pattern_matches(&e.name, id))
                        .unwrap_or(false)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_repo_tag() {
        assert_eq!(split_repo_tag("registry/app:1.0"), ("registry/app", Some("1.0")));
        assert_eq!(split_repo_tag("app"), ("app", None));
        assert_eq!(
            split_repo_tag("reg.example.com:5000/team/app:2.3"),
            ("reg.example.com:5000/team/app", Some("2.3"))
        );
        assert_eq!(
            split_repo_tag("reg.example.com:5000/team/app"),
            ("reg.example.com:5000/team/app", None)
        );
    }

    #[test]
    fn test_app_name() {
        assert_eq!(app_name("registry/App:1.0"), "app");
        assert_eq!(app_name("reg.example.com:5000/team/Web"), "web");
        assert_eq!(app_name("redis"), "redis");
    }

    #[test]
    fn test_is_image_id() {
        assert!(is_image_id("0123456789abcdef"));
        assert!(is_image_id("sha256:0123456789abcdef"));
        assert!(!is_image_id("registry/app:1.0"));
        assert!(!is_image_id("redis"));
        assert!(!is_image_id("deadbeef"));
    }

    #[test]
    fn test_version_matching() {
        assert!(ImageUpdate::matches_version(
            Some("*-stable"),
            "registry/app:2.3-stable",
            None
        ));
        assert!(!ImageUpdate::matches_version(
            Some("2.3"),
            "registry/app:2.3-stable",
            None
        ));
        assert!(ImageUpdate::matches_version(Some("*"), "whatever", Some("abc")));
        assert!(ImageUpdate::matches_version(None, "registry/app:1.0", None));
        // id-based containers match only by exact id
        assert!(ImageUpdate::matches_version(
            Some("0123456789abcdef"),
            "0123456789abcdef",
            None
        ));
        assert!(!ImageUpdate::matches_version(
            Some("1.0"),
            "0123456789abcdef",
            Some("0123456789abcdef")
        ));
    }

    #[test]
    fn test_find_image_exact_before_wildcard() {
        let images = ImagesForUpdate::new(vec![
            ImageUpdate {
                name: "reg/*".to_string(),
                from: None,
                to: Some("9.9".to_string()),
            },
            ImageUpdate {
                name: "reg/app".to_string(),
                from: None,
                to: Some("2.0".to_string()),
            },
        ]);
        let hit = images.find_image(Some("reg/app:1.0"), None).unwrap();
        assert_eq!(hit.to.as_deref(), Some("2.0"));
        // wildcard scan in declaration order for everything else
        let hit = images.find_image(Some("reg/other:1.0"), None).unwrap();
        assert_eq!(hit.to.as_deref(), Some("9.9"));
        assert!(images.find_image(Some("elsewhere/app:1.0"), None).is_none());
    }

    #[test]
    fn test_compare_versions() {
        assert_eq!(compare_versions("1.2", "1.10"), Ordering::Less);
        assert_eq!(compare_versions("2.0", "2.0"), Ordering::Equal);
        assert_eq!(compare_versions("2.0.1", "2.0"), Ordering::Greater);
        assert_eq!(compare_versions("1.0-beta", "1.0-alpha"), Ordering::Greater);
    }
}
