use std::cmp::Ordering;

/// Game build version as published by the version service ("1.4.2",
/// "v2.0.0-beta.3", "0.9b").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    base: Vec<Segment>,
    tag: Option<Vec<Segment>>,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum Segment {
    Numeric(u64),
    Text(String),
}

impl Version {
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        let trimmed = trimmed
            .strip_prefix('v')
            .or_else(|| trimmed.strip_prefix('V'))
            .unwrap_or(trimmed);

        let (base, tag) = match trimmed.split_once('-') {
            Some((base, tag)) => (base, Some(tag)),
            None => (trimmed, None),
        };

        Self {
            base: segments(base),
            tag: tag.map(segments),
        }
    }
}

/// Split on separators, then on digit/non-digit boundaries: "2b.10" ->
/// [2, "b", 10]
fn segments(s: &str) -> Vec<Segment> {
    let mut out = Vec::new();
    for piece in s.split(['.', '_', '+']) {
        let mut current = String::new();
        let mut numeric = false;
        for c in piece.chars() {
            let digit = c.is_ascii_digit();
            if !current.is_empty() && digit != numeric {
                out.push(to_segment(&current, numeric));
                current.clear();
            }
            numeric = digit;
            current.push(c);
        }
        if !current.is_empty() {
            out.push(to_segment(&current, numeric));
        }
    }
    out
}

fn to_segment(s: &str, numeric: bool) -> Segment {
    if numeric {
        // Absurdly long digit runs saturate rather than fail
        Segment::Numeric(s.parse().unwrap_or(u64::MAX))
    } else {
        Segment::Text(s.to_ascii_lowercase())
    }
}

fn compare_segments(a: &[Segment], b: &[Segment]) -> Ordering {
    let zero = Segment::Numeric(0);
    let len = a.len().max(b.len());
    for i in 0..len {
        // Missing trailing segments count as zero: 1.2 == 1.2.0
        let left = a.get(i).unwrap_or(&zero);
        let right = b.get(i).unwrap_or(&zero);
        match left.cmp(right) {
            Ordering::Equal => continue,
            ord => return ord,
        }
    }
    Ordering::Equal
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        match compare_segments(&self.base, &other.base) {
            Ordering::Equal => {}
            ord => return ord,
        }

        // A pre-release sorts before its release
        match (&self.tag, &other.tag) {
            (None, None) => Ordering::Equal,
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (Some(a), Some(b)) => compare_segments(a, b),
        }
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

pub fn compare_versions(a: &str, b: &str) -> Ordering {
    Version::parse(a).cmp(&Version::parse(b))
}

/// Whether `latest` should replace `installed`
pub fn is_newer(latest: &str, installed: &str) -> bool {
    compare_versions(latest, installed) == Ordering::Greater
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_ordering() {
        assert_eq!(compare_versions("1.0.0", "1.0.1"), Ordering::Less);
        assert_eq!(compare_versions("1.10.0", "1.9.3"), Ordering::Greater);
        assert_eq!(compare_versions("v2.0", "2.0.0"), Ordering::Equal);

        // Pre-release tags
        assert_eq!(compare_versions("1.0.0-beta.1", "1.0.0"), Ordering::Less);
        assert_eq!(compare_versions("1.0.0-beta.1", "1.0.0-beta.2"), Ordering::Less);
        assert_eq!(compare_versions("1.0.0-alpha.3", "1.0.0-beta.1"), Ordering::Less);

        // Letter suffixes
        assert_eq!(compare_versions("0.9b", "0.9a"), Ordering::Greater);
        assert_eq!(compare_versions("0.9", "0.9a"), Ordering::Less);
    }

    #[test]
    fn newer_only_when_strictly_greater() {
        assert!(is_newer("1.2.1", "1.2.0"));
        assert!(!is_newer("1.2.0", "1.2.0"));
        assert!(!is_newer("1.1.9", "1.2.0"));
    }
}
