// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Mount point and node addressing
//!
//! A [`MountPoint`] names one filesystem instance. Platform mount points are
//! absolute host directories (`file:/tmp/`); archive mount points embed the node
//! path of the archive file inside their parent filesystem and are terminated by
//! `!/` (`zip:file:/tmp/outer.zip!/`). A [`NodePath`] is a mount point plus a
//! normalized [`NodeName`].

use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::Arc;

/// Separator between segments of a node name.
pub const SEPARATOR: char = '/';

/// Terminator of an archive mount point.
pub const MOUNT_POINT_SUFFIX: &str = "!/";

/// Scheme of the platform filesystem.
pub const FILE_SCHEME: &str = "file";

/// Addressing errors
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("{reason}: {offending:?} in {input:?}")]
    Malformed {
        input: String,
        offending: String,
        reason: &'static str,
    },
}

impl AddressError {
    pub fn malformed(input: &str, offending: &str, reason: &'static str) -> Self {
        AddressError::Malformed {
            input: input.to_string(),
            offending: offending.to_string(),
            reason,
        }
    }
}

pub type AddressResult<T> = Result<T, AddressError>;

/// URI scheme selecting the driver of a mount point.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Scheme(String);

impl Scheme {
    pub fn new(scheme: &str) -> AddressResult<Self> {
        let lower = scheme.to_ascii_lowercase();
        let mut chars = lower.chars();
        match chars.next() {
            Some(c) if c.is_ascii_alphabetic() => {}
            _ => return Err(AddressError::malformed(scheme, scheme, "scheme must start with a letter")),
        }
        if let Some(bad) = chars.find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))) {
            return Err(AddressError::malformed(scheme, &bad.to_string(), "illegal scheme character"));
        }
        Ok(Self(lower))
    }

    pub fn file() -> Self {
        Self(FILE_SCHEME.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_platform(&self) -> bool {
        self.0 == FILE_SCHEME
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Scheme {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Scheme::new(s)
    }
}

/// Normalized relative path of a node within one mounted filesystem.
///
/// Never has a leading or trailing separator, empty or `.` segments; `..` is
/// resolved and must not escape the root. The root is the empty name.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct NodeName(String);

impl NodeName {
    pub fn root() -> Self {
        Self(String::new())
    }

    pub fn new(name: &str) -> AddressResult<Self> {
        let mut segments: Vec<&str> = Vec::new();
        for segment in name.split(SEPARATOR) {
            match segment {
                "" | "." => {}
                ".." => {
                    if segments.pop().is_none() {
                        return Err(AddressError::malformed(name, "..", "name escapes the root"));
                    }
                }
                s if s.ends_with('!') => {
                    return Err(AddressError::malformed(name, s, "segment must not end with '!'"));
                }
                s if s.contains('\0') => {
                    return Err(AddressError::malformed(name, s, "segment contains NUL"));
                }
                s => segments.push(s),
            }
        }
        Ok(Self(segments.join("/")))
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The enclosing directory name, `None` for the root.
    pub fn parent(&self) -> Option<NodeName> {
        if self.is_root() {
            return None;
        }
        match self.0.rfind(SEPARATOR) {
            Some(idx) => Some(Self(self.0[..idx].to_string())),
            None => Some(Self::root()),
        }
    }

    /// Last segment, empty for the root.
    pub fn base_name(&self) -> &str {
        match self.0.rfind(SEPARATOR) {
            Some(idx) => &self.0[idx + 1..],
            None => &self.0,
        }
    }

    pub fn join(&self, child: &str) -> AddressResult<NodeName> {
        if self.is_root() {
            NodeName::new(child)
        } else {
            NodeName::new(&format!("{}/{}", self.0, child))
        }
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split(SEPARATOR).filter(|s| !s.is_empty())
    }

    /// Whether `self` is a direct child of `dir`.
    pub fn is_child_of(&self, dir: &NodeName) -> bool {
        !self.is_root() && self.parent().as_ref() == Some(dir)
    }
}

impl fmt::Display for NodeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for NodeName {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NodeName::new(s)
    }
}

/// Canonical address of one filesystem instance.
#[derive(Clone)]
pub struct MountPoint {
    scheme: Scheme,
    /// Absolute directory for platform mount points, entry name in the parent otherwise.
    path: String,
    parent: Option<Arc<MountPoint>>,
    canonical: String,
}

impl MountPoint {
    /// Platform mount point for an absolute host directory.
    pub fn platform(dir: &str) -> AddressResult<Self> {
        let path = normalize_absolute(dir, true)?;
        Ok(Self {
            scheme: Scheme::file(),
            canonical: format!("{}:{}", FILE_SCHEME, path),
            path,
            parent: None,
        })
    }

    /// Archive mount point for the archive file `entry` inside `parent`.
    pub fn nested(scheme: Scheme, parent: Arc<MountPoint>, entry: &NodeName) -> AddressResult<Self> {
        if scheme.is_platform() {
            return Err(AddressError::malformed(scheme.as_str(), scheme.as_str(), "platform scheme cannot be nested"));
        }
        if entry.is_root() {
            return Err(AddressError::malformed(&parent.canonical, "", "archive entry name must not be empty"));
        }
        // A platform parent is always the directory holding the archive file.
        let (parent, entry) = match entry.parent() {
            Some(dir) if parent.is_platform() && !dir.is_root() => {
                let dir = MountPoint::platform(&format!("{}{}", parent.path, dir))?;
                (Arc::new(dir), NodeName(entry.base_name().to_string()))
            }
            _ => (parent, entry.clone()),
        };
        let canonical = format!("{}:{}{}{}", scheme, parent.canonical, entry, MOUNT_POINT_SUFFIX);
        Ok(Self {
            scheme,
            path: entry.as_str().to_string(),
            parent: Some(parent),
            canonical,
        })
    }

    /// Parses and canonicalizes a mount point string.
    pub fn parse(input: &str) -> AddressResult<Self> {
        let (scheme, rest) = split_scheme(input)?;
        if scheme.is_platform() {
            if rest.contains(MOUNT_POINT_SUFFIX) {
                return Err(AddressError::malformed(input, MOUNT_POINT_SUFFIX, "platform path contains '!/'"));
            }
            return MountPoint::platform(rest);
        }
        let inner = rest
            .strip_suffix(MOUNT_POINT_SUFFIX)
            .ok_or_else(|| AddressError::malformed(input, rest, "archive mount point must end with '!/'"))?;
        let parent_path = NodePath::parse(inner)?;
        MountPoint::nested(scheme, parent_path.mount_point, &parent_path.name)
    }

    pub fn scheme(&self) -> &Scheme {
        &self.scheme
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn parent(&self) -> Option<&Arc<MountPoint>> {
        self.parent.as_ref()
    }

    pub fn is_platform(&self) -> bool {
        self.parent.is_none()
    }

    /// Number of enclosing mount points.
    pub fn depth(&self) -> usize {
        let mut depth = 0;
        let mut current = self.parent.as_ref();
        while let Some(mp) = current {
            depth += 1;
            current = mp.parent.as_ref();
        }
        depth
    }

    /// Canonical strings of this mount point and its ancestors, outermost first.
    pub fn hierarchy(&self) -> Vec<String> {
        let mut chain = vec![self.canonical.clone()];
        let mut current = self.parent.as_ref();
        while let Some(mp) = current {
            chain.push(mp.canonical.clone());
            current = mp.parent.as_ref();
        }
        chain.reverse();
        chain
    }

    /// Whether `other` is a (transitive) ancestor of this mount point.
    pub fn is_descendant_of(&self, other: &MountPoint) -> bool {
        let mut current = self.parent.as_ref();
        while let Some(mp) = current {
            if mp.as_ref() == other {
                return true;
            }
            current = mp.parent.as_ref();
        }
        false
    }

    /// Node path of the archive file backing this mount point.
    pub fn parent_entry(&self) -> Option<NodePath> {
        self.parent.as_ref().map(|parent| NodePath {
            mount_point: Arc::clone(parent),
            name: NodeName(self.path.clone()),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.canonical
    }
}

impl PartialEq for MountPoint {
    fn eq(&self, other: &Self) -> bool {
        self.canonical == other.canonical
    }
}

impl Eq for MountPoint {}

impl Hash for MountPoint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical.hash(state);
    }
}

impl fmt::Display for MountPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical)
    }
}

impl fmt::Debug for MountPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MountPoint({})", self.canonical)
    }
}

impl FromStr for MountPoint {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MountPoint::parse(s)
    }
}

/// Fully qualified address of a node.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct NodePath {
    pub mount_point: Arc<MountPoint>,
    pub name: NodeName,
}

impl NodePath {
    pub fn new(mount_point: Arc<MountPoint>, name: NodeName) -> Self {
        Self { mount_point, name }
    }

    /// Parses a node path, splitting at the last `!/` for archives or at the
    /// last separator for platform paths.
    pub fn parse(input: &str) -> AddressResult<Self> {
        if let Some(idx) = input.rfind(MOUNT_POINT_SUFFIX) {
            let split = idx + MOUNT_POINT_SUFFIX.len();
            let mount_point = MountPoint::parse(&input[..split])?;
            let name = NodeName::new(&input[split..])?;
            return Ok(Self::new(Arc::new(mount_point), name));
        }
        let (scheme, rest) = split_scheme(input)?;
        if !scheme.is_platform() {
            return Err(AddressError::malformed(input, scheme.as_str(), "archive node path lacks '!/'"));
        }
        let trailing = rest.ends_with(SEPARATOR);
        let normalized = normalize_absolute(rest, false)?;
        if trailing || normalized == "/" {
            return Ok(Self::new(Arc::new(MountPoint::platform(&normalized)?), NodeName::root()));
        }
        let idx = normalized.rfind(SEPARATOR).unwrap_or(0);
        let mount_point = MountPoint::platform(&normalized[..=idx])?;
        let name = NodeName::new(&normalized[idx + 1..])?;
        Ok(Self::new(Arc::new(mount_point), name))
    }

    /// Number of mount points in the chain, including the platform.
    pub fn levels(&self) -> usize {
        self.mount_point.depth() + 1
    }
}

impl fmt::Display for NodePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.mount_point, self.name)
    }
}

impl fmt::Debug for NodePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodePath({})", self)
    }
}

fn split_scheme(input: &str) -> AddressResult<(Scheme, &str)> {
    let idx = input
        .find(':')
        .ok_or_else(|| AddressError::malformed(input, input, "missing scheme"))?;
    let scheme = Scheme::new(&input[..idx])?;
    Ok((scheme, &input[idx + 1..]))
}

/// Normalizes an absolute slash-separated path; directories keep a trailing `/`.
fn normalize_absolute(path: &str, as_dir: bool) -> AddressResult<String> {
    if !path.starts_with(SEPARATOR) {
        return Err(AddressError::malformed(path, path, "path must be absolute"));
    }
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split(SEPARATOR) {
        match segment {
            "" | "." => {}
            ".." => {
                if segments.pop().is_none() {
                    return Err(AddressError::malformed(path, "..", "path escapes the root"));
                }
            }
            s => segments.push(s),
        }
    }
    let mut normalized = String::from("/");
    normalized.push_str(&segments.join("/"));
    if as_dir && !normalized.ends_with(SEPARATOR) {
        normalized.push(SEPARATOR);
    }
    Ok(normalized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn node_names_are_normalized() {
        assert_eq!(NodeName::new("a//b/./c/").unwrap().as_str(), "a/b/c");
        assert_eq!(NodeName::new("/a/b/../c").unwrap().as_str(), "a/c");
        assert!(NodeName::new("").unwrap().is_root());
        assert!(NodeName::new("a/../..").is_err());
    }

    #[test]
    fn node_name_parent_and_base() {
        let name = NodeName::new("dir/sub/file.txt").unwrap();
        assert_eq!(name.base_name(), "file.txt");
        assert_eq!(name.parent().unwrap().as_str(), "dir/sub");
        assert_eq!(NodeName::new("top").unwrap().parent(), Some(NodeName::root()));
        assert_eq!(NodeName::root().parent(), None);
        assert!(name.is_child_of(&NodeName::new("dir/sub").unwrap()));
    }

    #[test]
    fn platform_mount_point_is_canonical() {
        let mp = MountPoint::parse("file:/tmp//work/./").unwrap();
        assert_eq!(mp.to_string(), "file:/tmp/work/");
        assert!(mp.is_platform());
        assert_eq!(mp.depth(), 0);
    }

    #[test]
    fn nested_mount_point_round_trips() {
        let input = "tar.gz:zip:file:/tmp/outer.zip!/inner.tar.gz!/";
        let mp = MountPoint::parse(input).unwrap();
        assert_eq!(mp.to_string(), input);
        assert_eq!(mp.scheme().as_str(), "tar.gz");
        assert_eq!(mp.depth(), 2);
        assert_eq!(
            mp.hierarchy(),
            vec![
                "file:/tmp/".to_string(),
                "zip:file:/tmp/outer.zip!/".to_string(),
                input.to_string()
            ]
        );
        let entry = mp.parent_entry().unwrap();
        assert_eq!(entry.name.as_str(), "inner.tar.gz");
        assert_eq!(entry.mount_point.to_string(), "zip:file:/tmp/outer.zip!/");
    }

    #[test]
    fn nested_mount_point_is_normalized() {
        let mp = MountPoint::parse("ZIP:file:/tmp/./x/../outer.zip!/").unwrap();
        assert_eq!(mp.to_string(), "zip:file:/tmp/outer.zip!/");
    }

    #[test]
    fn nested_under_platform_uses_the_containing_directory() {
        let root = Arc::new(MountPoint::platform("/").unwrap());
        let entry = NodeName::new("tmp/outer.zip").unwrap();
        let nested = MountPoint::nested(Scheme::new("zip").unwrap(), root, &entry).unwrap();
        let parsed = MountPoint::parse("zip:file:/tmp/outer.zip!/").unwrap();
        assert_eq!(nested, parsed);
        assert_eq!(nested.parent().unwrap().as_str(), "file:/tmp/");
        assert_eq!(nested.path(), "outer.zip");
    }

    #[test]
    fn malformed_mount_points_name_the_offender() {
        match MountPoint::parse("zip:file:/tmp/outer.zip").unwrap_err() {
            AddressError::Malformed { offending, .. } => assert_eq!(offending, "file:/tmp/outer.zip"),
        }
        assert!(MountPoint::parse("1zip:file:/a!/").is_err());
        assert!(MountPoint::parse("no-scheme").is_err());
        assert!(MountPoint::parse("file:relative/").is_err());
        assert!(MountPoint::parse("zip:file:/!/").is_err());
    }

    #[test]
    fn node_path_splits_at_last_mount_point() {
        let path = NodePath::parse("zip:file:/tmp/outer.zip!/dir/readme.txt").unwrap();
        assert_eq!(path.mount_point.to_string(), "zip:file:/tmp/outer.zip!/");
        assert_eq!(path.name.as_str(), "dir/readme.txt");
        assert_eq!(path.levels(), 2);

        let platform = NodePath::parse("file:/tmp/outer.zip").unwrap();
        assert_eq!(platform.mount_point.to_string(), "file:/tmp/");
        assert_eq!(platform.name.as_str(), "outer.zip");
    }

    #[test]
    fn descendant_relation_follows_parents() {
        let inner = MountPoint::parse("tar:zip:file:/a.zip!/b.tar!/").unwrap();
        let outer = MountPoint::parse("zip:file:/a.zip!/").unwrap();
        let root = MountPoint::parse("file:/").unwrap();
        assert!(inner.is_descendant_of(&outer));
        assert!(inner.is_descendant_of(&root));
        assert!(!outer.is_descendant_of(&inner));
    }

    fn segment() -> impl Strategy<Value = String> {
        prop_oneof![
            "[a-z0-9]{1,6}".prop_map(|s| s),
            Just(".".to_string()),
            Just("..".to_string()),
            Just(String::new()),
            "[a-z]{1,4}\\.zip".prop_map(|s| s),
        ]
    }

    proptest! {
        #[test]
        fn canonicalization_is_idempotent(segments in proptest::collection::vec(segment(), 0..6), nested in any::<bool>()) {
            let body = format!("/{}", segments.join("/"));
            let input = if nested {
                format!("zip:file:{}x.zip!/", if body.ends_with('/') { body.clone() } else { format!("{}/", body) })
            } else {
                format!("file:{}", body)
            };
            if let Ok(once) = MountPoint::parse(&input) {
                let twice = MountPoint::parse(&once.to_string()).unwrap();
                prop_assert_eq!(once.to_string(), twice.to_string());
                prop_assert_eq!(once, twice);
            }
        }
    }
}
