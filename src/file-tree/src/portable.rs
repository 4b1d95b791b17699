use crate::{FsError, FsResult};
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// An alias-rooted filesystem path of the form `ROOT:rel/sub/…`. Directories
/// carry a trailing slash. Portable paths are stable across servers that pin
/// the same root alias, which is what lets a backup server mirror a core
/// tree without knowing its absolute layout.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct PortablePath {
    root: String,
    rel: String,
}

impl PortablePath {
    pub fn parse(s: &str) -> FsResult<Self> {
        let (root, rel) = s
            .split_once(':')
            .ok_or_else(|| FsError::InvalidPath(format!("missing root alias: {}", s)))?;
        if root.is_empty() {
            return Err(FsError::InvalidPath(format!("empty root alias: {}", s)));
        }
        if rel.starts_with('/') {
            return Err(FsError::InvalidPath(format!(
                "relative part must not start with '/': {}",
                s
            )));
        }
        Ok(Self {
            root: root.to_string(),
            rel: rel.to_string(),
        })
    }

    /// The root directory of an alias, e.g. `USERS:`.
    pub fn root_of(alias: &str) -> Self {
        Self {
            root: alias.to_string(),
            rel: String::new(),
        }
    }

    pub fn root_name(&self) -> &str {
        &self.root
    }

    pub fn relative_path(&self) -> &str {
        &self.rel
    }

    pub fn is_dir(&self) -> bool {
        self.rel.is_empty() || self.rel.ends_with('/')
    }

    pub fn is_root(&self) -> bool {
        self.rel.is_empty()
    }

    /// Basename of the path: the last segment, ignoring a trailing slash.
    /// The root path's filename is the alias itself.
    pub fn filename(&self) -> &str {
        if self.rel.is_empty() {
            return &self.root;
        }
        let trimmed = self.rel.trim_end_matches('/');
        match trimmed.rfind('/') {
            Some(idx) => &trimmed[idx + 1..],
            None => trimmed,
        }
    }

    pub fn child(&self, name: &str, is_dir: bool) -> Self {
        let mut rel = self.rel.clone();
        rel.push_str(name);
        if is_dir {
            rel.push('/');
        }
        Self {
            root: self.root.clone(),
            rel,
        }
    }

    pub fn parent(&self) -> Option<Self> {
        if self.rel.is_empty() {
            return None;
        }
        let trimmed = self.rel.trim_end_matches('/');
        let rel = match trimmed.rfind('/') {
            Some(idx) => trimmed[..idx + 1].to_string(),
            None => String::new(),
        };
        Some(Self {
            root: self.root.clone(),
            rel,
        })
    }

    /// Swap the root alias, keeping the relative part. Used when mirroring a
    /// core tree onto a backup server, where the alias is the core's id.
    pub fn overwrite_root(&self, new_root: &str) -> Self {
        Self {
            root: new_root.to_string(),
            rel: self.rel.clone(),
        }
    }

    pub fn to_portable(&self) -> String {
        format!("{}:{}", self.root, self.rel)
    }

    pub fn starts_with(&self, other: &PortablePath) -> bool {
        self.root == other.root && self.rel.starts_with(&other.rel)
    }

    /// Depth of the path below its root. The root itself is depth 0.
    pub fn depth(&self) -> usize {
        self.rel.trim_end_matches('/').split('/').filter(|s| !s.is_empty()).count()
    }
}

impl fmt::Display for PortablePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.root, self.rel)
    }
}

impl Serialize for PortablePath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_portable())
    }
}

impl<'de> Deserialize<'de> for PortablePath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        PortablePath::parse(&s).map_err(D::Error::custom)
    }
}
