//! Segment filename grammar (§6): `{generation}-{version}-{mergeGeneration}[.{level}].ext`.

use crate::error::{Error, Result};
use std::cmp::Ordering;
use std::fmt;
use std::path::{Path, PathBuf};

/// Identity of a segment: `(generation, version, mergeCount)`, plus an
/// optional level tag. Sorting precedence is `(generation, version,
/// mergeCount)` ascending, per §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SegmentId {
    pub generation: u64,
    pub version: u64,
    pub merge_count: u64,
    pub level: Option<u32>,
}

impl SegmentId {
    pub fn new(generation: u64, version: u64, merge_count: u64) -> Self {
        Self {
            generation,
            version,
            merge_count,
            level: None,
        }
    }

    pub fn with_level(mut self, level: u32) -> Self {
        self.level = Some(level);
        self
    }

    /// The successor filename policy of §4.5: bump `mergeCount` by one,
    /// keeping generation and version fixed.
    pub fn next_merge(&self) -> Self {
        Self {
            merge_count: self.merge_count + 1,
            ..*self
        }
    }

    /// File name (without directory) for the given extension, e.g. `"seg"`.
    pub fn file_name(&self, ext: &str) -> String {
        match self.level {
            Some(level) => format!(
                "{}-{}-{}.{}.{ext}",
                self.generation, self.version, self.merge_count, level
            ),
            None => format!(
                "{}-{}-{}.{ext}",
                self.generation, self.version, self.merge_count
            ),
        }
    }

    pub fn path_in(&self, dir: &Path, ext: &str) -> PathBuf {
        dir.join(self.file_name(ext))
    }

    /// Parse `{generation}-{version}-{mergeGeneration}[.{level}].ext` out of
    /// a path's file stem.
    pub fn parse(path: &Path) -> Result<Self> {
        let stem = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::CorruptInput(format!("non-utf8 segment path {path:?}")))?;

        // Strip the final extension (".seg", ".merge.squeeze", etc.) by
        // taking everything up to the first '.'; the numeric triple and
        // optional level always precede any extension.
        let core = stem.split('.').next().unwrap_or(stem);
        let level = {
            let mut parts = stem.split('.');
            parts.next();
            parts.next().and_then(|p| p.parse::<u32>().ok())
        };

        let mut fields = core.split('-');
        let generation = Self::next_field(&mut fields, stem)?;
        let version = Self::next_field(&mut fields, stem)?;
        let merge_count = Self::next_field(&mut fields, stem)?;

        Ok(Self {
            generation,
            version,
            merge_count,
            level,
        })
    }

    fn next_field(fields: &mut std::str::Split<'_, char>, whole: &str) -> Result<u64> {
        fields
            .next()
            .ok_or_else(|| Error::CorruptInput(format!("malformed segment filename {whole}")))?
            .parse::<u64>()
            .map_err(|e| Error::CorruptInput(format!("malformed segment filename {whole}: {e}")))
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.generation, self.version, self.merge_count)
    }
}

impl PartialOrd for SegmentId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SegmentId {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.generation, self.version, self.merge_count).cmp(&(
            other.generation,
            other.version,
            other.merge_count,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_without_level() {
        let id = SegmentId::new(3, 1, 0);
        let path = id.path_in(Path::new("/data"), "seg");
        assert_eq!(path, Path::new("/data/3-1-0.seg"));
        assert_eq!(SegmentId::parse(&path).unwrap(), id);
    }

    #[test]
    fn round_trips_with_level() {
        let id = SegmentId::new(3, 1, 2).with_level(1);
        let path = id.path_in(Path::new("/data"), "seg");
        assert_eq!(path, Path::new("/data/3-1-2.1.seg"));
        let parsed = SegmentId::parse(&path).unwrap();
        assert_eq!(parsed.generation, 3);
        assert_eq!(parsed.version, 1);
        assert_eq!(parsed.merge_count, 2);
        assert_eq!(parsed.level, Some(1));
    }

    #[test]
    fn sorts_by_generation_then_version_then_merge_count() {
        let mut ids = vec![
            SegmentId::new(1, 2, 0),
            SegmentId::new(1, 1, 5),
            SegmentId::new(0, 9, 9),
            SegmentId::new(1, 1, 0),
        ];
        ids.sort();
        assert_eq!(
            ids,
            vec![
                SegmentId::new(0, 9, 9),
                SegmentId::new(1, 1, 0),
                SegmentId::new(1, 1, 5),
                SegmentId::new(1, 2, 0),
            ]
        );
    }

    #[test]
    fn next_merge_bumps_only_merge_count() {
        let id = SegmentId::new(5, 2, 3);
        let next = id.next_merge();
        assert_eq!(next.generation, 5);
        assert_eq!(next.version, 2);
        assert_eq!(next.merge_count, 4);
    }
}
