//! Relay Directory
//!
//! The list of known relays and random path selection over it.
//!
//! # Pools
//!
//! - **All relays**: any hop but the last
//! - **Exits**: relays offering `[Delivery/SMTP]`
//! - **Fragment exits**: exits that also reassemble fragmented messages
//!
//! Hops of one path are distinct where the pool allows it; after ten draws
//! that all collide the last draw is taken anyway.

use std::path::Path;

use rand::seq::SliceRandom;
use tracing::{debug, warn};

use crate::descriptor::{RoutingDescriptor, SERVER_MARKER};
use crate::{MixError, MixResult};

/// Draws per hop before accepting a repeated relay
const MAX_DRAWS: usize = 10;

/// Known relays
#[derive(Debug, Clone, Default)]
pub struct DescriptorList {
    descriptors: Vec<RoutingDescriptor>,
}

impl DescriptorList {
    /// Create an empty list
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse directory text, skipping records that fail to parse
    pub fn parse(text: &str) -> Self {
        let lines: Vec<&str> = text.lines().collect();
        let mut list = Self::new();
        let mut pos = 0;
        let mut skipped = 0usize;

        while pos < lines.len() {
            if lines[pos].trim() != SERVER_MARKER {
                pos += 1;
                continue;
            }
            match RoutingDescriptor::parse_record(&lines, pos) {
                Ok((desc, next)) => {
                    list.insert(desc);
                    pos = next;
                }
                Err(e) => {
                    warn!(line = pos + 1, error = %e, "skipping relay record");
                    skipped += 1;
                    pos += 1;
                }
            }
        }

        debug!(
            relays = list.len(),
            exits = list.exits().len(),
            fragment_exits = list.fragment_exits().len(),
            skipped,
            "parsed directory"
        );
        list
    }

    /// Read and parse a directory file
    pub fn load(path: &Path) -> MixResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| MixError::InvalidConfiguration(
                format!("Cannot read directory {}: {}", path.display(), e)
            ))?;
        Ok(Self::parse(&text))
    }

    /// Build from descriptors; later duplicates of a name are ignored
    pub fn from_descriptors(descriptors: impl IntoIterator<Item = RoutingDescriptor>) -> Self {
        let mut list = Self::new();
        for desc in descriptors {
            list.insert(desc);
        }
        list
    }

    /// Add a descriptor unless its nickname is taken.
    ///
    /// Returns whether it was added.
    pub fn insert(&mut self, desc: RoutingDescriptor) -> bool {
        if self.get_by_name(desc.nickname()).is_some() {
            debug!(nickname = desc.nickname(), "duplicate relay nickname ignored");
            return false;
        }
        self.descriptors.push(desc);
        true
    }

    /// Number of relays
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    /// No relays known
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// All relays in directory order
    pub fn descriptors(&self) -> &[RoutingDescriptor] {
        &self.descriptors
    }

    /// Relay by nickname
    pub fn get_by_name(&self, name: &str) -> Option<&RoutingDescriptor> {
        self.descriptors.iter().find(|d| d.nickname() == name)
    }

    /// Remove a relay by nickname
    pub fn remove(&mut self, name: &str) -> Option<RoutingDescriptor> {
        let idx = self.descriptors.iter().position(|d| d.nickname() == name)?;
        Some(self.descriptors.remove(idx))
    }

    /// SMTP exits
    pub fn exits(&self) -> Vec<&RoutingDescriptor> {
        self.descriptors.iter().filter(|d| d.is_exit()).collect()
    }

    /// Exits that reassemble fragments
    pub fn fragment_exits(&self) -> Vec<&RoutingDescriptor> {
        self.descriptors
            .iter()
            .filter(|d| d.is_exit() && d.allows_fragmented())
            .collect()
    }

    /// Random relay
    pub fn random(&self) -> MixResult<&RoutingDescriptor> {
        self.descriptors
            .choose(&mut rand::thread_rng())
            .ok_or_else(|| MixError::NoPath("directory is empty".into()))
    }

    /// Random path of `hops` relays
    pub fn random_path(&self, hops: usize) -> MixResult<Vec<RoutingDescriptor>> {
        if hops == 0 {
            return Err(MixError::EmptyPath);
        }
        let all: Vec<&RoutingDescriptor> = self.descriptors.iter().collect();
        let mut path = Vec::with_capacity(hops);
        for _ in 0..hops {
            let hop = draw_distinct(&all, &path)?;
            path.push(hop);
        }
        Ok(path)
    }

    /// Random path of `hops` relays ending in an SMTP exit
    pub fn random_path_with_exit(&self, hops: usize) -> MixResult<Vec<RoutingDescriptor>> {
        if hops == 0 {
            return Err(MixError::EmptyPath);
        }
        let exits = self.exits();
        if exits.is_empty() {
            return Err(MixError::NoPath("no exit relays".into()));
        }

        let mut path = self.random_path(hops - 1).or_else(|e| match e {
            MixError::EmptyPath => Ok(Vec::new()),
            other => Err(other),
        })?;
        let exit = draw_distinct(&exits, &path)?;
        path.push(exit);
        Ok(path)
    }

    /// `parts` random paths of `hops` relays, all ending in the same
    /// fragment-capable exit
    pub fn random_paths_with_fragments(
        &self,
        hops: usize,
        parts: usize,
    ) -> MixResult<Vec<Vec<RoutingDescriptor>>> {
        if hops == 0 {
            return Err(MixError::EmptyPath);
        }
        let exit = self
            .fragment_exits()
            .choose(&mut rand::thread_rng())
            .map(|d| (*d).clone())
            .ok_or_else(|| MixError::NoPath("no relays reassemble fragments".into()))?;

        let all: Vec<&RoutingDescriptor> = self.descriptors.iter().collect();
        let mut paths = Vec::with_capacity(parts);
        for _ in 0..parts {
            let mut path = Vec::with_capacity(hops);
            for _ in 0..hops - 1 {
                let hop = draw_distinct(&all, &path)?;
                path.push(hop);
            }
            path.push(exit.clone());
            paths.push(path);
        }
        Ok(paths)
    }
}

/// Draw from `pool`, avoiding relays already on `path` for up to ten tries
fn draw_distinct(
    pool: &[&RoutingDescriptor],
    path: &[RoutingDescriptor],
) -> MixResult<RoutingDescriptor> {
    let mut rng = rand::thread_rng();
    let mut candidate = None;
    for _ in 0..MAX_DRAWS {
        let pick = pool
            .choose(&mut rng)
            .ok_or_else(|| MixError::NoPath("directory is empty".into()))?;
        candidate = Some(*pick);
        if !path.iter().any(|p| p.nickname() == pick.nickname()) {
            break;
        }
    }
    candidate
        .cloned()
        .ok_or_else(|| MixError::NoPath("directory is empty".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_keys::relay_key;

    fn relay(i: usize, exit: bool, fragmented: bool) -> RoutingDescriptor {
        let key = relay_key(i).public_key();
        RoutingDescriptor::new(
            format!("relay{}", i),
            format!("mix{}.example.net", i),
            48099,
            key.clone(),
            Some(key),
        )
        .unwrap()
        .with_exit(exit)
        .with_fragmented(fragmented)
    }

    fn directory_text() -> String {
        [
            relay(0, false, false),
            relay(1, false, false),
            relay(2, true, false),
            relay(3, true, true),
        ]
        .iter()
        .map(|d| d.to_text().unwrap())
        .collect::<Vec<_>>()
        .join("\n")
    }

    #[test]
    fn test_parse_directory() {
        let list = DescriptorList::parse(&directory_text());
        assert_eq!(list.len(), 4);
        assert_eq!(list.exits().len(), 2);
        assert_eq!(list.fragment_exits().len(), 1);
        assert_eq!(list.fragment_exits()[0].nickname(), "relay3");
    }

    #[test]
    fn test_bad_record_skipped() {
        let broken: String = relay(0, false, false)
            .to_text()
            .unwrap()
            .replace("Nickname: relay0", "Nickname: broken")
            .lines()
            .filter(|l| !l.starts_with("Packet-Key"))
            .map(|l| format!("{}\n", l))
            .collect();
        let text = format!("{}\n{}", broken, directory_text());
        let list = DescriptorList::parse(&text);
        assert_eq!(list.len(), 4);
        assert!(list.get_by_name("broken").is_none());
    }

    #[test]
    fn test_duplicate_nickname_first_wins() {
        let mut list = DescriptorList::from_descriptors(vec![relay(0, false, false)]);
        let dup = RoutingDescriptor::new("relay0", "other.example.net", 1, relay_key(1).public_key(), None)
            .unwrap();
        assert!(!list.insert(dup));
        assert_eq!(list.get_by_name("relay0").unwrap().port(), 48099);
    }

    #[test]
    fn test_remove() {
        let mut list = DescriptorList::parse(&directory_text());
        assert!(list.remove("relay2").is_some());
        assert!(list.remove("relay2").is_none());
        assert_eq!(list.exits().len(), 1);
    }

    #[test]
    fn test_random_path_with_exit() {
        let list = DescriptorList::parse(&directory_text());
        for _ in 0..20 {
            let path = list.random_path_with_exit(3).unwrap();
            assert_eq!(path.len(), 3);
            assert!(path[2].is_exit());
        }
        assert_eq!(list.random_path_with_exit(1).unwrap().len(), 1);
        assert!(matches!(list.random_path_with_exit(0), Err(MixError::EmptyPath)));
    }

    #[test]
    fn test_paths_share_fragment_exit() {
        let list = DescriptorList::parse(&directory_text());
        let paths = list.random_paths_with_fragments(4, 5).unwrap();
        assert_eq!(paths.len(), 5);
        for path in &paths {
            assert_eq!(path.len(), 4);
            assert_eq!(path[3].nickname(), "relay3");
        }
    }

    #[test]
    fn test_no_exits() {
        let list = DescriptorList::from_descriptors(vec![relay(0, false, false)]);
        assert!(matches!(list.random_path_with_exit(2), Err(MixError::NoPath(_))));
        assert!(matches!(list.random_paths_with_fragments(2, 2), Err(MixError::NoPath(_))));
        assert!(matches!(DescriptorList::new().random(), Err(MixError::NoPath(_))));
    }
}
