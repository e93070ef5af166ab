//! Snapshot of the volume dependency graph of a pool.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::hypervisor::Hypervisor;

use super::{is_layer_name, LayerError};

/// Parent of a volume in the arena.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parent {
    /// No backing store.
    Root,
    /// Backed by another volume of the same pool.
    Volume(String),
    /// Backed by a path outside the pool.
    Foreign(String),
}

/// Every volume of a pool keyed by name, with its parent.
///
/// Built from a single scan. The backend remains the source of truth: the
/// arena may be stale as soon as it is built.
#[derive(Debug, Clone, Default)]
pub struct LayerArena {
    parents: BTreeMap<String, Parent>,
}

impl LayerArena {
    /// Scan all volumes of `pool`. Volumes deleted during the scan are
    /// skipped.
    pub async fn scan(conn: &dyn Hypervisor, pool: &str) -> Result<Self, LayerError> {
        let names = conn.volume_list(pool).await?;

        let mut paths: HashMap<String, String> = HashMap::with_capacity(names.len());
        let mut backing: Vec<(String, Option<String>)> = Vec::with_capacity(names.len());
        for name in names {
            let path = match conn.volume_path(pool, &name).await {
                Ok(p) => p,
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e.into()),
            };
            let desc = match conn.volume_descriptor(pool, &name).await {
                Ok(d) => d,
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e.into()),
            };
            paths.insert(path, name.clone());
            backing.push((name, desc.backing_store.map(|b| b.path)));
        }

        let parents = backing
            .into_iter()
            .map(|(name, backing)| {
                let parent = match backing {
                    None => Parent::Root,
                    Some(path) => match paths.get(&path) {
                        Some(parent) => Parent::Volume(parent.clone()),
                        None => Parent::Foreign(path),
                    },
                };
                (name, parent)
            })
            .collect();

        Ok(Self { parents })
    }

    /// Build an arena from explicit records.
    pub fn from_parents(parents: impl IntoIterator<Item = (String, Parent)>) -> Self {
        Self {
            parents: parents.into_iter().collect(),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.parents.contains_key(name)
    }

    pub fn parent(&self, name: &str) -> Option<&Parent> {
        self.parents.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.parents.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.parents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parents.is_empty()
    }

    /// Volumes directly backed by `name`.
    pub fn dependents<'a>(&'a self, name: &str) -> Vec<&'a str> {
        self.parents
            .iter()
            .filter_map(|(child, parent)| match parent {
                Parent::Volume(p) if p == name => Some(child.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn has_dependents(&self, name: &str) -> bool {
        self.parents
            .values()
            .any(|parent| matches!(parent, Parent::Volume(p) if p == name))
    }

    /// Layer chain from `name` to its root, `name` first.
    ///
    /// Every parent must be a layer of this pool; anything else is
    /// reported as [`LayerError::Foreign`].
    pub fn chain(&self, name: &str) -> Result<Vec<String>, LayerError> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut current = name.to_string();

        loop {
            if !seen.insert(current.clone()) {
                return Err(LayerError::Cycle {
                    volume: name.to_string(),
                });
            }
            let parent = self.parents.get(&current).ok_or_else(|| LayerError::Foreign {
                volume: current.clone(),
            })?;
            chain.push(current.clone());

            match parent {
                Parent::Root => return Ok(chain),
                Parent::Volume(p) if is_layer_name(p) => current = p.clone(),
                Parent::Volume(p) | Parent::Foreign(p) => {
                    return Err(LayerError::Foreign { volume: p.clone() })
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layer(n: u8) -> String {
        format!("virter:layer:sha256:{}", format!("{:02x}", n).repeat(32))
    }

    fn arena() -> LayerArena {
        LayerArena::from_parents([
            (layer(1), Parent::Root),
            (layer(2), Parent::Volume(layer(1))),
            (layer(3), Parent::Volume(layer(2))),
            ("virter:tag:img".to_string(), Parent::Volume(layer(3))),
            ("vm1".to_string(), Parent::Volume(layer(3))),
            ("imported".to_string(), Parent::Foreign("/srv/base.qcow2".to_string())),
        ])
    }

    #[test]
    fn test_dependents() {
        let arena = arena();
        let mut deps = arena.dependents(&layer(3));
        deps.sort();
        assert_eq!(deps, vec!["virter:tag:img", "vm1"]);
        assert!(!arena.has_dependents("vm1"));
    }

    #[test]
    fn test_chain_root_ward() {
        let arena = arena();
        assert_eq!(
            arena.chain(&layer(3)).unwrap(),
            vec![layer(3), layer(2), layer(1)]
        );
    }

    #[test]
    fn test_chain_foreign() {
        let arena = arena();
        assert!(arena.chain("imported").unwrap_err().is_foreign());
        assert!(arena.chain("missing").unwrap_err().is_foreign());
    }

    #[test]
    fn test_chain_cycle() {
        let arena = LayerArena::from_parents([
            (layer(1), Parent::Volume(layer(2))),
            (layer(2), Parent::Volume(layer(1))),
        ]);
        assert!(matches!(
            arena.chain(&layer(1)).unwrap_err(),
            LayerError::Cycle { .. }
        ));
    }
}
