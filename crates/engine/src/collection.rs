//! Ordered, duplicate-free collection of migrations.

use std::collections::HashSet;
use std::fmt;

use crate::error::{EngineError, EngineResult};
use crate::migration::Migration;

/// Migrations sorted by comparable key
#[derive(Debug, Clone, Default)]
pub struct MigrationSet {
    migrations: Vec<Migration>,
}

impl MigrationSet {
    /// Sort `migrations`, reject duplicate keys and link neighbours.
    pub fn new(mut migrations: Vec<Migration>) -> EngineResult<Self> {
        migrations.sort_by(|a, b| a.key.cmp(&b.key).then_with(|| a.version.cmp(&b.version)));

        if let Some(pair) = migrations.windows(2).find(|pair| pair[0].key == pair[1].key) {
            return Err(EngineError::DuplicateVersion {
                version: if pair[0].version == pair[1].version {
                    pair[1].version.clone()
                } else {
                    format!("{} / {}", pair[0].version, pair[1].version)
                },
            });
        }

        let keys: Vec<u64> = migrations.iter().map(|m| m.key).collect();
        for (index, migration) in migrations.iter_mut().enumerate() {
            migration.previous = index.checked_sub(1).map(|i| keys[i]);
            migration.next = keys.get(index + 1).copied();
        }

        Ok(Self { migrations })
    }

    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Migration> {
        self.migrations.iter()
    }

    pub fn first(&self) -> Option<&Migration> {
        self.migrations.first()
    }

    pub fn last(&self) -> Option<&Migration> {
        self.migrations.last()
    }

    /// Migration with the given identifier
    pub fn get(&self, version: &str) -> Option<&Migration> {
        self.migrations.iter().find(|m| m.version == version)
    }

    pub fn position(&self, version: &str) -> Option<usize> {
        self.migrations.iter().position(|m| m.version == version)
    }

    pub fn contains(&self, version: &str) -> bool {
        self.position(version).is_some()
    }

    /// Migration following `key`, by the links set at construction
    pub fn next_after(&self, key: u64) -> Option<&Migration> {
        let next = self.migrations.iter().find(|m| m.key == key)?.next?;
        self.migrations.iter().find(|m| m.key == next)
    }

    /// Migration preceding `key`, by the links set at construction
    pub fn previous_before(&self, key: u64) -> Option<&Migration> {
        let previous = self.migrations.iter().find(|m| m.key == key)?.previous?;
        self.migrations.iter().find(|m| m.key == previous)
    }

    /// Keep only matching migrations. Neighbour links keep pointing into the full set.
    pub fn retain<F>(&mut self, f: F)
    where
        F: FnMut(&Migration) -> bool,
    {
        self.migrations.retain(f);
    }

    /// Keep the first `limit` migrations; `0` keeps everything
    pub fn truncate(&mut self, limit: usize) {
        if limit > 0 {
            self.migrations.truncate(limit);
        }
    }

    /// Reverse the order, for reverting
    pub fn reverse(&mut self) {
        self.migrations.reverse();
    }

    pub fn versions(&self) -> Vec<String> {
        self.migrations.iter().map(|m| m.version.clone()).collect()
    }

    /// Identifiers of `versions` that are not in this set
    pub fn missing<'a, I>(&self, versions: I) -> Vec<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let present: HashSet<&str> = self.migrations.iter().map(|m| m.version.as_str()).collect();
        versions
            .into_iter()
            .filter(|version| !present.contains(version))
            .map(str::to_string)
            .collect()
    }
}

impl IntoIterator for MigrationSet {
    type Item = Migration;
    type IntoIter = std::vec::IntoIter<Migration>;

    fn into_iter(self) -> Self::IntoIter {
        self.migrations.into_iter()
    }
}

impl<'a> IntoIterator for &'a MigrationSet {
    type Item = &'a Migration;
    type IntoIter = std::slice::Iter<'a, Migration>;

    fn into_iter(self) -> Self::IntoIter {
        self.migrations.iter()
    }
}

impl fmt::Display for MigrationSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for migration in &self.migrations {
            writeln!(f, "\t{}", migration.version)?;
        }
        Ok(())
    }
}
