//! Migration container and path resolution.
//!
//! Migrations are indexed by start version, then end version. Path search is
//! greedy: from the current version, take the migration that lands closest to
//! the target without crossing it.

use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

use super::Migration;

/// No chain of registered migrations connects the two versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("no migration path from version {start} to {end}")]
pub struct PathNotFound {
    pub start: u32,
    pub end: u32,
}

/// Migrations keyed by `start -> (end -> migration)`.
#[derive(Debug, Clone, Default)]
pub struct MigrationContainer {
    migrations: HashMap<u32, BTreeMap<u32, Migration>>,
}

impl MigrationContainer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a migration, replacing any migration with the same start and end.
    pub fn add_migration(&mut self, migration: Migration) {
        let start = migration.start_version();
        let end = migration.end_version();
        if self
            .migrations
            .entry(start)
            .or_default()
            .insert(end, migration)
            .is_some()
        {
            tracing::warn!(start, end, "Overriding migration with the same versions");
        }
    }

    /// Add several migrations in order. Later entries win on conflicts.
    pub fn add_migrations<I>(&mut self, migrations: I)
    where
        I: IntoIterator<Item = Migration>,
    {
        for migration in migrations {
            self.add_migration(migration);
        }
    }

    /// Whether a migration with exactly this (start, end) pair is registered.
    pub fn contains(&self, start: u32, end: u32) -> bool {
        self.migrations
            .get(&start)
            .is_some_and(|targets| targets.contains_key(&end))
    }

    /// Look up the migration for an exact (start, end) pair.
    pub fn get(&self, start: u32, end: u32) -> Option<&Migration> {
        self.migrations.get(&start)?.get(&end)
    }

    /// Every version that is the start or end of a registered migration.
    pub fn versions(&self) -> impl Iterator<Item = u32> + '_ {
        self.migrations
            .iter()
            .flat_map(|(start, targets)| std::iter::once(*start).chain(targets.keys().copied()))
    }

    /// Total number of registered migrations.
    pub fn len(&self) -> usize {
        self.migrations.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolve an ordered list of migrations from `start` to `end`.
    ///
    /// Upgrades pick the largest reachable end version not above the target;
    /// downgrades pick the smallest end version not below it. An empty path
    /// is returned when `start == end`.
    ///
    /// # Errors
    ///
    /// Returns [`PathNotFound`] if the greedy walk gets stuck before reaching
    /// `end`.
    pub fn find_path(&self, start: u32, end: u32) -> Result<Vec<Migration>, PathNotFound> {
        let upgrade = start < end;
        let mut path = Vec::new();
        let mut current = start;

        while current != end {
            let targets = self
                .migrations
                .get(&current)
                .ok_or(PathNotFound { start, end })?;

            let next = if upgrade {
                targets.range(current + 1..=end).next_back()
            } else {
                targets.range(end..current).next()
            };

            let (&next_version, migration) = next.ok_or(PathNotFound { start, end })?;
            path.push(migration.clone());
            current = next_version;
        }

        Ok(path)
    }
}
