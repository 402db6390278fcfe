// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The in-memory registry of configuration entities a test run has declared.
//!
//! Entities are stored per [`Kind`] and keyed by ID. Each kind keeps its
//! insertion order, which the resolver relies on as a tie-break when more than
//! one existing entity could satisfy an expectation.

use std::collections::BTreeMap;

use edge_api_types::config::{
    AppInstanceConfig, BaseOsConfig, ContentTree, Datastore, NetworkConfig,
    NetworkInstanceConfig, PhysicalIo, Snapshot, SystemAdapter, Volume,
};
use edge_api_types::{Entity, Kind};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("no {kind} with ID {id} in the config store")]
    NotFound { kind: Kind, id: String },

    #[error("a {kind} with ID {id} already exists in the config store")]
    DuplicateId { kind: Kind, id: String },
}

/// The entities of a single kind, in insertion order.
#[derive(Clone, Debug)]
pub struct Table<E> {
    entries: Vec<E>,
    index: BTreeMap<String, usize>,
}

impl<E> Default for Table<E> {
    fn default() -> Self {
        Self { entries: Vec::new(), index: BTreeMap::new() }
    }
}

impl<E: Entity> Table<E> {
    fn add(&mut self, entity: E) -> Result<(), StoreError> {
        let id = entity.id().to_owned();
        if self.index.contains_key(&id) {
            return Err(StoreError::DuplicateId { kind: E::KIND, id });
        }

        self.index.insert(id, self.entries.len());
        self.entries.push(entity);
        Ok(())
    }

    fn get(&self, id: &str) -> Result<&E, StoreError> {
        self.index
            .get(id)
            .map(|&idx| &self.entries[idx])
            .ok_or_else(|| not_found::<E>(id))
    }

    fn get_mut(&mut self, id: &str) -> Result<&mut E, StoreError> {
        match self.index.get(id) {
            Some(&idx) => Ok(&mut self.entries[idx]),
            None => Err(not_found::<E>(id)),
        }
    }

    fn remove(&mut self, id: &str) -> Result<E, StoreError> {
        let idx = self.index.remove(id).ok_or_else(|| not_found::<E>(id))?;
        let removed = self.entries.remove(idx);

        // Everything after the removed entry shifted down by one.
        for slot in self.index.values_mut() {
            if *slot > idx {
                *slot -= 1;
            }
        }

        Ok(removed)
    }
}

fn not_found<E: Entity>(id: &str) -> StoreError {
    StoreError::NotFound { kind: E::KIND, id: id.to_owned() }
}

/// Implemented by entity types that have a table in [`ConfigStore`].
pub trait Stored: Entity + Sized + 'static {
    fn table(store: &ConfigStore) -> &Table<Self>;
    fn table_mut(store: &mut ConfigStore) -> &mut Table<Self>;
}

macro_rules! config_store {
    ($($field:ident: $ty:ty),+ $(,)?) => {
        #[derive(Clone, Debug, Default)]
        pub struct ConfigStore {
            $($field: Table<$ty>,)+
        }

        $(
            impl Stored for $ty {
                fn table(store: &ConfigStore) -> &Table<Self> {
                    &store.$field
                }

                fn table_mut(store: &mut ConfigStore) -> &mut Table<Self> {
                    &mut store.$field
                }
            }
        )+
    };
}

config_store! {
    datastores: Datastore,
    content_trees: ContentTree,
    volumes: Volume,
    base_os: BaseOsConfig,
    apps: AppInstanceConfig,
    network_instances: NetworkInstanceConfig,
    networks: NetworkConfig,
    physical_ios: PhysicalIo,
    system_adapters: SystemAdapter,
    snapshots: Snapshot,
}

impl ConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a new entity. Fails if an entity of the same kind already has its
    /// ID.
    pub fn add<E: Stored>(&mut self, entity: E) -> Result<(), StoreError> {
        E::table_mut(self).add(entity)
    }

    pub fn get<E: Stored>(&self, id: &str) -> Result<&E, StoreError> {
        E::table(self).get(id)
    }

    /// Returns a mutable reference to an existing entity so that it can be
    /// edited in place (e.g. deactivated) rather than replaced.
    pub fn get_mut<E: Stored>(
        &mut self,
        id: &str,
    ) -> Result<&mut E, StoreError> {
        E::table_mut(self).get_mut(id)
    }

    pub fn remove<E: Stored>(&mut self, id: &str) -> Result<E, StoreError> {
        E::table_mut(self).remove(id)
    }

    pub fn contains<E: Stored>(&self, id: &str) -> bool {
        E::table(self).index.contains_key(id)
    }

    /// Iterates over every entity of kind `E` in the order they were added.
    pub fn list<E: Stored>(&self) -> impl Iterator<Item = &E> {
        E::table(self).entries.iter()
    }

    pub fn list_mut<E: Stored>(&mut self) -> impl Iterator<Item = &mut E> {
        E::table_mut(self).entries.iter_mut()
    }

    pub fn len<E: Stored>(&self) -> usize {
        E::table(self).entries.len()
    }
}
