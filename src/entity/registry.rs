// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Registry of known devices and groups.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use super::{Device, Entity, EntityId, EntityOptions, Group};
use crate::error::EntityError;

/// Shared registry of devices and groups.
///
/// The registry enforces that friendly names are unique across devices and
/// groups. Lookups return clones so no lock is held by callers.
///
/// Cloning the registry is cheap and shares the underlying data.
///
/// # Examples
///
/// ```
/// use meshbridge::entity::{Device, EntityRegistry};
///
/// let registry = EntityRegistry::new();
/// registry.insert(Device::new("0x01", "bulb")).unwrap();
///
/// assert!(registry.resolve("bulb").is_some());
/// assert!(registry.insert(Device::new("0x02", "bulb")).is_err());
/// ```
#[derive(Clone, Default)]
pub struct EntityRegistry {
    inner: Arc<RwLock<RegistryInner>>,
}

#[derive(Default)]
struct RegistryInner {
    entities: HashMap<EntityId, Entity>,
    names: HashMap<String, EntityId>,
}

impl RegistryInner {
    fn name_owner(&self, name: &str) -> Option<&EntityId> {
        self.names.get(name)
    }

    fn device_mut(&mut self, address: &str) -> Option<&mut Device> {
        match self.entities.get_mut(&EntityId::device(address)) {
            Some(Entity::Device(device)) => Some(device),
            _ => None,
        }
    }
}

impl EntityRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces an entity.
    ///
    /// An entity with the same identifier is replaced, keeping name
    /// uniqueness intact.
    ///
    /// # Errors
    ///
    /// Returns [`EntityError::NameTaken`] if another entity uses the name and
    /// [`EntityError::InvalidName`] if the name cannot be used in a topic.
    pub fn insert(&self, entity: impl Into<Entity>) -> Result<(), EntityError> {
        let entity = entity.into();
        validate_name(entity.name())?;

        let id = entity.id();
        let mut inner = self.inner.write();
        if let Some(owner) = inner.name_owner(entity.name())
            && *owner != id
        {
            return Err(EntityError::NameTaken(entity.name().to_string()));
        }

        if let Some(previous) = inner.entities.get(&id) {
            let previous_name = previous.name().to_string();
            inner.names.remove(&previous_name);
        }
        inner.names.insert(entity.name().to_string(), id.clone());
        inner.entities.insert(id, entity);
        Ok(())
    }

    /// Returns the entity with the given identifier.
    #[must_use]
    pub fn get(&self, id: &EntityId) -> Option<Entity> {
        self.inner.read().entities.get(id).cloned()
    }

    /// Returns the device with the given address.
    #[must_use]
    pub fn device(&self, address: &str) -> Option<Device> {
        self.get(&EntityId::device(address))
            .and_then(|entity| entity.as_device().cloned())
    }

    /// Returns the group with the given id.
    #[must_use]
    pub fn group(&self, id: u16) -> Option<Group> {
        self.get(&EntityId::Group(id))
            .and_then(|entity| entity.as_group().cloned())
    }

    /// Looks an entity up by friendly name, falling back to its identifier.
    #[must_use]
    pub fn resolve(&self, name_or_id: &str) -> Option<Entity> {
        let inner = self.inner.read();
        if let Some(id) = inner.names.get(name_or_id) {
            return inner.entities.get(id).cloned();
        }
        let id: EntityId = name_or_id.parse().ok()?;
        inner.entities.get(&id).cloned()
    }

    /// Returns the identifier owning a friendly name.
    #[must_use]
    pub fn id_of(&self, name: &str) -> Option<EntityId> {
        self.inner.read().names.get(name).cloned()
    }

    /// Returns all devices sorted by address.
    #[must_use]
    pub fn devices(&self) -> Vec<Device> {
        let mut devices: Vec<Device> = self
            .inner
            .read()
            .entities
            .values()
            .filter_map(|entity| entity.as_device().cloned())
            .collect();
        devices.sort_by(|a, b| a.address.cmp(&b.address));
        devices
    }

    /// Returns all groups sorted by id.
    #[must_use]
    pub fn groups(&self) -> Vec<Group> {
        let mut groups: Vec<Group> = self
            .inner
            .read()
            .entities
            .values()
            .filter_map(|entity| entity.as_group().cloned())
            .collect();
        groups.sort_by_key(|group| group.id);
        groups
    }

    /// Returns the groups the device is a member of.
    #[must_use]
    pub fn groups_containing(&self, address: &str) -> Vec<Group> {
        self.groups()
            .into_iter()
            .filter(|group| group.has_member(address))
            .collect()
    }

    /// Renames an entity, returning its identifier and previous name.
    ///
    /// # Errors
    ///
    /// Returns [`EntityError::NotFound`] if `from` does not resolve,
    /// [`EntityError::NameTaken`] if `to` belongs to another entity and
    /// [`EntityError::InvalidName`] if `to` cannot be used in a topic.
    pub fn rename(&self, from: &str, to: &str) -> Result<(EntityId, String), EntityError> {
        validate_name(to)?;
        let id = self
            .resolve(from)
            .map(|entity| entity.id())
            .ok_or_else(|| EntityError::NotFound(from.to_string()))?;

        let mut inner = self.inner.write();
        if let Some(owner) = inner.name_owner(to)
            && *owner != id
        {
            return Err(EntityError::NameTaken(to.to_string()));
        }

        let entity = inner
            .entities
            .get_mut(&id)
            .ok_or_else(|| EntityError::NotFound(from.to_string()))?;
        let old_name = match entity {
            Entity::Device(device) => std::mem::replace(&mut device.friendly_name, to.to_string()),
            Entity::Group(group) => std::mem::replace(&mut group.friendly_name, to.to_string()),
        };
        inner.names.remove(&old_name);
        inner.names.insert(to.to_string(), id.clone());
        Ok((id, old_name))
    }

    /// Removes an entity and drops it from every group it belonged to.
    pub fn remove(&self, id: &EntityId) -> Option<Entity> {
        let mut inner = self.inner.write();
        let entity = inner.entities.remove(id)?;
        inner.names.remove(entity.name());

        if let EntityId::Device(address) = id {
            for other in inner.entities.values_mut() {
                if let Entity::Group(group) = other {
                    group.members.retain(|member| member != address);
                }
            }
        }
        Some(entity)
    }

    /// Replaces the options of an entity.
    ///
    /// # Errors
    ///
    /// Returns [`EntityError::NotFound`] if the entity is unknown.
    pub fn set_options(&self, id: &EntityId, options: EntityOptions) -> Result<(), EntityError> {
        let mut inner = self.inner.write();
        match inner.entities.get_mut(id) {
            Some(Entity::Device(device)) => device.options = options,
            Some(Entity::Group(group)) => group.options = options,
            None => return Err(EntityError::NotFound(id.to_string())),
        }
        Ok(())
    }

    /// Replaces the members of a group.
    ///
    /// # Errors
    ///
    /// Returns [`EntityError::NotFound`] if the group is unknown.
    pub fn set_members(&self, group_id: u16, members: Vec<String>) -> Result<(), EntityError> {
        let mut inner = self.inner.write();
        match inner.entities.get_mut(&EntityId::Group(group_id)) {
            Some(Entity::Group(group)) => {
                group.members = members;
                Ok(())
            }
            _ => Err(EntityError::NotFound(group_id.to_string())),
        }
    }

    /// Records that a device was heard from, returning the previous timestamp.
    ///
    /// Returns `None` if the device is unknown.
    pub fn touch(&self, address: &str, at: DateTime<Utc>) -> Option<Option<DateTime<Utc>>> {
        let mut inner = self.inner.write();
        let device = inner.device_mut(address)?;
        Some(device.last_seen.replace(at))
    }

    /// Sets the interviewing flag of a device.
    pub fn set_interviewing(&self, address: &str, interviewing: bool) {
        if let Some(device) = self.inner.write().device_mut(address) {
            device.interviewing = interviewing;
        }
    }

    /// Returns the number of entities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().entities.len()
    }

    /// Returns `true` if there are no entities.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().entities.is_empty()
    }
}

impl std::fmt::Debug for EntityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityRegistry")
            .field("entities", &self.len())
            .finish()
    }
}

fn validate_name(name: &str) -> Result<(), EntityError> {
    let invalid = name.is_empty()
        || name.contains(['+', '#'])
        || name.starts_with('/')
        || name.ends_with('/');
    if invalid {
        Err(EntityError::InvalidName(name.to_string()))
    } else {
        Ok(())
    }
}
