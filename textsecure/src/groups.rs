//! Local group bookkeeping.
//!
//! Groups are a purely client-side construct: a 16-byte id, a name and a
//! member list, persisted in the store and updated when group contexts
//! arrive. Sending to a group fans out one session-encrypted copy per
//! member.

use serde::{Deserialize, Serialize};
use tracing::info;

use axolotl::crypto::random_bytes;

use crate::content::{group_type, GroupContext};
use crate::error::{Error, Result};
use crate::store::FileStore;

/// A group record as persisted under `groups/<hex id>`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Group {
    /// 16-byte group id
    pub id: Vec<u8>,
    /// Display name
    pub name: String,
    /// Member phone numbers, including our own
    pub members: Vec<String>,
}

impl Group {
    /// Create a group with a fresh random id.
    pub fn new(name: impl Into<String>, members: Vec<String>) -> Self {
        let mut id = [0u8; 16];
        random_bytes(&mut id);
        Group {
            id: id.to_vec(),
            name: name.into(),
            members,
        }
    }

    /// Hex form of the id, used as the store key.
    pub fn hex_id(&self) -> String {
        hex::encode(&self.id)
    }

    /// The UPDATE context announcing this group's current state.
    pub fn update_context(&self) -> GroupContext {
        GroupContext {
            id: self.id.clone(),
            group_type: group_type::UPDATE,
            name: Some(self.name.clone()),
            members: self.members.clone(),
        }
    }
}

/// Persist a group record.
pub fn store_group(store: &FileStore, group: &Group) -> Result<()> {
    let bytes = rmp_serde::to_vec(group)?;
    store.store_group(&group.hex_id(), &bytes)
}

/// Load a group by raw id.
pub fn load_group(store: &FileStore, id: &[u8]) -> Result<Option<Group>> {
    match store.load_group(&hex::encode(id))? {
        Some(bytes) => Ok(Some(rmp_serde::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

/// All known groups.
pub fn load_groups(store: &FileStore) -> Result<Vec<Group>> {
    store
        .groups()?
        .into_iter()
        .map(|bytes| rmp_serde::from_slice(&bytes).map_err(Into::into))
        .collect()
}

/// Find a group by display name.
pub fn find_group_by_name(store: &FileStore, name: &str) -> Result<Option<Group>> {
    Ok(load_groups(store)?.into_iter().find(|g| g.name == name))
}

/// Apply an incoming group context and return the group name the message
/// should be attributed to, if any.
pub fn apply_group_context(
    store: &FileStore,
    source: &str,
    context: &GroupContext,
) -> Result<Option<String>> {
    match context.group_type {
        group_type::UPDATE => {
            let group = Group {
                id: context.id.clone(),
                name: context.name.clone().unwrap_or_else(|| hex::encode(&context.id)),
                members: context.members.clone(),
            };
            info!("group update for {} from {source}", group.name);
            store_group(store, &group)?;
            Ok(Some(group.name))
        }
        group_type::DELIVER => Ok(load_group(store, &context.id)?
            .map(|g| g.name)
            .or_else(|| Some(hex::encode(&context.id)))),
        group_type::QUIT => match load_group(store, &context.id)? {
            Some(mut group) => {
                group.members.retain(|m| m != source);
                info!("{source} left group {}", group.name);
                store_group(store, &group)?;
                Ok(Some(group.name))
            }
            None => Ok(None),
        },
        other => Err(Error::Codec(format!("unknown group context type {other}"))),
    }
}
