//! File-backed MDM, IDP and directory
//!
//! Reads a JSON snapshot exported from the fleet systems. The file is
//! re-read on every call so an external exporter can refresh it while the
//! daemon runs.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::{
    Directory, DirectoryUser, IdpProvider, MdmDevice, MdmProvider, MdmUser, ProviderError,
    ProviderResult, UserFilter,
};

/// On-disk inventory layout
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Inventory {
    #[serde(default)]
    pub devices: Vec<MdmDevice>,
    #[serde(default)]
    pub users: Vec<DirectoryUser>,
    #[serde(default)]
    pub admin_groups: HashMap<String, Vec<String>>,
}

/// Inventory provider backed by a JSON file
pub struct InventoryProvider {
    path: PathBuf,
}

impl InventoryProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> ProviderResult<Inventory> {
        let content = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            ProviderError::Unavailable(format!("reading {}: {e}", self.path.display()))
        })?;
        let inventory: Inventory = serde_json::from_str(&content)?;
        debug!(
            path = %self.path.display(),
            devices = inventory.devices.len(),
            users = inventory.users.len(),
            "Inventory loaded"
        );
        Ok(inventory)
    }
}

#[async_trait]
impl MdmProvider for InventoryProvider {
    async fn list_devices(&self) -> ProviderResult<Vec<MdmDevice>> {
        Ok(self.load().await?.devices)
    }

    async fn get_users(&self, filter: &UserFilter) -> ProviderResult<Vec<MdmUser>> {
        let mut users: Vec<MdmUser> = Vec::new();
        for device in self.load().await?.devices {
            if !device.user.email.is_empty()
                && filter.matches(&device.user)
                && !users.iter().any(|u| u.email == device.user.email)
            {
                users.push(device.user);
            }
        }
        Ok(users)
    }
}

#[async_trait]
impl IdpProvider for InventoryProvider {
    async fn admin_group(&self, group_id: &str) -> ProviderResult<Vec<String>> {
        self.load()
            .await?
            .admin_groups
            .remove(group_id)
            .ok_or_else(|| ProviderError::NotFound(format!("group {group_id}")))
    }
}

#[async_trait]
impl Directory for InventoryProvider {
    async fn lookup_by_email(&self, email: &str) -> ProviderResult<Option<DirectoryUser>> {
        Ok(self
            .load()
            .await?
            .users
            .into_iter()
            .find(|u| u.email.eq_ignore_ascii_case(email)))
    }

    async fn manager_of(&self, slack_id: &str) -> ProviderResult<Option<String>> {
        Ok(self
            .load()
            .await?
            .users
            .into_iter()
            .find(|u| u.slack_id == slack_id)
            .and_then(|u| u.manager_slack_id))
    }
}
