//! Mock collaborators for testing

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::{
    AdminReport, Directory, DirectoryUser, IdpProvider, MdmDevice, MdmProvider, MdmUser,
    Messenger, OutboundMessage, ProviderError, ProviderResult, UserFilter,
};

/// Mock MDM, IDP and chat directory for unit/integration testing
#[derive(Default)]
pub struct MockMdm {
    devices: Arc<Mutex<Vec<MdmDevice>>>,
    directory: Arc<Mutex<HashMap<String, DirectoryUser>>>,
    admin_groups: Arc<Mutex<HashMap<String, Vec<String>>>>,

    /// Configure device listing to fail
    pub fail_list: Arc<Mutex<bool>>,

    /// Latency added to every device listing
    pub list_delay: Arc<Mutex<Option<Duration>>>,
}

impl MockMdm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole device snapshot
    pub fn set_devices(&self, devices: Vec<MdmDevice>) {
        *self.devices.lock().unwrap() = devices;
    }

    /// Change one device's OS version
    pub fn set_os_version(&self, serial: &str, os_version: &str) {
        let mut devices = self.devices.lock().unwrap();
        if let Some(device) = devices.iter_mut().find(|d| d.serial_number == serial) {
            device.os_version = os_version.to_string();
        }
    }

    pub fn remove_device(&self, serial: &str) {
        self.devices
            .lock()
            .unwrap()
            .retain(|d| d.serial_number != serial);
    }

    /// Register a chat profile
    pub fn add_directory_user(&self, user: DirectoryUser) {
        self.directory
            .lock()
            .unwrap()
            .insert(user.email.to_lowercase(), user);
    }

    pub fn set_admin_group(&self, group_id: &str, members: Vec<String>) {
        self.admin_groups
            .lock()
            .unwrap()
            .insert(group_id.to_string(), members);
    }
}

#[async_trait]
impl MdmProvider for MockMdm {
    async fn list_devices(&self) -> ProviderResult<Vec<MdmDevice>> {
        let delay = *self.list_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if *self.fail_list.lock().unwrap() {
            return Err(ProviderError::Unavailable("mock MDM failure".into()));
        }
        Ok(self.devices.lock().unwrap().clone())
    }

    async fn get_users(&self, filter: &UserFilter) -> ProviderResult<Vec<MdmUser>> {
        let devices = self.devices.lock().unwrap();
        let mut users: Vec<MdmUser> = Vec::new();
        for device in devices.iter() {
            if !device.user.email.is_empty()
                && filter.matches(&device.user)
                && !users.iter().any(|u| u.email == device.user.email)
            {
                users.push(device.user.clone());
            }
        }
        Ok(users)
    }
}

#[async_trait]
impl IdpProvider for MockMdm {
    async fn admin_group(&self, group_id: &str) -> ProviderResult<Vec<String>> {
        self.admin_groups
            .lock()
            .unwrap()
            .get(group_id)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(format!("group {group_id}")))
    }
}

#[async_trait]
impl Directory for MockMdm {
    async fn lookup_by_email(&self, email: &str) -> ProviderResult<Option<DirectoryUser>> {
        Ok(self
            .directory
            .lock()
            .unwrap()
            .get(&email.to_lowercase())
            .cloned())
    }

    async fn manager_of(&self, slack_id: &str) -> ProviderResult<Option<String>> {
        Ok(self
            .directory
            .lock()
            .unwrap()
            .values()
            .find(|u| u.slack_id == slack_id)
            .and_then(|u| u.manager_slack_id.clone()))
    }
}

/// Mock messenger that records every delivered message
#[derive(Default)]
pub struct MockMessenger {
    sent: Arc<Mutex<Vec<OutboundMessage>>>,
    reports: Arc<Mutex<Vec<(Vec<String>, AdminReport)>>>,

    /// Configure sends to fail
    pub fail_send: Arc<Mutex<bool>>,

    /// Latency added to every send
    pub send_delay: Arc<Mutex<Option<Duration>>>,
}

impl MockMessenger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every message delivered so far
    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().unwrap().clone()
    }

    /// Messages of one kind
    pub fn sent_of(&self, kind: crate::MessageKind) -> Vec<OutboundMessage> {
        self.sent()
            .into_iter()
            .filter(|m| m.kind == kind)
            .collect()
    }

    pub fn reports(&self) -> Vec<(Vec<String>, AdminReport)> {
        self.reports.lock().unwrap().clone()
    }
}

#[async_trait]
impl Messenger for MockMessenger {
    async fn send(&self, message: &OutboundMessage) -> ProviderResult<()> {
        let delay = *self.send_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if *self.fail_send.lock().unwrap() {
            return Err(ProviderError::Unavailable("mock messenger failure".into()));
        }
        self.sent.lock().unwrap().push(message.clone());
        Ok(())
    }

    async fn send_admin_report(
        &self,
        recipients: &[String],
        report: &AdminReport,
    ) -> ProviderResult<()> {
        if *self.fail_send.lock().unwrap() {
            return Err(ProviderError::Unavailable("mock messenger failure".into()));
        }
        self.reports
            .lock()
            .unwrap()
            .push((recipients.to_vec(), report.clone()));
        Ok(())
    }
}
