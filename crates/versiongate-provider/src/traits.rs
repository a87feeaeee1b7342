//! Collaborator traits

use async_trait::async_trait;
use thiserror::Error;
use versiongate_util::ComplianceError;

use crate::{
    AdminReport, DeviceFilter, DirectoryUser, MdmDevice, MdmUser, MessageKind, OutboundMessage,
    ReminderPayload, UserFilter,
};

/// Errors from collaborator calls
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Provider unavailable: {0}")]
    Unavailable(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        ProviderError::Http(e.to_string())
    }
}

impl From<serde_json::Error> for ProviderError {
    fn from(e: serde_json::Error) -> Self {
        ProviderError::Parse(e.to_string())
    }
}

impl From<ProviderError> for ComplianceError {
    fn from(e: ProviderError) -> Self {
        match e {
            ProviderError::NotFound(what) => ComplianceError::NotFound(what),
            other => ComplianceError::Upstream(other.to_string()),
        }
    }
}

pub type ProviderResult<T> = Result<T, ProviderError>;

/// Source of truth for device inventory and OS version
#[async_trait]
pub trait MdmProvider: Send + Sync {
    /// Every managed device
    async fn list_devices(&self) -> ProviderResult<Vec<MdmDevice>>;

    /// Devices matching a filter
    async fn query_devices(&self, filter: &DeviceFilter) -> ProviderResult<Vec<MdmDevice>> {
        let devices = self.list_devices().await?;
        Ok(devices.into_iter().filter(|d| filter.matches(d)).collect())
    }

    /// One device by MDM id
    async fn get_device(&self, device_id: &str) -> ProviderResult<MdmDevice> {
        self.list_devices()
            .await?
            .into_iter()
            .find(|d| d.device_id == device_id)
            .ok_or_else(|| ProviderError::NotFound(format!("device {device_id}")))
    }

    /// Device owners matching a filter
    async fn get_users(&self, filter: &UserFilter) -> ProviderResult<Vec<MdmUser>>;
}

/// Identity provider
#[async_trait]
pub trait IdpProvider: Send + Sync {
    /// Email addresses of the members of an admin group
    async fn admin_group(&self, group_id: &str) -> ProviderResult<Vec<String>>;
}

/// Chat directory
#[async_trait]
pub trait Directory: Send + Sync {
    /// Resolve an email to a chat profile; `None` when no such user exists
    async fn lookup_by_email(&self, email: &str) -> ProviderResult<Option<DirectoryUser>>;

    /// Chat id of a user's manager, if known
    async fn manager_of(&self, slack_id: &str) -> ProviderResult<Option<String>>;
}

/// Outbound messaging channel
#[async_trait]
pub trait Messenger: Send + Sync {
    /// Deliver one message
    async fn send(&self, message: &OutboundMessage) -> ProviderResult<()>;

    /// Text of the first compliance notice
    fn first_message(&self, required_version: &str, deadline: &str) -> String {
        format!(
            "Hello, you are receiving this message because your laptop's OS is out of date.\n\
             Your device must be on {required_version} or later by {deadline}."
        )
    }

    /// Deliver a user-requested reminder that has come due
    async fn reminder_message(&self, payload: &ReminderPayload) -> ProviderResult<()> {
        self.send(&payload.to_message()).await
    }

    /// Deliver the daily report to each recipient
    async fn send_admin_report(
        &self,
        recipients: &[String],
        report: &AdminReport,
    ) -> ProviderResult<()> {
        let text = report.render();
        for recipient in recipients {
            self.send(&OutboundMessage::new(MessageKind::Report, recipient, &text))
                .await?;
        }
        Ok(())
    }
}
