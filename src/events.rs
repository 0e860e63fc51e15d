use serde::{Deserialize, Serialize};

use crate::models::{Settings, SnoozedItem};

pub const EVENT_STATE_UPDATED: &str = "state_updated";

#[derive(Debug, Clone, Serialize)]
pub struct StatePayload {
    pub items: Vec<SnoozedItem>,
    pub settings: Settings,
}

/// One tab to reopen, handed to the host's tab restorer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct RestoreRequest {
    pub item_id: String,
    pub url: String,
    pub title: String,
    pub favicon: Option<String>,
    pub group_id: Option<String>,
    pub index: Option<u32>,
}

impl From<&SnoozedItem> for RestoreRequest {
    fn from(item: &SnoozedItem) -> Self {
        Self {
            item_id: item.id.clone(),
            url: item.url.clone(),
            title: item.title.clone(),
            favicon: item.favicon.clone(),
            group_id: item.group_id.clone(),
            index: item.index,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct RestoreOutcome {
    pub item_id: String,
    pub restored: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum NotificationKind {
    StorageWarning,
    RecoveryNotification,
    RestoreFailed,
}

impl NotificationKind {
    /// Stable identifier the host uses for the notification.
    pub fn id(&self) -> &'static str {
        match self {
            NotificationKind::StorageWarning => "storage-warning",
            NotificationKind::RecoveryNotification => "recovery-notification",
            NotificationKind::RestoreFailed => "restore-failed",
        }
    }
}

/// Where clicking a notification leads. Every notification opens the options
/// view; failed restores additionally filter it down to the failed items.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct OptionsRoute {
    pub page: String,
    pub failed_only: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct Notification {
    pub kind: NotificationKind,
    pub message: String,
    pub route: OptionsRoute,
}

impl Notification {
    pub fn new(kind: NotificationKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            route: OptionsRoute {
                page: "options".to_string(),
                failed_only: kind == NotificationKind::RestoreFailed,
            },
        }
    }

    pub fn id(&self) -> &'static str {
        self.kind.id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notification_ids_match_host_identifiers() {
        assert_eq!(NotificationKind::StorageWarning.id(), "storage-warning");
        assert_eq!(
            NotificationKind::RecoveryNotification.id(),
            "recovery-notification"
        );
        assert_eq!(NotificationKind::RestoreFailed.id(), "restore-failed");
        assert_eq!(
            serde_json::to_value(NotificationKind::RestoreFailed).unwrap(),
            serde_json::json!("restore-failed")
        );
    }

    #[test]
    fn every_notification_routes_to_options_and_only_failures_filter() {
        let warning = Notification::new(NotificationKind::StorageWarning, "almost full");
        assert_eq!(warning.route.page, "options");
        assert!(!warning.route.failed_only);

        let failed = Notification::new(NotificationKind::RestoreFailed, "1 tab");
        assert_eq!(failed.id(), "restore-failed");
        assert!(failed.route.failed_only);
    }

    #[test]
    fn restore_request_copies_display_payload() {
        let item = SnoozedItem {
            id: "a".to_string(),
            url: "https://example.com".to_string(),
            title: "Example".to_string(),
            favicon: Some("icon.png".to_string()),
            creation_time: 1,
            pop_time: 2,
            group_id: Some("g".to_string()),
            index: Some(3),
        };
        let request = RestoreRequest::from(&item);
        assert_eq!(request.item_id, "a");
        assert_eq!(request.favicon.as_deref(), Some("icon.png"));
        assert_eq!(request.group_id.as_deref(), Some("g"));
        assert_eq!(request.index, Some(3));
    }
}
