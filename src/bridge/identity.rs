use serde::{Deserialize, Serialize};

/// Who sent a chat line, and where.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatIdentity {
    pub user_id: String,
    /// Display name, when the platform provides one.
    pub username: Option<String>,
    pub platform: String,
    /// Group (guild) id; `None` in private chats.
    pub group_id: Option<String>,
    pub channel_id: String,
}

impl ChatIdentity {
    pub fn new(
        user_id: impl Into<String>,
        platform: impl Into<String>,
        channel_id: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            username: None,
            platform: platform.into(),
            group_id: None,
            channel_id: channel_id.into(),
        }
    }

    pub fn with_group(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn is_private(&self) -> bool {
        self.group_id.is_none()
    }

    /// Group id for keyed data; private chats use the channel id.
    pub fn data_group(&self) -> &str {
        self.group_id.as_deref().unwrap_or(&self.channel_id)
    }

    /// Group id for card bindings; empty in private chats.
    pub fn binding_group(&self) -> &str {
        self.group_id.as_deref().unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_resolution() {
        let private = ChatIdentity::new("u1", "qq", "dm-1");
        assert!(private.is_private());
        assert_eq!(private.data_group(), "dm-1");
        assert_eq!(private.binding_group(), "");

        let group = ChatIdentity::new("u1", "qq", "chan").with_group("g1");
        assert!(!group.is_private());
        assert_eq!(group.data_group(), "g1");
        assert_eq!(group.binding_group(), "g1");
    }
}
