//! Static channel → sender registry.

use super::{ChannelSender, InAppInbox, InAppSender, TeamBroadcastSender};
use crate::models::Channel;
use std::collections::HashMap;
use std::sync::Arc;

/// Maps each channel to the sender that serves it.
///
/// Built once at startup and shared read-only by every worker. A channel with
/// no entry is a deployment error: its jobs fail as `UnsupportedChannel`.
#[derive(Clone, Default)]
pub struct ChannelRegistry {
    senders: HashMap<Channel, Arc<dyn ChannelSender>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the in-process senders: team, user, in-app and
    /// scheduled-user, all writing into `inbox`.
    pub fn with_inbox(inbox: InAppInbox) -> Self {
        let in_app: Arc<dyn ChannelSender> = Arc::new(InAppSender::new(inbox.clone()));
        Self::new()
            .register(Channel::Team, Arc::new(TeamBroadcastSender::new(inbox)))
            .register(Channel::User, in_app.clone())
            .register(Channel::InApp, in_app.clone())
            .register(Channel::ScheduledUser, in_app)
    }

    /// Register (or replace) the sender for a channel.
    pub fn register(mut self, channel: Channel, sender: Arc<dyn ChannelSender>) -> Self {
        self.senders.insert(channel, sender);
        self
    }

    pub fn get(&self, channel: Channel) -> Option<Arc<dyn ChannelSender>> {
        self.senders.get(&channel).cloned()
    }

    pub fn supports(&self, channel: Channel) -> bool {
        self.senders.contains_key(&channel)
    }

    /// Registered channels, sorted by name.
    pub fn channels(&self) -> Vec<Channel> {
        let mut channels: Vec<Channel> = self.senders.keys().copied().collect();
        channels.sort_by_key(|c| c.to_string());
        channels
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::{MockChannelSender, Outcome};

    #[test]
    fn test_with_inbox_registers_in_process_channels() {
        let registry = ChannelRegistry::with_inbox(InAppInbox::new());
        assert_eq!(
            registry.channels(),
            vec![Channel::InApp, Channel::ScheduledUser, Channel::Team, Channel::User]
        );
        assert!(!registry.supports(Channel::Push));
        assert!(registry.get(Channel::Email).is_none());
        assert_eq!(registry.get(Channel::Team).unwrap().name(), "team");
    }

    #[tokio::test]
    async fn test_register_replaces_sender() {
        let mut sender = MockChannelSender::new();
        sender.expect_name().return_const("mock-sms");
        sender.expect_send().returning(|_, _| Outcome::Sent);

        let registry = ChannelRegistry::new().register(Channel::Sms, Arc::new(sender));
        assert!(registry.supports(Channel::Sms));
        assert_eq!(registry.get(Channel::Sms).unwrap().name(), "mock-sms");
    }
}
