//! Contact resolution with tiered fallback
//!
//! Turns the raw conversation list from the channel into a deduplicated,
//! human-usable contact directory for recipient selection. Strategies run
//! in a fixed order and the chain stops at the first tier that produces a
//! non-empty list:
//!
//! ```text
//! Direct chats (precise, per-item name lookups)
//!      ↓ empty or failed
//! Conversations with message history (names from metadata, cheaper)
//!      ↓ empty or failed
//! Bulk contact directory (when the channel has one)
//!      ↓ empty or failed
//! Synthetic manual-entry placeholder
//! ```
//!
//! The resolver never returns an empty list: when every tier fails, the
//! caller gets the placeholder and the UI asks the operator to type a
//! number.

use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::session::SessionManager;
use crate::transport::{ChannelAddress, ChannelSession};
use crate::types::{CourierError, Result};

/// Address of the synthetic placeholder contact
pub const MANUAL_ENTRY_ADDRESS: &str = "manual-entry";

/// A deliverable contact. Transient: resolved on demand, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub id: String,
    pub display_name: String,
    pub channel_address: ChannelAddress,
}

impl Contact {
    fn new(address: ChannelAddress, display_name: String) -> Self {
        Self {
            id: address.as_str().to_string(),
            display_name,
            channel_address: address,
        }
    }

    /// Whether this is the manual-entry placeholder
    pub fn is_placeholder(&self) -> bool {
        self.channel_address.as_str() == MANUAL_ENTRY_ADDRESS
    }
}

/// Resolution strategies in fallback order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResolverTier {
    DirectChats,
    MessageHistory,
    Directory,
}

impl ResolverTier {
    const CHAIN: [ResolverTier; 3] = [
        ResolverTier::DirectChats,
        ResolverTier::MessageHistory,
        ResolverTier::Directory,
    ];

    fn as_str(&self) -> &'static str {
        match self {
            ResolverTier::DirectChats => "direct_chats",
            ResolverTier::MessageHistory => "message_history",
            ResolverTier::Directory => "directory",
        }
    }
}

/// Counters for which tier served each resolution
#[derive(Debug, Clone, Default, Serialize)]
pub struct ResolverStats {
    pub resolution_count: u64,
    pub direct_hits: u64,
    pub history_fallbacks: u64,
    pub directory_fallbacks: u64,
    pub placeholder_fallbacks: u64,
}

/// Tiered contact resolver
pub struct ContactResolver {
    manager: Arc<SessionManager>,
    stats: std::sync::RwLock<ResolverStats>,
}

impl ContactResolver {
    pub fn new(manager: Arc<SessionManager>) -> Self {
        Self {
            manager,
            stats: std::sync::RwLock::new(ResolverStats::default()),
        }
    }

    /// Resolve the contact directory through the current session.
    ///
    /// Infallible by contract: with no usable session, or with every tier
    /// failing, the manual-entry placeholder is returned instead of an
    /// error or an empty list.
    pub async fn resolve(&self) -> Vec<Contact> {
        let session = self.manager.current_session().await;
        self.resolve_with(session).await
    }

    /// Resolution against an explicit session handle
    pub async fn resolve_with(&self, session: Option<Arc<dyn ChannelSession>>) -> Vec<Contact> {
        let Some(session) = session else {
            warn!("No ready session for contact resolution, returning placeholder");
            self.bump(|s| s.placeholder_fallbacks += 1);
            return vec![placeholder_contact()];
        };

        for tier in ResolverTier::CHAIN {
            match self.run_tier(&session, tier).await {
                Ok(contacts) if !contacts.is_empty() => {
                    debug!(
                        tier = tier.as_str(),
                        count = contacts.len(),
                        "Contact tier produced results"
                    );
                    self.bump(|s| match tier {
                        ResolverTier::DirectChats => s.direct_hits += 1,
                        ResolverTier::MessageHistory => s.history_fallbacks += 1,
                        ResolverTier::Directory => s.directory_fallbacks += 1,
                    });
                    return dedup_and_sort(contacts);
                }
                Ok(_) => {
                    debug!(tier = tier.as_str(), "Contact tier empty, falling through");
                }
                Err(e) => {
                    warn!(tier = tier.as_str(), error = %e, "Contact tier failed, falling through");
                }
            }
        }

        self.bump(|s| s.placeholder_fallbacks += 1);
        vec![placeholder_contact()]
    }

    pub fn stats(&self) -> ResolverStats {
        self.stats.read().map(|s| s.clone()).unwrap_or_default()
    }

    fn bump(&self, f: impl FnOnce(&mut ResolverStats)) {
        if let Ok(mut stats) = self.stats.write() {
            stats.resolution_count += 1;
            f(&mut stats);
        }
    }

    async fn run_tier(
        &self,
        session: &Arc<dyn ChannelSession>,
        tier: ResolverTier,
    ) -> Result<Vec<Contact>> {
        match tier {
            ResolverTier::DirectChats => direct_chats(session).await,
            ResolverTier::MessageHistory => message_history(session).await,
            ResolverTier::Directory => directory(session).await,
        }
    }
}

/// Primary: one-to-one conversations with a per-conversation name lookup.
/// A failed lookup skips that entry instead of aborting the batch.
async fn direct_chats(session: &Arc<dyn ChannelSession>) -> Result<Vec<Contact>> {
    let conversations = session.list_conversations().await?;
    let mut contacts = Vec::new();
    for conversation in conversations.into_iter().filter(|c| c.is_direct()) {
        let name = match session.conversation_name(&conversation.address).await {
            Ok(name) => name,
            Err(e) => {
                debug!(address = %conversation.address, error = %e, "Name lookup failed, skipping entry");
                continue;
            }
        };
        let display_name = name
            .or(conversation.name)
            .unwrap_or_else(|| conversation.address.as_str().to_string());
        contacts.push(Contact::new(conversation.address, display_name));
    }
    Ok(contacts)
}

/// Secondary: conversations with prior message history, names taken from
/// conversation metadata without per-item lookups.
async fn message_history(session: &Arc<dyn ChannelSession>) -> Result<Vec<Contact>> {
    let conversations = session.list_conversations().await?;
    Ok(conversations
        .into_iter()
        .filter(|c| c.has_history)
        .map(|c| {
            let display_name = c
                .name
                .clone()
                .unwrap_or_else(|| c.address.as_str().to_string());
            Contact::new(c.address, display_name)
        })
        .collect())
}

/// Tertiary: the channel's bulk contact directory, minus group identities
async fn directory(session: &Arc<dyn ChannelSession>) -> Result<Vec<Contact>> {
    let entries = session.list_directory().await.map_err(|e| {
        CourierError::Resolution(format!("directory listing unavailable: {e}"))
    })?;
    Ok(entries
        .into_iter()
        .filter(|e| !e.is_group)
        .map(|e| {
            let display_name = e
                .display_name
                .clone()
                .unwrap_or_else(|| e.address.as_str().to_string());
            Contact::new(e.address, display_name)
        })
        .collect())
}

/// Dedup by channel address (first occurrence wins), then sort by display
/// name case-insensitively
fn dedup_and_sort(contacts: Vec<Contact>) -> Vec<Contact> {
    let mut seen = HashSet::new();
    let mut out: Vec<Contact> = contacts
        .into_iter()
        .filter(|c| seen.insert(c.channel_address.clone()))
        .collect();
    out.sort_by_key(|c| c.display_name.to_lowercase());
    out
}

fn placeholder_contact() -> Contact {
    Contact {
        id: MANUAL_ENTRY_ADDRESS.to_string(),
        display_name: "No contacts available, enter a number manually".to_string(),
        channel_address: ChannelAddress::new(MANUAL_ENTRY_ADDRESS),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::NotificationBus;
    use crate::session::SessionConfig;
    use crate::transport::mock::{MockSession, MockTransport};
    use crate::transport::{Conversation, ConversationKind, DirectoryEntry};

    fn resolver() -> ContactResolver {
        let manager = Arc::new(SessionManager::new(
            Arc::new(MockTransport::new()),
            NotificationBus::new(),
            SessionConfig::default(),
        ));
        ContactResolver::new(manager)
    }

    fn direct(address: &str, name: Option<&str>, has_history: bool) -> Conversation {
        Conversation {
            address: ChannelAddress::new(address),
            kind: ConversationKind::Direct,
            name: name.map(str::to_string),
            has_history,
        }
    }

    fn group(address: &str, name: &str) -> Conversation {
        Conversation {
            address: ChannelAddress::new(address),
            kind: ConversationKind::Group,
            name: Some(name.to_string()),
            has_history: true,
        }
    }

    #[tokio::test]
    async fn test_direct_chats_tier_with_name_lookups() {
        let (session, _events) = MockSession::standalone();
        session.set_conversations(vec![
            direct("111@dm", None, true),
            direct("222@dm", Some("meta-name"), false),
            group("g1@group", "Builders"),
        ]);
        session.set_name("111@dm", "Zoe");
        session.set_name("222@dm", "Alan");

        let resolver = resolver();
        let contacts = resolver.resolve_with(Some(session)).await;

        // Groups filtered, sorted case-insensitively by display name
        assert_eq!(contacts.len(), 2);
        assert_eq!(contacts[0].display_name, "Alan");
        assert_eq!(contacts[1].display_name, "Zoe");
        assert_eq!(contacts[1].channel_address.as_str(), "111@dm");
        assert_eq!(resolver.stats().direct_hits, 1);
    }

    #[tokio::test]
    async fn test_per_item_name_failure_skips_entry() {
        let (session, _events) = MockSession::standalone();
        session.set_conversations(vec![
            direct("111@dm", None, true),
            direct("222@dm", None, true),
        ]);
        session.set_name("111@dm", "Zoe");
        session.fail_name_lookup("222@dm");

        let contacts = resolver().resolve_with(Some(session)).await;
        assert_eq!(contacts.len(), 1);
        assert_eq!(contacts[0].display_name, "Zoe");
    }

    #[tokio::test]
    async fn test_empty_primary_falls_back_to_history() {
        let (session, _events) = MockSession::standalone();
        // Only groups: primary yields nothing, history tier picks up the
        // group with prior messages from metadata
        session.set_conversations(vec![group("g1@group", "Builders")]);

        let resolver = resolver();
        let contacts = resolver.resolve_with(Some(session.clone())).await;

        assert_eq!(contacts.len(), 1);
        assert_eq!(contacts[0].display_name, "Builders");
        assert_eq!(resolver.stats().history_fallbacks, 1);
        // Primary + secondary each listed once; tertiary never ran
        assert_eq!(session.list_conversations_count(), 2);
        assert_eq!(session.directory_count(), 0);
    }

    #[tokio::test]
    async fn test_listing_failure_falls_back_to_directory() {
        let (session, _events) = MockSession::standalone();
        session.fail_list_conversations(true);
        session.set_directory(vec![
            DirectoryEntry {
                address: ChannelAddress::new("333@dm"),
                display_name: Some("Cara".to_string()),
                is_group: false,
            },
            DirectoryEntry {
                address: ChannelAddress::new("g2@group"),
                display_name: Some("Suppliers".to_string()),
                is_group: true,
            },
        ]);

        let resolver = resolver();
        let contacts = resolver.resolve_with(Some(session)).await;

        assert_eq!(contacts.len(), 1);
        assert_eq!(contacts[0].display_name, "Cara");
        assert_eq!(resolver.stats().directory_fallbacks, 1);
    }

    #[tokio::test]
    async fn test_all_tiers_failing_yields_placeholder() {
        let (session, _events) = MockSession::standalone();
        session.fail_list_conversations(true);
        // No directory configured: tertiary errors too

        let resolver = resolver();
        let contacts = resolver.resolve_with(Some(session)).await;

        assert_eq!(contacts.len(), 1);
        assert!(contacts[0].is_placeholder());
        assert_eq!(resolver.stats().placeholder_fallbacks, 1);
    }

    #[tokio::test]
    async fn test_no_session_yields_placeholder() {
        let contacts = resolver().resolve_with(None).await;
        assert_eq!(contacts.len(), 1);
        assert!(contacts[0].is_placeholder());
    }

    #[tokio::test]
    async fn test_dedup_first_occurrence_wins() {
        let (session, _events) = MockSession::standalone();
        session.set_conversations(vec![
            direct("111@dm", Some("First"), true),
            direct("111@dm", Some("Second"), true),
        ]);

        let contacts = resolver().resolve_with(Some(session)).await;
        assert_eq!(contacts.len(), 1);
        assert_eq!(contacts[0].display_name, "First");
    }
}
