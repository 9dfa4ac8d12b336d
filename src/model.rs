use std::fmt::{Debug, Display, Formatter};
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::crypto::identity::PublicKey;


/// Opaque, directory-assigned identity of a user
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> UserId {
        UserId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}
impl Debug for UserId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl Display for UserId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl From<&str> for UserId {
    fn from(value: &str) -> Self {
        UserId(value.to_string())
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub public_key: PublicKey,
}

/// A user as known to the directory, plus the network address it was last seen at
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct UserData {
    pub user: User,
    pub ip: Option<IpAddr>,
}

impl UserData {
    pub fn id(&self) -> &UserId {
        &self.user.id
    }
}

/// The application-level message. This is what gets sealed into an envelope, so it is never
///  visible to relaying nodes.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub sender: User,
    pub content: String,
    /// millis since epoch
    pub created_time: u64,
    pub chat_index: u64,
}

/// Identifies one message for one recipient. The message id is assigned by the sender and
///  unique across the network.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct MessageTarget {
    pub id: String,
    pub target: UserId,
}

impl MessageTarget {
    pub fn new(id: impl Into<String>, target: UserId) -> MessageTarget {
        MessageTarget {
            id: id.into(),
            target,
        }
    }

    pub fn new_random(target: UserId) -> MessageTarget {
        MessageTarget::new(uuid::Uuid::new_v4().to_string(), target)
    }
}
impl Debug for MessageTarget {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}->{}]", self.id, self.target)
    }
}

/// The unit that travels between peers and sits in the pending store: an (encrypted) envelope
///  and the information needed to route it.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct PendingMessage {
    pub target: MessageTarget,
    #[serde(with = "crate::util::base64_bytes")]
    pub content: Vec<u8>,
}

impl PendingMessage {
    pub fn new(target: MessageTarget, content: Vec<u8>) -> PendingMessage {
        PendingMessage {
            target,
            content,
        }
    }
}

/// Pending message targets split by retention class, permanently immune ones first in
///  processing order
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct PendingMessageTargetLists {
    pub immune: Vec<MessageTarget>,
    pub non_immune: Vec<MessageTarget>,
}

impl PendingMessageTargetLists {
    pub fn is_empty(&self) -> bool {
        self.immune.is_empty() && self.non_immune.is_empty()
    }

    pub fn all(&self) -> impl Iterator<Item = &MessageTarget> {
        self.immune.iter().chain(self.non_immune.iter())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::keys::test_identity;

    #[test]
    fn test_pending_message_json_shape() {
        let msg = PendingMessage::new(MessageTarget::new("m1", UserId::from("bob")), b"abc".to_vec());
        let json = serde_json::to_value(&msg).unwrap();

        assert_eq!(json, serde_json::json!({
            "target": { "id": "m1", "target": "bob" },
            "content": "YWJj",
        }));

        let parsed: PendingMessage = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_chat_message_json() {
        let identity = test_identity(1);
        let msg = ChatMessage {
            sender: User {
                id: UserId::from("alice"),
                name: "Alice".to_string(),
                public_key: identity.public_key(),
            },
            content: "hi".to_string(),
            created_time: 1234,
            chat_index: 7,
        };

        let json = serde_json::to_string(&msg).unwrap();
        let parsed: ChatMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_target_lists_all() {
        let lists = PendingMessageTargetLists {
            immune: vec![MessageTarget::new("1", UserId::from("a"))],
            non_immune: vec![MessageTarget::new("2", UserId::from("b"))],
        };
        let ids = lists.all().map(|t| t.id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["1", "2"]);
        assert!(!lists.is_empty());
        assert!(PendingMessageTargetLists::default().is_empty());
    }
}
