//! Topic resolution
//!
//! Maps an identity onto the two broker destinations it listens on. The identity
//! kind is part of every destination, so a customer and a shop sharing a raw id
//! never collide, and the id segment is percent-encoded so it cannot smuggle in
//! extra path segments.

use crate::types::Identity;

/// Default destination prefix used by the notification broker.
pub const DEFAULT_TOPIC_PREFIX: &str = "/topic";

/// Logical channel a topic carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Newly created notifications
    NewItem,
    /// Read/delete updates to existing notifications
    Mutation,
}

/// A broker destination bound to an identity and channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic {
    pub channel: Channel,
    pub identity: Identity,
    pub destination: String,
}

/// The pair of topics every identity subscribes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPair {
    pub new_item: Topic,
    pub mutation: Topic,
}

impl TopicPair {
    pub fn to_vec(&self) -> Vec<Topic> {
        vec![self.new_item.clone(), self.mutation.clone()]
    }
}

/// Resolve topics using the default prefix.
pub fn resolve(identity: &Identity) -> TopicPair {
    resolve_with_prefix(DEFAULT_TOPIC_PREFIX, identity)
}

/// Resolve topics under a custom destination prefix.
pub fn resolve_with_prefix(prefix: &str, identity: &Identity) -> TopicPair {
    let base = format!(
        "{}/{}/{}",
        prefix.trim_end_matches('/'),
        identity.kind.segment(),
        urlencoding::encode(&identity.id)
    );

    TopicPair {
        new_item: Topic {
            channel: Channel::NewItem,
            identity: identity.clone(),
            destination: base.clone(),
        },
        mutation: Topic {
            channel: Channel::Mutation,
            identity: identity.clone(),
            destination: format!("{}/updates", base),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Identity;

    #[test]
    fn test_customer_topics() {
        let pair = resolve(&Identity::customer("u1"));
        assert_eq!(pair.new_item.destination, "/topic/user/u1");
        assert_eq!(pair.mutation.destination, "/topic/user/u1/updates");
        assert_eq!(pair.new_item.channel, Channel::NewItem);
        assert_eq!(pair.mutation.channel, Channel::Mutation);
    }

    #[test]
    fn test_shop_topics() {
        let pair = resolve(&Identity::shop("s9"));
        assert_eq!(pair.new_item.destination, "/topic/shop/s9");
        assert_eq!(pair.mutation.destination, "/topic/shop/s9/updates");
    }

    #[test]
    fn test_same_id_different_kind_does_not_collide() {
        let customer = resolve(&Identity::customer("42")).to_vec();
        let shop = resolve(&Identity::shop("42")).to_vec();
        for c in &customer {
            assert!(shop.iter().all(|s| s.destination != c.destination));
        }
    }

    #[test]
    fn test_slash_in_id_cannot_forge_mutation_topic() {
        let forged = resolve(&Identity::customer("x/updates"));
        let victim = resolve(&Identity::customer("x"));
        assert_ne!(forged.new_item.destination, victim.mutation.destination);
        assert_eq!(forged.new_item.destination, "/topic/user/x%2Fupdates");
    }

    #[test]
    fn test_custom_prefix() {
        let pair = resolve_with_prefix("/exchange/", &Identity::customer("u1"));
        assert_eq!(pair.new_item.destination, "/exchange/user/u1");
    }
}
