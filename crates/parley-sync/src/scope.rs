use parley_types::models::{ConversationScope, Message};
use parley_types::query::{Collection, Filter, Query};
use uuid::Uuid;

/// Feed layout for a conversation scope, seen from user `me`.
pub trait ScopeExt {
    /// Routing filter shared by both feeds of a channel or DM scope.
    fn routing_filter(&self, me: Uuid) -> Filter;

    /// Messages of the scope ordered by timestamp. For a thread, the replies.
    fn primary_query(&self, me: Uuid) -> Query;

    /// Replies within a channel or DM, ordered by (thread, timestamp).
    /// For a thread, the root message itself.
    fn auxiliary_query(&self, me: Uuid) -> Query;

    /// Whether `message` is routed into the scope, replies included.
    fn routes(&self, me: Uuid, message: &Message) -> bool;

    /// Whether `message` belongs in the scope's primary ordered view.
    fn admits(&self, me: Uuid, message: &Message) -> bool;
}

impl ScopeExt for ConversationScope {
    fn routing_filter(&self, me: Uuid) -> Filter {
        match *self {
            Self::Channel(channel_id) => Filter::eq("channelId", channel_id),
            Self::DirectMessage(peer) => Filter::Or(vec![
                Filter::And(vec![Filter::eq("userId", me), Filter::eq("recipientId", peer)]),
                Filter::And(vec![Filter::eq("userId", peer), Filter::eq("recipientId", me)]),
            ]),
            Self::Thread(root_id) => Filter::eq("threadId", root_id),
        }
    }

    fn primary_query(&self, me: Uuid) -> Query {
        Query::new(Collection::Messages)
            .filter(self.routing_filter(me))
            .order_by("timestamp")
    }

    fn auxiliary_query(&self, me: Uuid) -> Query {
        match *self {
            Self::Thread(root_id) => {
                Query::new(Collection::Messages).filter(Filter::eq("id", root_id))
            }
            _ => Query::new(Collection::Messages)
                .filter(self.routing_filter(me))
                .filter(Filter::not_null("threadId"))
                .order_by("threadId")
                .order_by("timestamp"),
        }
    }

    fn routes(&self, me: Uuid, message: &Message) -> bool {
        match *self {
            Self::Channel(channel_id) => message.channel_id == Some(channel_id),
            Self::DirectMessage(peer) => message.is_between(me, peer),
            Self::Thread(root_id) => message.thread_id == Some(root_id),
        }
    }

    fn admits(&self, me: Uuid, message: &Message) -> bool {
        match self {
            Self::Thread(_) => self.routes(me, message),
            _ => self.routes(me, message) && !message.is_reply(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn message(user_id: Uuid, channel_id: Option<Uuid>, recipient_id: Option<Uuid>) -> Message {
        Message {
            id: Uuid::new_v4(),
            text: "x".into(),
            user_id,
            username: "u".into(),
            channel_id,
            recipient_id,
            thread_id: None,
            timestamp: Utc::now(),
            reactions: vec![],
            mentions: vec![],
            edited: false,
            edited_at: None,
        }
    }

    #[test]
    fn channel_scope_excludes_replies_and_other_channels() {
        let me = Uuid::new_v4();
        let channel = Uuid::new_v4();
        let scope = ConversationScope::Channel(channel);

        let top = message(me, Some(channel), None);
        let mut reply = message(me, Some(channel), None);
        reply.thread_id = Some(top.id);
        let elsewhere = message(me, Some(Uuid::new_v4()), None);

        assert!(scope.admits(me, &top));
        assert!(!scope.admits(me, &reply));
        assert!(scope.routes(me, &reply));
        assert!(!scope.admits(me, &elsewhere));
        assert!(ConversationScope::Thread(top.id).admits(me, &reply));
    }

    #[test]
    fn dm_scope_matches_both_directions_only() {
        let me = Uuid::new_v4();
        let peer = Uuid::new_v4();
        let scope = ConversationScope::DirectMessage(peer);

        assert!(scope.admits(me, &message(me, None, Some(peer))));
        assert!(scope.admits(me, &message(peer, None, Some(me))));
        assert!(!scope.admits(me, &message(peer, None, Some(Uuid::new_v4()))));
        assert!(!scope.admits(me, &message(me, Some(peer), None)));
    }

    #[test]
    fn auxiliary_feed_orders_by_thread_then_time() {
        let scope = ConversationScope::Channel(Uuid::new_v4());
        let query = scope.auxiliary_query(Uuid::new_v4());
        assert_eq!(query.order_by, vec!["threadId".to_string(), "timestamp".to_string()]);
    }
}
