use chrono::Utc;
use parley_db::ChangeFeed;
use parley_types::api::NewMessage;
use parley_types::document::Document;
use parley_types::models::{Message, Route, User};
use parley_types::query::{Collection, Filter, Mutation, Query};
use serde_json::{Map, Value};
use tracing::warn;
use uuid::Uuid;

use crate::error::{NotFoundExt, SyncResult, ValidationError};
use crate::mentions::Draft;

/// Decode a `messages` document, skipping corrupt or misrouted ones.
pub fn decode_message(doc: &Document) -> Option<Message> {
    match doc.decode::<Message>() {
        Ok(message) if message.route().is_some() => Some(message),
        Ok(_) => {
            warn!("Skipping message {} without exactly one routing key", doc.id);
            None
        }
        Err(e) => {
            warn!("Skipping corrupt message {}: {}", doc.id, e);
            None
        }
    }
}

pub async fn fetch_message<F: ChangeFeed>(feed: &F, id: Uuid) -> SyncResult<Option<Message>> {
    let docs = feed
        .get(Query::new(Collection::Messages).filter(Filter::eq("id", id)))
        .await?;
    Ok(docs.first().and_then(decode_message))
}

/// Write a new message routed to `route`, optionally as a reply in `thread_id`.
pub async fn post_message<F: ChangeFeed>(
    feed: &F,
    author: &User,
    route: Route,
    thread_id: Option<Uuid>,
    draft: Draft,
) -> SyncResult<Message> {
    if draft.text.trim().is_empty() {
        return Err(ValidationError::EmptyMessage.into());
    }

    let (channel_id, recipient_id) = match route {
        Route::Channel(channel_id) => (Some(channel_id), None),
        Route::Direct(recipient_id) => (None, Some(recipient_id)),
    };

    let new = NewMessage {
        text: draft.text,
        user_id: author.uid,
        username: author.username.clone(),
        channel_id,
        recipient_id,
        thread_id,
        timestamp: Utc::now(),
        reactions: vec![],
        mentions: draft.mentions,
    };
    let outcome = feed.mutate(Mutation::insert(Collection::Messages, &new)?).await?;

    Ok(Message {
        id: outcome.id,
        text: new.text,
        user_id: new.user_id,
        username: new.username,
        channel_id: new.channel_id,
        recipient_id: new.recipient_id,
        thread_id: new.thread_id,
        timestamp: new.timestamp,
        reactions: new.reactions,
        mentions: new.mentions,
        edited: false,
        edited_at: None,
    })
}

/// Replace a message's text. Only its author may edit it.
pub async fn edit_message<F: ChangeFeed>(
    feed: &F,
    editor: Uuid,
    id: Uuid,
    draft: Draft,
) -> SyncResult<Option<Message>> {
    if draft.text.trim().is_empty() {
        return Err(ValidationError::EmptyMessage.into());
    }
    let Some(mut message) = fetch_message(feed, id).await? else {
        return Ok(None);
    };
    if message.user_id != editor {
        return Err(ValidationError::NotAuthor.into());
    }

    let edited_at = Utc::now();
    let mut fields = Map::new();
    fields.insert("text".into(), Value::String(draft.text.clone()));
    fields.insert("mentions".into(), serde_json::to_value(&draft.mentions)?);
    fields.insert("edited".into(), Value::Bool(true));
    fields.insert("editedAt".into(), Value::from(edited_at.timestamp_millis()));

    if feed
        .mutate(Mutation::update(Collection::Messages, id, fields))
        .await
        .found()?
        .is_none()
    {
        return Ok(None);
    }

    message.text = draft.text;
    message.mentions = draft.mentions;
    message.edited = true;
    message.edited_at = Some(edited_at);
    Ok(Some(message))
}

/// Returns false if the message was already gone.
pub async fn delete_message<F: ChangeFeed>(feed: &F, editor: Uuid, id: Uuid) -> SyncResult<bool> {
    let Some(message) = fetch_message(feed, id).await? else {
        return Ok(false);
    };
    if message.user_id != editor {
        return Err(ValidationError::NotAuthor.into());
    }

    Ok(feed
        .mutate(Mutation::delete(Collection::Messages, id))
        .await
        .found()?
        .is_some())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::ensure_user;
    use parley_db::Store;
    use serde_json::json;

    fn draft(text: &str) -> Draft {
        Draft {
            text: text.into(),
            mentions: vec![],
        }
    }

    #[tokio::test]
    async fn post_then_edit_marks_edited() {
        let store = Store::open_in_memory().unwrap();
        let ana = ensure_user(&store, "ana").await.unwrap();
        let channel = Uuid::new_v4();

        let posted = post_message(&store, &ana, Route::Channel(channel), None, draft("hello"))
            .await
            .unwrap();
        let fetched = fetch_message(&store, posted.id).await.unwrap().unwrap();
        assert_eq!(fetched.text, "hello");
        assert_eq!(fetched.channel_id, Some(channel));
        assert!(!fetched.edited);

        let edited = edit_message(&store, ana.uid, posted.id, draft("hello again"))
            .await
            .unwrap()
            .unwrap();
        assert!(edited.edited);

        let fetched = fetch_message(&store, posted.id).await.unwrap().unwrap();
        assert_eq!(fetched.text, "hello again");
        assert!(fetched.edited);
        assert!(fetched.edited_at.is_some());
    }

    #[tokio::test]
    async fn only_authors_change_messages() {
        let store = Store::open_in_memory().unwrap();
        let ana = ensure_user(&store, "ana").await.unwrap();
        let posted = post_message(&store, &ana, Route::Direct(Uuid::new_v4()), None, draft("hi"))
            .await
            .unwrap();

        let stranger = Uuid::new_v4();
        assert!(matches!(
            edit_message(&store, stranger, posted.id, draft("x")).await,
            Err(crate::SyncError::Validation(ValidationError::NotAuthor))
        ));
        assert!(matches!(
            delete_message(&store, stranger, posted.id).await,
            Err(crate::SyncError::Validation(ValidationError::NotAuthor))
        ));

        assert!(delete_message(&store, ana.uid, posted.id).await.unwrap());
        assert!(!delete_message(&store, ana.uid, posted.id).await.unwrap());
        assert!(edit_message(&store, ana.uid, posted.id, draft("x")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn misrouted_documents_are_skipped() {
        let store = Store::open_in_memory().unwrap();
        let data = json!({
            "text": "both", "userId": Uuid::new_v4(), "username": "x",
            "channelId": Uuid::new_v4(), "recipientId": Uuid::new_v4(), "timestamp": 1,
        });
        let Value::Object(data) = data else { unreachable!() };
        let outcome = store
            .mutate(Mutation::Insert { collection: Collection::Messages, data })
            .await
            .unwrap();
        assert!(fetch_message(&store, outcome.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn empty_text_is_rejected_before_writing() {
        let store = Store::open_in_memory().unwrap();
        let ana = ensure_user(&store, "ana").await.unwrap();
        let err = post_message(&store, &ana, Route::Channel(Uuid::new_v4()), None, draft("  "))
            .await
            .unwrap_err();
        assert!(matches!(err, crate::SyncError::Validation(ValidationError::EmptyMessage)));

        let all = store.get(Query::new(Collection::Messages)).await.unwrap();
        assert!(all.is_empty());
    }
}
