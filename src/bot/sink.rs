use async_trait::async_trait;
use serenity::{
    builder::{CreateMessage, EditMessage},
    http::Http,
    model::id::{ChannelId, MessageId},
};
use std::sync::Arc;

use crate::{
    audio::backend::{MessageRef, NotificationSink, Outgoing},
    error::SinkError,
    ui::{buttons, embeds},
};

/// Posts a guild's notices and now-playing card into the text channel where
/// playback was requested.
pub struct ChannelSink {
    http: Arc<Http>,
    channel_id: ChannelId,
}

impl ChannelSink {
    pub fn new(http: Arc<Http>, channel_id: ChannelId) -> Self {
        Self { http, channel_id }
    }
}

fn message_id(message: MessageRef) -> Result<MessageId, SinkError> {
    if message.0 == 0 {
        return Err(SinkError("id de mensaje inválido".to_string()));
    }
    Ok(MessageId::new(message.0))
}

#[async_trait]
impl NotificationSink for ChannelSink {
    async fn post(&self, content: Outgoing) -> Result<MessageRef, SinkError> {
        let builder = match content {
            Outgoing::Notice(text) => CreateMessage::new().content(text),
            Outgoing::NowPlaying(card) => CreateMessage::new()
                .embed(embeds::now_playing_embed(&card))
                .components(buttons::player_controls(card.is_playing, card.loop_mode)),
        };

        let message = self
            .channel_id
            .send_message(&self.http, builder)
            .await
            .map_err(|e| SinkError(e.to_string()))?;
        Ok(MessageRef(message.id.get()))
    }

    async fn edit(&self, message: MessageRef, content: Outgoing) -> Result<(), SinkError> {
        let builder = match content {
            Outgoing::Notice(text) => EditMessage::new().content(text),
            Outgoing::NowPlaying(card) => EditMessage::new()
                .embed(embeds::now_playing_embed(&card))
                .components(buttons::player_controls(card.is_playing, card.loop_mode)),
        };

        self.channel_id
            .edit_message(&self.http, message_id(message)?, builder)
            .await
            .map_err(|e| SinkError(e.to_string()))?;
        Ok(())
    }

    async fn delete(&self, message: MessageRef) -> Result<(), SinkError> {
        self.channel_id
            .delete_message(&self.http, message_id(message)?)
            .await
            .map_err(|e| SinkError(e.to_string()))
    }
}
