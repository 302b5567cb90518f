use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use super::BridgeCore;
use crate::db::RoomRole;
use crate::matrix::Profile;

impl BridgeCore {
    /// Brings the bot account and its room memberships in line with the store.
    pub async fn startup_sync(&self, sender_localpart: &str) -> Result<()> {
        let profile = self.ensure_registered(sender_localpart).await?;
        self.sync_profile(&profile).await?;
        self.leave_unknown_rooms().await?;
        Ok(())
    }

    async fn ensure_registered(&self, sender_localpart: &str) -> Result<Profile> {
        let bot_user_id = self.bot_user_id().to_string();
        match self.client.get_profile(&bot_user_id).await {
            Ok(profile) => Ok(profile),
            Err(e) if e.has_status(&[404]) => {
                info!(user_id = %bot_user_id, "bot account not found, registering");
                self.client
                    .register_appservice_user(sender_localpart)
                    .await
                    .context("failed to register bot account")?;
                self.client
                    .get_profile(&bot_user_id)
                    .await
                    .context("failed to read bot profile after registering")
            }
            Err(e) => Err(e).context("failed to read bot profile"),
        }
    }

    async fn sync_profile(&self, profile: &Profile) -> Result<()> {
        let bot_user_id = self.bot_user_id();
        if profile.displayname.as_deref() != Some(self.bot.displayname.as_str()) {
            info!(displayname = %self.bot.displayname, "updating bot displayname");
            self.client
                .set_displayname(bot_user_id, &self.bot.displayname)
                .await
                .context("failed to set bot displayname")?;
        }

        if let Some(avatar) = &self.bot.avatar
            && profile.avatar_url.as_deref() != Some(avatar.as_str())
        {
            info!(avatar = %avatar, "updating bot avatar");
            self.client
                .set_avatar_url(bot_user_id, avatar)
                .await
                .context("failed to set bot avatar")?;
        }
        Ok(())
    }

    async fn leave_unknown_rooms(&self) -> Result<()> {
        let joined = self
            .client
            .joined_rooms()
            .await
            .context("failed to list joined rooms")?;
        debug!(count = joined.len(), "checking joined rooms");

        for room_id in joined {
            if !matches!(self.rooms.room_role(&room_id).await?, RoomRole::Unknown) {
                continue;
            }
            info!(room_id = %room_id, "leaving room missing from the store");
            if let Err(e) = self.leave_room(&room_id).await {
                warn!(room_id = %room_id, "failed to leave unknown room: {}", e);
            }
        }
        Ok(())
    }
}
