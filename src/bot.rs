use std::{io::Cursor, sync::Arc};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use grammers_client::{
    types::{Chat, Downloadable, Media, Message, User},
    Client, InputMessage, Update,
};
use grammers_session::{PackedChat, PackedType};
use log::{error, info, warn};
use scopeguard::defer;
use tokio::time::Instant;

use crate::aggregator::ProgressSnapshot;
use crate::artifacts::{self, sanitize_filename, Artifact};
use crate::command::{
    parse_command, parse_schedule_interval, parse_vip, Command, IntervalError, VipAction, VipParseError,
    MAX_INTERVAL_SECS, MAX_VIP_DAYS, MIN_INTERVAL_SECS,
};
use crate::config::Settings;
use crate::credential::parse_batch;
use crate::dispatcher::Dispatcher;
use crate::error::StoreError;
use crate::models::{ScheduleEntry, Subscription, UploadDestinationConfig};
use crate::pipeline::run_batch;
use crate::progress::{escape_html, format_duration_short, summary_text, ProgressSink, ProgressThrottle};
use crate::scheduler::{Eligibility, OwnerNotifier};
use crate::store::{Storage, Subscriptions};
use crate::upload::{mask_secret, upload_tokens, UploadAttempt, UploadDestination};

const MESSAGE_LIMIT: usize = 4000;
const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S UTC";

/// A `/setfile` waiting for its document.
#[derive(Debug, Clone)]
struct PendingSchedule {
    interval_seconds: i64,
    schedule_key: String,
    display_name: String,
}

fn packed_user(user_id: i64, access_hash: Option<i64>) -> PackedChat {
    PackedChat {
        ty: PackedType::User,
        id: user_id,
        access_hash,
    }
}

/// Only current participants count; a record for a banned or departed user
/// does not.
fn counts_as_member(banned: bool, left: bool) -> bool {
    !banned && !left
}

/// Standing from the subscription store, membership from the required channel.
pub struct TelegramGate {
    client: Client,
    storage: Arc<Storage>,
    channel: Option<PackedChat>,
}

impl TelegramGate {
    pub fn new(client: Client, storage: Arc<Storage>, channel: Option<PackedChat>) -> Self {
        Self {
            client,
            storage,
            channel,
        }
    }
}

#[async_trait]
impl Eligibility for TelegramGate {
    async fn has_standing(&self, owner_id: i64) -> bool {
        self.storage.has_standing(owner_id, Utc::now()).await
    }

    async fn is_member(&self, owner_id: i64) -> bool {
        let Some(channel) = self.channel.clone() else {
            return true;
        };
        let access_hash = match self.storage.known_user(owner_id).await {
            Ok(known) => known.and_then(|k| k.access_hash),
            Err(err) => {
                error!("Could not read known users: {}", err);
                None
            }
        };
        match self.client.get_permissions(channel, packed_user(owner_id, access_hash)).await {
            Ok(perms) => {
                let member = counts_as_member(perms.is_banned(), perms.has_left());
                if !member {
                    info!("User {} is banned from or has left the required channel", owner_id);
                }
                member
            }
            Err(err) => {
                info!("User {} is not a member of the required channel: {}", owner_id, err);
                false
            }
        }
    }
}

/// Sends HTML messages to users the bot has seen before.
pub struct TelegramNotifier {
    client: Client,
    storage: Arc<Storage>,
}

impl TelegramNotifier {
    pub fn new(client: Client, storage: Arc<Storage>) -> Self {
        Self { client, storage }
    }
}

#[async_trait]
impl OwnerNotifier for TelegramNotifier {
    async fn notify(&self, owner_id: i64, text: String) {
        let access_hash = match self.storage.known_user(owner_id).await {
            Ok(known) => known.and_then(|k| k.access_hash),
            Err(err) => {
                error!("Could not read known users: {}", err);
                None
            }
        };
        if let Err(err) = self
            .client
            .send_message(packed_user(owner_id, access_hash), InputMessage::html(text))
            .await
        {
            warn!("Failed to send message to user {}: {}", owner_id, err);
        }
    }
}

/// Edits the status message with throttled progress.
struct TelegramProgress {
    status: Message,
    throttle: ProgressThrottle,
}

#[async_trait]
impl ProgressSink for TelegramProgress {
    async fn on_progress(&mut self, snapshot: &ProgressSnapshot) {
        if let Some(text) = self.throttle.next_update(snapshot) {
            if let Err(err) = self.status.edit(InputMessage::html(text)).await {
                warn!("Failed to edit progress message: {}", err);
            }
        }
    }
}

/// Bot front-end over the grammers client
pub struct Bot {
    client: Client,
    me: User,
    settings: Settings,
    storage: Arc<Storage>,
    dispatcher: Arc<Dispatcher>,
    destination: Arc<dyn UploadDestination>,
    gate: Arc<dyn Eligibility>,
    notifier: Arc<dyn OwnerNotifier>,
    locks: Arc<DashSet<i64>>,
    pending: Arc<DashMap<i64, PendingSchedule>>,
}

impl Bot {
    pub async fn new(
        client: Client,
        settings: Settings,
        storage: Arc<Storage>,
        dispatcher: Arc<Dispatcher>,
        destination: Arc<dyn UploadDestination>,
        gate: Arc<dyn Eligibility>,
        notifier: Arc<dyn OwnerNotifier>,
    ) -> Result<Arc<Self>> {
        let me = client.get_me().await?;

        Ok(Arc::new(Self {
            client,
            me,
            settings,
            storage,
            dispatcher,
            destination,
            gate,
            notifier,
            locks: Arc::new(DashSet::new()),
            pending: Arc::new(DashMap::new()),
        }))
    }

    /// Main loop to receive updates asynchronously
    pub async fn run(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received Ctrl+C, exiting");
                    break;
                }
                Ok(update) = self.client.next_update() => {
                    let self_ = Arc::clone(&self);

                    tokio::spawn(async move {
                        if let Err(err) = self_.handle_update(update).await {
                            error!("Error handling update: {}", err);
                        }
                    });
                }
            }
        }
    }

    async fn handle_update(&self, update: Update) -> Result<()> {
        match update {
            Update::NewMessage(msg) if !msg.outgoing() => self.handle_message(msg).await,
            _ => Ok(()),
        }
    }

    /// Private chats only: commands, then documents, then stray text.
    async fn handle_message(&self, msg: Message) -> Result<()> {
        let chat = msg.chat();
        let user_id = match &chat {
            Chat::User(user) => user.id(),
            _ => return Ok(()),
        };
        if let Err(err) = self.storage.remember_user(user_id, chat.pack().access_hash).await {
            error!("Failed to remember user {}: {}", user_id, err);
        }

        if let Some(command) = parse_command(msg.text()) {
            if let Some(via) = &command.via {
                if via.to_lowercase() != self.me.username().unwrap_or_default().to_lowercase() {
                    warn!("Ignoring command for unknown bot: {}", via);
                    return Ok(());
                }
            }
            info!("Received /{} from {}", command.name, user_id);
            return self.handle_command(msg, user_id, command).await;
        }

        if let Some(media @ Media::Document(_)) = msg.media() {
            if !self.ensure_member(&msg, user_id).await? {
                return Ok(());
            }
            return match self.pending.remove(&user_id) {
                Some((_, pending)) => self.handle_schedule_document(msg, user_id, media, pending).await,
                None => self.handle_document(msg, user_id, media).await,
            };
        }

        if self.pending.contains_key(&user_id) {
            msg.reply("Please send the JSON file to schedule, not text. Or use /cancel.")
                .await?;
        }
        Ok(())
    }

    async fn handle_command(&self, msg: Message, user_id: i64, command: Command) -> Result<()> {
        match command.name.as_str() {
            "start" => return self.handle_start(msg, user_id).await,
            "vip" => return self.handle_vip(msg, user_id, command).await,
            "help" | "cancel" | "vipstatus" | "setgithub" | "mygithub" | "setfile" | "removefile"
            | "scheduledfiles" => {}
            _ => return Ok(()),
        }

        if !self.ensure_member(&msg, user_id).await? {
            return Ok(());
        }
        if command.name == "cancel" {
            return self.handle_cancel(msg, user_id).await;
        }
        if command.name != "setfile" {
            self.pending.remove(&user_id);
        }

        match command.name.as_str() {
            "help" => self.handle_help(msg).await,
            "vipstatus" => self.handle_vip_status(msg, user_id).await,
            "setgithub" => self.handle_set_github(msg, user_id, command).await,
            "mygithub" => self.handle_my_github(msg, user_id).await,
            "setfile" => self.handle_set_file(msg, user_id, command).await,
            "removefile" => self.handle_remove_file(msg, user_id, command).await,
            "scheduledfiles" => self.handle_scheduled_files(msg, user_id).await,
            _ => Ok(()),
        }
    }

    async fn ensure_member(&self, msg: &Message, user_id: i64) -> Result<bool> {
        if self.gate.is_member(user_id).await {
            return Ok(true);
        }
        let channel = self.settings.required_channel.as_deref().unwrap_or_default();
        msg.reply(InputMessage::html(format!(
            "⚠️ You must join @{} and stay joined to use this bot.",
            escape_html(channel)
        )))
        .await?;
        Ok(false)
    }

    async fn ensure_standing(&self, msg: &Message, user_id: i64, feature: &str) -> Result<bool> {
        if self.gate.has_standing(user_id).await {
            return Ok(true);
        }
        msg.reply(format!("❌ {} is only available for VIP users.", feature))
            .await?;
        Ok(false)
    }

    async fn handle_start(&self, msg: Message, user_id: i64) -> Result<()> {
        self.pending.remove(&user_id);
        let mut text = String::from(
            "🚀 <b>Welcome to the JWT Token Generator Bot!</b>\n\n\
             📁 Send me a JSON file with account credentials:\n\
             <pre>[\n  {\"uid\": \"user1\", \"password\": \"pass1\"},\n  {\"uid\": \"user2\", \"password\": \"pass2\"}\n]</pre>\n\
             ✅ Tokens are returned in <code>all_server_token.json</code> and <code>token_{Region}.json</code>.\n\
             ✔️ Working accounts go to <code>account_{Region}.json</code>.\n\
             ❌ Failed entries go to <code>lost_account.json</code>.\n\n",
        );
        text.push_str(&format!(
            "⚠️ Max file size: {}\n\n\
             ✨ <b>VIP features:</b> GitHub auto-upload and scheduled processing (/setfile).\n\n\
             Use /help to see all commands.",
            bytesize::to_string(self.settings.max_file_size as u64, true)
        ));
        if let Some(channel) = &self.settings.required_channel {
            text.push_str(&format!(
                "\n\n⚠️ You must join @{} and stay joined to use the bot.",
                escape_html(channel)
            ));
        }
        msg.reply(InputMessage::html(text)).await?;
        Ok(())
    }

    async fn handle_help(&self, msg: Message) -> Result<()> {
        msg.reply(InputMessage::html(
            "🆘 <b>Help</b>\n\n\
             📌 <b>Commands:</b>\n\
             /start - Welcome message\n\
             /help - This message\n\
             /vipstatus - Check your VIP status\n\
             /cancel - Cancel a pending schedule setup\n\n\
             🔧 <b>VIP commands:</b>\n\
             <code>/setgithub &lt;TOKEN&gt; &lt;owner/repo&gt; &lt;branch&gt; &lt;file.json&gt;</code> - Configure GitHub auto-upload\n\
             /mygithub - Show your GitHub configuration\n\
             <code>/setfile &lt;interval&gt; &lt;name.json&gt;</code> - Schedule a file (e.g. <code>/setfile 12h main.json</code>). \
             Interval: <code>Xm</code>, <code>Xh</code> or <code>Xd</code>, minimum 5m.\n\
             <code>/removefile &lt;name.json&gt;</code> - Stop a schedule\n\
             /scheduledfiles - List your schedules\n\n\
             👑 <b>Admin:</b>\n\
             <code>/vip add &lt;user_id&gt; &lt;days&gt;</code>\n\
             <code>/vip remove &lt;user_id&gt;</code>\n\
             <code>/vip list</code>\n\n\
             📤 Send a JSON file to process it once. VIPs with a GitHub config get \
             <code>all_server_token.json</code> uploaded automatically.",
        ))
        .await?;
        Ok(())
    }

    /// Clears pending conversation state; never touches a running batch.
    async fn handle_cancel(&self, msg: Message, user_id: i64) -> Result<()> {
        if self.pending.remove(&user_id).is_some() {
            info!("User {} cancelled pending schedule setup", user_id);
            msg.reply("Scheduled file setup cancelled.").await?;
        } else {
            msg.reply("No active operation to cancel.").await?;
        }
        Ok(())
    }

    async fn handle_vip_status(&self, msg: Message, user_id: i64) -> Result<()> {
        let sub = match self.storage.subscription(user_id).await {
            Ok(sub) => sub,
            Err(err) => return self.reply_storage_error(&msg, "read your VIP status", err).await,
        };
        let text = match sub {
            Some(sub) if sub.is_active(Utc::now()) => format!(
                "🌟 <b>VIP Status:</b> Active\n<b>Expires:</b> <code>{}</code>",
                sub.expiry.format(TIME_FORMAT)
            ),
            Some(sub) => format!(
                "ℹ️ <b>VIP Status:</b> Expired on <code>{}</code>",
                sub.expiry.format(TIME_FORMAT)
            ),
            None => "ℹ️ <b>Status:</b> Regular User".to_string(),
        };
        msg.reply(InputMessage::html(text)).await?;
        Ok(())
    }

    async fn handle_set_github(&self, msg: Message, user_id: i64, cmd: Command) -> Result<()> {
        if !self.ensure_standing(&msg, user_id, "GitHub configuration").await? {
            return Ok(());
        }

        let usage = "<b>Usage:</b> <code>/setgithub &lt;TOKEN&gt; &lt;owner/repo&gt; &lt;branch&gt; &lt;filename.json&gt;</code>\n\
                     ⚠️ Your token is visible in the command message. The bot deletes it after saving.";
        let [secret, repo, branch, filename] = match <[String; 4]>::try_from(cmd.args) {
            Ok(args) => args,
            Err(args) => {
                msg.reply(InputMessage::html(format!(
                    "❌ Incorrect number of arguments. Expected 4, got {}.\n\n{}",
                    args.len(),
                    usage
                )))
                .await?;
                return Ok(());
            }
        };

        let config = UploadDestinationConfig {
            credential_secret: secret,
            repository_identifier: repo.trim().to_string(),
            branch: branch.trim().to_string(),
            target_filename: filename.trim().to_string(),
            last_upload: None,
            config_set_on: Some(Utc::now()),
        };
        if let Err(errors) = config.validate() {
            let list: Vec<String> = errors.iter().map(|e| format!("- {}", escape_html(e))).collect();
            msg.reply(InputMessage::html(format!(
                "❌ Configuration validation failed:\n{}\n\n{}",
                list.join("\n"),
                usage
            )))
            .await?;
            return Ok(());
        }

        if let Err(err) = self.storage.set_upload_config(user_id, config.clone()).await {
            error!("Failed to save GitHub config for {}: {}", user_id, err);
            let failure = storage_error_text("save the GitHub configuration", &err);
            let reply = msg.reply(InputMessage::html(&failure)).await?;
            let note = self.delete_token_message(&msg, user_id).await;
            reply.edit(InputMessage::html(format!("{}\n\n{}", failure, note))).await?;
            return Ok(());
        }
        info!("Saved GitHub config for user {}", user_id);

        let confirmation = format!(
            "✅ <b>GitHub configuration saved!</b>\n\n\
             • Repo: <code>{}</code>\n\
             • Branch: <code>{}</code>\n\
             • Filename: <code>{}</code>\n\
             • Token: <code>{}</code> (masked)",
            escape_html(&config.repository_identifier),
            escape_html(&config.branch),
            escape_html(&config.target_filename),
            escape_html(&mask_secret(&config.credential_secret)),
        );
        let reply = msg.reply(InputMessage::html(&confirmation)).await?;
        let note = self.delete_token_message(&msg, user_id).await;
        reply
            .edit(InputMessage::html(format!("{}\n\n{}", confirmation, note)))
            .await?;
        Ok(())
    }

    /// Removes a `/setgithub` message and says whether that worked.
    async fn delete_token_message(&self, msg: &Message, user_id: i64) -> &'static str {
        match msg.delete().await {
            Ok(()) => "✅ Your command message containing the token has been deleted.",
            Err(err) => {
                warn!("Could not delete /setgithub message for {}: {}", user_id, err);
                "⚠️ <b>Could not delete your command message! Please delete it manually now.</b>"
            }
        }
    }

    async fn reply_storage_error(&self, msg: &Message, action: &str, err: StoreError) -> Result<()> {
        error!("Storage error for {} while trying to {}: {}", msg.chat().id(), action, err);
        msg.reply(InputMessage::html(storage_error_text(action, &err))).await?;
        Ok(())
    }

    async fn handle_my_github(&self, msg: Message, user_id: i64) -> Result<()> {
        if !self.ensure_standing(&msg, user_id, "GitHub auto-upload").await? {
            return Ok(());
        }
        let config = match self.storage.upload_config(user_id).await {
            Ok(config) => config,
            Err(err) => return self.reply_storage_error(&msg, "read your GitHub configuration", err).await,
        };
        let text = match config {
            Some(config) => upload_config_text(&config),
            None => "ℹ️ GitHub auto-upload is not configured yet.\n\n\
                     Use <code>/setgithub &lt;TOKEN&gt; &lt;owner/repo&gt; &lt;branch&gt; &lt;filename.json&gt;</code> to set it up."
                .to_string(),
        };
        msg.reply(InputMessage::html(text)).await?;
        Ok(())
    }

    async fn handle_set_file(&self, msg: Message, user_id: i64, cmd: Command) -> Result<()> {
        if !self.ensure_standing(&msg, user_id, "File scheduling").await? {
            return Ok(());
        }

        let usage = "<b>Usage:</b> <code>/setfile &lt;interval&gt; &lt;name.json&gt;</code>\n\
                     Interval: <code>Xm</code>, <code>Xh</code> or <code>Xd</code>, from 5m to 365d. \
                     Example: <code>/setfile 12h main.json</code>";
        let (interval, name) = match cmd.args.as_slice() {
            [interval, name] => (interval, name),
            args => {
                msg.reply(InputMessage::html(format!(
                    "❌ Incorrect number of arguments. Expected 2, got {}.\n\n{}",
                    args.len(),
                    usage
                )))
                .await?;
                return Ok(());
            }
        };

        let interval_seconds = match parse_schedule_interval(interval) {
            Ok(secs) => secs,
            Err(err) => {
                let problem = match err {
                    IntervalError::Invalid => format!("Invalid interval format: <code>{}</code>.", escape_html(interval)),
                    IntervalError::TooShort => format!(
                        "Interval is too short. Minimum interval is {}.",
                        format_duration_short(Some(MIN_INTERVAL_SECS as f64))
                    ),
                    IntervalError::TooLong => format!(
                        "Interval is too long. Maximum interval is {}.",
                        format_duration_short(Some(MAX_INTERVAL_SECS as f64))
                    ),
                };
                msg.reply(InputMessage::html(format!("❌ {}\n\n{}", problem, usage))).await?;
                return Ok(());
            }
        };

        if !name.to_lowercase().ends_with(".json") {
            msg.reply(InputMessage::html(format!(
                "❌ Schedule name must end with <code>.json</code>.\n\n{}",
                usage
            )))
            .await?;
            return Ok(());
        }

        let pending = PendingSchedule {
            interval_seconds,
            schedule_key: sanitize_filename(name),
            display_name: name.clone(),
        };
        info!(
            "User {} started scheduling '{}' every {}s",
            user_id, pending.schedule_key, interval_seconds
        );
        self.pending.insert(user_id, pending);

        msg.reply(InputMessage::html(format!(
            "✅ Schedule <code>{}</code> accepted (every {}).\n\n\
             📎 <b>Now send the JSON file</b> for this schedule. Use /cancel to abort.",
            escape_html(name),
            format_duration_short(Some(interval_seconds as f64))
        )))
        .await?;
        Ok(())
    }

    async fn handle_schedule_document(
        &self,
        msg: Message,
        user_id: i64,
        media: Media,
        pending: PendingSchedule,
    ) -> Result<()> {
        let file_name = match &media {
            Media::Document(doc) => {
                if !is_json_document(doc.name(), doc.mime_type()) {
                    msg.reply(InputMessage::html(format!(
                        "❌ <code>{}</code> is not a JSON file. Schedule cancelled.",
                        escape_html(doc.name())
                    )))
                    .await?;
                    return Ok(());
                }
                doc.name().to_string()
            }
            _ => return Ok(()),
        };

        let status = msg
            .reply(InputMessage::html(format!(
                "⏳ Downloading <code>{}</code> for schedule <code>{}</code>...",
                escape_html(&file_name),
                escape_html(&pending.display_name)
            )))
            .await?;

        let bytes = match self.download(&media).await {
            Ok(bytes) => bytes,
            Err(err) => {
                error!("Download for schedule '{}' of {} failed: {}", pending.schedule_key, user_id, err);
                status
                    .edit(InputMessage::html(
                        "❌ Could not download the file. Schedule cancelled, please try again.",
                    ))
                    .await?;
                return Ok(());
            }
        };
        if let Err(err) = parse_batch(&bytes, self.settings.max_file_size) {
            status
                .edit(InputMessage::html(format!(
                    "❌ Error setting up schedule <code>{}</code>:\n<code>{}</code>\n\nSchedule cancelled.",
                    escape_html(&pending.display_name),
                    escape_html(&err.to_string())
                )))
                .await?;
            return Ok(());
        }

        let entry = match ScheduleEntry::new(
            pending.interval_seconds,
            self.storage.batch_path(user_id, &pending.schedule_key),
            file_name.clone(),
            pending.display_name.clone(),
            Utc::now(),
        ) {
            Ok(entry) => entry,
            Err(err) => {
                status
                    .edit(InputMessage::html(format!(
                        "❌ {}. Schedule cancelled.",
                        escape_html(&err.to_string())
                    )))
                    .await?;
                return Ok(());
            }
        };
        let next_run = entry.next_run_time;
        if let Err(err) = self
            .storage
            .add_schedule(user_id, &pending.schedule_key, entry, &bytes)
            .await
        {
            error!("Failed to save schedule '{}' for {}: {}", pending.schedule_key, user_id, err);
            status
                .edit(InputMessage::html(storage_error_text("save the schedule", &err)))
                .await?;
            return Ok(());
        }

        info!("Saved schedule '{}' for user {}", pending.schedule_key, user_id);
        let every = format_duration_short(Some(pending.interval_seconds as f64));
        status
            .edit(InputMessage::html(format!(
                "✅ <b>File schedule set!</b>\n\n\
                 🏷️ Name: <code>{}</code>\n\
                 📄 File: <code>{}</code>\n\
                 🔄 Interval: {}\n\
                 ⏰ Next run: <code>{}</code>\n\n\
                 Use /scheduledfiles to view or /removefile to stop.",
                escape_html(&pending.display_name),
                escape_html(&file_name),
                every,
                next_run.format(TIME_FORMAT)
            )))
            .await?;
        Ok(())
    }

    async fn handle_remove_file(&self, msg: Message, user_id: i64, cmd: Command) -> Result<()> {
        if !self.ensure_standing(&msg, user_id, "File scheduling").await? {
            return Ok(());
        }
        let name = match cmd.args.as_slice() {
            [name] => name,
            _ => {
                msg.reply(InputMessage::html(
                    "❌ <b>Usage:</b> <code>/removefile &lt;name.json&gt;</code>",
                ))
                .await?;
                return Ok(());
            }
        };

        let removed = match self.storage.remove_schedule(user_id, &sanitize_filename(name)).await {
            Ok(removed) => removed,
            Err(err) => return self.reply_storage_error(&msg, "remove the schedule", err).await,
        };
        let text = match removed {
            Some(entry) => {
                info!("Removed schedule '{}' for user {}", name, user_id);
                format!(
                    "✅ Schedule <code>{}</code> removed and its stored file deleted.",
                    escape_html(&entry.display_name)
                )
            }
            None => format!(
                "ℹ️ No schedule found with the name <code>{}</code>. Use /scheduledfiles to see your schedules.",
                escape_html(name)
            ),
        };
        msg.reply(InputMessage::html(text)).await?;
        Ok(())
    }

    async fn handle_scheduled_files(&self, msg: Message, user_id: i64) -> Result<()> {
        if !self.ensure_standing(&msg, user_id, "File scheduling").await? {
            return Ok(());
        }
        let schedules = match self.storage.list_schedules(user_id).await {
            Ok(schedules) => schedules,
            Err(err) => return self.reply_storage_error(&msg, "load your schedules", err).await,
        };
        let text = schedule_listing(schedules.values(), Utc::now());
        msg.reply(InputMessage::html(truncate_message(&text))).await?;
        Ok(())
    }

    async fn handle_vip(&self, msg: Message, user_id: i64, cmd: Command) -> Result<()> {
        if !self.settings.is_admin(user_id) {
            warn!("Unauthorized /vip attempt by {}", user_id);
            msg.reply("You are not authorized to use this command.").await?;
            return Ok(());
        }

        let usage = "👑 <b>VIP management</b>\n\n\
                     <code>/vip add &lt;user_id&gt; &lt;days&gt;</code> - Add/extend VIP\n\
                     <code>/vip remove &lt;user_id&gt;</code> - Remove VIP, GitHub config and all schedules\n\
                     <code>/vip list</code> - List VIPs";
        let action = match parse_vip(&cmd.args) {
            Ok(action) => action,
            Err(err) => {
                let problem = match err {
                    VipParseError::Usage => String::new(),
                    VipParseError::BadArguments(action) => format!("⚠️ Incorrect arguments for '{}'.\n\n", action),
                    VipParseError::InvalidNumber => "⚠️ User ID and days must be numbers.\n\n".to_string(),
                    VipParseError::NonPositiveDays => "⚠️ Number of days must be positive.\n\n".to_string(),
                    VipParseError::TooManyDays => format!("⚠️ At most {} days can be added at once.\n\n", MAX_VIP_DAYS),
                    VipParseError::UnknownAction(action) => {
                        format!("⚠️ Invalid action '{}'.\n\n", escape_html(&action))
                    }
                };
                msg.reply(InputMessage::html(format!("{}{}", problem, usage))).await?;
                return Ok(());
            }
        };

        match action {
            VipAction::Add { user_id: target, days } => {
                let (sub, extended) = match self
                    .storage
                    .grant_subscription(target, days, user_id, Utc::now())
                    .await
                {
                    Ok(granted) => granted,
                    Err(err) => return self.reply_storage_error(&msg, "update the VIP list", err).await,
                };
                let expiry = sub.expiry.format(TIME_FORMAT);
                info!("Admin {} granted {} days of VIP to {}", user_id, days, target);
                msg.reply(InputMessage::html(format!(
                    "✅ VIP {} for user <code>{}</code>.\nDuration added: {} days\nNew expiry: <code>{}</code>",
                    if extended { "extended" } else { "added" },
                    target,
                    days,
                    expiry
                )))
                .await?;
                self.notifier
                    .notify(
                        target,
                        format!(
                            "🎉 Your VIP status has been {}!\n📅 <b>Expires:</b> <code>{}</code>\n\n\
                             Enjoy GitHub auto-upload and file scheduling!",
                            if extended { "updated" } else { "activated" },
                            expiry
                        ),
                    )
                    .await;
            }
            VipAction::Remove { user_id: target } => {
                let revocation = match self.storage.revoke(target).await {
                    Ok(revocation) => revocation,
                    Err(err) => return self.reply_storage_error(&msg, "remove the VIP", err).await,
                };
                info!("Admin {} revoked {}: {:?}", user_id, target, revocation);
                let mut lines = Vec::new();
                if revocation.had_subscription {
                    lines.push(format!("✅ Removed VIP status for <code>{}</code>.", target));
                } else {
                    lines.push(format!("ℹ️ User <code>{}</code> was not in the VIP list.", target));
                }
                if revocation.had_upload_config {
                    lines.push("✅ Removed GitHub config.".to_string());
                }
                if revocation.schedules_removed > 0 {
                    lines.push(format!(
                        "✅ Removed {} schedule(s) and {} stored file(s).",
                        revocation.schedules_removed, revocation.files_deleted
                    ));
                }
                msg.reply(InputMessage::html(lines.join("\n"))).await?;
                if revocation.had_subscription {
                    self.notifier
                        .notify(target, "ℹ️ Your VIP status has been removed by an admin.".to_string())
                        .await;
                }
            }
            VipAction::List => {
                let subs = match self.storage.subscriptions.load().await {
                    Ok(subs) => subs,
                    Err(err) => return self.reply_storage_error(&msg, "load the VIP list", err).await,
                };
                msg.reply(InputMessage::html(truncate_message(&vip_listing(&subs, Utc::now()))))
                    .await?;
            }
        }
        Ok(())
    }

    /// One interactive batch run per chat at a time.
    async fn handle_document(&self, msg: Message, user_id: i64, media: Media) -> Result<()> {
        let (file_name, declared_size) = match &media {
            Media::Document(doc) if is_json_document(doc.name(), doc.mime_type()) => {
                (doc.name().to_string(), doc.size())
            }
            Media::Document(_) => {
                msg.reply("❌ Please send a .json file.").await?;
                return Ok(());
            }
            _ => return Ok(()),
        };
        if declared_size > self.settings.max_file_size as i64 {
            msg.reply(format!(
                "⚠️ File is too large ({}). Max: {}.",
                bytesize::to_string(declared_size as u64, true),
                bytesize::to_string(self.settings.max_file_size as u64, true)
            ))
            .await?;
            return Ok(());
        }

        let chat_id = msg.chat().id();
        info!("Locking chat {}", chat_id);
        if !self.locks.insert(chat_id) {
            msg.reply("✋ Whoa, slow down! A file is already being processed in this chat.")
                .await?;
            return Ok(());
        }
        defer! {
            info!("Unlocking chat {}", chat_id);
            self.locks.remove(&chat_id);
        };

        let status = msg
            .reply(InputMessage::html(format!(
                "⏳ Downloading <code>{}</code>...",
                escape_html(&file_name)
            )))
            .await?;

        let bytes = match self.download(&media).await {
            Ok(bytes) => bytes,
            Err(err) => {
                error!("Download of '{}' for {} failed: {}", file_name, user_id, err);
                status
                    .edit(InputMessage::html(format!(
                        "❌ Could not download <code>{}</code>. Please send it again.",
                        escape_html(&file_name)
                    )))
                    .await?;
                return Ok(());
            }
        };
        let records = match parse_batch(&bytes, self.settings.max_file_size) {
            Ok(records) => records,
            Err(err) => {
                status
                    .edit(InputMessage::html(format!("❌ {}", escape_html(&err.to_string()))))
                    .await?;
                return Ok(());
            }
        };
        if records.is_empty() {
            status
                .edit("ℹ️ The JSON file is empty. Nothing to process.")
                .await?;
            return Ok(());
        }

        info!("User {} submitted {} records from {}", user_id, records.len(), file_name);
        status
            .edit(InputMessage::html(format!(
                "🔄 Starting processing of {} accounts...",
                records.len()
            )))
            .await?;

        let started = Instant::now();
        let mut sink = TelegramProgress {
            throttle: ProgressThrottle::new("Manual", records.len()),
            status,
        };
        let summary = run_batch(&self.dispatcher, records, &mut sink).await;
        let status = sink.status;

        status
            .edit(InputMessage::html(summary_text(
                "Manual Processing Complete",
                &summary,
                started.elapsed(),
            )))
            .await?;

        for artifact in artifacts::build_all(&summary)? {
            if let Err(err) = self.send_artifact(&msg, artifact).await {
                error!("Failed to send result file to {}: {}", user_id, err);
            }
        }

        if self.gate.has_standing(user_id).await {
            if let Some(tokens) = artifacts::all_tokens(&summary)? {
                let attempt =
                    upload_tokens(&self.storage, self.destination.as_ref(), user_id, &tokens.bytes).await;
                if !matches!(attempt, UploadAttempt::NotConfigured) {
                    msg.reply(InputMessage::html(attempt.describe())).await?;
                }
            }
        }

        Ok(())
    }

    async fn download(&self, media: &Media) -> Result<Vec<u8>> {
        let mut download = self.client.iter_download(&Downloadable::Media(media.clone()));
        let mut bytes = Vec::new();
        while let Some(chunk) = download.next().await? {
            bytes.extend_from_slice(&chunk);
            // the size check in parse_batch reports this
            if bytes.len() > self.settings.max_file_size {
                break;
            }
        }
        Ok(bytes)
    }

    async fn send_artifact(&self, msg: &Message, artifact: Artifact) -> Result<()> {
        let Artifact { file_name, bytes } = artifact;
        let size = bytes.len();
        let mime = mime_guess::from_path(&file_name).first_or_octet_stream();

        let mut stream = Cursor::new(bytes);
        let file = self.client.upload_stream(&mut stream, size, file_name.clone()).await?;
        msg.reply(
            InputMessage::html(format!(
                "📄 <code>{}</code> ({})",
                escape_html(&file_name),
                bytesize::to_string(size as u64, true)
            ))
            .document(file)
            .mime_type(mime.essence_str()),
        )
        .await?;
        Ok(())
    }
}

/// Reply text for a store operation that did not commit.
fn storage_error_text(action: &str, err: &StoreError) -> String {
    match err {
        StoreError::Range(range) => format!("❌ Could not {}: {}.", action, escape_html(&range.to_string())),
        _ => format!("❌ Could not {} due to a storage error. Please try again later.", action),
    }
}

fn is_json_document(name: &str, mime: Option<&str>) -> bool {
    name.to_lowercase().ends_with(".json") || mime.map_or(false, |m| m.eq_ignore_ascii_case("application/json"))
}

fn upload_config_text(config: &UploadDestinationConfig) -> String {
    let stamp = |at: Option<DateTime<Utc>>| {
        at.map_or("Never".to_string(), |at| at.format(TIME_FORMAT).to_string())
    };
    format!(
        "🔧 <b>Your GitHub auto-upload config:</b>\n\n\
         • Repo: <code>{}</code>\n\
         • Branch: <code>{}</code>\n\
         • Filename: <code>{}</code>\n\
         • Token: <code>{}</code> (masked)\n\
         • Last successful upload: <code>{}</code>\n\
         • Config set: <code>{}</code>\n\n\
         Use /setgithub to update it.",
        escape_html(&config.repository_identifier),
        escape_html(&config.branch),
        escape_html(&config.target_filename),
        escape_html(&mask_secret(&config.credential_secret)),
        stamp(config.last_upload),
        stamp(config.config_set_on),
    )
}

fn schedule_listing<'a>(entries: impl Iterator<Item = &'a ScheduleEntry>, now: DateTime<Utc>) -> String {
    let mut entries: Vec<&ScheduleEntry> = entries.collect();
    if entries.is_empty() {
        return "ℹ️ You have no files scheduled for automatic processing.\n\n\
                Use <code>/setfile &lt;interval&gt; &lt;name.json&gt;</code> to set one up."
            .to_string();
    }
    entries.sort_by(|a, b| a.display_name.cmp(&b.display_name));

    let mut parts = vec!["⚙️ <b>Your scheduled files:</b>".to_string()];
    for entry in entries {
        let remaining = (entry.next_run_time - now).num_seconds();
        let until = if remaining > 0 {
            format_duration_short(Some(remaining as f64))
        } else {
            "due now".to_string()
        };
        let last = entry
            .last_run_time
            .map_or("Never".to_string(), |at| at.format("%Y-%m-%d %H:%M UTC").to_string());

        parts.push(format!(
            "\n🏷️ <b>{}</b>\n   📄 Source: <code>{}</code>\n   🔄 Interval: {}\n   ⏰ Next run: {} ({})\n   ⏱️ Last run: {}",
            escape_html(&entry.display_name),
            escape_html(&entry.original_filename),
            format_duration_short(Some(entry.interval_seconds as f64)),
            entry.next_run_time.format("%Y-%m-%d %H:%M UTC"),
            until,
            last
        ));
    }
    parts.push("\nUse <code>/removefile &lt;name.json&gt;</code> to stop a schedule.".to_string());
    parts.join("\n")
}

fn vip_listing(subs: &Subscriptions, now: DateTime<Utc>) -> String {
    let (mut active, mut expired): (Vec<(&i64, &Subscription)>, Vec<_>) =
        subs.iter().partition(|(_, sub)| sub.is_active(now));
    active.sort_by_key(|(_, sub)| sub.expiry);
    expired.sort_by_key(|(id, _)| **id);

    let mut parts = vec![format!("🌟 <b>VIP users</b> ({} active)\n", active.len())];
    if active.is_empty() {
        parts.push("No active VIP users.".to_string());
    }
    for (id, sub) in &active {
        let remaining = (sub.expiry - now).num_seconds() as f64;
        parts.push(format!(
            "✅ <code>{}</code> | Expires: {} | Rem: {}",
            id,
            sub.expiry.format("%Y-%m-%d %H:%M UTC"),
            format_duration_short(Some(remaining))
        ));
    }
    if !expired.is_empty() {
        parts.push(format!("\n<b>Expired ({}):</b>", expired.len()));
        for (id, sub) in &expired {
            parts.push(format!(
                "❌ <code>{}</code> | Expired: {}",
                id,
                sub.expiry.format("%Y-%m-%d %H:%M UTC")
            ));
        }
    }
    parts.push(format!("\nTotal entries: {}", subs.len()));
    parts.join("\n")
}

/// Cuts at the last line break that fits a single message.
fn truncate_message(text: &str) -> String {
    if text.len() <= MESSAGE_LIMIT {
        return text.to_string();
    }
    let mut cut = MESSAGE_LIMIT;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    let cut = text[..cut].rfind('\n').unwrap_or(cut);
    format!("{}\n\n...(truncated)", &text[..cut])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RangeError;
    use chrono::{Duration, TimeZone};
    use std::path::PathBuf;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap()
    }

    #[test]
    fn banned_or_departed_participants_are_not_members() {
        assert!(counts_as_member(false, false));
        assert!(!counts_as_member(true, false));
        assert!(!counts_as_member(false, true));
    }

    #[test]
    fn storage_failures_name_the_action() {
        let io = StoreError::Io {
            path: PathBuf::from("bot_data/github_configs.json"),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only"),
        };
        let text = storage_error_text("save the GitHub configuration", &io);
        assert!(text.contains("Could not save the GitHub configuration due to a storage error"));
        assert!(!text.contains("bot_data"));

        let range = StoreError::Range(RangeError::Days(999_999_999));
        let text = storage_error_text("update the VIP list", &range);
        assert!(text.contains("Could not update the VIP list: A subscription of 999999999 days is out of range."));
    }

    #[test]
    fn json_documents() {
        assert!(is_json_document("accounts.JSON", None));
        assert!(is_json_document("upload", Some("application/json")));
        assert!(!is_json_document("accounts.txt", Some("text/plain")));
    }

    #[test]
    fn schedule_listing_shows_due_and_upcoming_entries() {
        let due = ScheduleEntry::new(
            3600,
            PathBuf::from("a"),
            "a.json".into(),
            "alpha.json".into(),
            now() - Duration::hours(2),
        )
        .unwrap();
        let mut upcoming = ScheduleEntry::new(
            600,
            PathBuf::from("b"),
            "b.json".into(),
            "beta.json".into(),
            now() - Duration::minutes(5),
        )
        .unwrap();
        upcoming.mark_ran(now() - Duration::minutes(5)).unwrap();

        let text = schedule_listing([&upcoming, &due].into_iter(), now());
        let alpha = text.find("alpha.json").unwrap();
        let beta = text.find("beta.json").unwrap();
        assert!(alpha < beta);
        assert!(text.contains("(due now)"));
        assert!(text.contains("(5m)"));
        assert!(text.contains("Last run: 2026-03-01 07:55 UTC"));
    }

    #[test]
    fn empty_schedule_listing_explains_setfile() {
        assert!(schedule_listing(std::iter::empty(), now()).contains("/setfile"));
    }

    #[test]
    fn vip_listing_splits_active_and_expired() {
        let sub = |expiry| Subscription {
            expiry,
            added_by: Some(1),
            added_on: now(),
            last_update: now(),
        };
        let mut subs = Subscriptions::new();
        subs.insert(10, sub(now() + Duration::days(2)));
        subs.insert(20, sub(now() - Duration::days(1)));

        let text = vip_listing(&subs, now());
        assert!(text.contains("(1 active)"));
        assert!(text.contains("✅ <code>10</code>"));
        assert!(text.contains("Expired (1)"));
        assert!(text.contains("❌ <code>20</code>"));
        assert!(text.contains("Total entries: 2"));
    }

    #[test]
    fn long_messages_are_cut_on_a_line_break() {
        let text = "line\n".repeat(2000);
        let cut = truncate_message(&text);
        assert!(cut.len() <= MESSAGE_LIMIT + 20);
        assert!(cut.ends_with("line\n\n...(truncated)"));
        assert_eq!(truncate_message("short"), "short");
    }
}
