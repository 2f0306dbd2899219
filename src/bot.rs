//! Telegram surface: commands, lookup buttons, and the term conversation.

mod pending;
pub mod reply;
#[cfg(test)]
mod tests;

use std::{sync::Arc, time::Duration};

use anyhow::Context;
use reqwest::Url;
use teloxide::{
    prelude::*,
    requests::Request,
    types::{
        ChatMemberKind, ChatMemberStatus, InputFile, MaybeInaccessibleMessage,
        ParseMode, Recipient, UpdateKind, User,
    },
    utils::command::{BotCommands, ParseError},
};

use crate::{
    conf::ConfTelegram,
    data::{Ledger, LedgerError},
    dispatch::Dispatcher,
    lookup::LookupType,
    sanitize::{attribute, sanitize},
};

pub use pending::{PendingKey, PendingLookups};

#[derive(BotCommands, Clone, Debug, PartialEq, Eq)]
#[command(rename_rule = "lowercase", description = "Available commands:")]
pub enum Command {
    #[command(description = "choose a lookup.")]
    Start(String),
    #[command(description = "show this text.")]
    Help,
    #[command(description = "show today's usage.")]
    Usage,
    #[command(description = "redeem a gift code: /redeem CODE")]
    Redeem(String),
    #[command(description = "message every user (admin).")]
    Broadcast(String),
    #[command(description = "create a gift code: /createcode CODE [USES] (admin).")]
    CreateCode(String),
    #[command(description = "usage summary (admin).")]
    Stats,
}

impl Command {
    fn is_admin_only(&self) -> bool {
        matches!(self, Self::Broadcast(_) | Self::CreateCode(_) | Self::Stats)
    }
}

/// Arguments of `/createcode`. Uses default to 1 when missing, not a number,
/// or below 1.
pub fn parse_create_code(args: &str) -> Option<(String, u32)> {
    let mut words = args.split_whitespace();
    let code = words.next()?.to_string();
    let uses = words
        .next()
        .and_then(|n| n.parse::<u32>().ok())
        .filter(|n| *n >= 1)
        .unwrap_or(1);
    Some((code, uses))
}

pub struct Telegram {
    bot: Bot,
    username: String,
    conf: ConfTelegram,
    pending: PendingLookups,
    dispatcher: Arc<Dispatcher>,
    ledger: Arc<Ledger>,
    attribution: String,
}

impl Telegram {
    /// No request is made here; see [`Telegram::resolve_username`].
    pub fn new(
        conf: ConfTelegram,
        dispatcher: Arc<Dispatcher>,
        ledger: Arc<Ledger>,
        attribution: String,
    ) -> anyhow::Result<Self> {
        let bot = build_bot(&conf)?;
        let pending = PendingLookups::new(Duration::from_secs_f32(
            conf.pending_timeout.max(0.0),
        ));
        Ok(Self {
            bot,
            username: String::new(),
            conf,
            pending,
            dispatcher,
            ledger,
            attribution,
        })
    }

    /// Commands addressed as `/cmd@name` are matched against this name.
    /// Without it, only the bare form is recognized.
    pub async fn resolve_username(mut self) -> Self {
        match self.bot.get_me().await {
            Ok(me) => {
                self.username = me.user.username.clone().unwrap_or_default();
                tracing::info!(username = %self.username, "Bot identity resolved.");
            }
            Err(error) => {
                tracing::warn!(%error, "Failed to resolve bot username via getMe.");
            }
        }
        self
    }

    #[must_use]
    pub fn webhook_secret(&self) -> Option<&str> {
        self.conf.webhook_secret.as_deref()
    }

    /// Errors are internal faults only (ledger storage, rendering). Telegram
    /// refusing a reply is logged where it happens and does not fail the
    /// update.
    #[tracing::instrument(name = "update", skip_all, fields(update_id = update.id.0))]
    pub async fn handle_update(&self, update: Update) -> anyhow::Result<()> {
        match update.kind {
            UpdateKind::Message(msg) => self.on_message(&msg).await,
            UpdateKind::CallbackQuery(q) => self.on_callback(&q).await,
            _ => {
                tracing::debug!("Ignoring update kind.");
                Ok(())
            }
        }
    }

    async fn on_message(&self, msg: &Message) -> anyhow::Result<()> {
        let (Some(text), Some(user)) = (msg.text(), msg.from.as_ref()) else {
            return Ok(());
        };
        match Command::parse(text, &self.username) {
            Ok(cmd) => self.on_command(msg, user, cmd).await,
            Err(ParseError::WrongBotName(name)) => {
                tracing::debug!(%name, "Command addressed to another bot.");
                Ok(())
            }
            Err(error) if text.starts_with('/') => {
                tracing::debug!(?error, "Unparsable command.");
                self.say(msg.chat.id, "Unknown command. See /help.").await;
                Ok(())
            }
            Err(_) => self.on_term(msg, user, text).await,
        }
    }

    #[tracing::instrument(skip_all, fields(uid = user.id.0, cmd = ?cmd))]
    async fn on_command(
        &self,
        msg: &Message,
        user: &User,
        cmd: Command,
    ) -> anyhow::Result<()> {
        let chat = msg.chat.id;
        if cmd.is_admin_only() && !self.is_admin(user) {
            tracing::warn!("Non-admin attempted an admin command.");
            self.say(chat, reply::UNAUTHORIZED).await;
            return Ok(());
        }
        match cmd {
            Command::Start(_) => self.start(msg, user).await?,
            Command::Help => {
                self.say(chat, Command::descriptions().to_string()).await;
            }
            Command::Usage => {
                let usage = self.ledger.usage(uid(user)).await?;
                let text = match usage.remaining_today {
                    None => format!(
                        "⭐ Premium: unlimited searches. Used today: {}.",
                        usage.used_today
                    ),
                    Some(left) => format!(
                        "Used today: {}. Remaining: {left} of {}.",
                        usage.used_today,
                        self.ledger.daily_limit()
                    ),
                };
                self.say(chat, text).await;
            }
            Command::Redeem(code) => {
                let code = code.trim();
                let text = if code.is_empty() {
                    "Usage: /redeem CODE"
                } else {
                    match self.ledger.redeem(code, uid(user)).await {
                        Ok(()) => reply::CODE_REDEEMED,
                        Err(LedgerError::InvalidCode) => reply::CODE_INVALID,
                        Err(LedgerError::Storage(e)) => return Err(e.into()),
                    }
                };
                self.say(chat, text).await;
            }
            Command::Broadcast(text) => self.broadcast(chat, text.trim()).await?,
            Command::CreateCode(args) => {
                let text = match parse_create_code(&args) {
                    None => "Usage: /createcode CODE [USES]".to_string(),
                    Some((code, uses)) => {
                        self.ledger.create_code(&code, uses).await?;
                        format!(
                            "✅ Gift code created: {code} with {uses} premium redemptions"
                        )
                    }
                };
                self.say(chat, text).await;
            }
            Command::Stats => {
                let stats = self.ledger.stats().await?;
                let text = format!(
                    "📊 Users: {}\n⭐ Premium: {}\n🔎 Active today: {}\n🎁 Live codes: {}",
                    stats.users,
                    stats.premium_users,
                    stats.active_today,
                    stats.live_codes
                );
                self.say(chat, text).await;
            }
        }
        Ok(())
    }

    async fn start(&self, msg: &Message, user: &User) -> anyhow::Result<()> {
        let chat = msg.chat.id;
        if !self.has_joined(user).await {
            self.say(chat, self.join_prompt()).await;
            return Ok(());
        }
        self.ledger.register(uid(user)).await?;
        let text = reply::welcome(
            &user.first_name,
            user.username.as_deref(),
            chat.0,
            self.ledger.daily_limit(),
            &self.attribution,
        );
        let photo = self
            .conf
            .welcome_photo_url
            .as_deref()
            .and_then(|url| Url::parse(url).ok());
        let delivered = match photo {
            Some(url) => {
                deliver(
                    self.bot
                        .send_photo(chat, InputFile::url(url))
                        .caption(text)
                        .parse_mode(ParseMode::Html)
                        .reply_markup(reply::lookup_keyboard()),
                )
                .await
            }
            None => {
                deliver(
                    self.bot
                        .send_message(chat, text)
                        .parse_mode(ParseMode::Html)
                        .reply_markup(reply::lookup_keyboard()),
                )
                .await
            }
        };
        tracing::info!(uid = user.id.0, delivered, "Sent welcome.");
        Ok(())
    }

    /// Each recipient is tried once; failures are counted, not raised.
    async fn broadcast(&self, chat: ChatId, text: &str) -> anyhow::Result<()> {
        if text.is_empty() {
            self.say(chat, "Usage: /broadcast TEXT").await;
            return Ok(());
        }
        let recipients = self.ledger.user_ids().await?;
        let mut delivered = 0usize;
        let mut failed = 0usize;
        for id in recipients {
            match self.bot.send_message(ChatId(id), text).await {
                Ok(_) => delivered += 1,
                Err(error) => {
                    tracing::debug!(id, %error, "Broadcast delivery failed.");
                    failed += 1;
                }
            }
        }
        tracing::info!(delivered, failed, "Broadcast finished.");
        self.say(
            chat,
            format!("✅ Broadcast sent! Delivered: {delivered}, failed: {failed}."),
        )
        .await;
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(uid = q.from.id.0))]
    async fn on_callback(&self, q: &CallbackQuery) -> anyhow::Result<()> {
        deliver(self.bot.answer_callback_query(q.id.clone())).await;
        let Some(message) = q.message.as_ref() else {
            return Ok(());
        };
        let chat = message.chat().id;
        let Some(tag) = q
            .data
            .as_deref()
            .and_then(|data| data.strip_prefix(reply::CALLBACK_PREFIX))
        else {
            tracing::debug!(data = ?q.data, "Ignoring foreign callback.");
            return Ok(());
        };
        let kind: LookupType = match tag.parse() {
            Ok(kind) => kind,
            Err(error) => {
                tracing::warn!(%error, "Callback for unknown lookup type.");
                self.say(chat, "Unknown lookup type.").await;
                return Ok(());
            }
        };
        if !self.has_joined(&q.from).await {
            self.say(chat, self.join_prompt()).await;
            return Ok(());
        }
        if is_private(message) && !self.ledger.check_quota(uid(&q.from)).await? {
            self.say(chat, reply::LIMIT_REACHED).await;
            return Ok(());
        }
        self.pending.begin(
            PendingKey {
                chat,
                user: q.from.id,
            },
            kind,
        );
        tracing::debug!(%kind, "Awaiting term.");
        self.say(chat, reply::ask_for_term(kind)).await;
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(uid = user.id.0))]
    async fn on_term(
        &self,
        msg: &Message,
        user: &User,
        term: &str,
    ) -> anyhow::Result<()> {
        let chat = msg.chat.id;
        let key = PendingKey {
            chat,
            user: user.id,
        };
        let Some(kind) = self.pending.take(key) else {
            if msg.chat.is_private() {
                self.say(chat, reply::NOTHING_PENDING).await;
            }
            return Ok(());
        };
        let private = msg.chat.is_private();
        if private && !self.ledger.check_quota(uid(user)).await? {
            self.say(chat, reply::LIMIT_REACHED).await;
            return Ok(());
        }
        let value = match self.dispatcher.lookup_typed(kind, term).await {
            Ok(value) => value,
            Err(error) => {
                tracing::warn!(%kind, upstream = error.is_upstream(), "Lookup failed.");
                tracing::debug!(?error);
                self.say(chat, reply::FETCH_FAILED).await;
                return Ok(());
            }
        };
        if private {
            self.ledger.record_use(uid(user)).await?;
        }
        let payload = attribute(sanitize(&value), &self.attribution);
        let chunks = reply::render_payload(&payload)
            .context("Failed to render lookup result")?;
        for chunk in chunks {
            let sent = deliver(
                self.bot.send_message(chat, chunk).parse_mode(ParseMode::Html),
            )
            .await;
            if !sent {
                break;
            }
        }
        tracing::info!(%kind, "Lookup answered.");
        Ok(())
    }

    async fn say(&self, chat: ChatId, text: impl Into<String>) -> bool {
        deliver(self.bot.send_message(chat, text)).await
    }

    fn is_admin(&self, user: &User) -> bool {
        uid(user) == self.conf.admin_id
    }

    fn join_prompt(&self) -> String {
        let channel = self.conf.force_join_channel.as_deref().unwrap_or_default();
        format!("❌ Please join {channel} to use this bot")
    }

    /// True when no channel is configured. A failed membership query counts
    /// as not joined.
    async fn has_joined(&self, user: &User) -> bool {
        let Some(channel) = self.conf.force_join_channel.as_deref() else {
            return true;
        };
        let recipient = Recipient::ChannelUsername(channel.to_string());
        match self.bot.get_chat_member(recipient, user.id).await {
            Ok(member) => counts_as_joined(&member.kind),
            Err(error) => {
                tracing::warn!(%error, channel, "Membership check failed.");
                false
            }
        }
    }
}

/// Creator, administrator or plain member. Restricted users are not let in
/// even while they remain in the channel.
fn counts_as_joined(kind: &ChatMemberKind) -> bool {
    matches!(
        kind.status(),
        ChatMemberStatus::Owner
            | ChatMemberStatus::Administrator
            | ChatMemberStatus::Member
    )
}

/// Sends one request to Telegram. A refusal (bot blocked, chat gone,
/// network) is logged here and reported as `false`.
async fn deliver<R>(request: R) -> bool
where
    R: Request,
{
    match request.send().await {
        Ok(_) => true,
        Err(error) => {
            tracing::warn!(%error, "Telegram delivery failed.");
            false
        }
    }
}

fn build_bot(conf: &ConfTelegram) -> anyhow::Result<Bot> {
    let bot = Bot::new(&conf.bot_token);
    match conf.api_url.as_deref() {
        None => Ok(bot),
        Some(url) => {
            let url = Url::parse(url)
                .context(format!("Invalid Bot API URL: {url:?}"))?;
            Ok(bot.set_api_url(url))
        }
    }
}

/// Register `url` as the bot's webhook, with the configured secret token.
pub async fn set_webhook(conf: &ConfTelegram, url: Url) -> anyhow::Result<()> {
    let bot = build_bot(conf)?;
    let mut request = bot.set_webhook(url.clone());
    if let Some(secret) = &conf.webhook_secret {
        request = request.secret_token(secret.clone());
    }
    request.await.context(format!("Failed to set webhook to {url}"))?;
    tracing::info!(%url, "Webhook registered.");
    Ok(())
}

fn uid(user: &User) -> i64 {
    user.id.0 as i64
}

fn is_private(message: &MaybeInaccessibleMessage) -> bool {
    message.chat().is_private()
}
