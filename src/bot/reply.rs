//! Texts and keyboards the bot sends.

use serde_json::Value;
use teloxide::{
    types::{InlineKeyboardButton, InlineKeyboardMarkup},
    utils::html,
};

use crate::lookup::LookupType;

/// Telegram's cap on a message text.
pub const MESSAGE_LIMIT: usize = 4096;

pub const CALLBACK_PREFIX: &str = "type_";

pub const FETCH_FAILED: &str = "❌ Failed to fetch data from API.";
pub const LIMIT_REACHED: &str =
    "⚠️ You reached your daily free limit. Use a gift code or wait until tomorrow.";
pub const UNAUTHORIZED: &str = "❌ Unauthorized";
pub const CODE_REDEEMED: &str = "🎉 Code redeemed! You now have premium access.";
pub const CODE_INVALID: &str = "❌ Invalid or expired code.";
pub const NOTHING_PENDING: &str =
    "Pick a lookup first: send /start and press one of the buttons.";

const PRE_OPEN: &str = "<pre>";
const PRE_CLOSE: &str = "</pre>";

pub fn lookup_keyboard() -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(LookupType::ALL.map(|kind| {
        vec![InlineKeyboardButton::callback(
            kind.label(),
            format!("{CALLBACK_PREFIX}{}", kind.tag()),
        )]
    }))
}

pub fn welcome(
    first_name: &str,
    username: Option<&str>,
    chat_id: i64,
    daily_limit: u32,
    attribution: &str,
) -> String {
    let name = if first_name.is_empty() { "User" } else { first_name };
    let username = username
        .map(|u| format!("@{u}"))
        .unwrap_or_else(|| "No username".to_string());
    format!(
        "🌟 WELCOME {} 🌟\n\n\
        👤 USERNAME : {}\n\
        🆔 CHAT ID : {chat_id}\n\n\
        🛠️ Pick a lookup using the buttons below!\n\
        🎯 Daily {daily_limit} free searches in private chats.\n\
        🚀 Unlimited usage in group chats.\n\n\
        ✨ API BY {}",
        html::escape(&name.to_uppercase()),
        html::escape(&username),
        html::escape(attribution),
    )
}

pub fn ask_for_term(kind: LookupType) -> String {
    format!("📩 Send me the term for {}:", kind.label())
}

/// Pretty JSON split into `<pre>` blocks that each fit one message.
pub fn render_payload(value: &Value) -> serde_json::Result<Vec<String>> {
    let pretty = serde_json::to_string_pretty(value)?;
    let budget = MESSAGE_LIMIT - PRE_OPEN.len() - PRE_CLOSE.len();
    Ok(chunk_escaped(&pretty, budget)
        .into_iter()
        .map(|chunk| format!("{PRE_OPEN}{chunk}{PRE_CLOSE}"))
        .collect())
}

/// HTML-escapes `text` and cuts it at line boundaries into pieces of at
/// most `budget` bytes. Lines that alone exceed the budget are cut between
/// characters, never inside an escape sequence.
fn chunk_escaped(text: &str, budget: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    for line in text.lines() {
        let escaped = html::escape(line);
        let separator = usize::from(!current.is_empty());
        if current.len() + separator + escaped.len() <= budget {
            if separator == 1 {
                current.push('\n');
            }
            current.push_str(&escaped);
            continue;
        }
        if !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
        }
        if escaped.len() <= budget {
            current = escaped;
            continue;
        }
        for c in line.chars() {
            let piece = html::escape(c.encode_utf8(&mut [0; 4]));
            if current.len() + piece.len() > budget {
                chunks.push(std::mem::take(&mut current));
            }
            current.push_str(&piece);
        }
    }
    if !current.is_empty() || chunks.is_empty() {
        chunks.push(current);
    }
    chunks
}
