use std::{
    collections::BTreeMap,
    fmt::Debug,
    fs,
    net::IpAddr,
    path::{Path, PathBuf},
    str::FromStr,
    sync::{Arc, LazyLock},
};

use anyhow::Context;

pub static GLOBAL: LazyLock<Arc<Conf>> = LazyLock::new(|| {
    let conf = read_or_create_default().unwrap_or_else(|error| {
        panic!("Failed to initialize global config: {error:?}")
    });
    Arc::new(conf)
});

#[must_use]
pub fn global() -> Arc<Conf> {
    (*GLOBAL).clone()
}

#[derive(serde::Serialize, serde::Deserialize, Clone)]
pub struct Conf {
    #[serde(
        serialize_with = "serialize_log_level",
        deserialize_with = "deserialize_log_level"
    )]
    pub log_level: tracing::Level,
    pub addr: IpAddr,
    pub port: u16,

    /// Shared secret expected in `key` (or `x-api-key`) by `GET /api`.
    pub api_key: String,

    /// Value of the `api_by` field appended to every response.
    pub attribution: String,

    /// Seconds. Zero leaves the transport default in place.
    pub upstream_timeout: f32,

    /// Usage ledger document, relative to the working directory.
    pub data_file: PathBuf,

    pub daily_limit: u32,

    #[serde(default)]
    pub cors_origins: Vec<String>,

    pub telegram: ConfTelegram,

    /// Per-tag replacement of the upstream base URL.
    #[serde(default)]
    pub upstreams: BTreeMap<String, String>,

    #[serde(default)]
    pub upi: ConfUpi,

    pub tls: Option<Tls>,
}

impl Default for Conf {
    fn default() -> Self {
        Self {
            log_level: tracing::Level::INFO,
            addr: "127.0.0.1".parse().unwrap_or_else(|_| {
                unreachable!("Fat-fingered default IP address!")
            }),
            port: 3001,
            api_key: "change-me".to_string(),
            attribution: "ferret".to_string(),
            upstream_timeout: 30.0,
            data_file: PathBuf::from("db.json"),
            daily_limit: 10,
            cors_origins: vec!["http://localhost:3000".to_string()],
            telegram: ConfTelegram::default(),
            upstreams: BTreeMap::new(),
            upi: ConfUpi::default(),
            tls: None,
        }
    }
}

impl Debug for Conf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conf")
            .field("log_level", &self.log_level)
            .field("addr", &self.addr)
            .field("port", &self.port)
            .field("api_key", &"<XXXXX>")
            .field("attribution", &self.attribution)
            .field("upstream_timeout", &self.upstream_timeout)
            .field("data_file", &self.data_file)
            .field("daily_limit", &self.daily_limit)
            .field("cors_origins", &self.cors_origins)
            .field("telegram", &self.telegram)
            .field("upstreams", &self.upstreams)
            .field("upi", &self.upi)
            .field("tls", &self.tls)
            .finish()
    }
}

#[derive(serde::Serialize, serde::Deserialize, Debug, Clone)]
pub struct Tls {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

#[derive(serde::Serialize, serde::Deserialize, Clone)]
pub struct ConfTelegram {
    /// Empty disables the bot; the webhook then answers 503.
    pub bot_token: String,
    pub admin_id: i64,
    pub force_join_channel: Option<String>,
    pub webhook_secret: Option<String>,

    /// Seconds a pressed lookup button waits for its term.
    pub pending_timeout: f32,
    pub welcome_photo_url: Option<String>,

    /// Bot API server to talk to instead of `api.telegram.org`.
    #[serde(default)]
    pub api_url: Option<String>,
}

impl Default for ConfTelegram {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            admin_id: 0,
            force_join_channel: None,
            webhook_secret: None,
            pending_timeout: 300.0,
            welcome_photo_url: None,
            api_url: None,
        }
    }
}

impl ConfTelegram {
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        !self.bot_token.trim().is_empty()
    }
}

impl Debug for ConfTelegram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfTelegram")
            .field("bot_token", &"<XXXXX>")
            .field("admin_id", &self.admin_id)
            .field("force_join_channel", &self.force_join_channel)
            .field(
                "webhook_secret",
                &self.webhook_secret.as_ref().map(|_| "<XXXXX>"),
            )
            .field("pending_timeout", &self.pending_timeout)
            .field("welcome_photo_url", &self.welcome_photo_url)
            .field("api_url", &self.api_url)
            .finish()
    }
}

/// VPA verification followed by a bank lookup on the VPA's IFSC.
#[derive(serde::Serialize, serde::Deserialize, Clone)]
pub struct ConfUpi {
    pub verify_url: String,
    pub ifsc_url: String,

    /// Sent as `authorization: Token <auth_token>`. Empty disables
    /// `GET /api/upi`.
    pub auth_token: String,
}

impl Default for ConfUpi {
    fn default() -> Self {
        Self {
            verify_url: "https://halfblood.famapp.in/vpa/verifyExt".to_string(),
            ifsc_url: "https://ifsc.razorpay.com/".to_string(),
            auth_token: String::new(),
        }
    }
}

impl Debug for ConfUpi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfUpi")
            .field("verify_url", &self.verify_url)
            .field("ifsc_url", &self.ifsc_url)
            .field("auth_token", &"<XXXXX>")
            .finish()
    }
}

fn serialize_log_level<S>(
    level: &tracing::Level,
    serializer: S,
) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    let s = level.to_string();
    serializer.serialize_str(&s)
}

fn deserialize_log_level<'de, D>(
    deserializer: D,
) -> Result<tracing::Level, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::Deserialize;

    let s = String::deserialize(deserializer)?;
    tracing::Level::from_str(&s).map_err(serde::de::Error::custom)
}

pub fn read_or_create_default() -> anyhow::Result<Conf> {
    let path = "conf/conf.toml";
    read_or_create_default_(path).context(path)
}

pub fn read_or_create_default_<P: AsRef<Path>>(
    path: P,
) -> anyhow::Result<Conf> {
    let path = path.as_ref();
    let conf = if fs::exists(path)? {
        let s = fs::read_to_string(path)?;
        toml::from_str(&s)?
    } else {
        if let Some(parent) = path.parent() {
            let ctx = format!(
                "Failed to create parent directory \
                for conf file: {path:?}"
            );
            fs::create_dir_all(parent).context(ctx)?;
        }
        let conf = Conf::default();
        let s = toml::to_string_pretty(&conf)?;
        fs::write(path, s)?;
        conf
    };
    Ok(conf)
}
