//! The fixed catalog of lookup types and the upstream endpoint behind each.

use std::{collections::BTreeMap, fmt, str::FromStr};

use anyhow::{anyhow, Context};
use reqwest::Url;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
    utoipa::ToSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum LookupType {
    MailInfo,
    BasicNum,
    Rc,
    Ifsc,
    FfBanCheck,
    Pak,
    Imei,
    ImageGenBasic,
    AdvanceImg,
}

impl LookupType {
    pub const ALL: [Self; 9] = [
        Self::MailInfo,
        Self::BasicNum,
        Self::Rc,
        Self::Ifsc,
        Self::FfBanCheck,
        Self::Pak,
        Self::Imei,
        Self::ImageGenBasic,
        Self::AdvanceImg,
    ];

    #[must_use]
    pub fn tag(self) -> &'static str {
        match self {
            Self::MailInfo => "mailinfo",
            Self::BasicNum => "basicnum",
            Self::Rc => "rc",
            Self::Ifsc => "ifsc",
            Self::FfBanCheck => "ffbancheck",
            Self::Pak => "pak",
            Self::Imei => "imei",
            Self::ImageGenBasic => "imagegenbasic",
            Self::AdvanceImg => "advanceimg",
        }
    }

    /// Button caption in the bot.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::MailInfo => "Mail Info",
            Self::BasicNum => "Phone Info",
            Self::Rc => "Vehicle RC",
            Self::Ifsc => "IFSC Info",
            Self::FfBanCheck => "FF Ban Check",
            Self::Pak => "PAK Info",
            Self::Imei => "IMEI Info",
            Self::ImageGenBasic => "Basic Image",
            Self::AdvanceImg => "Advanced Image",
        }
    }

    fn default_endpoint(self) -> (&'static str, &'static str, Extra) {
        match self {
            Self::MailInfo => ("https://ab-mailinfoapi.vercel.app/info", "mail", &[]),
            Self::BasicNum => ("https://ab-calltraceapi.vercel.app/info", "number", &[]),
            Self::Rc => ("https://vehicle-eight-vert.vercel.app/api", "rc", &[]),
            Self::Ifsc => ("https://ab-ifscinfoapi.vercel.app/info", "ifsc", &[]),
            Self::FfBanCheck => (
                "https://ban-check-api-nwqa.vercel.app/ban-check",
                "uid",
                &[],
            ),
            Self::Pak => ("https://x.taitaninfo.workers.dev/", "paknumber", &[]),
            Self::Imei => ("https://xc.taitaninfo.workers.dev/", "imei", &[]),
            Self::ImageGenBasic => (
                "https://botmaker.serv00.net/pollination.php",
                "prompt",
                &[],
            ),
            Self::AdvanceImg => (
                "https://splexx-api-img.vercel.app/api/imggen",
                "text",
                &[("key", "SPLEXXO")],
            ),
        }
    }
}

impl fmt::Display for LookupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid type: {0:?}")]
pub struct UnknownType(pub String);

impl FromStr for LookupType {
    type Err = UnknownType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.tag() == s)
            .ok_or_else(|| UnknownType(s.to_string()))
    }
}

type Extra = &'static [(&'static str, &'static str)];

#[derive(Debug, Clone)]
pub struct Endpoint {
    pub base: Url,
    pub param: &'static str,
    pub extra: Extra,
}

impl Endpoint {
    /// `term` is URL-encoded here; callers pass it raw.
    #[must_use]
    pub fn url(&self, term: &str) -> Url {
        let mut url = self.base.clone();
        url.query_pairs_mut()
            .append_pair(self.param, term)
            .extend_pairs(self.extra.iter().copied());
        url
    }
}

#[derive(Debug, Clone)]
pub struct Endpoints {
    table: BTreeMap<LookupType, Endpoint>,
}

impl Endpoints {
    /// Keys of `overrides` must be type tags; values replace the base URL
    /// while keeping the query parameter name.
    pub fn new(overrides: &BTreeMap<String, String>) -> anyhow::Result<Self> {
        let mut table = BTreeMap::new();
        for kind in LookupType::ALL {
            let (base, param, extra) = kind.default_endpoint();
            let base = Url::parse(base)
                .context(format!("Bad built-in endpoint for {kind}"))?;
            table.insert(kind, Endpoint { base, param, extra });
        }
        for (tag, base) in overrides {
            let kind: LookupType = tag.parse().map_err(|UnknownType(t)| {
                anyhow!("Upstream override for unknown type: {t:?}")
            })?;
            let base = Url::parse(base).context(format!(
                "Invalid upstream override URL for {kind}: {base:?}"
            ))?;
            if let Some(endpoint) = table.get_mut(&kind) {
                tracing::info!(%kind, %base, "Overriding upstream endpoint.");
                endpoint.base = base;
            }
        }
        Ok(Self { table })
    }

    #[must_use]
    pub fn get(&self, kind: LookupType) -> Option<&Endpoint> {
        self.table.get(&kind)
    }
}
