//! UPI id resolution: the VPA's holder name and IFSC from the verifier, then
//! the bank branch behind that IFSC.

use std::fmt;

use anyhow::Context;
use reqwest::{header, Client, StatusCode, Url};
use serde_json::{json, Map, Value};

use crate::conf::ConfUpi;

#[derive(Debug, thiserror::Error)]
pub enum UpiError {
    #[error("UPI lookup is not configured")]
    Disabled,

    #[error("No VPA data found")]
    NotFound,

    #[error("VPA verification request failed: {0}")]
    Fetch(#[from] reqwest::Error),

    #[error("VPA verifier answered {0}")]
    Status(StatusCode),

    #[error("VPA verifier answered with invalid JSON: {0}")]
    Decode(#[source] serde_json::Error),
}

#[derive(Clone)]
pub struct UpiEndpoint {
    verify: Url,
    ifsc: Url,
    auth_token: String,
}

impl fmt::Debug for UpiEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpiEndpoint")
            .field("verify", &self.verify.as_str())
            .field("ifsc", &self.ifsc.as_str())
            .field("auth_token", &"<XXXXX>")
            .finish()
    }
}

impl UpiEndpoint {
    /// `None` when no auth token is configured.
    pub fn from_conf(conf: &ConfUpi) -> anyhow::Result<Option<Self>> {
        if conf.auth_token.trim().is_empty() {
            return Ok(None);
        }
        let verify = Url::parse(&conf.verify_url)
            .context(format!("Invalid UPI verify URL: {:?}", conf.verify_url))?;
        let ifsc = Url::parse(&conf.ifsc_url)
            .context(format!("Invalid IFSC URL: {:?}", conf.ifsc_url))?;
        Ok(Some(Self {
            verify,
            ifsc,
            auth_token: conf.auth_token.clone(),
        }))
    }

    fn bank_url(&self, ifsc: &str) -> Option<Url> {
        let mut url = self.ifsc.clone();
        url.path_segments_mut().ok()?.pop_if_empty().push(ifsc);
        Some(url)
    }
}

/// `{"vpa_details": {name, vpa, ifsc}, "bank_details_raw": ...}`. The bank
/// part is present only when the VPA carries an IFSC, and degrades to a
/// warning object when that second lookup fails.
#[tracing::instrument(skip_all)]
pub async fn resolve(
    client: &Client,
    endpoint: &UpiEndpoint,
    upi_id: &str,
) -> Result<Value, UpiError> {
    let resp = client
        .post(endpoint.verify.clone())
        .header(header::ACCEPT, "application/json")
        .header(
            header::AUTHORIZATION,
            format!("Token {}", endpoint.auth_token),
        )
        .json(&json!({ "upi_string": format!("upi://pay?pa={upi_id}") }))
        .send()
        .await?;
    let status = resp.status();
    if !status.is_success() {
        return Err(UpiError::Status(status));
    }
    let body = resp.bytes().await?;
    let body: Value = serde_json::from_slice(&body).map_err(UpiError::Decode)?;

    let vpa_info = match body.pointer("/data/verify_vpa_resp") {
        Some(Value::Object(info)) if !info.is_empty() => info,
        _ => return Err(UpiError::NotFound),
    };
    let field = |name: &str| vpa_info.get(name).cloned().unwrap_or(Value::Null);
    let details = json!({
        "name": field("name"),
        "vpa": field("vpa"),
        "ifsc": field("ifsc"),
    });

    let mut output = Map::new();
    output.insert("vpa_details".to_string(), details);
    if let Some(ifsc) = vpa_info
        .get("ifsc")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
    {
        let bank = bank_details(client, endpoint, ifsc).await.unwrap_or_else(
            || json!({ "warning": "Bank lookup failed" }),
        );
        output.insert("bank_details_raw".to_string(), bank);
    }
    Ok(Value::Object(output))
}

/// Whatever JSON the IFSC service returns, whatever its status.
async fn bank_details(
    client: &Client,
    endpoint: &UpiEndpoint,
    ifsc: &str,
) -> Option<Value> {
    let url = endpoint.bank_url(ifsc)?;
    let resp = client
        .get(url)
        .send()
        .await
        .inspect_err(|error| tracing::warn!(%error, ifsc, "Bank lookup failed."))
        .ok()?;
    let body = resp.bytes().await.ok()?;
    serde_json::from_slice(&body)
        .inspect_err(|error| tracing::warn!(%error, ifsc, "Bank lookup not JSON."))
        .ok()
}
