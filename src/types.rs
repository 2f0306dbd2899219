use utoipa::{IntoParams, ToSchema};

/// Query of `GET /api`. Fields are optional so that absence is reported as
/// a 400 with the usual error body rather than an extractor rejection.
#[derive(serde::Deserialize, Debug, Default, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct LookupQuery {
    /// Shared API key. May instead be sent in the `x-api-key` header.
    pub key: Option<String>,
    /// One of the lookup type tags, e.g. `mailinfo`.
    #[serde(rename = "type")]
    pub kind: Option<String>,
    /// Free-text search term.
    pub term: Option<String>,
}

#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, ToSchema)]
pub struct ErrorBody {
    pub error: String,
    pub api_by: String,
}

/// Query of `GET /api/upi`.
#[derive(serde::Deserialize, Debug, Default, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct UpiQuery {
    /// Shared API key. May instead be sent in the `x-api-key` header.
    pub key: Option<String>,
    /// UPI id (VPA), e.g. `name@bank`.
    pub upi_id: Option<String>,
}
