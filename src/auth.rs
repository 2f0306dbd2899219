use axum::http::HeaderMap;

pub const API_KEY_HEADER: &str = "x-api-key";

/// The header wins over the query parameter when both are present.
#[must_use]
pub fn presented_key<'a>(
    headers: &'a HeaderMap,
    query_key: Option<&'a str>,
) -> Option<&'a str> {
    headers
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .or(query_key)
        .filter(|key| !key.is_empty())
}

/// An empty configured key authorizes nobody.
#[must_use]
pub fn is_authorized(presented: Option<&str>, expected: &str) -> bool {
    match presented {
        Some(key) if !expected.is_empty() => {
            key.len() == expected.len()
                && key
                    .bytes()
                    .zip(expected.bytes())
                    .fold(0u8, |acc, (a, b)| acc | (a ^ b))
                    == 0
        }
        _ => false,
    }
}
