use utoipa::openapi::security::{ApiKey, ApiKeyValue, SecurityScheme};
use utoipa::OpenApi;

use crate::lookup::LookupType;
use crate::types::ErrorBody;

#[derive(OpenApi)]
#[openapi(
    paths(crate::server::handle_lookup, crate::server::handle_upi),
    components(schemas(ErrorBody, LookupType)),
    modifiers(&SecurityAddon),
    tags(
        (name = "ferret", description = "Typed lookups against upstream data providers")
    ),
    info(
        title = "Ferret API",
        version = "1.0",
        description = "Forwards a typed search term to the matching upstream \
                       provider and returns its sanitized JSON answer.",
        license(
            name = "BSD-3-Clause"
        )
    )
)]
pub struct ApiDoc;

struct SecurityAddon;

impl utoipa::Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "api_key",
                SecurityScheme::ApiKey(ApiKey::Query(ApiKeyValue::new("key"))),
            );
        }
    }
}
