//! Validates one bearer token against Entra ID and prints the caller's identity.
//!
//! ```sh
//! AZURE_AD_TENANT_ID=... AZURE_AD_CLIENT_ID=... RUST_LOG=entra_auth=debug \
//!     cargo run --example validate_token -- "Bearer eyJ..."
//! ```

use entra_auth::prelude::*;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = match ProviderSettings::from_env() {
        Ok(settings) => settings,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            return ExitCode::from(2);
        }
    };
    info!("Validating tokens for audience {} (issuers: {:?})", settings.audience, settings.accepted_issuers);

    let Some(argument) = std::env::args().nth(1) else {
        error!("usage: validate_token '<Bearer token>'");
        return ExitCode::from(2);
    };
    // Accept either a full header value or a bare token.
    let token = extract_bearer(&argument).unwrap_or(argument.trim());

    let validator = Validator::new(settings);
    match validator.validate(token).await {
        Ok(identity) => {
            let body = UserResponse::from(identity);
            match serde_json::to_string_pretty(&body) {
                Ok(json) => println!("{json}"),
                Err(e) => error!("Failed to serialize response: {}", e),
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Unauthorized: {}", e);
            if e.is_transient() {
                info!("The identity provider may be temporarily unavailable; retry later");
            }
            ExitCode::FAILURE
        }
    }
}
