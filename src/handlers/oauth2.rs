//! OAuth2 refresh-token exchange
//!
//! Google Drive settings carry a long-lived refresh token. Loading them
//! trades it for an access token once; there is no refresh scheduling.

use oauth2::{
    basic::BasicClient, AuthUrl, ClientId, ClientSecret, EndpointNotSet, EndpointSet,
    RefreshToken, RequestTokenError, TokenResponse, TokenUrl,
};
use secrecy::{ExposeSecret, SecretString};
use std::time::Duration;
use tracing::{debug, info};

use super::{GoogleDriveSettings, HandlerError};

/// Client with auth and token endpoints set (v5 typestates)
type ConfiguredClient = BasicClient<EndpointSet, EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointSet>;

/// Transport failure reported through the oauth2 adapter
#[derive(Debug)]
struct OAuth2TransportError(String);

impl std::fmt::Display for OAuth2TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for OAuth2TransportError {}

/// Async HTTP client adapter for oauth2 v5 over reqwest 0.13
struct OAuth2HttpClient;

impl<'c> oauth2::AsyncHttpClient<'c> for OAuth2HttpClient {
    type Error = oauth2::HttpClientError<OAuth2TransportError>;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<oauth2::HttpResponse, Self::Error>> + Send + Sync + 'c>,
    >;

    fn call(&'c self, request: oauth2::HttpRequest) -> Self::Future {
        Box::pin(async move {
            let client = reqwest::Client::builder()
                .redirect(reqwest::redirect::Policy::none())
                .build()
                .map_err(|e| oauth2::HttpClientError::Other(e.to_string()))?;

            let method = reqwest::Method::from_bytes(request.method().as_str().as_bytes())
                .unwrap_or(reqwest::Method::POST);
            let url = request.uri().to_string();

            let mut builder = client.request(method, &url);
            for (name, value) in request.headers() {
                builder = builder.header(name.as_str(), value.as_bytes());
            }
            builder = builder.body(request.into_body());

            let response = builder
                .send()
                .await
                .map_err(|e| oauth2::HttpClientError::Other(e.to_string()))?;

            let status_code = response.status().as_u16();
            let headers = response.headers().clone();
            let body = response
                .bytes()
                .await
                .map_err(|e| oauth2::HttpClientError::Other(e.to_string()))?;

            let mut http_response = http::Response::builder().status(
                http::StatusCode::from_u16(status_code)
                    .unwrap_or(http::StatusCode::INTERNAL_SERVER_ERROR),
            );
            for (name, value) in headers.iter() {
                http_response = http_response.header(name.as_str(), value.as_bytes());
            }
            http_response
                .body(body.to_vec())
                .map_err(|e| oauth2::HttpClientError::Other(e.to_string()))
        })
    }
}

/// Access token obtained from a refresh-token grant
#[derive(Debug, Clone)]
pub struct AccessToken {
    pub secret: SecretString,
    pub expires_in: Option<Duration>,
}

fn create_client(settings: &GoogleDriveSettings) -> Result<ConfiguredClient, HandlerError> {
    let auth_url = AuthUrl::new(settings.endpoints.auth_url.clone())
        .map_err(|e| HandlerError::InvalidArgument(format!("invalid auth URL: {}", e)))?;
    let token_url = TokenUrl::new(settings.endpoints.token_url.clone())
        .map_err(|e| HandlerError::InvalidArgument(format!("invalid token URL: {}", e)))?;

    Ok(BasicClient::new(ClientId::new(settings.client_id.clone()))
        .set_client_secret(ClientSecret::new(
            settings.client_secret.expose_secret().to_string(),
        ))
        .set_auth_uri(auth_url)
        .set_token_uri(token_url))
}

/// Exchange the configured refresh token for an access token
pub async fn refresh_access_token(settings: &GoogleDriveSettings) -> Result<AccessToken, HandlerError> {
    let client = create_client(settings)?;
    debug!("Refreshing Google access token via {}", settings.endpoints.token_url);

    let token_result = client
        .exchange_refresh_token(&RefreshToken::new(
            settings.refresh_token.expose_secret().to_string(),
        ))
        .request_async(&OAuth2HttpClient)
        .await
        .map_err(|e| match e {
            RequestTokenError::ServerResponse(resp) => {
                HandlerError::Unauthorized(format!("token refresh rejected: {}", resp))
            }
            RequestTokenError::Request(err) => HandlerError::connection("token refresh", err),
            other => HandlerError::connection("token refresh", other.to_string()),
        })?;

    let secret = token_result.access_token().secret();
    if secret.trim().is_empty() {
        return Err(HandlerError::Unauthorized(
            "token endpoint returned an empty access token".to_string(),
        ));
    }

    info!("Google access token refreshed");
    Ok(AccessToken {
        secret: SecretString::from(secret.clone()),
        expires_in: token_result.expires_in(),
    })
}
