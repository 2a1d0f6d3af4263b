use std::{future::Future, pin::Pin, sync::Arc};

use gcp_auth::AuthenticationManager;
use http::HeaderValue;
use tower::{filter::AsyncPredicate, BoxError};

const DATABASE_SCOPES: [&str; 2] = [
    "https://www.googleapis.com/auth/cloud-platform",
    "https://www.googleapis.com/auth/spanner.data",
];

const API_CLIENT_HEADER: &str = "x-goog-api-client";

/// Adds a bearer token for the Cloud Spanner data scopes to every request.
#[derive(Clone)]
pub(crate) struct AuthFilter {
    auth_manager: Arc<AuthenticationManager>,
    api_client: HeaderValue,
}

impl AuthFilter {
    pub(crate) fn new(auth_manager: Arc<AuthenticationManager>) -> Self {
        Self {
            auth_manager,
            api_client: HeaderValue::from_static(concat!(
                "gl-rust/ gccl/",
                env!("CARGO_PKG_VERSION")
            )),
        }
    }
}

impl AsyncPredicate<http::Request<tonic::body::BoxBody>> for AuthFilter {
    type Future = Pin<Box<dyn Future<Output = Result<Self::Request, BoxError>> + Send>>;

    type Request = http::Request<tonic::body::BoxBody>;

    fn check(&mut self, request: http::Request<tonic::body::BoxBody>) -> Self::Future {
        let filter = self.clone();
        Box::pin(async move {
            let token = filter.auth_manager.get_token(&DATABASE_SCOPES).await?;

            let bearer = HeaderValue::try_from(format!("Bearer {}", token.as_str()))
                .map_err(|err| crate::Error::Client(format!("invalid auth token: {}", err)))?;

            let (mut parts, body) = request.into_parts();
            parts.headers.insert(http::header::AUTHORIZATION, bearer);
            parts.headers.insert(API_CLIENT_HEADER, filter.api_client);
            Ok(http::Request::from_parts(parts, body))
        })
    }
}
