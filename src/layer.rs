//! Request pipeline stage exposing the registry's models to handlers.

use std::task::{Context, Poll};

use axum::{extract::FromRequestParts, http::Request, http::request::Parts};
use tower::{Layer, Service};

use crate::error::ModelError;
use crate::registry::Models;

/// Layer that inserts [`Models`] into each request's extensions.
#[derive(Clone)]
pub struct MongoLayer {
    models: Models,
}

impl MongoLayer {
    pub fn new(models: Models) -> Self {
        Self { models }
    }
}

impl<S> Layer<S> for MongoLayer {
    type Service = MongoService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MongoService {
            inner,
            models: self.models.clone(),
        }
    }
}

#[derive(Clone)]
pub struct MongoService<S> {
    inner: S,
    models: Models,
}

impl<S, B> Service<Request<B>> for MongoService<S>
where
    S: Service<Request<B>>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = S::Future;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<B>) -> Self::Future {
        req.extensions_mut().insert(self.models.clone());
        self.inner.call(req)
    }
}

// Extractor for the models attached by MongoLayer
impl<S> FromRequestParts<S> for Models
where
    S: Send + Sync,
{
    type Rejection = ModelError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Models>()
            .cloned()
            .ok_or(ModelError::LayerMissing)
    }
}
