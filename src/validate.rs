//! Response checks run before extraction. A failure here is retried like a
//! transport error.

use std::marker::PhantomData;

use serde::de::DeserializeOwned;

use crate::{error::ValidationError, http::Response};

pub trait ResponseValidator: Send + Sync {
    type Body: Send;

    fn validate(&self, response: &Response) -> Result<Self::Body, ValidationError>;
}

/// Hands the raw body through untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThrough;

impl ResponseValidator for PassThrough {
    type Body = String;

    fn validate(&self, response: &Response) -> Result<Self::Body, ValidationError> {
        Ok(response.body.clone())
    }
}

/// A platform response wrapper carrying its own business status.
pub trait Envelope: DeserializeOwned + Send {
    fn check(&self) -> Result<(), ValidationError>;
}

/// Parses the body into `T` and checks the embedded status.
#[derive(Debug)]
pub struct Schema<T> {
    _envelope: PhantomData<fn() -> T>,
}

impl<T> Schema<T> {
    pub fn new() -> Self {
        Self {
            _envelope: PhantomData,
        }
    }
}

impl<T> Default for Schema<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Envelope> ResponseValidator for Schema<T> {
    type Body = T;

    fn validate(&self, response: &Response) -> Result<Self::Body, ValidationError> {
        let envelope: T = response.json().map_err(|err| {
            tracing::debug!(url = %response.url, "unexpected body: {:.512}", response.body);
            ValidationError::Shape(err.to_string())
        })?;
        envelope.check()?;
        Ok(envelope)
    }
}
