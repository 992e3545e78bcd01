//! Input validation for procedures and publications.
//!
//! A [`Validator`] turns the raw, untyped JSON input of an invocation into the
//! typed value the resolver and hooks receive. The serde-backed [`Json`]
//! validator covers most cases; [`ValidatorExt::refine`] layers extra checks
//! on top of any validator.

use crate::error::RpcError;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;
use std::marker::PhantomData;
use thiserror::Error;

/// Input rejected by a validator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ValidationError {
    pub message: String,
}

impl ValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<ValidationError> for RpcError {
    fn from(err: ValidationError) -> Self {
        RpcError::Validation {
            message: err.message,
        }
    }
}

/// Parses raw input into a typed value.
pub trait Validator: Send + Sync + 'static {
    type Output: Send + Sync + 'static;

    /// Parse `input`, rejecting it with a [`ValidationError`].
    fn parse(&self, input: &Value) -> Result<Self::Output, ValidationError>;
}

/// Deserializes input into `T` with serde.
pub struct Json<T> {
    _marker: PhantomData<fn() -> T>,
}

/// Serde-backed validator for `T`.
pub fn json<T>() -> Json<T>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    Json {
        _marker: PhantomData,
    }
}

impl<T> Clone for Json<T> {
    fn clone(&self) -> Self {
        Json {
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Json<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Json<{}>", std::any::type_name::<T>())
    }
}

impl<T> Validator for Json<T>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    type Output = T;

    fn parse(&self, input: &Value) -> Result<T, ValidationError> {
        T::deserialize(input).map_err(|e| ValidationError::new(e.to_string()))
    }
}

/// Accepts any input unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnyValue;

impl Validator for AnyValue {
    type Output = Value;

    fn parse(&self, input: &Value) -> Result<Value, ValidationError> {
        Ok(input.clone())
    }
}

/// Accepts only an absent argument list.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoArgs;

impl Validator for NoArgs {
    type Output = ();

    fn parse(&self, input: &Value) -> Result<(), ValidationError> {
        match input {
            Value::Null => Ok(()),
            Value::Array(items) if items.is_empty() => Ok(()),
            _ => Err(ValidationError::new("Unexpected arguments")),
        }
    }
}

/// Validator built from a closure.
pub struct FnValidator<F, T> {
    parse: F,
    _marker: PhantomData<fn() -> T>,
}

/// Wrap a parsing closure as a validator.
pub fn from_fn<F, T>(parse: F) -> FnValidator<F, T>
where
    F: Fn(&Value) -> Result<T, ValidationError> + Send + Sync + 'static,
    T: Send + Sync + 'static,
{
    FnValidator {
        parse,
        _marker: PhantomData,
    }
}

impl<F, T> Validator for FnValidator<F, T>
where
    F: Fn(&Value) -> Result<T, ValidationError> + Send + Sync + 'static,
    T: Send + Sync + 'static,
{
    type Output = T;

    fn parse(&self, input: &Value) -> Result<T, ValidationError> {
        (self.parse)(input)
    }
}

/// A validator followed by an extra check on its output.
pub struct Refine<V, F> {
    inner: V,
    check: F,
}

impl<V, F> Validator for Refine<V, F>
where
    V: Validator,
    F: Fn(&V::Output) -> Result<(), String> + Send + Sync + 'static,
{
    type Output = V::Output;

    fn parse(&self, input: &Value) -> Result<V::Output, ValidationError> {
        let parsed = self.inner.parse(input)?;
        (self.check)(&parsed).map_err(ValidationError::new)?;
        Ok(parsed)
    }
}

/// Combinators available on every validator.
pub trait ValidatorExt: Validator + Sized {
    /// Run `check` on the parsed value; an `Err` rejects the input.
    fn refine<F>(self, check: F) -> Refine<Self, F>
    where
        F: Fn(&Self::Output) -> Result<(), String> + Send + Sync + 'static,
    {
        Refine { inner: self, check }
    }
}

impl<V: Validator> ValidatorExt for V {}
