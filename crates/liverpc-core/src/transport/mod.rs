//! Transport seams.
//!
//! [`Transport`] is the caller side: send a name and positional arguments,
//! get back a value or a [`RemoteError`]. [`Dispatch`] is the server side a
//! transport adapter calls into; [`Registry`] implements it.

mod local;

pub use local::LocalTransport;

use crate::error::{RemoteError, RpcError};
use crate::publication::Subscription;
use crate::registry::Registry;
use async_trait::async_trait;
use serde_json::Value;

/// A subscription opened through a transport.
pub type RemoteSubscription = Subscription;

/// Caller side of a transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Call the procedure `name` with positional arguments.
    async fn invoke(&self, name: &str, args: Vec<Value>) -> Result<Value, RemoteError>;

    /// Subscribe to the publication `name` with positional arguments.
    async fn subscribe(&self, name: &str, args: Vec<Value>) -> Result<RemoteSubscription, RemoteError>;
}

/// Server side of a transport: what a transport adapter dispatches into.
#[async_trait]
pub trait Dispatch: Send + Sync + 'static {
    async fn dispatch(&self, method: &str, args: Vec<Value>) -> Result<Value, RpcError>;

    async fn open(&self, publication: &str, args: Vec<Value>) -> Result<Subscription, RpcError>;
}

#[async_trait]
impl Dispatch for Registry {
    async fn dispatch(&self, method: &str, args: Vec<Value>) -> Result<Value, RpcError> {
        self.call(method, args_to_input(args)).await
    }

    async fn open(&self, publication: &str, args: Vec<Value>) -> Result<Subscription, RpcError> {
        self.subscribe(publication, args_to_input(args)).await
    }
}

/// Collapse positional arguments into a single raw input: no arguments is
/// `null`, one argument is itself, several are an array.
pub fn args_to_input(mut args: Vec<Value>) -> Value {
    match args.len() {
        0 => Value::Null,
        1 => args.pop().unwrap_or(Value::Null),
        _ => Value::Array(args),
    }
}

/// Interpret request params as positional arguments. A non-array value is a
/// single argument; absent params are none.
pub fn params_to_args(params: Option<Value>) -> Vec<Value> {
    match params {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(args)) => args,
        Some(other) => vec![other],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_args_to_input() {
        assert_eq!(args_to_input(vec![]), Value::Null);
        assert_eq!(args_to_input(vec![json!(5)]), json!(5));
        assert_eq!(args_to_input(vec![json!(1), json!(2)]), json!([1, 2]));
    }

    #[test]
    fn test_params_to_args() {
        assert!(params_to_args(None).is_empty());
        assert_eq!(params_to_args(Some(json!([1, 2]))), vec![json!(1), json!(2)]);
        assert_eq!(params_to_args(Some(json!({"a": 1}))), vec![json!({"a": 1})]);
    }
}
