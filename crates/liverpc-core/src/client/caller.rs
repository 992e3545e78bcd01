//! Typed calls by name.

use crate::error::{ErrorKind, RemoteError};
use crate::publication::Subscription;
use crate::transport::Transport;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

/// Calls procedures by name with typed input and output, for callers that
/// have no [`Procedure`](crate::Procedure) handle at hand.
///
/// The input is sent as the single positional argument; `()` sends none.
#[derive(Clone)]
pub struct SafeCaller {
    transport: Arc<dyn Transport>,
}

impl SafeCaller {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    pub async fn call<I, O>(&self, name: &str, input: &I) -> Result<O, RemoteError>
    where
        I: Serialize + ?Sized,
        O: DeserializeOwned,
    {
        let value = self.transport.invoke(name, to_args(input)?).await?;
        serde_json::from_value(value).map_err(|e| {
            RemoteError::new(
                ErrorKind::Validation,
                format!("Unexpected result from {}: {}", name, e),
            )
        })
    }

    pub async fn subscribe<I>(&self, name: &str, input: &I) -> Result<Subscription, RemoteError>
    where
        I: Serialize + ?Sized,
    {
        self.transport.subscribe(name, to_args(input)?).await
    }
}

fn to_args<I: Serialize + ?Sized>(input: &I) -> Result<Vec<Value>, RemoteError> {
    match serde_json::to_value(input)? {
        Value::Null => Ok(Vec::new()),
        value => Ok(vec![value]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::procedure::Procedure;
    use crate::registry::Registry;
    use crate::resolver::Resolver;
    use crate::schema::{json, NoArgs};
    use crate::transport::LocalTransport;

    #[tokio::test]
    async fn test_typed_call_by_name() {
        let registry = Arc::new(Registry::new());
        registry
            .register_procedure(Procedure::define(
                "math.sum",
                json::<(i64, i64)>(),
                Some(Resolver::from_fn(|(a, b): (i64, i64)| Ok(a + b))),
                None,
            ))
            .unwrap();
        registry
            .register_procedure(Procedure::define(
                "version",
                NoArgs,
                Some(Resolver::from_fn(|()| Ok("1.0".to_string()))),
                None,
            ))
            .unwrap();

        let caller = SafeCaller::new(Arc::new(LocalTransport::new(registry)));
        let sum: i64 = caller.call("math.sum", &(4, 5)).await.unwrap();
        assert_eq!(sum, 9);
        let version: String = caller.call("version", &()).await.unwrap();
        assert_eq!(version, "1.0");

        let err = caller.call::<_, String>("math.sum", &(4, 5)).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
    }
}
