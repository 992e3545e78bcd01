//! In-process transport.

use super::{Dispatch, RemoteSubscription, Transport};
use crate::error::RemoteError;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// Calls straight into a dispatcher living in the same process.
#[derive(Clone)]
pub struct LocalTransport {
    dispatch: Arc<dyn Dispatch>,
}

impl LocalTransport {
    pub fn new<D: Dispatch>(dispatch: Arc<D>) -> Self {
        Self { dispatch }
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn invoke(&self, name: &str, args: Vec<Value>) -> Result<Value, RemoteError> {
        self.dispatch
            .dispatch(name, args)
            .await
            .map_err(RemoteError::from)
    }

    async fn subscribe(&self, name: &str, args: Vec<Value>) -> Result<RemoteSubscription, RemoteError> {
        self.dispatch
            .open(name, args)
            .await
            .map_err(RemoteError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::procedure::Procedure;
    use crate::registry::Registry;
    use crate::resolver::Resolver;
    use crate::schema::json;
    use serde_json::json;

    #[tokio::test]
    async fn test_typed_call_through_local_transport() {
        let registry = Arc::new(Registry::new());
        let sum = Procedure::define(
            "math.sum",
            json::<(i64, i64)>(),
            Some(Resolver::from_fn(|(a, b): (i64, i64)| Ok(a + b))),
            None,
        );
        registry.register_procedure(sum.clone()).unwrap();

        let transport = LocalTransport::new(registry);
        assert_eq!(sum.call(&transport, &(1, 2)).await.unwrap(), 3);
        assert_eq!(
            transport.invoke("math.sum", vec![json!(1), json!(2)]).await.unwrap(),
            json!(3)
        );
    }

    #[tokio::test]
    async fn test_errors_become_remote_errors() {
        let transport = LocalTransport::new(Arc::new(Registry::new()));
        let err = transport.invoke("missing", vec![]).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }
}
