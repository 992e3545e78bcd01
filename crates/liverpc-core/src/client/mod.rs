//! Client side: path dispatch, typed calls, query cache and mirrors.
//!
//! Everything here runs on top of a [`Transport`](crate::Transport) and never
//! needs a [`Registry`](crate::Registry) in the same process.

mod caller;
mod dispatch;
pub mod mirror;
pub mod query;

pub use caller::SafeCaller;
pub use dispatch::{BindingMode, ClientDispatch, DispatchPath, Dispatched, RESERVED_FIELDS};
pub use mirror::{LiveView, MirrorContainer, MirrorStore};
pub use query::{MutationBinding, QueryBinding, QueryCache, QueryKey, QueryState, QueryStatus};
