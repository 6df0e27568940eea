pub mod broker;
pub mod store;

pub use broker::{DispatchError, Dispatched, Dispatcher};
pub use store::{FjallQueue, QueueError};
