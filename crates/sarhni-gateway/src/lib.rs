pub mod dispatcher;
pub mod stream;

pub use dispatcher::{Dispatcher, Subscription};
