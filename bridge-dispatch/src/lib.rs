pub mod dispatcher;

pub use dispatcher::ChangeFeedDispatcher;
