pub mod collaborators;
pub mod extract;
pub mod fetch;
pub mod health;
pub mod identity;
pub mod matcher;
pub mod merge;
pub mod outbox;
pub mod pipeline;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;
pub mod traits;
