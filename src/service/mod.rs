//! Service layer
//!
//! Contains business logic separated from HTTP handlers and task plumbing.
//! Services orchestrate database, silo and webmention operations.

mod account;
mod delivery;
pub mod discovery;
mod poll;
mod propagation;
mod publish;

pub use account::AccountService;
pub use delivery::DeliveryService;
pub use discovery::{FeedCrawler, HttpFeedCrawler, OriginalPostDiscovery, SyndicationResolver};
pub use poll::{PollOutcome, Poller};
pub use propagation::{Propagation, PropagationWorker};
pub use publish::{PublishRequest, PublishService};
