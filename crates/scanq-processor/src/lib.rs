//! scanq request processing: command line surface and the request feed loop

pub mod cli;
pub mod feed;

pub use feed::{run_feed, FeedSummary, RequestHandler};
