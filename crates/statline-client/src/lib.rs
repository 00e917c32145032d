pub mod http;

pub use http::{GuardedClient, domain_key, parse_retry_after};
