pub mod backoff;

pub use backoff::{BackoffConfig, BackoffError, BackoffPolicy, BackoffStrategy};
