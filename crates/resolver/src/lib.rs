pub mod adb;
pub mod cache;
pub mod dispatch;
pub mod fetch;
pub mod hints;
pub mod rdataset;
pub mod validate;
pub mod view;

pub use adb::{Adb, AddrInfo};
pub use cache::{CacheDb, CacheStats};
pub use fetch::{Fetch, FetchResponse, Resolver};
pub use hints::Hints;
pub use rdataset::Rdataset;
pub use validate::{NullValidator, ValidationOutcome, Validator};
pub use view::View;
