//! Two-tier content-addressed cache: [`key`] derives stable cache keys from
//! a request, [`store`] owns the on-disk fixtures/cache tiers.

pub mod key;
pub mod store;

pub use key::{domain_dir_name, generate_key, normalize_url};
pub use store::{CacheEntry, RequestMeta, ResponseMeta, Source, Stats, Store};
