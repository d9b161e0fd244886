//! In-process publish/subscribe broker for Server-Sent Events. Independent
//! of the proxy/cache core above — other services embed [`Broker`] for
//! their own push-update needs, and `http::serve` is the reference
//! adapter exposing a subscription as a streaming HTTP response.

pub mod broker;
pub mod http;

pub use broker::{Broker, Event, Filter, PublishOutcome, SubscribeOptions, Subscription};
