//! Duplicate suppression for async calls, with a composite cancellation
//! scope for the shared execution.
//!
//! ## Motivation
//!
//! Collapsing concurrent calls for the same key into one execution (the
//! classic single-flight pattern) interacts badly with cancellation. If
//! the shared execution runs under the first caller's scope, that caller
//! cancelling aborts work that the other callers still want. If it runs
//! under no scope at all, there is no way to tell it that every caller
//! has walked away and it is heating the room for nobody.
//!
//! A [`Group`] resolves this by synthesizing a scope for the shared
//! execution. Every caller registers its own
//! [`CancellationToken`]; the scope handed to the work function is a
//! fresh root token that is cancelled exactly when *all* registered
//! callers' tokens have fired. One impatient caller among many changes
//! nothing; the last one to give up pulls the plug.
//!
//! ## API
//!
//! [`Group::work`] runs a function for a key, deduplicating against
//! every overlapping call with the same key, and resolves to the shared
//! result plus a flag telling whether it was shared.
//! [`Group::work_chan`] is the non-blocking variant: it hands the wait
//! to a spawned task (via the [`Spawner`] seam, with tokio and
//! async-std backends behind the `use-tokio` and `use-async-std`
//! features) and returns a single-shot channel. [`Group::forget`] drops
//! the deduplication record for a key so the next arrival starts fresh.
//!
//! The underlying call table is exposed as the [`singleflight`] module,
//! usable on its own when no cancellation coordination is needed.
//!
//! ## Cancellation semantics
//!
//! Cancelling a caller's token is a withdrawal, not an abort: the call
//! still resolves with the shared result, and the shared execution keeps
//! running as long as any caller remains registered. The scope seen by
//! the work function is also cancelled once the function returns, so
//! watchers started inside it terminate. Dropping the future returned by
//! [`Group::work`] withdraws the caller entirely; when every caller's
//! future is gone the work future itself is dropped and all bookkeeping
//! for the key is torn down.
//!
//! ## Example
//!
//! ```
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! use scopeflight::{CancellationToken, Group};
//!
//! let group: Group<String, String> = Group::new();
//! let caller = CancellationToken::new();
//!
//! let (value, shared) = group
//!     .work(&caller, "config", |scope| async move {
//!         // `scope` fires only when every caller has cancelled.
//!         let _ = scope;
//!         Ok("loaded".to_string())
//!     })
//!     .await;
//!
//! assert_eq!(value.unwrap(), "loaded");
//! assert!(!shared);
//! # }
//! ```
#[macro_use]
mod utils;

mod group;
pub mod singleflight;

cfg_any_spawner! {
    pub mod spawner;
}

pub use group::{Flight, Group, Outcome};
pub use tokio_util::sync::CancellationToken;

cfg_any_spawner! {
    pub use spawner::Spawner;
}

cfg_tokio! {
    pub use spawner::use_tokio::TokioSpawner;
}

cfg_async_std! {
    pub use spawner::use_async_std::AsyncStdSpawner;
}
