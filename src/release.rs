//! Deferred destruction of evicted memory-engine values.
//!
//! Evicting a node under the engine's mutex and then running the value's
//! destructor inline would extend the critical section by however long that
//! destructor takes. The release path lets the engine hand the value off and
//! return immediately; the value is dropped later, off the hot path.

use std::any::Any;

use crate::config::ReleasePolicy;

/// A value queued for destruction, type-erased so the release worker doesn't
/// need to be generic over every `MemoryCache<V>` instantiation in the process.
pub type Releasable = Box<dyn Any + Send>;

/// Dispatches a batch of evicted values per the configured [`ReleasePolicy`].
///
/// `Inline` drops `values` before returning. `Background` spawns a task that
/// drops them on the shared Tokio runtime. `Dedicated` forwards them to the
/// caller's channel, one message per value, for the caller to drain and drop
/// on whatever thread it designates as "main".
pub(crate) fn release(policy: &ReleasePolicy, values: Vec<Releasable>) {
    if values.is_empty() {
        return;
    }
    match policy {
        ReleasePolicy::Inline => {
            drop(values);
        }
        ReleasePolicy::Background => {
            tokio::task::spawn_blocking(move || drop(values));
        }
        ReleasePolicy::Dedicated(sender) => {
            for value in values {
                // A closed receiver means the caller stopped draining; fall
                // back to dropping here rather than leaking.
                if let Err(e) = sender.send(value) {
                    drop(e.0);
                }
            }
        }
    }
}
