//! Executor seam for the channel-returning variant. [`Group::work_chan`]
//! hands the in-flight wait to a spawned task so the caller can pick the
//! result up from a channel instead of awaiting in place.
//!
//! [`Group::work_chan`]: crate::Group::work_chan
use std::future::Future;

/// Spawns a detached future onto an executor and lets it run to
/// completion.
pub trait Spawner {
    fn spawn<F: Future<Output = ()> + Send + 'static>(&self, f: F);
}

cfg_async_std! {
    pub mod use_async_std {
        use super::*;

        #[derive(Default, Clone)]
        pub struct AsyncStdSpawner;

        impl Spawner for AsyncStdSpawner {
            fn spawn<F: Future<Output = ()> + Send + 'static>(&self, f: F) {
                // Dropping the handle detaches the task.
                let _ = async_std::task::spawn(f);
            }
        }
    }
}

cfg_tokio! {
    pub mod use_tokio {
        use super::*;
        use tokio::runtime::{Builder, Handle, Runtime};

        pub struct TokioSpawner(Option<TokioRuntime>);

        impl Clone for TokioSpawner {
            fn clone(&self) -> Self {
                Self(self.0.as_ref().map(|rt| match rt {
                    TokioRuntime::ByHandle(handle) => TokioRuntime::ByHandle(handle.clone()),
                    TokioRuntime::Owned(runtime) => TokioRuntime::ByHandle(runtime.handle().clone()),
                }))
            }
        }

        const RUNTIME_INVARIANT_ERR: &str =
            "invariant: runtime must be available during the spawner's lifetime";

        impl Drop for TokioSpawner {
            /// Graceful shutdown of an owned runtime.
            fn drop(&mut self) {
                if let TokioRuntime::Owned(rt) = self.0.take().expect(RUNTIME_INVARIANT_ERR) {
                    rt.shutdown_background()
                }
            }
        }

        impl TokioSpawner {
            pub fn new(rt_handle: Handle) -> Self {
                Self(Some(TokioRuntime::ByHandle(rt_handle)))
            }

            fn handle(&self) -> &Handle {
                match self.0.as_ref().expect(RUNTIME_INVARIANT_ERR) {
                    TokioRuntime::ByHandle(handle) => handle,
                    TokioRuntime::Owned(runtime) => runtime.handle(),
                }
            }
        }

        /// Variants of supplied tokio runtime.
        /// Is needed because runtime can be either passed or created.
        enum TokioRuntime {
            /// User provides its own runtime, we'll refer to it by handle.
            ByHandle(Handle),
            /// We've created our own ad-hoc runtime, so we'll own it.
            Owned(Runtime),
        }

        // By default, `TokioSpawner` operates on the globally available
        // runtime. An ad-hoc runtime is created only if none is available.
        // It must have a worker of its own, since detached tasks have to
        // progress without anyone calling `block_on`, and it is shut down
        // when the spawner is gone so it cannot keep the program alive.
        impl Default for TokioSpawner {
            fn default() -> Self {
                if let Ok(handle) = Handle::try_current() {
                    return Self(Some(TokioRuntime::ByHandle(handle)));
                }
                let runtime = Builder::new_multi_thread()
                    .worker_threads(1)
                    .enable_all()
                    .build()
                    .unwrap();
                Self(Some(TokioRuntime::Owned(runtime)))
            }
        }

        impl Spawner for TokioSpawner {
            fn spawn<F: Future<Output = ()> + Send + 'static>(&self, f: F) {
                self.handle().spawn(f);
            }
        }
    }
}
