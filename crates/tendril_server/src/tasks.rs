//! Asynchronous work started from reactive code
//!
//! Futures run on the tokio runtime; their completions are sent back to the
//! owning window task and applied there, inside a batch, so the reactive
//! graph is only ever touched by its window. Each completion carries the
//! [`LivenessToken`] of the owner that spawned it and is dropped if that
//! owner was disposed in the meantime.

use std::future::Future;
use std::sync::{Arc, OnceLock};

use tendril_core::{Context, LivenessToken, ReactiveGraph, Signal};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

type ApplyFn = Box<dyn FnOnce(&ReactiveGraph) + Send>;

/// A finished task waiting to be applied by its window
pub(crate) struct Completion {
    token: LivenessToken,
    apply: ApplyFn,
}

impl Completion {
    /// Run the completion unless its owner is gone
    pub(crate) fn apply(self, graph: &ReactiveGraph) -> bool {
        if !self.token.is_alive() {
            return false;
        }
        (self.apply)(graph);
        true
    }
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion")
            .field("alive", &self.token.is_alive())
            .finish()
    }
}

/// Spawns futures whose results flow back into one window's graph
#[derive(Clone, Debug)]
pub struct TaskSpawner {
    window: Arc<str>,
    completions: mpsc::UnboundedSender<Completion>,
}

static SPAWNER_CONTEXT: OnceLock<Context<Option<TaskSpawner>>> = OnceLock::new();

impl TaskSpawner {
    pub(crate) fn new(window: Arc<str>) -> (Self, mpsc::UnboundedReceiver<Completion>) {
        let (completions, receiver) = mpsc::unbounded_channel();
        (
            Self {
                window,
                completions,
            },
            receiver,
        )
    }

    /// Context key under which every window provides its spawner
    pub fn context() -> &'static Context<Option<TaskSpawner>> {
        SPAWNER_CONTEXT.get_or_init(|| Context::new(None))
    }

    /// The spawner of the window whose graph is running right now
    pub fn current(graph: &ReactiveGraph) -> Option<TaskSpawner> {
        graph.use_context(Self::context())
    }

    pub fn window_id(&self) -> &str {
        &self.window
    }

    /// Run `future` and hand its output to `complete` on the window task
    ///
    /// `complete` is skipped when the current owner is disposed before the
    /// future finishes.
    pub fn spawn<F, T, C>(&self, graph: &ReactiveGraph, future: F, complete: C) -> JoinHandle<()>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
        C: FnOnce(&ReactiveGraph, T) + Send + 'static,
    {
        let token = graph.liveness_token();
        let completions = self.completions.clone();
        let window = self.window.clone();
        tokio::spawn(async move {
            let output = future.await;
            if !token.is_alive() {
                tracing::trace!(window = %window, "task finished after its owner was disposed");
                return;
            }
            let completion = Completion {
                token,
                apply: Box::new(move |graph: &ReactiveGraph| complete(graph, output)),
            };
            if completions.send(completion).is_err() {
                tracing::trace!(window = %window, "task finished after its window closed");
            }
        })
    }

    /// Run `future` and write its output into `signal`
    pub fn spawn_into<F, T>(&self, graph: &ReactiveGraph, future: F, signal: Signal<T>) -> JoinHandle<()>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.spawn(graph, future, move |graph, value| {
            graph.set(signal, value);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_completion_applied_on_window() {
        let graph = ReactiveGraph::new();
        let (spawner, mut completions) = TaskSpawner::new(Arc::from("w"));

        let (_root, signal) = graph.create_root(|g| {
            let signal = g.create_signal(0u32);
            spawner.spawn_into(g, async { 7u32 }, signal);
            signal
        });

        let completion = completions.recv().await.unwrap();
        assert!(completion.apply(&graph));
        assert_eq!(graph.get_untracked(signal), Some(7));
    }

    #[tokio::test]
    async fn test_disposed_owner_drops_completion() {
        let graph = ReactiveGraph::new();
        let (spawner, mut completions) = TaskSpawner::new(Arc::from("w"));
        let (gate_tx, gate_rx) = tokio::sync::oneshot::channel::<()>();

        let (root, signal) = graph.create_root(|g| {
            let signal = g.create_signal(0u32);
            spawner.spawn_into(
                g,
                async move {
                    let _ = gate_rx.await;
                    1u32
                },
                signal,
            );
            signal
        });

        graph.dispose_root(root);
        let _ = gate_tx.send(());
        drop(spawner);

        // the task drops its completion, so the channel closes empty
        assert!(completions.recv().await.is_none());
        assert_eq!(graph.get_untracked(signal), None);
    }

    #[test]
    fn test_context_lookup() {
        let graph = ReactiveGraph::new();
        let (spawner, _completions) = TaskSpawner::new(Arc::from("abc"));

        assert!(TaskSpawner::current(&graph).is_none());
        let found = graph.create_root(|g| {
            g.provide_context(TaskSpawner::context(), Some(spawner.clone()));
            TaskSpawner::current(g)
        });
        assert_eq!(found.1.map(|s| s.window_id().to_string()), Some("abc".to_string()));
    }
}
