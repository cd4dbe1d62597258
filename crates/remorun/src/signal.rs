use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;

/// A one-way latch that any number of tasks can await.
#[derive(Clone)]
pub(crate) struct Flag {
    tx: Arc<watch::Sender<bool>>,
}

impl Flag {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Raises the flag. Returns false if it was already raised.
    pub(crate) fn raise(&self) -> bool {
        self.tx.send_if_modified(|raised| {
            if *raised {
                false
            } else {
                *raised = true;
                true
            }
        })
    }

    pub(crate) fn is_raised(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the flag is raised. Owns its receiver, so it can be
    /// moved into spawned tasks.
    pub(crate) fn wait(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.tx.subscribe();
        async move {
            loop {
                let raised = *rx.borrow_and_update();
                if raised {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        }
    }
}

impl Default for Flag {
    fn default() -> Self {
        Self::new()
    }
}
