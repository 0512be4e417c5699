//! Completion Listener
//!
//! A resolve-once completion cell. Resolving it a second time is a broken
//! exactly-once guarantee and panics.

use std::sync::Mutex;

use tokio::sync::oneshot;

use crate::error::Result;

type Callback<T> = Box<dyn FnOnce(Result<T>) + Send>;

/// Single-resolution completion callback
pub struct ActionListener<T> {
    callback: Mutex<Option<Callback<T>>>,
}

impl<T: Send + 'static> ActionListener<T> {
    /// Wrap a callback
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce(Result<T>) + Send + 'static,
    {
        Self {
            callback: Mutex::new(Some(Box::new(f))),
        }
    }

    /// Listener that forwards the outcome into a oneshot channel
    pub fn channel() -> (Self, oneshot::Receiver<Result<T>>) {
        let (tx, rx) = oneshot::channel();
        let listener = Self::new(move |result| {
            // The receiver may have given up waiting
            let _ = tx.send(result);
        });
        (listener, rx)
    }

    /// Complete with a response.
    ///
    /// # Panics
    ///
    /// Panics if the listener was already resolved.
    pub fn on_response(&self, value: T) {
        self.resolve(Ok(value));
    }

    /// Complete with an error. Panics if the listener was already resolved.
    pub fn on_failure(&self, error: crate::Error) {
        self.resolve(Err(error));
    }

    /// Whether the listener has been resolved
    pub fn is_done(&self) -> bool {
        self.callback
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_none()
    }

    fn resolve(&self, result: Result<T>) {
        let callback = self
            .callback
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        match callback {
            Some(callback) => callback(result),
            None => panic!(
                "listener resolved twice, second outcome: {}",
                match &result {
                    Ok(_) => "response".to_string(),
                    Err(e) => e.to_string(),
                }
            ),
        }
    }
}

impl<T> std::fmt::Debug for ActionListener<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let done = self
            .callback
            .lock()
            .map(|c| c.is_none())
            .unwrap_or(true);
        f.debug_struct("ActionListener").field("done", &done).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[tokio::test]
    async fn test_channel_listener() {
        let (listener, rx) = ActionListener::<u32>::channel();
        assert!(!listener.is_done());
        listener.on_response(7);
        assert!(listener.is_done());
        assert_eq!(rx.await.unwrap().unwrap(), 7);
    }

    #[tokio::test]
    async fn test_failure_is_forwarded() {
        let (listener, rx) = ActionListener::<u32>::channel();
        listener.on_failure(Error::Internal("boom".into()));
        assert!(matches!(rx.await.unwrap(), Err(Error::Internal(_))));
    }

    #[test]
    #[should_panic(expected = "listener resolved twice")]
    fn test_double_resolution_panics() {
        let listener = ActionListener::<u32>::new(|_| {});
        listener.on_response(1);
        listener.on_response(2);
    }
}
