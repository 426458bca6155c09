//! Broadcast the result of a single future to any number of listeners.
//!
//! This is the primitive behind cache insertion cookies: the first caller
//! becomes the producer, everyone else subscribes to the same pending
//! result.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use anyhow::{format_err, Error};
use futures::future::{FutureExt, TryFutureExt};
use tokio::sync::oneshot;

/// Result fan-out state: either still collecting listeners or already
/// resolved.
pub struct BroadcastData<T> {
    result: Option<Result<T, String>>,
    listeners: Vec<oneshot::Sender<Result<T, Error>>>,
}

impl<T: Clone> Default for BroadcastData<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> BroadcastData<T> {
    pub fn new() -> Self {
        Self {
            result: None,
            listeners: vec![],
        }
    }

    pub fn notify_listeners(&mut self, result: Result<T, String>) {
        self.result = Some(result.clone());

        while let Some(ch) = self.listeners.pop() {
            let _ = match &result {
                Ok(value) => ch.send(Ok(value.clone())),
                Err(err) => ch.send(Err(format_err!("{}", err))),
            };
        }
    }

    pub fn listen(&mut self) -> impl Future<Output = Result<T, Error>> {
        use futures::future::{ok, Either};

        match &self.result {
            None => {}
            Some(Ok(result)) => return Either::Left(ok(result.clone())),
            Some(Err(err)) => return Either::Left(futures::future::err(format_err!("{}", err))),
        }

        let (tx, rx) = oneshot::channel::<Result<T, Error>>();
        self.listeners.push(tx);

        Either::Right(rx.map(|res| match res {
            Ok(Ok(t)) => Ok(t),
            Ok(Err(e)) => Err(e),
            Err(e) => Err(Error::from(e)),
        }))
    }
}

type SourceFuture<T> = Pin<Box<dyn Future<Output = Result<T, Error>> + Send>>;

struct BroadcastFutureBinding<T> {
    broadcast: BroadcastData<T>,
    future: Option<SourceFuture<T>>,
}

/// Broadcast future results to registered listeners. The source future is
/// spawned lazily on the first `listen` call.
pub struct BroadcastFuture<T> {
    inner: Arc<Mutex<BroadcastFutureBinding<T>>>,
}

impl<T> Clone for BroadcastFuture<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + 'static> BroadcastFuture<T> {
    pub fn new(source: SourceFuture<T>) -> Self {
        let inner = BroadcastFutureBinding {
            broadcast: BroadcastData::new(),
            future: Some(source),
        };
        Self {
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    /// Creates a new instance resolved through a oneshot channel instead of
    /// a spawned future.
    pub fn new_oneshot() -> (Self, oneshot::Sender<Result<T, Error>>) {
        let (tx, rx) = oneshot::channel::<Result<T, Error>>();
        let rx = rx.map_err(Error::from).and_then(futures::future::ready);
        (Self::new(Box::pin(rx)), tx)
    }

    fn notify_listeners(
        inner: &Arc<Mutex<BroadcastFutureBinding<T>>>,
        result: Result<T, String>,
    ) {
        let mut data = inner.lock().unwrap();
        data.broadcast.notify_listeners(result);
    }

    fn spawn(inner: Arc<Mutex<BroadcastFutureBinding<T>>>) -> impl Future<Output = Result<T, Error>> {
        let mut data = inner.lock().unwrap();

        if let Some(source) = data.future.take() {
            let inner = Arc::clone(&inner);
            let task = source.map(move |value| match value {
                Ok(value) => Self::notify_listeners(&inner, Ok(value)),
                Err(err) => Self::notify_listeners(&inner, Err(err.to_string())),
            });
            tokio::spawn(task);
        }

        data.broadcast.listen()
    }

    /// Register a listener.
    pub fn listen(&self) -> impl Future<Output = Result<T, Error>> {
        let inner = Arc::clone(&self.inner);
        async move { Self::spawn(inner).await }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_broadcast_future() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        static CHECKSUM: AtomicUsize = AtomicUsize::new(0);

        let (sender, trigger) = BroadcastFuture::<usize>::new_oneshot();

        let receiver1 = sender
            .listen()
            .map_ok(|res| {
                CHECKSUM.fetch_add(res, Ordering::SeqCst);
            })
            .map(|_| ());

        let receiver2 = sender
            .listen()
            .map_ok(|res| {
                CHECKSUM.fetch_add(res * 2, Ordering::SeqCst);
            })
            .map(|_| ());

        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async move {
            let r1 = tokio::spawn(receiver1);
            let r2 = tokio::spawn(receiver2);

            trigger.send(Ok(1)).unwrap();
            let _ = r1.await;
            let _ = r2.await;
        });

        assert_eq!(CHECKSUM.load(Ordering::SeqCst), 3);

        // the result stays available until the BroadcastFuture is dropped
        rt.block_on(
            sender
                .listen()
                .map_ok(|res| {
                    CHECKSUM.fetch_add(res * 4, Ordering::SeqCst);
                })
                .map(|_| ()),
        );

        assert_eq!(CHECKSUM.load(Ordering::SeqCst), 7);
    }
}
