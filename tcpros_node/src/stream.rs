//! The lazy message stream abstraction.
//!
//! A [`MessageStream`] is the one programming surface user code sees: a
//! single-consumer, non-restartable sequence of decoded messages. Both
//! subscriber input buffers and publisher output streams are expressed in
//! terms of it, so the registry and the transports never need to know
//! whether a stream is channel-backed or produced directly by a closure.

use futures::stream::{self, Stream, StreamExt};
use std::pin::Pin;
use tokio::sync::mpsc;

/// A boxed, pinned, single-pass stream of messages.
///
/// Nothing about this type permits forking a second reader: it is not
/// `Clone`, and the only way to observe a value is to advance past it with
/// [`StreamExt::next`]. That is the whole of the "lazy, non-restartable,
/// single-consumer" contract.
pub type MessageStream<T> = Pin<Box<dyn Stream<Item = T> + Send>>;

/// A value that is produced by invoking a side effect, rather than one
/// that already exists. Lifting a `MessageStream<Deferred<T>>` with
/// [`force_deferred`] defers that side effect until the item is actually
/// pulled by a consumer.
pub type Deferred<T> = Box<dyn FnOnce() -> T + Send>;

/// Builds a [`MessageStream`] backed by a bounded channel.
///
/// This is the form used by every bounded buffer in the system: a
/// subscription's input buffer and a publication's per-client output
/// buffer are both, at bottom, an `mpsc::Receiver` wrapped this way.
/// Pulling the head waits for the next enqueued item; the stream ends
/// once every corresponding sender has dropped.
pub fn stream_from_receiver<T: Send + 'static>(rx: mpsc::Receiver<T>) -> MessageStream<T> {
    Box::pin(stream::unfold(rx, |mut rx| async move {
        let item = rx.recv().await?;
        Some((item, rx))
    }))
}

/// Builds a [`MessageStream`] directly from a producer function, e.g. a
/// periodic generator. `f` returns `None` to end the stream.
pub fn stream_from_fn<T, F, Fut>(f: F) -> MessageStream<T>
where
    T: Send + 'static,
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = Option<T>> + Send,
{
    Box::pin(stream::unfold(f, |mut f| async move {
        let item = f().await?;
        Some((item, f))
    }))
}

/// Lifts a stream of [`Deferred`] values into a stream of their results,
/// forcing each side effect on demand as the consumer pulls it rather than
/// eagerly when this function is called.
pub fn force_deferred<T: Send + 'static>(stream: MessageStream<Deferred<T>>) -> MessageStream<T> {
    Box::pin(stream.map(|deferred| deferred()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn receiver_backed_stream_ends_when_sender_drops() {
        let (tx, rx) = mpsc::channel::<i32>(4);
        let mut stream = stream_from_receiver(rx);
        tx.send(1).await.unwrap();
        tx.send(2).await.unwrap();
        drop(tx);

        assert_eq!(stream.next().await, Some(1));
        assert_eq!(stream.next().await, Some(2));
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn stream_from_fn_ends_on_none() {
        let mut n = 0;
        let mut stream = stream_from_fn(move || {
            n += 1;
            let val = n;
            async move { if val <= 3 { Some(val) } else { None } }
        });

        assert_eq!(stream.next().await, Some(1));
        assert_eq!(stream.next().await, Some(2));
        assert_eq!(stream.next().await, Some(3));
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn force_deferred_invokes_closures_lazily_and_in_order() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let invoked = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel::<Deferred<usize>>(4);

        for i in 0..3 {
            let invoked = invoked.clone();
            tx.send(Box::new(move || {
                invoked.fetch_add(1, Ordering::SeqCst);
                i
            }))
            .await
            .unwrap();
        }
        drop(tx);

        let mut forced = force_deferred(stream_from_receiver(rx));
        // Constructing and wrapping the stream must not have run anything yet.
        assert_eq!(invoked.load(Ordering::SeqCst), 0);

        assert_eq!(forced.next().await, Some(0));
        assert_eq!(invoked.load(Ordering::SeqCst), 1);
        assert_eq!(forced.next().await, Some(1));
        assert_eq!(forced.next().await, Some(2));
        assert_eq!(invoked.load(Ordering::SeqCst), 3);
        assert_eq!(forced.next().await, None);
    }
}
