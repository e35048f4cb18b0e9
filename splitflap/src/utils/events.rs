//! Defines the event manager used to dispatch device messages to handlers.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use log::{error, warn};
use parking_lot::Mutex;

use crate::utils::task::TaskResult;

type SyncedCallbackMap = Mutex<HashMap<String, Vec<CallbackWrapper>>>;
pub type EventHandler = usize;

#[derive(Clone, Default)]
pub struct EventManager {
    callbacks: Arc<SyncedCallbackMap>,
    next_id: Arc<AtomicUsize>,
}

struct CallbackWrapper {
    id: EventHandler,
    callback: Box<dyn FnMut(Arc<dyn Any + Send + Sync>) -> BoxFuture<'static, ()> + Send>,
}

impl std::fmt::Debug for EventManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let lock = self.callbacks.lock();
        let mut events: Vec<(&String, usize)> = lock.iter().map(|(k, v)| (k, v.len())).collect();
        events.sort();
        f.debug_struct("EventManager").field("events", &events).finish()
    }
}

impl EventManager {
    /// Register event handler for a specific event name.
    ///
    /// # Parameters
    /// * `event` - The event name (any type that matches an Into<String>)
    /// * `callback` - An async moved callback that accepts a single parameter as an argument.
    ///                The argument can be anything that might be both `Send + Sync`.
    ///                The callback may resolve to `()` or to `Result<(), Error>`: errors are logged.
    ///
    /// # Return
    /// Returns an EventHandler that can be used by the `unregister()` method.
    ///
    /// # Errors
    /// If the event handler does not match the expected emitted event exactly it will not be
    /// called: a warning is logged instead.
    ///
    /// # Example
    ///
    /// ```
    /// use splitflap::utils::EventManager;
    ///
    /// # #[tokio::main]
    /// # async fn main() {
    /// let events: EventManager = Default::default();
    ///
    /// events.on("log", |message: String| async move {
    ///     println!("Device says: {}", message);
    /// });
    ///
    /// events.emit("log", String::from("hello")).await;
    /// # }
    /// ```
    pub fn on<S, F, T, Fut>(&self, event: S, mut callback: F) -> EventHandler
    where
        S: Into<String>,
        T: 'static + Send + Sync + Clone,
        F: FnMut(T) -> Fut + Send + 'static,
        Fut: std::future::Future + Send + 'static,
        Fut::Output: Into<TaskResult>,
    {
        let event_name = event.into();
        let callback_event = event_name.clone();
        // Generate a unique ID.
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        // Boxes the callback and downcast its parameter.
        let boxed_callback = Box::new(move |arg: Arc<dyn Any + Send + Sync>| {
            match arg.downcast::<T>() {
                Ok(arg) => {
                    let event = callback_event.clone();
                    let future = (callback)((*arg).clone());
                    async move {
                        let result: TaskResult = future.await.into();
                        if let TaskResult::Err(err) = result {
                            error!("Handler for event '{}' failed: {}", event, err);
                        }
                    }
                    .boxed()
                }
                Err(_) => {
                    warn!(
                        "The callback for event '{}' could not be called because parameter does not match",
                        callback_event
                    );
                    Box::pin(async {})
                }
            }
        });

        let wrapper = CallbackWrapper {
            id,
            callback: boxed_callback,
        };

        self.callbacks
            .lock()
            .entry(event_name)
            .or_default()
            .push(wrapper);

        id
    }

    /// Invoke all event handlers registered for a specific event name, in registration order.
    /// Only the callback registered by the `on()` method and whose payload matches the declared
    /// callback type will be called. All others will be skipped.
    ///
    /// # Parameters
    /// * `event`:  The event name (any type that matches an `Into<String>`)
    /// * `payload`: The event payload (must be `'static + Send + Sync`)
    pub async fn emit<S, T>(&self, event: S, payload: T)
    where
        S: Into<String>,
        T: 'static + Send + Sync,
    {
        let payload_any: Arc<dyn Any + Send + Sync> = Arc::new(payload);
        // The lock is released before any handler runs: handlers may register other handlers.
        let futures: Vec<BoxFuture<'static, ()>> = match self.callbacks.lock().get_mut(&event.into()) {
            Some(callbacks) => callbacks
                .iter_mut()
                .map(|wrapper| (wrapper.callback)(payload_any.clone()))
                .collect(),
            None => vec![],
        };
        for future in futures {
            future.await;
        }
    }

    /// Unregister a given handler if found.
    pub fn unregister(&self, handler: EventHandler) {
        self.callbacks
            .lock()
            .values_mut()
            .for_each(|v| v.retain(|cb| cb.id != handler));
    }

    /// Number of handlers registered for `event`.
    pub fn count<S: Into<String>>(&self, event: S) -> usize {
        self.callbacks
            .lock()
            .get(&event.into())
            .map_or(0, |callbacks| callbacks.len())
    }
}
