//! Race controller - one async operation at a time, with supersession and
//! manual cancellation.
//!
//! Every [`Request::run`] takes a new generation number. When the operation
//! settles, its result is applied only if no newer `run` or
//! [`Request::cancel`] happened in the meantime. A superseded call never
//! settles: its future stays pending forever and none of the callbacks fire.
//! Cancellation does not abort the underlying operation; its result is simply
//! discarded.

use crate::cache::QueryError;
use crate::error::{Error, Result};
use crate::signal::{Signal, SignalSubscription};
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::runtime::Handle;

type Service<P, R, E> =
    Arc<dyn Fn(P) -> BoxFuture<'static, std::result::Result<R, E>> + Send + Sync>;
type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;
type FinallyCallback = Arc<dyn Fn() + Send + Sync>;

/// Settings for a [`Request`].
///
/// Defaults: manual mode, always ready, no initial data, `P::default()` as
/// default params, errors logged at `error` level.
pub struct RequestOptions<P, R, E> {
    manual: bool,
    ready: Option<Signal<bool>>,
    initial_data: Option<R>,
    default_params: P,
    on_error: Option<Callback<E>>,
    on_success: Option<Callback<R>>,
    on_finally: Option<FinallyCallback>,
}

impl<P: Default, R, E> Default for RequestOptions<P, R, E> {
    fn default() -> Self {
        RequestOptions {
            manual: true,
            ready: None,
            initial_data: None,
            default_params: P::default(),
            on_error: None,
            on_success: None,
            on_finally: None,
        }
    }
}

impl<P: Default, R, E> RequestOptions<P, R, E> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<P, R, E> RequestOptions<P, R, E> {
    /// In manual mode only explicit [`Request::run`] calls execute. Otherwise
    /// the request runs with its default params whenever `ready` turns true.
    pub fn manual(mut self, manual: bool) -> Self {
        self.manual = manual;
        self
    }

    /// Gate automatic runs on a readiness signal.
    pub fn with_ready(mut self, ready: Signal<bool>) -> Self {
        self.ready = Some(ready);
        self
    }

    /// Data exposed before the first successful run.
    pub fn with_initial_data(mut self, data: R) -> Self {
        self.initial_data = Some(data);
        self
    }

    /// Params used by automatic runs.
    pub fn with_default_params(mut self, params: P) -> Self {
        self.default_params = params;
        self
    }

    pub fn on_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(callback));
        self
    }

    pub fn on_success<F>(mut self, callback: F) -> Self
    where
        F: Fn(&R) + Send + Sync + 'static,
    {
        self.on_success = Some(Arc::new(callback));
        self
    }

    /// Called after `on_success` or `on_error` of every run that is not
    /// superseded.
    pub fn on_finally<F>(mut self, callback: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_finally = Some(Arc::new(callback));
        self
    }
}

struct RequestState<R, E> {
    generation: u64,
    disposed: bool,
    loading: bool,
    data: Option<R>,
    error: Option<E>,
}

struct RequestInner<P, R, E> {
    service: Service<P, R, E>,
    state: Mutex<RequestState<R, E>>,
    default_params: Mutex<P>,
    on_error: Option<Callback<E>>,
    on_success: Option<Callback<R>>,
    on_finally: Option<FinallyCallback>,
    runtime: Option<Handle>,
    ready_watch: Mutex<Option<SignalSubscription>>,
}

/// Single-flight async operation with race-safe results.
///
/// # Example
///
/// ```ignore
/// use swr_kit::{Request, RequestOptions};
///
/// let search = Request::new(
///     |query: String| async move { api::search(&query).await },
///     RequestOptions::new(),
/// )?;
///
/// let first = search.run("ru".to_string());
/// let second = search.run("rust".to_string());
/// // `first` never settles; only `second` reports its result.
/// let hits = second.await?;
/// ```
pub struct Request<P, R, E>
where
    P: Clone + Send + 'static,
    R: Clone + Send + Sync + 'static,
    E: QueryError,
{
    inner: Arc<RequestInner<P, R, E>>,
}

impl<P, R, E> Request<P, R, E>
where
    P: Clone + Send + 'static,
    R: Clone + Send + Sync + 'static,
    E: QueryError,
{
    /// Wrap `service`.
    ///
    /// When not in manual mode, an automatic run starts immediately if the
    /// ready signal is already true, and again each time it turns true.
    ///
    /// # Errors
    /// Returns `Error::RuntimeUnavailable` if automatic runs are enabled
    /// outside a tokio runtime.
    pub fn new<F, Fut>(service: F, options: RequestOptions<P, R, E>) -> Result<Self>
    where
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, E>> + Send + 'static,
    {
        let runtime = if options.manual {
            Handle::try_current().ok()
        } else {
            Some(Handle::try_current().map_err(Error::runtime)?)
        };

        let service: Service<P, R, E> = Arc::new(move |params| service(params).boxed());
        let inner = Arc::new(RequestInner {
            service,
            state: Mutex::new(RequestState {
                generation: 0,
                disposed: false,
                loading: false,
                data: options.initial_data,
                error: None,
            }),
            default_params: Mutex::new(options.default_params),
            on_error: options.on_error,
            on_success: options.on_success,
            on_finally: options.on_finally,
            runtime,
            ready_watch: Mutex::new(None),
        });

        if !options.manual {
            let ready = options.ready.unwrap_or_else(|| Signal::new(true));
            let weak = Arc::downgrade(&inner);
            let watch = ready.observe(move |is_ready, _| {
                if *is_ready {
                    if let Some(inner) = weak.upgrade() {
                        inner.auto_run();
                    }
                }
            });
            *inner.ready_watch.lock() = Some(watch);
        }

        Ok(Request { inner })
    }

    /// Start the operation with `params`, superseding any run in flight.
    ///
    /// The service is called and the generation advances before this
    /// returns, so a `cancel()` issued right after applies to this run even
    /// if the returned future has not been polled yet.
    ///
    /// The future resolves to the service's result, or never resolves if the
    /// run is superseded or the request disposed before it settles.
    pub fn run(&self, params: P) -> impl Future<Output = std::result::Result<R, E>> + Send + 'static {
        RequestInner::run(&self.inner, params)
    }

    /// Discard the result of any run in flight.
    pub fn cancel(&self) {
        let mut state = self.inner.state.lock();
        state.generation += 1;
        state.loading = false;
        debug!("Request cancelled (generation {})", state.generation);
    }

    pub fn loading(&self) -> bool {
        self.inner.state.lock().loading
    }

    pub fn data(&self) -> Option<R> {
        self.inner.state.lock().data.clone()
    }

    pub fn error(&self) -> Option<E> {
        self.inner.state.lock().error.clone()
    }

    /// Params the next automatic run will use.
    pub fn default_params(&self) -> P {
        self.inner.default_params.lock().clone()
    }

    pub fn set_default_params(&self, params: P) {
        *self.inner.default_params.lock() = params;
    }

    /// Stop auto-running and discard results of runs still in flight.
    ///
    /// Idempotent; also runs on drop.
    pub fn dispose(&self) {
        self.inner.dispose();
    }
}

impl<P, R, E> Drop for Request<P, R, E>
where
    P: Clone + Send + 'static,
    R: Clone + Send + Sync + 'static,
    E: QueryError,
{
    fn drop(&mut self) {
        self.inner.dispose();
    }
}

impl<P, R, E> fmt::Debug for Request<P, R, E>
where
    P: Clone + Send + 'static,
    R: Clone + Send + Sync + 'static,
    E: QueryError,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Request")
            .field("generation", &state.generation)
            .field("loading", &state.loading)
            .field("has_data", &state.data.is_some())
            .field("error", &state.error)
            .field("disposed", &state.disposed)
            .finish()
    }
}

impl<P, R, E> RequestInner<P, R, E>
where
    P: Clone + Send + 'static,
    R: Clone + Send + Sync + 'static,
    E: QueryError,
{
    fn run(
        this: &Arc<Self>,
        params: P,
    ) -> impl Future<Output = std::result::Result<R, E>> + Send + 'static {
        let execution = Self::execute(this, params);
        async move {
            match execution.await {
                Some(outcome) => outcome,
                None => futures::future::pending().await,
            }
        }
    }

    /// Advance the generation and call the service now; the returned future
    /// settles the outcome and yields `None` if it was discarded.
    fn execute(
        this: &Arc<Self>,
        params: P,
    ) -> impl Future<Output = Option<std::result::Result<R, E>>> + Send + 'static {
        let generation = {
            let mut state = this.state.lock();
            state.generation += 1;
            state.loading = true;
            state.generation
        };
        let call = (this.service)(params);
        let inner = Arc::clone(this);

        async move {
            let outcome = call.await;
            inner.settle(generation, outcome)
        }
    }

    /// Apply `outcome` unless `generation` was superseded. Returns `None` for
    /// a discarded result.
    fn settle(
        &self,
        generation: u64,
        outcome: std::result::Result<R, E>,
    ) -> Option<std::result::Result<R, E>> {
        {
            let mut state = self.state.lock();
            if state.disposed || state.generation != generation {
                debug!(
                    "Discarding result of generation {} (current {}, disposed: {})",
                    generation, state.generation, state.disposed
                );
                return None;
            }

            match &outcome {
                Ok(data) => {
                    state.data = Some(data.clone());
                    state.error = None;
                }
                Err(err) => state.error = Some(err.clone()),
            }
            state.loading = false;
        }

        match &outcome {
            Ok(data) => {
                if let Some(on_success) = &self.on_success {
                    on_success(data);
                }
            }
            Err(err) => match &self.on_error {
                Some(on_error) => on_error(err),
                None => error!("Request failed: {:?}", err),
            },
        }
        if let Some(on_finally) = &self.on_finally {
            on_finally();
        }

        Some(outcome)
    }

    /// Run with the default params in the background; failures are dropped.
    /// The task ends once the service settles, even if the result is
    /// discarded.
    fn auto_run(self: &Arc<Self>) {
        let Some(runtime) = &self.runtime else {
            warn!("Automatic request run skipped: no runtime");
            return;
        };
        if self.state.lock().disposed {
            return;
        }

        let params = self.default_params.lock().clone();
        debug!("Ready, running request with default params");
        let execution = Self::execute(self, params);
        runtime.spawn(async move {
            let _ = execution.await;
        });
    }

    fn dispose(&self) {
        {
            let mut state = self.state.lock();
            if state.disposed {
                return;
            }
            state.disposed = true;
        }
        let watch = self.ready_watch.lock().take();
        drop(watch);
    }
}
