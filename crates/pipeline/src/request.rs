//! Request pipeline: a terminal handler wrapped by ordered behaviors.
//!
//! ```text
//! send -> behavior[0] -> behavior[1] -> ... -> pre-processors -> handler -> post-processors
//! ```
//!
//! The first registered behavior is the outermost one. Each behavior receives a
//! [`Next`] that runs the remainder of the chain; `Next` is `Copy`, so a behavior
//! may run the remainder more than once (retries).

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{BoxError, PipelineError, Result};

/// A unit of work (command or query) dispatched through a pipeline.
pub trait Request: Send + Sync + 'static {
    /// The value produced by the terminal handler.
    type Response: Send + 'static;

    /// Name used in logs and metrics.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// The terminal handler of a request pipeline.
#[async_trait]
pub trait RequestHandler<R: Request>: Send + Sync {
    async fn handle(&self, request: &R, cancel: &CancellationToken) -> Result<R::Response>;
}

/// A decorator around the remainder of a request pipeline.
#[async_trait]
pub trait PipelineBehavior<R: Request>: Send + Sync {
    async fn handle(
        &self,
        request: R,
        next: Next<'_, R>,
        cancel: &CancellationToken,
    ) -> Result<R::Response>;
}

/// Runs immediately before the handler. It can only stop the request by failing.
#[async_trait]
pub trait RequestPreProcessor<R: Request>: Send + Sync {
    async fn process(
        &self,
        request: &R,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), BoxError>;
}

/// Observes a request together with the response of a successful handler.
#[async_trait]
pub trait RequestPostProcessor<R: Request>: Send + Sync {
    async fn process(
        &self,
        request: &R,
        response: &R::Response,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), BoxError>;
}

struct Core<R: Request> {
    handler: Arc<dyn RequestHandler<R>>,
    pre_processors: Vec<Arc<dyn RequestPreProcessor<R>>>,
    post_processors: Vec<Arc<dyn RequestPostProcessor<R>>>,
}

impl<R: Request> Core<R> {
    async fn invoke(&self, request: R, cancel: &CancellationToken) -> Result<R::Response> {
        for pre in &self.pre_processors {
            pre.process(&request, cancel)
                .await
                .map_err(PipelineError::PreProcessor)?;
        }

        let response = self.handler.handle(&request, cancel).await?;

        for post in &self.post_processors {
            post.process(&request, &response, cancel)
                .await
                .map_err(PipelineError::PostProcessor)?;
        }

        Ok(response)
    }
}

/// The remainder of a request pipeline, as seen from one behavior.
pub struct Next<'a, R: Request> {
    behaviors: &'a [Arc<dyn PipelineBehavior<R>>],
    core: &'a Core<R>,
}

impl<R: Request> Clone for Next<'_, R> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<R: Request> Copy for Next<'_, R> {}

impl<'a, R: Request> Next<'a, R> {
    /// Runs the remaining behaviors and the handler.
    pub async fn run(self, request: R, cancel: &CancellationToken) -> Result<R::Response> {
        match self.behaviors.split_first() {
            Some((behavior, rest)) => {
                let next = Next {
                    behaviors: rest,
                    core: self.core,
                };
                behavior.handle(request, next, cancel).await
            }
            None => self.core.invoke(request, cancel).await,
        }
    }
}

/// A request type's handler together with its behaviors and processors.
pub struct Pipeline<R: Request> {
    behaviors: Vec<Arc<dyn PipelineBehavior<R>>>,
    core: Core<R>,
}

impl<R: Request> Pipeline<R> {
    /// Starts building a pipeline around a terminal handler.
    pub fn builder<H>(handler: H) -> PipelineBuilder<R>
    where
        H: RequestHandler<R> + 'static,
    {
        PipelineBuilder {
            handler: Arc::new(handler),
            behaviors: Vec::new(),
            pre_processors: Vec::new(),
            post_processors: Vec::new(),
        }
    }

    /// Dispatches a request through every behavior to the handler.
    pub async fn send(&self, request: R, cancel: &CancellationToken) -> Result<R::Response> {
        let name = request.name();
        let start = Instant::now();

        let next = Next {
            behaviors: &self.behaviors,
            core: &self.core,
        };
        let result = next.run(request, cancel).await;

        let outcome = if result.is_ok() { "success" } else { "error" };
        metrics::counter!("pipeline_requests_total", "request" => name, "outcome" => outcome)
            .increment(1);
        metrics::histogram!("pipeline_request_duration_seconds", "request" => name)
            .record(start.elapsed().as_secs_f64());

        result
    }

    /// Returns the number of registered behaviors.
    pub fn behavior_count(&self) -> usize {
        self.behaviors.len()
    }
}

/// Builder for [`Pipeline`].
pub struct PipelineBuilder<R: Request> {
    handler: Arc<dyn RequestHandler<R>>,
    behaviors: Vec<Arc<dyn PipelineBehavior<R>>>,
    pre_processors: Vec<Arc<dyn RequestPreProcessor<R>>>,
    post_processors: Vec<Arc<dyn RequestPostProcessor<R>>>,
}

impl<R: Request> PipelineBuilder<R> {
    /// Adds a behavior inside every behavior registered before it.
    pub fn behavior<B>(mut self, behavior: B) -> Self
    where
        B: PipelineBehavior<R> + 'static,
    {
        self.behaviors.push(Arc::new(behavior));
        self
    }

    /// Adds an already shared behavior.
    pub fn shared_behavior(mut self, behavior: Arc<dyn PipelineBehavior<R>>) -> Self {
        self.behaviors.push(behavior);
        self
    }

    pub fn pre_processor<P>(mut self, processor: P) -> Self
    where
        P: RequestPreProcessor<R> + 'static,
    {
        self.pre_processors.push(Arc::new(processor));
        self
    }

    pub fn post_processor<P>(mut self, processor: P) -> Self
    where
        P: RequestPostProcessor<R> + 'static,
    {
        self.post_processors.push(Arc::new(processor));
        self
    }

    pub fn build(self) -> Pipeline<R> {
        Pipeline {
            behaviors: self.behaviors,
            core: Core {
                handler: self.handler,
                pre_processors: self.pre_processors,
                post_processors: self.post_processors,
            },
        }
    }
}
