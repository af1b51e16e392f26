// Onion-style pipeline: middleware wrap each other around a destination

use crate::middleware::Middleware;
use crate::route::HandlerFn;
use crate::{Error, Request, Response};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, trace};

/// Composes middleware around a destination. Stage 0 wraps stage 1, which
/// wraps stage 2, and so on down to the destination; a stage that never calls
/// `next` short-circuits everything inside it.
#[derive(Clone, Default)]
pub struct Pipeline {
    stages: Arc<Vec<Arc<dyn Middleware>>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the stages the request will pass through, outermost first.
    pub fn through(mut self, stages: Vec<Arc<dyn Middleware>>) -> Self {
        self.stages = Arc::new(stages);
        self
    }

    /// Append a single stage.
    pub fn pipe(mut self, stage: Arc<dyn Middleware>) -> Self {
        let mut stages = (*self.stages).clone();
        stages.push(stage);
        self.stages = Arc::new(stages);
        self
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Send the request through every stage and into the destination.
    pub async fn run(&self, request: Request, destination: HandlerFn) -> Result<Response, Error> {
        debug!(
            stages = self.stages.len(),
            path = %request.path,
            method = %request.method,
            "running pipeline"
        );
        self.execute_from(0, request, destination).await
    }

    fn execute_from(
        &self,
        index: usize,
        request: Request,
        destination: HandlerFn,
    ) -> Pin<Box<dyn Future<Output = Result<Response, Error>> + Send>> {
        if index >= self.stages.len() {
            trace!("pipeline complete, calling destination");
            destination(request)
        } else {
            let stage = self.stages[index].clone();
            let pipeline = self.clone();
            let destination = destination.clone();

            trace!(stage = index, "executing pipeline stage");
            Box::pin(async move {
                stage
                    .handle(
                        request,
                        Box::new(move |request| {
                            pipeline.execute_from(index + 1, request, destination)
                        }),
                    )
                    .await
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Method;
    use crate::middleware::Next;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    struct Recorder {
        tag: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Middleware for Recorder {
        async fn handle(&self, request: Request, next: Next) -> Result<Response, Error> {
            self.log.lock().push(format!("{}-before", self.tag));
            let response = next(request).await;
            self.log.lock().push(format!("{}-after", self.tag));
            response
        }
    }

    struct ShortCircuit;

    #[async_trait]
    impl Middleware for ShortCircuit {
        async fn handle(&self, _request: Request, _next: Next) -> Result<Response, Error> {
            Ok(Response::new(403).with_body(b"stopped".to_vec()))
        }
    }

    fn destination(log: &Arc<Mutex<Vec<String>>>) -> HandlerFn {
        let log = log.clone();
        Arc::new(move |_request| {
            let log = log.clone();
            Box::pin(async move {
                log.lock().push("destination".to_string());
                Ok(Response::ok())
            })
        })
    }

    #[tokio::test]
    async fn stages_wrap_in_onion_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::new().through(vec![
            Arc::new(Recorder { tag: "outer", log: log.clone() }),
            Arc::new(Recorder { tag: "inner", log: log.clone() }),
        ]);

        let request = Request::new(Method::Get, "/");
        pipeline.run(request, destination(&log)).await.unwrap();

        assert_eq!(
            *log.lock(),
            vec!["outer-before", "inner-before", "destination", "inner-after", "outer-after"]
        );
    }

    #[tokio::test]
    async fn short_circuit_skips_inner_stages_and_the_destination() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::new()
            .pipe(Arc::new(Recorder { tag: "outer", log: log.clone() }))
            .pipe(Arc::new(ShortCircuit))
            .pipe(Arc::new(Recorder { tag: "unreached", log: log.clone() }));

        let request = Request::new(Method::Get, "/");
        let response = pipeline.run(request, destination(&log)).await.unwrap();

        assert_eq!(response.status, 403);
        assert_eq!(*log.lock(), vec!["outer-before", "outer-after"]);
    }

    #[tokio::test]
    async fn empty_pipeline_calls_the_destination_directly() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::new();
        assert!(pipeline.is_empty());

        let request = Request::new(Method::Get, "/");
        let response = pipeline.run(request, destination(&log)).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(*log.lock(), vec!["destination"]);
    }
}
