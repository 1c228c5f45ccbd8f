//! The request handler a server drives.
//!
//! For each request the app builds a [`Context`], runs the pipeline on its
//! own task and hands the response head back as soon as it exists. The head
//! arrives either when the pipeline settles or earlier, when middleware
//! calls [`Context::flush_headers`]; in that case the body keeps streaming
//! while the pipeline is still running.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http::StatusCode;
use tokio::sync::oneshot;

use crate::body::ResponseBody;
use crate::compose::Pipeline;
use crate::config::Config;
use crate::context::{Context, Env};
use crate::cookies::Keygrip;
use crate::diagnostics::Verbose;
use crate::error::{BoxError, Result};

/// A pipeline plus the state every request shares. Cloning is cheap.
#[derive(Clone)]
pub struct App {
    pipeline: Pipeline,
    env: Arc<Env>,
}

impl App {
    /// Fails when `config.keys` contains an empty key.
    pub fn new(pipeline: Pipeline, config: &Config, verbose: Verbose) -> Result<Self> {
        let keys = if config.keys.is_empty() {
            None
        } else {
            Some(Arc::new(Keygrip::new(&config.keys)?))
        };
        let env = Env { verbose, keys, proxy: config.proxy };
        Ok(Self { pipeline, env: Arc::new(env) })
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn verbose(&self) -> &Verbose {
        &self.env.verbose
    }

    /// Runs one request through the pipeline.
    ///
    /// Never fails: pipeline errors become error responses, and a pipeline
    /// task that dies without producing a head yields a bare 500.
    pub async fn handle<B>(
        &self,
        req: http::Request<B>,
        peer: Option<SocketAddr>,
        tls: bool,
    ) -> http::Response<ResponseBody>
    where
        B: http_body::Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let (head_tx, head_rx) = oneshot::channel();
        let mut ctx = Context::new(req);
        ctx.attach(Arc::clone(&self.env), peer, tls, head_tx);

        let pipeline = self.pipeline.clone();
        tokio::spawn(async move {
            if let Err(err) = pipeline.run(&mut ctx).await {
                ctx.on_error(err);
            }
            ctx.respond().await;
        });

        match head_rx.await {
            Ok(res) => res,
            Err(_) => {
                tracing::error!("request task ended without a response");
                let mut res = http::Response::new(ResponseBody::full("Internal Server Error"));
                *res.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                res
            }
        }
    }
}

impl fmt::Debug for App {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("App")
            .field("pipeline", &self.pipeline)
            .field("signed_cookies", &self.env.keys.is_some())
            .field("proxy", &self.env.proxy)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use http_body_util::{BodyExt, Empty, Full};

    use super::*;
    use crate::error::HttpError;
    use crate::handler::from_fn;

    fn app(pipeline: Pipeline) -> App {
        App::new(pipeline, &Config::default(), Verbose::new()).unwrap()
    }

    fn get(path: &str) -> http::Request<Empty<Bytes>> {
        http::Request::get(path).body(Empty::new()).unwrap()
    }

    async fn text(res: http::Response<ResponseBody>) -> String {
        let bytes = res.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn empty_pipeline_is_404() {
        let res = app(Pipeline::default()).handle(get("/"), None, false).await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
        assert_eq!(text(res).await, "Not Found");
    }

    #[tokio::test]
    async fn body_and_headers_reach_the_wire() {
        let pipeline = Pipeline::new([from_fn(|ctx, next| Box::pin(async move {
            next.run(ctx).await?;
            ctx.set_header("x-done", "1")
        })), from_fn(|ctx, _| Box::pin(async move {
            ctx.set_body(format!("hello {}", ctx.path()));
            Ok(())
        }))]);
        let res = app(pipeline).handle(get("/world"), None, false).await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.headers()["x-done"], "1");
        assert_eq!(res.headers()["content-type"], "text/plain; charset=utf-8");
        assert_eq!(text(res).await, "hello /world");
    }

    #[tokio::test]
    async fn errors_become_responses() {
        let pipeline = Pipeline::new([from_fn(|_, _| Box::pin(async move {
            Err(HttpError::new(StatusCode::FORBIDDEN, "no entry").into())
        }))]);
        let res = app(pipeline).handle(get("/"), None, false).await;
        assert_eq!(res.status(), StatusCode::FORBIDDEN);
        assert_eq!(text(res).await, "no entry");
    }

    #[tokio::test]
    async fn success_status_errors_stay_hidden() {
        let pipeline = Pipeline::new([from_fn(|_, _| Box::pin(async move {
            Err(HttpError::new(StatusCode::OK, "secret detail").into())
        }))]);
        let res = app(pipeline).handle(get("/"), None, false).await;
        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(text(res).await, "Internal Server Error");
    }

    #[tokio::test]
    async fn flushed_head_arrives_before_the_pipeline_ends() {
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let release = Arc::new(parking_lot::Mutex::new(Some(release_rx)));
        let pipeline = Pipeline::new([from_fn(move |ctx, _| {
            let release = release.lock().take();
            Box::pin(async move {
                ctx.set_status(200)?;
                ctx.write("first,").await?;
                if let Some(rx) = release {
                    let _ = rx.await;
                }
                ctx.set_body("second");
                Ok(())
            })
        })]);

        let res = tokio::time::timeout(
            Duration::from_secs(5),
            app(pipeline).handle(get("/"), None, false),
        )
        .await
        .expect("head was not flushed");
        assert_eq!(res.status(), StatusCode::OK);
        release_tx.send(()).unwrap();
        assert_eq!(text(res).await, "first,second");
    }

    #[tokio::test]
    async fn request_body_is_readable() {
        let pipeline = Pipeline::new([from_fn(|ctx, _| Box::pin(async move {
            let body = ctx.request_mut().body_bytes().await?;
            ctx.set_body(body.len().to_string());
            Ok(())
        }))]);
        let req = http::Request::post("/").body(Full::new(Bytes::from_static(b"12345"))).unwrap();
        let res = app(pipeline).handle(req, None, false).await;
        assert_eq!(text(res).await, "5");
    }

    #[test]
    fn empty_signing_key_is_rejected() {
        let config = Config { keys: vec![String::new()], ..Config::default() };
        assert!(App::new(Pipeline::default(), &config, Verbose::new()).is_err());
    }
}
