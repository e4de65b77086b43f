// loki.source.aws_firehose
// HTTP endpoint receiving AWS Firehose deliveries and forwarding them as log entries

pub mod handler;
pub mod metrics;

pub use handler::{FirehoseRequest, FirehoseResponse, Handler, HandlerConfig};
pub use metrics::FirehoseMetrics;

use crate::component::{Arguments, Body, Component, ComponentError, DecodeError, Options};
use crate::components::loki::relabel::{decode_rules, RelabelRule};
use crate::components::loki::LogsReceiver;

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub const NAME: &str = "loki.source.aws_firehose";

pub const DEFAULT_LISTEN_ADDRESS: &str = "0.0.0.0:8080";

#[derive(Debug, Clone)]
pub struct FirehoseArguments {
    pub listen_address: String,
    pub forward_to: Vec<Arc<LogsReceiver>>,
    pub relabel_rules: Vec<RelabelRule>,
    pub use_incoming_timestamp: bool,
    pub access_key: Option<String>,
}

impl Arguments for FirehoseArguments {
    fn decode(body: &Body<'_>) -> Result<Self, DecodeError> {
        body.check_known(&[
            "listen_address",
            "forward_to",
            "relabel_rules",
            "use_incoming_timestamp",
            "access_key",
        ])?;

        let listen_address = body.string_or("listen_address", DEFAULT_LISTEN_ADDRESS)?;
        if listen_address.trim().is_empty() {
            return Err(DecodeError::invalid("listen_address", "must not be empty"));
        }

        Ok(Self {
            listen_address,
            forward_to: body.capsules::<LogsReceiver>("forward_to")?,
            relabel_rules: decode_rules(body, "relabel_rules")?,
            use_incoming_timestamp: body.bool_or("use_incoming_timestamp", false)?,
            access_key: body.string("access_key")?.filter(|k| !k.is_empty()),
        })
    }
}

impl FirehoseArguments {
    fn handler_config(&self) -> HandlerConfig {
        HandlerConfig {
            forward_to: self.forward_to.clone(),
            relabel_rules: self.relabel_rules.clone(),
            use_incoming_timestamp: self.use_incoming_timestamp,
            access_key: self.access_key.clone(),
        }
    }
}

pub struct FirehoseSource {
    id: String,
    handler: Arc<Handler>,
    address: watch::Sender<String>,
    bound: Mutex<Option<SocketAddr>>,
}

impl FirehoseSource {
    pub fn new(opts: Options, args: FirehoseArguments) -> Result<Self, ComponentError> {
        let metrics = FirehoseMetrics::new(&opts.registerer, &opts.id)
            .map_err(|e| ComponentError::new(format!("failed to register metrics: {}", e)))?;
        let (address, _) = watch::channel(args.listen_address.clone());

        Ok(Self {
            id: opts.id,
            handler: Arc::new(Handler::new(args.handler_config(), metrics)),
            address,
            bound: Mutex::new(None),
        })
    }

    /// Address the server is currently bound to
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.bound.lock()
    }

    async fn serve(
        &self,
        listener: TcpListener,
        address: &mut watch::Receiver<String>,
        cancel: &CancellationToken,
    ) -> bool {
        let connections = cancel.child_token();
        let stopped = loop {
            tokio::select! {
                _ = cancel.cancelled() => break true,
                changed = address.changed() => {
                    if changed.is_err() {
                        break true;
                    }
                    break false;
                }
                accepted = listener.accept() => {
                    let (stream, remote) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            error!(component = %self.id, error = %e, "failed to accept connection");
                            continue;
                        }
                    };
                    let handler = self.handler.clone();
                    let connections = connections.clone();
                    tokio::spawn(async move {
                        let service = service_fn(move |req: Request<Incoming>| {
                            let handler = handler.clone();
                            async move { Ok::<_, Infallible>(respond(&handler, req).await) }
                        });
                        let conn = http1::Builder::new().serve_connection(TokioIo::new(stream), service);
                        tokio::select! {
                            result = conn => {
                                if let Err(e) = result {
                                    debug!(remote_addr = %remote, error = %e, "connection error");
                                }
                            }
                            _ = connections.cancelled() => {}
                        }
                    });
                }
            }
        };
        connections.cancel();
        stopped
    }
}

async fn respond(handler: &Handler, req: Request<Incoming>) -> Response<Full<Bytes>> {
    if req.method() != Method::POST {
        return json_response(StatusCode::METHOD_NOT_ALLOWED, Bytes::new());
    }

    let (parts, body) = req.into_parts();
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            debug!(error = %e, "failed to read request body");
            return json_response(StatusCode::BAD_REQUEST, Bytes::new());
        }
    };

    let (status, response) = handler.handle(&parts.headers, body).await;
    let body = serde_json::to_vec(&response).map(Bytes::from).unwrap_or_default();
    json_response(status, body)
}

fn json_response(status: StatusCode, body: Bytes) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

#[async_trait]
impl Component for FirehoseSource {
    type Arguments = FirehoseArguments;

    async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<(), ComponentError> {
        let mut address = self.address.subscribe();
        loop {
            let addr = address.borrow_and_update().clone();
            let listener = TcpListener::bind(&addr)
                .await
                .map_err(|e| ComponentError::new(format!("failed to listen on {}: {}", addr, e)))?;
            let local = listener.local_addr().ok();
            *self.bound.lock() = local;
            info!(component = %self.id, address = ?local, "firehose receiver listening");

            if self.serve(listener, &mut address, &cancel).await {
                *self.bound.lock() = None;
                return Ok(());
            }
            info!(component = %self.id, "listen address changed, rebinding");
        }
    }

    async fn update(&self, args: FirehoseArguments) -> Result<(), ComponentError> {
        self.handler.update(args.handler_config());
        self.address.send_if_modified(|current| {
            if *current == args.listen_address {
                return false;
            }
            *current = args.listen_address.clone();
            true
        });
        Ok(())
    }

    fn debug_info(&self) -> Option<serde_json::Value> {
        Some(serde_json::json!({
            "listen_address": self.address.borrow().clone(),
            "bound_address": self.local_addr().map(|a| a.to_string()),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::ExportsHandle;
    use crate::value::Value;

    use std::path::PathBuf;

    fn options(registry: &prometheus::Registry) -> Options {
        Options {
            id: "loki.source.aws_firehose.test".to_string(),
            data_path: PathBuf::from("/tmp"),
            registerer: registry.clone(),
            exports: ExportsHandle::new("loki.source.aws_firehose.test", None),
        }
    }

    fn args(yaml: &str) -> Result<FirehoseArguments, DecodeError> {
        let value = Value::from_yaml(&serde_yaml::from_str(yaml).unwrap());
        FirehoseArguments::decode(&Body::new(&value))
    }

    #[test]
    fn test_decode_arguments() {
        let parsed = args(
            "listen_address: 127.0.0.1:0\nuse_incoming_timestamp: true\naccess_key: k\nrelabel_rules:\n  - source_labels: [__aws_owner]\n    target_label: owner\n",
        )
        .unwrap();
        assert_eq!(parsed.listen_address, "127.0.0.1:0");
        assert!(parsed.use_incoming_timestamp);
        assert_eq!(parsed.access_key.as_deref(), Some("k"));
        assert_eq!(parsed.relabel_rules.len(), 1);
        assert!(parsed.forward_to.is_empty());

        let defaults = args("{}").unwrap();
        assert_eq!(defaults.listen_address, DEFAULT_LISTEN_ADDRESS);
        assert!(defaults.access_key.is_none());

        assert!(args("listen_address: ''\n").is_err());
        assert!(args("forward_to: [1]\n").is_err());
        assert!(args("port: 80\n").is_err());
    }

    #[tokio::test]
    async fn test_serves_and_rebinds() {
        let registry = prometheus::Registry::new();
        let source = Arc::new(
            FirehoseSource::new(options(&registry), args("listen_address: 127.0.0.1:0\n").unwrap())
                .unwrap(),
        );
        let cancel = CancellationToken::new();
        let task = tokio::spawn(source.clone().run(cancel.clone()));

        let mut first = None;
        for _ in 0..100 {
            first = source.local_addr();
            if first.is_some() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let first = first.unwrap();

        source
            .update(args("listen_address: 127.0.0.2:0\n").unwrap())
            .await
            .unwrap();
        let mut rebound = None;
        for _ in 0..100 {
            rebound = source.local_addr().filter(|a| a.ip() != first.ip());
            if rebound.is_some() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(rebound.is_some());

        cancel.cancel();
        task.await.unwrap().unwrap();
        assert!(source.local_addr().is_none());
    }
}
