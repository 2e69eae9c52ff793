//! REST server hosting the request handler.

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::handler::RequestHandler;
use crate::http::{read_request, write_response, ENDPOINT_PATH};
use entisync_core::MemoryEntityStore;
use entisync_protocol::{ErrorKind, RequestBody, ResponseBody};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// HTTP host for the entity store.
///
/// Accepts `POST /entisync` requests with JSON bodies and dispatches them
/// through a `RequestHandler`. Store errors travel in-band as structured
/// error bodies with a 200 status; only malformed HTTP or JSON yields an
/// error status.
pub struct RestServer {
    config: ServerConfig,
    handler: Arc<RequestHandler>,
    shutdown: Arc<Notify>,
}

impl RestServer {
    /// Creates a server over the given store.
    pub fn new(config: ServerConfig, store: Arc<MemoryEntityStore>) -> Self {
        Self {
            config,
            handler: Arc::new(RequestHandler::new(store)),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Returns the request handler, for in-process dispatch.
    pub fn handler(&self) -> &Arc<RequestHandler> {
        &self.handler
    }

    /// Returns a handle that stops the accept loop when notified.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.shutdown)
    }

    /// Binds the configured address and serves until shut down.
    pub async fn serve(&self) -> ServerResult<()> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve_on(listener).await
    }

    /// Serves on an already-bound listener until shut down.
    pub async fn serve_on(&self, listener: TcpListener) -> ServerResult<()> {
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "entisync server started");

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    debug!(%peer, "accepted connection");
                    let handler = Arc::clone(&self.handler);
                    let config = self.config.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(handler, config, stream).await {
                            warn!(%peer, error = %e, "connection failed");
                        }
                    });
                }
                () = self.shutdown.notified() => {
                    info!("entisync server shutting down");
                    return Ok(());
                }
            }
        }
    }
}

async fn handle_connection(
    handler: Arc<RequestHandler>,
    config: ServerConfig,
    mut stream: TcpStream,
) -> ServerResult<()> {
    let request = match read_request(&mut stream, &config).await {
        Ok(request) => request,
        Err(e) if e.is_client_error() => {
            let status = match &e {
                ServerError::BodyTooLarge { .. } => 413,
                _ => 400,
            };
            let body = encode(&ResponseBody::error(ErrorKind::Validation, e.to_string()))?;
            write_response(&mut stream, status, &body).await?;
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    if request.method != "POST" {
        let body = encode(&ResponseBody::error(
            ErrorKind::Validation,
            "only POST is supported",
        ))?;
        write_response(&mut stream, 405, &body).await?;
        return Ok(());
    }
    if request.path != ENDPOINT_PATH {
        let body = encode(&ResponseBody::error(
            ErrorKind::NotFound,
            format!("no such route: {}", request.path),
        ))?;
        write_response(&mut stream, 404, &body).await?;
        return Ok(());
    }

    let response = match serde_json::from_slice::<RequestBody>(&request.body) {
        Ok(request_body) => handler.handle(request_body),
        Err(e) => {
            let body = encode(&ResponseBody::error(
                ErrorKind::Validation,
                format!("malformed request body: {e}"),
            ))?;
            write_response(&mut stream, 400, &body).await?;
            return Ok(());
        }
    };

    let body = encode(&response)?;
    write_response(&mut stream, 200, &body).await
}

fn encode(response: &ResponseBody) -> ServerResult<Vec<u8>> {
    Ok(serde_json::to_vec(response)?)
}
