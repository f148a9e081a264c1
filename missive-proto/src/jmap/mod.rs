pub mod dispatch;
pub mod email;
pub mod mailbox;
pub mod submission;
pub mod types;

use std::net::SocketAddr;

use anyhow::{anyhow, Result};
use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use futures::stream::{FuturesUnordered, StreamExt};
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1 as http;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;

use missive_collections::mail::store::MessageStore;
use missive_user::config::{JmapConfig, LimitsConfig};
use missive_user::login::{ArcLoginProvider, LoginProvider};

use crate::jmap::dispatch::{handle_request, JmapContext};
use crate::jmap::types::JmapRequest;

pub struct Server {
    bind_addr: SocketAddr,
    login_provider: ArcLoginProvider,
    ctx: JmapContext,
    limits: LimitsConfig,
    tls: Option<TlsAcceptor>,
}

pub fn new(
    config: JmapConfig,
    login_provider: ArcLoginProvider,
    ctx: JmapContext,
    limits: LimitsConfig,
) -> Result<Server> {
    let tls = match (&config.certs, &config.key) {
        (Some(certs), Some(key)) => Some(crate::tls::acceptor(certs, key)?),
        _ => None,
    };
    Ok(Server {
        bind_addr: config.bind_addr,
        login_provider,
        ctx,
        limits,
        tls,
    })
}

trait Stream: hyper::rt::Read + hyper::rt::Write + Send + Unpin {}
impl<T: Unpin + tokio::io::AsyncRead + tokio::io::AsyncWrite + Send> Stream for TokioIo<T> {}

impl Server {
    pub async fn run(self, mut must_exit: watch::Receiver<bool>) -> Result<()> {
        let tcp = TcpListener::bind(self.bind_addr).await?;
        tracing::info!("JMAP server listening on {:#}", self.bind_addr);

        let mut connections = FuturesUnordered::new();
        while !*must_exit.borrow() {
            let wait_conn_finished = async {
                if connections.is_empty() {
                    futures::future::pending().await
                } else {
                    connections.next().await
                }
            };
            let (socket, remote_addr) = tokio::select! {
                a = tcp.accept() => a?,
                _ = wait_conn_finished => continue,
                _ = must_exit.changed() => continue,
            };
            tracing::info!("JMAP: accepted connection from {}", remote_addr);

            let stream: Box<dyn Stream> = match self.tls.clone() {
                Some(acceptor) => match acceptor.accept(socket).await {
                    Ok(stream) => Box::new(TokioIo::new(stream)),
                    Err(e) => {
                        tracing::error!(err = ?e, "TLS negotiation failed");
                        continue;
                    }
                },
                None => Box::new(TokioIo::new(socket)),
            };

            let login = self.login_provider.clone();
            let ctx = self.ctx.clone();
            let limits = self.limits.clone();
            let conn = tokio::spawn(async move {
                let served = http::Builder::new()
                    .serve_connection(
                        stream,
                        service_fn(move |req: Request<Incoming>| {
                            let login = login.clone();
                            let ctx = ctx.clone();
                            let limits = limits.clone();
                            async move {
                                match route(login, ctx, limits, req).await {
                                    Ok(resp) => Ok::<_, hyper::Error>(resp),
                                    Err(e) => {
                                        tracing::error!(err = ?e, "internal error");
                                        Ok(plain(StatusCode::INTERNAL_SERVER_ERROR, "Internal error"))
                                    }
                                }
                            }
                        }),
                    )
                    .await;
                if let Err(e) = served {
                    tracing::warn!(err = ?e, "connection failed");
                }
            });
            connections.push(conn);
        }
        drop(tcp);

        tracing::info!("JMAP server shutting down, draining remaining connections...");
        while connections.next().await.is_some() {}

        Ok(())
    }
}

fn plain(status: StatusCode, text: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::from(text.to_string())))
        .expect("valid response")
}

fn json_response(status: StatusCode, value: serde_json::Value) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json; charset=utf-8")
        .body(Full::new(Bytes::from(value.to_string())))
        .expect("valid response")
}

/// Basic auth against the login provider; every route requires it.
async fn authenticate(login: &ArcLoginProvider, req: &Request<Incoming>) -> Result<String> {
    let header = req
        .headers()
        .get(hyper::header::AUTHORIZATION)
        .ok_or(anyhow!("missing Authorization header"))?
        .to_str()?;
    let b64 = match header.split_once(' ') {
        Some(("Basic", b64)) => b64,
        _ => return Err(anyhow!("unsupported Authorization scheme")),
    };
    // padding is optional in what clients actually send
    let decoded = STANDARD_NO_PAD.decode(b64.trim_end_matches('='))?;
    let text = std::str::from_utf8(&decoded)?;
    let (username, password) = text
        .split_once(':')
        .ok_or(anyhow!("missing colon in Basic credentials"))?;
    let creds = login.login(username, password).await?;
    Ok(creds.username)
}

async fn route(
    login: ArcLoginProvider,
    ctx: JmapContext,
    limits: LimitsConfig,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>> {
    tracing::debug!(method = ?req.method(), uri = ?req.uri(), "jmap request");

    let user = match authenticate(&login, &req).await {
        Ok(user) => user,
        Err(e) => {
            tracing::info!(err = %e, "unauthorized jmap request");
            return Ok(Response::builder()
                .status(StatusCode::UNAUTHORIZED)
                .header("WWW-Authenticate", "Basic realm=\"Missive\"")
                .body(Full::new(Bytes::from_static(b"Unauthorized")))?);
        }
    };
    ctx.store.ensure_user(&user).await?;

    let path = req.uri().path().to_string();
    let method = req.method().clone();
    if method == Method::GET && path == "/jmap/session" {
        Ok(json_response(StatusCode::OK, session_object(&user)))
    } else if method == Method::POST && path == "/jmap" {
        api(&ctx, &user, req, &limits).await
    } else if method == Method::POST && path == "/jmap/upload" {
        upload(&ctx, &user, req, &limits).await
    } else if method == Method::GET && path.starts_with("/jmap/download/") {
        download(&ctx, &user, &path["/jmap/download/".len()..]).await
    } else if method == Method::DELETE && path.starts_with("/jmap/blob/") {
        delete_blob(&ctx, &user, &path["/jmap/blob/".len()..]).await
    } else {
        Ok(plain(StatusCode::NOT_FOUND, "No such endpoint"))
    }
}

fn session_object(user: &str) -> serde_json::Value {
    json!({
        "capabilities": {
            "urn:ietf:params:jmap:core": {
                "maxCallsInRequest": 16,
                "maxObjectsInGet": 256,
                "maxObjectsInSet": 128,
            },
            "urn:ietf:params:jmap:mail": {},
            "urn:ietf:params:jmap:submission": {},
        },
        "accounts": {
            user: {
                "name": user,
                "isPersonal": true,
                "isReadOnly": false,
            }
        },
        "primaryAccounts": {
            "urn:ietf:params:jmap:mail": user,
        },
        "username": user,
        "apiUrl": "/jmap",
        "uploadUrl": "/jmap/upload",
        "downloadUrl": "/jmap/download/{blobId}",
        "state": "0",
    })
}

async fn api(
    ctx: &JmapContext,
    user: &str,
    req: Request<Incoming>,
    limits: &LimitsConfig,
) -> Result<Response<Full<Bytes>>> {
    let body = req.into_body().collect().await?.to_bytes();
    if body.len() > limits.max_upload_bytes {
        return Ok(plain(StatusCode::PAYLOAD_TOO_LARGE, "Request too large"));
    }
    let request: JmapRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            return Ok(json_response(
                StatusCode::BAD_REQUEST,
                json!({"type": "urn:ietf:params:jmap:error:notJSON", "detail": e.to_string()}),
            ))
        }
    };
    let response = handle_request(ctx, user, request).await;
    Ok(json_response(StatusCode::OK, serde_json::to_value(response)?))
}

/// Streamed upload: body frames flow straight into the chunked blob
/// writer, bounded by the configured upload cap.
async fn upload(
    ctx: &JmapContext,
    user: &str,
    req: Request<Incoming>,
    limits: &LimitsConfig,
) -> Result<Response<Full<Bytes>>> {
    let content_type = req
        .headers()
        .get(hyper::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();

    let mut writer = ctx.blobs.writer(user, None)?;
    let mut received = 0usize;
    let mut body = req.into_body();
    while let Some(frame) = body.frame().await {
        let frame = frame?;
        if let Some(data) = frame.data_ref() {
            received += data.len();
            if received > limits.max_upload_bytes {
                return Ok(plain(StatusCode::PAYLOAD_TOO_LARGE, "Upload too large"));
            }
            writer.push(data).await?;
        }
    }
    let meta = writer.finish("upload", &content_type, None).await?;

    Ok(json_response(
        StatusCode::CREATED,
        json!({
            "accountId": user,
            "blobId": meta.id,
            "type": meta.content_type,
            "size": meta.size,
        }),
    ))
}

async fn delete_blob(
    ctx: &JmapContext,
    user: &str,
    blob_id: &str,
) -> Result<Response<Full<Bytes>>> {
    match ctx.blobs.delete(user, blob_id).await {
        Ok(()) => Ok(plain(StatusCode::NO_CONTENT, "")),
        Err(missive_collections::blob::BlobError::NotFound) => {
            Ok(plain(StatusCode::NOT_FOUND, "No such blob"))
        }
        Err(e) => Err(e.into()),
    }
}

async fn download(
    ctx: &JmapContext,
    user: &str,
    blob_id: &str,
) -> Result<Response<Full<Bytes>>> {
    match ctx.blobs.get(user, blob_id).await {
        Ok((meta, bytes)) => Ok(Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", meta.content_type)
            .header(
                "Content-Disposition",
                format!("attachment; filename=\"{}\"", meta.filename),
            )
            .body(Full::new(Bytes::from(bytes)))?),
        Err(missive_collections::blob::BlobError::NotFound) => {
            Ok(plain(StatusCode::NOT_FOUND, "No such blob"))
        }
        Err(e) => Err(e.into()),
    }
}
