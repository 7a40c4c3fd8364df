// Remote server
//
// Two listeners: request/reply on `endpoint` and a publisher on
// `sub_endpoint`. Requests from all connections are serialized through one
// lock on the model and run on the blocking pool so the reply loop never
// computes frames itself. Frame notifications are fanned out with a
// broadcast channel fed from the scheduler's completion callback.

use crate::error::{FramecastError, Result};
use crate::frame::Frame;
use crate::model::ProcessingModel;
use crate::pipeline::scheduler::FrameReady;
use crate::remote::framing::{read_multipart, write_multipart};
use crate::remote::messages::{Envelope, NotificationMessage, RequestMessage, ResponseMessage};
use crate::remote::socket_addr;
use image::ImageFormat;
use std::future::Future;
use std::io::Cursor;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const NOTIFY_CAPACITY: usize = 1024;
const UNKNOWN_REQUEST: &str = "UNKNOWN";

pub struct RemoteServer {
    model: Arc<Mutex<ProcessingModel>>,
    requests: TcpListener,
    publisher: TcpListener,
    notifications: broadcast::Sender<NotificationMessage>,
    upload_dir: PathBuf,
}

impl RemoteServer {
    pub async fn bind(mut model: ProcessingModel, endpoint: &str, sub_endpoint: &str) -> Result<Self> {
        let (notifications, _) = broadcast::channel(NOTIFY_CAPACITY);
        let sender = notifications.clone();
        model.on_frame_processed(Arc::new(move |ready: FrameReady| {
            // No subscribers is not an error.
            let _ = sender.send(NotificationMessage::NtfFrame {
                index: ready.index,
                time: ready.time,
                fps: ready.fps,
            });
        }));
        let upload_dir = model.config().temp_dir.join("uploads");

        let requests = bind_listener(endpoint).await?;
        let publisher = bind_listener(sub_endpoint).await?;
        info!(
            "Server: requests on {:?}, notifications on {:?}",
            requests.local_addr().ok(),
            publisher.local_addr().ok()
        );

        Ok(Self {
            model: Arc::new(Mutex::new(model)),
            requests,
            publisher,
            notifications,
            upload_dir,
        })
    }

    /// Bound `(endpoint, sub_endpoint)`, with the actual ports when bound to
    /// port 0.
    pub fn endpoints(&self) -> Result<(String, String)> {
        let addr = |listener: &TcpListener| -> Result<String> {
            let local = listener
                .local_addr()
                .map_err(|e| FramecastError::transport(e.to_string()))?;
            Ok(format!("tcp://{local}"))
        };
        Ok((addr(&self.requests)?, addr(&self.publisher)?))
    }

    /// Serves until `shutdown` resolves, then stops the model.
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Self {
            model,
            requests,
            publisher,
            notifications,
            upload_dir,
        } = self;
        let handler = Arc::new(RequestHandler {
            model: model.clone(),
            upload_dir,
        });

        tokio::select! {
            _ = accept_requests(requests, handler) => {}
            _ = accept_subscribers(publisher, notifications) => {}
            _ = shutdown => info!("Server: shutting down"),
        }

        let guard = model.lock_owned().await;
        tokio::task::spawn_blocking(move || {
            let mut model = guard;
            model.stop(true, true)
        })
        .await
        .map_err(|e| FramecastError::transport(format!("shutdown task failed: {e}")))?
    }
}

async fn bind_listener(endpoint: &str) -> Result<TcpListener> {
    let addr = socket_addr(endpoint)?;
    TcpListener::bind(addr)
        .await
        .map_err(|e| FramecastError::transport(format!("cannot bind {endpoint}: {e}")))
}

async fn accept_requests(listener: TcpListener, handler: Arc<RequestHandler>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!("Server: request connection from {}", peer);
                tokio::spawn(serve_requests(stream, peer, handler.clone()));
            }
            Err(e) => warn!("Server: accept failed: {}", e),
        }
    }
}

async fn accept_subscribers(
    listener: TcpListener,
    notifications: broadcast::Sender<NotificationMessage>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!("Server: subscriber {}", peer);
                // Subscribe before the handshake so nothing published after
                // NTF_SUBSCRIBED is missed.
                let rx = notifications.subscribe();
                tokio::spawn(serve_subscriber(stream, peer, rx));
            }
            Err(e) => warn!("Server: accept failed: {}", e),
        }
    }
}

async fn serve_requests(stream: TcpStream, peer: SocketAddr, handler: Arc<RequestHandler>) {
    let (mut reader, mut writer) = stream.into_split();
    loop {
        let (reply, close) = match read_multipart(&mut reader).await {
            Ok(Some(parts)) => (handler.handle(parts).await, false),
            Ok(None) => break,
            Err(e @ FramecastError::Protocol(_)) => {
                // The stream is out of sync after a bad frame; answer once
                // and drop the connection.
                (Envelope::new(ResponseMessage::error(UNKNOWN_REQUEST, e.to_string())), true)
            }
            Err(e) => {
                debug!("Server: connection {} failed: {}", peer, e);
                break;
            }
        };
        let sent = match reply.encode() {
            Ok(parts) => write_multipart(&mut writer, &parts).await,
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            warn!("Server: reply to {} failed: {}", peer, e);
            break;
        }
        if close {
            break;
        }
    }
    debug!("Server: connection {} closed", peer);
}

async fn serve_subscriber(
    mut stream: TcpStream,
    peer: SocketAddr,
    mut rx: broadcast::Receiver<NotificationMessage>,
) {
    if let Err(e) = publish(&mut stream, NotificationMessage::NtfSubscribed).await {
        debug!("Server: subscriber {} gone before handshake: {}", peer, e);
        return;
    }
    loop {
        match rx.recv().await {
            Ok(notification) => {
                if let Err(e) = publish(&mut stream, notification).await {
                    debug!("Server: subscriber {} gone: {}", peer, e);
                    break;
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!("Server: subscriber {} lagged, dropped {} notifications", peer, skipped);
            }
            Err(RecvError::Closed) => break,
        }
    }
}

async fn publish(stream: &mut TcpStream, notification: NotificationMessage) -> Result<()> {
    let parts = Envelope::new(notification).encode()?;
    write_multipart(stream, &parts).await
}

struct RequestHandler {
    model: Arc<Mutex<ProcessingModel>>,
    upload_dir: PathBuf,
}

impl RequestHandler {
    async fn handle(&self, parts: Vec<Vec<u8>>) -> Envelope<ResponseMessage> {
        let request = match Envelope::<RequestMessage>::decode(parts) {
            Ok(request) => request,
            Err(e) => {
                warn!("Server: rejected message: {}", e);
                return Envelope::new(ResponseMessage::error(UNKNOWN_REQUEST, e.to_string()));
            }
        };
        let kind = request.header.kind();
        debug!("Server: {}", kind);

        let guard = self.model.clone().lock_owned().await;
        let upload_dir = self.upload_dir.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            let mut model = guard;
            handle_request(&mut model, &upload_dir, request)
        })
        .await;

        match outcome {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                warn!("Server: {} failed: {}", kind, e);
                Envelope::new(ResponseMessage::error(kind, e.to_string()))
            }
            Err(e) => Envelope::new(ResponseMessage::error(kind, format!("handler panicked: {e}"))),
        }
    }
}

fn display_path(path: Option<&Path>) -> Option<String> {
    path.map(|p| p.to_string_lossy().into_owned())
}

/// Applies one request to the model.
pub fn handle_request(
    model: &mut ProcessingModel,
    upload_dir: &Path,
    request: Envelope<RequestMessage>,
) -> Result<Envelope<ResponseMessage>> {
    let Envelope { header, payload } = request;
    let ok = ResponseMessage::ok(header.kind());

    let response = match header {
        RequestMessage::GetStatus => ok.with_all(&model.status_json())?,
        RequestMessage::GetSource => ok.with("source_path", display_path(model.source())),
        RequestMessage::SetSource { source_path } => {
            model.set_source(&source_path)?;
            ok.with("source_path", source_path)
        }
        RequestMessage::GetTarget => ok.with("target_path", display_path(model.target())),
        RequestMessage::SetTarget { target_path } => {
            model.set_target(&target_path)?;
            ok.with("target_path", target_path)
        }
        RequestMessage::GetQuality => ok.with("quality", model.quality()),
        RequestMessage::SetQuality { quality } => {
            model.set_quality(quality)?;
            ok.with("quality", quality)
        }
        RequestMessage::GetPosition => ok.with("position", model.position()),
        RequestMessage::SetPosition { position } => {
            model.rewind(position)?;
            ok.with("position", position)
        }
        RequestMessage::GetMetadata => ok.with_all(&model.metadata()?)?,
        RequestMessage::GetFrame { position } => {
            let nf = model.frame(position)?;
            let (h, w, c) = nf.shape();
            let response = ok
                .with("index", nf.index)
                .with("shape", vec![h, w, c])
                .with("encoding", "png");
            return Ok(Envelope::with_payload(response, encode_png(&nf.frame)?));
        }
        RequestMessage::SetSourceFile { filename } => {
            let path = save_upload(upload_dir, &filename, payload)?;
            model.set_source(&path)?;
            ok.with("source_path", path.to_string_lossy().into_owned())
        }
        RequestMessage::SetTargetFile { filename } => {
            let path = save_upload(upload_dir, &filename, payload)?;
            model.set_target(&path)?;
            ok.with("target_path", path.to_string_lossy().into_owned())
        }
        RequestMessage::CmdStartProcessing { position } => {
            model.play(position)?;
            ok.with("position", position)
        }
        RequestMessage::CmdStopProcessing => {
            model.stop(true, false)?;
            ok
        }
        RequestMessage::CmdFrameProcessed { position } => {
            let found = model.mark_frame_processed(position)?;
            ok.with("position", position).with("found", found)
        }
    };
    Ok(Envelope::new(response))
}

fn encode_png(frame: &Frame) -> Result<Vec<u8>> {
    let mut bytes = Cursor::new(Vec::new());
    frame.write_to(&mut bytes, ImageFormat::Png)?;
    Ok(bytes.into_inner())
}

/// Writes uploaded bytes to `<upload_dir>/<basename>`.
fn save_upload(upload_dir: &Path, filename: &str, payload: Option<Vec<u8>>) -> Result<PathBuf> {
    let payload =
        payload.ok_or_else(|| FramecastError::invalid("file upload without a payload frame"))?;
    let name = Path::new(filename)
        .file_name()
        .ok_or_else(|| FramecastError::invalid(format!("bad upload file name '{filename}'")))?;
    std::fs::create_dir_all(upload_dir).map_err(|e| FramecastError::io(upload_dir, e))?;
    let path = upload_dir.join(name);
    std::fs::write(&path, payload).map_err(|e| FramecastError::io(&path, e))?;
    info!("Server: stored upload {:?} ({} bytes)", path, path.metadata().map(|m| m.len()).unwrap_or(0));
    Ok(path)
}
