// `ProcessingModel` operations over a `RemoteClient`.

use crate::error::{FramecastError, Result};
use crate::frame::NumberedFrame;
use crate::model::Metadata;
use crate::remote::client::RemoteClient;
use crate::remote::messages::{NotificationMessage, RequestMessage, ResponseMessage};
use serde_json::Value;
use std::path::Path;
use tokio::task::JoinHandle;

pub struct RemoteModel {
    client: RemoteClient,
}

impl RemoteModel {
    pub fn new(client: RemoteClient) -> Self {
        Self { client }
    }

    pub fn client(&mut self) -> &mut RemoteClient {
        &mut self.client
    }

    async fn call(&mut self, request: RequestMessage) -> Result<ResponseMessage> {
        self.client.send_request(request).await?.into_result()
    }

    pub async fn status(&mut self) -> Result<Value> {
        let reply = self.call(RequestMessage::GetStatus).await?;
        Ok(Value::Object(reply.fields))
    }

    pub async fn source(&mut self) -> Result<Option<String>> {
        self.call(RequestMessage::GetSource).await?.field("source_path")
    }

    pub async fn set_source(&mut self, source_path: &str) -> Result<()> {
        self.call(RequestMessage::SetSource {
            source_path: source_path.to_string(),
        })
        .await
        .map(|_| ())
    }

    pub async fn target(&mut self) -> Result<Option<String>> {
        self.call(RequestMessage::GetTarget).await?.field("target_path")
    }

    pub async fn set_target(&mut self, target_path: &str) -> Result<()> {
        self.call(RequestMessage::SetTarget {
            target_path: target_path.to_string(),
        })
        .await
        .map(|_| ())
    }

    /// Sends a local file as the source; returns the path on the server.
    pub async fn upload_source(&mut self, path: &Path) -> Result<String> {
        let (filename, bytes) = read_upload(path).await?;
        let reply = self
            .client
            .request(RequestMessage::SetSourceFile { filename }, Some(bytes))
            .await?
            .header
            .into_result()?;
        reply.field("source_path")
    }

    pub async fn upload_target(&mut self, path: &Path) -> Result<String> {
        let (filename, bytes) = read_upload(path).await?;
        let reply = self
            .client
            .request(RequestMessage::SetTargetFile { filename }, Some(bytes))
            .await?
            .header
            .into_result()?;
        reply.field("target_path")
    }

    pub async fn quality(&mut self) -> Result<u8> {
        self.call(RequestMessage::GetQuality).await?.field("quality")
    }

    pub async fn set_quality(&mut self, quality: u8) -> Result<()> {
        self.call(RequestMessage::SetQuality { quality })
            .await
            .map(|_| ())
    }

    pub async fn position(&mut self) -> Result<u64> {
        self.call(RequestMessage::GetPosition).await?.field("position")
    }

    pub async fn rewind(&mut self, position: u64) -> Result<()> {
        self.call(RequestMessage::SetPosition { position })
            .await
            .map(|_| ())
    }

    pub async fn play(&mut self, position: u64) -> Result<()> {
        self.call(RequestMessage::CmdStartProcessing { position })
            .await
            .map(|_| ())
    }

    pub async fn stop(&mut self) -> Result<()> {
        self.call(RequestMessage::CmdStopProcessing).await.map(|_| ())
    }

    pub async fn mark_frame_processed(&mut self, position: u64) -> Result<bool> {
        self.call(RequestMessage::CmdFrameProcessed { position })
            .await?
            .field("found")
    }

    pub async fn metadata(&mut self) -> Result<Metadata> {
        let reply = self.call(RequestMessage::GetMetadata).await?;
        serde_json::from_value(Value::Object(reply.fields))
            .map_err(|e| FramecastError::protocol(format!("bad metadata: {e}")))
    }

    /// Stored frame at `position` (or the closest earlier one).
    pub async fn frame(&mut self, position: u64) -> Result<NumberedFrame> {
        let reply = self
            .client
            .request(RequestMessage::GetFrame { position }, None)
            .await?;
        let header = reply.header.into_result()?;
        let payload = reply
            .payload
            .ok_or_else(|| FramecastError::protocol("GET_FRAME reply without a frame"))?;
        let index: u64 = header.field("index")?;
        let frame = image::load_from_memory(&payload)?.to_rgb8();
        let shape: Vec<u32> = header.field("shape")?;
        if shape != [frame.height(), frame.width(), 3] {
            return Err(FramecastError::protocol(format!(
                "frame shape {:?} does not match header {:?}",
                (frame.height(), frame.width()),
                shape
            )));
        }
        Ok(NumberedFrame::new(index, frame))
    }

    pub async fn subscribe<F>(&self, callback: F) -> Result<JoinHandle<()>>
    where
        F: Fn(NotificationMessage) + Send + 'static,
    {
        self.client.subscribe(callback).await
    }
}

async fn read_upload(path: &Path) -> Result<(String, Vec<u8>)> {
    let filename = path
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .ok_or_else(|| FramecastError::invalid(format!("{path:?} has no file name")))?;
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| FramecastError::io(path, e))?;
    Ok((filename, bytes))
}
