//! Chunked model transfer
//!
//! Models move as streams of `ModelRequest`/`ModelResponse` frames. Data
//! frames carry `IN_PROGRESS`; a single trailing `OK` frame with empty
//! data marks the end of the model, separately from the transport end of
//! stream. A `FAILED` frame aborts the transfer.

use std::path::Path;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::channel::AuthedChannel;
use crate::pb::{Client, ModelRequest, ModelResponse, ModelServiceClient, ModelStatus};
use crate::scratch::{ChunkReader, ScratchWriter};

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("download failed for model {model_id}: combiner reported FAILED")]
    DownloadFailed { model_id: String },
    #[error("transfer stream error: {0}")]
    Status(#[from] tonic::Status),
    #[error("scratch I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("upload stream for model {model_id} aborted")]
    UploadAborted { model_id: String },
}

/// Stream a model download into the scratch file at `path`.
///
/// A stream that yields no `IN_PROGRESS` frames before `OK` is an empty
/// model and is accepted. Returns the number of bytes written.
pub async fn download_to_file(
    client: &ModelServiceClient<AuthedChannel>,
    sender: Client,
    model_id: &str,
    path: &Path,
) -> Result<u64, TransferError> {
    let request = ModelRequest {
        sender: Some(sender),
        receiver: None,
        data: Vec::new(),
        id: model_id.to_string(),
        status: ModelStatus::Unknown as i32,
    };

    let mut client = client.clone();
    let mut stream = client.download(request).await?.into_inner();

    let mut writer = ScratchWriter::create(path).await?;
    let mut complete = false;

    while let Some(frame) = stream.message().await? {
        match frame.status() {
            ModelStatus::InProgress => {
                writer.append(&frame.data).await?;
            }
            ModelStatus::Ok => {
                complete = true;
            }
            ModelStatus::Failed => {
                return Err(TransferError::DownloadFailed {
                    model_id: model_id.to_string(),
                });
            }
            ModelStatus::Unknown => {
                warn!(model_id = %model_id, "Download frame with UNKNOWN status, ignoring");
            }
        }
    }

    let written = writer.finish().await?;
    if !complete {
        warn!(model_id = %model_id, "Download stream ended without an OK frame");
    }
    debug!(model_id = %model_id, bytes = written, "Model download complete");
    Ok(written)
}

/// Stream the scratch file at `path` to the combiner under `model_id`.
///
/// `sender` rides only on the first data frame. The terminal frame is
/// `OK` with empty data and empty sender, always the last frame on the
/// wire. A chunk-read failure aborts the stream.
pub async fn upload_from_file(
    client: &ModelServiceClient<AuthedChannel>,
    sender: Client,
    model_id: &str,
    path: &Path,
    chunk_size: usize,
) -> Result<ModelResponse, TransferError> {
    let mut reader = ChunkReader::open(path, chunk_size).await?;
    let (tx, rx) = mpsc::channel::<ModelRequest>(4);

    let id = model_id.to_string();
    let producer = tokio::spawn(async move {
        let mut sender_slot = Some(sender);
        let mut sent: u64 = 0;

        while let Some(chunk) = reader.next_chunk().await? {
            let frame = if chunk.is_last {
                ModelRequest {
                    sender: None,
                    receiver: None,
                    data: Vec::new(),
                    id: id.clone(),
                    status: ModelStatus::Ok as i32,
                }
            } else {
                sent += chunk.data.len() as u64;
                ModelRequest {
                    sender: sender_slot.take(),
                    receiver: None,
                    data: chunk.data,
                    id: id.clone(),
                    status: ModelStatus::InProgress as i32,
                }
            };

            if tx.send(frame).await.is_err() {
                // Receiver gone: the RPC ended before the stream drained.
                break;
            }
        }

        Ok::<u64, std::io::Error>(sent)
    });

    let outcome = {
        let mut client = client.clone();
        client.upload(ReceiverStream::new(rx)).await
    };

    let produced = producer.await.map_err(|_| TransferError::UploadAborted {
        model_id: model_id.to_string(),
    })?;
    let sent = produced?;
    let response = outcome?.into_inner();

    debug!(model_id = %model_id, bytes = sent, "Model upload complete");
    Ok(response)
}
