//! Speech delivery for final assistant replies.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use futures::StreamExt;
use serde_json::json;

use super::dispatch::Handler;
use crate::pipeline::{MessageContext, OutboundKind};
use crate::providers::{ProviderError, TtsHandle, TtsRequest};

impl Handler {
    /// Speak `text` through the primary TTS, if one is configured.
    ///
    /// Failures are logged and never affect the text reply.
    pub(crate) async fn speak(&self, ctx: &mut MessageContext, text: &str) {
        if text.trim().is_empty() {
            return;
        }
        let tts = match self.providers.primary_tts().await {
            Ok(Some(tts)) => tts,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(channel = %ctx.channel_id(), error = %e, "primary TTS unavailable");
                return;
            }
        };

        match stream_audio(ctx, &tts, text).await {
            Ok(chunks) => {
                tracing::debug!(instance = %tts.instance_id, chunks, "speech delivered");
            }
            Err(e) => {
                tracing::warn!(instance = %tts.instance_id, error = %e, "speech synthesis failed");
            }
        }
    }
}

/// Send `audio_stream_start`, base64 chunks, then `audio_stream_end`.
/// Returns the number of chunks sent.
async fn stream_audio(
    ctx: &mut MessageContext,
    tts: &TtsHandle,
    text: &str,
) -> Result<usize, ProviderError> {
    let request = TtsRequest {
        text: text.to_string(),
        ..TtsRequest::default()
    };
    let mut stream = tts.provider.synthesize_stream(request).await?;

    let mut sent = 0usize;
    while let Some(chunk) = stream.next().await {
        let audio = match chunk {
            Ok(audio) => audio,
            Err(e) => {
                if sent > 0 {
                    ctx.send(
                        OutboundKind::AudioStreamEnd,
                        None,
                        json!({ "chunks": sent, "error": e.to_string() }),
                    );
                }
                return Err(e);
            }
        };
        if sent == 0 {
            ctx.send(
                OutboundKind::AudioStreamStart,
                None,
                json!({ "mimeType": audio.mime_type, "instanceId": tts.instance_id }),
            );
        }
        ctx.send(
            OutboundKind::AudioStreamChunk,
            None,
            json!({ "index": sent, "audio": STANDARD.encode(&audio.bytes) }),
        );
        sent += 1;
    }

    if sent > 0 {
        ctx.send(OutboundKind::AudioStreamEnd, None, json!({ "chunks": sent }));
    }
    Ok(sent)
}
