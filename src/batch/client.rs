//! HTTP client for the transcription service.

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;

use crate::batch::{BatchError, BatchItemError};

/// Something that can turn one audio file into a transcript.
///
/// The orchestrator only depends on this trait, so tests drive it with an
/// in-memory fake.
#[async_trait]
pub trait TranscriptionClient: Send + Sync {
    async fn transcribe(&self, filename: &str, bytes: Vec<u8>) -> Result<String, BatchItemError>;
}

#[derive(Debug, Deserialize)]
struct TranscriptionBody {
    #[serde(default)]
    transcription: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

/// Posts each clip to `{service_url}/asr` as the multipart field `file`.
pub struct HttpTranscriptionClient {
    http: reqwest::Client,
    endpoint: String,
}

impl HttpTranscriptionClient {
    pub fn new(service_url: &str, timeout: Duration) -> Result<Self, BatchError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BatchError::Client(e.to_string()))?;

        Ok(Self {
            http,
            endpoint: format!("{}/asr", service_url.trim_end_matches('/')),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl TranscriptionClient for HttpTranscriptionClient {
    async fn transcribe(&self, filename: &str, bytes: Vec<u8>) -> Result<String, BatchItemError> {
        let part = Part::bytes(bytes)
            .file_name(filename.to_string())
            .mime_str("audio/mpeg")
            .map_err(|e| BatchItemError::Transport(format!("Failed to create multipart: {e}")))?;
        let form = Form::new().part("file", part);

        let response = self
            .http
            .post(&self.endpoint)
            .multipart(form)
            .send()
            .await
            .map_err(|e| BatchItemError::Transport(e.to_string()))?;

        let status = response.status();
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorBody>(&body)
                .map(|b| b.error)
                .unwrap_or(body);
            return Err(BatchItemError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        // A 200 without a transcription field counts as an empty transcript
        let body: TranscriptionBody = response
            .json()
            .await
            .map_err(|e| BatchItemError::InvalidResponse(e.to_string()))?;

        Ok(body.transcription.unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::fixtures::tone_wav;
    use crate::handlers;
    use crate::state::test_state;
    use actix_web::{web, App, HttpServer};

    /// Serve `/asr` on an ephemeral port backed by a scripted model.
    fn spawn_service(script: Vec<u32>) -> (String, actix_web::dev::ServerHandle) {
        let state = test_state(script);
        let server = HttpServer::new(move || {
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/asr", web::post().to(handlers::transcribe))
        })
        .workers(1)
        .disable_signals()
        .bind(("127.0.0.1", 0))
        .unwrap();

        let addr = server.addrs()[0];
        let server = server.run();
        let handle = server.handle();
        actix_web::rt::spawn(server);
        (format!("http://{}", addr), handle)
    }

    #[actix_web::test]
    async fn test_round_trip_against_service() {
        let (url, handle) = spawn_service(vec![3, 0]);
        let client = HttpTranscriptionClient::new(&format!("{}/", url), Duration::from_secs(30)).unwrap();
        assert_eq!(client.endpoint(), format!("{}/asr", url));

        let text = client.transcribe("clip.mp3", tone_wav(4000)).await.unwrap();
        assert_eq!(text, "BB");

        let err = client.transcribe("clip.ogg", tone_wav(4000)).await.unwrap_err();
        match err {
            BatchItemError::Rejected { status, message } => {
                assert_eq!(status, 400);
                assert_eq!(message, "File must be MP3 format");
            }
            other => panic!("unexpected error: {other}"),
        }

        handle.stop(false).await;
    }

    #[actix_web::test]
    async fn test_unreachable_service_is_transport_error() {
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let client =
            HttpTranscriptionClient::new(&format!("http://127.0.0.1:{}", port), Duration::from_secs(5))
                .unwrap();

        let err = client.transcribe("clip.mp3", vec![1, 2, 3]).await.unwrap_err();
        assert!(matches!(err, BatchItemError::Transport(_)));
    }
}
