//! # Speech Recognition Endpoint
//!
//! ## Endpoint: `POST /asr`
//!
//! ## Request:
//! Multipart form data with the audio file in a field named `file`.
//!
//! ## Response:
//! ```json
//! { "transcription": "BEFORE HE HAD TIME TO ANSWER", "duration": "4.284" }
//! ```
//!
//! ## Errors:
//! - **400** `{"error": "No file provided"}` and the other validation messages
//! - **500** `{"error": "<underlying failure>"}` for decoding or inference errors

use actix_multipart::{Field, Multipart};
use actix_web::{web, HttpResponse};
use futures_util::stream::StreamExt;

use crate::error::{AppError, AppResult};
use crate::state::AppState;
use crate::transcription::AudioPayload;

/// Multipart field carrying the upload.
pub const FILE_FIELD: &str = "file";

pub async fn transcribe(state: web::Data<AppState>, payload: Multipart) -> AppResult<HttpResponse> {
    let upload = read_upload(payload, state.config.audio.max_upload_bytes).await?;
    let result = state.service.handle(upload).await?;
    Ok(HttpResponse::Ok().json(result))
}

/// Pull the first `file` part that carries a filename out of the form.
///
/// Parts without a filename are plain form values, not uploads, and are
/// skipped. A body that is not valid multipart yields `None` so the caller
/// reports a missing file rather than a parser error.
async fn read_upload(mut payload: Multipart, max_bytes: usize) -> AppResult<Option<AudioPayload>> {
    while let Some(item) = payload.next().await {
        let mut field: Field = match item {
            Ok(field) => field,
            Err(e) => {
                tracing::debug!("Unreadable multipart body: {}", e);
                return Ok(None);
            }
        };

        let filename = match field.content_disposition() {
            Some(cd) if cd.get_name() == Some(FILE_FIELD) => match cd.get_filename() {
                Some(filename) => filename.to_string(),
                None => continue,
            },
            _ => continue,
        };

        let mut bytes = Vec::new();
        while let Some(chunk) = field.next().await {
            let chunk =
                chunk.map_err(|e| AppError::BadRequest(format!("Upload interrupted: {}", e)))?;
            if bytes.len() + chunk.len() > max_bytes {
                return Err(AppError::BadRequest(format!(
                    "File too large (max {} bytes)",
                    max_bytes
                )));
            }
            bytes.extend_from_slice(&chunk);
        }

        return Ok(Some(AudioPayload { filename, bytes }));
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::fixtures::{tone_wav, SILENT_MP3};
    use crate::config::AppConfig;
    use crate::state::{test_state, test_state_with};
    use actix_web::http::StatusCode;
    use actix_web::{test, App};
    use serde_json::{json, Value};

    const BOUNDARY: &str = "asr-test-boundary";

    /// (field name, optional filename, bytes)
    fn multipart_body(parts: &[(&str, Option<&str>, &[u8])]) -> Vec<u8> {
        let mut body = Vec::new();
        for (name, filename, bytes) in parts {
            body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
            match filename {
                Some(filename) => body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\nContent-Type: audio/mpeg\r\n\r\n",
                        name, filename
                    )
                    .as_bytes(),
                ),
                None => body.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n", name).as_bytes(),
                ),
            }
            body.extend_from_slice(bytes);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
        body
    }

    async fn post(state: AppState, body: Vec<u8>) -> (StatusCode, Value) {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/asr", web::post().to(transcribe)),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/asr")
            .insert_header((
                "content-type",
                format!("multipart/form-data; boundary={}", BOUNDARY),
            ))
            .set_payload(body)
            .to_request();
        let resp = test::call_service(&app, req).await;
        let status = resp.status();
        let body: Value = test::read_body_json(resp).await;
        (status, body)
    }

    #[actix_web::test]
    async fn test_missing_file_field() {
        let body = multipart_body(&[("note", None, b"hello")]);
        let (status, body) = post(test_state(vec![2]), body).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({ "error": "No file provided" }));
    }

    #[actix_web::test]
    async fn test_file_field_without_filename_is_not_an_upload() {
        let body = multipart_body(&[("file", None, b"just text")]);
        let (status, body) = post(test_state(vec![2]), body).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "No file provided");
    }

    #[actix_web::test]
    async fn test_empty_filename() {
        let body = multipart_body(&[("file", Some(""), b"data")]);
        let (status, body) = post(test_state(vec![2]), body).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "No file selected");
    }

    #[actix_web::test]
    async fn test_wrong_extension() {
        let body = multipart_body(&[("file", Some("clip.wav"), &tone_wav(1600))]);
        let (status, body) = post(test_state(vec![2]), body).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "File must be MP3 format");
    }

    #[actix_web::test]
    async fn test_oversized_upload_rejected() {
        let mut config = AppConfig::default();
        config.audio.max_upload_bytes = 1000;
        let body = multipart_body(&[("file", Some("clip.mp3"), &[7u8; 4096])]);

        let (status, body) = post(test_state_with(config, vec![2]), body).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "File too large (max 1000 bytes)");
    }

    #[actix_web::test]
    async fn test_undecodable_audio_is_server_error() {
        let body = multipart_body(&[("file", Some("clip.mp3"), b"this is not audio at all")]);
        let (status, body) = post(test_state(vec![2]), body).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!body["error"].as_str().unwrap().is_empty());
    }

    #[actix_web::test]
    async fn test_successful_transcription() {
        let clip = tone_wav(8000);
        let body = multipart_body(&[("other", None, b"x"), ("file", Some("Clip.MP3"), &clip)]);
        let (status, body) = post(test_state(vec![2, 0]), body).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "transcription": "AAAA", "duration": "0.5" }));
    }

    #[actix_web::test]
    async fn test_mp3_upload_round_trip() {
        // 0.6s of 48kHz audio becomes 9600 samples, 9 scripted frames
        let body = multipart_body(&[("file", Some("sample-000000.mp3"), SILENT_MP3)]);
        let (status, body) = post(test_state(vec![2, 0, 3, 0]), body).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "transcription": "ABABA", "duration": "0.6" }));
    }
}
