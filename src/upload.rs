//! `POST /upload_game`: quota gate, form validation, and relay to the publish API.

use crate::app::{client_address, AppState};
use crate::publish::{PublishRequest, PublishResponse};
use axum::{
    body::Bytes,
    extract::{
        multipart::{MultipartError, MultipartRejection},
        ConnectInfo, Multipart, State,
    },
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use chrono::Utc;
use std::net::SocketAddr;
use thiserror::Error;
use tracing::{error, info, warn};

pub const PLACE_FILE_EXTENSION: &str = ".rbxl";

const MSG_MISSING_FIELDS: &str = "Thiếu thông tin bắt buộc.";
const MSG_BAD_IDS: &str = "universe_id và place_id phải là số nguyên dương.";
const MSG_BAD_FILE: &str = "File không hợp lệ. Vui lòng tải lên file .rbxl.";

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("Vui lòng đợi thêm {0} giây trước khi tải lên tiếp theo.")]
    CooldownActive(i64),
    #[error("Bạn đã sử dụng hết MT Token hôm nay.")]
    QuotaExhausted,
    #[error("{0}")]
    InvalidRequest(&'static str),
    #[error("Dữ liệu biểu mẫu không hợp lệ: {0}")]
    MalformedForm(#[from] MultipartError),
    #[error("Tải lên thất bại: {status} - {body}")]
    Upstream { status: u16, body: String },
    #[error("Lỗi trong quá trình tải lên: {0:#}")]
    Transport(anyhow::Error),
}

impl UploadError {
    pub fn status(&self) -> StatusCode {
        match self {
            UploadError::CooldownActive(_) => StatusCode::TOO_MANY_REQUESTS,
            UploadError::QuotaExhausted => StatusCode::FORBIDDEN,
            UploadError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            UploadError::MalformedForm(e) => e.status(),
            UploadError::Upstream { status, .. } => upstream_status(*status),
            UploadError::Transport(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for UploadError {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut response = (status, self.to_string()).into_response();
        if let UploadError::CooldownActive(wait) = self {
            if let Ok(value) = HeaderValue::from_str(&wait.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

fn upstream_status(status: u16) -> StatusCode {
    StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY)
}

/// Form fields exactly as submitted; nothing has been checked yet.
#[derive(Debug, Default)]
pub struct RawUploadForm {
    pub api_key: Option<String>,
    pub universe_id: Option<String>,
    pub place_id: Option<String>,
    pub file_name: Option<String>,
    pub file: Option<Bytes>,
}

#[derive(Debug, Clone)]
pub struct UploadForm {
    pub api_key: String,
    pub universe_id: u64,
    pub place_id: u64,
    pub file_name: String,
    pub file: Bytes,
}

impl RawUploadForm {
    pub async fn from_multipart(mut multipart: Multipart) -> Result<Self, UploadError> {
        let mut form = RawUploadForm::default();
        while let Some(field) = multipart.next_field().await? {
            let name = field.name().unwrap_or_default().to_string();
            match name.as_str() {
                "apikey" => form.api_key = Some(field.text().await?),
                "universe_id" => form.universe_id = Some(field.text().await?),
                "place_id" => form.place_id = Some(field.text().await?),
                "file" => {
                    form.file_name = field.file_name().map(str::to_string);
                    form.file = Some(field.bytes().await?);
                }
                _ => {}
            }
        }
        Ok(form)
    }

    pub fn validate(self) -> Result<UploadForm, UploadError> {
        let present = |v: Option<String>| v.filter(|s| !s.is_empty());
        let (Some(api_key), Some(universe_id), Some(place_id), Some(file_name), Some(file)) = (
            present(self.api_key),
            present(self.universe_id),
            present(self.place_id),
            present(self.file_name),
            self.file,
        ) else {
            return Err(UploadError::InvalidRequest(MSG_MISSING_FIELDS));
        };

        let (Some(universe_id), Some(place_id)) = (parse_id(&universe_id), parse_id(&place_id))
        else {
            return Err(UploadError::InvalidRequest(MSG_BAD_IDS));
        };

        if !file_name.ends_with(PLACE_FILE_EXTENSION) {
            return Err(UploadError::InvalidRequest(MSG_BAD_FILE));
        }

        Ok(UploadForm {
            api_key,
            universe_id,
            place_id,
            file_name,
            file,
        })
    }
}

fn parse_id(raw: &str) -> Option<u64> {
    raw.trim().parse::<u64>().ok().filter(|id| *id > 0)
}

pub async fn upload_game(
    State(state): State<AppState>,
    headers: HeaderMap,
    connect: Option<ConnectInfo<SocketAddr>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<(StatusCode, String), UploadError> {
    let ip = client_address(&headers, connect.as_ref(), state.trust_proxy_headers);
    let now = Utc::now();

    if let Err(rejection) = state.quotas.check_eligibility(&ip, now).await {
        warn!("Upload from {} rejected: {}", ip, rejection);
        return Err(rejection);
    }

    let multipart = match multipart {
        Ok(multipart) => multipart,
        Err(rejection) => {
            warn!("Upload from {} is not a multipart form: {}", ip, rejection);
            return Err(UploadError::InvalidRequest(MSG_MISSING_FIELDS));
        }
    };

    let form = match RawUploadForm::from_multipart(multipart)
        .await
        .and_then(RawUploadForm::validate)
    {
        Ok(form) => form,
        Err(e) => {
            warn!("Invalid upload form from {}: {}", ip, e);
            return Err(e);
        }
    };

    info!(
        "Relaying '{}' ({} bytes) from {} to universe {} place {}",
        form.file_name,
        form.file.len(),
        ip,
        form.universe_id,
        form.place_id
    );
    let result = state
        .publisher
        .publish_place(PublishRequest {
            api_key: form.api_key,
            universe_id: form.universe_id,
            place_id: form.place_id,
            place_file: form.file,
        })
        .await;

    // Charged whether or not the publish API accepted the file.
    state.quotas.record_upload(&ip, now).await;

    match result {
        Ok(response) if response.is_success() => {
            info!("Upload successful for {}", ip);
            Ok((
                upstream_status(response.status),
                format!("Tải lên thành công: {}", response.body),
            ))
        }
        Ok(PublishResponse { status, body }) => {
            warn!("Upload failed with status {}: {}", status, body);
            Err(UploadError::Upstream { status, body })
        }
        Err(e) => {
            error!("Error during upload: {:#}", e);
            Err(UploadError::Transport(e))
        }
    }
}
