use axum::body::Bytes;
use axum::extract::Multipart;

use super::AppError;
use crate::image_io::{has_allowed_extension, ALLOWED_EXTENSIONS};

const IMAGE_FIELD: &str = "image";
const ENHANCEMENT_FIELD: &str = "enhancement";
const FACTOR_FIELD: &str = "factor";
const DEFAULT_FACTOR: i64 = 1;

/// Fields of a `POST /api/enhance` form after validation.
#[derive(Debug)]
pub(super) struct EnhanceForm {
    pub filename: String,
    pub image: Bytes,
    pub enhancement: String,
    pub factor: i64,
}

pub(super) async fn read_enhance_form(multipart: &mut Multipart) -> Result<EnhanceForm, AppError> {
    let mut image: Option<(String, Bytes)> = None;
    let mut enhancement: Option<String> = None;
    let mut factor: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::BadRequest(format!("invalid multipart body: {e}")))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            IMAGE_FIELD => {
                let filename = field.file_name().unwrap_or_default().to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| AppError::BadRequest(format!("failed to read upload: {e}")))?;
                image = Some((filename, bytes));
            }
            ENHANCEMENT_FIELD => enhancement = Some(read_text(field).await?),
            FACTOR_FIELD => factor = Some(read_text(field).await?),
            _ => {}
        }
    }

    let (filename, image) = image.ok_or_else(|| AppError::BadRequest("no image uploaded".into()))?;
    if filename.trim().is_empty() || image.is_empty() {
        return Err(AppError::BadRequest("no image selected".into()));
    }
    if !has_allowed_extension(&filename) {
        return Err(AppError::BadRequest(format!(
            "unsupported file type: {filename} (allowed: {})",
            ALLOWED_EXTENSIONS.join(", ")
        )));
    }

    let enhancement = enhancement
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| AppError::BadRequest("missing enhancement selector".into()))?;

    Ok(EnhanceForm {
        filename,
        image,
        enhancement,
        factor: parse_factor(factor.as_deref())?,
    })
}

async fn read_text(field: axum::extract::multipart::Field<'_>) -> Result<String, AppError> {
    field
        .text()
        .await
        .map_err(|e| AppError::BadRequest(format!("invalid form field: {e}")))
}

/// Absent or blank means the default; anything else must be an integer.
fn parse_factor(raw: Option<&str>) -> Result<i64, AppError> {
    match raw.map(str::trim) {
        None | Some("") => Ok(DEFAULT_FACTOR),
        Some(value) => value
            .parse()
            .map_err(|_| AppError::BadRequest(format!("factor must be an integer, got {value:?}"))),
    }
}
