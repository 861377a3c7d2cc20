//! Document intake.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::api::error::ApiError;
use crate::api::types::ApiContext;
use crate::db::{self, IntakeSummary};
use crate::models::{Document, EmailHeaders};

/// An already-parsed email. `content_hash`, when supplied, must match the body.
#[derive(Debug, Deserialize)]
pub struct DocumentInput {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub headers: EmailHeaders,
    #[serde(default)]
    pub content_hash: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct IntakeRequest {
    pub documents: Vec<DocumentInput>,
}

#[derive(Debug, Serialize)]
pub struct IntakeResponse {
    #[serde(flatten)]
    pub summary: IntakeSummary,
    pub total_documents: u64,
}

/// `POST /api/documents`
pub async fn ingest(
    State(ctx): State<ApiContext>,
    Json(req): Json<IntakeRequest>,
) -> Result<(StatusCode, Json<IntakeResponse>), ApiError> {
    let mut docs = Vec::with_capacity(req.documents.len());
    for input in req.documents {
        if input.id.trim().is_empty() {
            return Err(ApiError::BadRequest("document id must not be empty".into()));
        }
        let doc = Document::from_text(input.id, input.text, input.headers);
        if let Some(claimed) = input.content_hash {
            if !claimed.eq_ignore_ascii_case(&doc.content_hash) {
                return Err(ApiError::BadRequest(format!(
                    "content_hash of document {} does not match its text",
                    doc.id
                )));
            }
        }
        docs.push(doc);
    }

    let (summary, total_documents) = ctx.core.db().with_conn(|conn| {
        let summary = db::insert_documents(conn, &docs)?;
        Ok::<_, db::DatabaseError>((summary, db::count_documents(conn)?))
    })?;

    tracing::info!(
        inserted = summary.inserted,
        already_present = summary.already_present,
        duplicate_content = summary.duplicate_content,
        "Documents ingested"
    );
    Ok((
        StatusCode::CREATED,
        Json(IntakeResponse {
            summary,
            total_documents,
        }),
    ))
}
