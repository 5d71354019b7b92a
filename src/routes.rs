use std::sync::Arc;

use axum::extract::multipart::Field;
use axum::extract::{Multipart, Path};
use axum::handler::Handler;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Router};
use serde::Serialize;
use tokio::sync::Mutex;
use tower::ServiceBuilder;

use crate::card::{CardCache, CardView};
use crate::err::{self, Error};
use crate::export::DocumentExporter;
use crate::gateway::PersistenceGateway;
use crate::ident::StudentIdentifier;
use crate::io::PhotoStore;
use crate::models::{Course, Photo, StudentRecord, COURSES, MAX_PHOTO_BYTES};
use crate::qr::CodeOptions;
use crate::registration::RegistrationSession;
use crate::relay::Notifier;
use crate::{breaks, proceeds, Payload};

pub struct AppState {
    pub gateway: Arc<dyn PersistenceGateway>,
    pub notifier: Option<Arc<dyn Notifier>>,
    pub photos: PhotoStore,
    pub photo_base_url: String,
    pub exporter: DocumentExporter,
    pub code_options: CodeOptions,
    pub cards: Mutex<CardCache>,
}

/// Longest accepted text field, in bytes.
const TEXT_FIELD_LIMIT: usize = 4 * 1024;

/// Reads at most `limit + 1` bytes of a field. Whatever is left is skipped
/// by the multipart reader without being buffered.
async fn read_capped(field: &mut Field<'_>, limit: usize) -> Result<Vec<u8>, Error> {
    let mut buf = Vec::new();
    while let Some(chunk) = field.chunk().await? {
        let room = limit + 1 - buf.len();
        buf.extend_from_slice(&chunk[..chunk.len().min(room)]);
        if buf.len() > limit {
            break;
        }
    }
    Ok(buf)
}

pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/courses", get(list_courses))
        .route("/registrations", post(register))
        .route("/registrations/:student_id", get(read_registration))
        .route("/registrations/:student_id/card.svg", get(card_svg))
        .route("/registrations/:student_id/card.pdf", get(card_pdf))
        .route("/photos/:file", get(read_photo))
        .fallback(err::handler404.into_service())
        .layer(ServiceBuilder::new().layer(Extension(state)))
}

#[derive(Debug, Clone, Serialize)]
pub struct CourseList {
    courses: Vec<Course>,
}

async fn list_courses() -> Payload<CourseList> {
    proceeds(CourseList {
        courses: COURSES.clone(),
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct Registered {
    student: StudentRecord,
    card_svg: String,
    card_pdf: String,
}

async fn register(
    Extension(state): Extension<Arc<AppState>>,
    mut multipart: Multipart,
) -> Payload<Registered> {
    let session = RegistrationSession::new(state.gateway.clone(), state.notifier.clone());

    while let Some(mut field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        if name == "photo" {
            let file_name = field.file_name().map(|f| f.to_string());
            let content_type = field.content_type().map(|m| m.to_string());
            // An oversized photo keeps one byte past the limit, enough for
            // validation to refuse it.
            let bytes = read_capped(&mut field, MAX_PHOTO_BYTES).await?;
            if !bytes.is_empty() {
                session.set_photo(Photo {
                    bytes,
                    file_name,
                    content_type,
                });
            }
        } else {
            let bytes = read_capped(&mut field, TEXT_FIELD_LIMIT).await?;
            if bytes.len() > TEXT_FIELD_LIMIT {
                return Err(Error::InvalidPayload {
                    message: format!("field `{}` is longer than {} bytes", name, TEXT_FIELD_LIMIT),
                });
            }
            let value = String::from_utf8(bytes).map_err(|_| Error::InvalidPayload {
                message: format!("field `{}` is not valid UTF-8", name),
            })?;
            if !session.set_field(&name, value) {
                log::debug!("ignoring form field `{}`", name);
            }
        }
    }

    let record = match session.submit().await {
        Ok(record) => record,
        Err(err) => return breaks(err.into()),
    };

    if let Some(view) = session.card_view(state.code_options) {
        state
            .cards
            .lock()
            .await
            .insert(record.student_id.clone(), view);
    }

    proceeds(Registered {
        card_svg: format!("/registrations/{}/card.svg", record.student_id),
        card_pdf: format!("/registrations/{}/card.pdf", record.student_id),
        student: record,
    })
}

/// Cached card, or one rebuilt from the stored row (after a restart).
async fn card_for(state: &AppState, id: &StudentIdentifier) -> Result<CardView, Error> {
    if let Some(view) = state.cards.lock().await.get(id) {
        return Ok(view);
    }

    let row = state.gateway.find(id).await?.ok_or_else(|| Error::NotFound {
        message: format!("Student `{}` is not registered", id),
    })?;
    let record = StudentRecord::try_from(row)?;

    let photo = match record.photo_url.strip_prefix(&format!("{}/", state.photo_base_url)) {
        Some(file) => match state.photos.read(file).await {
            Ok(bytes) => Some(Photo::new(bytes)),
            Err(err) => {
                log::warn!("photo of {} unavailable: {}", id, err);
                None
            }
        },
        None => None,
    };

    let view = CardView::spawn(record, photo.as_ref(), state.code_options);
    state.cards.lock().await.insert(id.clone(), view.clone());
    Ok(view)
}

async fn read_registration(
    Path(student_id): Path<String>,
    Extension(state): Extension<Arc<AppState>>,
) -> Payload<StudentRecord> {
    let id: StudentIdentifier = student_id.parse()?;
    let view = card_for(&state, &id).await?;
    proceeds(view.record().clone())
}

async fn card_svg(
    Path(student_id): Path<String>,
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Response, Error> {
    let id: StudentIdentifier = student_id.parse()?;
    let view = card_for(&state, &id).await?;
    let document = match view.ready(state.exporter.wait()).await {
        Ok(document) => document,
        Err(_) => view.current(),
    };
    Ok((
        [(header::CONTENT_TYPE, "image/svg+xml")],
        document.to_svg(),
    )
        .into_response())
}

async fn card_pdf(
    Path(student_id): Path<String>,
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Response, Error> {
    let id: StudentIdentifier = student_id.parse()?;
    let view = card_for(&state, &id).await?;
    let exported = state.exporter.export(&view).await?;
    Ok((
        [
            (header::CONTENT_TYPE, "application/pdf".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", exported.file_name),
            ),
        ],
        exported.bytes,
    )
        .into_response())
}

async fn read_photo(
    Path(file): Path<String>,
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Response, Error> {
    let bytes = state.photos.read(&file).await.map_err(|err| Error::NotFound {
        message: err.to_string(),
    })?;
    let photo = Photo::new(bytes);
    Ok(([(header::CONTENT_TYPE, photo.mime())], photo.bytes).into_response())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::Value;
    use tower::ServiceExt;

    use super::*;
    use crate::gateway::MemoryGateway;

    const BOUNDARY: &str = "fq-test-boundary";

    fn state_with(
        gateway: Arc<MemoryGateway>,
        photos: &std::path::Path,
        cache_size: usize,
    ) -> Arc<AppState> {
        Arc::new(AppState {
            gateway,
            notifier: None,
            photos: PhotoStore::new(photos, "/photos"),
            photo_base_url: "/photos".into(),
            exporter: DocumentExporter::new(2.0, Duration::from_secs(3)),
            code_options: CodeOptions::default(),
            cards: Mutex::new(CardCache::new(cache_size)),
        })
    }

    fn state(gateway: Arc<MemoryGateway>, photos: &std::path::Path) -> Arc<AppState> {
        state_with(gateway, photos, 8)
    }

    fn multipart(fields: &[(&str, &str)], photo: Option<&[u8]>) -> Vec<u8> {
        let mut body = Vec::new();
        for (name, value) in fields {
            body.extend_from_slice(
                format!(
                    "--{}\r\nContent-Disposition: form-data; name=\"{}\"\r\n\r\n{}\r\n",
                    BOUNDARY, name, value
                )
                .as_bytes(),
            );
        }
        if let Some(bytes) = photo {
            body.extend_from_slice(
                format!(
                    "--{}\r\nContent-Disposition: form-data; name=\"photo\"; filename=\"me.jpg\"\r\nContent-Type: image/jpeg\r\n\r\n",
                    BOUNDARY
                )
                .as_bytes(),
            );
            body.extend_from_slice(bytes);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
        body
    }

    fn photo() -> Vec<u8> {
        crate::qr::encode_blocking("portrait", &CodeOptions::default()).unwrap().png
    }

    fn complete_form() -> Vec<(&'static str, &'static str)> {
        vec![
            ("fullName", "Ali Khan"),
            ("fatherName", "Imran Khan"),
            ("email", "ali@example.com"),
            ("phone", "03001234567"),
            ("whatsapp", ""),
            ("cnic", "35202-1234567-1"),
            ("dateOfBirth", "2001-04-12"),
            ("gender", "male"),
            ("address", "Street 4, Lahore"),
            ("course", "Tajweed & Qirat"),
        ]
    }

    fn post(body: Vec<u8>) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/registrations")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={}", BOUNDARY),
            )
            .body(Body::from(body))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn json(response: Response) -> Value {
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn lists_courses() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(state(Arc::new(MemoryGateway::new()), dir.path()));

        let response = app.oneshot(get("/courses")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["courses"].as_array().unwrap().len(), COURSES.len());
    }

    #[tokio::test]
    async fn registers_and_serves_card() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = Arc::new(MemoryGateway::new());
        let state = state(gateway.clone(), dir.path());

        let response = app(state.clone())
            .oneshot(post(multipart(&complete_form(), Some(&photo()))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json(response).await;
        assert_eq!(body["success"], true);
        let id = body["student"]["student_id"].as_str().unwrap().to_string();
        assert!(id.starts_with("FQ"));
        assert_eq!(body["student"]["whatsapp"], Value::Null);
        assert_eq!(gateway.len(), 1);

        let response = app(state.clone())
            .oneshot(get(&format!("/registrations/{}", id)))
            .await
            .unwrap();
        assert_eq!(json(response).await["full_name"], "Ali Khan");

        let response = app(state.clone())
            .oneshot(get(&format!("/registrations/{}/card.svg", id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        let svg = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(svg.contains(&id));
        assert!(svg.contains("data:image/png;base64,"));

        let response = app(state)
            .oneshot(get(&format!("/registrations/{}/card.pdf", id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let disposition = response.headers()[header::CONTENT_DISPOSITION].to_str().unwrap().to_string();
        assert!(disposition.contains(&format!("{}-ali-khan.pdf", id)));
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        assert!(bytes.starts_with(b"%PDF"));
    }

    #[tokio::test]
    async fn missing_field_is_reported_without_saving() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = Arc::new(MemoryGateway::new());
        let mut form = complete_form();
        form.retain(|(name, _)| *name != "cnic");

        let response = app(state(gateway.clone(), dir.path()))
            .oneshot(post(multipart(&form, Some(&photo()))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body = json(response).await;
        assert_eq!(body["error"], "ValidationFailed");
        assert_eq!(body["field"], "cnic");
        assert_eq!(gateway.save_calls(), 0);
    }

    #[tokio::test]
    async fn failed_save_is_a_bad_gateway() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = Arc::new(MemoryGateway::new());
        gateway.set_failure(Some("database offline"));

        let response = app(state(gateway, dir.path()))
            .oneshot(post(multipart(&complete_form(), Some(&photo()))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(json(response).await["error"], "PersistenceFailed");
    }

    #[tokio::test]
    async fn unknown_student_and_paths_are_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(Arc::new(MemoryGateway::new()), dir.path());

        let response = app(state.clone()).oneshot(get("/registrations/FQ000001")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app(state.clone()).oneshot(get("/registrations/nonsense")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app(state).oneshot(get("/nowhere")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(json(response).await["error"], "NotFound");
    }

    #[tokio::test]
    async fn partial_form_is_unprocessable() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = Arc::new(MemoryGateway::new());

        let response = app(state(gateway.clone(), dir.path()))
            .oneshot(post(multipart(&[("fullName", "Ali Khan")], None)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body = json(response).await;
        assert_eq!(body["field"], "fatherName");
        assert_eq!(gateway.save_calls(), 0);
    }

    #[tokio::test]
    async fn oversized_upload_is_cut_off_and_refused() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = Arc::new(MemoryGateway::new());
        let huge = vec![0u8; MAX_PHOTO_BYTES + 64 * 1024];

        let response = app(state(gateway.clone(), dir.path()))
            .oneshot(post(multipart(&complete_form(), Some(&huge))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body = json(response).await;
        assert_eq!(body["field"], "photo");
        assert!(body["message"]
            .as_str()
            .unwrap()
            .starts_with(&format!("photo too large: {} bytes", MAX_PHOTO_BYTES + 1)));
        assert_eq!(gateway.save_calls(), 0);
    }

    #[tokio::test]
    async fn overlong_text_field_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = Arc::new(MemoryGateway::new());
        let long = "a".repeat(TEXT_FIELD_LIMIT + 1);
        let mut form: Vec<(&str, &str)> = complete_form();
        form[0] = ("fullName", long.as_str());

        let response = app(state(gateway.clone(), dir.path()))
            .oneshot(post(multipart(&form, Some(&photo()))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(json(response).await["error"], "InvalidPayload");
        assert_eq!(gateway.save_calls(), 0);
    }

    #[tokio::test]
    async fn evicted_cards_are_rebuilt_from_storage() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = Arc::new(MemoryGateway::new());
        let state = state_with(gateway.clone(), dir.path(), 1);

        let mut ids = Vec::new();
        for _ in 0..2 {
            let response = app(state.clone())
                .oneshot(post(multipart(&complete_form(), Some(&photo()))))
                .await
                .unwrap();
            let body = json(response).await;
            ids.push(body["student"]["student_id"].as_str().unwrap().to_string());
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert_eq!(state.cards.lock().await.len(), 1);

        let response = app(state.clone())
            .oneshot(get(&format!("/registrations/{}", ids[0])))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json(response).await["student_id"], ids[0].as_str());
        assert_eq!(state.cards.lock().await.len(), 1);
    }
}
