//! Persistence backends for registrations.
//!
//! The controller only sees [`PersistenceGateway`]; which backend sits behind
//! it is decided once at startup.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::err::PersistenceError;
use crate::ident::StudentIdentifier;
use crate::io::{read_io_file, write_io_file, PhotoStore, StoredPhoto};
use crate::models::{RegistrationInput, RegistrationRow};

/// Everything a backend needs to store one registration.
#[derive(Debug, Clone)]
pub struct Submission<'a> {
    pub student_id: &'a StudentIdentifier,
    pub input: &'a RegistrationInput,
    pub registered_at: DateTime<Utc>,
}

impl Submission<'_> {
    fn row(&self, photo: Option<&StoredPhoto>) -> RegistrationRow {
        let input = self.input;
        let whatsapp = Some(input.whatsapp.trim().to_string()).filter(|w| !w.is_empty());
        RegistrationRow {
            student_id: self.student_id.to_string(),
            full_name: input.full_name.clone(),
            father_name: input.father_name.clone(),
            email: input.email.clone(),
            phone: input.phone.clone(),
            whatsapp,
            cnic: input.cnic.clone(),
            date_of_birth: input.date_of_birth.clone(),
            gender: input.gender.map(|g| g.as_str()).unwrap_or_default().to_string(),
            address: input.address.clone(),
            course: input.course.clone(),
            photo_url: photo.map(|p| p.url.clone()),
            photo_sha256: photo.map(|p| p.sha256.clone()),
            registered_at: self.registered_at,
        }
    }
}

/// Acknowledgement of a stored registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub student_id: StudentIdentifier,
    /// Set when the backend kept the photo somewhere it can be fetched from.
    pub photo_url: Option<String>,
}

#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    async fn save(&self, submission: Submission<'_>) -> Result<Ack, PersistenceError>;

    async fn find(&self, id: &StudentIdentifier) -> Result<Option<RegistrationRow>, PersistenceError>;
}

const CREATE_REGISTRATIONS: &str = "CREATE TABLE IF NOT EXISTS registrations (
    student_id TEXT PRIMARY KEY,
    full_name TEXT NOT NULL,
    father_name TEXT NOT NULL,
    email TEXT NOT NULL,
    phone TEXT NOT NULL,
    whatsapp TEXT,
    cnic TEXT NOT NULL,
    date_of_birth TEXT NOT NULL,
    gender TEXT NOT NULL,
    address TEXT NOT NULL,
    course TEXT NOT NULL,
    photo_url TEXT,
    photo_sha256 TEXT,
    registered_at TIMESTAMPTZ NOT NULL
)";

/// `registrations` table in Postgres, photos in a [`PhotoStore`].
pub struct PgGateway {
    pool: PgPool,
    photos: PhotoStore,
}

impl PgGateway {
    pub async fn connect(url: &str, photos: PhotoStore) -> anyhow::Result<Self> {
        let pool = PgPool::connect(url).await?;
        sqlx::query(CREATE_REGISTRATIONS).execute(&pool).await?;
        Ok(Self { pool, photos })
    }
}

#[async_trait]
impl PersistenceGateway for PgGateway {
    async fn save(&self, submission: Submission<'_>) -> Result<Ack, PersistenceError> {
        let photo = match &submission.input.photo {
            Some(photo) => Some(self.photos.upload(submission.student_id, photo).await?),
            None => None,
        };
        let row = submission.row(photo.as_ref());

        let res = sqlx::query(
            "INSERT INTO registrations VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
        )
        .bind(&row.student_id)
        .bind(&row.full_name)
        .bind(&row.father_name)
        .bind(&row.email)
        .bind(&row.phone)
        .bind(&row.whatsapp)
        .bind(&row.cnic)
        .bind(&row.date_of_birth)
        .bind(&row.gender)
        .bind(&row.address)
        .bind(&row.course)
        .bind(&row.photo_url)
        .bind(&row.photo_sha256)
        .bind(row.registered_at)
        .execute(&self.pool)
        .await?;

        if res.rows_affected() < 1 {
            return Err(PersistenceError::new("Could not save data to database!"));
        }
        Ok(Ack {
            student_id: submission.student_id.clone(),
            photo_url: row.photo_url,
        })
    }

    async fn find(&self, id: &StudentIdentifier) -> Result<Option<RegistrationRow>, PersistenceError> {
        let row = sqlx::query_as::<_, RegistrationRow>(
            "SELECT * FROM registrations WHERE student_id = $1 LIMIT 1",
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }
}

/// One postcard-encoded `.dat` file per student under `<root>/students`,
/// photos under `<root>/photos`.
pub struct FileGateway {
    root: PathBuf,
    photos: PhotoStore,
}

impl FileGateway {
    pub fn new<P: Into<PathBuf>>(root: P, photos: PhotoStore) -> Self {
        Self {
            root: root.into(),
            photos,
        }
    }

    fn record_path(&self, id: &StudentIdentifier) -> PathBuf {
        self.root.join("students").join(format!("{}.dat", id))
    }
}

#[async_trait]
impl PersistenceGateway for FileGateway {
    async fn save(&self, submission: Submission<'_>) -> Result<Ack, PersistenceError> {
        let path = self.record_path(submission.student_id);
        if path.exists() {
            return Err(PersistenceError::new(format!(
                "student {} is already registered",
                submission.student_id
            )));
        }
        let photo = match &submission.input.photo {
            Some(photo) => Some(self.photos.upload(submission.student_id, photo).await?),
            None => None,
        };
        let row = submission.row(photo.as_ref());
        let bytes = postcard::to_allocvec(&row)?;
        write_io_file(path, &bytes).await?;
        Ok(Ack {
            student_id: submission.student_id.clone(),
            photo_url: row.photo_url,
        })
    }

    async fn find(&self, id: &StudentIdentifier) -> Result<Option<RegistrationRow>, PersistenceError> {
        let path = self.record_path(id);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = read_io_file(path).await?;
        Ok(Some(postcard::from_bytes::<RegistrationRow>(&bytes)?))
    }
}

/// Keeps rows in a map and never stores photos, so callers fall back to a
/// `data:` preview. Used for local runs and tests.
#[derive(Default)]
pub struct MemoryGateway {
    rows: Mutex<HashMap<StudentIdentifier, RegistrationRow>>,
    fail_with: Mutex<Option<String>>,
    saves: AtomicUsize,
    hold: AtomicBool,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every following save fail with `message`.
    pub fn set_failure<S: Into<String>>(&self, message: Option<S>) {
        if let Ok(mut fail) = self.fail_with.lock() {
            *fail = message.map(Into::into);
        }
    }

    /// While set, saves wait (yielding) until released. Lets tests observe
    /// a submission mid-flight.
    pub fn set_hold(&self, hold: bool) {
        self.hold.store(hold, Ordering::SeqCst);
    }

    /// Number of save attempts, failed ones included.
    pub fn save_calls(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.rows.lock().map(|rows| rows.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl PersistenceGateway for MemoryGateway {
    async fn save(&self, submission: Submission<'_>) -> Result<Ack, PersistenceError> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        while self.hold.load(Ordering::SeqCst) {
            tokio::task::yield_now().await;
        }
        if let Some(message) = self
            .fail_with
            .lock()
            .map_err(|_| PersistenceError::new("gateway lock poisoned"))?
            .clone()
        {
            return Err(PersistenceError::new(message));
        }
        let row = submission.row(None);
        let mut rows = self
            .rows
            .lock()
            .map_err(|_| PersistenceError::new("gateway lock poisoned"))?;
        if rows.contains_key(submission.student_id) {
            return Err(PersistenceError::new(format!(
                "student {} is already registered",
                submission.student_id
            )));
        }
        rows.insert(submission.student_id.clone(), row);
        Ok(Ack {
            student_id: submission.student_id.clone(),
            photo_url: None,
        })
    }

    async fn find(&self, id: &StudentIdentifier) -> Result<Option<RegistrationRow>, PersistenceError> {
        let rows = self
            .rows
            .lock()
            .map_err(|_| PersistenceError::new("gateway lock poisoned"))?;
        Ok(rows.get(id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Gender, Photo};

    fn input() -> RegistrationInput {
        RegistrationInput {
            full_name: "Ali Khan".into(),
            father_name: "Imran Khan".into(),
            email: "ali@example.com".into(),
            phone: "+92-300-1234567".into(),
            whatsapp: "  ".into(),
            cnic: "12345-6789012-3".into(),
            date_of_birth: "2001-02-03".into(),
            gender: Some(Gender::Male),
            address: "Gulshan e Iqbal, Karachi".into(),
            course: "Tajweed & Qirat".into(),
            photo: Some(Photo::new(vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A])),
        }
    }

    #[tokio::test]
    async fn file_gateway_round_trips_and_uploads_photo() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = FileGateway::new(dir.path(), PhotoStore::new(dir.path().join("photos"), "/photos"));
        let id: StudentIdentifier = "FQ654321".parse().unwrap();
        let input = input();

        let ack = gateway
            .save(Submission {
                student_id: &id,
                input: &input,
                registered_at: Utc::now(),
            })
            .await
            .unwrap();
        assert_eq!(ack.photo_url.as_deref(), Some("/photos/FQ654321.png"));

        let row = gateway.find(&id).await.unwrap().unwrap();
        assert_eq!(row.student_id, "FQ654321");
        assert_eq!(row.gender, "male");
        assert_eq!(row.whatsapp, None);
        assert!(row.photo_sha256.is_some());
    }

    #[tokio::test]
    async fn file_gateway_rejects_duplicate_ids() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = FileGateway::new(dir.path(), PhotoStore::new(dir.path().join("photos"), "/photos"));
        let id: StudentIdentifier = "FQ000001".parse().unwrap();
        let input = input();
        let submission = Submission {
            student_id: &id,
            input: &input,
            registered_at: Utc::now(),
        };
        gateway.save(submission.clone()).await.unwrap();
        assert!(gateway.save(submission).await.is_err());
    }

    #[tokio::test]
    async fn memory_gateway_simulates_failures() {
        let gateway = MemoryGateway::new();
        gateway.set_failure(Some("network down"));
        let id: StudentIdentifier = "FQ000002".parse().unwrap();
        let input = input();
        let err = gateway
            .save(Submission {
                student_id: &id,
                input: &input,
                registered_at: Utc::now(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.message, "network down");
        assert_eq!(gateway.save_calls(), 1);
        assert!(gateway.is_empty());
    }
}
