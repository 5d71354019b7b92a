//! One user's pass through the registration form.
//!
//! A session moves `Editing -> Submitting -> Submitted | Failed`. A failed
//! save leaves the session in `Failed` and no card is produced; the user can
//! submit again from there. `Submitted` is final.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use uuid::Uuid;

use crate::card::{photo_data_uri, CardView};
use crate::err::{SubmitError, ValidationError};
use crate::gateway::{PersistenceGateway, Submission};
use crate::ident::StudentIdentifier;
use crate::models::{is_known_course, Photo, RegistrationInput, StudentRecord, MAX_PHOTO_BYTES};
use crate::qr::CodeOptions;
use crate::relay::Notifier;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Editing,
    Submitting,
    Submitted(StudentRecord),
    Failed(SubmitError),
}

/// Checks run in form order; the first failure is the only one reported.
pub fn validate(input: &RegistrationInput) -> Result<(), ValidationError> {
    let required: [(&'static str, &str); 6] = [
        ("fullName", &input.full_name),
        ("fatherName", &input.father_name),
        ("email", &input.email),
        ("phone", &input.phone),
        ("cnic", &input.cnic),
        ("dateOfBirth", &input.date_of_birth),
    ];
    for (field, value) in required {
        if value.trim().is_empty() {
            return Err(ValidationError::MissingField(field));
        }
    }
    if input.gender.is_none() {
        return Err(ValidationError::MissingField("gender"));
    }
    if input.address.trim().is_empty() {
        return Err(ValidationError::MissingField("address"));
    }
    if input.course.trim().is_empty() {
        return Err(ValidationError::MissingField("course"));
    }
    if !is_known_course(&input.course) {
        return Err(ValidationError::UnknownCourse(input.course.clone()));
    }
    match &input.photo {
        None => Err(ValidationError::MissingPhoto),
        Some(photo) if photo.is_empty() => Err(ValidationError::MissingPhoto),
        Some(photo) if photo.len() > MAX_PHOTO_BYTES => Err(ValidationError::PhotoTooLarge {
            size: photo.len(),
            limit: MAX_PHOTO_BYTES,
        }),
        Some(_) => Ok(()),
    }
}

pub struct RegistrationSession {
    id: Uuid,
    gateway: Arc<dyn PersistenceGateway>,
    notifier: Option<Arc<dyn Notifier>>,
    input: Mutex<RegistrationInput>,
    state: Mutex<SessionState>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl RegistrationSession {
    pub fn new(gateway: Arc<dyn PersistenceGateway>, notifier: Option<Arc<dyn Notifier>>) -> Self {
        Self {
            id: Uuid::new_v4(),
            gateway,
            notifier,
            input: Mutex::new(RegistrationInput::default()),
            state: Mutex::new(SessionState::Editing),
        }
    }

    pub fn state(&self) -> SessionState {
        lock(&self.state).clone()
    }

    /// Replaces the whole form. Ignored once the session has a card.
    #[cfg(test)]
    pub fn fill(&self, input: RegistrationInput) -> bool {
        self.edit(|current| *current = input)
    }

    pub fn set_field(&self, name: &str, value: String) -> bool {
        let mut known = false;
        self.edit(|input| known = input.set_field(name, value)) && known
    }

    pub fn set_photo(&self, photo: Photo) -> bool {
        self.edit(|input| input.photo = Some(photo))
    }

    fn edit<F: FnOnce(&mut RegistrationInput)>(&self, f: F) -> bool {
        let mut state = lock(&self.state);
        match *state {
            SessionState::Submitting | SessionState::Submitted(_) => false,
            SessionState::Editing | SessionState::Failed(_) => {
                f(&mut lock(&self.input));
                *state = SessionState::Editing;
                true
            }
        }
    }

    /// Validates, mints the student id, saves and, on success, produces the
    /// record the card is drawn from.
    pub async fn submit(&self) -> Result<StudentRecord, SubmitError> {
        let (input, gender) = {
            let mut state = lock(&self.state);
            match &*state {
                SessionState::Submitting => return Err(SubmitError::InFlight),
                SessionState::Submitted(_) => return Err(SubmitError::AlreadySubmitted),
                SessionState::Editing | SessionState::Failed(_) => {}
            }
            let input = lock(&self.input).clone();
            let checked = validate(&input)
                .and_then(|()| input.gender.ok_or(ValidationError::MissingField("gender")));
            let gender = match checked {
                Ok(gender) => gender,
                Err(err) => {
                    log::debug!("session {}: {}", self.id, err);
                    *state = SessionState::Editing;
                    return Err(err.into());
                }
            };
            *state = SessionState::Submitting;
            (input, gender)
        };

        let student_id = StudentIdentifier::generate();
        let registered_at = Utc::now();

        if let Some(notifier) = &self.notifier {
            let notifier = notifier.clone();
            let (id, relayed) = (student_id.clone(), input.clone());
            tokio::spawn(async move {
                if let Err(err) = notifier.notify(&id, &relayed).await {
                    log::warn!("could not relay registration {}: {:#}", id, err);
                }
            });
        }

        let saved = self
            .gateway
            .save(Submission {
                student_id: &student_id,
                input: &input,
                registered_at,
            })
            .await;

        let ack = match saved {
            Ok(ack) => ack,
            Err(err) => {
                log::error!("session {}: {}", self.id, err);
                let err = SubmitError::Persistence(err);
                *lock(&self.state) = SessionState::Failed(err.clone());
                return Err(err);
            }
        };

        let photo_url = match (ack.photo_url, &input.photo) {
            (Some(url), _) => url,
            (None, Some(photo)) => photo_data_uri(photo),
            (None, None) => String::new(),
        };
        let whatsapp = Some(input.whatsapp.trim().to_string()).filter(|w| !w.is_empty());
        let record = StudentRecord {
            student_id,
            full_name: input.full_name,
            father_name: input.father_name,
            email: input.email,
            phone: input.phone,
            whatsapp,
            cnic: input.cnic,
            date_of_birth: input.date_of_birth,
            gender,
            address: input.address,
            course: input.course,
            photo_url,
            registered_at,
        };

        log::info!(
            "registered {} for {} (session {})",
            record.student_id,
            record.course,
            self.id
        );
        *lock(&self.state) = SessionState::Submitted(record.clone());
        Ok(record)
    }

    /// Card for a submitted session, with the uploaded photo inlined.
    pub fn card_view(&self, options: CodeOptions) -> Option<CardView> {
        let record = match self.state() {
            SessionState::Submitted(record) => record,
            _ => return None,
        };
        let photo = lock(&self.input).photo.clone();
        Some(CardView::spawn(record, photo.as_ref(), options))
    }
}
