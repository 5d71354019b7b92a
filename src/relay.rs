use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::Client;

use crate::ident::StudentIdentifier;
use crate::models::RegistrationInput;

/// Side channel told about every registration. Best effort: callers log
/// failures and move on.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, id: &StudentIdentifier, input: &RegistrationInput) -> anyhow::Result<()>;
}

/// Posts the registration as a multipart form to an external form-to-email
/// relay. No authentication.
pub struct EmailRelay {
    client: Client,
    url: String,
}

impl EmailRelay {
    pub fn new<S: Into<String>>(url: S) -> Self {
        Self {
            client: Client::new(),
            url: url.into(),
        }
    }
}

pub fn form(id: &StudentIdentifier, input: &RegistrationInput) -> anyhow::Result<Form> {
    let mut form = Form::new()
        .text("fullName", input.full_name.clone())
        .text("fatherName", input.father_name.clone())
        .text("email", input.email.clone())
        .text("phone", input.phone.clone())
        .text("whatsapp", input.whatsapp.clone())
        .text("cnic", input.cnic.clone())
        .text("dateOfBirth", input.date_of_birth.clone())
        .text("gender", input.gender.map(|g| g.as_str()).unwrap_or_default())
        .text("address", input.address.clone())
        .text("course", input.course.clone())
        .text("studentId", id.to_string());
    if let Some(photo) = &input.photo {
        let name = photo
            .file_name
            .clone()
            .unwrap_or_else(|| format!("{}.{}", id, photo.extension()));
        let part = Part::bytes(photo.bytes.clone())
            .file_name(name)
            .mime_str(&photo.mime())?;
        form = form.part("photo", part);
    }
    Ok(form.text("_captcha", "false"))
}

#[async_trait]
impl Notifier for EmailRelay {
    async fn notify(&self, id: &StudentIdentifier, input: &RegistrationInput) -> anyhow::Result<()> {
        self.client
            .post(&self.url)
            .multipart(form(id, input)?)
            .send()
            .await?
            .error_for_status()?;
        log::debug!("relayed registration {} to {}", id, self.url);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Photo;

    #[test]
    fn form_builds_with_and_without_photo() {
        let id: StudentIdentifier = "FQ123456".parse().unwrap();
        let mut input = RegistrationInput {
            full_name: "Ali Khan".into(),
            ..RegistrationInput::default()
        };
        let bare = form(&id, &input).unwrap();
        assert!(!bare.boundary().is_empty());

        input.photo = Some(Photo::new(vec![0xFF, 0xD8, 0xFF]));
        assert!(form(&id, &input).is_ok());
    }

    #[tokio::test]
    async fn unreachable_relay_reports_error() {
        let relay = EmailRelay::new("http://127.0.0.1:9/form");
        let id: StudentIdentifier = "FQ123456".parse().unwrap();
        assert!(relay.notify(&id, &RegistrationInput::default()).await.is_err());
    }
}
