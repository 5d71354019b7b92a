use chrono::{DateTime, Utc};
use image::ImageFormat;
use serde::{Deserialize, Serialize};

use crate::ident::StudentIdentifier;

/// Upper bound for an uploaded photo, in bytes.
pub const MAX_PHOTO_BYTES: usize = 5 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Male,
    Female,
}

impl Gender {
    pub fn as_str(&self) -> &'static str {
        match self {
            Gender::Male => "male",
            Gender::Female => "female",
        }
    }

    pub fn parse(value: &str) -> Option<Gender> {
        match value.trim().to_ascii_lowercase().as_str() {
            "male" => Some(Gender::Male),
            "female" => Some(Gender::Female),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Photo {
    pub bytes: Vec<u8>,
    pub file_name: Option<String>,
    pub content_type: Option<String>,
}

impl Photo {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            file_name: None,
            content_type: None,
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// MIME type of the photo, sniffed from the bytes first and falling back
    /// to whatever the client declared.
    pub fn mime(&self) -> String {
        match image::guess_format(&self.bytes) {
            Ok(ImageFormat::Png) => "image/png".to_string(),
            Ok(ImageFormat::Jpeg) => "image/jpeg".to_string(),
            Ok(ImageFormat::Gif) => "image/gif".to_string(),
            Ok(ImageFormat::WebP) => "image/webp".to_string(),
            _ => self
                .content_type
                .clone()
                .unwrap_or_else(|| "application/octet-stream".to_string()),
        }
    }

    pub fn extension(&self) -> &'static str {
        match self.mime().as_str() {
            "image/png" => "png",
            "image/jpeg" => "jpg",
            "image/gif" => "gif",
            "image/webp" => "webp",
            _ => "bin",
        }
    }
}

/// Form state of one registration session. Every field is kept as the raw
/// text the user typed; validation happens on submit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistrationInput {
    pub full_name: String,
    pub father_name: String,
    pub email: String,
    pub phone: String,
    pub whatsapp: String,
    pub cnic: String,
    pub date_of_birth: String,
    pub gender: Option<Gender>,
    pub address: String,
    pub course: String,
    pub photo: Option<Photo>,
}

impl RegistrationInput {
    /// Sets a scalar form field by its wire name. Returns false for
    /// names the form does not know about.
    pub fn set_field(&mut self, name: &str, value: String) -> bool {
        match name {
            "fullName" | "full_name" => self.full_name = value,
            "fatherName" | "father_name" => self.father_name = value,
            "email" => self.email = value,
            "phone" => self.phone = value,
            "whatsapp" => self.whatsapp = value,
            "cnic" => self.cnic = value,
            "dateOfBirth" | "date_of_birth" => self.date_of_birth = value,
            "gender" => self.gender = Gender::parse(&value),
            "address" => self.address = value,
            "course" => self.course = value,
            _ => return false,
        }
        true
    }
}

/// Validated, identifier-bearing registration ready for rendering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudentRecord {
    pub student_id: StudentIdentifier,
    pub full_name: String,
    pub father_name: String,
    pub email: String,
    pub phone: String,
    pub whatsapp: Option<String>,
    pub cnic: String,
    pub date_of_birth: String,
    pub gender: Gender,
    pub address: String,
    pub course: String,
    pub photo_url: String,
    pub registered_at: DateTime<Utc>,
}

/// Flat row of the `registrations` table.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RegistrationRow {
    pub student_id: String,
    pub full_name: String,
    pub father_name: String,
    pub email: String,
    pub phone: String,
    pub whatsapp: Option<String>,
    pub cnic: String,
    pub date_of_birth: String,
    pub gender: String,
    pub address: String,
    pub course: String,
    pub photo_url: Option<String>,
    pub photo_sha256: Option<String>,
    pub registered_at: DateTime<Utc>,
}

impl TryFrom<RegistrationRow> for StudentRecord {
    type Error = anyhow::Error;

    fn try_from(row: RegistrationRow) -> Result<Self, Self::Error> {
        let gender = Gender::parse(&row.gender)
            .ok_or_else(|| anyhow::anyhow!("stored gender `{}` is invalid", row.gender))?;
        Ok(StudentRecord {
            student_id: row.student_id.parse()?,
            full_name: row.full_name,
            father_name: row.father_name,
            email: row.email,
            phone: row.phone,
            whatsapp: row.whatsapp,
            cnic: row.cnic,
            date_of_birth: row.date_of_birth,
            gender,
            address: row.address,
            course: row.course,
            photo_url: row.photo_url.unwrap_or_default(),
            registered_at: row.registered_at,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Course {
    pub title: &'static str,
    pub arabic_title: &'static str,
    pub duration: &'static str,
    pub description: &'static str,
}

const fn course(
    title: &'static str,
    arabic_title: &'static str,
    duration: &'static str,
    description: &'static str,
) -> Course {
    Course {
        title,
        arabic_title,
        duration,
        description,
    }
}

lazy_static::lazy_static! {
    pub static ref COURSES: Vec<Course> = vec![
        course(
            "Fahm Ul Quran Diploma Course",
            "فہم القرآن ڈپلومہ کورس",
            "15 Months",
            "A complete understanding and translation of the Holy Quran.",
        ),
        course("Basic Islamic Studies", "بنیادی اسلامی تعلیمات", "5 Months", "Islamic Aqaid and basic knowledge."),
        course("Hadees Study Program", "حدیث شریف کا مطالعہ", "1 Year", "Teachings and understanding of Sahih Hadith."),
        course("Islamic Jurisprudence (Fiqh)", "فقہ اسلامی", "1 Year", "Islamic law and practical guidance."),
        course("Tajweed & Qirat", "تجوید اور قرأت", "1 Year", "Correct Quranic recitation."),
        course("Dars-e-Nizami", "درس نظامی", "4 Years", "Recitation and fundamentals of Quranic studies."),
        course(
            "Hifz-e-Quran (Selected Surahs)",
            "حفظ قرآن (منتخب سورہ)",
            "1 Year",
            "Memorize selected Surahs with proper recitation.",
        ),
        course("Aqaid Course", "عقائد کورس", "5 Months", "Basic knowledge of Islamic beliefs and creed."),
        course("Seerat Course", "سیرت کورس", "5 Months", "Life, character and teachings of the Prophet ﷺ."),
        course("Farz-ul-Uloom Course", "فرض العلوم کورس", "5 Months", "Essential Islamic knowledge."),
        course("Nazra Course", "نظرہ کورس", "15 Months", "Reading the Quran with correct pronunciation."),
        course("Adeeb Arabic", "ادیب عربی", "1 Year", "Arabic literature and basic grammar."),
        course("Arabic Language Course", "عربی زبان کورس", "15 Months", "Arabic from basic to advanced level."),
    ];
}

pub fn is_known_course(title: &str) -> bool {
    COURSES.iter().any(|c| c.title == title)
}
