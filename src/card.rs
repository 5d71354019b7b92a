//! ID card layout.
//!
//! The card is drawn as SVG in CSS pixels at [`PX_PER_MM`] so that panel
//! sizes map directly onto the physical card footprint. Front and back sit
//! side by side with a fold line between them; the instructions block
//! hangs below and is not part of the exported card.

use std::collections::{HashMap, VecDeque};
use std::fmt::Write as _;
use std::time::Duration;

use tokio::sync::watch;

use crate::err::ExportError;
use crate::ident::StudentIdentifier;
use crate::models::{Photo, StudentRecord};
use crate::qr::{self, CodeImage, CodeOptions};

pub const CARD_WIDTH_MM: f32 = 86.0;
pub const CARD_HEIGHT_MM: f32 = 54.0;
pub const PX_PER_MM: f32 = 4.0;

pub const PANEL_WIDTH: u32 = (CARD_WIDTH_MM * PX_PER_MM) as u32;
pub const PANEL_HEIGHT: u32 = (CARD_HEIGHT_MM * PX_PER_MM) as u32;
/// Front and back side by side.
pub const CARD_SHEET_WIDTH: u32 = PANEL_WIDTH * 2;
const INSTRUCTIONS_TOP: u32 = PANEL_HEIGHT + 24;
const INSTRUCTIONS_HEIGHT: u32 = 236;
pub const DOCUMENT_HEIGHT: u32 = INSTRUCTIONS_TOP + INSTRUCTIONS_HEIGHT;

const PRIMARY: &str = "#2D5016";
const MUTED: &str = "#6B7280";
const MUTED_FILL: &str = "#F1F5EE";

const INSTITUTE_ARABIC: &str = "فہم القرآن";
const INSTITUTE: &str = "Fahm Ul Quran - Madarsa Rehmania";

const NOTES: [(&str, &str); 5] = [
    (
        "Please colour print this Admit/ID card",
        "Black & white print acceptable sirf zarurat ke waqt",
    ),
    (
        "Attestation is mandatory",
        "Gazetted Officer ya Principal se attest karwana zaroori hai",
    ),
    (
        "Bring CNIC and last qualification documents",
        "Original CNIC aur degree/certificate saath laye",
    ),
    (
        "Punctuality is required",
        "Classes ke liye waqt par aana zaroori hai",
    ),
    (
        "Keep this ID Card safe",
        "Ye aapka official student identification hai",
    ),
];

const ADDRESS: &str = "Jamia Masjid Rehmania E-4 Block 8 Second Floor";
const DEPARTMENT: &str = "Department of Fahm Ul Quran Gulshan e Iqbal Karachi";
const CONTACT: &str = "Phone: +92-343-2486038 | Email: ashfaq.sr1974@gmail.com";

/// Rendered card. `card` holds the front and back panels, `instructions`
/// the notes block; both are SVG fragments in document coordinates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VisualDocument {
    card: String,
    instructions: String,
    /// False while the code box still shows its placeholder.
    pub code_resolved: bool,
}

impl VisualDocument {
    /// Whole document: card sheet plus instructions.
    pub fn to_svg(&self) -> String {
        let mut svg = String::with_capacity(self.card.len() + self.instructions.len() + 256);
        let _ = write!(
            svg,
            r##"<svg xmlns="http://www.w3.org/2000/svg" width="{w}" height="{h}" viewBox="0 0 {w} {h}">"##,
            w = CARD_SHEET_WIDTH,
            h = DOCUMENT_HEIGHT
        );
        svg.push_str(&self.card);
        svg.push_str(&self.instructions);
        svg.push_str("</svg>");
        svg
    }

    /// Detached copy of the card sheet alone, forced to `width_px` wide.
    /// The view box stays in card coordinates, so the copy looks the same
    /// at any width.
    pub fn card_snapshot(&self, width_px: u32) -> String {
        let height = (width_px as u64 * PANEL_HEIGHT as u64 / CARD_SHEET_WIDTH as u64) as u32;
        let mut svg = String::with_capacity(self.card.len() + 256);
        let _ = write!(
            svg,
            r##"<svg xmlns="http://www.w3.org/2000/svg" width="{}" height="{}" viewBox="0 0 {} {}">"##,
            width_px, height, CARD_SHEET_WIDTH, PANEL_HEIGHT
        );
        svg.push_str(&self.card);
        svg.push_str("</svg>");
        svg
    }
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(ch),
        }
    }
    out
}

/// Cuts `text` to `max` characters, ending in an ellipsis when cut.
fn clip(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut clipped: String = text.chars().take(max.saturating_sub(1)).collect();
    clipped.push('…');
    clipped
}

fn field(out: &mut String, x: u32, y: u32, label: &str, value: &str, size: u32, mono: bool) {
    let family = if mono { "monospace" } else { "sans-serif" };
    let _ = write!(
        out,
        r##"<text x="{x}" y="{y}" font-family="sans-serif" font-size="8" font-weight="500" fill="{MUTED}">{label}</text><text x="{x}" y="{vy}" font-family="{family}" font-size="{size}" font-weight="700" fill="{PRIMARY}">{value}</text>"##,
        vy = y + size + 3,
        label = escape(label),
        value = escape(value),
    );
}

fn panel_frame(out: &mut String, x: u32, header_height: u32) {
    let _ = write!(
        out,
        r##"<rect x="{x0}" y="2" width="{w}" height="{h}" rx="8" fill="#FFFFFF" stroke="{PRIMARY}" stroke-width="2"/><path d="M{x0} {hb} V10 a8 8 0 0 1 8 -8 H{xr} a8 8 0 0 1 8 8 V{hb} Z" fill="{PRIMARY}"/>"##,
        x0 = x + 2,
        w = PANEL_WIDTH - 4,
        h = PANEL_HEIGHT - 4,
        hb = header_height,
        xr = x + PANEL_WIDTH - 10,
    );
}

fn front(out: &mut String, record: &StudentRecord) {
    let _ = write!(out, r##"<g id="front">"##);
    panel_frame(out, 0, 62);
    let cx = PANEL_WIDTH / 2;
    let _ = write!(
        out,
        r##"<text x="{cx}" y="24" text-anchor="middle" font-family="serif" font-size="18" font-weight="700" fill="#FFFFFF">{arabic}</text><text x="{cx}" y="42" text-anchor="middle" font-family="sans-serif" font-size="12" font-weight="600" fill="#FFFFFF">{name}</text><text x="{cx}" y="55" text-anchor="middle" font-family="sans-serif" font-size="8" fill="#E5EDE0">STUDENT ID CARD</text>"##,
        arabic = INSTITUTE_ARABIC,
        name = INSTITUTE,
    );

    if record.photo_url.is_empty() {
        let _ = write!(
            out,
            r##"<rect x="16" y="76" width="96" height="128" rx="6" fill="{MUTED_FILL}" stroke="{PRIMARY}" stroke-width="2"/><text x="64" y="144" text-anchor="middle" font-family="sans-serif" font-size="9" fill="{MUTED}">Photo</text>"##
        );
    } else {
        let _ = write!(
            out,
            r##"<image x="16" y="76" width="96" height="128" preserveAspectRatio="xMidYMid slice" href="{href}"/><rect x="16" y="76" width="96" height="128" rx="6" fill="none" stroke="{PRIMARY}" stroke-width="2"/>"##,
            href = escape(&record.photo_url),
        );
    }

    field(out, 128, 84, "STUDENT NAME", &clip(&record.full_name, 26), 15, false);
    field(out, 128, 124, "COURSE", &clip(&record.course, 32), 11, false);
    field(out, 128, 160, "STUDENT ID", record.student_id.as_str(), 15, true);
    out.push_str("</g>");
}

fn back(out: &mut String, record: &StudentRecord, code: Option<&CodeImage>) {
    let x = PANEL_WIDTH;
    let _ = write!(out, r##"<g id="back">"##);
    panel_frame(out, x, 34);
    let _ = write!(
        out,
        r##"<text x="{cx}" y="24" text-anchor="middle" font-family="sans-serif" font-size="12" font-weight="600" fill="#FFFFFF">STUDENT INFORMATION</text>"##,
        cx = x + PANEL_WIDTH / 2,
    );

    let left = x + 16;
    field(out, left, 46, "STUDENT NAME", &clip(&record.full_name, 28), 11, false);
    field(out, left, 84, "FATHER'S NAME", &clip(&record.father_name, 28), 11, false);
    field(out, left, 122, "CNIC NUMBER", &record.cnic, 11, true);
    field(out, left, 160, "ENROLLED COURSE", &clip(&record.course, 28), 11, false);

    let (bx, by, side) = (x + PANEL_WIDTH - 112, 60, 88);
    let _ = write!(
        out,
        r##"<rect x="{bx}" y="{by}" width="{side}" height="{side}" rx="6" fill="#FFFFFF" stroke="{PRIMARY}" stroke-width="2"/>"##
    );
    match code {
        Some(image) => {
            let _ = write!(
                out,
                r##"<image x="{ix}" y="{iy}" width="80" height="80" href="{href}"/>"##,
                ix = bx + 4,
                iy = by + 4,
                href = image.data_uri(),
            );
        }
        None => {
            let _ = write!(
                out,
                r##"<rect x="{ix}" y="{iy}" width="80" height="80" fill="{MUTED_FILL}"/><text x="{tx}" y="{ty}" text-anchor="middle" font-family="sans-serif" font-size="9" fill="{MUTED}">QR</text>"##,
                ix = bx + 4,
                iy = by + 4,
                tx = bx + side / 2,
                ty = by + side / 2 + 3,
            );
        }
    }
    let _ = write!(
        out,
        r##"<text x="{tx}" y="{ty}" text-anchor="middle" font-family="sans-serif" font-size="8" fill="{MUTED}">Scan for Info</text>"##,
        tx = bx + side / 2,
        ty = by + side + 14,
    );
    out.push_str("</g>");
}

fn instructions(out: &mut String) {
    let top = INSTRUCTIONS_TOP;
    let _ = write!(
        out,
        r##"<g id="instructions"><rect x="2" y="{top}" width="{w}" height="{h}" rx="8" fill="#FFFFFF" stroke="#D1D5DB"/><text x="18" y="{ty}" font-family="sans-serif" font-size="13" font-weight="600" fill="{PRIMARY}">Instructions / Notes</text>"##,
        w = CARD_SHEET_WIDTH - 4,
        h = INSTRUCTIONS_HEIGHT - 4,
        ty = top + 24,
    );
    for (i, (title, detail)) in NOTES.iter().enumerate() {
        let _ = write!(
            out,
            r##"<text x="18" y="{y}" font-family="sans-serif" font-size="9" fill="{MUTED}"><tspan font-weight="700" fill="#1F2937">{title}</tspan> - {detail}</text>"##,
            y = top + 46 + i as u32 * 18,
            title = escape(title),
            detail = escape(detail),
        );
    }
    let by = top + 146;
    let _ = write!(
        out,
        r##"<rect x="14" y="{by}" width="{w}" height="70" rx="6" fill="{MUTED_FILL}"/><text x="26" y="{y1}" font-family="sans-serif" font-size="10" font-weight="600" fill="{PRIMARY}">{address}</text><text x="26" y="{y2}" font-family="sans-serif" font-size="9" fill="{MUTED}">{department}</text><text x="26" y="{y3}" font-family="sans-serif" font-size="9" fill="{MUTED}">{contact}</text></g>"##,
        w = CARD_SHEET_WIDTH - 28,
        y1 = by + 20,
        y2 = by + 38,
        y3 = by + 54,
        address = escape(ADDRESS),
        department = escape(DEPARTMENT),
        contact = escape(CONTACT),
    );
}

/// Lays out the card for `record`. Pure: the same record and code image
/// always give the same document.
pub fn render(record: &StudentRecord, code: Option<&CodeImage>) -> VisualDocument {
    let mut card = String::with_capacity(8 * 1024);
    front(&mut card, record);
    back(&mut card, record, code);
    let _ = write!(
        card,
        r##"<line x1="{x}" y1="6" x2="{x}" y2="{y2}" stroke="#9CA3AF" stroke-width="1" stroke-dasharray="4 3"/>"##,
        x = PANEL_WIDTH,
        y2 = PANEL_HEIGHT - 6,
    );

    let mut notes = String::with_capacity(2 * 1024);
    instructions(&mut notes);

    VisualDocument {
        card,
        instructions: notes,
        code_resolved: code.is_some(),
    }
}

/// State of the code image behind a card view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodeState {
    Pending,
    Ready(CodeImage),
    Failed,
}

/// Card for one submitted registration. The code image is produced in the
/// background and published through a watch channel, which doubles as the
/// "render complete" signal the exporter waits on.
#[derive(Debug, Clone)]
pub struct CardView {
    record: StudentRecord,
    render_record: StudentRecord,
    code: watch::Receiver<CodeState>,
}

impl CardView {
    /// Starts encoding the code image for `record` and returns immediately.
    /// When `photo` is given it is inlined into the card, so the rendering
    /// does not depend on the stored photo URL being reachable.
    pub fn spawn(record: StudentRecord, photo: Option<&Photo>, options: CodeOptions) -> Self {
        let (tx, rx) = watch::channel(CodeState::Pending);
        let text = qr::payload(&record.student_id, &record.full_name, &record.course);
        tokio::spawn(async move {
            let state = match qr::encode(text, options).await {
                Some(image) => CodeState::Ready(image),
                None => CodeState::Failed,
            };
            let _ = tx.send(state);
        });
        Self::with_receiver(record, photo, rx)
    }

    pub(crate) fn with_receiver(record: StudentRecord, photo: Option<&Photo>, code: watch::Receiver<CodeState>) -> Self {
        let mut render_record = record.clone();
        if let Some(photo) = photo {
            render_record.photo_url = photo_data_uri(photo);
        }
        Self {
            record,
            render_record,
            code,
        }
    }

    pub fn record(&self) -> &StudentRecord {
        &self.record
    }

    /// Renders with whatever is available now; a pending code image shows
    /// as a placeholder box.
    pub fn current(&self) -> VisualDocument {
        let state = self.code.borrow().clone();
        self.render_state(&state)
    }

    /// Waits until the code image has either resolved or definitively failed,
    /// then renders. Fails with [`ExportError::CodeNotReady`] if `budget`
    /// runs out first.
    pub async fn ready(&self, budget: Duration) -> Result<VisualDocument, ExportError> {
        let mut rx = self.code.clone();
        let settled = tokio::time::timeout(budget, async move {
            match rx.wait_for(|state| *state != CodeState::Pending).await {
                Ok(state) => state.clone(),
                // Encoder went away without publishing.
                Err(_) => CodeState::Failed,
            }
        })
        .await
        .map_err(|_| ExportError::CodeNotReady)?;
        Ok(self.render_state(&settled))
    }

    fn render_state(&self, state: &CodeState) -> VisualDocument {
        match state {
            CodeState::Ready(image) => render(&self.render_record, Some(image)),
            CodeState::Pending | CodeState::Failed => render(&self.render_record, None),
        }
    }
}

/// Recently used card views, oldest evicted first once `capacity` is hit.
/// A miss is the caller's to rebuild from storage.
#[derive(Debug)]
pub struct CardCache {
    capacity: usize,
    views: HashMap<StudentIdentifier, CardView>,
    order: VecDeque<StudentIdentifier>,
}

impl CardCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            views: HashMap::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
        }
    }

    pub fn get(&mut self, id: &StudentIdentifier) -> Option<CardView> {
        let view = self.views.get(id)?.clone();
        self.touch(id);
        Some(view)
    }

    pub fn insert(&mut self, id: StudentIdentifier, view: CardView) {
        if self.views.insert(id.clone(), view).is_some() {
            self.touch(&id);
            return;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.views.remove(&oldest);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.views.len()
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }

    fn touch(&mut self, id: &StudentIdentifier) {
        if let Some(pos) = self.order.iter().position(|k| k == id) {
            if let Some(key) = self.order.remove(pos) {
                self.order.push_back(key);
            }
        }
    }
}

pub fn photo_data_uri(photo: &Photo) -> String {
    use base64::Engine as _;
    format!(
        "data:{};base64,{}",
        photo.mime(),
        base64::engine::general_purpose::STANDARD.encode(&photo.bytes)
    )
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::Gender;
    use chrono::{TimeZone, Utc};

    pub(crate) fn record() -> StudentRecord {
        StudentRecord {
            student_id: "FQ123456".parse::<StudentIdentifier>().unwrap(),
            full_name: "Ali Khan".into(),
            father_name: "Imran <Khan>".into(),
            email: "ali@example.com".into(),
            phone: "+92-300-1234567".into(),
            whatsapp: None,
            cnic: "12345-6789012-3".into(),
            date_of_birth: "2001-02-03".into(),
            gender: Gender::Male,
            address: "Karachi".into(),
            course: "Tajweed & Qirat".into(),
            photo_url: String::new(),
            registered_at: Utc.with_ymd_and_hms(2024, 6, 1, 9, 30, 0).unwrap(),
        }
    }

    fn code() -> CodeImage {
        let r = record();
        qr::encode_blocking(
            &qr::payload(&r.student_id, &r.full_name, &r.course),
            &CodeOptions::default(),
        )
        .unwrap()
    }

    #[test]
    fn render_is_idempotent() {
        let code = code();
        assert_eq!(render(&record(), Some(&code)), render(&record(), Some(&code)));
    }

    #[test]
    fn text_is_escaped() {
        let svg = render(&record(), None).to_svg();
        assert!(svg.contains("Tajweed &amp; Qirat"));
        assert!(svg.contains("Imran &lt;Khan&gt;"));
        assert!(!svg.contains("Tajweed & Qirat"));
    }

    #[test]
    fn shows_id_and_placeholders_without_images() {
        let doc = render(&record(), None);
        assert!(!doc.code_resolved);
        let svg = doc.to_svg();
        assert!(svg.contains("FQ123456"));
        assert!(svg.contains(">QR</text>"));
        assert!(svg.contains(">Photo</text>"));
    }

    #[test]
    fn embeds_code_image_once_resolved() {
        let doc = render(&record(), Some(&code()));
        assert!(doc.code_resolved);
        let svg = doc.to_svg();
        assert!(svg.contains("data:image/png;base64,"));
        assert!(!svg.contains(">QR</text>"));
    }

    #[test]
    fn snapshot_excludes_instructions_and_forces_width() {
        let snap = render(&record(), None).card_snapshot(1376);
        assert!(snap.contains(r##"width="1376" height="432""##));
        assert!(!snap.contains("Instructions / Notes"));
        assert!(render(&record(), None).to_svg().contains("Instructions / Notes"));
    }

    #[test]
    fn long_names_are_clipped() {
        assert_eq!(clip("abcdef", 4), "abc…");
        assert_eq!(clip("abc", 4), "abc");
    }

    #[tokio::test]
    async fn ready_waits_for_code_image() {
        let (tx, rx) = watch::channel(CodeState::Pending);
        let view = CardView::with_receiver(record(), None, rx);
        assert!(!view.current().code_resolved);

        let image = code();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let _ = tx.send(CodeState::Ready(image));
        });
        let doc = view.ready(Duration::from_secs(5)).await.unwrap();
        assert!(doc.code_resolved);
    }

    #[tokio::test]
    async fn ready_times_out_while_pending() {
        let (_tx, rx) = watch::channel(CodeState::Pending);
        let view = CardView::with_receiver(record(), None, rx);
        let err = view.ready(Duration::from_millis(20)).await.unwrap_err();
        assert_eq!(err, ExportError::CodeNotReady);
    }

    #[tokio::test]
    async fn failed_encoding_settles_with_placeholder() {
        let (tx, rx) = watch::channel(CodeState::Pending);
        let view = CardView::with_receiver(record(), None, rx);
        tx.send(CodeState::Failed).unwrap();
        let doc = view.ready(Duration::from_secs(1)).await.unwrap();
        assert!(!doc.code_resolved);
    }

    #[tokio::test]
    async fn spawn_resolves_code_for_record() {
        let view = CardView::spawn(record(), None, CodeOptions::default());
        let doc = view.ready(Duration::from_secs(10)).await.unwrap();
        assert!(doc.code_resolved);
        assert_eq!(view.record().student_id.as_str(), "FQ123456");
    }

    #[test]
    fn inlines_photo_as_data_uri() {
        let photo = Photo::new(vec![0xFF, 0xD8, 0xFF, 0xE0]);
        let (_tx, rx) = watch::channel(CodeState::Pending);
        let mut rec = record();
        rec.photo_url = "/photos/FQ123456.jpg".into();
        let view = CardView::with_receiver(rec, Some(&photo), rx);
        assert_eq!(view.record().photo_url, "/photos/FQ123456.jpg");
        assert!(view.current().to_svg().contains("href=\"data:image/jpeg;base64,"));
    }

    fn idle_view(id: &str) -> CardView {
        let mut rec = record();
        rec.student_id = id.parse().unwrap();
        CardView::with_receiver(rec, None, watch::channel(CodeState::Pending).1)
    }

    #[test]
    fn card_cache_evicts_least_recently_used() {
        let ids: Vec<StudentIdentifier> = ["FQ000001", "FQ000002", "FQ000003"]
            .iter()
            .map(|id| id.parse().unwrap())
            .collect();
        let mut cache = CardCache::new(2);
        cache.insert(ids[0].clone(), idle_view("FQ000001"));
        cache.insert(ids[1].clone(), idle_view("FQ000002"));
        assert!(cache.get(&ids[0]).is_some());

        cache.insert(ids[2].clone(), idle_view("FQ000003"));
        assert_eq!(cache.len(), 2);
        assert!(cache.get(&ids[1]).is_none());
        assert_eq!(cache.get(&ids[0]).unwrap().record().student_id, ids[0]);
        assert!(cache.get(&ids[2]).is_some());
    }

    #[test]
    fn card_cache_reinsert_does_not_grow() {
        let id: StudentIdentifier = "FQ000001".parse().unwrap();
        let mut cache = CardCache::new(0);
        cache.insert(id.clone(), idle_view("FQ000001"));
        cache.insert(id.clone(), idle_view("FQ000001"));
        assert_eq!(cache.len(), 1);
    }
}
