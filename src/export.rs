use std::sync::Arc;
use std::time::Duration;

use image::{DynamicImage, RgbImage};
use printpdf::{Image, ImageTransform, Mm, PdfDocument};
use resvg::tiny_skia::{Color, Pixmap, Transform};
use resvg::usvg::{self, fontdb};

use crate::card::{CardView, CARD_HEIGHT_MM, CARD_SHEET_WIDTH, CARD_WIDTH_MM};
use crate::err::ExportError;
use crate::models::StudentRecord;

/// Exported page: the folded card sheet, front and back side by side.
pub const PAGE_WIDTH_MM: f32 = CARD_WIDTH_MM * 2.0;
pub const PAGE_HEIGHT_MM: f32 = CARD_HEIGHT_MM;

#[derive(Debug, Clone)]
pub struct ExportedDocument {
    pub file_name: String,
    pub bytes: Vec<u8>,
    /// Whether the code image made it into the raster.
    pub code_resolved: bool,
}

/// Opaque RGB raster of the card sheet.
#[derive(Debug)]
pub struct Raster {
    pub width: u32,
    pub height: u32,
    pub rgb: Vec<u8>,
}

pub struct DocumentExporter {
    fontdb: Arc<fontdb::Database>,
    width_px: u32,
    supersample: f32,
    wait: Duration,
}

impl DocumentExporter {
    /// Loads the system fonts once; every export reuses them.
    pub fn new(supersample: f32, wait: Duration) -> Self {
        let mut db = fontdb::Database::new();
        db.load_system_fonts();
        log::debug!("loaded {} font faces for card export", db.len());
        Self {
            fontdb: Arc::new(db),
            width_px: CARD_SHEET_WIDTH,
            supersample: supersample.max(2.0),
            wait,
        }
    }

    /// How long an export waits for the code image.
    pub fn wait(&self) -> Duration {
        self.wait
    }

    /// Waits for the card's code image, snapshots the card sheet and turns it
    /// into a one page PDF.
    pub async fn export(&self, view: &CardView) -> Result<ExportedDocument, ExportError> {
        let document = view.ready(self.wait).await?;
        let snapshot = document.card_snapshot(self.width_px);
        let record = view.record();
        let title = format!("{} - Student ID Card", record.student_id);
        let file_name = file_name(record);

        let fontdb = self.fontdb.clone();
        let scale = self.supersample;
        let bytes = tokio::task::spawn_blocking(move || {
            let raster = rasterize(&snapshot, fontdb, scale)?;
            drop(snapshot);
            assemble_pdf(&title, raster)
        })
        .await
        .map_err(|e| ExportError::Raster(e.to_string()))??;

        log::info!("exported card {} ({} bytes)", file_name, bytes.len());
        Ok(ExportedDocument {
            file_name,
            bytes,
            code_resolved: document.code_resolved,
        })
    }
}

pub fn rasterize(svg: &str, fontdb: Arc<fontdb::Database>, scale: f32) -> Result<Raster, ExportError> {
    let options = usvg::Options {
        fontdb,
        ..usvg::Options::default()
    };
    let tree = usvg::Tree::from_str(svg, &options).map_err(|e| ExportError::Svg(e.to_string()))?;
    let size = tree
        .size()
        .to_int_size()
        .scale_by(scale)
        .ok_or_else(|| ExportError::Raster(format!("cannot scale card by {}", scale)))?;

    let mut pixmap = Pixmap::new(size.width(), size.height())
        .ok_or_else(|| ExportError::Raster(format!("bad raster size {:?}", size)))?;
    pixmap.fill(Color::WHITE);
    resvg::render(&tree, Transform::from_scale(scale, scale), &mut pixmap.as_mut());

    let mut rgb = Vec::with_capacity(pixmap.pixels().len() * 3);
    for pixel in pixmap.pixels() {
        let c = pixel.demultiply();
        rgb.extend_from_slice(&[c.red(), c.green(), c.blue()]);
    }
    Ok(Raster {
        width: pixmap.width(),
        height: pixmap.height(),
        rgb,
    })
}

/// One landscape page of the card sheet size with the raster stretched
/// over the whole page.
pub fn assemble_pdf(title: &str, raster: Raster) -> Result<Vec<u8>, ExportError> {
    let (doc, page, layer) = PdfDocument::new(title, Mm(PAGE_WIDTH_MM), Mm(PAGE_HEIGHT_MM), "Card");
    let layer = doc.get_page(page).get_layer(layer);

    let width = raster.width;
    let height = raster.height;
    let buffer = RgbImage::from_raw(width, height, raster.rgb)
        .ok_or_else(|| ExportError::Pdf("raster buffer does not match its size".to_string()))?;
    let image = Image::from_dynamic_image(&DynamicImage::ImageRgb8(buffer));

    // An image spans px / dpi inches; pick the dpi that makes it page wide
    // and stretch vertically for any rounding left over.
    let dpi = width as f32 * 25.4 / PAGE_WIDTH_MM;
    let natural_height_mm = height as f32 * 25.4 / dpi;
    image.add_to_layer(
        layer,
        ImageTransform {
            dpi: Some(dpi),
            scale_y: Some(PAGE_HEIGHT_MM / natural_height_mm),
            ..ImageTransform::default()
        },
    );

    doc.save_to_bytes().map_err(|e| ExportError::Pdf(e.to_string()))
}

/// `FQ123456-ali-khan.pdf`; falls back to the id alone when the name has
/// nothing usable in ASCII.
pub fn file_name(record: &StudentRecord) -> String {
    let mut slug = String::new();
    for ch in record.full_name.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let slug = slug.trim_end_matches('-');
    if slug.is_empty() {
        format!("{}.pdf", record.student_id)
    } else {
        format!("{}-{}.pdf", record.student_id, slug)
    }
}
