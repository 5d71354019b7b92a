use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use image::codecs::png::PngEncoder;
use image::{ColorType, ImageEncoder, Rgb, RgbImage};
use qrcode::{Color, QrCode};

use crate::err::EncodingError;
use crate::ident::StudentIdentifier;

/// Text stored in the code. Must stay readable when scanned.
pub fn payload(id: &StudentIdentifier, full_name: &str, course: &str) -> String {
    format!("Student ID: {}, Name: {}, Course: {}", id, full_name, course)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CodeOptions {
    pub target_size_px: u32,
    /// Quiet zone, in modules.
    pub margin: u32,
    pub foreground: [u8; 3],
    pub background: [u8; 3],
}

impl Default for CodeOptions {
    fn default() -> Self {
        Self {
            target_size_px: 80,
            margin: 1,
            foreground: [0x2D, 0x50, 0x16],
            background: [0xFF, 0xFF, 0xFF],
        }
    }
}

/// PNG encoded code image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeImage {
    pub png: Vec<u8>,
    pub size_px: u32,
}

impl CodeImage {
    pub fn data_uri(&self) -> String {
        format!("data:image/png;base64,{}", STANDARD.encode(&self.png))
    }
}

/// Renders `payload` as a square PNG. Each module is drawn as a whole number
/// of pixels, so the result can come out smaller than `target_size_px` but
/// never larger (unless the code itself needs more modules than pixels).
pub fn encode_blocking(payload: &str, options: &CodeOptions) -> Result<CodeImage, EncodingError> {
    let code = QrCode::new(payload.as_bytes()).map_err(|e| EncodingError(e.to_string()))?;
    let width = code.width() as u32;
    let colors = code.to_colors();

    let modules = width + 2 * options.margin;
    let scale = (options.target_size_px / modules).max(1);
    let side = modules * scale;

    let dark = Rgb(options.foreground);
    let light = Rgb(options.background);
    let img = RgbImage::from_fn(side, side, |x, y| {
        let (mx, my) = (x / scale, y / scale);
        if mx < options.margin || my < options.margin {
            return light;
        }
        let (cx, cy) = (mx - options.margin, my - options.margin);
        if cx >= width || cy >= width {
            return light;
        }
        match colors[(cy * width + cx) as usize] {
            Color::Dark => dark,
            Color::Light => light,
        }
    });

    let mut png = Vec::new();
    PngEncoder::new(&mut png)
        .write_image(img.as_raw(), side, side, ColorType::Rgb8)
        .map_err(|e| EncodingError(e.to_string()))?;
    Ok(CodeImage { png, size_px: side })
}

/// Single attempt on the blocking pool. Failures are logged and turn into
/// `None` so the card can fall back to its placeholder.
pub async fn encode(payload: String, options: CodeOptions) -> Option<CodeImage> {
    let joined = tokio::task::spawn_blocking(move || encode_blocking(&payload, &options)).await;
    match joined {
        Ok(Ok(image)) => Some(image),
        Ok(Err(err)) => {
            log::warn!("{}", err);
            None
        }
        Err(err) => {
            log::warn!("code encoder task failed: {}", err);
            None
        }
    }
}
