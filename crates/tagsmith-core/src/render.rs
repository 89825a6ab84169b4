//! Symbol rendering.
//!
//! A [`SymbolRenderer`] turns a payload into a lossless PNG raster in the
//! scratch directory, named after the unit's identifier. Two renderers exist:
//!
//! - [`LinearBarcodeRenderer`] - Code 128 (code set B) or EAN-13, chosen by
//!   [`Symbology`].
//! - [`QrRenderer`] - QR matrix codes for arbitrary UTF-8 payloads.
//!
//! Renderers are synchronous and touch the filesystem; the pipeline calls them
//! from the blocking thread pool. A render only succeeds once the raster is
//! observed on disk.

use crate::{
    error::RenderError,
    types::{Identifier, RasterImage, SymbolKind},
};
use barcoders::sym::{code128::Code128, ean13::EAN13};
use core::{fmt, str::FromStr};
use image::{GrayImage, ImageFormat, Luma};
use qrcode::{Color, EcLevel, QrCode};
use std::{
    fs,
    path::{Path, PathBuf},
};

const DARK: Luma<u8> = Luma([0]);
const LIGHT: Luma<u8> = Luma([255]);

/// Pixels per barcode module.
const BAR_MODULE_PX: u32 = 2;
const BAR_HEIGHT_PX: u32 = 120;
const BAR_QUIET_MODULES: u32 = 10;
const CODE128_MAX_LEN: usize = 80;
/// Code 128 code set B start character understood by `barcoders`.
const CODE128_SET_B: char = 'Ɓ';

const QR_MODULE_PX: u32 = 8;
const QR_QUIET_MODULES: u32 = 4;

pub const EAN13_BODY_DIGITS: usize = 12;

/// Renders a payload into a raster on local scratch storage.
pub trait SymbolRenderer: Send + Sync {
    fn kind(&self) -> SymbolKind;

    /// Renders `payload` to `{scratch}/{identifier}.png`.
    ///
    /// # Errors
    ///
    /// - [`RenderError::Symbology`] if the payload is not encodable.
    /// - [`RenderError::NotMaterialized`] if the file is absent afterwards.
    fn render(&self, payload: &str, identifier: &Identifier) -> Result<RasterImage, RenderError>;
}

/// Linear symbology used by [`LinearBarcodeRenderer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Symbology {
    /// Variable length, printable ASCII.
    #[default]
    Code128,
    /// Fixed 12 data digits plus check digit. Pair with the numeric
    /// identifier scheme (`ID_SCHEME=numeric`); other schemes never fit.
    Ean13,
}

impl Symbology {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Code128 => "code128",
            Self::Ean13 => "ean13",
        }
    }

    /// Encodes `payload` into bar modules (`1` = dark, `0` = light).
    pub fn encode(self, payload: &str) -> Result<Vec<u8>, RenderError> {
        match self {
            Self::Code128 => {
                validate_code128(payload)?;
                let symbol = Code128::new(format!("{CODE128_SET_B}{payload}"))
                    .map_err(|e| self.reject(format!("{e:?}")))?;
                Ok(symbol.encode())
            }
            Self::Ean13 => {
                let body = normalize_ean13(payload)?;
                let symbol = EAN13::new(&body).map_err(|e| self.reject(format!("{e:?}")))?;
                Ok(symbol.encode())
            }
        }
    }

    fn reject(self, reason: impl Into<String>) -> RenderError {
        RenderError::Symbology {
            symbology: self.name(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for Symbology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Symbology {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "code128" => Ok(Self::Code128),
            "ean13" => Ok(Self::Ean13),
            other => Err(format!(
                "unknown symbology `{other}` (expected code128 or ean13)"
            )),
        }
    }
}

fn validate_code128(payload: &str) -> Result<(), RenderError> {
    let reject = |reason: String| Symbology::Code128.reject(reason);

    if payload.is_empty() {
        return Err(reject("payload is empty".into()));
    }
    if payload.len() > CODE128_MAX_LEN {
        return Err(reject(format!(
            "payload is {} characters, maximum is {CODE128_MAX_LEN}",
            payload.len()
        )));
    }
    if let Some(c) = payload.chars().find(|c| !(' '..='~').contains(c)) {
        return Err(reject(format!("character {c:?} is outside code set B")));
    }
    Ok(())
}

/// Normalizes a payload to the 12-digit EAN-13 body.
///
/// Up to 12 digits are left-padded with zeros. Exactly 13 digits must end in a
/// valid check digit, which is dropped (the encoder recomputes it). Anything
/// else is rejected.
pub fn normalize_ean13(payload: &str) -> Result<String, RenderError> {
    let reject = |reason: String| Symbology::Ean13.reject(reason);

    if payload.is_empty() || !payload.bytes().all(|b| b.is_ascii_digit()) {
        return Err(reject(format!("`{payload}` is not a numeric string")));
    }

    match payload.len() {
        n if n <= EAN13_BODY_DIGITS => Ok(format!("{payload:0>EAN13_BODY_DIGITS$}")),
        13 => {
            let (body, check) = payload.split_at(EAN13_BODY_DIGITS);
            let expected = ean13_check_digit(body);
            if check.as_bytes()[0] - b'0' == expected {
                Ok(body.to_string())
            } else {
                Err(reject(format!(
                    "check digit {check} does not match expected {expected}"
                )))
            }
        }
        n => Err(reject(format!("{n} digits exceed the 13-digit maximum"))),
    }
}

/// Check digit for a 12-digit EAN-13 body.
pub fn ean13_check_digit(body: &str) -> u8 {
    let sum: u32 = body
        .bytes()
        .enumerate()
        .map(|(i, b)| u32::from(b - b'0') * if i % 2 == 0 { 1 } else { 3 })
        .sum();
    ((10 - sum % 10) % 10) as u8
}

/// Renders linear barcodes.
#[derive(Debug, Clone)]
pub struct LinearBarcodeRenderer {
    symbology: Symbology,
    scratch_dir: PathBuf,
}

impl LinearBarcodeRenderer {
    pub fn new(symbology: Symbology, scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            symbology,
            scratch_dir: scratch_dir.into(),
        }
    }

}

impl SymbolRenderer for LinearBarcodeRenderer {
    fn kind(&self) -> SymbolKind {
        SymbolKind::Barcode
    }

    fn render(&self, payload: &str, identifier: &Identifier) -> Result<RasterImage, RenderError> {
        let modules = self.symbology.encode(payload)?;

        let total_modules = modules.len() as u32 + 2 * BAR_QUIET_MODULES;
        let width = total_modules * BAR_MODULE_PX;
        let mut canvas = GrayImage::from_pixel(width, BAR_HEIGHT_PX, LIGHT);

        for (i, module) in modules.iter().enumerate() {
            if *module == 0 {
                continue;
            }
            let x0 = (BAR_QUIET_MODULES + i as u32) * BAR_MODULE_PX;
            for x in x0..x0 + BAR_MODULE_PX {
                for y in 0..BAR_HEIGHT_PX {
                    canvas.put_pixel(x, y, DARK);
                }
            }
        }

        materialize(&canvas, &self.scratch_dir, identifier, SymbolKind::Barcode)
    }
}

/// Renders QR codes.
#[derive(Debug, Clone)]
pub struct QrRenderer {
    scratch_dir: PathBuf,
}

impl QrRenderer {
    pub fn new(scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            scratch_dir: scratch_dir.into(),
        }
    }
}

impl SymbolRenderer for QrRenderer {
    fn kind(&self) -> SymbolKind {
        SymbolKind::Qr
    }

    fn render(&self, payload: &str, identifier: &Identifier) -> Result<RasterImage, RenderError> {
        let code = QrCode::with_error_correction_level(payload.as_bytes(), EcLevel::M).map_err(
            |e| RenderError::Symbology {
                symbology: "qr",
                reason: e.to_string(),
            },
        )?;

        let modules = code.width() as u32;
        let side = (modules + 2 * QR_QUIET_MODULES) * QR_MODULE_PX;
        let mut canvas = GrayImage::from_pixel(side, side, LIGHT);

        for (i, color) in code.to_colors().into_iter().enumerate() {
            if color != Color::Dark {
                continue;
            }
            let mx = i as u32 % modules + QR_QUIET_MODULES;
            let my = i as u32 / modules + QR_QUIET_MODULES;
            for x in mx * QR_MODULE_PX..(mx + 1) * QR_MODULE_PX {
                for y in my * QR_MODULE_PX..(my + 1) * QR_MODULE_PX {
                    canvas.put_pixel(x, y, DARK);
                }
            }
        }

        materialize(&canvas, &self.scratch_dir, identifier, SymbolKind::Qr)
    }
}

/// Writes `canvas` as `{dir}/{identifier}.png` and confirms it exists.
fn materialize(
    canvas: &GrayImage,
    dir: &Path,
    identifier: &Identifier,
    kind: SymbolKind,
) -> Result<RasterImage, RenderError> {
    fs::create_dir_all(dir)?;
    let path = dir.join(format!("{identifier}.png"));
    canvas.save_with_format(&path, ImageFormat::Png)?;

    if !path.try_exists()? {
        return Err(RenderError::NotMaterialized {
            path: path.display().to_string(),
        });
    }

    Ok(RasterImage {
        path,
        kind,
        width: canvas.width(),
        height: canvas.height(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    // EAN-13 digit patterns for the left (odd/L, even/G) and right (R) halves.
    const L_CODES: [&str; 10] = [
        "0001101", "0011001", "0010011", "0111101", "0100011", "0110001", "0101111", "0111011",
        "0110111", "0001011",
    ];
    const G_CODES: [&str; 10] = [
        "0100111", "0110011", "0011011", "0100001", "0011101", "0111001", "0000101", "0010001",
        "0001001", "0010111",
    ];
    const R_CODES: [&str; 10] = [
        "1110010", "1100110", "1101100", "1000010", "1011100", "1001110", "1010000", "1000100",
        "1001000", "1110100",
    ];
    // Parity of the six left digits per leading digit (L = odd, G = even).
    const PARITY: [&str; 10] = [
        "LLLLLL", "LLGLGG", "LLGGLG", "LLGGGL", "LGLLGG", "LGGLLG", "LGGGLL", "LGLGLG", "LGLGGL",
        "LGGLGL",
    ];

    /// Decodes 95 EAN-13 modules back into the 13-digit string.
    fn decode_ean13(modules: &[u8]) -> String {
        let bits: String = modules.iter().map(|m| if *m == 1 { '1' } else { '0' }).collect();
        assert_eq!(bits.len(), 95, "EAN-13 is 95 modules wide");
        assert_eq!(&bits[..3], "101");
        assert_eq!(&bits[45..50], "01010");
        assert_eq!(&bits[92..], "101");

        let mut parity = String::new();
        let mut left = String::new();
        for i in 0..6 {
            let chunk = &bits[3 + i * 7..10 + i * 7];
            if let Some(d) = L_CODES.iter().position(|c| *c == chunk) {
                parity.push('L');
                left.push(char::from(b'0' + d as u8));
            } else {
                let d = G_CODES.iter().position(|c| *c == chunk).unwrap();
                parity.push('G');
                left.push(char::from(b'0' + d as u8));
            }
        }
        let first = PARITY.iter().position(|p| *p == parity).unwrap();

        let mut right = String::new();
        for i in 0..6 {
            let chunk = &bits[50 + i * 7..57 + i * 7];
            let d = R_CODES.iter().position(|c| *c == chunk).unwrap();
            right.push(char::from(b'0' + d as u8));
        }

        format!("{first}{left}{right}")
    }

    #[test]
    fn ean13_left_pads_short_numbers() {
        assert_eq!(normalize_ean13("42").unwrap(), "000000000042");
        assert_eq!(normalize_ean13("590123412345").unwrap(), "590123412345");
    }

    #[test]
    fn ean13_accepts_valid_check_digit_and_rejects_bad_one() {
        assert_eq!(normalize_ean13("4006381333931").unwrap(), "400638133393");
        assert!(matches!(
            normalize_ean13("4006381333932"),
            Err(RenderError::Symbology { .. })
        ));
    }

    #[test]
    fn ean13_rejects_non_numeric_and_overlong() {
        for bad in ["", "01J9ZQ3V4X8K", "12345678901234", "12 34"] {
            assert!(
                matches!(normalize_ean13(bad), Err(RenderError::Symbology { .. })),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn ean13_render_decodes_to_normalized_digits() {
        let modules = Symbology::Ean13.encode("590123412345").unwrap();
        let decoded = decode_ean13(&modules);
        assert_eq!(&decoded[..12], "590123412345");
        assert_eq!(decoded.as_bytes()[12] - b'0', ean13_check_digit("590123412345"));
        assert_eq!(decoded, "5901234123457");
    }

    #[test]
    fn ean13_png_scans_back_to_payload() {
        let dir = tempdir().unwrap();
        let renderer = LinearBarcodeRenderer::new(Symbology::Ean13, dir.path());
        let id = Identifier::new("590123412345");
        let raster = renderer.render(id.as_str(), &id).unwrap();

        let png = image::open(&raster.path).unwrap().to_luma8();
        assert_eq!(png.width(), (95 + 2 * BAR_QUIET_MODULES) * BAR_MODULE_PX);
        let row = BAR_HEIGHT_PX / 2;
        let dark = |x: u32| png.get_pixel(x, row).0[0] < 128;

        assert!((0..BAR_QUIET_MODULES * BAR_MODULE_PX).all(|x| !dark(x)));
        let modules: Vec<u8> = (0..95)
            .map(|i| u8::from(dark((BAR_QUIET_MODULES + i) * BAR_MODULE_PX)))
            .collect();
        assert_eq!(decode_ean13(&modules), "5901234123457");
    }

    #[test]
    fn ean13_renderer_rejects_ulid_identifier() {
        let dir = tempdir().unwrap();
        let renderer = LinearBarcodeRenderer::new(Symbology::Ean13, dir.path());
        let id = Identifier::new("01J9ZQ3V4X8K2M7N5P6R0S1T2V");
        let err = renderer.render(id.as_str(), &id).unwrap_err();
        assert!(matches!(err, RenderError::Symbology { symbology: "ean13", .. }));
        assert!(!dir.path().join(format!("{id}.png")).exists());
    }

    #[test]
    fn code128_rejects_non_ascii() {
        assert!(matches!(
            Symbology::Code128.encode("caf\u{e9}"),
            Err(RenderError::Symbology { .. })
        ));
        assert!(Symbology::Code128.encode(&"A".repeat(81)).is_err());
    }

    #[test]
    fn barcode_raster_is_materialized() {
        let dir = tempdir().unwrap();
        let renderer = LinearBarcodeRenderer::new(Symbology::Code128, dir.path().join("nested"));
        let id = Identifier::new("01J9ZQ3V4X8K2M7N5P6R0S1T2V");

        let raster = renderer.render(id.as_str(), &id).unwrap();

        assert!(raster.path.exists());
        assert_eq!(raster.kind, SymbolKind::Barcode);
        assert_eq!(raster.height, BAR_HEIGHT_PX);
        let decoded = image::open(&raster.path).unwrap().to_luma8();
        // Quiet zone is light, first bar right after it is dark.
        assert_eq!(decoded.get_pixel(0, 0), &LIGHT);
        assert_eq!(
            decoded.get_pixel(BAR_QUIET_MODULES * BAR_MODULE_PX, BAR_HEIGHT_PX / 2),
            &DARK
        );
    }

    #[test]
    fn qr_raster_is_square_with_quiet_zone() {
        let dir = tempdir().unwrap();
        let renderer = QrRenderer::new(dir.path());
        let id = Identifier::new("qr-unit");

        let raster = renderer
            .render("Product: Widget-42, ID: 01J9ZQ3V4X8K2M7N5P6R0S1T2V", &id)
            .unwrap();

        assert_eq!(raster.width, raster.height);
        assert_eq!(raster.kind, SymbolKind::Qr);
        let decoded = image::open(&raster.path).unwrap().to_luma8();
        assert_eq!(decoded.get_pixel(0, 0), &LIGHT);
        // Finder pattern corner.
        let corner = QR_QUIET_MODULES * QR_MODULE_PX;
        assert_eq!(decoded.get_pixel(corner, corner), &DARK);
    }
}
