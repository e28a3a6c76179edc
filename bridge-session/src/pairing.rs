use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bridge_core::{BridgeError, BridgeResult};
use qrcode::render::svg;
use qrcode::QrCode;

/// Turns a pairing payload into something a person can scan.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
pub trait PairingRenderer: Send + Sync {
    /// Returns the rendered payload as a `data:` URI.
    fn render(&self, payload: &str) -> BridgeResult<String>;
}

pub struct QrPairingRenderer {
    min_size: u32,
}

impl QrPairingRenderer {
    pub fn new(min_size: u32) -> Self {
        Self { min_size }
    }
}

impl Default for QrPairingRenderer {
    fn default() -> Self {
        Self::new(256)
    }
}

impl PairingRenderer for QrPairingRenderer {
    fn render(&self, payload: &str) -> BridgeResult<String> {
        let code = QrCode::new(payload.as_bytes())
            .map_err(|e| BridgeError::Render(format!("QR encoding failed: {}", e)))?;

        let image = code
            .render::<svg::Color>()
            .min_dimensions(self.min_size, self.min_size)
            .dark_color(svg::Color("#000000"))
            .light_color(svg::Color("#FFFFFF"))
            .build();

        Ok(format!("data:image/svg+xml;base64,{}", STANDARD.encode(image)))
    }
}
