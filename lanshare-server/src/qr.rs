//! Terminal QR code for the LAN address, so phones can join by scanning.

use lanshare_core::{Locale, MessageKey};
use qrcode::{QrCode, render::unicode::Dense1x2};

use crate::error::ServerError;

/// Renders `url` as half-height unicode blocks, light modules drawn dark so the
/// code scans on a dark terminal background.
pub fn render_qr(url: &str) -> Result<String, ServerError> {
    let code = QrCode::new(url.as_bytes())
        .map_err(|err| ServerError::Internal(format!("qr encoding failed: {err}")))?;
    Ok(code
        .render::<Dense1x2>()
        .dark_color(Dense1x2::Light)
        .light_color(Dense1x2::Dark)
        .build())
}

/// Text printed once the listener is bound.
pub fn startup_banner(url: &str, with_qr: bool) -> Result<String, ServerError> {
    let mut banner = format!("{} {url}", Locale::En.text(MessageKey::ServerUrl));
    if with_qr {
        banner.push('\n');
        banner.push_str(&render_qr(url)?);
    }
    Ok(banner)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLOCKS: [char; 4] = [' ', '\u{2580}', '\u{2584}', '\u{2588}'];

    #[test]
    fn qr_block_is_a_rectangle_of_half_blocks() {
        let url = "http://192.168.1.20:5000";
        let rendered = render_qr(url).unwrap();
        let lines: Vec<&str> = rendered.lines().collect();
        let modules = QrCode::new(url.as_bytes()).unwrap().width();

        let width = lines[0].chars().count();
        assert!(width > modules, "quiet zone missing: {width} <= {modules}");
        assert!(lines.iter().all(|line| line.chars().count() == width));
        // two module rows per text line
        assert!(lines.len() * 2 >= width);
        assert!(lines.len() * 2 <= width + 1);
        assert!(rendered.chars().all(|c| c == '\n' || BLOCKS.contains(&c)));
        assert!(rendered.contains('\u{2588}'));
    }

    #[test]
    fn different_addresses_render_differently() {
        let a = render_qr("http://192.168.1.20:5000").unwrap();
        let b = render_qr("http://192.168.1.21:5000").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn banner_leads_with_the_url() {
        let url = "http://10.0.0.7:5000";
        let plain = startup_banner(url, false).unwrap();
        assert_eq!(plain, "URL: http://10.0.0.7:5000");

        let with_qr = startup_banner(url, true).unwrap();
        assert!(with_qr.starts_with("URL: http://10.0.0.7:5000\n"));
        assert_eq!(with_qr.lines().count(), 1 + render_qr(url).unwrap().lines().count());
    }
}
