use anyhow::Result;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::Write;

/// Pages below this size are sent as they are
pub const MIN_COMPRESS_LEN: usize = 1000;

/// Compress data using gzip
pub fn gzip_compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

pub fn accepts_gzip(accept_encoding: Option<&str>) -> bool {
    accept_encoding
        .unwrap_or("")
        .split(',')
        .any(|enc| enc.trim().split(';').next() == Some("gzip"))
}

/// Write an HTML page, gzipped if the client supports it
#[cfg(target_os = "espidf")]
pub fn write_page<'a>(
    req: esp_idf_svc::http::server::Request<&mut esp_idf_svc::http::server::EspHttpConnection<'a>>,
    content: &[u8],
) -> Result<()> {
    use embedded_svc::http::Headers;
    use esp_idf_svc::io::Write as EspWrite;

    const HTML: &str = "text/html; charset=utf-8";

    if accepts_gzip(req.header("Accept-Encoding")) && content.len() > MIN_COMPRESS_LEN {
        match gzip_compress(content) {
            Ok(compressed) => {
                log::debug!("Compressed {} bytes to {} bytes", content.len(), compressed.len());
                let mut response = req.into_response(
                    200,
                    Some("OK"),
                    &[
                        ("Content-Type", HTML),
                        ("Content-Encoding", "gzip"),
                        ("Vary", "Accept-Encoding"),
                        ("Connection", "close"),
                    ],
                )?;
                response.write_all(&compressed)?;
                return Ok(());
            }
            Err(e) => log::warn!("Compression failed: {}", e),
        }
    }

    let mut response = req.into_response(
        200,
        Some("OK"),
        &[("Content-Type", HTML), ("Connection", "close")],
    )?;
    response.write_all(content)?;
    Ok(())
}
