//! Streaming `multipart/form-data` decoder for firmware uploads.
//!
//! The HTTP server hands the request body over in reads of whatever size the
//! socket delivers, so a boundary can be split across any two reads. The decoder
//! keeps just enough of the tail to recognise a split boundary and reports file
//! parts as `Start`, `Data`, `End` events. Parts without a file name (plain form
//! fields) are skipped.

use log::{debug, trace};
use thiserror::Error;

const MAX_HEADER_BYTES: usize = 8 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MultipartError {
    #[error("content type has no multipart boundary")]
    MissingBoundary,

    #[error("malformed part delimiter")]
    BadDelimiter,

    #[error("part headers exceed {0} bytes")]
    HeadersTooLarge(usize),

    #[error("body ended before the closing boundary")]
    UnexpectedEof,
}

#[derive(Debug, PartialEq, Eq)]
pub enum MultipartEvent<'a> {
    Start { field: String, filename: String },
    Data(&'a [u8]),
    End,
}

/// Extract the boundary from a `multipart/form-data` content type.
pub fn boundary_from_content_type(content_type: &str) -> Option<String> {
    let mut params = content_type.split(';');
    let mime = params.next()?.trim();
    if !mime.eq_ignore_ascii_case("multipart/form-data") {
        return None;
    }
    params.find_map(|param| {
        let (key, value) = param.split_once('=')?;
        if !key.trim().eq_ignore_ascii_case("boundary") {
            return None;
        }
        let value = value.trim().trim_matches('"');
        (!value.is_empty()).then(|| value.to_string())
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Preamble,
    AfterDelimiter,
    Headers,
    Body { file: bool },
    Done,
}

#[derive(Debug)]
pub struct MultipartDecoder {
    delimiter: Vec<u8>,
    buf: Vec<u8>,
    stage: Stage,
}

impl MultipartDecoder {
    pub fn new(boundary: &str) -> Self {
        let mut delimiter = b"\r\n--".to_vec();
        delimiter.extend_from_slice(boundary.as_bytes());
        Self {
            delimiter,
            // The first delimiter has no leading CRLF
            buf: b"\r\n".to_vec(),
            stage: Stage::Preamble,
        }
    }

    pub fn from_content_type(content_type: &str) -> Result<Self, MultipartError> {
        boundary_from_content_type(content_type)
            .map(|b| Self::new(&b))
            .ok_or(MultipartError::MissingBoundary)
    }

    pub fn is_done(&self) -> bool {
        self.stage == Stage::Done
    }

    /// Feed the next piece of the body, reporting file events to `on_event`.
    pub fn feed<E>(
        &mut self,
        input: &[u8],
        mut on_event: impl FnMut(MultipartEvent<'_>) -> Result<(), E>,
    ) -> Result<(), E>
    where
        E: From<MultipartError>,
    {
        if self.stage == Stage::Done {
            return Ok(());
        }
        self.buf.extend_from_slice(input);

        loop {
            match self.stage {
                Stage::Preamble => match find(&self.buf, &self.delimiter) {
                    Some(at) => {
                        self.buf.drain(..at + self.delimiter.len());
                        self.stage = Stage::AfterDelimiter;
                    }
                    None => {
                        let keep = self.delimiter.len() - 1;
                        let drop = self.buf.len().saturating_sub(keep);
                        self.buf.drain(..drop);
                        return Ok(());
                    }
                },
                Stage::AfterDelimiter => {
                    if self.buf.starts_with(b"--") {
                        trace!("multipart: closing delimiter");
                        self.buf.clear();
                        self.stage = Stage::Done;
                        return Ok(());
                    }
                    // Transport padding (spaces, tabs) may precede the CRLF
                    let pad = self
                        .buf
                        .iter()
                        .take_while(|b| matches!(b, b' ' | b'\t'))
                        .count();
                    if self.buf.len() < pad + 2 {
                        if pad > MAX_HEADER_BYTES {
                            return Err(MultipartError::HeadersTooLarge(MAX_HEADER_BYTES).into());
                        }
                        return Ok(());
                    }
                    if &self.buf[pad..pad + 2] != b"\r\n" {
                        return Err(MultipartError::BadDelimiter.into());
                    }
                    self.buf.drain(..pad + 2);
                    self.stage = Stage::Headers;
                }
                Stage::Headers => {
                    let Some(end) = find(&self.buf, b"\r\n\r\n") else {
                        if self.buf.len() > MAX_HEADER_BYTES {
                            return Err(MultipartError::HeadersTooLarge(MAX_HEADER_BYTES).into());
                        }
                        return Ok(());
                    };
                    let disposition = parse_disposition(&self.buf[..end]);
                    self.buf.drain(..end + 4);

                    let file = match disposition {
                        Some((field, Some(filename))) => {
                            debug!("multipart: file part {field:?} ({filename})");
                            on_event(MultipartEvent::Start { field, filename })?;
                            true
                        }
                        Some((field, None)) => {
                            debug!("multipart: skipping form field {field:?}");
                            false
                        }
                        None => false,
                    };
                    self.stage = Stage::Body { file };
                }
                Stage::Body { file } => match find(&self.buf, &self.delimiter) {
                    Some(at) => {
                        if file {
                            if at > 0 {
                                on_event(MultipartEvent::Data(&self.buf[..at]))?;
                            }
                            on_event(MultipartEvent::End)?;
                        }
                        self.buf.drain(..at + self.delimiter.len());
                        self.stage = Stage::AfterDelimiter;
                    }
                    None => {
                        // A delimiter may start in the last few bytes
                        let keep = self.delimiter.len() - 1;
                        let safe = self.buf.len().saturating_sub(keep);
                        if file && safe > 0 {
                            on_event(MultipartEvent::Data(&self.buf[..safe]))?;
                        }
                        self.buf.drain(..safe);
                        return Ok(());
                    }
                },
                Stage::Done => return Ok(()),
            }
        }
    }

    /// Call once the body is exhausted.
    pub fn finish(&self) -> Result<(), MultipartError> {
        if self.stage == Stage::Done {
            Ok(())
        } else {
            Err(MultipartError::UnexpectedEof)
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// `(name, filename)` from the part's Content-Disposition header.
fn parse_disposition(headers: &[u8]) -> Option<(String, Option<String>)> {
    let text = String::from_utf8_lossy(headers);
    let value = text.split("\r\n").find_map(|line| {
        let (name, value) = line.split_once(':')?;
        name.trim()
            .eq_ignore_ascii_case("content-disposition")
            .then_some(value)
    })?;

    let mut field = None;
    let mut filename = None;
    for param in value.split(';').skip(1) {
        let Some((key, val)) = param.split_once('=') else {
            continue;
        };
        let val = val.trim().trim_matches('"').to_string();
        match key.trim().to_ascii_lowercase().as_str() {
            "name" => field = Some(val),
            "filename" => filename = Some(val),
            _ => {}
        }
    }
    Some((field.unwrap_or_default(), filename))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const BOUNDARY: &str = "----WebKitFormBoundary7MA4YWxkTrZu0gW";

    fn upload_body(payload: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
        body.extend_from_slice(b"Content-Disposition: form-data; name=\"note\"\r\n\r\nhello\r\n");
        body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
        body.extend_from_slice(
            b"Content-Disposition: form-data; name=\"update\"; filename=\"firmware.bin\"\r\n",
        );
        body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
        body.extend_from_slice(payload);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    #[derive(Debug, Default)]
    struct Collected {
        starts: Vec<(String, String)>,
        data: Vec<u8>,
        ends: usize,
    }

    fn decode(body: &[u8], cuts: &[usize]) -> Result<Collected, MultipartError> {
        let mut decoder = MultipartDecoder::new(BOUNDARY);
        let mut out = Collected::default();
        let mut start = 0;
        for &cut in cuts.iter().chain(std::iter::once(&body.len())) {
            decoder.feed(&body[start..cut], |event| {
                match event {
                    MultipartEvent::Start { field, filename } => out.starts.push((field, filename)),
                    MultipartEvent::Data(bytes) => out.data.extend_from_slice(bytes),
                    MultipartEvent::End => out.ends += 1,
                }
                Ok::<(), MultipartError>(())
            })?;
            start = cut;
        }
        decoder.finish()?;
        Ok(out)
    }

    #[test]
    fn parses_boundary_from_content_type() {
        assert_eq!(
            boundary_from_content_type(&format!("multipart/form-data; boundary={BOUNDARY}")),
            Some(BOUNDARY.to_string())
        );
        assert_eq!(
            boundary_from_content_type("Multipart/Form-Data; charset=utf-8; boundary=\"abc\""),
            Some("abc".to_string())
        );
        assert_eq!(boundary_from_content_type("application/octet-stream"), None);
        assert_eq!(boundary_from_content_type("multipart/form-data"), None);
    }

    #[test]
    fn extracts_file_part_only() {
        let out = decode(&upload_body(b"\xE9\x03binary\r\n--not-a-boundary"), &[]).unwrap();
        assert_eq!(out.starts, vec![("update".to_string(), "firmware.bin".to_string())]);
        assert_eq!(out.data, b"\xE9\x03binary\r\n--not-a-boundary");
        assert_eq!(out.ends, 1);
    }

    #[test]
    fn truncated_body_is_reported() {
        let body = upload_body(b"abc");
        let err = decode(&body[..body.len() - 10], &[]).unwrap_err();
        assert_eq!(err, MultipartError::UnexpectedEof);
    }

    #[test]
    fn garbage_after_delimiter_is_rejected() {
        let body = format!("--{BOUNDARY}XX\r\n");
        assert_eq!(
            decode(body.as_bytes(), &[]).unwrap_err(),
            MultipartError::BadDelimiter
        );
    }

    #[test]
    fn padding_after_delimiter_is_skipped() {
        let body = upload_body(b"payload");
        let text = String::from_utf8(body).unwrap();
        let padded = text.replacen(&format!("--{BOUNDARY}\r\n"), &format!("--{BOUNDARY} \t \r\n"), 1);
        let at = padded.find(" \t").unwrap() + 1;

        let out = decode(padded.as_bytes(), &[at]).unwrap();
        assert_eq!(out.starts.len(), 1);
        assert_eq!(out.data, b"payload");
        assert_eq!(out.ends, 1);
    }

    #[test]
    fn oversized_headers_are_rejected() {
        let mut body = format!("--{BOUNDARY}\r\n").into_bytes();
        body.extend(std::iter::repeat(b'x').take(MAX_HEADER_BYTES + 1));
        assert_eq!(
            decode(&body, &[]).unwrap_err(),
            MultipartError::HeadersTooLarge(MAX_HEADER_BYTES)
        );
    }

    #[test]
    fn callback_errors_stop_decoding() {
        let body = upload_body(&[0u8; 100]);
        let mut decoder = MultipartDecoder::new(BOUNDARY);
        let result = decoder.feed(&body, |event| match event {
            MultipartEvent::Data(_) => Err(MultipartError::BadDelimiter),
            _ => Ok(()),
        });
        assert_eq!(result, Err(MultipartError::BadDelimiter));
    }

    proptest! {
        #[test]
        fn same_bytes_for_every_split(
            payload in proptest::collection::vec(any::<u8>(), 0..1500),
            cuts in proptest::collection::vec(0usize..1800, 0..10),
        ) {
            let body = upload_body(&payload);
            let mut cuts: Vec<usize> = cuts.into_iter().map(|c| c.min(body.len())).collect();
            cuts.sort_unstable();

            let out = decode(&body, &cuts).unwrap();
            prop_assert_eq!(out.starts.len(), 1);
            prop_assert_eq!(out.ends, 1);
            prop_assert_eq!(out.data, payload);
        }
    }
}
