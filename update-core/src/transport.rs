//! Maps an HTTP upload onto session calls.
//!
//! The HTTP layer only has to say what kind of body it got and hand over a
//! `read` function; [`receive_upload`] turns that into `begin`, `write`, `end`
//! (or `abort`) on the session and produces the client's `OK`/`FAIL` answer.

use std::fmt;

use log::{error, info, warn};
use thiserror::Error;

use crate::error::{ErrorKind, UpdateError};
use crate::flash::FlashStorage;
use crate::multipart::{boundary_from_content_type, MultipartDecoder, MultipartError, MultipartEvent};
use crate::report::UpdateReport;
use crate::restart::{restart_if_committed, Restart};
use crate::session::{UpdateSession, UpdateState};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("reading request body failed: {0}")]
    Read(String),

    #[error("malformed upload: {0}")]
    Multipart(#[from] MultipartError),

    #[error(transparent)]
    Update(#[from] UpdateError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BodyKind {
    /// `multipart/form-data` from the upload page.
    Multipart { boundary: String },
    /// The body is the image itself.
    Raw,
}

impl BodyKind {
    pub fn from_content_type(content_type: Option<&str>) -> Self {
        match content_type.and_then(boundary_from_content_type) {
            Some(boundary) => BodyKind::Multipart { boundary },
            None => BodyKind::Raw,
        }
    }
}

#[derive(Debug)]
pub enum UploadEvent<'a> {
    Start {
        filename: Option<String>,
        expected_size: Option<usize>,
    },
    Write(&'a [u8]),
    End,
    Abort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Waiting,
    Streaming,
    Done,
}

/// Feeds upload events into one session. Only the first file of an upload is
/// flashed; later file parts are ignored.
pub struct UploadDriver<'f, F: FlashStorage> {
    session: UpdateSession<'f, F>,
    phase: Phase,
    filename: Option<String>,
    error: Option<TransportError>,
}

impl<'f, F: FlashStorage> UploadDriver<'f, F> {
    pub fn new(session: UpdateSession<'f, F>) -> Self {
        Self {
            session,
            phase: Phase::Waiting,
            filename: None,
            error: None,
        }
    }

    pub fn session(&self) -> &UpdateSession<'f, F> {
        &self.session
    }

    pub fn handle(&mut self, event: UploadEvent<'_>) -> Result<(), UpdateError> {
        match event {
            UploadEvent::Start {
                filename,
                expected_size,
            } => {
                if self.phase != Phase::Waiting {
                    warn!("Upload: ignoring extra file {filename:?}");
                    return Ok(());
                }
                match &filename {
                    Some(name) => info!("Update: {name}"),
                    None => info!("Update: raw image upload"),
                }
                self.filename = filename;
                self.phase = Phase::Streaming;
                self.session.begin(expected_size)
            }
            UploadEvent::Write(chunk) => {
                if self.phase == Phase::Done {
                    return Ok(());
                }
                self.session.write(chunk).map(|_| ())
            }
            UploadEvent::End => {
                if self.phase == Phase::Done {
                    return Ok(());
                }
                self.phase = Phase::Done;
                self.session.end()?;
                info!("Update success: {} bytes", self.session.bytes_written());
                Ok(())
            }
            UploadEvent::Abort => {
                self.phase = Phase::Done;
                self.session.abort()
            }
        }
    }

    fn on_multipart(&mut self, event: MultipartEvent<'_>) -> Result<(), TransportError> {
        let event = match event {
            MultipartEvent::Start { filename, .. } => UploadEvent::Start {
                filename: Some(filename),
                expected_size: None,
            },
            MultipartEvent::Data(bytes) => UploadEvent::Write(bytes),
            MultipartEvent::End => UploadEvent::End,
        };
        Ok(self.handle(event)?)
    }

    /// Abort on a transport fault and remember what went wrong.
    fn fail(&mut self, err: TransportError) {
        if !matches!(err, TransportError::Update(_)) {
            error!("Upload: {err}");
        }
        if !self.session.state().is_terminal() {
            let _ = self.handle(UploadEvent::Abort);
        }
        self.error = Some(err);
    }

    pub fn finish(self) -> UploadOutcome {
        UploadOutcome {
            report: self.session.report(),
            filename: self.filename,
            error: self.error,
        }
    }
}

/// Result of one `POST /update`.
#[derive(Debug, Clone)]
pub struct UploadOutcome {
    pub report: UpdateReport,
    pub filename: Option<String>,
    pub error: Option<TransportError>,
}

impl UploadOutcome {
    pub fn state(&self) -> UpdateState {
        self.report.state
    }

    pub fn is_ok(&self) -> bool {
        self.report.state == UpdateState::Committed
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.report.last_error
    }

    /// `OK` or `FAIL`, the body of the HTTP response.
    pub fn status_text(&self) -> &'static str {
        self.report.status_text()
    }

    /// Send the `OK`/`FAIL` answer through `send`, then restart if committed.
    ///
    /// A committed image is already the boot target, so a client that went
    /// away before reading the answer does not prevent the restart.
    pub fn respond<S, E>(&self, send: S, restart: &dyn Restart) -> bool
    where
        S: FnOnce(&str) -> Result<(), E>,
        E: fmt::Display,
    {
        if let Err(e) = send(self.status_text()) {
            warn!("Failed to send upload response ({}): {e}", self.status_text());
        }
        restart_if_committed(self.state(), restart)
    }
}

impl fmt::Display for UploadOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.error, self.error_kind()) {
            (Some(err), _) => write!(f, "{} ({err})", self.status_text()),
            (None, Some(kind)) => write!(f, "{} ({kind})", self.status_text()),
            (None, None) => write!(f, "{} ({} bytes)", self.status_text(), self.report.bytes_written),
        }
    }
}

/// Pump a request body through `driver` using `buf` as the read buffer.
///
/// `read` behaves like `std::io::Read::read`: `Ok(0)` is the end of the body.
/// For raw bodies `content_length` is taken as the declared image size.
pub fn receive_upload<F, R, E>(
    mut driver: UploadDriver<'_, F>,
    body: BodyKind,
    content_length: Option<usize>,
    buf: &mut [u8],
    mut read: R,
) -> UploadOutcome
where
    F: FlashStorage,
    R: FnMut(&mut [u8]) -> Result<usize, E>,
    E: fmt::Display,
{
    let result = match body {
        BodyKind::Raw => pump_raw(&mut driver, content_length, buf, &mut read),
        BodyKind::Multipart { boundary } => pump_multipart(&mut driver, &boundary, buf, &mut read),
    };
    if let Err(err) = result {
        driver.fail(err);
    }

    let outcome = driver.finish();
    info!("Upload finished: {outcome}");
    outcome
}

fn pump_raw<F, R, E>(
    driver: &mut UploadDriver<'_, F>,
    content_length: Option<usize>,
    buf: &mut [u8],
    read: &mut R,
) -> Result<(), TransportError>
where
    F: FlashStorage,
    R: FnMut(&mut [u8]) -> Result<usize, E>,
    E: fmt::Display,
{
    driver.handle(UploadEvent::Start {
        filename: None,
        expected_size: content_length.filter(|&len| len > 0),
    })?;
    loop {
        let n = read(buf).map_err(|e| TransportError::Read(e.to_string()))?;
        if n == 0 {
            break;
        }
        driver.handle(UploadEvent::Write(&buf[..n]))?;
    }
    driver.handle(UploadEvent::End)?;
    Ok(())
}

fn pump_multipart<F, R, E>(
    driver: &mut UploadDriver<'_, F>,
    boundary: &str,
    buf: &mut [u8],
    read: &mut R,
) -> Result<(), TransportError>
where
    F: FlashStorage,
    R: FnMut(&mut [u8]) -> Result<usize, E>,
    E: fmt::Display,
{
    let mut decoder = MultipartDecoder::new(boundary);
    loop {
        let n = read(buf).map_err(|e| TransportError::Read(e.to_string()))?;
        if n == 0 {
            break;
        }
        decoder.feed(&buf[..n], |event| driver.on_multipart(event))?;
    }
    decoder.finish()?;

    // No file part at all
    if driver.phase == Phase::Waiting {
        driver.handle(UploadEvent::End)?;
    }
    Ok(())
}
