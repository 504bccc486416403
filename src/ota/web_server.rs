// Web server for OTA updates - login page, upload page, upload endpoint and status

use anyhow::Result;
use embedded_svc::http::Headers;
use esp_idf_svc::http::server::{Configuration, EspHttpServer};
use esp_idf_svc::http::Method;
use esp_idf_svc::io::{Read, Write};
use std::sync::{Arc, Mutex, TryLockError};
use std::time::Duration;

use update_core::{
    receive_upload, BodyKind, UpdateConfig, UpdateReport, UpdateSession,
    UploadDriver,
};

use super::flash::EspOtaFlash;
use super::pages::{LOGIN_PAGE, UPLOAD_PAGE};
use super::restart::EspRestart;
use super::status::OtaStatus;
use crate::network::compression::write_page;

const UPLOAD_BUFFER_SIZE: usize = 4096;

pub struct OtaWebServer {
    _server: EspHttpServer<'static>,
}

impl OtaWebServer {
    pub fn new(port: u16, flash: Arc<Mutex<EspOtaFlash>>, update: UpdateConfig) -> Result<Self> {
        let server_config = Configuration {
            http_port: port,
            stack_size: 10240,
            ..Default::default()
        };
        let mut server = EspHttpServer::new(&server_config)?;
        let last_report: Arc<Mutex<Option<UpdateReport>>> = Arc::new(Mutex::new(None));

        server.fn_handler("/", Method::Get, |req| write_page(req, LOGIN_PAGE.as_bytes()))?;

        server.fn_handler("/serverIndex", Method::Get, |req| {
            write_page(req, UPLOAD_PAGE.as_bytes())
        })?;

        // Firmware upload
        let flash_upload = flash.clone();
        let report_upload = last_report.clone();
        server.fn_handler("/update", Method::Post, move |mut req| {
            let body = BodyKind::from_content_type(req.header("Content-Type"));
            // Larger than the address space means unknown, not truncated
            let content_length = req.content_len().and_then(|len| usize::try_from(len).ok());

            // One upload at a time
            let mut flash = match flash_upload.try_lock() {
                Ok(guard) => guard,
                Err(TryLockError::WouldBlock) => {
                    log::warn!("Rejecting upload, another update is in progress");
                    let mut response = req.into_response(
                        409,
                        Some("Conflict"),
                        &[("Content-Type", "text/plain"), ("Connection", "close")],
                    )?;
                    response.write_all(b"FAIL")?;
                    return Ok::<(), anyhow::Error>(());
                }
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            };

            let session = UpdateSession::from_config(&mut *flash, &update)?;
            let mut buffer = vec![0u8; UPLOAD_BUFFER_SIZE];
            let outcome = receive_upload(
                UploadDriver::new(session),
                body,
                content_length,
                &mut buffer,
                |buf| req.read(buf),
            );
            drop(flash);

            match report_upload.lock() {
                Ok(mut last) => *last = Some(outcome.report.clone()),
                Err(e) => log::error!("Failed to store OTA report: {}", e),
            }

            let restart = EspRestart {
                delay: Duration::from_millis(update.restart_delay_ms),
            };
            outcome.respond(
                |text| -> Result<()> {
                    let mut response = req.into_response(
                        200,
                        Some("OK"),
                        &[("Content-Type", "text/plain"), ("Connection", "close")],
                    )?;
                    response.write_all(text.as_bytes())?;
                    response.flush()?;
                    Ok(())
                },
                &restart,
            );
            Ok(())
        })?;

        // OTA status endpoint
        server.fn_handler("/api/ota/status", Method::Get, move |req| {
            let (busy, running_partition) = match flash.try_lock() {
                Ok(flash) => (false, flash.running_label()),
                Err(TryLockError::WouldBlock) => (true, None),
                Err(TryLockError::Poisoned(poisoned)) => (false, poisoned.into_inner().running_label()),
            };
            let last_update = match last_report.lock() {
                Ok(last) => last.clone(),
                Err(e) => {
                    log::error!("Failed to lock OTA report: {}", e);
                    None
                }
            };
            let status = OtaStatus {
                busy,
                running_partition,
                last_update,
            };

            let mut response = req.into_response(
                200,
                Some("OK"),
                &[("Content-Type", "application/json")],
            )?;
            response.write_all(status.to_json().as_bytes())?;
            Ok::<(), anyhow::Error>(())
        })?;

        log::info!("OTA endpoints registered on port {}", port);
        Ok(Self { _server: server })
    }
}
