//! Host-based tests for the ESP32 web OTA updater
//! These tests run on the development machine, not on the ESP32

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use proptest::prelude::*;
    use sha2::{Digest, Sha256};
    use update_core::multipart::MultipartError;
    use update_core::transport::TransportError;
    use update_core::{
        receive_upload, restart_if_committed, BodyKind, ErrorKind, RamFlash, Restart, SlotId,
        UpdateConfig, UpdateSession, UpdateState, UploadDriver,
    };

    const RUNNING: &[u8] = b"factory firmware v1";
    const SLOT_SIZE: usize = 64 * 1024;

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn device() -> RamFlash {
        RamFlash::new(SLOT_SIZE)
            .with_block_size(256)
            .with_running_image(RUNNING)
    }

    /// ESP32 app image: 24-byte header, filler, SHA-256 trailer.
    fn app_image(body_len: usize) -> Vec<u8> {
        let mut image = vec![
            0xE9, 0x04, 0x02, 0x20, // magic, segments, flash mode, flash config
            0x00, 0x00, 0x08, 0x40, // entry point
            0xEE, 0x00, 0x00, 0x00, // wp pin, drive settings
            0x00, 0x00, // chip id (ESP32)
            0x00, // min rev
            0x00, 0x00, 0x8F, 0x01, // min/max chip rev full
            0x00, 0x00, 0x00, 0x00, // reserved
            0x01, // append digest
        ];
        assert_eq!(image.len(), 24);
        image.extend((0..body_len).map(|i| (i * 7 % 256) as u8));
        let digest = Sha256::digest(&image);
        image.extend_from_slice(&digest);
        image
    }

    fn multipart_body(boundary: &str, filename: &str, payload: &[u8]) -> Vec<u8> {
        let mut body = format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"update\"; filename=\"{filename}\"\r\n\
             Content-Type: application/octet-stream\r\n\r\n"
        )
        .into_bytes();
        body.extend_from_slice(payload);
        body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
        body
    }

    /// Reads `body` in pieces of `step` bytes, like a socket would.
    fn socket(body: &[u8], step: usize) -> impl FnMut(&mut [u8]) -> Result<usize, String> + '_ {
        let mut pos = 0;
        move |buf: &mut [u8]| {
            let n = step.min(buf.len()).min(body.len() - pos);
            buf[..n].copy_from_slice(&body[pos..pos + n]);
            pos += n;
            Ok(n)
        }
    }

    #[derive(Default)]
    struct RestartCounter(Cell<u32>);

    impl Restart for RestartCounter {
        fn restart(&self) {
            self.0.set(self.0.get() + 1);
        }
    }

    #[test]
    fn unknown_size_upload_commits_3072_bytes() {
        init_logging();
        let mut flash = device();
        let mut session = UpdateSession::new(&mut flash);

        session.begin(None).unwrap();
        session.write(&[0xA5; 1024]).unwrap();
        session.write(&[0x5A; 2048]).unwrap();
        session.end().unwrap();

        assert_eq!(session.state(), UpdateState::Committed);
        assert_eq!(session.bytes_written(), 3072);
        drop(session);
        assert_eq!(flash.boot_slot(), SlotId(1));
    }

    #[test]
    fn declared_size_overflow_fails() {
        init_logging();
        let mut flash = device();
        let mut session = UpdateSession::new(&mut flash);

        session.begin(Some(4096)).unwrap();
        let err = session.write(&vec![0u8; 4097]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OverflowError);
        assert_eq!(session.state(), UpdateState::Failed);
        assert!(session.write(&[1]).is_err());
        drop(session);
        assert_eq!(flash.boot_image(), RUNNING);
    }

    #[test]
    fn abort_keeps_old_image() {
        init_logging();
        let mut flash = device();
        let mut session = UpdateSession::new(&mut flash);

        session.begin(None).unwrap();
        session.write(&[0xFF; 10]).unwrap();
        session.abort().unwrap();
        assert_eq!(session.state(), UpdateState::Failed);
        assert_eq!(session.abort(), Ok(()));
        drop(session);

        assert!(!flash.is_reserved());
        assert_eq!(flash.boot_slot(), SlotId(0));
        assert_eq!(flash.boot_image(), RUNNING);
    }

    #[test]
    fn browser_upload_of_real_image_restarts_once() {
        init_logging();
        let image = app_image(20_000);
        let body = multipart_body("----WebKitFormBoundaryQ1w2E3", "firmware.bin", &image);
        let kind = BodyKind::from_content_type(Some(
            "multipart/form-data; boundary=----WebKitFormBoundaryQ1w2E3",
        ));

        let mut flash = device();
        let session = UpdateSession::from_config(&mut flash, &UpdateConfig::default()).unwrap();
        let mut buf = vec![0u8; 4096];
        let outcome = receive_upload(
            UploadDriver::new(session),
            kind,
            Some(body.len()),
            &mut buf,
            socket(&body, 1460),
        );

        assert_eq!(outcome.status_text(), "OK");
        assert_eq!(outcome.filename.as_deref(), Some("firmware.bin"));
        assert_eq!(outcome.report.bytes_written, image.len());
        assert_eq!(flash.boot_image(), image.as_slice());

        let restarts = RestartCounter::default();
        assert!(restart_if_committed(outcome.state(), &restarts));
        assert_eq!(restarts.0.get(), 1);
    }

    #[test]
    fn corrupted_image_is_refused_and_device_stays_up() {
        init_logging();
        let mut image = app_image(5000);
        image[3000] ^= 0x40;
        let body = multipart_body("b0undary", "firmware.bin", &image);

        let mut flash = device();
        let session = UpdateSession::from_config(&mut flash, &UpdateConfig::default()).unwrap();
        let mut buf = vec![0u8; 1024];
        let outcome = receive_upload(
            UploadDriver::new(session),
            BodyKind::Multipart {
                boundary: "b0undary".to_string(),
            },
            None,
            &mut buf,
            socket(&body, 700),
        );

        assert_eq!(outcome.status_text(), "FAIL");
        assert_eq!(outcome.error_kind(), Some(ErrorKind::ValidationError));
        assert!(outcome.report.message.as_deref().unwrap().contains("appended-digest"));

        let restarts = RestartCounter::default();
        assert!(!restart_if_committed(outcome.state(), &restarts));
        assert_eq!(restarts.0.get(), 0);
        assert_eq!(flash.boot_image(), RUNNING);
    }

    #[test]
    fn wrong_chip_is_refused() {
        init_logging();
        let image = app_image(100);
        let mut config = UpdateConfig::default();
        config.validation.chip_id = Some(9);

        let mut flash = device();
        let mut session = UpdateSession::from_config(&mut flash, &config).unwrap();
        session.begin(Some(image.len())).unwrap();
        session.write(&image).unwrap();
        let err = session.end().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationError);
        assert!(err.to_string().contains("chip id"));
    }

    #[test]
    fn pinned_digest_only_accepts_that_image() {
        init_logging();
        let wanted = app_image(300);
        let other = app_image(301);
        let config = UpdateConfig {
            validation: update_core::ValidationConfig {
                expected_sha256: Some(
                    Sha256::digest(&wanted)
                        .iter()
                        .map(|b| format!("{b:02x}"))
                        .collect(),
                ),
                ..Default::default()
            },
            ..UpdateConfig::default()
        };

        for (image, accepted) in [(&other, false), (&wanted, true)] {
            let mut flash = device();
            let mut session = UpdateSession::from_config(&mut flash, &config).unwrap();
            session.begin(None).unwrap();
            session.write(image).unwrap();
            assert_eq!(session.end().is_ok(), accepted);
        }
    }

    #[test]
    fn raw_octet_stream_upload() {
        init_logging();
        let image = app_image(3000);
        let mut flash = device();
        let session = UpdateSession::from_config(&mut flash, &UpdateConfig::default()).unwrap();
        let mut buf = vec![0u8; 512];

        let outcome = receive_upload(
            UploadDriver::new(session),
            BodyKind::from_content_type(Some("application/octet-stream")),
            Some(image.len()),
            &mut buf,
            socket(&image, 512),
        );
        assert!(outcome.is_ok());
        assert_eq!(outcome.report.expected_size, Some(image.len()));
        assert_eq!(outcome.report.progress_percent, Some(100));
    }

    #[test]
    fn connection_dropped_mid_upload() {
        init_logging();
        let image = app_image(10_000);
        let body = multipart_body("zz", "fw.bin", &image);
        let cut = &body[..body.len() / 2];

        let mut flash = device();
        let session = UpdateSession::from_config(&mut flash, &UpdateConfig::default()).unwrap();
        let mut buf = vec![0u8; 1024];
        let outcome = receive_upload(
            UploadDriver::new(session),
            BodyKind::Multipart {
                boundary: "zz".to_string(),
            },
            None,
            &mut buf,
            socket(cut, 1024),
        );

        assert_eq!(outcome.error_kind(), Some(ErrorKind::Aborted));
        assert_eq!(
            outcome.error,
            Some(TransportError::Multipart(MultipartError::UnexpectedEof))
        );
        assert!(!flash.is_reserved());
        assert_eq!(flash.boot_image(), RUNNING);
    }

    #[test]
    fn retry_after_failure_uses_a_fresh_session() {
        init_logging();
        let mut flash = device();

        let mut first = UpdateSession::new(&mut flash);
        first.begin(Some(8)).unwrap();
        first.write(&[0u8; 9]).unwrap_err();
        assert_eq!(first.begin(None).unwrap_err().kind(), ErrorKind::ProtocolError);
        drop(first);

        let mut second = UpdateSession::new(&mut flash);
        second.begin(Some(8)).unwrap();
        second.write(&[0u8; 8]).unwrap();
        second.end().unwrap();
        drop(second);
        assert_eq!(flash.boot_image(), &[0u8; 8]);
    }

    #[test]
    fn report_serializes_for_status_endpoint() {
        let mut flash = device();
        let mut session = UpdateSession::new(&mut flash);
        session.begin(Some(1000)).unwrap();
        session.write(&[0u8; 250]).unwrap();

        let json = session.report().to_json().unwrap();
        assert!(json.contains(r#""state":"Receiving""#));
        assert!(json.contains(r#""bytes_written":250"#));
        assert!(json.contains(r#""progress_percent":25"#));
    }

    proptest! {
        #[test]
        fn any_socket_read_size_flashes_the_same_image(step in 1usize..3000, buf_len in 16usize..5000) {
            let image = app_image(4000);
            let body = multipart_body("prop", "fw.bin", &image);

            let mut flash = device();
            let session = UpdateSession::from_config(&mut flash, &UpdateConfig::default()).unwrap();
            let mut buf = vec![0u8; buf_len];
            let outcome = receive_upload(
                UploadDriver::new(session),
                BodyKind::Multipart { boundary: "prop".to_string() },
                None,
                &mut buf,
                socket(&body, step),
            );

            prop_assert!(outcome.is_ok());
            prop_assert_eq!(flash.boot_image(), image.as_slice());
        }

        #[test]
        fn failed_uploads_never_touch_the_running_image(
            sizes in proptest::collection::vec(1usize..2000, 1..10),
            declared in 1usize..8000,
        ) {
            let mut flash = device();
            let mut session = UpdateSession::new(&mut flash);
            session.begin(Some(declared)).unwrap();

            let mut total = 0;
            for size in sizes {
                total += size;
                let result = session.write(&vec![0xC3; size]);
                if total > declared {
                    prop_assert_eq!(result.unwrap_err().kind(), ErrorKind::OverflowError);
                    break;
                }
                prop_assert!(result.is_ok());
            }
            let committed = session.end().is_ok();
            prop_assert_eq!(committed, total == declared);
            drop(session);

            if committed {
                prop_assert_eq!(flash.boot_slot(), SlotId(1));
            } else {
                prop_assert_eq!(flash.boot_image(), RUNNING);
            }
        }
    }
}
