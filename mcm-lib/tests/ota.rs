mod common;

use common::*;
use mcm_lib::error::McmError;
use mcm_lib::session::{Mode, Session};
use mcm_lib::transport::TransferStatus;
use mcm_lib::uart::BareUartConfig;

const OTA_DO_TRANSFER: u8 = 0x40;
const OTA_UPDATE_BOOT_PARTITION: u8 = 0x41;
const RESTART: u8 = 0x50;
const BARE_UART_MODE: u8 = 0x20;

fn image(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Firmware that accepts every chunk and validates the image.
fn accepting_firmware(fake: &FakeTransport) {
    fake.set_responder(|call| match call {
        Call::TransferOut { .. } => vec![InReply::Data(b"EMPTY\n".to_vec())],
        Call::ControlOut {
            request: OTA_DO_TRANSFER,
            value: 0,
            ..
        } => vec![
            InReply::Data(b"EMPTY\r\nEMP".to_vec()),
            InReply::Data(b"TY\nchecking image\n".to_vec()),
            InReply::Data(b"VALID\n".to_vec()),
        ],
        _ => vec![],
    });
}

#[tokio::test(start_paused = true)]
async fn upgrade_streams_chunks_and_commits() {
    let fake = FakeTransport::new();
    accepting_firmware(&fake);
    let mut session = connected_session(&fake).await;
    let modes = session.subscribe_mode();

    let firmware = image(5120 * 3 + 17);
    let mut progress = Vec::new();
    session
        .upgrade_firmware(firmware.clone(), |sent, total| {
            assert_eq!(*modes.borrow(), Mode::Upgrading);
            progress.push((sent, total));
        })
        .await
        .unwrap();

    assert_eq!(
        progress,
        vec![
            (0, 15377),
            (5120, 15377),
            (10240, 15377),
            (15360, 15377),
            (15377, 15377)
        ]
    );

    let writes = fake.bulk_writes();
    assert_eq!(
        writes.iter().map(Vec::len).collect::<Vec<_>>(),
        vec![5120, 5120, 5120, 17]
    );
    assert_eq!(writes.concat(), firmware);

    assert_eq!(
        fake.control_outs(),
        vec![
            (OTA_DO_TRANSFER, 1, vec![]),
            (OTA_DO_TRANSFER, 0, vec![]),
            (OTA_UPDATE_BOOT_PARTITION, 0, vec![]),
            (RESTART, 0, vec![]),
        ]
    );
    assert_eq!(fake.calls().last(), Some(&Call::Close));
    assert_eq!(session.mode(), Mode::None);
    assert!(!session.is_connected());
}

#[tokio::test(start_paused = true)]
async fn exact_multiple_of_chunk_size() {
    let fake = FakeTransport::new();
    accepting_firmware(&fake);
    let mut session = connected_session(&fake).await;

    let mut calls = 0;
    session
        .upgrade_firmware(image(10240), |_, _| calls += 1)
        .await
        .unwrap();
    assert_eq!(calls, 3);
    assert_eq!(fake.bulk_writes().len(), 2);
}

fn assert_failed_cleanly(session: &Session<FakeTransport>, fake: &FakeTransport) {
    assert_eq!(session.mode(), Mode::None);
    assert!(!session.is_receiver_running());
    let control_outs = fake.control_outs();
    assert!(!control_outs.iter().any(|(r, _, _)| *r == OTA_UPDATE_BOOT_PARTITION));
    assert!(!control_outs.iter().any(|(r, _, _)| *r == RESTART));
}

#[tokio::test(start_paused = true)]
async fn chunk_failure_aborts() {
    let fake = FakeTransport::new();
    let mut chunks = 0;
    fake.set_responder(move |call| match call {
        Call::TransferOut { .. } => {
            chunks += 1;
            let line = if chunks == 2 { "FAIL: flash write\n" } else { "EMPTY\n" };
            vec![InReply::Data(line.as_bytes().to_vec())]
        }
        _ => vec![],
    });
    let mut session = connected_session(&fake).await;

    match session.upgrade_firmware(image(5120 * 3), |_, _| {}).await {
        Err(McmError::DeviceReportedFailure(message)) => assert_eq!(message, "flash write"),
        other => panic!("expected DeviceReportedFailure, got {:?}", other),
    }
    assert_eq!(fake.bulk_writes().len(), 2);
    assert_eq!(fake.control_outs(), vec![(OTA_DO_TRANSFER, 1, vec![])]);
    assert_failed_cleanly(&session, &fake);
}

#[tokio::test(start_paused = true)]
async fn unexpected_acknowledgement_is_invalid() {
    let fake = FakeTransport::new();
    fake.set_responder(|call| match call {
        Call::TransferOut { .. } => vec![InReply::Data(b"BUSY\n".to_vec())],
        _ => vec![],
    });
    let mut session = connected_session(&fake).await;

    assert!(matches!(
        session.upgrade_firmware(image(100), |_, _| {}).await,
        Err(McmError::InvalidResponse(_))
    ));
    assert_failed_cleanly(&session, &fake);
}

#[tokio::test(start_paused = true)]
async fn validation_failure_aborts() {
    let fake = FakeTransport::new();
    fake.set_responder(|call| match call {
        Call::TransferOut { .. } => vec![InReply::Data(b"EMPTY\n".to_vec())],
        Call::ControlOut {
            request: OTA_DO_TRANSFER,
            value: 0,
            ..
        } => vec![InReply::Data(b"EMPTY\nFAIL: bad signature\n".to_vec())],
        _ => vec![],
    });
    let mut session = connected_session(&fake).await;

    match session.upgrade_firmware(image(100), |_, _| {}).await {
        Err(McmError::DeviceReportedFailure(message)) => assert_eq!(message, "bad signature"),
        other => panic!("expected DeviceReportedFailure, got {:?}", other),
    }
    assert_failed_cleanly(&session, &fake);
}

#[tokio::test(start_paused = true)]
async fn missing_acknowledgement_times_out() {
    let fake = FakeTransport::new();
    let mut session = connected_session(&fake).await;
    assert!(matches!(
        session.upgrade_firmware(image(100), |_, _| {}).await,
        Err(McmError::ResponseTimeout)
    ));
    assert_failed_cleanly(&session, &fake);
}

#[tokio::test(start_paused = true)]
async fn stalled_chunk_aborts() {
    let fake = FakeTransport::new();
    accepting_firmware(&fake);
    fake.push_out_reply(OutReply::Complete);
    fake.push_out_reply(OutReply::Status(TransferStatus::Stall));
    let mut session = connected_session(&fake).await;

    assert!(matches!(
        session.upgrade_firmware(image(5120 * 2 + 1), |_, _| {}).await,
        Err(McmError::DeviceSignalledError)
    ));
    assert_failed_cleanly(&session, &fake);
}

#[tokio::test(start_paused = true)]
async fn begin_request_failure_leaves_mode_none() {
    let fake = FakeTransport::new();
    fake.set_control_out(OTA_DO_TRANSFER, OutReply::Status(TransferStatus::Stall));
    let mut session = connected_session(&fake).await;

    let mut progress_calls = 0;
    assert!(
        session
            .upgrade_firmware(image(100), |_, _| progress_calls += 1)
            .await
            .is_err()
    );
    assert_eq!(progress_calls, 0);
    assert!(fake.bulk_writes().is_empty());
    assert_failed_cleanly(&session, &fake);
}

#[tokio::test(start_paused = true)]
async fn end_request_failure_leaves_mode_none() {
    let fake = FakeTransport::new();
    accepting_firmware(&fake);
    fake.set_control_out_value(OTA_DO_TRANSFER, 0, OutReply::Status(TransferStatus::Other));
    let mut session = connected_session(&fake).await;

    assert!(matches!(
        session.upgrade_firmware(image(100), |_, _| {}).await,
        Err(McmError::UnexpectedTransferStatus(_))
    ));
    assert_eq!(fake.bulk_writes().len(), 1);
    assert_failed_cleanly(&session, &fake);
}

#[tokio::test(start_paused = true)]
async fn boot_partition_failure_skips_restart() {
    let fake = FakeTransport::new();
    accepting_firmware(&fake);
    fake.set_control_out(OTA_UPDATE_BOOT_PARTITION, OutReply::Status(TransferStatus::Stall));
    let mut session = connected_session(&fake).await;

    assert!(matches!(
        session.upgrade_firmware(image(100), |_, _| {}).await,
        Err(McmError::DeviceSignalledError)
    ));
    assert_eq!(session.mode(), Mode::None);
    assert!(!session.is_receiver_running());
    assert_eq!(
        fake.control_outs().last(),
        Some(&(OTA_UPDATE_BOOT_PARTITION, 0, vec![]))
    );
    assert!(!fake.control_outs().iter().any(|(r, _, _)| *r == RESTART));
}

#[tokio::test(start_paused = true)]
async fn bare_uart_is_left_before_upgrade() {
    let fake = FakeTransport::new();
    accepting_firmware(&fake);
    let mut session = connected_session(&fake).await;
    session
        .enable_bare_uart(&BareUartConfig::default(), |data: &[u8]| data.len())
        .await
        .unwrap();

    session.upgrade_firmware(image(100), |_, _| {}).await.unwrap();

    let requests: Vec<(u8, u16)> = fake.control_outs().into_iter().map(|(r, v, _)| (r, v)).collect();
    assert_eq!(
        requests,
        vec![
            (BARE_UART_MODE, 1),
            (BARE_UART_MODE, 0),
            (OTA_DO_TRANSFER, 1),
            (OTA_DO_TRANSFER, 0),
            (OTA_UPDATE_BOOT_PARTITION, 0),
            (RESTART, 0),
        ]
    );
    assert_eq!(fake.bulk_writes(), vec![image(100)]);
    assert_eq!(session.mode(), Mode::None);
    assert!(!session.is_receiver_running());
}

#[tokio::test(start_paused = true)]
async fn upgrade_without_device() {
    let mut session: Session<FakeTransport> = Session::new(test_config());
    assert!(matches!(
        session.upgrade_firmware(image(10), |_, _| {}).await,
        Err(McmError::NoDeviceSelected)
    ));
    assert_eq!(session.mode(), Mode::None);
}
