use std::time::Duration;

use holdback::{
    config::ConfigArgs,
    errors::SessionError,
    session::{ChannelSource, ReaderSource},
    sink::ChannelSink,
    HoldSession, PacketController, ReleaseMode,
};
use testresult::TestResult;
use tokio::io::AsyncWriteExt;
use tokio::time::sleep;

#[test_log::test(tokio::test(start_paused = true))]
async fn stream_is_held_then_released_on_schedule() -> TestResult {
    let config = ConfigArgs {
        hold_ms: Some(100),
        mtu: Some(8),
        release_after_ms: Some(200),
        release_mode: Some(ReleaseMode::Sequential),
        fast_sequential_delay_ms: Some(5),
        repeat: Some(true),
        ..Default::default()
    }
    .build()?;

    let (sink, mut rx) = ChannelSink::new();
    let session = HoldSession::new(PacketController::new(config.hold, sink), config.session);
    let (mut writer, reader) = tokio::io::duplex(256);
    session.start(ReaderSource::new(reader))?;

    writer.write_all(b"01234567abcdefgh").await?;
    sleep(Duration::from_millis(50)).await;
    assert_eq!(session.controller().len().await, 2);

    let first = rx.recv().await.ok_or("sink closed")?;
    let second = rx.recv().await.ok_or("sink closed")?;
    assert_eq!(first, vec!["01234567"]);
    assert_eq!(second, vec!["abcdefgh"]);

    writer.write_all(b"tail").await?;
    drop(writer);
    session.wait_ingestion_end().await;
    let third = rx.recv().await.ok_or("sink closed")?;
    assert_eq!(third, vec!["tail"]);

    session.stop().await?;
    assert_eq!(session.stop().await, Err(SessionError::NotRunning));
    let stats = session.controller().stats().await;
    assert_eq!(stats.enqueued, 3);
    assert_eq!(stats.released, 3);
    Ok(())
}

#[test_log::test(tokio::test(start_paused = true))]
async fn stopping_mid_hold_discards_packets() -> TestResult {
    let (sink, mut rx) = ChannelSink::new();
    let config = ConfigArgs {
        release_after_ms: Some(1_000),
        ..Default::default()
    }
    .build()?;
    let session = HoldSession::new(PacketController::new(config.hold, sink), config.session);
    let (tx, source) = ChannelSource::new(16);
    session.start(source)?;
    for i in 0u8..5 {
        tx.send(vec![i].into()).await?;
    }
    sleep(Duration::from_millis(300)).await;
    assert_eq!(session.controller().len().await, 5);

    session.stop().await?;
    sleep(Duration::from_secs(2)).await;
    assert!(rx.try_recv().is_err());
    assert_eq!(session.controller().stats().await.discarded_on_stop, 5);
    Ok(())
}
