mod common;

use battmon_lib::bus::{
    AddressableBus, BusConnection, ChannelConfig, Connection, ConnectionState, TransferOptions,
    TransportStatus,
};
use battmon_lib::{Direction, Error, TransferFailure};
use common::{channel, Call, Echo, MockTransport};
use std::sync::Arc;
use std::time::Duration;

const ADDRESS: u8 = 0x42;

fn connection_with_echo(reply: &[u8]) -> (Connection<MockTransport>, common::SharedState) {
    let (transport, state) = MockTransport::new(vec![channel("FT1")]);
    state.lock().unwrap().devices.insert(
        ADDRESS,
        Box::new(Echo {
            reply: reply.to_vec(),
            ..Echo::default()
        }),
    );
    (Connection::new(transport), state)
}

async fn connected_with_echo(reply: &[u8]) -> (Connection<MockTransport>, common::SharedState) {
    let (connection, state) = connection_with_echo(reply);
    connection.connect("FT1", 0).await.unwrap();
    (connection, state)
}

#[tokio::test]
async fn connect_counts_only_channels_of_the_requested_device() {
    let (transport, state) =
        MockTransport::new(vec![channel("FT1"), channel("FT2"), channel("FT1")]);
    let connection = Connection::new(transport);
    assert_eq!(connection.state(), ConnectionState::Disconnected);

    connection.connect("FT1", 1).await.unwrap();

    assert!(connection.is_connected());
    assert_eq!(connection.channel(), Some(channel("FT1")));
    let state = state.lock().unwrap();
    assert!(state.calls.contains(&Call::Open(2)));
    assert!(state
        .calls
        .contains(&Call::Init(2, ChannelConfig::default())));
    assert_eq!(state.open_handles, vec![2]);
}

#[tokio::test]
async fn connect_applies_the_channel_configuration() {
    let (transport, state) = MockTransport::new(vec![channel("FT1")]);
    let config = ChannelConfig {
        clock_rate: 100_000,
        ..ChannelConfig::default()
    };
    let connection = Connection::with_config(transport, config);
    connection.connect("FT1", 0).await.unwrap();
    assert_eq!(connection.config().clock_rate, 100_000);
    assert!(state.lock().unwrap().calls.contains(&Call::Init(0, config)));
}

#[tokio::test]
async fn missing_channel_is_reported() {
    let (transport, state) = MockTransport::new(vec![channel("FT1"), channel("FT2")]);
    let connection = Connection::new(transport);

    let result = connection.connect("FT1", 1).await;

    assert!(matches!(
        result,
        Err(Error::ChannelNotFound { ref serial_number, index: 1 }) if serial_number == "FT1"
    ));
    assert_eq!(connection.state(), ConnectionState::Disconnected);
    assert!(state.lock().unwrap().open_handles.is_empty());
}

#[tokio::test]
async fn enumeration_failure_is_reported() {
    let (transport, state) = MockTransport::new(vec![channel("FT1")]);
    state.lock().unwrap().enumeration_fault = Some(TransportStatus::DeviceListNotReady);
    let connection = Connection::new(transport);

    let result = connection.connect("FT1", 0).await;

    assert!(matches!(
        result,
        Err(Error::DeviceEnumeration(TransportStatus::DeviceListNotReady))
    ));
    assert_eq!(connection.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn failed_initialization_closes_the_channel() {
    let (transport, state) = MockTransport::new(vec![channel("FT1")]);
    state.lock().unwrap().init_fault = Some(TransportStatus::InvalidParameter);
    let connection = Connection::new(transport);

    let result = connection.connect("FT1", 0).await;

    assert!(matches!(
        result,
        Err(Error::ChannelInit(TransportStatus::InvalidParameter))
    ));
    assert_eq!(connection.state(), ConnectionState::Disconnected);
    let state = state.lock().unwrap();
    assert!(state.calls.contains(&Call::Close(0)));
    assert!(state.open_handles.is_empty());
}

#[tokio::test]
async fn connecting_twice_is_rejected() {
    let (connection, _state) = connected_with_echo(&[]).await;
    assert!(matches!(
        connection.connect("FT1", 0).await,
        Err(Error::InvalidState(ConnectionState::Connected))
    ));
    assert!(connection.is_connected());
}

#[tokio::test]
async fn disconnect_is_idempotent() {
    let (connection, state) = connected_with_echo(&[]).await;

    connection.disconnect().await.unwrap();
    connection.disconnect().await.unwrap();

    assert_eq!(connection.state(), ConnectionState::Disconnected);
    assert_eq!(connection.channel(), None);
    let state = state.lock().unwrap();
    let closes = state
        .calls
        .iter()
        .filter(|call| matches!(call, Call::Close(_)))
        .count();
    assert_eq!(closes, 1);
}

#[tokio::test]
async fn failed_close_still_disconnects() {
    let (connection, state) = connected_with_echo(&[]).await;
    state.lock().unwrap().close_fault = Some(TransportStatus::IoError);

    assert!(matches!(
        connection.disconnect().await,
        Err(Error::ChannelClose(TransportStatus::IoError))
    ));
    assert_eq!(connection.state(), ConnectionState::Disconnected);
    assert_eq!(connection.channel(), None);

    connection.disconnect().await.unwrap();
    let closes = state
        .lock()
        .unwrap()
        .calls
        .iter()
        .filter(|call| matches!(call, Call::Close(_)))
        .count();
    assert_eq!(closes, 1);
}

async fn cancelled_connect() -> (Connection<MockTransport>, common::SharedState) {
    let (connection, state) = connection_with_echo(&[]);
    state.lock().unwrap().open_delay = Some(Duration::from_millis(100));

    let attempt =
        tokio::time::timeout(Duration::from_millis(10), connection.connect("FT1", 0)).await;
    assert!(attempt.is_err());
    assert_eq!(connection.state(), ConnectionState::Disconnected);

    // The open keeps running on the blocking pool.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(state.lock().unwrap().open_handles, vec![0]);
    (connection, state)
}

#[tokio::test]
async fn disconnect_closes_channel_of_cancelled_connect() {
    let (connection, state) = cancelled_connect().await;

    connection.disconnect().await.unwrap();

    assert_eq!(connection.state(), ConnectionState::Disconnected);
    assert!(state.lock().unwrap().open_handles.is_empty());
    assert!(state.lock().unwrap().calls.contains(&Call::Close(0)));
}

#[tokio::test]
async fn dropping_the_connection_closes_its_channel() {
    let (connection, state) = cancelled_connect().await;
    drop(connection);
    assert!(state.lock().unwrap().open_handles.is_empty());

    let (connection, state) = connected_with_echo(&[]).await;
    drop(connection);
    assert!(state.lock().unwrap().open_handles.is_empty());
}

#[tokio::test]
async fn disconnect_of_a_fresh_connection_does_nothing() {
    let (connection, state) = connection_with_echo(&[]);
    connection.disconnect().await.unwrap();
    assert!(state.lock().unwrap().calls.is_empty());
}

#[tokio::test]
async fn transfers_require_a_connection() {
    let (connection, state) = connection_with_echo(&[1, 2]);
    assert!(matches!(
        connection.send(ADDRESS, &[1]).await,
        Err(Error::NotConnected)
    ));
    assert!(matches!(
        connection.receive(ADDRESS, 2).await,
        Err(Error::NotConnected)
    ));

    connection.connect("FT1", 0).await.unwrap();
    connection.disconnect().await.unwrap();
    assert!(matches!(
        connection.transceive(ADDRESS, &[1], 2).await,
        Err(Error::NotConnected)
    ));
    assert!(state.lock().unwrap().transfers().is_empty());
}

#[tokio::test]
async fn invalid_lengths_are_rejected() {
    let (connection, state) = connected_with_echo(&[1, 2]).await;
    assert!(matches!(
        connection.receive(ADDRESS, 0).await,
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        connection.transceive(ADDRESS, &[], 2).await,
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        connection.transceive(ADDRESS, &[1], 0).await,
        Err(Error::InvalidArgument(_))
    ));
    assert!(state.lock().unwrap().transfers().is_empty());
}

#[tokio::test]
async fn send_frames_with_start_and_stop() {
    let (connection, state) = connected_with_echo(&[]).await;
    connection.send(ADDRESS, &[0x10, 0x20]).await.unwrap();
    let state = state.lock().unwrap();
    assert_eq!(
        state.transfers(),
        vec![&Call::Write {
            address: ADDRESS,
            data: vec![0x10, 0x20],
            options: TransferOptions::START_BIT
                | TransferOptions::STOP_BIT
                | TransferOptions::BREAK_ON_NACK
                | TransferOptions::FAST_TRANSFER_BYTES,
        }]
    );
}

#[tokio::test]
async fn partial_send_is_a_transfer_error() {
    let (connection, state) = connected_with_echo(&[]).await;
    state.lock().unwrap().write_limit = Some(8);

    let result = connection.send(ADDRESS, &[0; 10]).await;

    assert!(matches!(
        result,
        Err(Error::Transfer {
            address: ADDRESS,
            direction: Direction::Writing,
            failure: TransferFailure::Incomplete {
                requested: 10,
                transferred: 8
            },
        })
    ));
    // Still usable.
    assert!(connection.is_connected());
    state.lock().unwrap().write_limit = None;
    connection.send(ADDRESS, &[0; 10]).await.unwrap();
}

#[tokio::test]
async fn short_receive_is_truncated() {
    let (connection, _state) = connected_with_echo(&[1, 2, 3, 4, 5, 6]).await;
    let reply = connection.receive(ADDRESS, 10).await.unwrap();
    assert_eq!(reply, vec![1, 2, 3, 4, 5, 6]);
}

#[tokio::test]
async fn receive_from_an_absent_device_is_empty() {
    let (connection, _state) = connected_with_echo(&[]).await;
    assert!(connection.receive(0x10, 4).await.unwrap().is_empty());
}

#[tokio::test]
async fn failed_receive_is_a_transfer_error() {
    let (connection, state) = connected_with_echo(&[1]).await;
    state
        .lock()
        .unwrap()
        .read_faults
        .push_back(TransportStatus::Timeout);

    assert!(matches!(
        connection.receive(ADDRESS, 1).await,
        Err(Error::Transfer {
            direction: Direction::Reading,
            failure: TransferFailure::Status(TransportStatus::Timeout),
            ..
        })
    ));
    assert_eq!(connection.receive(ADDRESS, 1).await.unwrap(), vec![1]);
}

#[tokio::test]
async fn transceive_writes_then_reads() {
    let (connection, state) = connected_with_echo(&[9, 8, 7, 6]).await;

    let reply = connection.transceive(ADDRESS, &[0x01, 0x02], 4).await.unwrap();

    assert_eq!(reply, vec![9, 8, 7, 6]);
    let state = state.lock().unwrap();
    assert_eq!(
        state.transfers(),
        vec![
            &Call::Write {
                address: ADDRESS,
                data: vec![0x01, 0x02],
                options: TransferOptions::START_BIT
                    | TransferOptions::BREAK_ON_NACK
                    | TransferOptions::FAST_TRANSFER_BYTES,
            },
            &Call::Read {
                address: ADDRESS,
                length: 4,
                options: TransferOptions::START_BIT
                    | TransferOptions::STOP_BIT
                    | TransferOptions::NACK_LAST_BYTE,
            },
        ]
    );
}

#[tokio::test]
async fn failed_write_phase_skips_the_read() {
    let (connection, state) = connected_with_echo(&[9, 8, 7, 6]).await;
    state
        .lock()
        .unwrap()
        .write_faults
        .push_back(TransportStatus::IoError);

    let result = connection.transceive(ADDRESS, &[0x01, 0x02], 4).await;

    assert!(matches!(
        result,
        Err(Error::Transfer {
            direction: Direction::Writing,
            failure: TransferFailure::Status(TransportStatus::IoError),
            ..
        })
    ));
    let state = state.lock().unwrap();
    assert!(!state
        .calls
        .iter()
        .any(|call| matches!(call, Call::Read { .. })));
}

#[tokio::test]
async fn short_transceive_read_is_truncated() {
    let (connection, state) = connected_with_echo(&[9, 8, 7, 6]).await;
    state.lock().unwrap().read_limit = Some(3);
    let reply = connection.transceive(ADDRESS, &[0x01], 4).await.unwrap();
    assert_eq!(reply, vec![9, 8, 7]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_transactions_do_not_interleave() {
    let (connection, state) = connected_with_echo(&[0xAA, 0xBB]).await;
    let connection = Arc::new(connection);

    let tasks: Vec<_> = (0..16u8)
        .map(|i| {
            let connection = connection.clone();
            tokio::spawn(async move { connection.transceive(ADDRESS, &[i], 2).await })
        })
        .collect();
    for task in tasks {
        assert_eq!(task.await.unwrap().unwrap(), vec![0xAA, 0xBB]);
    }

    let state = state.lock().unwrap();
    let transfers = state.transfers();
    assert_eq!(transfers.len(), 32);
    for pair in transfers.chunks(2) {
        assert!(matches!(pair[0], Call::Write { .. }));
        assert!(matches!(pair[1], Call::Read { .. }));
    }
}

#[tokio::test]
async fn connections_share_nothing() {
    let (first, first_state) = connected_with_echo(&[1]).await;
    let (second, second_state) = connected_with_echo(&[2]).await;

    let (a, b) = tokio::join!(first.receive(ADDRESS, 1), second.receive(ADDRESS, 1));

    assert_eq!(a.unwrap(), vec![1]);
    assert_eq!(b.unwrap(), vec![2]);
    assert_eq!(first_state.lock().unwrap().transfers().len(), 1);
    assert_eq!(second_state.lock().unwrap().transfers().len(), 1);
}
