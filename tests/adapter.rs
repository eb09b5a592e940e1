//! Messaging adapter tests: acceptor lifecycle, back-channel registry
//! and the coarse-grained message wait.

use std::thread;
use std::time::{Duration, Instant};

use xchannel::{BytesEnvelope, Channel, MessagingAdapter};

fn wait_for(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn test_listen_ready_and_stop() {
    let adapter: MessagingAdapter<BytesEnvelope> = MessagingAdapter::new().unwrap();
    assert!(!adapter.listen_ready());
    assert!(adapter.listen_addr().is_none());

    adapter.listen("tcp:127.0.0.1:0").unwrap();
    assert!(adapter.listen_ready());
    let addr = adapter.listen_addr().unwrap();
    assert_ne!(addr.port(), 0);

    adapter.stop_listen();
    assert!(!adapter.listen_ready());
    assert!(adapter.listen_addr().is_none());
}

#[test]
fn test_back_channels_survive_stop_listen() {
    let adapter: MessagingAdapter<BytesEnvelope> = MessagingAdapter::new().unwrap();
    adapter.listen("tcp:127.0.0.1:0").unwrap();
    let uri = format!("tcp:{}", adapter.listen_addr().unwrap());

    let channel: Channel<BytesEnvelope> = Channel::new();
    channel.establish(&uri).unwrap();
    wait_for("back-channel", || adapter.channel_count() > 0);

    adapter.stop_listen();

    // The acceptor is gone, but the accepted connection still moves data.
    channel
        .send_sync(&BytesEnvelope::new(b"still alive".to_vec()))
        .unwrap();
    let mut received = BytesEnvelope::default();
    adapter.channel_for(0).recv_sync(&mut received).unwrap();
    assert_eq!(received.data(), b"still alive");

    // New connections are refused once the acceptor has wound down.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let late: Channel<BytesEnvelope> = Channel::new();
        if late.establish(&uri).is_err() {
            break;
        }
        late.close();
        assert!(Instant::now() < deadline, "acceptor kept accepting");
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn test_registry_is_indexed_by_accept_order() {
    let adapter: MessagingAdapter<BytesEnvelope> = MessagingAdapter::new().unwrap();
    adapter.listen("tcp:127.0.0.1:0").unwrap();
    let uri = format!("tcp:{}", adapter.listen_addr().unwrap());

    let first: Channel<BytesEnvelope> = Channel::new();
    first.establish(&uri).unwrap();
    wait_for("first back-channel", || adapter.channel_count() == 1);

    let second: Channel<BytesEnvelope> = Channel::new();
    second.establish(&uri).unwrap();
    wait_for("second back-channel", || adapter.channel_count() == 2);

    first
        .send_sync(&BytesEnvelope::new(b"from first".to_vec()))
        .unwrap();
    second
        .send_sync(&BytesEnvelope::new(b"from second".to_vec()))
        .unwrap();

    let mut received = BytesEnvelope::default();
    adapter.channel_for(0).recv_sync(&mut received).unwrap();
    assert_eq!(received.data(), b"from first");
    adapter.channel_for(1).recv_sync(&mut received).unwrap();
    assert_eq!(received.data(), b"from second");
}

#[test]
#[should_panic(expected = "out of range")]
fn test_channel_for_out_of_range_panics() {
    let adapter: MessagingAdapter<BytesEnvelope> = MessagingAdapter::new().unwrap();
    let _ = adapter.channel_for(0);
}

#[test]
fn test_listen_twice_is_rejected() {
    let adapter: MessagingAdapter<BytesEnvelope> = MessagingAdapter::new().unwrap();
    adapter.listen("tcp:127.0.0.1:0").unwrap();
    assert!(adapter.listen("tcp:127.0.0.1:0").is_err());
}

#[test]
fn test_await_next_message_delivers_in_order() {
    let adapter: MessagingAdapter<BytesEnvelope> = MessagingAdapter::new().unwrap();
    adapter.listen("tcp:127.0.0.1:0").unwrap();
    let uri = format!("tcp:{}", adapter.listen_addr().unwrap());

    let sender = thread::spawn(move || {
        let channel: Channel<BytesEnvelope> = Channel::new();
        channel.establish(&uri).unwrap();
        for text in ["one", "two", "three"] {
            channel
                .send_sync(&BytesEnvelope::new(text.as_bytes().to_vec()))
                .unwrap();
        }
        // Keep the connection open until the receiver is done.
        thread::sleep(Duration::from_millis(500));
        channel.close();
    });

    // Blocks across the accept as well: no back-channel exists yet
    // when the first call starts waiting.
    for expected in ["one", "two", "three"] {
        let message = adapter.await_next_message().unwrap();
        assert_eq!(message.data(), expected.as_bytes());
    }

    sender.join().unwrap();
}

#[test]
fn test_adapter_establish_and_close_delegation() {
    let adapter: MessagingAdapter<BytesEnvelope> = MessagingAdapter::new().unwrap();
    adapter.listen("tcp:127.0.0.1:0").unwrap();
    let uri = format!("tcp:{}", adapter.listen_addr().unwrap());

    let channel: Channel<BytesEnvelope> = Channel::new();
    adapter.establish(&uri, &channel).unwrap();
    assert!(channel.ready());

    adapter.close(&channel);
    assert!(!channel.ready());
}
