//! Echo round-trip between a messaging adapter and an outbound channel.
//!
//! This demo shows the full path: a server-side adapter listens on an
//! OS-assigned loopback port, a client channel establishes to it, the
//! client sends a message, the server answers on the back-channel and
//! the client reads the echo back.
//!
//! Run with: cargo run --example echo

use xchannel::{BytesEnvelope, Channel, MessagingAdapter};

fn main() -> xchannel::Result<()> {
    env_logger::init();

    // Server side: listen on an ephemeral port.
    let adapter: MessagingAdapter<BytesEnvelope> = MessagingAdapter::new()?;
    adapter.listen("tcp:127.0.0.1:0")?;
    let addr = adapter.listen_addr().expect("adapter is listening");
    println!("server listening at {addr}");

    // Client side: establish and send.
    let channel: Channel<BytesEnvelope> = Channel::new();
    channel.establish(&format!("tcp:{addr}"))?;
    channel.send_sync(&BytesEnvelope::new(b"ping from the demo client".to_vec()))?;

    // Server side: wait for the message, echo it on the back-channel.
    let request = adapter.await_next_message()?;
    println!(
        "server received: {:?}",
        String::from_utf8_lossy(request.data())
    );
    adapter.channel_for(0).send_sync(&request)?;

    // Client side: read the echo.
    let mut reply = BytesEnvelope::default();
    channel.recv_sync(&mut reply)?;
    println!(
        "client received: {:?}",
        String::from_utf8_lossy(reply.data())
    );

    channel.close();
    Ok(())
}
