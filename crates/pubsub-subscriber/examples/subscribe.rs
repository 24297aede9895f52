//! Subscribe to channels over the HTTP long-poll backend.
//!
//! ```sh
//! cargo run -p pubsub-subscriber --example subscribe -- <SUBSCRIBE_KEY> <CHANNEL>[,<CHANNEL>...] [ORIGIN]
//! ```
//!
//! Or pass the key via environment variable:
//! ```sh
//! PUBSUB_SUBSCRIBE_KEY=sub-c-... cargo run -p pubsub-subscriber --example subscribe \
//!     -- <CHANNELS> [ORIGIN]
//! ```
//!
//! Message data is printed to stdout (pipe to `jq` for formatting); presence
//! and status go to stderr. Ctrl-C stops the loop and prints the cursor to
//! resume from.

use pubsub_subscriber::{
    Callbacks, Client, ClientConfig, HttpConfig, HttpTransport, StatusCategory, SubscribeOptions,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let env_key = std::env::var("PUBSUB_SUBSCRIBE_KEY").ok();

    let (subscribe_key, channels, origin) = if let Some(ref key) = env_key {
        let channels = args.first().ok_or("usage: subscribe <CHANNELS> [ORIGIN]")?;
        (key.as_str(), channels.as_str(), args.get(1).cloned())
    } else {
        let key = args
            .first()
            .ok_or("usage: subscribe <SUBSCRIBE_KEY> <CHANNELS> [ORIGIN]")?;
        let channels = args
            .get(1)
            .ok_or("usage: subscribe <SUBSCRIBE_KEY> <CHANNELS> [ORIGIN]")?;
        (key.as_str(), channels.as_str(), args.get(2).cloned())
    };

    let mut http = HttpConfig {
        subscribe_key: subscribe_key.to_string(),
        ..Default::default()
    };
    if let Some(origin) = origin {
        http.origin = origin;
    }
    let transport = HttpTransport::new(http)?;
    let client = Client::new(transport, ClientConfig::default())?;

    client.add_listener(
        Callbacks::new()
            .on_message(|_, env| {
                if let Some(msg) = env.message() {
                    eprintln!(
                        "[{:?}] channel={} tt={} publisher={}",
                        env.kind(),
                        env.channel,
                        env.timetoken,
                        msg.publisher.as_deref().unwrap_or("-"),
                    );
                    println!("{}", msg.data);
                }
            })
            .on_presence(|_, env| {
                if let Some(p) = env.presence() {
                    eprintln!(
                        "[presence] channel={} action={} uuid={} occupancy={}",
                        env.channel,
                        p.action.as_str(),
                        p.occupant_id.as_deref().unwrap_or("-"),
                        p.occupancy,
                    );
                }
            })
            .on_status(|_, env| {
                if let Some(s) = env.status_payload() {
                    eprintln!(
                        "[status] {:?} channels={:?} {}",
                        s.category,
                        s.channels,
                        s.error.as_deref().unwrap_or(""),
                    );
                    if s.is(StatusCategory::Disconnected) {
                        eprintln!("giving up; press Ctrl-C to exit");
                    }
                }
            }),
    );

    eprintln!("subscribing to '{channels}' ...");
    client.subscribe(SubscribeOptions::channels(channels.split(',')).with_presence());

    tokio::signal::ctrl_c().await?;
    client.stop();
    if let Some(cursor) = client.cursor() {
        eprintln!("stopped at timetoken {} (region {})", cursor.timetoken, cursor.region);
    }
    Ok(())
}
