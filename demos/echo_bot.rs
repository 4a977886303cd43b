//! Echoes private messages back to their sender.
//!
//! Usage: `cargo run --example echo_bot -- [config.toml]`. Without a config file the bot
//! connects to `ws://127.0.0.1:6700`.

use cqrpc::{Client, ClientConfig, EventCategory, MessageChain, Result, Tag};
use serde_json::json;

#[tokio::main]
async fn main() -> Result<()> {
    let config = match std::env::args().nth(1) {
        Some(path) => ClientConfig::from_file(path)?,
        None => ClientConfig::default(),
    };
    let client = Client::new(config);

    let replier = client.downgrade();
    client.on(EventCategory::MessagePrivate, move |event| {
        let Some(replier) = replier.upgrade() else {
            return;
        };
        let Some(message) = event.message() else {
            return;
        };
        let Some(user_id) = message.payload["user_id"].as_i64() else {
            return;
        };
        let mut reply = MessageChain::new();
        if let Some(quote) = message.payload["message_id"]
            .as_i64()
            .and_then(|id| Tag::reply(id).ok())
        {
            reply.push_tag(quote);
        }
        reply.push_text("you said: ");
        for segment in message.segments.iter().cloned() {
            reply.push(segment);
        }
        let call = replier.call(
            "send_private_msg",
            json!({ "user_id": user_id, "message": reply.to_array() }),
        );
        tokio::spawn(async move {
            if let Err(e) = call.await {
                eprintln!("reply failed: {}", e);
            }
        });
    });
    client.on(EventCategory::SocketReconnecting, |event| {
        eprintln!("{:?}", event.data);
    });

    client.connect().await?;
    let info = client.call("get_login_info", json!({})).await?;
    println!("logged in as {}", info);

    tokio::signal::ctrl_c().await?;
    client.close().await;
    Ok(())
}
