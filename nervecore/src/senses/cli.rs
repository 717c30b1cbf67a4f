//! CLI sense: stdin lines become durable `cli.message_received` signals.

use std::sync::Arc;

use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::Sense;
use crate::bus::SignalBus;
use crate::signal::{types, Signal};

pub struct CliSense;

impl Sense for CliSense {
    fn key(&self) -> &str {
        "cli"
    }

    fn signals(&self) -> Vec<&'static str> {
        vec![types::CLI_MESSAGE_RECEIVED]
    }

    fn start(&self, bus: Arc<SignalBus>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let stdin = BufReader::new(tokio::io::stdin());
            let mut lines = stdin.lines();
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    line = lines.next_line() => {
                        let text = match line {
                            Ok(Some(text)) => text,
                            Ok(None) | Err(_) => break,
                        };
                        let text = text.trim().to_string();
                        if text.is_empty() {
                            continue;
                        }
                        let signal = Signal::new(
                            types::CLI_MESSAGE_RECEIVED,
                            "cli",
                            json!({
                                "text": text,
                                "channel_type": "cli",
                                "channel_target": "local",
                                "user_id": "local",
                            }),
                        )
                        .durable();
                        if bus.publish(signal).await.is_err() {
                            break;
                        }
                    }
                }
            }
        })
    }
}
