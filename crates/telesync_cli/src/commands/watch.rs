//! Watch command implementation.

use serde::Serialize;
use serde_json::Value;
use telesync_engine::{EndpointConfig, Engine, EngineError, Subscription, TopicFilter, Update};
use telesync_protocol::Topic;
use tracing::info;

/// One printed update.
#[derive(Debug, Serialize)]
pub struct UpdateLine<'a> {
    /// Topic name.
    pub topic: &'a str,
    /// Idempotency key, if the update carried one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<&'a str>,
    /// Payload.
    pub data: &'a Value,
}

impl<'a> From<&'a Update> for UpdateLine<'a> {
    fn from(update: &'a Update) -> Self {
        Self {
            topic: update.topic.as_str(),
            key: update.key.as_deref(),
            data: &update.data,
        }
    }
}

/// Maps topic names from the command line to subscription filters.
pub fn filters(topics: &[String]) -> Vec<TopicFilter> {
    if topics.is_empty() {
        return vec![TopicFilter::All];
    }
    topics
        .iter()
        .map(|name| TopicFilter::Only(Topic::parse(name)))
        .collect()
}

fn print_update(update: &Update) {
    match serde_json::to_string(&UpdateLine::from(update)) {
        Ok(line) => println!("{line}"),
        Err(e) => eprintln!("unprintable update on {}: {e}", update.topic),
    }
}

/// Runs the watch command until Ctrl-C.
pub async fn run(config: EndpointConfig, topics: &[String]) -> Result<(), Box<dyn std::error::Error>> {
    let engine = Engine::connect(config)?;

    let _subscriptions: Vec<Subscription> = filters(topics)
        .into_iter()
        .map(|filter| engine.subscribe(filter, print_update))
        .collect();
    let _errors = engine.on_error(|error: &EngineError| {
        eprintln!("error ({:?}): {error}", error.kind());
    });

    let mut changes = engine.state_changes();
    engine.start();
    info!(endpoint = %engine.config().endpoint, "watching; press Ctrl-C to stop");

    loop {
        tokio::select! {
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *changes.borrow_and_update();
                eprintln!("state: {state}");
            }
            signal = tokio::signal::ctrl_c() => {
                signal?;
                break;
            }
        }
    }

    let stats = engine.stats();
    engine.shutdown().await;
    info!(
        syncs = stats.syncs_completed,
        failures = stats.failures,
        dispatched = stats.messages_dispatched,
        "stopped"
    );
    Ok(())
}
