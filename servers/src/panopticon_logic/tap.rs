//! Subscribes to the requested channels and prints a one-line summary of
//! every flushed value.

use anyhow::Result;
use lib_panopticon::{AppContext, Channel, ChannelValue, ManagedService, SubscriberId, SubscriberError};
use std::sync::Arc;

/// A short, single-line rendering of a channel value.
pub fn describe(value: &ChannelValue) -> Result<String, SubscriberError> {
    let line = match value {
        ChannelValue::CanFrames(window) => match window.newest() {
            Some(newest) => format!(
                "{} frame(s), newest {}",
                window.len(),
                serde_json::to_string(newest).map_err(SubscriberError::new)?
            ),
            None => "no frames".to_string(),
        },
        ChannelValue::Logs(window) => format!("{} line(s)", window.len()),
        ChannelValue::HealthMetrics(metrics) => {
            let parts: Vec<String> = metrics.values().map(|m| m.to_string()).collect();
            format!("{} metric(s): {}", metrics.len(), parts.join("; "))
        }
        other => serde_json::to_string(other).map_err(SubscriberError::new)?,
    };
    Ok(line)
}

/// Registers a printing callback on each named channel. The Lighthouse link
/// is initialized and started first if any of its channels is requested.
pub async fn attach(ctx: &Arc<AppContext>, channel_names: &[String]) -> Result<Vec<(Channel, SubscriberId)>> {
    let wants_link = channel_names
        .iter()
        .filter_map(|name| name.parse::<Channel>().ok())
        .any(|c| !matches!(c, Channel::HealthMetrics | Channel::RedisState | Channel::Logs));
    if wants_link {
        ctx.initialize_lighthouse().await.start();
    }

    let mut subscriptions = Vec::new();
    for name in channel_names {
        let channel_name = name.clone();
        let registered = ctx
            .register_by_name(name, move |value| {
                // Printed, not logged: logging here would feed the `logs` channel.
                println!("[tap][{}] {}", channel_name, describe(value)?);
                Ok(())
            })
            .await?;
        if let Some(id) = registered {
            if let Ok(channel) = name.parse::<Channel>() {
                log::info!("Tapping '{}'", channel);
                subscriptions.push((channel, id));
            }
        }
    }
    Ok(subscriptions)
}

/// Unregisters everything `attach` registered.
pub async fn detach(ctx: &Arc<AppContext>, subscriptions: Vec<(Channel, SubscriberId)>) {
    for (channel, id) in subscriptions {
        ctx.unregister(channel, id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lib_panopticon::ConnectionStatus;
    use std::time::Duration;

    #[test]
    fn test_describe_status_is_json() {
        let value = ChannelValue::LinkStatus(ConnectionStatus::new("ws://x", Duration::from_secs(1)));
        let line = describe(&value).unwrap();
        assert!(line.contains(r#""uri":"ws://x""#));
        assert!(line.contains(r#""error":"NO_ERROR""#));
    }
}
