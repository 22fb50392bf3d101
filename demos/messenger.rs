//! A tiny publish/subscribe registry built on `WeakTable`.
//!
//! Run with `RUST_LOG=weaktable_rs=debug` to see container replacements.

use std::sync::Arc;

use tracing_subscriber::EnvFilter;
use weaktable_rs::WeakTable;

trait Recipient: Send + Sync {
    fn receive(&self, message: &str);
}

struct Printer {
    name: String,
}

impl Recipient for Printer {
    fn receive(&self, message: &str) {
        println!("{} <- {}", self.name, message);
    }
}

/// Maps each recipient to the channel it listens on, without keeping it alive
struct Messenger {
    recipients: WeakTable<dyn Recipient, String>,
}

impl Messenger {
    fn new() -> Self {
        Self {
            recipients: WeakTable::new(),
        }
    }

    fn register(&self, recipient: &Arc<dyn Recipient>, channel: &str) -> weaktable_rs::Result<bool> {
        self.recipients.try_add(recipient, channel.to_string())
    }

    fn send(&self, channel: &str, message: &str) -> usize {
        // Collect first: a recipient that registers from `receive` would block on the
        // iterator's lock.
        let targets: Vec<Arc<dyn Recipient>> = self
            .recipients
            .iter()
            .filter(|(_, c)| c == channel)
            .map(|(r, _)| r)
            .collect();
        for target in &targets {
            target.receive(message);
        }
        targets.len()
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let messenger = Messenger::new();

    let alice: Arc<dyn Recipient> = Arc::new(Printer {
        name: "alice".to_string(),
    });
    let bob: Arc<dyn Recipient> = Arc::new(Printer {
        name: "bob".to_string(),
    });

    messenger.register(&alice, "news")?;
    messenger.register(&bob, "news")?;
    assert!(!messenger.register(&bob, "sports")?);

    println!("delivered to {}", messenger.send("news", "hello"));

    // Bob goes away without unregistering
    drop(bob);
    println!("delivered to {}", messenger.send("news", "still there?"));
    println!("purged {} stale registrations", messenger.recipients.purge_expired()?);

    // Lots of short-lived subscribers exercise growth and compaction
    for i in 0..100 {
        let temp: Arc<dyn Recipient> = Arc::new(Printer {
            name: format!("temp-{i}"),
        });
        messenger.register(&temp, "void")?;
    }
    println!(
        "{:?} after short-lived subscribers, {} live",
        messenger.recipients,
        messenger.recipients.iter().count()
    );

    Ok(())
}
