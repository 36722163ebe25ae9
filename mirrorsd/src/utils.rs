//! Name normalization shared by the routing key, provisioning, and DM channel
//! naming paths, plus the shutdown flag every long-running task watches and
//! the per-run log file setup.

use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::watch;

/// Point the `log` facade at a fresh timestamped file under `logs/`, one per
/// run, the filter taken from `RUST_LOG` (default info).
pub fn init_logging(process: &str) -> std::io::Result<()> {
    std::fs::create_dir_all("logs")?;
    let filename = format!("logs/{process}_{}.log", chrono::Local::now().format("%Y-%m-%d_%H-%M-%S"));
    let file = std::fs::File::create(&filename)?;
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Pipe(Box::new(file)))
        .init();
    eprintln!("logging to {filename}");
    Ok(())
}

/// Normalize a category/server/channel name the way routing keys expect:
/// lowercased, spaces to hyphens, decorative pipes and bolts stripped.
pub fn normalize_name(name: &str) -> String {
    name.trim()
        .to_lowercase()
        .replace(' ', "-")
        .replace(['|', '│', '︱', '⚡'], "")
        .trim_matches('-')
        .to_string()
}

static USERNAME_JUNK: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\w\s\-_]").unwrap());
static HYPHEN_RUNS: Lazy<Regex> = Lazy::new(|| Regex::new(r"-+").unwrap());

/// Normalize a username so it is safe to use as a Discord channel name.
pub fn normalize_username(username: &str) -> String {
    let cleaned = USERNAME_JUNK.replace_all(username, "");
    let cleaned = cleaned.replace(' ', "-").to_lowercase().replace('_', "-");
    let cleaned = HYPHEN_RUNS.replace_all(&cleaned, "-");
    let cleaned = cleaned.trim_matches(|c| c == '-' || c == '_');
    if cleaned.is_empty() {
        "unknown-user".to_string()
    } else {
        cleaned.to_string()
    }
}

/// Insertion-ordered bounded set, used for the recently-seen message ids on
/// both sides of the queue.
#[derive(Debug)]
pub struct BoundedSet<T> {
    order: std::collections::VecDeque<T>,
    seen: std::collections::HashSet<T>,
    capacity: usize,
}

impl<T: std::hash::Hash + Eq + Clone> BoundedSet<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            order: std::collections::VecDeque::with_capacity(capacity),
            seen: std::collections::HashSet::with_capacity(capacity),
            capacity,
        }
    }

    /// True the first time a value is offered, false on retransmits. The
    /// oldest entry is evicted once the set is full.
    pub fn insert(&mut self, value: T) -> bool {
        if !self.seen.insert(value.clone()) {
            return false;
        }
        self.order.push_back(value);
        if self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Shutdown flag shared by every long-running task. The sender side flips to
/// `true` once, from the signal handler.
pub type ShutdownRx = watch::Receiver<bool>;

pub fn shutdown_channel() -> (watch::Sender<bool>, ShutdownRx) {
    watch::channel(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_lowercase_and_hyphenate() {
        assert_eq!(normalize_name("Release Guides"), "release-guides");
        assert_eq!(normalize_name("  INFO  "), "info");
    }

    #[test]
    fn names_strip_decorations() {
        assert_eq!(normalize_name("04-17│foo"), "04-17foo");
        assert_eq!(normalize_name("⚡drops new"), "drops-new");
        assert_eq!(normalize_name("#⚡│alerts"), "#alerts");
    }

    #[test]
    fn usernames_flatten_to_channel_safe() {
        assert_eq!(normalize_username("Cool User"), "cool-user");
        assert_eq!(normalize_username("sn__eaker_head"), "sn-eaker-head");
        assert_eq!(normalize_username("🔥🔥🔥"), "unknown-user");
    }
}
