use anyhow::{Context, Result};
use redis::aio::ConnectionManager;
use redis::Client;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::info;

/// Fixed-size pool of independent Redis connections, handed out round-robin.
///
/// Each slot is its own `ConnectionManager`, so concurrent callers spread
/// their synchronous wait time across physical connections. The pool does no
/// health checking: a failed connection keeps being handed out and the
/// manager reconnects transparently. Load distribution is the only job here.
pub struct RedisPool {
    managers: Vec<ConnectionManager>,
    next: AtomicUsize,
}

impl RedisPool {
    pub const DEFAULT_SIZE: usize = 3;

    /// Open `size` independent connections to the given Redis endpoint.
    pub async fn connect(redis_url: &str, size: usize) -> Result<Self> {
        let size = size.max(1);
        let mut managers = Vec::with_capacity(size);

        for slot in 0..size {
            let client = Client::open(redis_url)
                .context("failed to parse REDIS_URL connection string")?;
            let manager = ConnectionManager::new(client)
                .await
                .with_context(|| format!("failed to open Redis pool connection {slot}"))?;
            managers.push(manager);
        }

        info!(pool_size = size, "Redis connection pool ready");

        Ok(Self {
            managers,
            next: AtomicUsize::new(0),
        })
    }

    /// Hand out the next connection, round-robin.
    ///
    /// `ConnectionManager` is a cheap clone over a shared multiplexed
    /// connection, so this never blocks.
    pub fn connection(&self) -> ConnectionManager {
        let ticket = self.next.fetch_add(1, Ordering::Relaxed);
        self.managers[round_robin_index(ticket, self.managers.len())].clone()
    }

    pub fn size(&self) -> usize {
        self.managers.len()
    }
}

fn round_robin_index(ticket: usize, len: usize) -> usize {
    ticket % len
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_robin_cycles_through_all_slots() {
        let picks: Vec<usize> = (0..7).map(|t| round_robin_index(t, 3)).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2, 0]);
    }

    #[test]
    fn round_robin_survives_counter_wraparound() {
        assert_eq!(round_robin_index(usize::MAX, 3), usize::MAX % 3);
        assert_eq!(round_robin_index(0, 1), 0);
    }
}
