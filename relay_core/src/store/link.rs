//! Connection lifecycle for the pub/sub store.
//!
//! A link moves `Connecting -> Ready`, and back to `Reconnecting` whenever a
//! command fails because the server went away. Reconnect attempts are spaced
//! by a fixed interval; callers either try once ([`RedisLink::with_connection`])
//! or park until the server is back ([`RedisLink::wait_ready`]).

use std::thread;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use super::StoreError;

const TARGET: &str = "warehouse_relay::store";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Ready,
    Reconnecting,
}

pub struct RedisLink {
    name: &'static str,
    client: redis::Client,
    conn: Option<redis::Connection>,
    state: LinkState,
    retry: Duration,
    last_attempt: Option<Instant>,
    on_connect: Option<Box<dyn FnMut(&mut redis::Connection) -> redis::RedisResult<()> + Send>>,
}

impl RedisLink {
    /// Parses the URL only; no connection is made until first use.
    pub fn open(name: &'static str, url: &str, retry: Duration) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(|err| StoreError::Query(err.to_string()))?;
        Ok(Self {
            name,
            client,
            conn: None,
            state: LinkState::Connecting,
            retry,
            last_attempt: None,
            on_connect: None,
        })
    }

    /// Hook run on every fresh connection, e.g. to re-issue a subscription.
    pub fn set_on_connect<F>(&mut self, hook: F)
    where
        F: FnMut(&mut redis::Connection) -> redis::RedisResult<()> + Send + 'static,
    {
        self.on_connect = Some(Box::new(hook));
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn retry_interval(&self) -> Duration {
        self.retry
    }

    /// One connection attempt, unless the last one failed less than a retry
    /// interval ago.
    pub fn ensure_connected(&mut self) -> Result<(), StoreError> {
        if self.conn.is_some() {
            return Ok(());
        }
        if let Some(last) = self.last_attempt {
            if self.state == LinkState::Reconnecting && last.elapsed() < self.retry {
                return Err(StoreError::Unavailable(format!(
                    "{} link waiting to reconnect",
                    self.name
                )));
            }
        }
        self.last_attempt = Some(Instant::now());
        match self.connect_once() {
            Ok(conn) => {
                info!(target: TARGET, link = self.name, "store.connected");
                self.conn = Some(conn);
                self.state = LinkState::Ready;
                Ok(())
            }
            Err(err) => {
                let err = StoreError::from(err);
                self.state = LinkState::Reconnecting;
                if err.is_unavailable() {
                    warn!(
                        target: TARGET,
                        link = self.name,
                        retry_secs = self.retry.as_secs(),
                        error = %err,
                        "store.unavailable"
                    );
                } else {
                    warn!(target: TARGET, link = self.name, error = %err, "store.connect_failed");
                }
                Err(err)
            }
        }
    }

    fn connect_once(&mut self) -> redis::RedisResult<redis::Connection> {
        let mut conn = self.client.get_connection()?;
        if let Some(hook) = self.on_connect.as_mut() {
            hook(&mut conn)?;
        }
        Ok(conn)
    }

    /// Block until a connection is established, retrying at the fixed interval.
    pub fn wait_ready(&mut self) {
        loop {
            match self.ensure_connected() {
                Ok(()) => return,
                Err(_) => {
                    let waited = self.last_attempt.map_or(Duration::ZERO, |at| at.elapsed());
                    thread::sleep(self.retry.saturating_sub(waited));
                }
            }
        }
    }

    /// Run `f` on the live connection. A connection-level failure drops the
    /// connection so the next call reconnects.
    pub fn with_connection<T, F>(&mut self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut redis::Connection) -> redis::RedisResult<T>,
    {
        self.ensure_connected()?;
        let Some(conn) = self.conn.as_mut() else {
            return Err(StoreError::Unavailable(format!("{} link not connected", self.name)));
        };
        f(conn).map_err(|err| {
            let err = StoreError::from(err);
            if err.is_unavailable() {
                self.mark_lost(&err);
            }
            err
        })
    }

    pub fn mark_lost(&mut self, err: &StoreError) {
        if self.conn.take().is_some() {
            warn!(target: TARGET, link = self.name, error = %err, "store.connection_lost");
        }
        self.state = LinkState::Reconnecting;
        self.last_attempt = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_starts_disconnected() {
        let link = RedisLink::open("test", "redis://127.0.0.1:1/", Duration::from_secs(5)).unwrap();
        assert_eq!(link.state(), LinkState::Connecting);
        assert_eq!(link.retry_interval(), Duration::from_secs(5));
    }

    #[test]
    fn refused_connection_backs_off() {
        let mut link =
            RedisLink::open("test", "redis://127.0.0.1:1/", Duration::from_secs(60)).unwrap();
        let first = link.ensure_connected().unwrap_err();
        assert!(first.is_unavailable());
        assert_eq!(link.state(), LinkState::Reconnecting);

        // Inside the retry window no new attempt is made.
        let second = link.ensure_connected().unwrap_err();
        assert!(second.to_string().contains("waiting to reconnect"));
    }

    #[test]
    fn bad_url_is_a_query_error() {
        let err = RedisLink::open("test", "not a url", Duration::from_secs(1))
            .err()
            .unwrap();
        assert!(!err.is_unavailable());
    }
}
