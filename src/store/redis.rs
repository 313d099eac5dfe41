//! Redis transport using the synchronous `redis` client.

use std::time::Duration;

use redis::{Client, FromRedisValue, ToRedisArgs};
use tracing::debug;

use super::{Connection, Connector};
use crate::error::{CacheError, Result};

/// Connector for one Redis endpoint.
#[derive(Debug, Clone)]
pub struct RedisConnector {
    client: Client,
    endpoint: String,
    connect_timeout: Duration,
}

impl RedisConnector {
    /// Create a connector for a `redis://host:port[/db]` URL.
    ///
    /// # Errors
    /// Returns [`CacheError::Config`] if the URL cannot be parsed.
    pub fn new(url: &str, connect_timeout: Duration) -> Result<Self> {
        let client = Client::open(url)
            .map_err(|e| CacheError::Config(format!("invalid store url '{}': {}", url, e)))?;

        Ok(Self {
            client,
            endpoint: url.to_string(),
            connect_timeout,
        })
    }
}

impl Connector for RedisConnector {
    fn connect(&self) -> Result<Box<dyn Connection>> {
        let conn = self
            .client
            .get_connection_with_timeout(self.connect_timeout)
            .map_err(|e| CacheError::Transport(format!("{}: {}", self.endpoint, e)))?;
        debug!("Opened connection to {}", self.endpoint);
        Ok(Box::new(RedisConnection { inner: conn }))
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

struct RedisConnection {
    inner: redis::Connection,
}

impl RedisConnection {
    fn query<T: FromRedisValue>(&mut self, name: &str, args: &[&dyn Arg]) -> Result<T> {
        let mut cmd = redis::cmd(name);
        for arg in args {
            arg.push(&mut cmd);
        }
        Ok(cmd.query(&mut self.inner)?)
    }
}

/// Object-safe wrapper so mixed argument types fit in one slice.
trait Arg {
    fn push(&self, cmd: &mut redis::Cmd);
}

impl<T: ToRedisArgs> Arg for T {
    fn push(&self, cmd: &mut redis::Cmd) {
        cmd.arg(self);
    }
}

impl Connection for RedisConnection {
    fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.query("GET", &[&key])
    }

    fn set(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.query("SET", &[&key, &value])
    }

    fn set_ex(&mut self, key: &[u8], value: &[u8], seconds: u64) -> Result<()> {
        self.query("SETEX", &[&key, &seconds, &value])
    }

    fn del(&mut self, key: &[u8]) -> Result<u64> {
        self.query("DEL", &[&key])
    }

    fn del_many(&mut self, keys: &[&[u8]]) -> Result<u64> {
        let mut cmd = redis::cmd("DEL");
        for key in keys {
            cmd.arg(*key);
        }
        Ok(cmd.query(&mut self.inner)?)
    }

    fn expire(&mut self, key: &[u8], seconds: u64) -> Result<bool> {
        self.query("EXPIRE", &[&key, &seconds])
    }

    fn incr_by(&mut self, key: &[u8], delta: i64) -> Result<i64> {
        self.query("INCRBY", &[&key, &delta])
    }

    fn decr_by(&mut self, key: &[u8], delta: i64) -> Result<i64> {
        self.query("DECRBY", &[&key, &delta])
    }

    fn incr_by_float(&mut self, key: &[u8], delta: f64) -> Result<f64> {
        self.query("INCRBYFLOAT", &[&key, &delta])
    }

    fn get_set(&mut self, key: &[u8], value: &[u8]) -> Result<Option<Vec<u8>>> {
        self.query("GETSET", &[&key, &value])
    }

    fn append(&mut self, key: &[u8], value: &[u8]) -> Result<u64> {
        self.query("APPEND", &[&key, &value])
    }

    fn strlen(&mut self, key: &[u8]) -> Result<u64> {
        self.query("STRLEN", &[&key])
    }

    fn get_range(&mut self, key: &[u8], start: i64, end: i64) -> Result<Vec<u8>> {
        self.query("GETRANGE", &[&key, &start, &end])
    }

    fn set_range(&mut self, key: &[u8], offset: u64, value: &[u8]) -> Result<u64> {
        self.query("SETRANGE", &[&key, &offset, &value])
    }

    fn get_bit(&mut self, key: &[u8], offset: u64) -> Result<bool> {
        self.query("GETBIT", &[&key, &offset])
    }

    fn ping(&mut self) -> Result<()> {
        let reply: String = self.query("PING", &[])?;
        if reply == "PONG" {
            Ok(())
        } else {
            Err(CacheError::Transport(format!("unexpected PING reply: {}", reply)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_malformed_url() {
        let err = RedisConnector::new("not a url", Duration::from_millis(100)).unwrap_err();
        assert!(matches!(err, CacheError::Config(_)));
    }

    #[test]
    fn test_keeps_endpoint_for_logs() {
        let connector =
            RedisConnector::new("redis://127.0.0.1:6379", Duration::from_millis(100)).unwrap();
        assert_eq!(connector.endpoint(), "redis://127.0.0.1:6379");
    }
}
