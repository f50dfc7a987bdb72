//! Bounded connection pooling for source adapters.
//!
//! [`ConnectionPool`] is generic over a [`ConnectionManager`] that knows how
//! to open, check and close one kind of connection. Capacity is a tokio
//! semaphore, so a checkout holds a permit for as long as its
//! [`PooledConnection`] guard lives and releases it on drop on every exit path.
//!
//! Every checkout of an idle connection runs the manager's health check. Dead
//! connections are closed and replaced; opening a connection is retried with
//! exponential backoff before a [`ScanError::Connection`] is surfaced.
//!
//! Sources that only allow one connection use [`SharedConnection`] instead.

mod shared;

pub use shared::{SharedConnection, SharedConnectionGuard};

use crate::adapters::AdapterConfig;
use crate::error::{Result, ScanError};
use async_trait::async_trait;
use rand::Rng;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Upper bound for a single backoff sleep.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Opens, validates and closes connections of one kind.
#[async_trait]
pub trait ConnectionManager: Send + Sync + 'static {
    type Connection: Send + 'static;

    /// Opens a new connection.
    async fn connect(&self) -> Result<Self::Connection>;

    /// Cheap liveness probe run on every checkout of an idle connection.
    async fn is_valid(&self, conn: &mut Self::Connection) -> bool;

    /// Closes a connection gracefully. Dropping it is the default.
    async fn close(&self, conn: Self::Connection) {
        drop(conn);
    }
}

/// Sizing, timeout and retry policy for a pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Connections opened eagerly by [`ConnectionPool::warm_up`]
    pub min_size: u32,
    /// Maximum simultaneously open connections
    pub max_size: u32,
    /// How long `acquire` waits for capacity
    pub acquire_timeout: Duration,
    /// Total connect attempts before giving up
    pub retry_attempts: u32,
    /// First backoff delay; doubled after each failed attempt
    pub retry_base_delay: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 0,
            max_size: 5,
            acquire_timeout: Duration::from_secs(30),
            retry_attempts: 3,
            retry_base_delay: Duration::from_secs(1),
        }
    }
}

impl PoolConfig {
    /// Derives pool policy from adapter configuration.
    pub fn from_adapter_config(config: &AdapterConfig) -> Self {
        Self {
            min_size: config.pool_min,
            max_size: config.pool_max(),
            acquire_timeout: config.timeout(),
            retry_attempts: config.retry_attempts,
            retry_base_delay: config.retry_delay(),
        }
    }

    /// # Errors
    /// Returns a configuration error for an empty or inverted pool.
    pub fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(ScanError::configuration(
                "pool max_size must be greater than 0",
            ));
        }
        if self.min_size > self.max_size {
            return Err(ScanError::configuration(format!(
                "pool min_size ({}) cannot exceed max_size ({})",
                self.min_size, self.max_size
            )));
        }
        if self.acquire_timeout.is_zero() {
            return Err(ScanError::configuration(
                "pool acquire_timeout must be greater than 0",
            ));
        }
        Ok(())
    }

    /// Backoff before retry number `attempt` (0-based), with up to 25% jitter.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        let base = self
            .retry_base_delay
            .saturating_mul(factor)
            .min(MAX_RETRY_DELAY);
        let jitter_ms = u64::try_from(base.as_millis() / 4).unwrap_or(0);
        if jitter_ms == 0 {
            return base;
        }
        base + Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
    }
}

/// Pool statistics for monitoring connection pool health and usage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Number of idle connections ready to be used
    pub idle_connections: u32,
    /// Number of connections currently checked out
    pub active_connections: u32,
    /// Total number of open connections
    pub total_connections: u32,
    /// Maximum allowed connections (from configuration)
    pub max_connections: u32,
    /// Connections discarded because they failed the health check
    pub replaced_connections: u64,
}

struct PoolInner<M: ConnectionManager> {
    manager: M,
    config: PoolConfig,
    idle: Mutex<Vec<M::Connection>>,
    permits: Arc<Semaphore>,
    open: AtomicU32,
    replaced: AtomicU64,
    closed: AtomicBool,
}

impl<M: ConnectionManager> PoolInner<M> {
    fn take_idle(&self) -> Option<M::Connection> {
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
    }

    fn put_idle(&self, conn: M::Connection) {
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(conn);
    }

    fn idle_count(&self) -> u32 {
        let len = self
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        u32::try_from(len).unwrap_or(u32::MAX)
    }

    fn forget_one(&self) {
        let _ = self
            .open
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }
}

/// A bounded pool of source connections shared by the workers of one scan.
pub struct ConnectionPool<M: ConnectionManager> {
    inner: Arc<PoolInner<M>>,
}

impl<M: ConnectionManager> Clone for ConnectionPool<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M: ConnectionManager> std::fmt::Debug for ConnectionPool<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("config", &self.inner.config)
            .field("stats", &self.statistics())
            .finish_non_exhaustive()
    }
}

impl<M: ConnectionManager> ConnectionPool<M> {
    /// Creates an empty pool. No connection is opened until first use
    /// or [`ConnectionPool::warm_up`].
    ///
    /// # Errors
    /// Returns a configuration error if `config` is invalid.
    pub fn new(manager: M, config: PoolConfig) -> Result<Self> {
        config.validate()?;
        let permits = Arc::new(Semaphore::new(config.max_size as usize));
        Ok(Self {
            inner: Arc::new(PoolInner {
                manager,
                config,
                idle: Mutex::new(Vec::new()),
                permits,
                open: AtomicU32::new(0),
                replaced: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn manager(&self) -> &M {
        &self.inner.manager
    }

    /// Checks out a healthy connection, waiting up to the acquire timeout.
    ///
    /// # Errors
    /// - [`ScanError::PoolExhausted`] if no capacity frees up in time
    /// - [`ScanError::Connection`] if a replacement cannot be opened after
    ///   all retry attempts, or the pool is closed
    pub async fn acquire(&self) -> Result<PooledConnection<M>> {
        self.acquire_timeout(self.inner.config.acquire_timeout).await
    }

    /// [`ConnectionPool::acquire`] with an explicit wait bound.
    pub async fn acquire_timeout(&self, wait: Duration) -> Result<PooledConnection<M>> {
        if self.is_closed() {
            return Err(pool_closed());
        }

        let permit = match tokio::time::timeout(
            wait,
            Arc::clone(&self.inner.permits).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(pool_closed()),
            Err(_) => {
                tracing::warn!("Connection pool exhausted after {:?}", wait);
                return Err(ScanError::PoolExhausted { waited: wait });
            }
        };

        while let Some(mut conn) = self.inner.take_idle() {
            if self.inner.manager.is_valid(&mut conn).await {
                return Ok(self.guard(conn, permit));
            }
            tracing::debug!("Discarding connection that failed its health check");
            self.inner.manager.close(conn).await;
            self.inner.forget_one();
            self.inner.replaced.fetch_add(1, Ordering::Relaxed);
        }

        let conn = self.open_with_retry().await?;
        self.inner.open.fetch_add(1, Ordering::AcqRel);
        Ok(self.guard(conn, permit))
    }

    /// Returns a connection to the pool. Equivalent to dropping the guard.
    pub fn release(&self, conn: PooledConnection<M>) {
        drop(conn);
    }

    /// Opens connections until `min_size` are idle.
    ///
    /// # Errors
    /// Returns the connect error if a connection cannot be opened.
    pub async fn warm_up(&self) -> Result<()> {
        while self.size() < self.inner.config.min_size && !self.is_closed() {
            let conn = self.open_with_retry().await?;
            self.inner.open.fetch_add(1, Ordering::AcqRel);
            self.inner.put_idle(conn);
        }
        Ok(())
    }

    /// Closes idle connections and refuses further checkouts.
    ///
    /// Connections still checked out are dropped when their guards are.
    /// Calling this more than once is a no-op.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.permits.close();
        while let Some(conn) = self.inner.take_idle() {
            self.inner.manager.close(conn).await;
            self.inner.forget_one();
        }
        tracing::debug!("Connection pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Number of open connections, idle or checked out.
    pub fn size(&self) -> u32 {
        self.inner.open.load(Ordering::Acquire)
    }

    pub fn max_size(&self) -> u32 {
        self.inner.config.max_size
    }

    /// Connections sitting idle in the pool.
    pub fn idle(&self) -> u32 {
        self.inner.idle_count()
    }

    pub fn statistics(&self) -> PoolStats {
        let total = self.size();
        let idle = self.idle().min(total);
        PoolStats {
            idle_connections: idle,
            active_connections: total.saturating_sub(idle),
            total_connections: total,
            max_connections: self.max_size(),
            replaced_connections: self.inner.replaced.load(Ordering::Relaxed),
        }
    }

    fn guard(&self, conn: M::Connection, permit: OwnedSemaphorePermit) -> PooledConnection<M> {
        PooledConnection {
            conn: Some(conn),
            pool: Arc::clone(&self.inner),
            _permit: permit,
        }
    }

    async fn open_with_retry(&self) -> Result<M::Connection> {
        connect_with_retry(&self.inner.config, move || self.inner.manager.connect()).await
    }
}

/// Runs `connect` until it succeeds, a non-transient error occurs, or
/// `config.retry_attempts` attempts have been made, sleeping with
/// exponential backoff in between.
///
/// # Errors
/// Returns the last connect error.
pub async fn connect_with_retry<T, F, Fut>(config: &PoolConfig, mut connect: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let attempts = config.retry_attempts.max(1);
    let mut attempt = 0;
    loop {
        match connect().await {
            Ok(conn) => {
                if attempt > 0 {
                    tracing::info!("Connected after {} attempts", attempt + 1);
                }
                return Ok(conn);
            }
            Err(e) if e.is_transient() && attempt + 1 < attempts => {
                let delay = config.backoff_delay(attempt);
                tracing::warn!(
                    "Connection attempt {}/{} failed: {}; retrying in {:?}",
                    attempt + 1,
                    attempts,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                tracing::error!("Connection failed after {} attempt(s): {}", attempt + 1, e);
                return Err(e);
            }
        }
    }
}

fn pool_closed() -> ScanError {
    ScanError::connection_failed(
        "connection pool",
        std::io::Error::other("connection pool is closed"),
    )
}

/// A checked-out connection. Returned to its pool on drop.
///
/// Holds its pool alive, so it can be moved into `'static` streams.
pub struct PooledConnection<M: ConnectionManager> {
    conn: Option<M::Connection>,
    pool: Arc<PoolInner<M>>,
    _permit: OwnedSemaphorePermit,
}

impl<M: ConnectionManager> PooledConnection<M> {
    /// Removes the connection from the pool, e.g. after it broke mid-use.
    /// The capacity slot is freed when this returns.
    pub fn detach(mut self) -> Option<M::Connection> {
        let conn = self.conn.take();
        if conn.is_some() {
            self.pool.forget_one();
        }
        conn
    }
}

impl<M: ConnectionManager> std::fmt::Debug for PooledConnection<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("attached", &self.conn.is_some())
            .finish_non_exhaustive()
    }
}

impl<M: ConnectionManager> Deref for PooledConnection<M> {
    type Target = M::Connection;

    fn deref(&self) -> &Self::Target {
        match &self.conn {
            Some(conn) => conn,
            None => unreachable!("connection is only taken when the guard is consumed"),
        }
    }
}

impl<M: ConnectionManager> DerefMut for PooledConnection<M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match &mut self.conn {
            Some(conn) => conn,
            None => unreachable!("connection is only taken when the guard is consumed"),
        }
    }
}

impl<M: ConnectionManager> Drop for PooledConnection<M> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if self.pool.closed.load(Ordering::Acquire) {
                drop(conn);
                self.pool.forget_one();
            } else {
                self.pool.put_idle(conn);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Hands out numbered connections; ids listed in `dead` fail health checks.
    #[derive(Default)]
    struct CountingManager {
        opened: AtomicUsize,
        failures_before_success: AtomicUsize,
        dead: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl ConnectionManager for CountingManager {
        type Connection = usize;

        async fn connect(&self) -> Result<usize> {
            if self
                .failures_before_success
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(ScanError::connection_failed(
                    "mock",
                    std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"),
                ));
            }
            Ok(self.opened.fetch_add(1, Ordering::SeqCst))
        }

        async fn is_valid(&self, conn: &mut usize) -> bool {
            !self.dead.lock().unwrap().contains(conn)
        }
    }

    fn config(max: u32) -> PoolConfig {
        PoolConfig {
            min_size: 0,
            max_size: max,
            acquire_timeout: Duration::from_millis(50),
            retry_attempts: 3,
            retry_base_delay: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn test_acquire_reuses_released_connection() -> Result<()> {
        let pool = ConnectionPool::new(CountingManager::default(), config(2))?;

        let conn = pool.acquire().await?;
        assert_eq!(*conn, 0);
        pool.release(conn);

        let conn = pool.acquire().await?;
        assert_eq!(*conn, 0);
        assert_eq!(pool.size(), 1);
        assert_eq!(pool.statistics().active_connections, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_acquire_times_out_when_exhausted() -> Result<()> {
        let pool = ConnectionPool::new(CountingManager::default(), config(1))?;

        let held = pool.acquire().await?;
        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, ScanError::PoolExhausted { .. }));
        assert_eq!(err.kind(), crate::error::ErrorKind::ConnectionError);

        drop(held);
        assert!(pool.acquire().await.is_ok());
        Ok(())
    }

    #[tokio::test]
    async fn test_dead_connection_replaced_on_checkout() -> Result<()> {
        let pool = ConnectionPool::new(CountingManager::default(), config(2))?;

        drop(pool.acquire().await?);
        pool.manager().dead.lock().unwrap().push(0);

        let conn = pool.acquire().await?;
        assert_eq!(*conn, 1);
        assert_eq!(pool.size(), 1);
        assert_eq!(pool.statistics().replaced_connections, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_connect_retries_with_backoff() -> Result<()> {
        let manager = CountingManager::default();
        manager.failures_before_success.store(2, Ordering::SeqCst);
        let pool = ConnectionPool::new(manager, config(1))?;

        let conn = pool.acquire().await?;
        assert_eq!(*conn, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_connect_gives_up_after_retry_attempts() -> Result<()> {
        let manager = CountingManager::default();
        manager.failures_before_success.store(3, Ordering::SeqCst);
        let pool = ConnectionPool::new(manager, config(1))?;

        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, ScanError::Connection { .. }));
        assert_eq!(pool.size(), 0);

        // The failed attempt released its capacity slot.
        assert!(pool.acquire().await.is_ok());
        Ok(())
    }

    #[tokio::test]
    async fn test_warm_up_and_close() -> Result<()> {
        let mut cfg = config(3);
        cfg.min_size = 2;
        let pool = ConnectionPool::new(CountingManager::default(), cfg)?;

        pool.warm_up().await?;
        assert_eq!(pool.size(), 2);
        assert_eq!(pool.idle(), 2);

        pool.close().await;
        pool.close().await;
        assert_eq!(pool.size(), 0);
        assert!(pool.acquire().await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_detach_frees_capacity() -> Result<()> {
        let pool = ConnectionPool::new(CountingManager::default(), config(1))?;

        let conn = pool.acquire().await?;
        assert_eq!(conn.detach(), Some(0));
        assert_eq!(pool.size(), 0);

        let conn = pool.acquire().await?;
        assert_eq!(*conn, 1);
        Ok(())
    }

    #[test]
    fn test_pool_config_validation() {
        assert!(PoolConfig::default().validate().is_ok());
        assert!(
            PoolConfig {
                max_size: 0,
                ..Default::default()
            }
            .validate()
            .is_err()
        );
        assert!(
            PoolConfig {
                min_size: 4,
                max_size: 2,
                ..Default::default()
            }
            .validate()
            .is_err()
        );
    }

    #[test]
    fn test_backoff_grows_exponentially() {
        let cfg = PoolConfig {
            retry_base_delay: Duration::from_millis(100),
            ..Default::default()
        };
        let first = cfg.backoff_delay(0);
        let third = cfg.backoff_delay(2);
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(125));
        assert!(third >= Duration::from_millis(400) && third <= Duration::from_millis(500));
        assert!(cfg.backoff_delay(20) <= MAX_RETRY_DELAY + MAX_RETRY_DELAY / 4);
    }

    #[test]
    fn test_pool_config_from_adapter_config() {
        let adapter = AdapterConfig::from_url("postgres://localhost/db")
            .with_pool_bounds(1, 7)
            .with_retry_attempts(4);
        let cfg = PoolConfig::from_adapter_config(&adapter);
        assert_eq!(cfg.min_size, 1);
        assert_eq!(cfg.max_size, 7);
        assert_eq!(cfg.retry_attempts, 4);
    }
}
