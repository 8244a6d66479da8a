//! Handle for drivers with a blocking API (rusqlite, oracle, odbc-api)
//!
//! The connection moves onto the blocking pool for each call and is put back
//! afterwards. A panic inside the call drops the connection.

use dbbridge_core::{ConnectorError, Result};
use tokio::task;

pub struct BlockingHandle<C> {
    backend: &'static str,
    conn: Option<C>,
}

impl<C: Send + 'static> BlockingHandle<C> {
    pub fn new(backend: &'static str) -> Self {
        Self {
            backend,
            conn: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.conn.is_some()
    }

    /// Open a connection with `connect` on the blocking pool
    pub async fn open<F>(&mut self, connect: F) -> Result<()>
    where
        F: FnOnce() -> Result<C> + Send + 'static,
    {
        let conn = task::spawn_blocking(connect)
            .await
            .map_err(|e| ConnectorError::connection(self.backend, e))??;
        self.conn = Some(conn);
        Ok(())
    }

    pub async fn run<T, F>(&mut self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut C) -> Result<T> + Send + 'static,
    {
        let backend = self.backend;
        let mut conn = self
            .conn
            .take()
            .ok_or_else(|| ConnectorError::connection(backend, "not connected"))?;

        let (conn, result) = task::spawn_blocking(move || {
            let result = f(&mut conn);
            (conn, result)
        })
        .await
        .map_err(|e| ConnectorError::query(format!("{} worker failed: {}", backend, e)))?;

        self.conn = Some(conn);
        result
    }

    /// Take the connection out for closing
    pub fn take(&mut self) -> Option<C> {
        self.conn.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_handle_survives_failed_call() {
        let mut handle = BlockingHandle::<Vec<u32>>::new("Test");
        assert!(handle.run(|_| Ok(())).await.is_err());

        handle.open(|| Ok(vec![1])).await.unwrap();
        let err = handle
            .run(|v| -> Result<()> {
                v.push(2);
                Err(ConnectorError::query("boom"))
            })
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Error executing query: boom");
        assert!(handle.is_open());
        assert_eq!(handle.run(|v| Ok(v.len())).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_panic_drops_connection() {
        let mut handle = BlockingHandle::<u32>::new("Test");
        handle.open(|| Ok(7)).await.unwrap();
        let result = handle.run(|_| -> Result<()> { panic!("driver crashed") }).await;
        assert!(result.is_err());
        assert!(!handle.is_open());
    }
}
