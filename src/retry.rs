use std::{future::Future, time::Duration};
use tracing::debug;

/// Política de reintentos con espera fija entre intentos.
///
/// `max_attempts` cuenta el primer intento; `None` reintenta indefinidamente
/// (reconexión de nodos).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: Option<u32>,
    pub delay: Duration,
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            delay,
        }
    }

    pub const fn forever(delay: Duration) -> Self {
        Self {
            max_attempts: None,
            delay,
        }
    }

    /// Un único reintento diferido
    pub const fn once_after(delay: Duration) -> Self {
        Self::new(2, delay)
    }

    /// Búsquedas desde la capa del llamador: 5 intentos, 1s entre ellos
    pub const fn search() -> Self {
        Self::new(5, Duration::from_secs(1))
    }

    pub fn allows_another(&self, attempt: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempt < max)
    }
}

/// Ejecuta `op` hasta que tenga éxito o se agoten los intentos.
///
/// `op` recibe el número de intento (empezando en 1).
pub async fn retry<T, E, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if policy.allows_another(attempt) => {
                debug!(
                    "🔄 Intento {} fallido ({}), reintentando en {:?}",
                    attempt, e, policy.delay
                );
                tokio::time::sleep(policy.delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_retry_stops_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, Duration::from_millis(1));

        let result: Result<(), String> = retry(&policy, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("boom".to_string()) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_returns_first_success() {
        let policy = RetryPolicy::new(5, Duration::from_millis(1));

        let result: Result<u32, String> = retry(&policy, |attempt| async move {
            if attempt < 2 {
                Err(format!("attempt {attempt}"))
            } else {
                Ok(attempt)
            }
        })
        .await;

        assert_eq!(result, Ok(2));
    }

    #[test]
    fn test_once_after_allows_exactly_one_retry() {
        let policy = RetryPolicy::once_after(Duration::from_secs(5));
        assert!(policy.allows_another(1));
        assert!(!policy.allows_another(2));
        assert!(RetryPolicy::forever(Duration::from_secs(60)).allows_another(u32::MAX - 1));
    }
}
