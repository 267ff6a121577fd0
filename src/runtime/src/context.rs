//! Root cancellation context.
//!
//! One token per process, cancelled on SIGINT/SIGTERM. Every external call
//! takes a child of it so that an interrupt unwinds in-flight work.

use std::future::Future;
use std::sync::OnceLock;

use cdbox_core::error::{BoxError, Result};
use tokio_util::sync::CancellationToken;

static ROOT: OnceLock<CancellationToken> = OnceLock::new();

/// The process-wide root token.
pub fn root() -> CancellationToken {
    ROOT.get_or_init(CancellationToken::new).clone()
}

/// Cancel the root token when SIGINT or SIGTERM arrives.
///
/// Must be called from within a tokio runtime.
pub fn install_signal_handler() {
    let token = root();
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::debug!("interrupt received, cancelling root context");
        token.cancel();
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Run `fut` until it completes or `token` is cancelled.
pub async fn cancellable<T, F>(token: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(BoxError::Cancelled),
        res = fut => res,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancellable_completes() {
        let token = CancellationToken::new();
        let v = cancellable(&token, async { Ok(7) }).await.unwrap();
        assert_eq!(v, 7);
    }

    #[tokio::test]
    async fn test_cancellable_cancelled() {
        let token = CancellationToken::new();
        let child = token.child_token();
        token.cancel();
        let res: Result<()> = cancellable(&child, async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        })
        .await;
        assert!(matches!(res, Err(BoxError::Cancelled)));
    }

    #[test]
    fn test_root_is_shared() {
        let a = root();
        let b = root();
        assert!(!a.is_cancelled());
        assert!(!b.is_cancelled());
    }
}
