//! Listener lifecycle

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, ToSocketAddrs};

use crate::error::{Error, Result};
use crate::proxy::MitmProxy;

/// Pause after an accept failure caused by resource exhaustion
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Accepts client connections and hands each one to the proxy on its own task
pub struct ProxyServer {
  listener: TcpListener,
  proxy: Arc<MitmProxy>,
}

impl ProxyServer {
  /// Bind the listening socket
  pub async fn bind(addr: impl ToSocketAddrs, proxy: Arc<MitmProxy>) -> Result<Self> {
    let listener = TcpListener::bind(addr).await?;
    Ok(Self { listener, proxy })
  }

  /// Address the server is listening on
  pub fn local_addr(&self) -> Result<SocketAddr> {
    Ok(self.listener.local_addr()?)
  }

  /// Accept connections until `shutdown` resolves.
  ///
  /// Never returns `Ok`: a requested shutdown yields [`Error::ServerClosed`],
  /// anything else is an unexpected close of the listening socket.
  pub async fn serve<F>(self, shutdown: F) -> Result<()>
  where
    F: Future<Output = ()>,
  {
    let addr = self.local_addr()?;
    tracing::info!(%addr, "proxy listening");
    tokio::pin!(shutdown);

    loop {
      tokio::select! {
        biased;
        _ = &mut shutdown => {
          tracing::info!(%addr, "proxy shutting down");
          return Err(Error::ServerClosed);
        }
        accepted = self.listener.accept() => match accepted {
          Ok((stream, peer)) => {
            let proxy = self.proxy.clone();
            tokio::spawn(async move {
              match proxy.handle_connection(stream, peer).await {
                Ok(()) => {}
                Err(e) if e.is_connection_scoped() => {
                  tracing::debug!(%peer, "connection ended with error: {}", e);
                }
                Err(e) => tracing::error!(%peer, "connection failed: {}", e),
              }
            });
          }
          Err(e) if is_transient(&e) => {
            tracing::warn!("failed to accept connection: {}", e);
            tokio::time::sleep(ACCEPT_BACKOFF).await;
          }
          Err(e) => {
            tracing::error!(%addr, "listener failed: {}", e);
            return Err(Error::Io(e));
          }
        }
      }
    }
  }
}

fn is_transient(e: &io::Error) -> bool {
  matches!(
    e.kind(),
    io::ErrorKind::ConnectionAborted
      | io::ErrorKind::ConnectionReset
      | io::ErrorKind::Interrupted
      | io::ErrorKind::WouldBlock
      | io::ErrorKind::TimedOut
  ) || is_out_of_descriptors(e)
}

#[cfg(unix)]
fn is_out_of_descriptors(e: &io::Error) -> bool {
  // ENFILE, EMFILE
  matches!(e.raw_os_error(), Some(23) | Some(24))
}

#[cfg(not(unix))]
fn is_out_of_descriptors(_e: &io::Error) -> bool {
  false
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::MitmConfig;

  #[tokio::test]
  async fn shutdown_yields_server_closed() {
    let dir = std::env::temp_dir().join(format!("interpose-server-{}", std::process::id()));
    let config = MitmConfig {
      ca_key_path: dir.join("key"),
      ca_cert_path: dir.join("cert"),
      accept_invalid_upstream_certs: true,
      ..MitmConfig::default()
    };
    let proxy = Arc::new(MitmProxy::from_config(config).await.unwrap());
    assert!(dir.join("cert").exists());
    let server = ProxyServer::bind("127.0.0.1:0", proxy).await.unwrap();
    assert_ne!(server.local_addr().unwrap().port(), 0);

    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    let handle = tokio::spawn(server.serve(async {
      rx.await.ok();
    }));
    tx.send(()).unwrap();
    assert!(matches!(handle.await.unwrap(), Err(Error::ServerClosed)));
    std::fs::remove_dir_all(&dir).ok();
  }

  #[test]
  fn transient_accept_errors() {
    assert!(is_transient(&io::Error::from(io::ErrorKind::ConnectionAborted)));
    assert!(!is_transient(&io::Error::from(io::ErrorKind::PermissionDenied)));
  }
}
