//! TCP listener.
//!
//! Accepts connections and runs one `Session` per connection as a local
//! task, all sharing the same execution context. Sessions report their end
//! over a channel; the configured `SessionEndPolicy` decides whether that
//! stops the server.

use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{info, info_span, warn, Instrument};

use crate::backend::Evaluator;
use crate::config::{ServerConfig, SessionEndPolicy};
use crate::session::{Session, SessionEnd, SharedContext};

/// A bound listener plus the context its sessions share.
pub struct Server<E> {
    listener: TcpListener,
    context: SharedContext<E>,
    config: ServerConfig,
}

impl<E: Evaluator + 'static> Server<E> {
    /// Bind the configured address. Port 0 binds an ephemeral port.
    pub async fn bind(config: ServerConfig, evaluator: E) -> Result<Self> {
        let addr = config.listen_addr();
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind {addr}"))?;
        Ok(Self {
            listener,
            context: Rc::new(RefCell::new(evaluator)),
            config,
        })
    }

    /// The address actually bound.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("Failed to read listener address")
    }

    /// Accept connections until a session end stops the server.
    ///
    /// Must run inside a `tokio::task::LocalSet`. Under
    /// `SessionEndPolicy::Exit` this returns the first session end; under
    /// `Continue` it only returns if the accept loop is dropped.
    pub async fn run(self) -> SessionEnd {
        let (end_tx, mut end_rx) = mpsc::unbounded_channel::<(u64, SessionEnd)>();
        let mut next_id: u64 = 0;

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!(error = %e, "Failed to accept connection");
                            continue;
                        }
                    };

                    next_id += 1;
                    let id = next_id;
                    info!(session = id, %peer, "Accepted connection");

                    let session = Session::with_max_record(
                        stream,
                        Rc::clone(&self.context),
                        self.config.max_record_bytes,
                    );
                    let end_tx = end_tx.clone();
                    tokio::task::spawn_local(
                        async move {
                            let end = session.run().await;
                            let _ = end_tx.send((id, end));
                        }
                        .instrument(info_span!("session", id, %peer)),
                    );
                }
                Some((id, end)) = end_rx.recv() => {
                    match self.config.on_session_end {
                        SessionEndPolicy::Exit => {
                            info!(session = id, exit_code = end.exit_code(), "Session ended, stopping server");
                            return end;
                        }
                        SessionEndPolicy::Continue => {
                            info!(session = id, exit_code = end.exit_code(), "Session ended, still listening");
                        }
                    }
                }
            }
        }
    }
}
