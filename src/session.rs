//! Session lifecycle for one client connection.
//!
//! A session reads records from its stream, dispatches them in arrival
//! order against the shared execution context and writes one response line
//! per response. When the stream closes the session reports a
//! [`SessionEnd`]; what that means for the process is decided by the server.

use std::cell::RefCell;
use std::io;
use std::rc::Rc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tracing::{debug, info, trace, warn};

use crate::backend::Evaluator;
use crate::dispatch::dispatch;
use crate::transport::{write_record, Frame, LineFramer, MAX_RECORD_SIZE};

const READ_CHUNK: usize = 8 * 1024;

/// The execution context shared by every session of the process.
///
/// Borrowed mutably only for the synchronous duration of one dispatch.
pub type SharedContext<E> = Rc<RefCell<E>>;

/// How a session ended.
#[derive(Debug)]
pub enum SessionEnd {
    /// The peer closed the connection.
    Closed,
    /// Reading from or writing to the connection failed.
    TransportError(io::Error),
}

impl SessionEnd {
    /// Process exit code for this outcome.
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::Closed => 0,
            Self::TransportError(_) => 1,
        }
    }
}

/// One client connection bound to the shared context.
pub struct Session<S, E: ?Sized> {
    stream: S,
    context: SharedContext<E>,
    framer: LineFramer,
}

impl<S, E> Session<S, E>
where
    S: AsyncRead + AsyncWrite + Unpin,
    E: Evaluator + ?Sized,
{
    pub fn new(stream: S, context: SharedContext<E>) -> Self {
        Self::with_max_record(stream, context, MAX_RECORD_SIZE)
    }

    pub fn with_max_record(stream: S, context: SharedContext<E>, max_record: usize) -> Self {
        Self {
            stream,
            context,
            framer: LineFramer::new(max_record),
        }
    }

    /// Serve the connection until it closes.
    pub async fn run(mut self) -> SessionEnd {
        let end = match self.serve().await {
            Ok(()) => SessionEnd::Closed,
            Err(e) => SessionEnd::TransportError(e),
        };
        match &end {
            SessionEnd::Closed => info!("Session closed"),
            SessionEnd::TransportError(e) => warn!(error = %e, "Session ended by transport error"),
        }
        end
    }

    async fn serve(&mut self) -> io::Result<()> {
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            let n = self.stream.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            for frame in self.framer.push(&chunk[..n]) {
                self.handle(frame).await?;
            }
        }

        let tail = self.framer.pending();
        if let Some(frame) = self.framer.finish() {
            debug!(len = tail, "Dispatching unterminated final record");
            self.handle(frame).await?;
        }
        Ok(())
    }

    async fn handle(&mut self, frame: Frame) -> io::Result<()> {
        // The borrow ends before the write is awaited.
        let response = dispatch(&mut *self.context.borrow_mut(), frame);
        match response {
            Some(response) => {
                trace!(success = response.is_success(), "Writing response");
                write_record(&mut self.stream, &response).await
            }
            None => Ok(()),
        }
    }
}
