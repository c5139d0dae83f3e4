//! Translation server.
//!
//! Stateless across connections, stateful within one: a [`Session`] owns
//! the IR module, the hash-config prefix, and the reusable object buffer
//! for exactly one client connection. The server is strictly
//! single-threaded per connection; messages on the socket are totally
//! ordered and the [`driver`] holds the connection exclusively from each
//! C_TRANSLATE to its S_OBJECT.
//!
//! # Components
//!
//! - [`serve`]: the message loop (init → bootstrap → translate/fork)
//! - [`driver`]: per-request pipeline sequencing
//! - [`Session`]: connection-scoped state
//! - [`pipeline`]: collaborator traits plus the in-tree reference backend
//! - [`MemProxy`]: guest reads round-tripped through the client

mod driver;
mod error;
mod fork;
mod hash;
mod memproxy;
pub mod module;
pub mod pipeline;
mod session;

use std::os::unix::net::UnixStream;

pub use driver::translate;
pub use error::ServerError;
pub use hash::{HASH_CONFIG_VERSION, HashBuilder, HashConfig};
pub use memproxy::MemProxy;
pub use module::{FuncId, IrModule, PC_BASE_SYMBOL};
pub use pipeline::Pipeline;
use rejit_proto::{Channel, MsgId, ProtocolError, ServerConfig};
pub use session::{
    CALL_HELPER_SYMBOL, CPUINFO_SYMBOL, DumpStages, ServerOptions, Session, StageTimers,
};

use crate::fork::ForkOutcome;

/// Serve one client connection to completion.
///
/// Runs the init handshake, emits the bootstrap object, then loops on
/// translate and fork requests until the peer disconnects cleanly between
/// frames. Any protocol violation or backend failure tears the session
/// down; decode and lift failures are reported in-band and do not.
pub fn serve(
    stream: UnixStream,
    pipeline: &mut Pipeline,
    options: ServerOptions,
) -> Result<(), ServerError> {
    let mut chan = Channel::new(stream);

    let config: ServerConfig = chan.recv_msg_struct(MsgId::CInit)?;
    let (mut session, client_config) = Session::new(&config, options, pipeline)?;
    chan.send_struct(MsgId::SInit, &client_config)?;

    session.bootstrap(pipeline)?;
    driver::send_object(&mut chan, &session.obj_buf, None)?;
    tracing::debug!(bytes = session.obj_buf.len(), "bootstrap object sent");

    loop {
        let hdr = match chan.peek_header() {
            Ok(hdr) => hdr,
            Err(err) if err.is_disconnect() => break,
            Err(err) => return Err(err.into()),
        };

        match hdr.msg_id() {
            MsgId::CTranslate => {
                let size = chan.consume_header(MsgId::CTranslate)?;
                if size != 8 {
                    return Err(ProtocolError::SizeMismatch { expected: 8, got: size as usize }
                        .into());
                }
                let mut addr = [0u8; 8];
                chan.recv_payload(&mut addr)?;
                let addr = u64::from_ne_bytes(addr);
                tracing::trace!("translate {addr:#x}");
                driver::translate(&mut session, pipeline, &mut chan, addr)?;
            },
            MsgId::CFork => {
                let size = chan.consume_header(MsgId::CFork)?;
                if size != 0 {
                    return Err(ProtocolError::SizeMismatch { expected: 0, got: size as usize }
                        .into());
                }
                match fork::handle_fork(chan.get_ref())? {
                    ForkOutcome::Parent => {},
                    ForkOutcome::Child(new_conn) => {
                        // Dropping the old channel closes the inherited
                        // connection; the parent keeps serving it.
                        chan = Channel::new(new_conn);
                    },
                }
            },
            got => {
                return Err(ProtocolError::UnexpectedId { expected: MsgId::CTranslate, got }
                    .into());
            },
        }
    }

    session.finish();
    Ok(())
}
