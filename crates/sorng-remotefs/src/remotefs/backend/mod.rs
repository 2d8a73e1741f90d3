//! Session backends implementing [`RemoteSession`](crate::remotefs::RemoteSession).
//!
//! - `memory` — in-process server with fault injection (tests, embedding)
//! - `sftp` — libssh2 sessions (feature `sftp`)
//!
//! FTP / FTPS clients are plugged in by the embedding application through a
//! [`Connector`](crate::remotefs::Connector).

pub mod memory;
#[cfg(feature = "sftp")]
pub mod sftp;
