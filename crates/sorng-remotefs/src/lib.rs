//! # SortOfRemote NG – Remote FS
//!
//! Resilient remote-filesystem layer used to mount FTP / FTPS / SFTP servers
//! as ordinary filesystems:
//!   • Bounded per-endpoint connection pool with blocking / overflow / fail policies
//!   • Directory tree cache with confirmed-absence lookups and atomic listings
//!   • Self-healing read streams that reconnect and resume at the current offset
//!   • Control-connection keep-alive while long reads are in flight
//!   • High-level filesystem facade (status, list, open, create, mkdirs, delete, rename)
//!   • In-memory backend for tests and an optional libssh2 SFTP backend

pub mod remotefs;
