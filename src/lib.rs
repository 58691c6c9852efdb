//! Portable OS services for embedded scripting runtimes
//!
//! This crate gives a dynamically-typed embedding uniform access to the
//! operating system: buffered files, directories, pipes, TCP/UDP sockets,
//! child processes, shared memory, worker threads, bounded queues, socket
//! pollsets and deferred signal handling, behind one status convention.
//!
//! The substrate everything builds on:
//!
//! * every fallible operation returns `Result<T, `[`Status`]`>`, carrying a
//!   symbolic code name and message for the embedding to surface;
//! * native resources live behind shared cores ([`File`], [`Socket`],
//!   [`Queue`], [`Shm`] are cheap clones of one underlying object) with
//!   idempotent close and clear "closed" failures afterwards;
//! * byte streams share one buffered I/O layer ([`bufio`]) implementing
//!   line/number/all/count reads, CRLF translation on CRLF platforms, and
//!   in-place operation over foreign memory for shared memory segments;
//! * values cross threads through the [`tuple`] codec, which transfers
//!   resource references so a handle pushed into a [`Queue`] outlives the
//!   sender.

#![warn(missing_debug_implementations, rust_2018_idioms, unreachable_pub)]

pub mod buffer;
pub mod bufio;
pub mod dir;
pub mod env;
pub mod fd;
pub mod file;
pub mod getopt;
pub mod handle;
pub mod perms;
pub mod pipe;
pub mod pollset;
pub mod pool;
pub mod process;
pub mod queue;
pub mod shm;
pub mod signal;
pub mod socket;
pub mod stat;
pub mod status;
pub mod thread;
pub mod tuple;
pub mod value;

pub use crate::buffer::Buffer;
pub use crate::bufio::{BufStream, RawStream, ReadFormat, ReadOut, Whence};
pub use crate::dir::Dir;
pub use crate::fd::Timeout;
pub use crate::file::{File, LockMode, OpenMode};
pub use crate::getopt::OptValue;
pub use crate::handle::RawHandle;
pub use crate::perms::Perms;
pub use crate::pollset::{Interest, Pollset};
pub use crate::pool::Pool;
pub use crate::process::{CmdType, Forked, IoMode, KillPolicy, Proc, WaitWhy};
pub use crate::queue::Queue;
pub use crate::shm::{Shm, ShmWhence};
pub use crate::socket::{Backlog, Family, Protocol, ShutdownMode, SockOpt, Socket, Which};
pub use crate::stat::{FieldValue, FileType, StatField, StatRecord};
pub use crate::status::{Status, StatusCode};
pub use crate::thread::Thread;
pub use crate::tuple::Tuple;
pub use crate::value::{Handle, Value};
