//! Binary tuple codec for cross-thread transport
//!
//! A [`Tuple`] is a packed sequence of heterogeneous [`Value`]s: an element
//! count followed by one tag byte per element and its payload. All payloads
//! are read and written byte-wise at arbitrary offsets, so nothing in the
//! format is ever alignment-sensitive. Strings are length-prefixed and
//! binary safe.
//!
//! Resource handles are packed by pointer: packing clones the handle's
//! shared core and encodes the raw pointer, transferring one reference count
//! into the buffer; unpacking materializes a new wrapper that owns it.
//! Dropping a tuple unread (a queue torn down with items still enqueued)
//! walks the buffer and releases the parked references, so a handle is
//! released exactly once whether or not it was ever delivered.

use crate::file::File;
use crate::queue::Queue;
use crate::socket::Socket;
use crate::status::{Status, StatusCode};
use crate::value::{Handle, Value};
use zerocopy::byteorder::little_endian::{F64, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes};

const TAG_NIL: u8 = 0;
const TAG_FALSE: u8 = 1;
const TAG_TRUE: u8 = 2;
const TAG_NUMBER: u8 = 3;
const TAG_STRING: u8 = 4;
const TAG_HANDLE: u8 = 5;

const HANDLE_FILE: u8 = 1;
const HANDLE_SOCKET: u8 = 2;
const HANDLE_QUEUE: u8 = 3;

/// A packed value sequence.
#[derive(Debug)]
pub struct Tuple {
    buf: Vec<u8>,
}

impl Tuple {
    /// Pack `values` into one buffer, taking a reference on every handle.
    pub fn pack(values: &[Value]) -> Tuple {
        let mut buf = Vec::with_capacity(8 + values.len() * 9);
        buf.extend_from_slice(U32::new(values.len() as u32).as_bytes());
        for value in values {
            match value {
                Value::Nil => buf.push(TAG_NIL),
                Value::Bool(false) => buf.push(TAG_FALSE),
                Value::Bool(true) => buf.push(TAG_TRUE),
                Value::Number(n) => {
                    buf.push(TAG_NUMBER);
                    buf.extend_from_slice(F64::new(*n).as_bytes());
                }
                Value::Str(s) => {
                    buf.push(TAG_STRING);
                    buf.extend_from_slice(U64::new(s.len() as u64).as_bytes());
                    buf.extend_from_slice(s);
                }
                Value::Handle(handle) => {
                    buf.push(TAG_HANDLE);
                    let (kind, ptr) = match handle {
                        Handle::File(file) => (HANDLE_FILE, file.clone().into_raw() as u64),
                        Handle::Socket(socket) => {
                            (HANDLE_SOCKET, socket.clone().into_raw() as u64)
                        }
                        Handle::Queue(queue) => (HANDLE_QUEUE, queue.clone().into_raw() as u64),
                    };
                    buf.push(kind);
                    buf.extend_from_slice(U64::new(ptr).as_bytes());
                }
            }
        }
        Tuple { buf }
    }

    pub fn len(&self) -> usize {
        self.buf
            .get(..4)
            .and_then(|bytes| U32::read_from_bytes(bytes).ok())
            .map(|n| n.get() as usize)
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Unpack into values. Handle references transfer to the new wrappers.
    /// A corrupt buffer aborts with the index of the offending item; handle
    /// references past the corruption point are unrecoverable and leak.
    pub fn unpack(mut self) -> Result<Vec<Value>, Status> {
        let buf = std::mem::take(&mut self.buf);
        let mut cursor = Cursor { buf: &buf, pos: 0 };
        let count = cursor.read::<U32>()?.get() as usize;
        let mut values = Vec::with_capacity(count);
        for item in 0..count {
            let tag = cursor.u8()?;
            let value = match tag {
                TAG_NIL => Value::Nil,
                TAG_FALSE => Value::Bool(false),
                TAG_TRUE => Value::Bool(true),
                TAG_NUMBER => Value::Number(cursor.read::<F64>()?.get()),
                TAG_STRING => {
                    let len = cursor.read::<U64>()?.get() as usize;
                    Value::Str(cursor.bytes(len)?.to_vec())
                }
                TAG_HANDLE => {
                    let kind = cursor.u8()?;
                    let ptr = cursor.read::<U64>()?.get() as usize;
                    // SAFETY: the pointer was produced by into_raw at pack
                    // time and carries the reference taken there; it is
                    // consumed exactly once here.
                    let handle = match kind {
                        HANDLE_FILE => Handle::File(unsafe { File::from_raw(ptr as *const _) }),
                        HANDLE_SOCKET => {
                            Handle::Socket(unsafe { Socket::from_raw(ptr as *const _) })
                        }
                        HANDLE_QUEUE => {
                            Handle::Queue(unsafe { Queue::from_raw(ptr as *const _) })
                        }
                        kind => {
                            return Err(Status::new(
                                StatusCode::Mismatch,
                                format!("corrupt tuple: unknown handle kind {kind} at item {item}"),
                            ));
                        }
                    };
                    Value::Handle(handle)
                }
                tag => {
                    return Err(Status::new(
                        StatusCode::Mismatch,
                        format!("corrupt tuple: unknown tag {tag} at item {item}"),
                    ));
                }
            };
            values.push(value);
        }
        Ok(values)
    }
}

impl Drop for Tuple {
    /// Release handle references still parked in an undelivered buffer.
    /// `unpack` empties the buffer first, so delivered handles are never
    /// released twice.
    fn drop(&mut self) {
        let buf = std::mem::take(&mut self.buf);
        if buf.is_empty() {
            return;
        }
        let mut cursor = Cursor { buf: &buf, pos: 0 };
        let Ok(count) = cursor.read::<U32>() else {
            return;
        };
        for _ in 0..count.get() {
            let Ok(tag) = cursor.u8() else {
                return;
            };
            match tag {
                TAG_NUMBER => {
                    if cursor.bytes(size_of::<F64>()).is_err() {
                        return;
                    }
                }
                TAG_STRING => {
                    let Ok(len) = cursor.read::<U64>() else {
                        return;
                    };
                    if cursor.bytes(len.get() as usize).is_err() {
                        return;
                    }
                }
                TAG_HANDLE => {
                    let Ok(kind) = cursor.u8() else {
                        return;
                    };
                    let Ok(ptr) = cursor.read::<U64>() else {
                        return;
                    };
                    let ptr = ptr.get() as usize;
                    // SAFETY: releasing the reference taken at pack time.
                    unsafe {
                        match kind {
                            HANDLE_FILE => drop(File::from_raw(ptr as *const _)),
                            HANDLE_SOCKET => drop(Socket::from_raw(ptr as *const _)),
                            HANDLE_QUEUE => drop(Queue::from_raw(ptr as *const _)),
                            _ => {}
                        }
                    }
                }
                _ => {}
            }
        }
    }
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn u8(&mut self) -> Result<u8, Status> {
        let byte = *self
            .buf
            .get(self.pos)
            .ok_or_else(truncated)?;
        self.pos += 1;
        Ok(byte)
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8], Status> {
        let end = self.pos.checked_add(len).ok_or_else(truncated)?;
        let slice = self.buf.get(self.pos..end).ok_or_else(truncated)?;
        self.pos = end;
        Ok(slice)
    }

    fn read<T: FromBytes + Immutable>(&mut self) -> Result<T, Status> {
        let slice = self.bytes(size_of::<T>())?;
        T::read_from_bytes(slice).map_err(|_| truncated())
    }
}

fn truncated() -> Status {
    Status::new(StatusCode::Incomplete, "truncated tuple buffer")
}
