//! C ABI for hosting a LAN-backed session from native apps (game engines, C/C++ hosts).
//! Each handle owns its own tokio runtime; every call is safe from any thread.

use std::ffi::{c_void, CStr};
use std::os::raw::{c_char, c_int};
use std::slice;
use std::sync::Arc;

use nearby_core::{LocalIdentity, NameError, NearbySession, SendMode, SessionError};
use tracing::warn;

use crate::config::{self, Config};
use crate::transport::{LanOptions, LanTransport};

pub const NEARBY_OK: c_int = 0;
/// Null handle, null buffer or unknown send mode.
pub const NEARBY_ERR_INVALID_ARGUMENT: c_int = 8;
/// Dequeue buffer smaller than the next payload; the payload stays queued.
pub const NEARBY_ERR_BUFFER_TOO_SMALL: c_int = 9;

/// Send modes, numbered like the platform API this mirrors.
pub const NEARBY_MODE_RELIABLE: c_int = 0;
pub const NEARBY_MODE_UNRELIABLE: c_int = 1;

#[derive(Debug, thiserror::Error)]
enum CreateError {
    #[error("invalid argument")]
    InvalidArgument,
    #[error(transparent)]
    Name(#[from] NameError),
    #[error("starting runtime or transport: {0}")]
    Io(#[from] std::io::Error),
}

struct SessionHandle {
    session: Arc<NearbySession<LanTransport>>,
    runtime: tokio::runtime::Runtime,
}

impl SessionHandle {
    fn create(name: &str, service: &str) -> Result<Self, CreateError> {
        let identity = LocalIdentity::new(name, service)?;
        let mut config = config::load().unwrap_or_else(|e| {
            warn!(error = %e, "config not loaded, using defaults");
            Config::default()
        });
        config.service_type = identity.service.to_string();
        let options = LanOptions::from_config(&config)?;
        Self::with_options(identity, options)
    }

    fn with_options(identity: LocalIdentity, options: LanOptions) -> Result<Self, CreateError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("nearby")
            .enable_all()
            .build()?;
        let (transport, events) = runtime.block_on(LanTransport::start(options))?;
        let session = Arc::new(NearbySession::with_identity(identity, transport));
        runtime.spawn(session.clone().run_events(events));
        Ok(Self { session, runtime })
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        // Close first so the session stops taking events. Dropping the runtime then
        // cancels the link tasks; peers see their sockets close even when a queued
        // Leave frame was never flushed.
        self.session.close();
    }
}

fn error_code(e: &SessionError) -> c_int {
    e.code() as c_int
}

fn send_mode(mode: c_int) -> Option<SendMode> {
    match mode {
        NEARBY_MODE_RELIABLE => Some(SendMode::Reliable),
        NEARBY_MODE_UNRELIABLE => Some(SendMode::BestEffort),
        _ => None,
    }
}

unsafe fn str_arg<'a>(p: *const c_char) -> Result<&'a str, CreateError> {
    if p.is_null() {
        return Err(CreateError::InvalidArgument);
    }
    CStr::from_ptr(p).to_str().map_err(|_| CreateError::InvalidArgument)
}

unsafe fn handle<'a>(h: *mut c_void) -> Option<&'a SessionHandle> {
    (h as *const SessionHandle).as_ref()
}

/// Create a session advertising `name` under `service` (both NUL-terminated UTF-8).
/// Discovery starts with `nearby_session_set_enabled(h, 1)`. Returns null on failure.
#[no_mangle]
pub extern "C" fn nearby_session_create(
    name: *const c_char,
    service: *const c_char,
) -> *mut c_void {
    let created = unsafe { str_arg(name).and_then(|n| str_arg(service).map(|s| (n, s))) }
        .and_then(|(n, s)| SessionHandle::create(n, s));
    match created {
        Ok(h) => Box::into_raw(Box::new(h)) as *mut c_void,
        Err(e) => {
            warn!(error = %e, "nearby_session_create failed");
            std::ptr::null_mut()
        }
    }
}

/// Close the session and free the handle. No-op if h is null.
#[no_mangle]
pub extern "C" fn nearby_session_destroy(h: *mut c_void) {
    if h.is_null() {
        return;
    }
    drop(unsafe { Box::from_raw(h as *mut SessionHandle) });
}

/// Send `len` bytes to every connected peer. Returns NEARBY_OK or an error code.
#[no_mangle]
pub extern "C" fn nearby_session_send_to_all_peers(
    h: *mut c_void,
    data: *const u8,
    len: usize,
    mode: c_int,
) -> c_int {
    let Some(handle) = (unsafe { handle(h) }) else {
        return NEARBY_ERR_INVALID_ARGUMENT;
    };
    let Some(mode) = send_mode(mode) else {
        return NEARBY_ERR_INVALID_ARGUMENT;
    };
    if data.is_null() && len > 0 {
        return NEARBY_ERR_INVALID_ARGUMENT;
    }
    let payload: &[u8] = if len == 0 {
        &[]
    } else {
        unsafe { slice::from_raw_parts(data, len) }
    };
    match handle.session.broadcast(payload, mode) {
        Ok(()) => NEARBY_OK,
        Err(e) => error_code(&e),
    }
}

/// Number of connected peers, or -1 if h is null.
#[no_mangle]
pub extern "C" fn nearby_session_connected_peer_count(h: *mut c_void) -> c_int {
    match unsafe { handle(h) } {
        Some(handle) => handle.session.connected_peer_count() as c_int,
        None => -1,
    }
}

/// Number of buffered inbound payloads, or -1 if h is null.
#[no_mangle]
pub extern "C" fn nearby_session_queue_size(h: *mut c_void) -> c_int {
    match unsafe { handle(h) } {
        Some(handle) => handle.session.queue_size() as c_int,
        None => -1,
    }
}

/// Size of the next payload, or -1 if the queue is empty or h is null.
#[no_mangle]
pub extern "C" fn nearby_session_peek_size(h: *mut c_void) -> i64 {
    match unsafe { handle(h) }.and_then(|handle| handle.session.peek_len()) {
        Some(n) => n as i64,
        None => -1,
    }
}

/// Copy the oldest payload into `out` and remove it from the queue. Returns the bytes
/// written, or the negated error code (empty queue, buffer too small, bad argument).
#[no_mangle]
pub extern "C" fn nearby_session_dequeue(h: *mut c_void, out: *mut u8, out_len: usize) -> i64 {
    let Some(handle) = (unsafe { handle(h) }) else {
        return -(NEARBY_ERR_INVALID_ARGUMENT as i64);
    };
    // Another thread may dequeue between peek and pop; re-check the popped size.
    let Some(next) = handle.session.peek_len() else {
        return -(SessionError::EmptyQueue.code() as i64);
    };
    if next > out_len {
        return -(NEARBY_ERR_BUFFER_TOO_SMALL as i64);
    }
    if out.is_null() && next > 0 {
        return -(NEARBY_ERR_INVALID_ARGUMENT as i64);
    }
    let payload = match handle.session.dequeue() {
        Ok(p) => p,
        Err(e) => return -(e.code() as i64),
    };
    if payload.len() > out_len {
        warn!(
            len = payload.len(),
            out_len,
            "payload dequeued by another caller did not fit, dropped"
        );
        return -(NEARBY_ERR_BUFFER_TOO_SMALL as i64);
    }
    if !payload.is_empty() {
        unsafe { out.copy_from_nonoverlapping(payload.as_ptr(), payload.len()) };
    }
    payload.len() as i64
}

/// Start (non-zero) or stop (zero) advertising and browsing.
/// Returns NEARBY_OK or an error code.
#[no_mangle]
pub extern "C" fn nearby_session_set_enabled(h: *mut c_void, enabled: c_int) -> c_int {
    let Some(handle) = (unsafe { handle(h) }) else {
        return NEARBY_ERR_INVALID_ARGUMENT;
    };
    match handle.session.set_enabled(enabled != 0) {
        Ok(()) => NEARBY_OK,
        Err(e) => error_code(&e),
    }
}

/// 1 if discovery is running, 0 if not, -1 if h is null.
#[no_mangle]
pub extern "C" fn nearby_session_get_enabled(h: *mut c_void) -> c_int {
    match unsafe { handle(h) } {
        Some(handle) => handle.session.is_enabled() as c_int,
        None => -1,
    }
}

/// Static description for a code returned by this API. Never null; do not free.
#[no_mangle]
pub extern "C" fn nearby_error_description(code: c_int) -> *const c_char {
    let s: &'static [u8] = match code {
        NEARBY_OK => b"ok\0",
        1 => b"invalid display name or service type\0",
        2 => b"no connected peers\0",
        3 => b"payload too large\0",
        4 => b"transport failure\0",
        5 => b"receive queue is empty\0",
        6 => b"session is not enabled\0",
        7 => b"session is closed\0",
        NEARBY_ERR_INVALID_ARGUMENT => b"invalid argument\0",
        NEARBY_ERR_BUFFER_TOO_SMALL => b"buffer too small\0",
        _ => b"unknown error\0",
    };
    s.as_ptr() as *const c_char
}
