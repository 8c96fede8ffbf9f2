//! C-compatible embedder ABI for courier.
//!
//! Mirrors the Rust endpoints with create/destroy/poll/request/respond/close
//! functions and four callback types. All pointers handed to callbacks are
//! valid only for the duration of the callback; embedders must copy what
//! they keep. `poll` returns 0 iff the endpoint is no longer running.

use std::ffi::{c_char, CStr, CString};
use std::ptr;

use courier::{Client, ClientConfig, Direction, Event, Server, ServerConfig};

/// Opaque body with a content-type tag.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct CourierBody {
    /// NUL-terminated content type, or null.
    pub content_type: *const c_char,
    /// Body bytes, or null when `len` is 0.
    pub data: *const u8,
    /// Body length in bytes.
    pub len: i32,
}

/// A request delivered to `on_request`.
#[repr(C)]
pub struct CourierRequest {
    pub connection_id: u64,
    pub request_id: i64,
    pub path: *const c_char,
    pub header_info: *const c_char,
    pub body: CourierBody,
}

/// A response delivered to `on_response`.
#[repr(C)]
pub struct CourierResponse {
    pub connection_id: u64,
    pub request_id: i64,
    pub status: i32,
    pub header_info: *const c_char,
    pub body: CourierBody,
}

/// Client endpoint settings. All fields required.
#[repr(C)]
pub struct CourierClientSettings {
    pub auth_token: *const c_char,
    pub host: *const c_char,
    pub cert_path: *const c_char,
    pub port: u16,
}

/// Server endpoint settings. All fields required.
#[repr(C)]
pub struct CourierServerSettings {
    pub auth_token: *const c_char,
    pub cert_path: *const c_char,
    pub key_path: *const c_char,
    pub port: u16,
}

/// Called once per connection when the peer is established and verified.
pub type ConnectCallback = Option<extern "C" fn(connection_id: u64, peer: *const c_char)>;
/// Called once per connection when the session ends. Terminal.
pub type TimeoutCallback = Option<extern "C" fn(connection_id: u64)>;
/// Called for each complete peer-initiated request.
pub type RequestCallback = Option<extern "C" fn(request: CourierRequest)>;
/// Called for each complete response to one of our requests.
pub type ResponseCallback = Option<extern "C" fn(response: CourierResponse)>;

/// Copy a C string, treating null as empty.
unsafe fn string_arg(ptr: *const c_char) -> String {
    if ptr.is_null() {
        return String::new();
    }
    CStr::from_ptr(ptr).to_string_lossy().into_owned()
}

/// Borrow body bytes, treating null as empty.
unsafe fn body_bytes<'a>(body: &CourierBody) -> &'a [u8] {
    if body.data.is_null() || body.len <= 0 {
        return &[];
    }
    std::slice::from_raw_parts(body.data, body.len as usize)
}

fn c_string(s: &str) -> CString {
    CString::new(s).unwrap_or_default()
}

/// Dispatch one mailbox event to the matching C callback.
fn route_event(
    event: Event,
    on_connect: ConnectCallback,
    on_timeout: TimeoutCallback,
    on_request: RequestCallback,
    on_response: ResponseCallback,
) {
    match event {
        Event::Connect {
            connection_id,
            peer,
        } => {
            if let Some(cb) = on_connect {
                let peer = c_string(&peer.to_string());
                cb(connection_id, peer.as_ptr());
            }
        }

        Event::Timeout { connection_id } => {
            if let Some(cb) = on_timeout {
                cb(connection_id);
            }
        }

        Event::Data {
            connection_id,
            stream,
            direction,
        } => {
            let content_type = c_string(&stream.content_type);
            let header_info = c_string(&stream.header_info);
            let body = CourierBody {
                content_type: content_type.as_ptr(),
                data: if stream.body.is_empty() {
                    ptr::null()
                } else {
                    stream.body.as_ptr()
                },
                len: stream.body.len() as i32,
            };

            match direction {
                Direction::Request => {
                    if let Some(cb) = on_request {
                        let path = c_string(&stream.path);
                        cb(CourierRequest {
                            connection_id,
                            request_id: stream.id as i64,
                            path: path.as_ptr(),
                            header_info: header_info.as_ptr(),
                            body,
                        });
                    }
                }
                Direction::Response => {
                    if let Some(cb) = on_response {
                        cb(CourierResponse {
                            connection_id,
                            request_id: stream.id as i64,
                            status: stream.status_code(),
                            header_info: header_info.as_ptr(),
                            body,
                        });
                    }
                }
            }
        }
    }
}

// ── Client ───────────────────────────────────────────────────────

/// Create a client endpoint, or return null if any setting is missing or
/// the pinned certificate cannot be loaded.
///
/// # Safety
/// `settings` and its string fields must be valid or null.
#[no_mangle]
pub unsafe extern "C" fn courier_client_create(
    settings: *const CourierClientSettings,
) -> *mut Client {
    let Some(settings) = settings.as_ref() else {
        return ptr::null_mut();
    };

    let config = ClientConfig {
        auth_token: string_arg(settings.auth_token),
        host: string_arg(settings.host),
        port: settings.port,
        cert_path: string_arg(settings.cert_path),
    };

    match Client::new(config) {
        Ok(client) => Box::into_raw(Box::new(client)),
        Err(e) => {
            log::error!("courier_client_create: {e}");
            ptr::null_mut()
        }
    }
}

/// Destroy a client endpoint, joining its threads.
///
/// # Safety
/// `client` must come from `courier_client_create` and not be used again.
#[no_mangle]
pub unsafe extern "C" fn courier_client_destroy(client: *mut Client) {
    if !client.is_null() {
        drop(Box::from_raw(client));
    }
}

/// Send a request. GET when the body is empty, PUT otherwise. Returns the
/// request id, or -1 on failure.
///
/// # Safety
/// All pointers must be valid or null.
#[no_mangle]
pub unsafe extern "C" fn courier_client_request(
    client: *mut Client,
    path: *const c_char,
    header_info: *const c_char,
    body: CourierBody,
) -> i64 {
    let Some(client) = client.as_ref() else {
        return -1;
    };

    let path = string_arg(path);
    let header_info = string_arg(header_info);
    let content_type = string_arg(body.content_type);
    let data = body_bytes(&body);

    client.request(&path, &content_type, &header_info, data)
}

/// Poll for events, waiting up to `timeout_ms` (negative waits forever).
/// Returns 0 iff the endpoint is no longer running.
///
/// # Safety
/// `client` must be valid or null; callbacks must be valid function
/// pointers or null.
#[no_mangle]
pub unsafe extern "C" fn courier_client_poll(
    client: *mut Client,
    on_connect: ConnectCallback,
    on_timeout: TimeoutCallback,
    on_response: ResponseCallback,
    timeout_ms: i32,
) -> i32 {
    let Some(client) = client.as_ref() else {
        return 0;
    };

    let alive = client.poll(
        |event| route_event(event, on_connect, on_timeout, None, on_response),
        timeout_ms,
    );
    i32::from(alive)
}

// ── Server ───────────────────────────────────────────────────────

/// Create a server endpoint, or return null if any setting is missing, the
/// port cannot be bound, or key material cannot be loaded.
///
/// # Safety
/// `settings` and its string fields must be valid or null.
#[no_mangle]
pub unsafe extern "C" fn courier_server_create(
    settings: *const CourierServerSettings,
) -> *mut Server {
    let Some(settings) = settings.as_ref() else {
        return ptr::null_mut();
    };

    let config = ServerConfig {
        auth_token: string_arg(settings.auth_token),
        port: settings.port,
        cert_path: string_arg(settings.cert_path),
        key_path: string_arg(settings.key_path),
    };

    match Server::new(config) {
        Ok(server) => Box::into_raw(Box::new(server)),
        Err(e) => {
            log::error!("courier_server_create: {e}");
            ptr::null_mut()
        }
    }
}

/// Destroy a server endpoint, joining its threads.
///
/// # Safety
/// `server` must come from `courier_server_create` and not be used again.
#[no_mangle]
pub unsafe extern "C" fn courier_server_destroy(server: *mut Server) {
    if !server.is_null() {
        drop(Box::from_raw(server));
    }
}

/// Poll for events, waiting up to `timeout_ms` (negative waits forever).
/// Returns 0 iff the endpoint is no longer running.
///
/// # Safety
/// `server` must be valid or null; callbacks must be valid function
/// pointers or null.
#[no_mangle]
pub unsafe extern "C" fn courier_server_poll(
    server: *mut Server,
    on_connect: ConnectCallback,
    on_timeout: TimeoutCallback,
    on_request: RequestCallback,
    timeout_ms: i32,
) -> i32 {
    let Some(server) = server.as_ref() else {
        return 0;
    };

    let alive = server.poll(
        |event| route_event(event, on_connect, on_timeout, on_request, None),
        timeout_ms,
    );
    i32::from(alive)
}

/// Respond to a request previously delivered by `courier_server_poll`.
///
/// # Safety
/// All pointers must be valid or null.
#[no_mangle]
pub unsafe extern "C" fn courier_server_respond(
    server: *mut Server,
    connection_id: u64,
    request_id: i64,
    status: i32,
    header_info: *const c_char,
    body: CourierBody,
) {
    let Some(server) = server.as_ref() else {
        return;
    };
    if request_id < 0 {
        return;
    }

    let header_info = string_arg(header_info);
    let content_type = string_arg(body.content_type);
    let data = body_bytes(&body);

    if let Err(e) = server.respond(
        connection_id,
        request_id as u64,
        status.clamp(0, u16::MAX as i32) as u16,
        &content_type,
        &header_info,
        data,
    ) {
        log::warn!("courier_server_respond: {e}");
    }
}

/// Close one peer session; its terminal timeout callback follows.
///
/// # Safety
/// `server` must be valid or null.
#[no_mangle]
pub unsafe extern "C" fn courier_server_close(server: *mut Server, connection_id: u64) {
    let Some(server) = server.as_ref() else {
        return;
    };
    if let Err(e) = server.close_connection(connection_id) {
        log::warn!("courier_server_close: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_rejects_null_and_empty_settings() {
        unsafe {
            assert!(courier_client_create(ptr::null()).is_null());
            assert!(courier_server_create(ptr::null()).is_null());

            let empty = CourierClientSettings {
                auth_token: ptr::null(),
                host: ptr::null(),
                cert_path: ptr::null(),
                port: 0,
            };
            assert!(courier_client_create(&empty).is_null());

            let empty = CourierServerSettings {
                auth_token: ptr::null(),
                cert_path: ptr::null(),
                key_path: ptr::null(),
                port: 0,
            };
            assert!(courier_server_create(&empty).is_null());
        }
    }

    #[test]
    fn null_handles_are_no_ops() {
        unsafe {
            courier_client_destroy(ptr::null_mut());
            courier_server_destroy(ptr::null_mut());
            courier_server_close(ptr::null_mut(), 1);

            let body = CourierBody {
                content_type: ptr::null(),
                data: ptr::null(),
                len: 0,
            };
            assert_eq!(
                courier_client_request(ptr::null_mut(), ptr::null(), ptr::null(), body),
                -1
            );
            assert_eq!(
                courier_client_poll(ptr::null_mut(), None, None, None, 0),
                0
            );
            assert_eq!(
                courier_server_poll(ptr::null_mut(), None, None, None, 0),
                0
            );
        }
    }

    #[test]
    fn body_bytes_handles_null_and_negative() {
        unsafe {
            let body = CourierBody {
                content_type: ptr::null(),
                data: ptr::null(),
                len: 10,
            };
            assert!(body_bytes(&body).is_empty());

            let data = [1u8, 2, 3];
            let body = CourierBody {
                content_type: ptr::null(),
                data: data.as_ptr(),
                len: -1,
            };
            assert!(body_bytes(&body).is_empty());

            let body = CourierBody {
                content_type: ptr::null(),
                data: data.as_ptr(),
                len: 3,
            };
            assert_eq!(body_bytes(&body), &[1, 2, 3]);
        }
    }
}
