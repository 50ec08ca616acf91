//! FFI-интерфейс для приложений на C/C++.

use std::ffi::CStr;
use std::os::raw::{c_char, c_void};
use std::ptr::null_mut;
use std::sync::Arc;
use std::time::Duration;

use crate::constants::MAX_FRAME_LEN;
use crate::error::SingleError;
use crate::instance::{InstanceHandler, InstanceOptions, SingleInstance};
use crate::naming::AppIdentity;

#[repr(C)]
pub struct xsingle_identity_t {
    pub application_name: *const c_char,
    pub organization_name: *const c_char,
    pub organization_domain: *const c_char,
    pub version: *const c_char,
    pub executable_path: *const c_char,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct xsingle_options_t {
    pub user_scope: bool,
    pub secondary_notification: bool,
    pub exclude_version: bool,
    pub exclude_path: bool,
    pub allow_secondary: bool,
    pub timeout_ms: u32,
    pub poll_interval_ms: u32,
}

impl Default for xsingle_options_t {
    fn default() -> Self {
        let defaults = InstanceOptions::default();
        Self {
            user_scope: defaults.user_scope,
            secondary_notification: defaults.secondary_notification,
            exclude_version: defaults.exclude_version,
            exclude_path: defaults.exclude_path,
            allow_secondary: defaults.allow_secondary,
            timeout_ms: defaults.timeout.as_millis() as u32,
            poll_interval_ms: defaults.poll_interval.as_millis() as u32,
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct xsingle_callbacks_t {
    pub on_instance_started: Option<extern "C" fn(user_data: *mut c_void)>,
    pub on_message: Option<
        extern "C" fn(instance_id: u32, data: *const c_void, size: usize, user_data: *mut c_void),
    >,
    pub on_error: Option<extern "C" fn(error: xsingle_error_t, user_data: *mut c_void)>,
    pub user_data: *mut c_void,
}

impl Default for xsingle_callbacks_t {
    fn default() -> Self {
        Self {
            on_instance_started: None,
            on_message: None,
            on_error: None,
            user_data: null_mut(),
        }
    }
}

#[repr(C)]
#[allow(non_camel_case_types)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum xsingle_error_t {
    XSINGLE_SUCCESS = 0,
    XSINGLE_ERROR_INVALID_PARAM = -1,
    XSINGLE_ERROR_EXISTS = -2,
    XSINGLE_ERROR_NOT_FOUND = -3,
    XSINGLE_ERROR_NOT_READY = -4,
    XSINGLE_ERROR_TIMEOUT = -5,
    XSINGLE_ERROR_REJECTED = -6,
    XSINGLE_ERROR_PROTOCOL = -7,
    XSINGLE_ERROR_NOT_CONNECTED = -8,
    XSINGLE_ERROR_NOT_SECONDARY = -9,
    XSINGLE_ERROR_OS = -10,
}

impl From<SingleError> for xsingle_error_t {
    fn from(value: SingleError) -> Self {
        match value {
            SingleError::AlreadyExists => xsingle_error_t::XSINGLE_ERROR_EXISTS,
            SingleError::NotFound => xsingle_error_t::XSINGLE_ERROR_NOT_FOUND,
            SingleError::NotReady => xsingle_error_t::XSINGLE_ERROR_NOT_READY,
            SingleError::Timeout => xsingle_error_t::XSINGLE_ERROR_TIMEOUT,
            SingleError::HandshakeRejected => xsingle_error_t::XSINGLE_ERROR_REJECTED,
            SingleError::MessageTooLarge | SingleError::InvalidName => {
                xsingle_error_t::XSINGLE_ERROR_INVALID_PARAM
            }
            SingleError::Corrupted => xsingle_error_t::XSINGLE_ERROR_PROTOCOL,
            SingleError::NotConnected => xsingle_error_t::XSINGLE_ERROR_NOT_CONNECTED,
            SingleError::NotSecondary => xsingle_error_t::XSINGLE_ERROR_NOT_SECONDARY,
            SingleError::Os { .. } | SingleError::Io { .. } => xsingle_error_t::XSINGLE_ERROR_OS,
        }
    }
}

pub type InstanceHandle = c_void;

struct InstanceState {
    inner: SingleInstance,
    _handler: Arc<FfiHandler>,
}

struct FfiHandler {
    callbacks: xsingle_callbacks_t,
}

unsafe impl Send for FfiHandler {}
unsafe impl Sync for FfiHandler {}

impl InstanceHandler for FfiHandler {
    fn on_instance_started(&self) {
        if let Some(cb) = self.callbacks.on_instance_started {
            cb(self.callbacks.user_data);
        }
    }

    fn on_message(&self, instance_id: u32, payload: &[u8]) {
        if let Some(cb) = self.callbacks.on_message {
            cb(
                instance_id,
                payload.as_ptr() as *const c_void,
                payload.len(),
                self.callbacks.user_data,
            );
        }
    }

    fn on_error(&self, err: SingleError) {
        if let Some(cb) = self.callbacks.on_error {
            cb(err.into(), self.callbacks.user_data);
        }
    }
}

/// Пустой указатель означает пустую строку.
fn to_rust_string(ptr: *const c_char) -> String {
    if ptr.is_null() {
        return String::new();
    }
    let cstr = unsafe { CStr::from_ptr(ptr) };
    cstr.to_string_lossy().into_owned()
}

fn ffi_identity(ptr: *const xsingle_identity_t) -> Option<AppIdentity> {
    if ptr.is_null() {
        return None;
    }
    let id = unsafe { &*ptr };
    let identity = AppIdentity {
        application_name: to_rust_string(id.application_name),
        organization_name: to_rust_string(id.organization_name),
        organization_domain: to_rust_string(id.organization_domain),
        version: to_rust_string(id.version),
        executable_path: to_rust_string(id.executable_path),
        extra: Vec::new(),
    };
    Some(identity)
}

fn ffi_options(ptr: *const xsingle_options_t) -> InstanceOptions {
    let opts = if ptr.is_null() {
        xsingle_options_t::default()
    } else {
        unsafe { *ptr }
    };
    InstanceOptions {
        user_scope: opts.user_scope,
        secondary_notification: opts.secondary_notification,
        exclude_version: opts.exclude_version,
        exclude_path: opts.exclude_path,
        allow_secondary: opts.allow_secondary,
        timeout: Duration::from_millis(opts.timeout_ms as u64),
        poll_interval: Duration::from_millis(opts.poll_interval_ms.max(1) as u64),
        ..InstanceOptions::default()
    }
}

fn state_from(handle: *const InstanceHandle) -> *const InstanceState {
    handle as *const InstanceState
}

#[unsafe(no_mangle)]
pub extern "C" fn xsingle_options_default() -> xsingle_options_t {
    xsingle_options_t::default()
}

/// Выборы и запуск. Возвращает NULL при ошибке (код уходит в `on_error`).
#[unsafe(no_mangle)]
pub extern "C" fn xsingle_start(
    identity: *const xsingle_identity_t,
    callbacks: *const xsingle_callbacks_t,
    options: *const xsingle_options_t,
) -> *mut InstanceHandle {
    let callbacks_val = if callbacks.is_null() {
        xsingle_callbacks_t::default()
    } else {
        unsafe { *callbacks }
    };
    let report = |err: xsingle_error_t| {
        if let Some(cb) = callbacks_val.on_error {
            cb(err, callbacks_val.user_data);
        }
    };

    let Some(identity) = ffi_identity(identity) else {
        report(xsingle_error_t::XSINGLE_ERROR_INVALID_PARAM);
        return null_mut();
    };
    let handler = Arc::new(FfiHandler {
        callbacks: callbacks_val,
    });
    match SingleInstance::start(&identity, handler.clone(), ffi_options(options)) {
        Ok(inner) => Box::into_raw(Box::new(InstanceState {
            inner,
            _handler: handler,
        })) as *mut InstanceHandle,
        Err(err) => {
            report(err.into());
            null_mut()
        }
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn xsingle_is_primary(handle: *const InstanceHandle) -> bool {
    if handle.is_null() {
        return false;
    }
    let state = unsafe { &*state_from(handle) };
    state.inner.is_primary()
}

/// 0 для primary и для NULL.
#[unsafe(no_mangle)]
pub extern "C" fn xsingle_instance_id(handle: *const InstanceHandle) -> u32 {
    if handle.is_null() {
        return 0;
    }
    let state = unsafe { &*state_from(handle) };
    state.inner.instance_id()
}

/// -1, если primary нет или блок недоступен.
#[unsafe(no_mangle)]
pub extern "C" fn xsingle_primary_pid(handle: *const InstanceHandle) -> i64 {
    if handle.is_null() {
        return -1;
    }
    let state = unsafe { &*state_from(handle) };
    state.inner.primary_pid().unwrap_or(-1)
}

/// Копирует имя пользователя primary в `buf` с завершающим NUL (с усечением).
#[unsafe(no_mangle)]
pub extern "C" fn xsingle_primary_user(
    handle: *const InstanceHandle,
    buf: *mut c_char,
    buf_len: usize,
) -> xsingle_error_t {
    if handle.is_null() || buf.is_null() || buf_len == 0 {
        return xsingle_error_t::XSINGLE_ERROR_INVALID_PARAM;
    }
    let state = unsafe { &*state_from(handle) };
    let user = match state.inner.primary_user() {
        Ok(user) => user,
        Err(err) => return err.into(),
    };
    let len = user.len().min(buf_len - 1);
    unsafe {
        std::ptr::copy_nonoverlapping(user.as_ptr(), buf as *mut u8, len);
        *buf.add(len) = 0;
    }
    xsingle_error_t::XSINGLE_SUCCESS
}

/// Отправка данных primary; `timeout_ms == 0` берёт таймаут из опций запуска.
#[unsafe(no_mangle)]
pub extern "C" fn xsingle_send_message(
    handle: *const InstanceHandle,
    data: *const c_void,
    size: usize,
    timeout_ms: u32,
) -> xsingle_error_t {
    if handle.is_null() || (data.is_null() && size != 0) {
        return xsingle_error_t::XSINGLE_ERROR_INVALID_PARAM;
    }
    if size as u64 > MAX_FRAME_LEN {
        return xsingle_error_t::XSINGLE_ERROR_INVALID_PARAM;
    }
    let state = unsafe { &*state_from(handle) };
    let slice: &[u8] = if size == 0 {
        &[]
    } else {
        unsafe { std::slice::from_raw_parts(data as *const u8, size) }
    };
    let result = if timeout_ms == 0 {
        state.inner.send_message(slice)
    } else {
        state
            .inner
            .send_message_timeout(slice, Duration::from_millis(timeout_ms as u64))
    };
    match result {
        Ok(()) => xsingle_error_t::XSINGLE_SUCCESS,
        Err(err) => err.into(),
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn xsingle_stop(handle: *mut InstanceHandle) {
    if handle.is_null() {
        return;
    }
    unsafe {
        drop(Box::from_raw(handle as *mut InstanceState));
    }
}
