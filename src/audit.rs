//! Loader-notification bridge.
//!
//! Second, synchronous source of load events: ntdll keeps a callback list
//! it invokes on the importing thread for every module brought in or torn
//! out of the process. Registering there catches loads the OS-level trace
//! can miss or attribute ambiguously, at the price of running our code
//! inline with the loader, so the callback does the minimum and hands
//! straight off to the sinks.
//!
//! The registration entry points are ntdll exports without import-library
//! coverage, so they are resolved at run time; a runtime that does not
//! export them surfaces [`TraceError::Unsupported`], which callers can
//! tell apart from session-level failures and degrade gracefully.

use crate::error::{StopReport, TraceError};
use crate::events::{LoadEvent, LoadSource, TraceEvent};
use crate::sink::SinkSet;
use crate::trace::EventSource;
use std::ffi::c_void;
use std::{mem, ptr, slice};
use windows_sys::Win32::System::LibraryLoader::{GetModuleHandleW, GetProcAddress};

const LDR_DLL_NOTIFICATION_REASON_LOADED: u32 = 1;

#[repr(C)]
#[allow(non_snake_case)]
struct UnicodeString {
    Length: u16,
    MaximumLength: u16,
    Buffer: *const u16,
}

/// Loaded/unloaded notification payloads share this layout.
#[repr(C)]
#[allow(non_snake_case)]
struct LdrDllNotificationData {
    Flags: u32,
    FullDllName: *const UnicodeString,
    BaseDllName: *const UnicodeString,
    DllBase: *const c_void,
    SizeOfImage: u32,
}

type LdrNotificationCallback =
    unsafe extern "system" fn(reason: u32, data: *const LdrDllNotificationData, ctx: *mut c_void);

type LdrRegisterFn = unsafe extern "system" fn(
    flags: u32,
    callback: LdrNotificationCallback,
    ctx: *mut c_void,
    cookie: *mut *mut c_void,
) -> i32;

type LdrUnregisterFn = unsafe extern "system" fn(cookie: *mut c_void) -> i32;

/// Context the notification callback reads; freed on unregistration, which
/// ntdll serializes against in-flight callbacks under the loader lock.
struct HookCtx {
    sinks: SinkSet,
}

/// Live registration: the explicit handle returned by ntdll plus everything
/// needed to undo it exactly once.
struct Registration {
    unregister: LdrUnregisterFn,
    cookie: *mut c_void,
    ctx: *mut HookCtx,
}

// Cookie and context are only touched from `disable`, which consumes the
// registration; the callback itself is driven by ntdll.
unsafe impl Send for Registration {}

/// Captures module loads from inside the loader's own notification list.
pub struct LoaderHook {
    registration: Option<Registration>,
}

impl LoaderHook {
    pub fn new() -> Self {
        Self { registration: None }
    }

    /// Resolve both notification entry points, or report the facility as
    /// absent on this runtime.
    fn resolve() -> Result<(LdrRegisterFn, LdrUnregisterFn), TraceError> {
        // "ntdll.dll\0" as UTF-16; ntdll is always mapped, so a null module
        // handle here means the lookup itself is unusable.
        let ntdll: Vec<u16> = "ntdll.dll".encode_utf16().chain(Some(0)).collect();
        let module = unsafe { GetModuleHandleW(ntdll.as_ptr()) };
        if module.is_null() {
            return Err(TraceError::Unsupported("ntdll is not mapped"));
        }

        let register = unsafe { GetProcAddress(module, c"LdrRegisterDllNotification".as_ptr() as *const u8) }
            .ok_or(TraceError::Unsupported("LdrRegisterDllNotification not exported"))?;
        let unregister = unsafe { GetProcAddress(module, c"LdrUnregisterDllNotification".as_ptr() as *const u8) }
            .ok_or(TraceError::Unsupported("LdrUnregisterDllNotification not exported"))?;

        // FARPROC → the documented notification signatures.
        unsafe {
            Ok((
                mem::transmute::<_, LdrRegisterFn>(register),
                mem::transmute::<_, LdrUnregisterFn>(unregister),
            ))
        }
    }
}

impl Default for LoaderHook {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSource for LoaderHook {
    fn name(&self) -> &'static str {
        "loader-hook"
    }

    fn start(&mut self, sinks: &SinkSet) -> Result<(), TraceError> {
        if self.registration.is_some() {
            return Err(TraceError::InvalidState { expected: "disabled hook", actual: "enabled" });
        }

        let (register, unregister) = Self::resolve()?;
        let ctx = Box::into_raw(Box::new(HookCtx { sinks: sinks.clone() }));
        let mut cookie: *mut c_void = ptr::null_mut();
        let status =
            unsafe { register(0, dll_notification_callback, ctx as *mut c_void, &mut cookie) };
        if status != 0 {
            unsafe { drop(Box::from_raw(ctx)) };
            return Err(TraceError::HookRegister { status });
        }

        log::info!("DLL notification hook registered");
        self.registration = Some(Registration { unregister, cookie, ctx });
        Ok(())
    }

    /// Unregisters the stored cookie. Disabling an already-disabled hook is
    /// a no-op, not an error.
    fn stop(&mut self) -> Result<StopReport, TraceError> {
        if let Some(reg) = self.registration.take() {
            unsafe {
                let status = (reg.unregister)(reg.cookie);
                if status != 0 {
                    log::warn!("LdrUnregisterDllNotification returned NTSTATUS {status:#010x}");
                }
                // Unregistration completed under the loader lock: no
                // callback can still be observing the context.
                drop(Box::from_raw(reg.ctx));
            }
            log::info!("DLL notification hook unregistered");
        }
        Ok(StopReport::default())
    }
}

impl Drop for LoaderHook {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

/// Runs synchronously on whichever thread is inside the loader. Keep it
/// minimal and never panic: unwinding out of ntdll is undefined.
unsafe extern "system" fn dll_notification_callback(
    reason: u32,
    data: *const LdrDllNotificationData,
    ctx: *mut c_void,
) {
    if reason != LDR_DLL_NOTIFICATION_REASON_LOADED || data.is_null() || ctx.is_null() {
        return;
    }
    let ctx = unsafe { &*(ctx as *const HookCtx) };

    let full_name = unsafe { (*data).FullDllName };
    if full_name.is_null() {
        return;
    }
    let name = unsafe { &*full_name };
    if name.Buffer.is_null() || name.Length < 2 {
        return;
    }
    // Length is in bytes, excluding any terminator.
    let units = unsafe { slice::from_raw_parts(name.Buffer, (name.Length / 2) as usize) };
    let path = String::from_utf16_lossy(units);
    if path.is_empty() {
        return;
    }

    ctx.sinks.emit(TraceEvent::Load(LoadEvent::new(LoadSource::Hook, path)));
}
