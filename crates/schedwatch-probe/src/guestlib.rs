//! Hypervisor guest-API steal-time source.
//!
//! Queries the VMware guest library for milliseconds the host withheld
//! from this virtual machine. The library is loaded at runtime so one
//! binary serves both bare-metal and guest deployments.

use schedwatch_common::config::{StealSourceKind, NS_PER_MS};
use std::ffi::{c_char, c_int, c_void, CStr};
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Guest API failure, carrying the library's error text.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct GuestLibError(pub String);

/// Guest-introspection interface operating on one open handle.
pub trait GuestApi {
    /// Refresh the cached statistics behind the handle.
    ///
    /// # Errors
    ///
    /// Returns the library error text on failure.
    fn update_info(&mut self) -> Result<(), GuestLibError>;

    /// Milliseconds the guest was ready to run but not scheduled.
    ///
    /// # Errors
    ///
    /// Returns the library error text on failure.
    fn cpu_stolen_ms(&self) -> Result<u64, GuestLibError>;

    /// Milliseconds of CPU the guest used.
    ///
    /// # Errors
    ///
    /// Returns the library error text on failure.
    fn cpu_used_ms(&self) -> Result<u64, GuestLibError>;

    /// Milliseconds since the guest last started running on its host.
    ///
    /// # Errors
    ///
    /// Returns the library error text on failure.
    fn elapsed_ms(&self) -> Result<u64, GuestLibError>;
}

#[derive(Debug, Clone, Copy, Default)]
struct GuestCounters {
    stolen_ms: u64,
    used_ms: u64,
    elapsed_ms: u64,
}

/// Steal-time source backed by a [`GuestApi`] handle.
///
/// Each sample is independent: a failed query yields 0 rather than the
/// previous value.
#[derive(Debug)]
pub struct GuestLibStealSource<G: GuestApi> {
    api: G,
    prev: GuestCounters,
}

impl<G: GuestApi> GuestLibStealSource<G> {
    /// Wrap an open guest API handle.
    pub fn new(api: G) -> Self {
        Self {
            api,
            prev: GuestCounters::default(),
        }
    }

    /// Access the underlying API handle.
    pub fn api(&self) -> &G {
        &self.api
    }
}

impl<G: GuestApi> crate::steal::StealTimeSource for GuestLibStealSource<G> {
    fn kind(&self) -> StealSourceKind {
        StealSourceKind::GuestLib
    }

    fn sample(&mut self) -> u64 {
        if let Err(e) = self.api.update_info() {
            warn!("Can't update stolen time from guestlib: {e}");
            return 0;
        }

        let stolen_ms = match self.api.cpu_stolen_ms() {
            Ok(ms) => ms,
            Err(e) => {
                warn!("Can't get stolen time from guestlib: {e}");
                return 0;
            }
        };

        // Only used for tracing, errors ignored
        let used_ms = self.api.cpu_used_ms().unwrap_or(0);
        let elapsed_ms = self.api.elapsed_ms().unwrap_or(0);

        trace!(
            "guestlib stats: stolen = {} ({}), used = {} ({}), elapsed = {} ({})",
            stolen_ms,
            stolen_ms.wrapping_sub(self.prev.stolen_ms),
            used_ms,
            used_ms.wrapping_sub(self.prev.used_ms),
            elapsed_ms,
            elapsed_ms.wrapping_sub(self.prev.elapsed_ms)
        );

        self.prev = GuestCounters {
            stolen_ms,
            used_ms,
            elapsed_ms,
        };

        stolen_ms.saturating_mul(NS_PER_MS)
    }
}

const GUESTLIB_SONAMES: &[&CStr] = &[c"libvmGuestLib.so.0", c"libvmGuestLib.so"];
const VMGUESTLIB_ERROR_SUCCESS: c_int = 0;

type Handle = *mut c_void;
type OpenHandleFn = unsafe extern "C" fn(*mut Handle) -> c_int;
type HandleFn = unsafe extern "C" fn(Handle) -> c_int;
type GetU64Fn = unsafe extern "C" fn(Handle, *mut u64) -> c_int;
type ErrorTextFn = unsafe extern "C" fn(c_int) -> *const c_char;

/// VMware guest library loaded with `dlopen`.
#[derive(Debug)]
pub struct VmGuestLib {
    lib: *mut c_void,
    handle: Handle,
    open_handle: OpenHandleFn,
    close_handle: HandleFn,
    update_info: HandleFn,
    get_cpu_stolen_ms: GetU64Fn,
    get_cpu_used_ms: GetU64Fn,
    get_elapsed_ms: GetU64Fn,
    get_error_text: ErrorTextFn,
}

impl VmGuestLib {
    /// Load the library and open a handle.
    ///
    /// # Errors
    ///
    /// Fails when the library is not installed, lacks a symbol, or the
    /// handle cannot be opened (not running under the hypervisor).
    #[allow(unsafe_code)]
    pub fn open() -> Result<Self, GuestLibError> {
        let lib = GUESTLIB_SONAMES
            .iter()
            // SAFETY: soname is a valid NUL-terminated string
            .map(|name| unsafe { libc::dlopen(name.as_ptr(), libc::RTLD_NOW) })
            .find(|lib| !lib.is_null())
            .ok_or_else(|| GuestLibError("libvmGuestLib not found".into()))?;

        // SAFETY: lib is a live handle returned by dlopen; every symbol is
        // cast to the signature documented by the vSphere Guest SDK.
        let loaded = unsafe { Self::resolve(lib) };
        let mut this = match loaded {
            Ok(this) => this,
            Err(e) => {
                // SAFETY: lib came from dlopen and has no other users
                unsafe { libc::dlclose(lib) };
                return Err(e);
            }
        };

        // SAFETY: open_handle writes a handle through a valid pointer
        let rc = unsafe { (this.open_handle)(&mut this.handle) };
        if rc != VMGUESTLIB_ERROR_SUCCESS {
            let text = this.error_text(rc);
            // Drop would close a handle we never got.
            this.handle = std::ptr::null_mut();
            return Err(GuestLibError(text));
        }

        debug!("Opened guestlib handle");
        Ok(this)
    }

    #[allow(unsafe_code)]
    unsafe fn resolve(lib: *mut c_void) -> Result<Self, GuestLibError> {
        Ok(Self {
            lib,
            handle: std::ptr::null_mut(),
            open_handle: std::mem::transmute::<*mut c_void, OpenHandleFn>(symbol(
                lib,
                c"VMGuestLib_OpenHandle",
            )?),
            close_handle: std::mem::transmute::<*mut c_void, HandleFn>(symbol(
                lib,
                c"VMGuestLib_CloseHandle",
            )?),
            update_info: std::mem::transmute::<*mut c_void, HandleFn>(symbol(
                lib,
                c"VMGuestLib_UpdateInfo",
            )?),
            get_cpu_stolen_ms: std::mem::transmute::<*mut c_void, GetU64Fn>(symbol(
                lib,
                c"VMGuestLib_GetCpuStolenMs",
            )?),
            get_cpu_used_ms: std::mem::transmute::<*mut c_void, GetU64Fn>(symbol(
                lib,
                c"VMGuestLib_GetCpuUsedMs",
            )?),
            get_elapsed_ms: std::mem::transmute::<*mut c_void, GetU64Fn>(symbol(
                lib,
                c"VMGuestLib_GetElapsedMs",
            )?),
            get_error_text: std::mem::transmute::<*mut c_void, ErrorTextFn>(symbol(
                lib,
                c"VMGuestLib_GetErrorText",
            )?),
        })
    }

    #[allow(unsafe_code)]
    fn error_text(&self, rc: c_int) -> String {
        // SAFETY: GetErrorText returns a static string or NULL
        let ptr = unsafe { (self.get_error_text)(rc) };
        if ptr.is_null() {
            return format!("guestlib error {rc}");
        }
        // SAFETY: non-null pointer to a static NUL-terminated string
        unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned()
    }

    #[allow(unsafe_code)]
    fn get_u64(&self, f: GetU64Fn) -> Result<u64, GuestLibError> {
        let mut value = 0u64;
        // SAFETY: handle is open and value is a valid out pointer
        let rc = unsafe { f(self.handle, &mut value) };
        if rc == VMGUESTLIB_ERROR_SUCCESS {
            Ok(value)
        } else {
            Err(GuestLibError(self.error_text(rc)))
        }
    }
}

impl GuestApi for VmGuestLib {
    #[allow(unsafe_code)]
    fn update_info(&mut self) -> Result<(), GuestLibError> {
        // SAFETY: handle is open for the lifetime of self
        let rc = unsafe { (self.update_info)(self.handle) };
        if rc == VMGUESTLIB_ERROR_SUCCESS {
            Ok(())
        } else {
            Err(GuestLibError(self.error_text(rc)))
        }
    }

    fn cpu_stolen_ms(&self) -> Result<u64, GuestLibError> {
        self.get_u64(self.get_cpu_stolen_ms)
    }

    fn cpu_used_ms(&self) -> Result<u64, GuestLibError> {
        self.get_u64(self.get_cpu_used_ms)
    }

    fn elapsed_ms(&self) -> Result<u64, GuestLibError> {
        self.get_u64(self.get_elapsed_ms)
    }
}

impl Drop for VmGuestLib {
    #[allow(unsafe_code)]
    fn drop(&mut self) {
        if !self.handle.is_null() {
            // SAFETY: handle was opened by VMGuestLib_OpenHandle
            let rc = unsafe { (self.close_handle)(self.handle) };
            if rc != VMGUESTLIB_ERROR_SUCCESS {
                debug!("Can't close guestlib handle: {}", self.error_text(rc));
            }
        }
        // SAFETY: lib came from dlopen; no function pointers outlive self
        unsafe { libc::dlclose(self.lib) };
    }
}

#[allow(unsafe_code)]
unsafe fn symbol(lib: *mut c_void, name: &CStr) -> Result<*mut c_void, GuestLibError> {
    let sym = libc::dlsym(lib, name.as_ptr());
    if sym.is_null() {
        Err(GuestLibError(format!(
            "missing symbol {}",
            name.to_string_lossy()
        )))
    } else {
        Ok(sym)
    }
}
