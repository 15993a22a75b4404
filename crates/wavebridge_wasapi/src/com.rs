//! COM Initialization and Kernel Synchronization Objects
//!
//! RAII wrappers around the per-thread COM apartment and the kernel event
//! and waitable-timer handles the I/O loop multiplexes over.
//!
//! Every component thread (I/O loop, device manager, enumerator) joins the
//! multi-threaded apartment; WASAPI interfaces are agile across MTA threads
//! and each interface is released on the apartment that created it.

use crate::error::{WasapiError, WasapiResult};

use windows::Win32::Foundation::{CloseHandle, HANDLE, WAIT_OBJECT_0};
use windows::Win32::System::Com::{CoInitializeEx, CoUninitialize, COINIT_MULTITHREADED};
use windows::Win32::System::Performance::{QueryPerformanceCounter, QueryPerformanceFrequency};
use windows::Win32::System::Threading::{
    CancelWaitableTimer, CreateEventW, CreateWaitableTimerExW, CreateWaitableTimerW, SetEvent,
    SetWaitableTimer, WaitForSingleObject,
};

/// Defined for _WIN32_WINNT >= Windows 10 RS4; carried locally so the crate
/// builds against older SDK metadata
const CREATE_WAITABLE_TIMER_HIGH_RESOLUTION: u32 = 0x0000_0002;
const TIMER_ALL_ACCESS: u32 = 0x001F_0003;

/// RAII guard joining the current thread to the multi-threaded apartment
///
/// Not `Send`/`Sync`: the guard must drop on the thread that created it.
pub struct ComGuard {
    _not_send_sync: std::marker::PhantomData<*const ()>,
}

impl ComGuard {
    pub fn new() -> WasapiResult<ComGuard> {
        // SAFETY: balanced with CoUninitialize in Drop; S_FALSE (already
        // initialized) counts as success
        let hr = unsafe { CoInitializeEx(None, COINIT_MULTITHREADED) };
        if hr.is_err() {
            return Err(WasapiError::ComInit(format!("0x{:08x}", hr.0 as u32)));
        }

        tracing::trace!("COM initialized for {:?}", std::thread::current().id());

        Ok(ComGuard {
            _not_send_sync: std::marker::PhantomData,
        })
    }
}

impl Drop for ComGuard {
    fn drop(&mut self) {
        // SAFETY: paired with the CoInitializeEx in new()
        unsafe { CoUninitialize() };
        tracing::trace!("COM uninitialized for {:?}", std::thread::current().id());
    }
}

/// Owned kernel event
#[derive(Debug)]
pub struct Event {
    raw: HANDLE,
}

// SAFETY: kernel event handles are process-wide; signalling and waiting from
// any thread is the whole point of the object
unsafe impl Send for Event {}
unsafe impl Sync for Event {}

impl Event {
    /// Auto-reset event
    pub fn auto_reset() -> WasapiResult<Event> {
        Self::create(false)
    }

    /// Manual-reset event
    pub fn manual_reset() -> WasapiResult<Event> {
        Self::create(true)
    }

    fn create(manual: bool) -> WasapiResult<Event> {
        // SAFETY: plain event creation, handle owned by the wrapper
        let raw = unsafe { CreateEventW(None, manual, false, None) }
            .map_err(|e| WasapiError::api(e.code().0, "CreateEventW"))?;
        Ok(Event { raw })
    }

    pub fn raw(&self) -> HANDLE {
        self.raw
    }

    pub fn set(&self) {
        // SAFETY: valid owned handle
        unsafe {
            let _ = SetEvent(self.raw);
        }
    }

    /// Blocking wait; `true` when signalled before the timeout
    pub fn wait(&self, timeout_ms: u32) -> bool {
        // SAFETY: valid owned handle
        unsafe { WaitForSingleObject(self.raw, timeout_ms) == WAIT_OBJECT_0 }
    }
}

impl Drop for Event {
    fn drop(&mut self) {
        // SAFETY: owned handle, closed exactly once
        unsafe {
            let _ = CloseHandle(self.raw);
        }
    }
}

/// Owned waitable timer
pub struct WaitableTimer {
    raw: HANDLE,
}

// SAFETY: same process-wide handle argument as Event
unsafe impl Send for WaitableTimer {}
unsafe impl Sync for WaitableTimer {}

impl WaitableTimer {
    /// High-resolution timer, falling back to a default-resolution one on
    /// OS builds without CREATE_WAITABLE_TIMER_HIGH_RESOLUTION
    pub fn high_resolution() -> WasapiResult<WaitableTimer> {
        // SAFETY: flags are plain creation parameters
        let raw = unsafe {
            CreateWaitableTimerExW(
                None,
                None,
                CREATE_WAITABLE_TIMER_HIGH_RESOLUTION,
                TIMER_ALL_ACCESS,
            )
        };

        match raw {
            Ok(raw) => Ok(WaitableTimer { raw }),
            Err(_) => {
                tracing::warn!("High-resolution timer not available, using default");
                Self::default_resolution()
            }
        }
    }

    pub fn default_resolution() -> WasapiResult<WaitableTimer> {
        // SAFETY: plain timer creation
        let raw = unsafe { CreateWaitableTimerW(None, false, None) }
            .map_err(|e| WasapiError::api(e.code().0, "CreateWaitableTimerW"))?;
        Ok(WaitableTimer { raw })
    }

    pub fn raw(&self) -> HANDLE {
        self.raw
    }

    /// Arm with a relative due time (100 ns units) and a period (ms)
    pub fn set_periodic(&self, due_100ns: i64, period_ms: i32) -> WasapiResult<()> {
        let due = -due_100ns;
        // SAFETY: due time points at a live stack value for the call
        unsafe {
            SetWaitableTimer(self.raw, &due, period_ms, None, None, false)
                .map_err(|e| WasapiError::api(e.code().0, "SetWaitableTimer"))
        }
    }

    pub fn cancel(&self) {
        // SAFETY: valid owned handle
        unsafe {
            let _ = CancelWaitableTimer(self.raw);
        }
    }
}

impl Drop for WaitableTimer {
    fn drop(&mut self) {
        self.cancel();
        // SAFETY: owned handle, closed exactly once
        unsafe {
            let _ = CloseHandle(self.raw);
        }
    }
}

/// Performance-counter frequency in ticks per second
pub fn qpc_frequency() -> i64 {
    let mut freq = 0i64;
    // SAFETY: always succeeds on XP+
    unsafe {
        let _ = QueryPerformanceFrequency(&mut freq);
    }
    freq.max(1)
}

/// Current performance-counter value
pub fn qpc_now() -> i64 {
    let mut now = 0i64;
    // SAFETY: always succeeds on XP+
    unsafe {
        let _ = QueryPerformanceCounter(&mut now);
    }
    now
}
