//! Kernel trace session over Event Tracing for Windows.
//!
//! Starts the kernel logger with the thread and context switch flags in
//! real-time mode, consumes it with raw QPC timestamps and reports the
//! session's buffer counters when stopped.

use std::ffi::c_void;
use std::mem::{offset_of, size_of};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use windows::core::{w, PCWSTR, PWSTR};
use windows::Win32::Foundation::{
    CloseHandle, BOOL, ERROR_ALREADY_EXISTS, ERROR_CANCELLED, ERROR_SUCCESS, HANDLE,
    INVALID_HANDLE_VALUE, LUID,
};
use windows::Win32::Security::{
    AdjustTokenPrivileges, LookupPrivilegeValueW, LUID_AND_ATTRIBUTES, SE_PRIVILEGE_ENABLED,
    TOKEN_ADJUST_PRIVILEGES, TOKEN_PRIVILEGES,
};
use windows::Win32::System::Diagnostics::Etw::{
    CloseTrace, ControlTraceW, OpenTraceW, ProcessTrace, StartTraceW, SystemTraceControlGuid,
    CONTROLTRACE_HANDLE, EVENT_RECORD, EVENT_TRACE_CONTROL_STOP, EVENT_TRACE_FLAG,
    EVENT_TRACE_FLAG_CSWITCH, EVENT_TRACE_FLAG_THREAD, EVENT_TRACE_LOGFILEW,
    EVENT_TRACE_PROPERTIES, EVENT_TRACE_REAL_TIME_MODE, EVENT_TRACE_SYSTEM_LOGGER_MODE,
    PROCESSTRACE_HANDLE, PROCESS_TRACE_MODE_EVENT_RECORD, PROCESS_TRACE_MODE_RAW_TIMESTAMP,
    PROCESS_TRACE_MODE_REAL_TIME, WNODE_FLAG_TRACED_GUID,
};
use windows::Win32::System::Performance::QueryPerformanceFrequency;
use windows::Win32::System::Threading::{GetCurrentProcess, OpenProcessToken};

use super::event::RawEvent;
use super::{EventHandler, EventPump, EventSource, SessionStats};
use crate::config::TraceConfig;

const KERNEL_LOGGER_NAME: &str = "NT Kernel Logger";

/// Session names longer than this are rejected.
const MAX_SESSION_NAME: usize = 1024;

/// `EVENT_TRACE_PROPERTIES` followed by room for the session name.
#[repr(C)]
struct TraceProperties {
    props: EVENT_TRACE_PROPERTIES,
    name: [u16; MAX_SESSION_NAME],
}

impl TraceProperties {
    /// Zeroed properties sized for the trailing name, as needed by
    /// `ControlTraceW` to report session counters.
    fn query() -> Box<Self> {
        let mut p = Box::new(Self {
            props: EVENT_TRACE_PROPERTIES::default(),
            name: [0; MAX_SESSION_NAME],
        });
        p.props.Wnode.BufferSize = size_of::<Self>() as u32;
        p.props.LoggerNameOffset = offset_of!(Self, name) as u32;
        p
    }

    fn start(config: &TraceConfig, kernel_logger: bool) -> Box<Self> {
        let mut p = Self::query();

        let mut flags = 0;
        if config.enable_thread_provider {
            flags |= EVENT_TRACE_FLAG_THREAD.0;
        }
        if config.enable_cswitch_provider {
            flags |= EVENT_TRACE_FLAG_CSWITCH.0;
        }

        p.props.Wnode.Flags = WNODE_FLAG_TRACED_GUID;
        // QPC clock resolution.
        p.props.Wnode.ClientContext = 1;
        p.props.BufferSize = config.buffer_kib;
        p.props.MinimumBuffers = config.min_buffers;
        p.props.MaximumBuffers = config.max_buffers;
        p.props.FlushTimer = config.flush_period.as_secs().clamp(1, u64::from(u32::MAX)) as u32;
        p.props.LogFileMode = EVENT_TRACE_REAL_TIME_MODE;
        p.props.EnableFlags = EVENT_TRACE_FLAG(flags);

        if kernel_logger {
            p.props.Wnode.Guid = SystemTraceControlGuid;
        } else {
            // Named kernel sessions need the system logger mode (Windows 8+).
            p.props.LogFileMode |= EVENT_TRACE_SYSTEM_LOGGER_MODE;
        }

        p
    }

    fn as_mut_ptr(&mut self) -> *mut EVENT_TRACE_PROPERTIES {
        &mut self.props
    }

    fn stats(&self) -> SessionStats {
        let p = &self.props;
        SessionStats {
            buffers_allocated: u64::from(p.NumberOfBuffers),
            buffers_free: u64::from(p.FreeBuffers),
            buffers_written: u64::from(p.BuffersWritten),
            buffers_lost: u64::from(p.LogBuffersLost) + u64::from(p.RealTimeBuffersLost),
            events_lost: u64::from(p.EventsLost),
            ..SessionStats::default()
        }
    }
}

fn wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

/// Kernel trace session driven through the NT Kernel Logger.
#[derive(Debug)]
pub struct EtwSource {
    active: Mutex<Option<ActiveSession>>,
    handled: Arc<AtomicU64>,
}

#[derive(Debug)]
struct ActiveSession {
    name: Vec<u16>,
    control: CONTROLTRACE_HANDLE,
}

impl EtwSource {
    pub fn new() -> Self {
        Self {
            active: Mutex::new(None),
            handled: Arc::new(AtomicU64::new(0)),
        }
    }
}

impl Default for EtwSource {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSource for EtwSource {
    fn tick_frequency(&self) -> Result<u64> {
        let mut frequency = 0i64;
        // SAFETY: `frequency` is a valid out pointer for the duration of the call.
        unsafe { QueryPerformanceFrequency(&mut frequency) }
            .context("QueryPerformanceFrequency")?;
        u64::try_from(frequency).context("negative performance counter frequency")
    }

    fn open(&self, config: &TraceConfig) -> Result<Box<dyn EventPump>> {
        if config.session_name.len() >= MAX_SESSION_NAME {
            bail!("session name longer than {MAX_SESSION_NAME} characters");
        }

        if let Err(e) = enable_profile_privilege() {
            debug!(error = %format!("{e:#}"), "could not enable SeSystemProfilePrivilege");
        }

        let kernel_logger = config.session_name == KERNEL_LOGGER_NAME;
        let mut name = wide(&config.session_name);
        let control = start_session(config, &name, kernel_logger)?;

        self.handled.store(0, Ordering::Relaxed);
        let mut slot = Box::new(CallbackSlot {
            handler: None,
            handled: Arc::clone(&self.handled),
        });

        let mut logfile = EVENT_TRACE_LOGFILEW {
            LoggerName: PWSTR(name.as_mut_ptr()),
            Context: (&mut *slot as *mut CallbackSlot).cast::<c_void>(),
            ..Default::default()
        };
        logfile.Anonymous1.ProcessTraceMode = PROCESS_TRACE_MODE_REAL_TIME
            | PROCESS_TRACE_MODE_EVENT_RECORD
            | PROCESS_TRACE_MODE_RAW_TIMESTAMP;
        logfile.Anonymous2.EventRecordCallback = Some(on_event_record);

        // SAFETY: `logfile` and the name it points at outlive the call.
        let trace = unsafe { OpenTraceW(&mut logfile) };
        if trace.Value == INVALID_HANDLE_VALUE.0 as usize as u64 {
            let err = windows::core::Error::from_win32();
            let _ = stop_session(control, &name);
            return Err(err).context("OpenTraceW");
        }

        *self.active.lock() = Some(ActiveSession { name, control });
        info!(
            session = %config.session_name,
            buffer_kib = config.buffer_kib,
            min_buffers = config.min_buffers,
            max_buffers = config.max_buffers,
            "kernel trace session started"
        );

        Ok(Box::new(EtwPump {
            trace: Some(trace),
            slot,
            close: close_trace,
        }))
    }

    fn stop(&self) -> Result<SessionStats> {
        let Some(active) = self.active.lock().take() else {
            bail!("kernel trace session is not running");
        };

        let mut stats = stop_session(active.control, &active.name)?;
        stats.events_handled = self.handled.load(Ordering::Relaxed);
        stats.events_total = stats.events_handled + stats.events_lost;
        Ok(stats)
    }
}

fn start_session(config: &TraceConfig, name: &[u16], kernel_logger: bool) -> Result<CONTROLTRACE_HANDLE> {
    let mut control = CONTROLTRACE_HANDLE::default();
    let mut props = TraceProperties::start(config, kernel_logger);

    // SAFETY: `props` is sized per `Wnode.BufferSize` and `name` is NUL terminated.
    let mut status = unsafe { StartTraceW(&mut control, PCWSTR(name.as_ptr()), props.as_mut_ptr()) };

    if status == ERROR_ALREADY_EXISTS {
        warn!(session = %config.session_name, "trace session already exists, restarting it");
        let _ = stop_session(CONTROLTRACE_HANDLE::default(), name);

        props = TraceProperties::start(config, kernel_logger);
        // SAFETY: as above.
        status = unsafe { StartTraceW(&mut control, PCWSTR(name.as_ptr()), props.as_mut_ptr()) };
    }

    status
        .ok()
        .with_context(|| format!("StartTraceW {}", config.session_name))?;

    Ok(control)
}

fn stop_session(control: CONTROLTRACE_HANDLE, name: &[u16]) -> Result<SessionStats> {
    let mut props = TraceProperties::query();

    // SAFETY: `props` is sized per `Wnode.BufferSize` and `name` is NUL terminated.
    unsafe {
        ControlTraceW(
            control,
            PCWSTR(name.as_ptr()),
            props.as_mut_ptr(),
            EVENT_TRACE_CONTROL_STOP,
        )
    }
    .ok()
    .context("ControlTraceW stop")?;

    Ok(props.stats())
}

fn enable_profile_privilege() -> Result<()> {
    let mut luid = LUID::default();
    // SAFETY: out pointers are valid for the duration of each call; the
    // token handle is closed before returning.
    unsafe {
        LookupPrivilegeValueW(PCWSTR::null(), w!("SeSystemProfilePrivilege"), &mut luid)
            .context("LookupPrivilegeValueW")?;

        let mut token = HANDLE::default();
        OpenProcessToken(GetCurrentProcess(), TOKEN_ADJUST_PRIVILEGES, &mut token)
            .context("OpenProcessToken")?;

        let privileges = TOKEN_PRIVILEGES {
            PrivilegeCount: 1,
            Privileges: [LUID_AND_ATTRIBUTES {
                Luid: luid,
                Attributes: SE_PRIVILEGE_ENABLED,
            }],
        };
        let adjusted = AdjustTokenPrivileges(
            token,
            BOOL::from(false),
            Some(&privileges as *const TOKEN_PRIVILEGES),
            0,
            None,
            None,
        );
        let _ = CloseHandle(token);
        adjusted.context("AdjustTokenPrivileges")
    }
}

/// Target of `EVENT_TRACE_LOGFILEW::Context`. The handler is only set
/// while `ProcessTrace` runs on the pump's thread.
struct CallbackSlot {
    handler: Option<*mut (dyn EventHandler + 'static)>,
    handled: Arc<AtomicU64>,
}

/// Owns the consumer handle from `OpenTraceW`. `run` closes it when
/// delivery ends; a pump dropped without running closes it on drop.
struct EtwPump {
    trace: Option<PROCESSTRACE_HANDLE>,
    slot: Box<CallbackSlot>,
    close: fn(PROCESSTRACE_HANDLE),
}

// SAFETY: the slot's handler pointer is only set and dereferenced on the
// thread that calls `run`; the trace handle may be used from any thread.
unsafe impl Send for EtwPump {}

impl EventPump for EtwPump {
    fn run(mut self: Box<Self>, handler: &mut dyn EventHandler) -> Result<()> {
        // SAFETY: the pointer is cleared below, after `ProcessTrace` returns
        // and no callback can observe it any more.
        let handler: *mut (dyn EventHandler + '_) = handler;
        let handler: *mut (dyn EventHandler + 'static) = unsafe { std::mem::transmute(handler) };
        let Some(trace) = self.trace.take() else {
            bail!("trace consumer handle already closed");
        };
        self.slot.handler = Some(handler);

        // SAFETY: the slot referenced by the trace context is boxed and lives
        // as long as `self`.
        let status = unsafe { ProcessTrace(&[trace], None, None) };
        self.slot.handler = None;

        (self.close)(trace);

        if status != ERROR_SUCCESS && status != ERROR_CANCELLED {
            status.ok().context("ProcessTrace")?;
        }

        Ok(())
    }
}

impl Drop for EtwPump {
    fn drop(&mut self) {
        if let Some(trace) = self.trace.take() {
            debug!("closing unused trace consumer handle");
            (self.close)(trace);
        }
    }
}

fn close_trace(trace: PROCESSTRACE_HANDLE) {
    // SAFETY: every handle reaching here came from a successful `OpenTraceW`
    // and is closed exactly once.
    let closed = unsafe { CloseTrace(trace) };
    if closed != ERROR_SUCCESS && closed != ERROR_CANCELLED {
        debug!(status = closed.0, "CloseTrace");
    }
}

unsafe extern "system" fn on_event_record(record: *mut EVENT_RECORD) {
    let Some(record) = record.as_ref() else {
        return;
    };
    let Some(slot) = record.UserContext.cast::<CallbackSlot>().as_ref() else {
        return;
    };
    let Some(handler) = slot.handler else {
        return;
    };

    let payload = if record.UserData.is_null() {
        &[][..]
    } else {
        std::slice::from_raw_parts(
            record.UserData.cast::<u8>(),
            usize::from(record.UserDataLength),
        )
    };

    let event = RawEvent {
        provider: record.EventHeader.ProviderId.to_u128(),
        opcode: record.EventHeader.EventDescriptor.Opcode,
        timestamp_ticks: record.EventHeader.TimeStamp as u64,
        cpu: record.BufferContext.Anonymous.ProcessorIndex,
        payload,
    };

    (*handler).on_event(&event);
    slot.handled.fetch_add(1, Ordering::Relaxed);
}
